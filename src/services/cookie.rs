//! Session cookie codec.
//!
//! The identity record is serialized to JSON, encrypted with AES-256-GCM
//! under the block key, then authenticated with HMAC-SHA256 under the hash
//! key together with the cookie name and the issue timestamp:
//!
//! ```text
//! token = base64url( ts "|" base64url(nonce || ciphertext) "|" mac )
//! mac   = HMAC(hash_key, name "|" ts "|" base64url(nonce || ciphertext))
//! ```

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use axum::http::{header, HeaderMap, HeaderValue};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::CookieError;
use crate::models::UserAuthInfo;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct CookieManager {
    name: String,
    domain: Option<String>,
    max_age: i64,
    hash_key: Vec<u8>,
    block_key: [u8; 32],
}

impl std::fmt::Debug for CookieManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieManager")
            .field("name", &self.name)
            .field("domain", &self.domain)
            .field("max_age", &self.max_age)
            .finish_non_exhaustive()
    }
}

impl CookieManager {
    pub fn new(
        name: impl Into<String>,
        domain: Option<String>,
        max_age: i64,
        hash_key: Vec<u8>,
        block_key: [u8; 32],
    ) -> Self {
        Self {
            name: name.into(),
            domain,
            max_age,
            hash_key,
            block_key,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn mac(&self, ts: &str, ciphertext: &str) -> Result<HmacSha256, CookieError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.hash_key)
            .map_err(|e| CookieError::Encoding(e.to_string()))?;
        mac.update(self.name.as_bytes());
        mac.update(b"|");
        mac.update(ts.as_bytes());
        mac.update(b"|");
        mac.update(ciphertext.as_bytes());
        Ok(mac)
    }

    pub fn encode(&self, info: &UserAuthInfo) -> Result<String, CookieError> {
        let plaintext =
            serde_json::to_vec(info).map_err(|e| CookieError::Encoding(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.block_key));
        let encrypted = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
            .map_err(|e| CookieError::Encoding(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + encrypted.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&encrypted);
        let ciphertext = URL_SAFE_NO_PAD.encode(sealed);

        let ts = Utc::now().timestamp().to_string();
        let tag = self.mac(&ts, &ciphertext)?.finalize().into_bytes();

        let mut token = Vec::with_capacity(ts.len() + ciphertext.len() + tag.len() + 2);
        token.extend_from_slice(ts.as_bytes());
        token.push(b'|');
        token.extend_from_slice(ciphertext.as_bytes());
        token.push(b'|');
        token.extend_from_slice(&tag);

        Ok(URL_SAFE_NO_PAD.encode(token))
    }

    pub fn decode(&self, token: &str) -> Result<UserAuthInfo, CookieError> {
        let raw = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| CookieError::InvalidToken)?;

        let mut parts = raw.splitn(3, |b| *b == b'|');
        let (Some(ts), Some(ciphertext), Some(tag)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(CookieError::InvalidToken);
        };
        let ts = std::str::from_utf8(ts).map_err(|_| CookieError::InvalidToken)?;
        let ciphertext = std::str::from_utf8(ciphertext).map_err(|_| CookieError::InvalidToken)?;

        // constant-time comparison
        self.mac(ts, ciphertext)
            .map_err(|_| CookieError::InvalidToken)?
            .verify_slice(tag)
            .map_err(|_| CookieError::InvalidToken)?;

        let issued_at: i64 = ts.parse().map_err(|_| CookieError::InvalidToken)?;
        if self.max_age > 0 && issued_at < Utc::now().timestamp() - self.max_age {
            return Err(CookieError::InvalidToken);
        }

        let sealed = URL_SAFE_NO_PAD
            .decode(ciphertext)
            .map_err(|_| CookieError::InvalidToken)?;
        if sealed.len() <= NONCE_LEN {
            return Err(CookieError::InvalidToken);
        }
        let (nonce, encrypted) = sealed.split_at(NONCE_LEN);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.block_key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), encrypted)
            .map_err(|_| CookieError::InvalidToken)?;

        serde_json::from_slice(&plaintext).map_err(|_| CookieError::InvalidToken)
    }

    /// Raw session token from the request's `Cookie` headers
    pub fn token_from_headers<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == self.name)
            .map(|(_, value)| value.trim_matches('"'))
            .filter(|value| !value.is_empty())
    }

    /// Decode the session cookie; a missing cookie is an invalid token
    pub fn session_from_headers(&self, headers: &HeaderMap) -> Result<UserAuthInfo, CookieError> {
        let token = self
            .token_from_headers(headers)
            .ok_or(CookieError::InvalidToken)?;
        self.decode(token)
    }

    /// `Set-Cookie` value carrying the encoded session
    pub fn set_cookie_header(&self, info: &UserAuthInfo) -> Result<HeaderValue, CookieError> {
        let token = self.encode(info)?;
        // max_age 0 leaves a browser-session cookie
        self.build_header(&token, Some(self.max_age).filter(|age| *age > 0))
    }

    /// `Set-Cookie` value that removes the session from the browser
    pub fn clear_cookie_header(&self) -> Result<HeaderValue, CookieError> {
        self.build_header("", Some(0))
    }

    fn build_header(&self, value: &str, max_age: Option<i64>) -> Result<HeaderValue, CookieError> {
        let mut cookie = format!("{}={}; Path=/", self.name, value);
        if let Some(domain) = &self.domain {
            cookie.push_str(&format!("; Domain={domain}"));
        }
        if let Some(max_age) = max_age {
            cookie.push_str(&format!("; Max-Age={max_age}"));
        }
        cookie.push_str("; HttpOnly");

        HeaderValue::from_str(&cookie).map_err(|e| CookieError::Encoding(e.to_string()))
    }
}
