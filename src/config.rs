use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use axum::http::{HeaderName, HeaderValue};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::models::{normalize_upstream, Backend, HeaderRewrite, Privilege};

/// Identity source selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    Local,
    Ldap,
    Database,
    /// Local first, directory as fallback
    #[serde(alias = "misc", alias = "ldap+local")]
    Composite,
}

impl FromStr for AuthType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(AuthType::Local),
            "ldap" => Ok(AuthType::Ldap),
            "database" => Ok(AuthType::Database),
            "composite" | "misc" | "ldap+local" => Ok(AuthType::Composite),
            other => Err(ConfigError::Invalid(format!(
                "invalid auth_type {other}: must be one of local|ldap|database|composite"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheDriver {
    #[default]
    Memory,
    Redis,
}

impl FromStr for CacheDriver {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(CacheDriver::Memory),
            "redis" => Ok(CacheDriver::Redis),
            other => Err(ConfigError::Invalid(format!(
                "invalid cache driver {other}: must be memory|redis"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Base64, at least 32 bytes once decoded
    pub hash_key: String,
    /// Base64, exactly 32 bytes once decoded (AES-256)
    pub block_key: String,
    pub cookie_name: String,
    pub cookie_domain: Option<String>,
    /// Seconds
    pub max_age: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            hash_key: String::new(),
            block_key: String::new(),
            cookie_name: "secure-proxy-auth".to_string(),
            cookie_domain: None,
            max_age: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LdapConfig {
    pub url: String,
    pub base_dn: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub display_name: String,
    pub uid: String,
    pub user_filter: String,
    /// Attribute listing group DNs (e.g. `memberOf`); CN values become groups
    pub group_attribute: Option<String>,
}

impl Default for LdapConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            base_dn: String::new(),
            username: String::new(),
            password: String::new(),
            display_name: "displayName".to_string(),
            uid: "sAMAccountName".to_string(),
            user_filter: "(objectClass=person)".to_string(),
            group_attribute: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub driver: CacheDriver,
    pub redis_url: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            driver: CacheDriver::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

/// Locally defined user
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalUser {
    pub account: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub password: String,
    /// Password scheme: plain (or empty), base64, bcrypt
    pub algo: String,
    pub group: String,
    pub groups: Vec<String>,
    pub disabled: bool,
}

impl LocalUser {
    pub fn user_groups(&self) -> BTreeSet<String> {
        merge_groups(&self.group, &self.groups)
    }
}

/// Group assignment for a directory account
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryUser {
    pub account: String,
    pub group: String,
    pub groups: Vec<String>,
}

impl DirectoryUser {
    pub fn user_groups(&self) -> BTreeSet<String> {
        merge_groups(&self.group, &self.groups)
    }
}

fn merge_groups(group: &str, groups: &[String]) -> BTreeSet<String> {
    groups
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(group))
        .filter(|g| !g.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Users {
    /// Stripped from typed usernames (e.g. "@example.com")
    pub ignore_account_suffix: String,
    pub local: Vec<LocalUser>,
    pub ldap: Vec<DirectoryUser>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeaderRule {
    pub key: String,
    /// Empty value deletes the header
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    pub host: String,
    pub upstream: String,
    #[serde(default)]
    pub privilege: Privilege,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub headers: Vec<HeaderRule>,
}

impl BackendConfig {
    pub fn to_backend(&self) -> Result<Backend, ConfigError> {
        if self.host.is_empty() || self.upstream.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "host and upstream are required for {}:{}",
                self.host, self.upstream
            )));
        }

        let upstream = Url::parse(&normalize_upstream(&self.upstream)).map_err(|e| {
            ConfigError::Invalid(format!("invalid upstream for {}: {}", self.host, e))
        })?;

        let header_rewrites = self
            .headers
            .iter()
            .map(|rule| {
                let name = HeaderName::from_bytes(rule.key.as_bytes()).map_err(|_| {
                    ConfigError::Invalid(format!(
                        "invalid header name {} for {}",
                        rule.key, self.host
                    ))
                })?;
                let value = if rule.value.is_empty() {
                    None
                } else {
                    Some(HeaderValue::from_str(&rule.value).map_err(|_| {
                        ConfigError::Invalid(format!(
                            "invalid header value for {} on {}",
                            rule.key, self.host
                        ))
                    })?)
                };
                Ok(HeaderRewrite { name, value })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Backend {
            host: self.host.clone(),
            upstream,
            privilege: self.privilege,
            groups: self.groups.iter().cloned().collect(),
            users: self.users.iter().cloned().collect(),
            header_rewrites,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub verbose: bool,
    pub listen: String,
    pub auth_type: AuthType,
    pub client_ip_header: Option<String>,
    pub request_timeout_secs: u64,
    pub assets_dir: PathBuf,
    pub login_rate_per_minute: u32,
    pub users: Users,
    pub backends: Vec<BackendConfig>,
    pub session: SessionConfig,
    pub ldap: LdapConfig,
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            verbose: false,
            listen: "0.0.0.0:8080".to_string(),
            auth_type: AuthType::Local,
            client_ip_header: None,
            request_timeout_secs: 60,
            assets_dir: PathBuf::from("assets"),
            login_rate_per_minute: 60,
            users: Users::default(),
            backends: Vec::new(),
            session: SessionConfig::default(),
            ldap: LdapConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Config {
    /// Defaults plus environment overrides, not validated
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Read a JSON config file, apply environment overrides, validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let mut config: Config = serde_json::from_str(&data)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = lookup("SECURE_PROXY_LISTEN") {
            self.listen = listen;
        }

        if let Some(auth_type) = lookup("SECURE_PROXY_AUTH_TYPE") {
            match auth_type.parse() {
                Ok(t) => self.auth_type = t,
                Err(e) => tracing::warn!("ignoring SECURE_PROXY_AUTH_TYPE: {}", e),
            }
        }

        if let Some(key) = lookup("SECURE_PROXY_HASH_KEY") {
            self.session.hash_key = key;
        }

        if let Some(key) = lookup("SECURE_PROXY_BLOCK_KEY") {
            self.session.block_key = key;
        }

        if let Some(domain) = lookup("SECURE_PROXY_COOKIE_DOMAIN") {
            self.session.cookie_domain = Some(domain).filter(|d| !d.is_empty());
        }

        if let Some(driver) = lookup("SECURE_PROXY_CACHE_DRIVER") {
            match driver.parse() {
                Ok(d) => self.cache.driver = d,
                Err(e) => tracing::warn!("ignoring SECURE_PROXY_CACHE_DRIVER: {}", e),
            }
        }

        if let Some(url) = lookup("SECURE_PROXY_REDIS_URL") {
            self.cache.redis_url = url;
        }

        if let Some(header) = lookup("SECURE_PROXY_CLIENT_IP_HEADER") {
            self.client_ip_header = Some(header).filter(|h| !h.is_empty());
        }

        if let Some(verbose) = lookup("SECURE_PROXY_VERBOSE") {
            self.verbose = matches!(verbose.to_lowercase().as_str(), "1" | "true" | "yes");
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.hash_key()?;
        self.block_key()?;

        if self.session.max_age < 0 {
            return Err(ConfigError::Invalid(
                "session.max_age must not be negative".to_string(),
            ));
        }

        if let Some(header) = &self.client_ip_header {
            HeaderName::from_bytes(header.as_bytes()).map_err(|_| {
                ConfigError::Invalid(format!("invalid client_ip_header {header}"))
            })?;
        }

        self.backend_table()?;

        Ok(())
    }

    pub fn hash_key(&self) -> Result<Vec<u8>, ConfigError> {
        let key = decode_key("session.hash_key", &self.session.hash_key)?;
        if key.len() < 32 {
            return Err(ConfigError::Invalid(
                "session.hash_key must decode to at least 32 bytes".to_string(),
            ));
        }
        Ok(key)
    }

    pub fn block_key(&self) -> Result<[u8; 32], ConfigError> {
        let key = decode_key("session.block_key", &self.session.block_key)?;
        key.try_into().map_err(|_| {
            ConfigError::Invalid("session.block_key must decode to exactly 32 bytes".to_string())
        })
    }

    /// Host -> backend lookup table; duplicate hosts are rejected
    pub fn backend_table(&self) -> Result<HashMap<String, Backend>, ConfigError> {
        let mut table = HashMap::with_capacity(self.backends.len());
        for cfg in &self.backends {
            let backend = cfg.to_backend()?;
            if table.contains_key(&backend.host) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate backend host {}",
                    backend.host
                )));
            }
            table.insert(backend.host.clone(), backend);
        }
        Ok(table)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn client_ip_header_name(&self) -> Option<HeaderName> {
        self.client_ip_header
            .as_deref()
            .and_then(|h| HeaderName::from_bytes(h.as_bytes()).ok())
    }
}

fn decode_key(field: &str, value: &str) -> Result<Vec<u8>, ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::Invalid(format!("{field} is required")));
    }
    STANDARD
        .decode(value.trim())
        .map_err(|_| ConfigError::Invalid(format!("{field} must be a base64 encoded string")))
}
