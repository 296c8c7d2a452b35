use base64::{engine::general_purpose::STANDARD, Engine as _};

/// Checks a candidate password against the stored form for a scheme tag
pub trait PasswordVerifier: Send + Sync {
    fn verify(&self, stored: &str, candidate: &str, algo: &str) -> bool;
}

/// Supported schemes: `plain` (or no tag), `base64`, `bcrypt`.
/// Unknown tags never verify.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemeVerifier;

impl PasswordVerifier for SchemeVerifier {
    fn verify(&self, stored: &str, candidate: &str, algo: &str) -> bool {
        match algo.to_ascii_lowercase().as_str() {
            "" | "plain" => constant_time_eq(stored.as_bytes(), candidate.as_bytes()),
            "base64" => STANDARD
                .decode(stored.trim())
                .map(|decoded| constant_time_eq(&decoded, candidate.as_bytes()))
                .unwrap_or(false),
            "bcrypt" => bcrypt::verify(candidate, stored).unwrap_or(false),
            other => {
                tracing::warn!("Unknown password algorithm {}", other);
                false
            }
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
