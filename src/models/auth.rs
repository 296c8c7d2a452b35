//! Authentication-related models

use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identity resolved by an authentication provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthedUser {
    /// Provider that resolved the user ("local", "ldap", ...)
    #[serde(rename = "type")]
    pub user_type: String,
    pub uuid: String,
    pub name: String,
    pub account: String,
    pub groups: BTreeSet<String>,
    /// 1 = enabled, 0 = disabled
    pub status: i8,
}

/// Session payload carried inside the signed cookie
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserAuthInfo {
    pub user_type: String,
    /// Name typed on the login form (after suffix stripping)
    pub username: String,
    pub account: String,
    pub uuid: String,
    pub name: String,
    pub groups: BTreeSet<String>,
    pub login_host: String,
    pub created_at: DateTime<Utc>,
}

impl UserAuthInfo {
    pub fn from_authed_user(
        user: AuthedUser,
        username: impl Into<String>,
        login_host: impl Into<String>,
    ) -> Self {
        Self {
            user_type: user.user_type,
            username: username.into(),
            account: user.account,
            uuid: user.uuid,
            name: user.name,
            groups: user.groups,
            login_host: login_host.into(),
            created_at: Utc::now(),
        }
    }

    /// Cache key identifying this session (not a security boundary)
    pub fn id(&self) -> String {
        let created_at = self.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true);
        let mut hasher = Sha256::new();
        for part in [
            self.user_type.as_str(),
            self.account.as_str(),
            self.uuid.as_str(),
            created_at.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }

    /// A logged-out (all-empty) record decodes fine but is never authenticated
    pub fn is_authenticated(&self) -> bool {
        !self.account.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> UserAuthInfo {
        UserAuthInfo {
            user_type: "local".into(),
            username: "alice".into(),
            account: "alice".into(),
            uuid: "4f1c".into(),
            name: "Alice".into(),
            groups: ["admin".to_string()].into_iter().collect(),
            login_host: "kibana.example.com".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_id_is_stable() {
        let info = sample();
        assert_eq!(info.id(), info.clone().id());
        assert_eq!(info.id().len(), 64);
    }

    #[test]
    fn test_id_changes_with_login_time() {
        let info = sample();
        let mut later = info.clone();
        later.created_at = info.created_at + chrono::Duration::seconds(1);
        assert_ne!(info.id(), later.id());
    }

    #[test]
    fn test_id_ignores_display_fields() {
        let info = sample();
        let mut renamed = info.clone();
        renamed.name = "Alice Liddell".into();
        renamed.login_host = "grafana.example.com".into();
        assert_eq!(info.id(), renamed.id());
    }

    #[test]
    fn test_empty_record_is_not_authenticated() {
        assert!(!UserAuthInfo::default().is_authenticated());
        assert!(sample().is_authenticated());
    }

    #[test]
    fn test_from_authed_user() {
        let user = AuthedUser {
            user_type: "ldap".into(),
            uuid: "u-1".into(),
            name: "Bob".into(),
            account: "bob".into(),
            groups: ["devops".to_string()].into_iter().collect(),
            status: 1,
        };
        let info = UserAuthInfo::from_authed_user(user, "bob", "consul.example.com");
        assert_eq!(info.user_type, "ldap");
        assert_eq!(info.account, "bob");
        assert_eq!(info.login_host, "consul.example.com");
        assert!(info.groups.contains("devops"));
    }
}
