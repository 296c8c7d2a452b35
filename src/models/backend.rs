//! Backend table entries and the privilege decision

use std::collections::BTreeSet;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use super::UserAuthInfo;

/// Access mode of a backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privilege {
    /// Any authenticated user
    #[default]
    Internal,
    /// Only users/groups on the allow-list
    Private,
}

impl std::fmt::Display for Privilege {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Privilege::Internal => write!(f, "internal"),
            Privilege::Private => write!(f, "private"),
        }
    }
}

/// Rewrite rule for an outbound header. `None` deletes the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRewrite {
    pub name: HeaderName,
    pub value: Option<HeaderValue>,
}

impl HeaderRewrite {
    pub fn apply(&self, headers: &mut HeaderMap) {
        match &self.value {
            Some(value) => {
                headers.insert(self.name.clone(), value.clone());
            }
            None => {
                headers.remove(&self.name);
            }
        }
    }
}

/// A service reachable only through the gateway, addressed by Host
#[derive(Debug, Clone)]
pub struct Backend {
    pub host: String,
    pub upstream: Url,
    pub privilege: Privilege,
    pub groups: BTreeSet<String>,
    pub users: BTreeSet<String>,
    pub header_rewrites: Vec<HeaderRewrite>,
}

impl Backend {
    pub fn has_privilege(&self, user: &UserAuthInfo) -> bool {
        if self.privilege == Privilege::Internal {
            return true;
        }

        if self.users.contains(&user.account) {
            return true;
        }

        user.groups
            .iter()
            .filter(|g| !g.is_empty())
            .any(|g| self.groups.contains(g))
    }

    /// Apply rewrite rules in declaration order
    pub fn apply_header_rewrites(&self, headers: &mut HeaderMap) {
        for rule in &self.header_rewrites {
            rule.apply(headers);
        }
    }
}

/// Upstreams may be configured without a scheme; plain HTTP is assumed
pub fn normalize_upstream(raw: &str) -> String {
    if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("http://{}", raw)
    }
}
