use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::AuthProvider;
use crate::config::{DirectoryUser, LdapConfig};
use crate::error::AuthError;
use crate::models::AuthedUser;

pub const DIRECTORY_USER_TYPE: &str = "ldap";

/// Active Directory ACCOUNTDISABLE flag
const UAC_ACCOUNT_DISABLED: u32 = 0x2;

/// Entry returned by a directory search
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryRecord {
    pub dn: String,
    pub attributes: HashMap<String, Vec<String>>,
}

impl DirectoryRecord {
    /// Attribute values, matching the name case-insensitively
    pub fn values(&self, name: &str) -> &[String] {
        self.attributes
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
            .unwrap_or_default()
    }

    pub fn first(&self, name: &str) -> Option<&str> {
        self.values(name)
            .first()
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    fn is_disabled(&self) -> bool {
        self.first("userAccountControl")
            .and_then(|v| v.parse::<u32>().ok())
            .is_some_and(|flags| flags & UAC_ACCOUNT_DISABLED != 0)
    }
}

/// Directory-service capability used by [`DirectoryProvider`]
#[async_trait]
pub trait DirectorySource: Send + Sync {
    /// Bind as `dn`; bad credentials fail with `InvalidPassword`
    async fn bind(&self, dn: &str, password: &str) -> Result<(), AuthError>;

    async fn search(&self, filter: &str) -> Result<Vec<DirectoryRecord>, AuthError>;
}

/// Escape a value for use inside an LDAP search filter (RFC 4515)
pub fn escape_filter_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\5c"),
            '*' => escaped.push_str("\\2a"),
            '(' => escaped.push_str("\\28"),
            ')' => escaped.push_str("\\29"),
            '\0' => escaped.push_str("\\00"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// `CN` of a distinguished name, e.g. `CN=Ops,OU=Groups,DC=example,DC=com` -> `Ops`
fn common_name(dn: &str) -> Option<&str> {
    dn.split(',')
        .filter_map(|rdn| rdn.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("cn"))
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
}

pub struct DirectoryProvider {
    source: Arc<dyn DirectorySource>,
    config: LdapConfig,
    users: Vec<DirectoryUser>,
}

impl DirectoryProvider {
    pub fn new(
        source: Arc<dyn DirectorySource>,
        config: LdapConfig,
        users: Vec<DirectoryUser>,
    ) -> Self {
        Self {
            source,
            config,
            users,
        }
    }

    fn filter_for(&self, account: &str) -> String {
        format!(
            "(&{}({}={}))",
            self.config.user_filter,
            self.config.uid,
            escape_filter_value(account)
        )
    }

    async fn find(&self, account: &str) -> Result<DirectoryRecord, AuthError> {
        self.source
            .search(&self.filter_for(account))
            .await?
            .into_iter()
            .next()
            .ok_or(AuthError::NoSuchUser)
    }

    fn groups_for(&self, account: &str, record: &DirectoryRecord) -> BTreeSet<String> {
        let mut groups: BTreeSet<String> = self
            .users
            .iter()
            .filter(|u| u.account.eq_ignore_ascii_case(account))
            .flat_map(DirectoryUser::user_groups)
            .collect();

        if let Some(attribute) = &self.config.group_attribute {
            groups.extend(
                record
                    .values(attribute)
                    .iter()
                    .filter_map(|dn| common_name(dn))
                    .map(str::to_string),
            );
        }

        groups
    }

    fn to_authed_user(&self, account: &str, record: &DirectoryRecord) -> AuthedUser {
        let account = record.first(&self.config.uid).unwrap_or(account).to_string();
        AuthedUser {
            user_type: DIRECTORY_USER_TYPE.to_string(),
            uuid: Uuid::new_v5(&Uuid::NAMESPACE_X500, record.dn.as_bytes()).to_string(),
            name: record
                .first(&self.config.display_name)
                .unwrap_or(&account)
                .to_string(),
            groups: self.groups_for(&account, record),
            status: if record.is_disabled() { 0 } else { 1 },
            account,
        }
    }
}

#[async_trait]
impl AuthProvider for DirectoryProvider {
    async fn login(&self, account: &str, password: &str) -> Result<AuthedUser, AuthError> {
        // an empty password would be an unauthenticated bind, which succeeds
        if password.is_empty() {
            return Err(AuthError::InvalidPassword);
        }

        let record = self.find(account).await?;
        self.source.bind(&record.dn, password).await?;

        if record.is_disabled() {
            return Err(AuthError::AccountDisabled);
        }

        Ok(self.to_authed_user(account, &record))
    }

    async fn get_user(&self, account: &str) -> Result<AuthedUser, AuthError> {
        let record = self.find(account).await?;
        if record.is_disabled() {
            return Err(AuthError::AccountDisabled);
        }
        Ok(self.to_authed_user(account, &record))
    }

    async fn list_users(&self) -> Result<Vec<AuthedUser>, AuthError> {
        let filter = format!("(&{}({}=*))", self.config.user_filter, self.config.uid);
        let records = self.source.search(&filter).await?;
        Ok(records
            .iter()
            .map(|record| self.to_authed_user("", record))
            .filter(|user| !user.account.is_empty())
            .collect())
    }
}
