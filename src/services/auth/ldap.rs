use async_trait::async_trait;
use ldap3::{Ldap, LdapConnAsync, LdapError, Scope, SearchEntry};

use super::{DirectoryRecord, DirectorySource};
use crate::config::LdapConfig;
use crate::error::AuthError;

/// LDAP result code for rejected credentials
const INVALID_CREDENTIALS: u32 = 49;

/// [`DirectorySource`] backed by an LDAP server. A fresh connection is
/// opened per operation; searches bind with the service account.
pub struct LdapSource {
    config: LdapConfig,
}

impl LdapSource {
    pub fn new(config: LdapConfig) -> Self {
        Self { config }
    }

    async fn connect(&self) -> Result<Ldap, AuthError> {
        let (conn, ldap) = LdapConnAsync::new(&self.config.url)
            .await
            .map_err(directory_error)?;
        ldap3::drive!(conn);
        Ok(ldap)
    }

    fn attributes(&self) -> Vec<String> {
        let mut attrs = vec![
            self.config.uid.clone(),
            self.config.display_name.clone(),
            "userAccountControl".to_string(),
        ];
        if let Some(group_attribute) = &self.config.group_attribute {
            attrs.push(group_attribute.clone());
        }
        attrs
    }
}

fn directory_error(err: LdapError) -> AuthError {
    AuthError::Directory(err.to_string())
}

#[async_trait]
impl DirectorySource for LdapSource {
    async fn bind(&self, dn: &str, password: &str) -> Result<(), AuthError> {
        let mut ldap = self.connect().await?;
        let result = ldap
            .simple_bind(dn, password)
            .await
            .map_err(directory_error)?;
        let _ = ldap.unbind().await;

        match result.rc {
            0 => Ok(()),
            INVALID_CREDENTIALS => Err(AuthError::InvalidPassword),
            rc => Err(AuthError::Directory(format!(
                "bind failed with code {}: {}",
                rc, result.text
            ))),
        }
    }

    async fn search(&self, filter: &str) -> Result<Vec<DirectoryRecord>, AuthError> {
        let mut ldap = self.connect().await?;
        ldap.simple_bind(&self.config.username, &self.config.password)
            .await
            .and_then(|r| r.success())
            .map_err(directory_error)?;

        let (entries, _) = ldap
            .search(&self.config.base_dn, Scope::Subtree, filter, self.attributes())
            .await
            .and_then(|r| r.success())
            .map_err(directory_error)?;
        let _ = ldap.unbind().await;

        tracing::debug!("LDAP search {} returned {} entries", filter, entries.len());

        Ok(entries
            .into_iter()
            .map(SearchEntry::construct)
            .map(|entry| DirectoryRecord {
                dn: entry.dn,
                attributes: entry.attrs,
            })
            .collect())
    }
}
