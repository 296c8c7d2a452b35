//! Authentication providers
//!
//! Every identity source implements [`AuthProvider`]. `build_provider`
//! picks one from the configured `auth_type`; the composite type chains
//! the local table in front of the directory.

mod composite;
mod database;
mod directory;
#[cfg(feature = "ldap")]
mod ldap;
mod local;
mod password;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{AuthType, Config};
use crate::error::AuthError;
use crate::models::AuthedUser;

pub use composite::CompositeProvider;
pub use database::{DatabaseProvider, DATABASE_USER_TYPE};
pub use directory::{
    escape_filter_value, DirectoryProvider, DirectoryRecord, DirectorySource, DIRECTORY_USER_TYPE,
};
#[cfg(feature = "ldap")]
pub use ldap::LdapSource;
pub use local::{LocalProvider, LOCAL_USER_TYPE};
pub use password::{PasswordVerifier, SchemeVerifier};

pub type SharedAuthProvider = Arc<dyn AuthProvider>;

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn login(&self, account: &str, password: &str) -> Result<AuthedUser, AuthError>;

    async fn get_user(&self, account: &str) -> Result<AuthedUser, AuthError>;

    /// Every user the provider knows about, eagerly collected
    async fn list_users(&self) -> Result<Vec<AuthedUser>, AuthError>;
}

/// User type recorded for a login under `auth_type`; `None` under composite
/// auth, where the login form chooses it
pub fn fixed_user_type(auth_type: AuthType) -> Option<&'static str> {
    match auth_type {
        AuthType::Local => Some(LOCAL_USER_TYPE),
        AuthType::Ldap => Some(DIRECTORY_USER_TYPE),
        AuthType::Database => Some(DATABASE_USER_TYPE),
        AuthType::Composite => None,
    }
}

/// Provider for the configured `auth_type`
pub fn build_provider(config: &Config) -> Result<SharedAuthProvider, AuthError> {
    let provider: SharedAuthProvider = match config.auth_type {
        AuthType::Local => Arc::new(local_provider(config)),
        AuthType::Ldap => Arc::new(directory_provider(config)?),
        AuthType::Database => Arc::new(DatabaseProvider),
        AuthType::Composite => {
            let local: SharedAuthProvider = Arc::new(local_provider(config));
            let directory: SharedAuthProvider = Arc::new(directory_provider(config)?);
            Arc::new(CompositeProvider::new(("local", local), ("ldap", directory)))
        }
    };

    tracing::info!("Authentication provider: {:?}", config.auth_type);
    Ok(provider)
}

fn local_provider(config: &Config) -> LocalProvider {
    LocalProvider::new(config.users.local.clone(), Arc::new(SchemeVerifier))
}

#[cfg(feature = "ldap")]
fn directory_provider(config: &Config) -> Result<DirectoryProvider, AuthError> {
    if config.ldap.url.is_empty() {
        return Err(AuthError::Directory("ldap.url is required".to_string()));
    }
    let source = LdapSource::new(config.ldap.clone());
    Ok(DirectoryProvider::new(
        Arc::new(source),
        config.ldap.clone(),
        config.users.ldap.clone(),
    ))
}

#[cfg(not(feature = "ldap"))]
fn directory_provider(_config: &Config) -> Result<DirectoryProvider, AuthError> {
    Err(AuthError::Directory(
        "built without the ldap feature".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_local_and_database() {
        let mut config = Config::default();
        config.users.local = vec![crate::config::LocalUser {
            account: "alice".into(),
            password: "secret".into(),
            ..Default::default()
        }];

        let local = build_provider(&config).unwrap();
        assert_eq!(local.get_user("alice").await.unwrap().account, "alice");

        config.auth_type = AuthType::Database;
        let database = build_provider(&config).unwrap();
        assert_eq!(
            database.get_user("alice").await,
            Err(AuthError::NotImplemented)
        );
    }

    #[test]
    fn test_directory_requires_url() {
        let config = Config {
            auth_type: AuthType::Ldap,
            ..Default::default()
        };
        assert!(build_provider(&config).is_err());
    }
}
