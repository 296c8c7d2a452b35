use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::{AuthProvider, PasswordVerifier};
use crate::config::LocalUser;
use crate::error::AuthError;
use crate::models::AuthedUser;

pub const LOCAL_USER_TYPE: &str = "local";

/// Users declared in the configuration file
pub struct LocalProvider {
    users: Vec<LocalUser>,
    verifier: Arc<dyn PasswordVerifier>,
}

impl LocalProvider {
    pub fn new(users: Vec<LocalUser>, verifier: Arc<dyn PasswordVerifier>) -> Self {
        Self { users, verifier }
    }

    fn find(&self, account: &str) -> Result<&LocalUser, AuthError> {
        self.users
            .iter()
            .find(|u| u.account == account)
            .ok_or(AuthError::NoSuchUser)
    }

    fn to_authed_user(user: &LocalUser) -> AuthedUser {
        AuthedUser {
            user_type: LOCAL_USER_TYPE.to_string(),
            uuid: Uuid::new_v5(&Uuid::NAMESPACE_OID, user.account.as_bytes()).to_string(),
            name: if user.name.is_empty() {
                user.account.clone()
            } else {
                user.name.clone()
            },
            account: user.account.clone(),
            groups: user.user_groups(),
            status: if user.disabled { 0 } else { 1 },
        }
    }
}

#[async_trait]
impl AuthProvider for LocalProvider {
    async fn login(&self, account: &str, password: &str) -> Result<AuthedUser, AuthError> {
        let user = self.find(account)?;

        // bcrypt is CPU bound
        let verifier = self.verifier.clone();
        let stored = user.password.clone();
        let algo = user.algo.clone();
        let candidate = password.to_string();
        let verified =
            tokio::task::spawn_blocking(move || verifier.verify(&stored, &candidate, &algo))
                .await
                .unwrap_or_else(|e| {
                    tracing::error!("Password verification task failed: {}", e);
                    false
                });

        if !verified {
            return Err(AuthError::InvalidPassword);
        }
        if user.disabled {
            return Err(AuthError::AccountDisabled);
        }

        Ok(Self::to_authed_user(user))
    }

    async fn get_user(&self, account: &str) -> Result<AuthedUser, AuthError> {
        let user = self.find(account)?;
        if user.disabled {
            return Err(AuthError::AccountDisabled);
        }
        Ok(Self::to_authed_user(user))
    }

    async fn list_users(&self) -> Result<Vec<AuthedUser>, AuthError> {
        Ok(self.users.iter().map(Self::to_authed_user).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::auth::SchemeVerifier;

    fn provider() -> LocalProvider {
        LocalProvider::new(
            vec![
                LocalUser {
                    account: "alice".into(),
                    name: "Alice".into(),
                    password: "secret".into(),
                    group: "admin".into(),
                    groups: vec!["admin".into(), "ops".into()],
                    ..Default::default()
                },
                LocalUser {
                    account: "bob".into(),
                    password: "c2VjcmV0".into(),
                    algo: "base64".into(),
                    ..Default::default()
                },
                LocalUser {
                    account: "mallory".into(),
                    password: "secret".into(),
                    disabled: true,
                    ..Default::default()
                },
            ],
            Arc::new(SchemeVerifier),
        )
    }

    #[tokio::test]
    async fn test_login() {
        let p = provider();
        let alice = p.login("alice", "secret").await.unwrap();
        assert_eq!(alice.user_type, "local");
        assert_eq!(alice.name, "Alice");
        assert_eq!(alice.status, 1);
        assert_eq!(alice.groups.len(), 2);

        let bob = p.login("bob", "secret").await.unwrap();
        assert_eq!(bob.name, "bob");
        assert!(bob.groups.is_empty());
    }

    #[tokio::test]
    async fn test_login_failures() {
        let p = provider();
        assert_eq!(p.login("alice", "nope").await, Err(AuthError::InvalidPassword));
        assert_eq!(p.login("carol", "secret").await, Err(AuthError::NoSuchUser));
        assert_eq!(
            p.login("mallory", "secret").await,
            Err(AuthError::AccountDisabled)
        );
    }

    #[tokio::test]
    async fn test_get_user_and_stable_uuid() {
        let p = provider();
        let first = p.get_user("alice").await.unwrap();
        let second = p.get_user("alice").await.unwrap();
        assert_eq!(first.uuid, second.uuid);
        assert_ne!(first.uuid, p.get_user("bob").await.unwrap().uuid);

        assert_eq!(p.get_user("mallory").await, Err(AuthError::AccountDisabled));
        assert_eq!(p.get_user("carol").await, Err(AuthError::NoSuchUser));
    }

    #[tokio::test]
    async fn test_list_users() {
        let users = provider().list_users().await.unwrap();
        let accounts: Vec<_> = users.iter().map(|u| u.account.as_str()).collect();
        assert_eq!(accounts, ["alice", "bob", "mallory"]);
        assert_eq!(users[2].status, 0);
    }
}
