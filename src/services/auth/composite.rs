use async_trait::async_trait;

use super::{AuthProvider, SharedAuthProvider};
use crate::error::AuthError;
use crate::models::AuthedUser;

/// Two providers behind one interface.
///
/// `name:account` goes straight to the named provider. A bare account is
/// tried against the first provider, then the second; when both fail the
/// second provider's error is returned.
pub struct CompositeProvider {
    first: (String, SharedAuthProvider),
    second: (String, SharedAuthProvider),
}

impl CompositeProvider {
    pub fn new(
        first: (&str, SharedAuthProvider),
        second: (&str, SharedAuthProvider),
    ) -> Self {
        Self {
            first: (first.0.to_string(), first.1),
            second: (second.0.to_string(), second.1),
        }
    }

    /// Provider named by an account prefix, with the prefix stripped
    fn route<'a>(&self, account: &'a str) -> Option<(&SharedAuthProvider, &'a str)> {
        let (prefix, rest) = account.split_once(':')?;
        [&self.first, &self.second]
            .into_iter()
            .find(|(name, _)| name == prefix)
            .map(|(_, provider)| (provider, rest))
    }
}

#[async_trait]
impl AuthProvider for CompositeProvider {
    async fn login(&self, account: &str, password: &str) -> Result<AuthedUser, AuthError> {
        if let Some((provider, account)) = self.route(account) {
            return provider.login(account, password).await;
        }

        match self.first.1.login(account, password).await {
            Ok(user) => Ok(user),
            Err(err) => {
                tracing::debug!(
                    "{} login failed for {}: {}, trying {}",
                    self.first.0,
                    account,
                    err,
                    self.second.0
                );
                self.second.1.login(account, password).await
            }
        }
    }

    async fn get_user(&self, account: &str) -> Result<AuthedUser, AuthError> {
        if let Some((provider, account)) = self.route(account) {
            return provider.get_user(account).await;
        }

        match self.first.1.get_user(account).await {
            Ok(user) => Ok(user),
            Err(_) => self.second.1.get_user(account).await,
        }
    }

    /// Best effort: a failing provider contributes no users
    async fn list_users(&self) -> Result<Vec<AuthedUser>, AuthError> {
        let mut users = Vec::new();
        for (name, provider) in [&self.first, &self.second] {
            match provider.list_users().await {
                Ok(list) => users.extend(list),
                Err(err) => tracing::warn!("Cannot list {} users: {}", name, err),
            }
        }
        Ok(users)
    }
}
