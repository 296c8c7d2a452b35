use async_trait::async_trait;

use super::AuthProvider;
use crate::error::AuthError;
use crate::models::AuthedUser;

pub const DATABASE_USER_TYPE: &str = "database";

/// Database-backed users are not available yet; every call fails
#[derive(Debug, Clone, Copy, Default)]
pub struct DatabaseProvider;

#[async_trait]
impl AuthProvider for DatabaseProvider {
    async fn login(&self, _account: &str, _password: &str) -> Result<AuthedUser, AuthError> {
        Err(AuthError::NotImplemented)
    }

    async fn get_user(&self, _account: &str) -> Result<AuthedUser, AuthError> {
        Err(AuthError::NotImplemented)
    }

    async fn list_users(&self) -> Result<Vec<AuthedUser>, AuthError> {
        Err(AuthError::NotImplemented)
    }
}
