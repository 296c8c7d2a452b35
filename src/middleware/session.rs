use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};

use crate::error::{AppError, AuthError, Result};
use crate::models::UserAuthInfo;
use crate::services::auth::SharedAuthProvider;
use crate::services::cookie::CookieManager;
use crate::services::store::Store;

pub const LOGIN_PAGE: &str = "/secure-proxy/auth";

/// 303 to the login page
pub fn login_redirect() -> Response {
    Redirect::to(LOGIN_PAGE).into_response()
}

/// Resolves the session cookie of a request into an identity that is
/// still known to the authentication provider
#[derive(Clone)]
pub struct SessionAuthenticator {
    cookies: CookieManager,
    store: Store,
    provider: SharedAuthProvider,
    /// Composite auth addresses accounts as `user_type:username`
    prefixed_accounts: bool,
}

impl SessionAuthenticator {
    pub fn new(
        cookies: CookieManager,
        store: Store,
        provider: SharedAuthProvider,
        prefixed_accounts: bool,
    ) -> Self {
        Self {
            cookies,
            store,
            provider,
            prefixed_accounts,
        }
    }

    pub fn cookies(&self) -> &CookieManager {
        &self.cookies
    }

    fn provider_account(&self, info: &UserAuthInfo) -> String {
        if self.prefixed_accounts {
            format!("{}:{}", info.user_type, info.username)
        } else {
            info.username.clone()
        }
    }

    /// `Ok(None)` when the request must go through the login page.
    /// Provider faults other than a missing or disabled account, and
    /// cache faults, are errors.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Option<UserAuthInfo>> {
        let info = match self.cookies.session_from_headers(headers) {
            Ok(info) if info.is_authenticated() => info,
            _ => return Ok(None),
        };

        let account = self.provider_account(&info);
        let provider = self.provider.clone();
        let valid = self
            .store
            .validate_session(&info.id(), || async move {
                match provider.get_user(&account).await {
                    Ok(_) => Ok(true),
                    Err(AuthError::NoSuchUser | AuthError::AccountDisabled) => Ok(false),
                    Err(e) => Err(AppError::from(e)),
                }
            })
            .await?;

        Ok(valid.then_some(info))
    }
}

/// Middleware: requires a valid session and exposes it as an extension
pub async fn require_session(
    State(sessions): State<SessionAuthenticator>,
    request: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let user = match sessions.authenticate(&parts.headers).await {
        Ok(Some(user)) => user,
        Ok(None) => return login_redirect(),
        Err(e) => {
            tracing::error!("Session validation failed: {}", e);
            return e.into_response();
        }
    };

    parts.extensions.insert(user);
    next.run(Request::from_parts(parts, body)).await
}
