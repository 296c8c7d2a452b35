use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::utils::escape_html;

/// Cache backend failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("value is not a number: {0}")]
    NotANumber(String),

    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Authentication provider failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("user not found")]
    NoSuchUser,

    #[error("invalid password")]
    InvalidPassword,

    #[error("account is disabled")]
    AccountDisabled,

    #[error("authentication provider not implemented")]
    NotImplemented,

    #[error("directory service error: {0}")]
    Directory(String),
}

/// Session cookie encoding/decoding failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CookieError {
    #[error("failed to encode session: {0}")]
    Encoding(String),

    #[error("invalid session token")]
    InvalidToken,
}

/// Login throttle and session store failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("too many login attempts, retry in {}s", retry_after.as_secs())]
    TooManyAttempts { retry_after: Duration },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Configuration load and validation failures
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid config document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("User {name} has no access to {host}")]
    Forbidden { host: String, name: String },

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Upstream error: {0}")]
    BadGateway(String),

    #[error("Upstream timed out after {0:?}")]
    GatewayTimeout(Duration),

    #[error("Too many requests: {0}")]
    TooManyRequests(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Forbidden { .. } => StatusCode::FORBIDDEN,
            AppError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            AppError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            AppError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        if let AppError::Forbidden { host, name } = &self {
            let host = escape_html(host);
            let body = format!(
                "User {} has no access to {host}. Ask an administrator for access; \
                 once it is granted, visit <a href='/secure-proxy'>http://{host}/secure-proxy</a> \
                 to log out and sign in again.",
                escape_html(name),
            );
            return (status, Html(body)).into_response();
        }

        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

impl From<CacheError> for AppError {
    fn from(err: CacheError) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<CookieError> for AppError {
    fn from(err: CookieError) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::TooManyAttempts { .. } => AppError::TooManyRequests(err.to_string()),
            StoreError::Cache(e) => e.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
