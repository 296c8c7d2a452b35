pub mod auth;
pub mod dispatch;
pub mod health;
pub mod pages;

use std::sync::Arc;

use axum::{http::HeaderName, Router};
use tower_http::services::ServeDir;

use crate::config::{AuthType, Config};
use crate::error::AppError;
use crate::middleware::rate_limit::{create_rate_limiter, SharedRateLimiter};
use crate::middleware::session::SessionAuthenticator;
use crate::services::auth::SharedAuthProvider;
use crate::services::cache::SharedCache;
use crate::services::cookie::CookieManager;
use crate::services::proxy::ProxyHandler;
use crate::services::store::Store;

/// Shared state of every handler, built once at startup
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub provider: SharedAuthProvider,
    pub sessions: SessionAuthenticator,
    pub proxy: Arc<ProxyHandler>,
    pub login_limiter: SharedRateLimiter,
    pub client_ip_header: Option<HeaderName>,
}

impl AppState {
    pub fn new(
        config: Config,
        cache: SharedCache,
        provider: SharedAuthProvider,
    ) -> Result<Self, AppError> {
        let cookies = CookieManager::new(
            config.session.cookie_name.clone(),
            config.session.cookie_domain.clone(),
            config.session.max_age,
            config.hash_key()?,
            config.block_key()?,
        );
        let store = Store::new(cache);
        let sessions = SessionAuthenticator::new(
            cookies,
            store.clone(),
            provider.clone(),
            config.auth_type == AuthType::Composite,
        );
        let proxy = ProxyHandler::new(config.backend_table()?, config.request_timeout())?;

        Ok(Self {
            store,
            provider,
            sessions,
            proxy: Arc::new(proxy),
            login_limiter: create_rate_limiter(config.login_rate_per_minute),
            client_ip_header: config.client_ip_header_name(),
            config: Arc::new(config),
        })
    }

    pub fn cookies(&self) -> &CookieManager {
        self.sessions.cookies()
    }
}

/// Gateway pages under `/secure-proxy`; everything else is proxied
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(pages::router(&state))
        .merge(auth::router(&state))
        .merge(health::router())
        .nest_service(
            "/secure-proxy/assets",
            ServeDir::new(&state.config.assets_dir),
        )
        .fallback(dispatch::dispatch)
        .with_state(state)
}
