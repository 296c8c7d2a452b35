//! Catch-all handler: every request that is not a gateway page goes
//! through authenticate → resolve → authorize → forward, and leaves one
//! access record behind.

use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::{IntoResponse, Response},
};
use futures::FutureExt;

use super::AppState;
use crate::error::AppError;
use crate::middleware::session::login_redirect;
use crate::services::proxy::ForwardContext;
use crate::utils::{client_ip, is_static_asset, is_upgrade_request, request_host};

/// Fields of the per-request access log line
#[derive(Debug, Clone)]
struct AccessRecord {
    host: String,
    path: String,
    method: String,
    user_agent: String,
    client_ip: String,
    referer: String,
    account: String,
    upgrade: bool,
}

impl AccessRecord {
    fn from_request(state: &AppState, request: &Request) -> Self {
        let headers = request.headers();
        let remote = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        Self {
            host: request_host(headers, request.uri()).unwrap_or_default(),
            path: request.uri().path().to_string(),
            method: request.method().to_string(),
            user_agent: header_text(headers, &header::USER_AGENT),
            client_ip: client_ip(headers, state.client_ip_header.as_ref(), remote),
            referer: header_text(headers, &header::REFERER),
            account: "-".to_string(),
            upgrade: is_upgrade_request(headers),
        }
    }

    fn log(&self, status: StatusCode, elapsed: Duration) {
        tracing::info!(
            target: "secure_proxy::access",
            elapsed_ms = elapsed.as_millis() as u64,
            host = %self.host,
            path = %self.path,
            method = %self.method,
            user_agent = %self.user_agent,
            client_ip = %self.client_ip,
            referer = %self.referer,
            status = status.as_u16(),
            account = %self.account,
            upgrade = self.upgrade,
            "request"
        );
    }

    fn log_panic(&self, elapsed: Duration, message: &str) {
        tracing::error!(
            target: "secure_proxy::access",
            elapsed_ms = elapsed.as_millis() as u64,
            host = %self.host,
            path = %self.path,
            method = %self.method,
            user_agent = %self.user_agent,
            client_ip = %self.client_ip,
            referer = %self.referer,
            status = StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            account = %self.account,
            upgrade = self.upgrade,
            "request panicked: {}",
            message
        );
    }
}

fn header_text(headers: &HeaderMap, name: &HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string()
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Router fallback
pub async fn dispatch(State(state): State<AppState>, request: Request) -> Response {
    let started = Instant::now();
    let mut access = AccessRecord::from_request(&state, &request);

    let outcome = AssertUnwindSafe(handle(&state, request, &mut access))
        .catch_unwind()
        .await;

    match outcome {
        Ok(response) => {
            if state.config.verbose || !is_static_asset(&access.path) {
                access.log(response.status(), started.elapsed());
            }
            response
        }
        Err(payload) => {
            access.log_panic(started.elapsed(), panic_message(payload.as_ref()));
            AppError::Internal("request handling failed".to_string()).into_response()
        }
    }
}

async fn handle(state: &AppState, request: Request, access: &mut AccessRecord) -> Response {
    let (parts, body) = request.into_parts();

    let user = match state.sessions.authenticate(&parts.headers).await {
        Ok(Some(user)) => user,
        Ok(None) => return login_redirect(),
        Err(e) => {
            tracing::error!(host = %access.host, "Session validation failed: {}", e);
            return e.into_response();
        }
    };
    access.account = user.account.clone();

    let Some(backend) = state.proxy.resolve(&access.host) else {
        return AppError::BadRequest("domain not available".to_string()).into_response();
    };

    if !backend.has_privilege(&user) {
        tracing::warn!(
            host = %access.host,
            account = %user.account,
            privilege = %backend.privilege,
            "Access denied"
        );
        let name = if user.name.is_empty() {
            user.account.clone()
        } else {
            user.name.clone()
        };
        return AppError::Forbidden {
            host: access.host.clone(),
            name,
        }
        .into_response();
    }

    let ctx = ForwardContext {
        account: &user.account,
        client_ip: &access.client_ip,
        upgrade: access.upgrade,
    };

    match state
        .proxy
        .forward(&access.host, Request::from_parts(parts, body), ctx)
        .await
    {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(host = %access.host, path = %access.path, "Proxy error: {}", e);
            e.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use axum::{body::Body, http::HeaderValue, Router};
    use tokio::net::TcpListener;
    use tower::ServiceExt;

    use super::*;
    use crate::config::BackendConfig;
    use crate::error::AuthError;
    use crate::models::{AuthedUser, UserAuthInfo};
    use crate::routes::{create_router, testing};
    use crate::services::auth::AuthProvider;
    use crate::services::cache::MemoryCache;

    /// Collects formatted log lines
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        (buffer, tracing::subscriber::set_default(subscriber))
    }

    /// Knows every account, but blows up looking up `boom`
    struct PanickingProvider;

    #[async_trait]
    impl AuthProvider for PanickingProvider {
        async fn login(&self, account: &str, _password: &str) -> Result<AuthedUser, AuthError> {
            self.get_user(account).await
        }

        async fn get_user(&self, account: &str) -> Result<AuthedUser, AuthError> {
            if account == "boom" {
                panic!("provider blew up");
            }
            Ok(known_user(account))
        }

        async fn list_users(&self) -> Result<Vec<AuthedUser>, AuthError> {
            Ok(Vec::new())
        }
    }

    fn known_user(account: &str) -> AuthedUser {
        AuthedUser {
            user_type: "local".into(),
            uuid: format!("u-{account}"),
            name: account.to_uppercase(),
            account: account.into(),
            groups: Default::default(),
            status: 1,
        }
    }

    async fn spawn_upstream() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new().fallback(|| async { "upstream" }))
                .await
                .unwrap();
        });
        addr.to_string()
    }

    fn session_cookie(state: &AppState, account: &str) -> HeaderValue {
        let info = UserAuthInfo::from_authed_user(known_user(account), account, "app.example.com");
        let token = state.cookies().encode(&info).unwrap();
        HeaderValue::from_str(&format!("{}={token}", state.cookies().name())).unwrap()
    }

    fn get(path: &str, cookie: Option<HeaderValue>) -> Request {
        let mut builder = axum::http::Request::get(path).header(header::HOST, "app.example.com");
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let (logs, _guard) = capture_logs();

        let mut config = testing::config();
        config.backends = vec![BackendConfig {
            host: "app.example.com".into(),
            upstream: spawn_upstream().await,
            ..Default::default()
        }];
        let state =
            AppState::new(config, Arc::new(MemoryCache::new()), Arc::new(PanickingProvider))
                .unwrap();
        let app = create_router(state.clone());

        let boom = session_cookie(&state, "boom");
        let response = app.clone().oneshot(get("/", Some(boom))).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(logs.contents().contains("request panicked: provider blew up"));

        let alice = session_cookie(&state, "alice");
        let response = app.oneshot(get("/", Some(alice))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"upstream");
    }

    #[tokio::test]
    async fn test_access_line_is_logged() {
        let (logs, _guard) = capture_logs();
        let app = create_router(testing::state(testing::config()));

        let response = app.oneshot(get("/dashboard", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);

        let contents = logs.contents();
        let line = contents
            .lines()
            .find(|line| line.contains("path=/dashboard"))
            .unwrap();
        assert!(line.contains("secure_proxy::access"));
        assert!(line.contains("status=303"));
        assert!(line.contains("method=GET"));
        assert!(line.contains("host=app.example.com"));
        assert!(line.contains("account=-"));
    }

    #[tokio::test]
    async fn test_static_assets_are_logged_only_when_verbose() {
        let (logs, _guard) = capture_logs();

        let quiet = create_router(testing::state(testing::config()));
        quiet.oneshot(get("/app.js", None)).await.unwrap();
        assert!(!logs.contents().contains("path=/app.js"));

        let mut config = testing::config();
        config.verbose = true;
        let verbose = create_router(testing::state(config));
        verbose.oneshot(get("/app.js", None)).await.unwrap();
        assert!(logs.contents().contains("path=/app.js"));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");

        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }

    #[test]
    fn test_header_text_defaults_to_dash() {
        let mut headers = HeaderMap::new();
        assert_eq!(header_text(&headers, &header::REFERER), "-");
        headers.insert(header::REFERER, "https://a.example.com/".parse().unwrap());
        assert_eq!(header_text(&headers, &header::REFERER), "https://a.example.com/");
    }
}
