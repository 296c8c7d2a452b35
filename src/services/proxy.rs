//! Forwarding to upstream backends.
//!
//! One pooled HTTP client is built per backend host at startup and reused
//! for every request to that host. Ordinary requests are fully buffered
//! under a deadline; protocol upgrades are spliced onto the client
//! connection once the upstream answers `101 Switching Protocols`.

use std::collections::HashMap;
use std::time::Duration;

use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use reqwest::{redirect::Policy, Client, Url};

use crate::error::{AppError, Result};
use crate::models::Backend;
use crate::utils::HOP_BY_HOP_HEADERS;

pub const X_SECURE_PROXY_HOST: HeaderName = HeaderName::from_static("x-secure-proxy-host");
pub const X_SECURE_PROXY_ACCOUNT: HeaderName = HeaderName::from_static("x-secure-proxy-account");
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Largest inbound request body that is buffered for forwarding
const MAX_REQUEST_BODY: usize = 64 * 1024 * 1024;

/// A backend plus its dedicated upstream client
struct Upstream {
    backend: Backend,
    client: Client,
}

/// Per-request data the forwarder needs from the dispatch pipeline
#[derive(Debug, Clone, Copy)]
pub struct ForwardContext<'a> {
    pub account: &'a str,
    pub client_ip: &'a str,
    pub upgrade: bool,
}

/// Upstream answer captured in full before anything reaches the client
#[derive(Debug)]
pub struct BufferedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl IntoResponse for BufferedResponse {
    fn into_response(self) -> Response {
        let mut headers = self.headers;
        strip_hop_by_hop(&mut headers, false);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(self.body.len()));

        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = headers;
        response
    }
}

pub struct ProxyHandler {
    upstreams: HashMap<String, Upstream>,
    timeout: Duration,
}

impl ProxyHandler {
    pub fn new(backends: HashMap<String, Backend>, timeout: Duration) -> Result<Self> {
        let mut upstreams = HashMap::with_capacity(backends.len());
        for (host, backend) in backends {
            let client = Client::builder()
                .redirect(Policy::none())
                .no_proxy()
                .pool_idle_timeout(Duration::from_secs(90))
                .build()
                .map_err(|e| AppError::Internal(format!("http client for {host}: {e}")))?;

            tracing::info!("Backend {} -> {} ({})", host, backend.upstream, backend.privilege);
            upstreams.insert(host, Upstream { backend, client });
        }

        Ok(Self { upstreams, timeout })
    }

    fn upstream(&self, host: &str) -> Option<&Upstream> {
        self.upstreams.get(host).or_else(|| {
            let (name, port) = host.rsplit_once(':')?;
            if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            self.upstreams.get(name)
        })
    }

    /// Backend for a request host; the port is ignored when no exact entry exists
    pub fn resolve(&self, host: &str) -> Option<&Backend> {
        self.upstream(host).map(|u| &u.backend)
    }

    /// Forward `request` to the backend registered for `host`
    pub async fn forward(
        &self,
        host: &str,
        request: Request,
        ctx: ForwardContext<'_>,
    ) -> Result<Response> {
        let upstream = self
            .upstream(host)
            .ok_or_else(|| AppError::BadRequest("domain not available".to_string()))?;

        if ctx.upgrade {
            self.forward_upgrade(upstream, request, ctx).await
        } else {
            self.forward_buffered(upstream, request, ctx)
                .await
                .map(IntoResponse::into_response)
        }
    }

    async fn forward_buffered(
        &self,
        upstream: &Upstream,
        request: Request,
        ctx: ForwardContext<'_>,
    ) -> Result<BufferedResponse> {
        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, MAX_REQUEST_BODY)
            .await
            .map_err(|e| AppError::BadRequest(format!("cannot read request body: {e}")))?;

        let url = upstream_url(&upstream.backend.upstream, &parts.uri);
        let headers = outbound_headers(&parts.headers, &upstream.backend, ctx)?;

        let exchange = async {
            let response = upstream
                .client
                .request(parts.method, url)
                .headers(headers)
                .body(body)
                .send()
                .await
                .map_err(|e| AppError::BadGateway(e.to_string()))?;

            let status = response.status();
            let headers = response.headers().clone();
            let body = response
                .bytes()
                .await
                .map_err(|e| AppError::BadGateway(e.to_string()))?;

            Ok::<_, AppError>(BufferedResponse {
                status,
                headers,
                body,
            })
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| AppError::GatewayTimeout(self.timeout))?
    }

    async fn forward_upgrade(
        &self,
        upstream: &Upstream,
        mut request: Request,
        ctx: ForwardContext<'_>,
    ) -> Result<Response> {
        let on_upgrade = request.extensions_mut().remove::<OnUpgrade>().ok_or_else(|| {
            AppError::NotImplemented("connection does not support protocol upgrades".to_string())
        })?;

        let (parts, _) = request.into_parts();
        let url = upstream_url(&upstream.backend.upstream, &parts.uri);
        let headers = outbound_headers(&parts.headers, &upstream.backend, ctx)?;
        let handshake = upstream
            .client
            .request(parts.method, url)
            .headers(headers)
            .send();

        // the deadline covers the handshake and a refused handshake's body,
        // not the spliced stream
        let deadline = tokio::time::Instant::now() + self.timeout;
        let response = tokio::time::timeout_at(deadline, handshake)
            .await
            .map_err(|_| AppError::GatewayTimeout(self.timeout))?
            .map_err(|e| AppError::BadGateway(e.to_string()))?;

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            let status = response.status();
            let headers = response.headers().clone();
            let body = tokio::time::timeout_at(deadline, response.bytes())
                .await
                .map_err(|_| AppError::GatewayTimeout(self.timeout))?
                .map_err(|e| AppError::BadGateway(e.to_string()))?;
            return Ok(BufferedResponse {
                status,
                headers,
                body,
            }
            .into_response());
        }

        let mut headers = response.headers().clone();
        strip_hop_by_hop(&mut headers, true);
        let host = upstream.backend.host.clone();

        tokio::spawn(async move {
            let mut upstream_io = match response.upgrade().await {
                Ok(io) => io,
                Err(e) => {
                    tracing::warn!("Upstream upgrade for {} failed: {}", host, e);
                    return;
                }
            };
            let mut client_io = match on_upgrade.await {
                Ok(io) => TokioIo::new(io),
                Err(e) => {
                    tracing::warn!("Client upgrade for {} failed: {}", host, e);
                    return;
                }
            };

            match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
                Ok((sent, received)) => tracing::debug!(
                    "Upgraded connection to {} closed ({} bytes out, {} bytes in)",
                    host,
                    sent,
                    received
                ),
                Err(e) => tracing::debug!("Upgraded connection to {} ended: {}", host, e),
            }
        });

        let mut switching = Response::new(Body::empty());
        *switching.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        *switching.headers_mut() = headers;
        Ok(switching)
    }
}

/// Upstream URL for an inbound URI: the backend base path joined with the
/// request path, query preserved
pub fn upstream_url(base: &Url, uri: &Uri) -> Url {
    let mut url = base.clone();
    let prefix = base.path().trim_end_matches('/');
    url.set_path(&format!("{}{}", prefix, uri.path()));
    url.set_query(uri.query());
    url
}

/// Remove hop-by-hop headers. Upgrade responses keep `Connection`/`Upgrade`.
fn strip_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
    for name in HOP_BY_HOP_HEADERS {
        if keep_upgrade && (*name == "connection" || *name == "upgrade") {
            continue;
        }
        headers.remove(*name);
    }
}

/// Headers sent upstream: the client's own minus hop-by-hop and `Host`,
/// then forwarding and identity headers, then the backend's rewrite rules
pub fn outbound_headers(
    original: &HeaderMap,
    backend: &Backend,
    ctx: ForwardContext<'_>,
) -> Result<HeaderMap> {
    let mut headers = original.clone();
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    strip_hop_by_hop(&mut headers, ctx.upgrade);

    let forwarded_for = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(previous) if !previous.is_empty() => format!("{}, {}", previous, ctx.client_ip),
        _ => ctx.client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    let host = HeaderValue::from_str(&backend.host)
        .map_err(|_| AppError::BadRequest("invalid backend host".to_string()))?;
    let account = HeaderValue::from_bytes(ctx.account.as_bytes())
        .map_err(|_| AppError::BadRequest("account cannot be sent as a header".to_string()))?;
    headers.insert(X_SECURE_PROXY_HOST, host);
    headers.insert(X_SECURE_PROXY_ACCOUNT, account);

    backend.apply_header_rewrites(&mut headers);

    Ok(headers)
}
