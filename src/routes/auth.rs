use axum::{
    extract::{Form, Query, State},
    http::{header, HeaderMap, Uri},
    middleware::from_fn_with_state,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;

use super::AppState;
use crate::config::AuthType;
use crate::error::{Result, StoreError};
use crate::middleware::rate_limit::login_rate_limit;
use crate::middleware::session::LOGIN_PAGE;
use crate::models::UserAuthInfo;
use crate::services::auth::{fixed_user_type, DIRECTORY_USER_TYPE, LOCAL_USER_TYPE};
use crate::utils::{escape_html, request_host};

pub fn router(state: &AppState) -> Router<AppState> {
    let login_limit = from_fn_with_state(state.login_limiter.clone(), login_rate_limit);

    Router::new()
        .route("/secure-proxy/auth", get(login_page))
        .route(
            "/secure-proxy/auth/login",
            get(login_page).merge(post(login).layer(login_limit)),
        )
        .route("/secure-proxy/auth/logout", get(logout))
}

/// Values echoed back to the login form after a failed attempt
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoginQuery {
    pub error: String,
    pub username: String,
    pub user_type: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoginForm {
    pub user_type: String,
    pub username: String,
    pub password: String,
}

pub async fn login_page(
    State(state): State<AppState>,
    Query(query): Query<LoginQuery>,
) -> Html<String> {
    Html(render_login_page(state.config.auth_type, &query))
}

fn render_login_page(auth_type: AuthType, query: &LoginQuery) -> String {
    let error = if query.error.is_empty() {
        String::new()
    } else {
        format!("<p class=\"error\">{}</p>", escape_html(&query.error))
    };

    let selector = if auth_type == AuthType::Composite {
        let option = |value: &str, label: &str| {
            let selected = if query.user_type == value { " selected" } else { "" };
            format!("<option value=\"{value}\"{selected}>{label}</option>")
        };
        format!(
            "<label>Account type <select name=\"user_type\">{}{}</select></label>",
            option(LOCAL_USER_TYPE, "Local"),
            option(DIRECTORY_USER_TYPE, "Directory"),
        )
    } else {
        String::new()
    };

    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Sign in</title>\
         <link rel=\"stylesheet\" href=\"/secure-proxy/assets/style.css\"></head>\
         <body><main class=\"card\"><h1>Sign in</h1>{error}\
         <form method=\"post\" action=\"/secure-proxy/auth/login\">{selector}\
         <label>Username <input name=\"username\" value=\"{username}\" autofocus></label>\
         <label>Password <input name=\"password\" type=\"password\"></label>\
         <button type=\"submit\">Sign in</button></form></main></body></html>",
        username = escape_html(&query.username),
    )
}

/// Back to the login form, keeping what the user typed
fn back_to_login(username: &str, user_type: &str, error: &str) -> Response {
    Redirect::to(&format!(
        "{LOGIN_PAGE}?username={}&user_type={}&error={}",
        urlencoding::encode(username),
        urlencoding::encode(user_type),
        urlencoding::encode(error),
    ))
    .into_response()
}

/// Check the credentials and open a session
pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    Form(form): Form<LoginForm>,
) -> Result<Response> {
    let mut username = form.username.trim();
    let suffix = state.config.users.ignore_account_suffix.as_str();
    if !suffix.is_empty() {
        username = username.strip_suffix(suffix).unwrap_or(username);
    }
    let password = form.password.trim();
    let requested_type = form.user_type.trim();

    if username.is_empty() || password.is_empty() {
        return Ok(back_to_login(
            username,
            requested_type,
            "username and password are required",
        ));
    }

    let user_type = match fixed_user_type(state.config.auth_type) {
        Some(user_type) => user_type,
        None if requested_type == LOCAL_USER_TYPE || requested_type == DIRECTORY_USER_TYPE => {
            requested_type
        }
        None => return Ok(back_to_login(username, requested_type, "invalid request")),
    };

    let host = request_host(&headers, &uri).unwrap_or_default();

    match state.store.can_login(user_type, username).await {
        Ok(()) => {}
        Err(err @ StoreError::TooManyAttempts { .. }) => {
            tracing::warn!(
                username = %username,
                user_type = %user_type,
                host = %host,
                "Login throttled: {}",
                err
            );
            return Ok(back_to_login(username, user_type, &err.to_string()));
        }
        Err(err) => return Err(err.into()),
    }

    let account = if state.config.auth_type == AuthType::Composite {
        format!("{user_type}:{username}")
    } else {
        username.to_string()
    };

    let user = match state.provider.login(&account, password).await {
        Ok(user) => user,
        Err(err) => {
            tracing::warn!(
                username = %username,
                user_type = %user_type,
                host = %host,
                "Login failed: {}",
                err
            );
            if let Err(e) = state.store.record_login_attempt(user_type, username).await {
                tracing::warn!("Failed to record login attempt for {}: {}", username, e);
            }
            return Ok(back_to_login(
                username,
                user_type,
                "invalid username or password",
            ));
        }
    };

    let info = UserAuthInfo::from_authed_user(user, username, host);
    let cookie = state.cookies().set_cookie_header(&info)?;

    tracing::info!(
        account = %info.account,
        user_type = %info.user_type,
        host = %info.login_host,
        "Login succeeded"
    );

    Ok(([(header::SET_COOKIE, cookie)], Redirect::to("/")).into_response())
}

/// Overwrite the session cookie with an expired one
pub async fn logout(State(state): State<AppState>) -> Result<Response> {
    let cookie = state.cookies().clear_cookie_header()?;
    Ok(([(header::SET_COOKIE, cookie)], Redirect::to("/")).into_response())
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    use super::*;
    use crate::routes::testing;

    fn app(state: AppState) -> Router {
        router(&state).with_state(state)
    }

    fn login_request(body: &str) -> Request<Body> {
        Request::post("/secure-proxy/auth/login")
            .header(header::HOST, "app.example.com")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn location(response: &Response) -> &str {
        response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap()
    }

    #[tokio::test]
    async fn test_login_sets_session_cookie() {
        let state = testing::state(testing::config());
        let response = app(state.clone())
            .oneshot(login_request("username=+alice+&password=secret"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/");

        let cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap();
        let token = cookie
            .strip_prefix("secure-proxy-auth=")
            .and_then(|rest| rest.split(';').next())
            .unwrap();
        let info = state.cookies().decode(token).unwrap();
        assert_eq!(info.account, "alice");
        assert_eq!(info.user_type, "local");
        assert_eq!(info.login_host, "app.example.com");
        assert!(info.groups.contains("ops"));
    }

    #[tokio::test]
    async fn test_login_strips_account_suffix() {
        let mut config = testing::config();
        config.users.ignore_account_suffix = "@example.com".into();
        let response = app(testing::state(config))
            .oneshot(login_request("username=alice%40example.com&password=secret"))
            .await
            .unwrap();

        assert_eq!(location(&response), "/");
    }

    #[tokio::test]
    async fn test_bad_password_redirects_back() {
        let response = app(testing::state(testing::config()))
            .oneshot(login_request("username=alice&password=nope"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            location(&response),
            "/secure-proxy/auth?username=alice&user_type=local&error=invalid%20username%20or%20password"
        );
        assert!(response.headers().get(header::SET_COOKIE).is_none());
    }

    #[tokio::test]
    async fn test_empty_credentials_rejected() {
        let response = app(testing::state(testing::config()))
            .oneshot(login_request("username=alice&password=+++"))
            .await
            .unwrap();

        assert!(location(&response).contains("error=username%20and%20password%20are%20required"));
    }

    #[cfg(feature = "ldap")]
    #[tokio::test]
    async fn test_composite_requires_known_user_type() {
        let mut config = testing::config();
        config.auth_type = AuthType::Composite;
        config.ldap.url = "ldap://127.0.0.1:1".into();
        let response = app(testing::state(config))
            .oneshot(login_request("user_type=sql&username=alice&password=secret"))
            .await
            .unwrap();

        assert!(location(&response).ends_with("error=invalid%20request"));
    }

    #[tokio::test]
    async fn test_throttled_after_repeated_failures() {
        let state = testing::state(testing::config());
        for _ in 0..6 {
            state
                .store
                .record_login_attempt("local", "alice")
                .await
                .unwrap();
        }

        // even the right password is refused while throttled
        let response = app(state)
            .oneshot(login_request("username=alice&password=secret"))
            .await
            .unwrap();

        assert!(location(&response).contains("error=too%20many%20login%20attempts"));
        assert!(response.headers().get(header::SET_COOKIE).is_none());
    }

    #[tokio::test]
    async fn test_login_flood_limiter() {
        let mut config = testing::config();
        config.login_rate_per_minute = 1;
        let app = app(testing::state(config));

        let first = app
            .clone()
            .oneshot(login_request("username=alice&password=nope"))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::SEE_OTHER);

        let second = app
            .oneshot(login_request("username=alice&password=nope"))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_logout_clears_cookie() {
        let response = app(testing::state(testing::config()))
            .oneshot(
                Request::get("/secure-proxy/auth/logout")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(cookie.starts_with("secure-proxy-auth=;"));
        assert!(cookie.contains("Max-Age=0"));
    }

    #[tokio::test]
    async fn test_login_page_escapes_query() {
        let response = app(testing::state(testing::config()))
            .oneshot(
                Request::get("/secure-proxy/auth?username=%3Cb%3E&error=bad%20%26%20worse")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let html = String::from_utf8(body.to_vec()).unwrap();
        assert!(html.contains("value=\"&lt;b&gt;\""));
        assert!(html.contains("bad &amp; worse"));
        assert!(!html.contains("<select"));
    }

    #[test]
    fn test_selector_only_for_composite() {
        let query = LoginQuery {
            user_type: "ldap".into(),
            ..Default::default()
        };
        let html = render_login_page(AuthType::Composite, &query);
        assert!(html.contains("<option value=\"ldap\" selected>"));
        assert!(!render_login_page(AuthType::Ldap, &query).contains("<select"));
    }
}
