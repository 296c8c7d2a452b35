use axum::{
    middleware::from_fn_with_state, response::Html, routing::get, Extension, Router,
};
use chrono::SecondsFormat;

use super::AppState;
use crate::middleware::session::require_session;
use crate::models::UserAuthInfo;
use crate::utils::escape_html;

pub fn router(state: &AppState) -> Router<AppState> {
    Router::new()
        .route("/secure-proxy", get(status_page))
        .route_layer(from_fn_with_state(state.sessions.clone(), require_session))
}

/// Who is signed in, and since when
pub async fn status_page(Extension(user): Extension<UserAuthInfo>) -> Html<String> {
    Html(render_status_page(&user))
}

fn render_status_page(user: &UserAuthInfo) -> String {
    let groups = if user.groups.is_empty() {
        "<li>-</li>".to_string()
    } else {
        user.groups
            .iter()
            .map(|g| format!("<li>{}</li>", escape_html(g)))
            .collect::<String>()
    };

    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Session</title>\
         <link rel=\"stylesheet\" href=\"/secure-proxy/assets/style.css\"></head>\
         <body><main class=\"card\"><h1>Signed in</h1><dl>\
         <dt>Account</dt><dd>{account}</dd>\
         <dt>Name</dt><dd>{name}</dd>\
         <dt>Type</dt><dd>{user_type}</dd>\
         <dt>Login time</dt><dd>{login_time}</dd>\
         <dt>Groups</dt><dd><ul>{groups}</ul></dd></dl>\
         <a class=\"button\" href=\"/secure-proxy/auth/logout\">Log out</a>\
         </main></body></html>",
        account = escape_html(&user.account),
        name = escape_html(&user.name),
        user_type = escape_html(&user.user_type),
        login_time = user.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    )
}
