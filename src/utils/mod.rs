pub mod html;
pub mod request;

pub use html::escape_html;
pub use request::{
    client_ip, is_static_asset, is_upgrade_request, request_host, HOP_BY_HOP_HEADERS,
};
