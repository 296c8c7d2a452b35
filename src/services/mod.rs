pub mod auth;
pub mod cache;
pub mod cookie;
pub mod proxy;
pub mod store;
