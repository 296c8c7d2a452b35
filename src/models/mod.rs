pub mod auth;
pub mod backend;

pub use auth::*;
pub use backend::*;
