//! HTTP surface: email listing, ask, reset, OAuth, push events over SSE.

pub mod error;
pub mod handlers;
pub mod server;

pub use error::ApiError;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
