//! Gmail mail source: REST listing and payload extraction, OAuth token
//! handling, and an in-memory source for pipeline tests.

#![deny(unsafe_code)]

pub mod auth;
pub mod mock;
pub mod payload;
pub mod pkce;
pub mod source;

pub use auth::{GoogleAuth, GoogleAuthConfig};
pub use mock::{FetchFailure, StaticSource};
pub use source::{GmailConfig, GmailSource};
