pub mod database;
pub mod emails;
pub mod error;
pub mod row_helpers;
pub mod schema;

pub use database::Database;
pub use emails::{EmailRepo, ListQuery, UpsertOutcome};
pub use error::StoreError;
