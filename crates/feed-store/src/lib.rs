pub mod database;
pub mod error;
pub mod outbox;
mod schema;

pub use database::Database;
pub use error::StoreError;
pub use outbox::{OutboxRepo, Stashed};
