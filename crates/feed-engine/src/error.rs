use feed_core::errors::BackendError;
use feed_core::event::EventValidationError;
use feed_core::ids::ItemId;
use feed_store::StoreError;

use crate::session::SessionState;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid event: {0}")]
    Event(#[from] EventValidationError),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("cannot {op} while session is {state:?}")]
    InvalidState {
        op: &'static str,
        state: SessionState,
    },

    #[error("no item is visible")]
    NoItems,

    #[error("item not in fetched set: {0}")]
    UnknownItem(ItemId),
}
