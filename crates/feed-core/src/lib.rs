pub mod backend;
pub mod config;
pub mod errors;
pub mod event;
pub mod filter;
pub mod ids;
pub mod item;

pub use backend::{FeedBackend, PageRequest};
pub use config::FeedConfig;
pub use errors::BackendError;
pub use event::{EventValidationError, FeedEvent, FeedEventType};
pub use filter::FilterTag;
pub use ids::{Cursor, ItemId, SessionId};
pub use item::{FeedItem, FeedPage, GeoContext};
