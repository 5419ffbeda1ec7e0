use async_trait::async_trait;

use crate::errors::BackendError;
use crate::event::FeedEvent;
use crate::ids::{Cursor, ItemId};
use crate::item::{FeedPage, GeoContext};

/// Parameters for `GET /feed`. A missing cursor means "first page".
#[derive(Clone, Debug, PartialEq)]
pub struct PageRequest {
    pub geo: GeoContext,
    pub limit: usize,
    pub cursor: Option<Cursor>,
}

/// The three REST collaborators the session consumes.
#[async_trait]
pub trait FeedBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_page(&self, request: &PageRequest) -> Result<FeedPage, BackendError>;

    /// Deliver one batch. The response body is ignored.
    async fn send_events(&self, events: &[FeedEvent]) -> Result<(), BackendError>;

    async fn set_favorite(&self, item_id: &ItemId, favorited: bool) -> Result<(), BackendError>;
}
