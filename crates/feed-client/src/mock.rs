use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;

use feed_core::backend::{FeedBackend, PageRequest};
use feed_core::errors::BackendError;
use feed_core::event::FeedEvent;
use feed_core::ids::{Cursor, ItemId};
use feed_core::item::{FeedItem, FeedPage};

/// Pre-programmed page responses for deterministic testing without a server.
pub enum MockPage {
    Page(FeedPage),
    Error(BackendError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockPage>),
}

impl MockPage {
    /// Convenience: a page of `ids` with an optional next cursor.
    pub fn of(ids: &[&str], next_cursor: Option<&str>) -> Self {
        Self::Page(FeedPage {
            items: ids.iter().map(|id| MockBackend::item(id)).collect(),
            next_cursor: next_cursor.map(Cursor::from_raw),
            has_more: next_cursor.is_some(),
        })
    }

    pub fn delayed(delay: Duration, inner: MockPage) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock backend that serves scripted pages in sequence and records
/// everything the session sends it.
pub struct MockBackend {
    pages: Mutex<VecDeque<MockPage>>,
    page_requests: Mutex<Vec<PageRequest>>,
    event_failures: Mutex<VecDeque<BackendError>>,
    event_batches: Mutex<Vec<Vec<FeedEvent>>>,
    send_attempts: Mutex<usize>,
    favorite_failures: Mutex<VecDeque<BackendError>>,
    favorite_calls: Mutex<Vec<(ItemId, bool)>>,
}

impl MockBackend {
    pub fn new(pages: Vec<MockPage>) -> Self {
        Self {
            pages: Mutex::new(pages.into()),
            page_requests: Mutex::new(Vec::new()),
            event_failures: Mutex::new(VecDeque::new()),
            event_batches: Mutex::new(Vec::new()),
            send_attempts: Mutex::new(0),
            favorite_failures: Mutex::new(VecDeque::new()),
            favorite_calls: Mutex::new(Vec::new()),
        }
    }

    /// A plain item with id `id`, category "general", created at a fixed instant.
    pub fn item(id: &str) -> FeedItem {
        FeedItem {
            id: ItemId::from_raw(id),
            category_id: "general".into(),
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap_or_default(),
            is_free_giveaway: false,
            is_farmer: false,
            price: Some(10.0),
            price_history: Vec::new(),
        }
    }

    pub fn push_page(&self, page: MockPage) {
        self.pages.lock().push_back(page);
    }

    /// Fail the next `send_events` call with `error`. Calls queue up.
    pub fn fail_next_send(&self, error: BackendError) {
        self.event_failures.lock().push_back(error);
    }

    pub fn fail_next_favorite(&self, error: BackendError) {
        self.favorite_failures.lock().push_back(error);
    }

    pub fn page_requests(&self) -> Vec<PageRequest> {
        self.page_requests.lock().clone()
    }

    /// Batches that were accepted, in delivery order.
    pub fn delivered_batches(&self) -> Vec<Vec<FeedEvent>> {
        self.event_batches.lock().clone()
    }

    pub fn delivered_events(&self) -> Vec<FeedEvent> {
        self.event_batches.lock().iter().flatten().cloned().collect()
    }

    /// Every `send_events` call, including failed ones.
    pub fn send_attempts(&self) -> usize {
        *self.send_attempts.lock()
    }

    pub fn favorite_calls(&self) -> Vec<(ItemId, bool)> {
        self.favorite_calls.lock().clone()
    }
}

#[async_trait]
impl FeedBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<FeedPage, BackendError> {
        self.page_requests.lock().push(request.clone());
        let mut next = self.pages.lock().pop_front().ok_or_else(|| {
            BackendError::InvalidRequest("MockBackend: no page configured".into())
        })?;
        loop {
            match next {
                MockPage::Page(page) => return Ok(page),
                MockPage::Error(e) => return Err(e),
                MockPage::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    next = *inner;
                }
            }
        }
    }

    async fn send_events(&self, events: &[FeedEvent]) -> Result<(), BackendError> {
        *self.send_attempts.lock() += 1;
        if let Some(e) = self.event_failures.lock().pop_front() {
            return Err(e);
        }
        self.event_batches.lock().push(events.to_vec());
        Ok(())
    }

    async fn set_favorite(&self, item_id: &ItemId, favorited: bool) -> Result<(), BackendError> {
        self.favorite_calls.lock().push((item_id.clone(), favorited));
        match self.favorite_failures.lock().pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
