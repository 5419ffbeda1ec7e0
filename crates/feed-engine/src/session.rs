use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use feed_core::backend::{FeedBackend, PageRequest};
use feed_core::config::FeedConfig;
use feed_core::errors::BackendError;
use feed_core::event::{EventValidationError, FeedEvent, FeedEventType};
use feed_core::filter::FilterTag;
use feed_core::ids::{Cursor, ItemId, SessionId};
use feed_core::item::{FeedItem, FeedPage, GeoContext};
use feed_store::OutboxRepo;
use feed_telemetry::MetricsRecorder;

use crate::batcher::EventBatcher;
use crate::debounce::Debouncer;
use crate::error::SessionError;
use crate::optimistic::{FavoriteOverlay, ToggleOutcome};
use crate::pagination::{FetchKind, FetchTicket, PageOutcome, PaginationController};
use crate::projector::Projection;
use crate::virtual_scroll::{ScrollDirection, ScrollObservation, VirtualScroll};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Loading,
    Ready,
    TornDown,
}

/// Which flavour of `GET /feed` to issue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadMode {
    /// First page; replaces the fetched set.
    Initial,
    /// Next page from the current cursor; appends.
    NextPage,
    /// First page again, parked in the new-items buffer.
    BackgroundRefresh,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    Replaced(usize),
    Appended(usize),
    Buffered(usize),
    /// A detached fetch was started; its result arrives as a [`SessionUpdate`].
    Started,
    /// Preconditions not met (fetch in flight, no more pages).
    Skipped,
    Stale,
    Failed,
}

/// Asynchronous results delivered back to the session.
#[derive(Debug)]
pub enum SessionUpdate {
    /// The pagination debounce elapsed.
    PaginationDue { generation: u64 },
    PageFetched {
        ticket: FetchTicket,
        result: Result<FeedPage, BackendError>,
    },
}

/// What the host must do after reporting a scroll offset.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScrollResponse {
    /// Index into the filtered sequence, or `None` when nothing is visible.
    pub real_index: Option<usize>,
    /// Offset to jump to silently, if any.
    pub recenter_to: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub state: SessionState,
    pub filter: FilterTag,
    pub current_index: Option<usize>,
    pub current_item: Option<ItemId>,
    pub current_favorited: bool,
    pub filtered_len: usize,
    pub fetched_len: usize,
    pub has_more: bool,
    pub fetching_next: bool,
    pub refreshing: bool,
    pub pending_events: usize,
    pub pending_new_items: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DisposeReport {
    pub delivered: usize,
    pub stashed: usize,
    /// Events that could be neither delivered nor stashed.
    pub undelivered: usize,
}

/// One browsing session.
///
/// Every operation takes `&mut self`, so only one runs at a time. Work that
/// overlaps with user input (debounced pagination, detached page fetches)
/// reports back through [`SessionUpdate`] messages that the host passes to
/// [`FeedSession::handle_update`].
pub struct FeedSession {
    id: SessionId,
    backend: Arc<dyn FeedBackend>,
    config: FeedConfig,
    geo: Option<GeoContext>,
    state: SessionState,
    pagination: PaginationController,
    projection: Projection,
    current_index: usize,
    favorites: FavoriteOverlay,
    batcher: EventBatcher,
    scroll: VirtualScroll,
    dwell_start: Option<Instant>,
    debounce: Debouncer<SessionUpdate>,
    updates_tx: mpsc::UnboundedSender<SessionUpdate>,
    updates_rx: mpsc::UnboundedReceiver<SessionUpdate>,
    pending_recenter: Option<f64>,
    outbox: Option<OutboxRepo>,
    /// Outbox rows restored into the queue and not yet acknowledged.
    restored_watermark: Option<i64>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl FeedSession {
    pub fn create(backend: Arc<dyn FeedBackend>, config: FeedConfig) -> Result<Self, SessionError> {
        if !config.item_height.is_finite() || config.item_height <= 0.0 {
            return Err(SessionError::InvalidConfig(format!(
                "item_height must be positive, got {}",
                config.item_height
            )));
        }
        if config.page_size == 0 {
            return Err(SessionError::InvalidConfig("page_size must be at least 1".into()));
        }

        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let id = SessionId::new();
        debug!(session_id = %id, backend = backend.name(), "session created");
        Ok(Self {
            id,
            batcher: EventBatcher::new(backend.clone(), config.flush_threshold),
            backend,
            geo: None,
            state: SessionState::Idle,
            pagination: PaginationController::new(),
            projection: Projection::default(),
            current_index: 0,
            favorites: FavoriteOverlay::default(),
            scroll: VirtualScroll::new(config.item_height),
            dwell_start: None,
            debounce: Debouncer::new(config.pagination_debounce(), updates_tx.clone()),
            updates_tx,
            updates_rx,
            pending_recenter: None,
            outbox: None,
            restored_watermark: None,
            metrics: None,
            config,
        })
    }

    /// Attach durable storage for undeliverable events. Anything stashed by
    /// an earlier session is queued ahead of this session's events and stays
    /// in storage until [`FeedSession::dispose`] delivers or re-stashes it.
    pub fn with_outbox(mut self, outbox: OutboxRepo) -> Result<Self, SessionError> {
        let stashed = outbox.load()?;
        if stashed.skipped > 0 {
            warn!(session_id = %self.id, skipped = stashed.skipped, "dropped undecodable stashed events");
            if let Some(m) = &self.metrics {
                m.counter_inc("feed.outbox.skipped_corrupt", &[], stashed.skipped as u64);
            }
        }
        if !stashed.events.is_empty() {
            info!(session_id = %self.id, count = stashed.events.len(), "restored stashed events");
            self.batcher.restore(stashed.events);
        }
        self.restored_watermark = stashed.watermark;
        self.outbox = Some(outbox);
        Ok(self)
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsRecorder>>) -> Self {
        self.batcher.set_metrics(metrics.clone());
        self.metrics = metrics;
        self
    }

    // ── Accessors ──

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    pub fn filter(&self) -> &FilterTag {
        self.projection.filter()
    }

    /// Current index, or `None` in the empty state.
    pub fn current_index(&self) -> Option<usize> {
        (!self.projection.is_empty()).then_some(self.current_index)
    }

    pub fn current_item(&self) -> Option<&FeedItem> {
        self.projection.item(self.pagination.items(), self.current_index)
    }

    pub fn filtered_items(&self) -> Vec<&FeedItem> {
        self.projection.items(self.pagination.items())
    }

    pub fn fetched_items(&self) -> &[FeedItem] {
        self.pagination.items()
    }

    pub fn is_favorite(&self, id: &ItemId) -> bool {
        self.favorites.contains(id)
    }

    pub fn pending_events(&self) -> &[FeedEvent] {
        self.batcher.pending()
    }

    pub fn pending_new_items(&self) -> usize {
        self.pagination.new_items().len()
    }

    pub fn has_more(&self) -> bool {
        self.pagination.has_more()
    }

    /// Offset the host must apply before reporting further scrolls.
    pub fn take_recenter(&mut self) -> Option<f64> {
        self.pending_recenter.take()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let current_item = self.current_item().map(|item| item.id.clone());
        SessionSnapshot {
            session_id: self.id.clone(),
            state: self.state,
            filter: self.filter().clone(),
            current_index: self.current_index(),
            current_favorited: current_item
                .as_ref()
                .is_some_and(|id| self.favorites.contains(id)),
            current_item,
            filtered_len: self.projection.len(),
            fetched_len: self.pagination.items().len(),
            has_more: self.pagination.has_more(),
            fetching_next: self.pagination.is_fetching_next(),
            refreshing: self.pagination.is_refreshing(),
            pending_events: self.batcher.len(),
            pending_new_items: self.pending_new_items(),
        }
    }

    // ── Lifecycle ──

    /// Start the session once a position fix is known.
    #[instrument(skip_all, fields(session_id = %self.id))]
    pub async fn open(&mut self, geo: GeoContext) -> Result<LoadOutcome, SessionError> {
        self.expect_state("open", &[SessionState::Idle])?;
        if !geo.radius_km.is_finite() || geo.radius_km < 0.0 {
            return Err(EventValidationError::InvalidRadius(geo.radius_km).into());
        }
        self.geo = Some(geo);
        self.load_feed(LoadMode::Initial).await
    }

    /// Re-fetch the first page and replace the fetched set.
    pub async fn refresh(&mut self) -> Result<LoadOutcome, SessionError> {
        self.load_feed(LoadMode::Initial).await
    }

    #[instrument(skip(self), fields(session_id = %self.id))]
    pub async fn load_feed(&mut self, mode: LoadMode) -> Result<LoadOutcome, SessionError> {
        let geo = match (self.state, self.geo) {
            (SessionState::TornDown, _) | (_, None) => {
                return Err(SessionError::InvalidState {
                    op: "load feed",
                    state: self.state,
                });
            }
            (_, Some(geo)) => geo,
        };

        let ticket = match mode {
            LoadMode::Initial => return self.load_first_page(geo).await,
            LoadMode::NextPage => self.pagination.begin_next_page(),
            LoadMode::BackgroundRefresh => {
                self.expect_state("refresh in background", &[SessionState::Ready])?;
                self.pagination.begin_refresh()
            }
        };
        let Some(ticket) = ticket else {
            return Ok(LoadOutcome::Skipped);
        };
        let request = self.page_request(geo, ticket.cursor().cloned());
        let result = self.backend.fetch_page(&request).await;
        self.apply_fetch(ticket, result).await
    }

    async fn load_first_page(&mut self, geo: GeoContext) -> Result<LoadOutcome, SessionError> {
        let previous = self.state;
        self.state = SessionState::Loading;
        let request = self.page_request(geo, None);

        let page = match self.backend.fetch_page(&request).await {
            Ok(page) => page,
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), "first page fetch failed");
                self.state = match previous {
                    SessionState::Ready => SessionState::Ready,
                    _ => SessionState::Idle,
                };
                return Ok(LoadOutcome::Failed);
            }
        };

        // The visible item is about to change; close its viewing first.
        self.close_dwell().await?;
        self.debounce.cancel();
        self.pagination.replace(page);
        self.count_page("initial");
        self.state = SessionState::Ready;

        let count = self.pagination.items().len();
        info!(count, has_more = self.pagination.has_more(), "feed loaded");
        self.reset_view().await?;
        Ok(LoadOutcome::Replaced(count))
    }

    /// Flush, stash what could not be delivered, and stop all timers.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub async fn dispose(&mut self) -> Result<DisposeReport, SessionError> {
        if self.state == SessionState::TornDown {
            return Ok(DisposeReport::default());
        }
        self.debounce.cancel();
        self.close_dwell().await?;
        self.pagination.invalidate();
        self.state = SessionState::TornDown;

        let mut report = DisposeReport::default();
        let watermark = self.restored_watermark.take();
        match self.batcher.flush().await {
            Ok(delivered) => {
                report.delivered = delivered;
                if let (Some(outbox), Some(up_to)) = (&self.outbox, watermark) {
                    if let Err(e) = outbox.ack(up_to) {
                        warn!(error = %e, "failed to clear delivered stashed events");
                    }
                }
            }
            Err(e) => {
                let leftover = self.batcher.take_pending();
                match &self.outbox {
                    Some(outbox) => match outbox.restash(&self.id, &leftover, watermark) {
                        Ok(stashed) => report.stashed = stashed,
                        Err(store_err) => {
                            warn!(error = %store_err, count = leftover.len(), "failed to stash events");
                            report.undelivered = leftover.len();
                        }
                    },
                    None => {
                        warn!(error = %e, count = leftover.len(), "final flush failed with no outbox");
                        report.undelivered = leftover.len();
                    }
                }
            }
        }
        info!(
            delivered = report.delivered,
            stashed = report.stashed,
            undelivered = report.undelivered,
            "session disposed"
        );
        Ok(report)
    }

    // ── User actions ──

    /// Report the container's scroll offset.
    pub async fn on_scroll(&mut self, offset: f64) -> Result<ScrollResponse, SessionError> {
        self.expect_state("scroll", &[SessionState::Ready])?;

        let frame = match self.scroll.observe(offset, self.projection.len()) {
            ScrollObservation::Empty => {
                return Ok(ScrollResponse {
                    real_index: None,
                    recenter_to: None,
                });
            }
            ScrollObservation::Suppressed => {
                return Ok(ScrollResponse {
                    real_index: Some(self.current_index),
                    recenter_to: None,
                });
            }
            ScrollObservation::Frame(frame) => frame,
        };

        if frame.real_index != self.current_index {
            let previous = self.current_index;
            self.close_dwell().await?;

            let direction = frame.direction.unwrap_or(if frame.real_index > previous {
                ScrollDirection::Next
            } else {
                ScrollDirection::Prev
            });
            let event_type = match direction {
                ScrollDirection::Next => FeedEventType::ScrollNext,
                ScrollDirection::Prev => FeedEventType::ScrollPrev,
            };
            if let Some(event) = self.visible_event(event_type, previous, None)? {
                self.batcher.record(event).await;
            }

            self.current_index = frame.real_index;
            self.begin_viewing().await?;
            self.maybe_prefetch();
        }

        Ok(ScrollResponse {
            real_index: Some(self.current_index),
            recenter_to: frame.recenter_to,
        })
    }

    /// Switch the active filter. The old item's dwell is recorded and the
    /// queue flushed before the new view is built.
    #[instrument(skip_all, fields(session_id = %self.id, filter = %filter))]
    pub async fn set_filter(&mut self, filter: FilterTag) -> Result<(), SessionError> {
        self.expect_state("change filter", &[SessionState::Ready])?;
        if *self.projection.filter() == filter {
            return Ok(());
        }

        self.close_dwell().await?;
        if let Err(e) = self.batcher.flush().await {
            debug!(error = %e, "flush before filter switch failed, events kept");
        }

        self.debounce.cancel();
        self.pagination.invalidate();
        self.projection = Projection::build(self.pagination.items(), filter);
        self.current_index = 0;
        self.pending_recenter = self.scroll.recenter(0, self.projection.len());
        self.begin_viewing().await?;
        self.maybe_prefetch();
        debug!(visible = self.projection.len(), "filter applied");
        Ok(())
    }

    /// Flip the favorite state of `id` optimistically and confirm it with
    /// the backend, rolling back on failure.
    #[instrument(skip_all, fields(session_id = %self.id, item_id = %id))]
    pub async fn toggle_favorite(&mut self, id: &ItemId) -> Result<ToggleOutcome, SessionError> {
        self.expect_state("toggle favorite", &[SessionState::Ready])?;
        let position = self
            .projection
            .unfiltered_position(id)
            .ok_or_else(|| SessionError::UnknownItem(id.clone()))?;

        // Nothing is on screen in the empty state, so nothing is recorded.
        let records_like = !self.favorites.contains(id) && !self.projection.is_empty();
        let like = match self.pagination.items().get(position) {
            Some(item) if records_like => Some(
                FeedEvent::builder(FeedEventType::Like, item, position, self.radius_km()).build()?,
            ),
            Some(_) => None,
            None => return Err(SessionError::UnknownItem(id.clone())),
        };

        let pending = self.favorites.begin_toggle(id);
        if let Some(event) = like {
            self.batcher.record(event).await;
            if let Err(e) = self.batcher.flush().await {
                debug!(error = %e, "flush after like failed, events kept");
            }
        }

        let result = self.backend.set_favorite(id, pending.target()).await;
        let outcome = pending.settle(&mut self.favorites, result);
        if let ToggleOutcome::RolledBack { error, .. } = &outcome {
            warn!(error = %error, "favorite mutation failed, rolled back");
            if let Some(m) = &self.metrics {
                m.counter_inc("feed.favorites.rolled_back", &[("kind", error.error_kind())], 1);
            }
        }
        Ok(outcome)
    }

    /// Record that the current item's detail view was opened and flush.
    /// Returns the opened item.
    pub async fn open_detail(&mut self) -> Result<FeedItem, SessionError> {
        self.expect_state("open detail", &[SessionState::Ready])?;
        let item = self.current_item().cloned().ok_or(SessionError::NoItems)?;
        let event = FeedEvent::builder(
            FeedEventType::ViewOpen,
            &item,
            self.current_index,
            self.radius_km(),
        )
        .build()?;
        self.batcher.record(event).await;
        if let Err(e) = self.batcher.flush().await {
            debug!(error = %e, "flush on detail open failed, events kept");
        }
        Ok(item)
    }

    /// Deliver queued events now.
    pub async fn flush_events(&mut self) -> Result<usize, SessionError> {
        Ok(self.batcher.flush().await?)
    }

    /// Fetch the first page in the background. Unseen items are buffered
    /// until [`FeedSession::apply_new_items`].
    pub fn start_background_refresh(&mut self) -> Result<LoadOutcome, SessionError> {
        self.expect_state("refresh in background", &[SessionState::Ready])?;
        match self.pagination.begin_refresh() {
            Some(ticket) => {
                self.spawn_fetch(ticket)?;
                Ok(LoadOutcome::Started)
            }
            None => Ok(LoadOutcome::Skipped),
        }
    }

    /// Move buffered items to the top of the feed and jump there.
    pub async fn apply_new_items(&mut self) -> Result<usize, SessionError> {
        self.expect_state("apply new items", &[SessionState::Ready])?;
        if self.pagination.new_items().is_empty() {
            return Ok(0);
        }
        self.close_dwell().await?;
        let count = self.pagination.splice_new_items();
        info!(session_id = %self.id, count, "new items applied");
        self.reset_view().await?;
        Ok(count)
    }

    // ── Async plumbing ──

    /// Wait for the next timer or fetch result.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        self.updates_rx.recv().await
    }

    pub fn try_next_update(&mut self) -> Option<SessionUpdate> {
        self.updates_rx.try_recv().ok()
    }

    pub async fn handle_update(&mut self, update: SessionUpdate) -> Result<LoadOutcome, SessionError> {
        match update {
            SessionUpdate::PaginationDue { generation } => {
                if !self.debounce.fired(generation) || !self.prefetch_due() {
                    return Ok(LoadOutcome::Skipped);
                }
                match self.pagination.begin_next_page() {
                    Some(ticket) => {
                        self.spawn_fetch(ticket)?;
                        Ok(LoadOutcome::Started)
                    }
                    None => Ok(LoadOutcome::Skipped),
                }
            }
            SessionUpdate::PageFetched { ticket, result } => {
                if self.state == SessionState::TornDown {
                    return Ok(LoadOutcome::Stale);
                }
                self.apply_fetch(ticket, result).await
            }
        }
    }

    fn spawn_fetch(&self, ticket: FetchTicket) -> Result<(), SessionError> {
        let geo = self.geo.ok_or(SessionError::InvalidState {
            op: "fetch page",
            state: self.state,
        })?;
        let request = self.page_request(geo, ticket.cursor().cloned());
        let backend = self.backend.clone();
        let tx = self.updates_tx.clone();
        tokio::spawn(async move {
            let result = backend.fetch_page(&request).await;
            let _ = tx.send(SessionUpdate::PageFetched { ticket, result });
        });
        Ok(())
    }

    async fn apply_fetch(
        &mut self,
        ticket: FetchTicket,
        result: Result<FeedPage, BackendError>,
    ) -> Result<LoadOutcome, SessionError> {
        let kind = ticket.kind();
        match self.pagination.complete(ticket, result) {
            PageOutcome::Appended(added) => {
                self.count_page("next_page");
                if added > 0 {
                    self.reproject_after_append().await?;
                }
                Ok(LoadOutcome::Appended(added))
            }
            PageOutcome::Buffered(buffered) => {
                self.count_page("refresh");
                debug!(session_id = %self.id, buffered, "background refresh buffered items");
                Ok(LoadOutcome::Buffered(buffered))
            }
            PageOutcome::Stale => {
                if let Some(m) = &self.metrics {
                    let label = match kind {
                        FetchKind::NextPage => "next_page",
                        FetchKind::BackgroundRefresh => "refresh",
                    };
                    m.counter_inc("feed.pages.discarded_stale", &[("kind", label)], 1);
                }
                Ok(LoadOutcome::Stale)
            }
            PageOutcome::Failed => Ok(LoadOutcome::Failed),
        }
    }

    // ── Internals ──

    fn expect_state(&self, op: &'static str, allowed: &[SessionState]) -> Result<(), SessionError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                op,
                state: self.state,
            })
        }
    }

    fn radius_km(&self) -> f64 {
        self.geo.map(|g| g.radius_km).unwrap_or_default()
    }

    fn page_request(&self, geo: GeoContext, cursor: Option<Cursor>) -> PageRequest {
        PageRequest {
            geo,
            limit: self.config.page_size,
            cursor,
        }
    }

    fn count_page(&self, kind: &str) {
        if let Some(m) = &self.metrics {
            m.counter_inc("feed.pages.loaded", &[("kind", kind)], 1);
        }
    }

    /// Event about the item at `index` of the filtered sequence.
    fn visible_event(
        &self,
        event_type: FeedEventType,
        index: usize,
        dwell_ms: Option<u64>,
    ) -> Result<Option<FeedEvent>, SessionError> {
        let Some(item) = self.projection.item(self.pagination.items(), index) else {
            return Ok(None);
        };
        let mut builder = FeedEvent::builder(event_type, item, index, self.radius_km());
        if let Some(ms) = dwell_ms {
            builder = builder.dwell_ms(ms);
        }
        Ok(Some(builder.build()?))
    }

    /// Impression for the current index; starts its dwell clock.
    async fn begin_viewing(&mut self) -> Result<(), SessionError> {
        match self.visible_event(FeedEventType::Impression, self.current_index, None)? {
            Some(event) => {
                self.batcher.record(event).await;
                self.dwell_start = Some(Instant::now());
            }
            None => self.dwell_start = None,
        }
        Ok(())
    }

    /// Impression carrying the dwell of the current viewing. At most once per viewing.
    async fn close_dwell(&mut self) -> Result<(), SessionError> {
        let Some(started) = self.dwell_start.take() else {
            return Ok(());
        };
        let dwell_ms = started.elapsed().as_millis() as u64;
        if let Some(m) = &self.metrics {
            m.histogram_observe("feed.dwell_ms", &[], dwell_ms as f64);
        }
        if let Some(event) =
            self.visible_event(FeedEventType::Impression, self.current_index, Some(dwell_ms))?
        {
            self.batcher.record(event).await;
        }
        Ok(())
    }

    /// Rebuild the view from scratch at index 0.
    async fn reset_view(&mut self) -> Result<(), SessionError> {
        let filter = self.projection.filter().clone();
        self.projection = Projection::build(self.pagination.items(), filter);
        self.current_index = 0;
        self.pending_recenter = self.scroll.recenter(0, self.projection.len());
        self.begin_viewing().await?;
        self.maybe_prefetch();
        Ok(())
    }

    /// Appends never move existing items, so the current index survives.
    /// The sequence length changed, so the middle copy moved.
    async fn reproject_after_append(&mut self) -> Result<(), SessionError> {
        let was_empty = self.projection.is_empty();
        let filter = self.projection.filter().clone();
        self.projection = Projection::build(self.pagination.items(), filter);
        if self.projection.is_empty() {
            self.maybe_prefetch();
            return Ok(());
        }
        if was_empty {
            self.current_index = 0;
            self.pending_recenter = self.scroll.recenter(0, self.projection.len());
            self.begin_viewing().await?;
        } else {
            self.pending_recenter = self
                .scroll
                .recenter(self.current_index, self.projection.len());
        }
        self.maybe_prefetch();
        Ok(())
    }

    fn prefetch_due(&self) -> bool {
        if self.state != SessionState::Ready
            || !self.pagination.has_more()
            || self.pagination.is_fetching_next()
        {
            return false;
        }
        let len = self.projection.len();
        len == 0 || self.current_index.saturating_add(self.config.prefetch_distance) >= len
    }

    fn maybe_prefetch(&mut self) {
        if self.prefetch_due() {
            self.debounce
                .schedule(|generation| SessionUpdate::PaginationDue { generation });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use feed_client::{MockBackend, MockPage};
    use feed_store::Database;

    const H: f64 = 100.0;

    fn config() -> FeedConfig {
        FeedConfig {
            item_height: H,
            ..FeedConfig::default()
        }
    }

    fn geo() -> GeoContext {
        GeoContext::new(52.5, 13.4, 10.0)
    }

    fn ids(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{prefix}{i}")).collect()
    }

    fn page_of(ids: &[String], next: Option<&str>) -> MockPage {
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        MockPage::of(&refs, next)
    }

    /// Ten items where only item2 and item7 are free.
    fn ten_with_free() -> MockPage {
        let items = (0..10)
            .map(|i| {
                let mut item = MockBackend::item(&format!("item{i}"));
                item.is_free_giveaway = i == 2 || i == 7;
                item
            })
            .collect();
        MockPage::Page(FeedPage {
            items,
            next_cursor: None,
            has_more: false,
        })
    }

    async fn opened(mock: &Arc<MockBackend>) -> FeedSession {
        let mut session = FeedSession::create(mock.clone(), config()).unwrap();
        let outcome = session.open(geo()).await.unwrap();
        assert!(matches!(outcome, LoadOutcome::Replaced(_)));
        // Host applies the initial centering and echoes it back.
        let offset = session.take_recenter().unwrap();
        assert_eq!(
            session.on_scroll(offset).await.unwrap().recenter_to,
            None
        );
        session
    }

    fn kinds(events: &[FeedEvent]) -> Vec<(FeedEventType, &str, usize, Option<u64>)> {
        events
            .iter()
            .map(|e| (e.event_type, e.ad_id.as_str(), e.position_index, e.dwell_time_ms))
            .collect()
    }

    #[tokio::test]
    async fn open_records_initial_impression() {
        let mock = Arc::new(MockBackend::new(vec![page_of(&ids("item", 3), None)]));
        let session = opened(&mock).await;
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.current_index(), Some(0));
        assert_eq!(
            kinds(session.pending_events()),
            [(FeedEventType::Impression, "item0", 0, None)]
        );
        let request = &mock.page_requests()[0];
        assert_eq!(request.cursor, None);
        assert_eq!(request.limit, 20);
        assert_eq!(request.geo, geo());
    }

    #[tokio::test(start_paused = true)]
    async fn scroll_emits_dwell_then_direction_then_impression() {
        let mock = Arc::new(MockBackend::new(vec![page_of(&ids("item", 10), None)]));
        let mut session = opened(&mock).await;
        session.flush_events().await.unwrap();

        tokio::time::advance(Duration::from_millis(2500)).await;
        let response = session.on_scroll(11.0 * H).await.unwrap();
        assert_eq!(response.real_index, Some(1));

        assert_eq!(
            kinds(session.pending_events()),
            [
                (FeedEventType::Impression, "item0", 0, Some(2500)),
                (FeedEventType::ScrollNext, "item0", 0, None),
                (FeedEventType::Impression, "item1", 1, None),
            ]
        );
        assert!(session.pending_events().iter().all(|e| e.radius_km == 10.0));
    }

    #[tokio::test(start_paused = true)]
    async fn filter_switch_flushes_old_dwell_before_new_view() {
        let mock = Arc::new(MockBackend::new(vec![ten_with_free()]));
        let mut session = opened(&mock).await;
        session.on_scroll(11.0 * H).await.unwrap();
        tokio::time::advance(Duration::from_millis(800)).await;

        session.set_filter(FilterTag::Free).await.unwrap();

        let delivered = mock.delivered_events();
        let last = delivered.last().unwrap();
        assert_eq!(last.ad_id.as_str(), "item1");
        assert_eq!(last.dwell_time_ms, Some(800));

        let visible: Vec<&str> = session.filtered_items().iter().map(|i| i.id.as_str()).collect();
        assert_eq!(visible, ["item2", "item7"]);
        assert_eq!(session.current_index(), Some(0));
        assert_eq!(
            kinds(session.pending_events()),
            [(FeedEventType::Impression, "item2", 0, None)]
        );

        // The like position still resolves against the unfiltered set.
        session.toggle_favorite(&ItemId::from_raw("item2")).await.unwrap();
        let like = mock
            .delivered_events()
            .into_iter()
            .find(|e| e.event_type == FeedEventType::Like)
            .unwrap();
        assert_eq!(like.position_index, 2);
    }

    #[tokio::test]
    async fn recenter_rewrite_is_silent() {
        let mock = Arc::new(MockBackend::new(vec![page_of(&ids("item", 5), None)]));
        let mut session = opened(&mock).await;
        session.on_scroll(6.0 * H).await.unwrap();
        let before = session.pending_events().len();

        // Row 1 shows the same item as row 6, but sits in the first copy.
        let response = session.on_scroll(1.0 * H).await.unwrap();
        assert_eq!(response.real_index, Some(1));
        assert_eq!(response.recenter_to, Some(6.0 * H));

        let echo = session.on_scroll(6.0 * H).await.unwrap();
        assert_eq!(echo.real_index, Some(1));
        assert_eq!(session.pending_events().len(), before);
    }

    #[tokio::test]
    async fn failed_favorite_rolls_back_after_flushing_like() {
        let mock = Arc::new(MockBackend::new(vec![MockPage::of(&["A", "B"], None)]));
        mock.fail_next_favorite(BackendError::NetworkError("offline".into()));
        let metrics = Arc::new(MetricsRecorder::new());
        let mut session = FeedSession::create(mock.clone(), config())
            .unwrap()
            .with_metrics(Some(metrics.clone()));
        session.open(geo()).await.unwrap();

        let id = ItemId::from_raw("A");
        let outcome = session.toggle_favorite(&id).await.unwrap();

        assert!(outcome.is_rolled_back());
        assert!(!session.is_favorite(&id));
        assert_eq!(mock.favorite_calls(), [(id.clone(), true)]);
        let like = mock
            .delivered_events()
            .into_iter()
            .find(|e| e.event_type == FeedEventType::Like)
            .unwrap();
        assert_eq!(like.ad_id, id);
        assert!(session.pending_events().is_empty());
        assert_eq!(
            metrics.counter_get("feed.favorites.rolled_back", &[("kind", "network_error")]),
            1
        );
    }

    #[tokio::test]
    async fn unfavorite_sends_no_like() {
        let mock = Arc::new(MockBackend::new(vec![MockPage::of(&["A"], None)]));
        let mut session = opened(&mock).await;
        let id = ItemId::from_raw("A");
        session.toggle_favorite(&id).await.unwrap();
        let sent = mock.delivered_events().len();

        let outcome = session.toggle_favorite(&id).await.unwrap();
        assert!(matches!(outcome, ToggleOutcome::Committed { favorited: false }));
        assert_eq!(mock.delivered_events().len(), sent);
        assert_eq!(mock.favorite_calls().last(), Some(&(id, false)));
    }

    #[tokio::test]
    async fn toggling_unknown_item_is_an_error() {
        let mock = Arc::new(MockBackend::new(vec![MockPage::of(&["A"], None)]));
        let mut session = opened(&mock).await;
        let err = session.toggle_favorite(&ItemId::from_raw("zzz")).await.unwrap_err();
        assert!(matches!(err, SessionError::UnknownItem(_)));
        assert!(mock.favorite_calls().is_empty());
    }

    #[tokio::test]
    async fn threshold_flush_keeps_fifo_across_scrolls() {
        let mock = Arc::new(MockBackend::new(vec![page_of(&ids("item", 10), None)]));
        let mut session = opened(&mock).await;
        session.on_scroll(11.0 * H).await.unwrap();
        assert_eq!(session.pending_events().len(), 4);
        assert_eq!(mock.send_attempts(), 0);

        session.on_scroll(12.0 * H).await.unwrap();
        let batches = mock.delivered_batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(
            kinds(&batches[0]).iter().map(|k| (k.0, k.2)).collect::<Vec<_>>(),
            [
                (FeedEventType::Impression, 0),
                (FeedEventType::Impression, 0),
                (FeedEventType::ScrollNext, 0),
                (FeedEventType::Impression, 1),
                (FeedEventType::Impression, 1),
            ]
        );
        assert_eq!(session.pending_events().len(), 2);
    }

    #[tokio::test]
    async fn index_stays_in_bounds_under_scroll_and_filter() {
        let mock = Arc::new(MockBackend::new(vec![ten_with_free()]));
        let mut session = opened(&mock).await;
        let filters = [FilterTag::All, FilterTag::Free, FilterTag::Farmer, FilterTag::All];
        let mut offset = session.take_recenter().unwrap_or(10.0 * H);

        for (round, filter) in filters.into_iter().enumerate() {
            session.set_filter(filter).await.unwrap();
            if let Some(to) = session.take_recenter() {
                offset = to;
                session.on_scroll(offset).await.unwrap();
            }
            for step in 0..40 {
                offset += if (step + round) % 4 == 0 { -H } else { H };
                let response = session.on_scroll(offset).await.unwrap();
                let len = session.filtered_items().len();
                match response.real_index {
                    Some(idx) => assert!(idx < len),
                    None => assert_eq!(len, 0),
                }
                if let Some(to) = response.recenter_to {
                    offset = to;
                    session.on_scroll(offset).await.unwrap();
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn one_dwell_per_viewing() {
        let mock = Arc::new(MockBackend::new(vec![page_of(&ids("item", 4), None)]));
        let mut session = opened(&mock).await;
        let mut offset = 4.0 * H;
        let mut transitions = 0;
        for _ in 0..9 {
            tokio::time::advance(Duration::from_millis(100)).await;
            offset += H;
            let response = session.on_scroll(offset).await.unwrap();
            transitions += 1;
            if let Some(to) = response.recenter_to {
                offset = to;
                session.on_scroll(offset).await.unwrap();
            }
        }
        session.dispose().await.unwrap();

        let with_dwell = mock
            .delivered_events()
            .iter()
            .filter(|e| e.dwell_time_ms.is_some())
            .count();
        // One per scroll transition plus the final viewing closed on dispose.
        assert_eq!(with_dwell, transitions + 1);
    }

    #[tokio::test]
    async fn reselecting_filter_restores_order() {
        let mock = Arc::new(MockBackend::new(vec![ten_with_free()]));
        let mut session = opened(&mock).await;
        let before: Vec<ItemId> = session.fetched_items().iter().map(|i| i.id.clone()).collect();

        session.set_filter(FilterTag::Free).await.unwrap();
        session.set_filter(FilterTag::All).await.unwrap();

        let after: Vec<ItemId> = session.filtered_items().iter().map(|i| i.id.clone()).collect();
        assert_eq!(before, after);
        assert_eq!(session.fetched_items().len(), 10);
    }

    #[tokio::test]
    async fn empty_filter_result_records_nothing() {
        let mock = Arc::new(MockBackend::new(vec![page_of(&ids("item", 3), None)]));
        let mut session = opened(&mock).await;
        session.set_filter(FilterTag::Farmer).await.unwrap();
        assert_eq!(session.current_index(), None);
        assert!(session.pending_events().is_empty());

        let response = session.on_scroll(500.0).await.unwrap();
        assert_eq!(response.real_index, None);
        assert!(session.pending_events().is_empty());
        assert!(matches!(session.open_detail().await, Err(SessionError::NoItems)));
    }

    #[tokio::test(start_paused = true)]
    async fn scroll_burst_near_end_fetches_once() {
        let mock = Arc::new(MockBackend::new(vec![
            page_of(&ids("item", 6), Some("c1")),
            page_of(&ids("more", 6), None),
        ]));
        let mut session = opened(&mock).await;
        for row in 8..=11 {
            session.on_scroll(row as f64 * H).await.unwrap();
        }

        let update = session.next_update().await.unwrap();
        assert!(matches!(update, SessionUpdate::PaginationDue { .. }));
        assert_eq!(session.handle_update(update).await.unwrap(), LoadOutcome::Started);
        assert!(session.snapshot().fetching_next);

        let update = session.next_update().await.unwrap();
        assert_eq!(session.handle_update(update).await.unwrap(), LoadOutcome::Appended(6));
        assert_eq!(session.fetched_items().len(), 12);
        assert!(session.try_next_update().is_none());

        let requests = mock.page_requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].cursor, Some(Cursor::from_raw("c1")));
        // The middle copy moved with the new length.
        assert_eq!(session.take_recenter(), Some((12 + 5) as f64 * H));
    }

    #[tokio::test(start_paused = true)]
    async fn page_from_before_filter_switch_is_discarded() {
        let mock = Arc::new(MockBackend::new(vec![
            page_of(&ids("item", 4), Some("c1")),
            MockPage::delayed(Duration::from_millis(500), page_of(&ids("late", 4), None)),
        ]));
        let metrics = Arc::new(MetricsRecorder::new());
        let mut session = FeedSession::create(mock.clone(), config())
            .unwrap()
            .with_metrics(Some(metrics.clone()));
        session.open(geo()).await.unwrap();

        let update = session.next_update().await.unwrap();
        assert_eq!(session.handle_update(update).await.unwrap(), LoadOutcome::Started);

        session.set_filter(FilterTag::Discounted).await.unwrap();

        let update = session.next_update().await.unwrap();
        assert_eq!(session.handle_update(update).await.unwrap(), LoadOutcome::Stale);
        assert_eq!(session.fetched_items().len(), 4);
        assert!(!session.snapshot().fetching_next);
        assert_eq!(
            metrics.counter_get("feed.pages.discarded_stale", &[("kind", "next_page")]),
            1
        );
    }

    #[tokio::test]
    async fn failed_next_page_keeps_cursor() {
        let mock = Arc::new(MockBackend::new(vec![
            page_of(&ids("item", 10), Some("c1")),
            MockPage::Error(BackendError::ServerError { status: 502, body: String::new() }),
            page_of(&ids("more", 2), None),
        ]));
        let mut session = opened(&mock).await;

        assert_eq!(session.load_feed(LoadMode::NextPage).await.unwrap(), LoadOutcome::Failed);
        assert!(session.has_more());
        assert_eq!(session.load_feed(LoadMode::NextPage).await.unwrap(), LoadOutcome::Appended(2));
        assert!(!session.has_more());
        assert_eq!(session.load_feed(LoadMode::NextPage).await.unwrap(), LoadOutcome::Skipped);
        assert_eq!(mock.page_requests()[2].cursor, Some(Cursor::from_raw("c1")));
    }

    #[tokio::test]
    async fn background_refresh_buffers_then_splices() {
        let mock = Arc::new(MockBackend::new(vec![
            page_of(&ids("item", 3), None),
            MockPage::of(&["new0", "item0", "new1"], None),
        ]));
        let mut session = opened(&mock).await;
        session.on_scroll(4.0 * H).await.unwrap();

        assert_eq!(session.start_background_refresh().unwrap(), LoadOutcome::Started);
        let update = session.next_update().await.unwrap();
        assert_eq!(session.handle_update(update).await.unwrap(), LoadOutcome::Buffered(2));
        assert_eq!(session.pending_new_items(), 2);
        assert_eq!(session.fetched_items().len(), 3);
        assert_eq!(session.current_item().unwrap().id.as_str(), "item1");

        assert_eq!(session.apply_new_items().await.unwrap(), 2);
        assert_eq!(session.current_index(), Some(0));
        assert_eq!(session.current_item().unwrap().id.as_str(), "new0");
        assert_eq!(session.take_recenter(), Some(5.0 * H));
        assert_eq!(session.pending_new_items(), 0);
    }

    #[tokio::test]
    async fn refresh_replaces_feed() {
        let mock = Arc::new(MockBackend::new(vec![
            page_of(&ids("item", 3), None),
            page_of(&ids("fresh", 2), None),
        ]));
        let mut session = opened(&mock).await;
        session.on_scroll(4.0 * H).await.unwrap();

        assert_eq!(session.refresh().await.unwrap(), LoadOutcome::Replaced(2));
        assert_eq!(session.current_item().unwrap().id.as_str(), "fresh0");
        let last = session.pending_events().last().unwrap();
        assert_eq!(last.ad_id.as_str(), "fresh0");
        assert_eq!(last.event_type, FeedEventType::Impression);
    }

    #[tokio::test]
    async fn failed_open_returns_to_idle() {
        let mock = Arc::new(MockBackend::new(vec![
            MockPage::Error(BackendError::NetworkError("offline".into())),
            page_of(&ids("item", 2), None),
        ]));
        let mut session = FeedSession::create(mock.clone(), config()).unwrap();
        assert_eq!(session.open(geo()).await.unwrap(), LoadOutcome::Failed);
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.pending_events().is_empty());

        assert_eq!(session.refresh().await.unwrap(), LoadOutcome::Replaced(2));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn open_detail_records_view_open() {
        let mock = Arc::new(MockBackend::new(vec![page_of(&ids("item", 3), None)]));
        let mut session = opened(&mock).await;
        let item = session.open_detail().await.unwrap();
        assert_eq!(item.id.as_str(), "item0");
        let last = mock.delivered_events().pop().unwrap();
        assert_eq!(last.event_type, FeedEventType::ViewOpen);
        assert!(session.pending_events().is_empty());
    }

    #[tokio::test]
    async fn operations_rejected_outside_ready() {
        let mock = Arc::new(MockBackend::new(vec![]));
        let mut session = FeedSession::create(mock, config()).unwrap();
        assert!(matches!(
            session.on_scroll(0.0).await,
            Err(SessionError::InvalidState { op: "scroll", state: SessionState::Idle })
        ));
        assert!(matches!(
            session.load_feed(LoadMode::NextPage).await,
            Err(SessionError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_inputs_are_rejected() {
        let mock = Arc::new(MockBackend::new(vec![]));
        let bad = FeedConfig {
            item_height: 0.0,
            ..FeedConfig::default()
        };
        assert!(matches!(
            FeedSession::create(mock.clone(), bad),
            Err(SessionError::InvalidConfig(_))
        ));

        let mut session = FeedSession::create(mock.clone(), config()).unwrap();
        let err = session.open(GeoContext::new(0.0, 0.0, -1.0)).await.unwrap_err();
        assert!(matches!(err, SessionError::Event(_)));
        assert!(mock.page_requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_stashes_then_next_session_restores() {
        let db = Database::in_memory().unwrap();
        let mock = Arc::new(MockBackend::new(vec![page_of(&ids("item", 3), None)]));
        let mut session = FeedSession::create(mock.clone(), config())
            .unwrap()
            .with_outbox(OutboxRepo::new(db.clone()))
            .unwrap();
        session.open(geo()).await.unwrap();

        mock.fail_next_send(BackendError::Timeout(Duration::from_secs(5)));
        let report = session.dispose().await.unwrap();
        assert_eq!(report.stashed, 2);
        assert_eq!(report.delivered, 0);
        assert_eq!(session.state(), SessionState::TornDown);
        assert_eq!(session.dispose().await.unwrap(), DisposeReport::default());

        let mut next = FeedSession::create(mock.clone(), config())
            .unwrap()
            .with_outbox(OutboxRepo::new(db.clone()))
            .unwrap();
        assert_eq!(
            kinds(next.pending_events()),
            [
                (FeedEventType::Impression, "item0", 0, None),
                (FeedEventType::Impression, "item0", 0, Some(0)),
            ]
        );
        // Held in storage until delivered.
        assert_eq!(OutboxRepo::new(db.clone()).count().unwrap(), 2);

        assert_eq!(next.dispose().await.unwrap().delivered, 2);
        assert_eq!(OutboxRepo::new(db).count().unwrap(), 0);
    }

    #[tokio::test]
    async fn corrupt_stashed_row_does_not_block_restore() {
        let db = Database::in_memory().unwrap();
        let outbox = OutboxRepo::new(db.clone());
        let item = MockBackend::item("kept");
        let event = FeedEvent::builder(FeedEventType::Impression, &item, 0, 10.0)
            .build()
            .unwrap();
        outbox.stash(&SessionId::new(), &[event]).unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO event_outbox (session_id, payload, created_at) VALUES ('s', '{', 'now')",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let mock = Arc::new(MockBackend::new(vec![]));
        let metrics = Arc::new(MetricsRecorder::new());
        let mut session = FeedSession::create(mock.clone(), config())
            .unwrap()
            .with_metrics(Some(metrics.clone()))
            .with_outbox(outbox.clone())
            .unwrap();
        assert_eq!(
            kinds(session.pending_events()),
            [(FeedEventType::Impression, "kept", 0, None)]
        );
        assert_eq!(metrics.counter_get("feed.outbox.skipped_corrupt", &[]), 1);

        session.dispose().await.unwrap();
        assert_eq!(mock.delivered_events().len(), 1);
        assert_eq!(outbox.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_dispose_restashes_restored_events_once() {
        let db = Database::in_memory().unwrap();
        let outbox = OutboxRepo::new(db);
        let item = MockBackend::item("old");
        let event = FeedEvent::builder(FeedEventType::Impression, &item, 0, 10.0)
            .build()
            .unwrap();
        outbox.stash(&SessionId::new(), &[event]).unwrap();

        let mock = Arc::new(MockBackend::new(vec![]));
        mock.fail_next_send(BackendError::NetworkError("offline".into()));
        let mut session = FeedSession::create(mock, config())
            .unwrap()
            .with_outbox(outbox.clone())
            .unwrap();
        assert_eq!(session.dispose().await.unwrap().stashed, 1);
        assert_eq!(outbox.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn forward_scroll_before_jump_lands_reads_as_next() {
        let mock = Arc::new(MockBackend::new(vec![page_of(&ids("item", 5), None)]));
        let mut session = opened(&mock).await;

        let response = session.on_scroll(2.0 * H).await.unwrap();
        assert_eq!(response.recenter_to, Some(7.0 * H));

        // The host has not applied the jump yet and the user keeps going.
        let response = session.on_scroll(3.0 * H).await.unwrap();
        assert_eq!(response.real_index, Some(3));

        let mut events = mock.delivered_events();
        events.extend(session.pending_events().iter().cloned());
        let tail: Vec<_> = kinds(&events[events.len() - 2..])
            .into_iter()
            .map(|(kind, id, pos, _)| (kind, id.to_string(), pos))
            .collect();
        assert_eq!(
            tail,
            [
                (FeedEventType::ScrollNext, "item2".to_string(), 2),
                (FeedEventType::Impression, "item3".to_string(), 3),
            ]
        );
    }

    #[tokio::test]
    async fn filter_switch_survives_failed_flush() {
        let mock = Arc::new(MockBackend::new(vec![ten_with_free()]));
        let mut session = opened(&mock).await;
        session.on_scroll(11.0 * H).await.unwrap();
        for _ in 0..3 {
            mock.fail_next_send(BackendError::NetworkError("offline".into()));
        }

        session.set_filter(FilterTag::Free).await.unwrap();

        assert_eq!(session.filter(), &FilterTag::Free);
        assert_eq!(session.current_item().unwrap().id.as_str(), "item2");
        assert!(mock.delivered_events().is_empty());
        let queued: Vec<_> = kinds(session.pending_events())
            .into_iter()
            .map(|(kind, id, pos, dwell)| (kind, id.to_string(), pos, dwell.is_some()))
            .collect();
        assert_eq!(
            queued,
            [
                (FeedEventType::Impression, "item0".to_string(), 0, false),
                (FeedEventType::Impression, "item0".to_string(), 0, true),
                (FeedEventType::ScrollNext, "item0".to_string(), 0, false),
                (FeedEventType::Impression, "item1".to_string(), 1, false),
                (FeedEventType::Impression, "item1".to_string(), 1, true),
                (FeedEventType::Impression, "item2".to_string(), 0, false),
            ]
        );

        assert_eq!(session.flush_events().await.unwrap(), 6);
        assert_eq!(mock.delivered_batches().len(), 1);
    }

    #[tokio::test]
    async fn like_stays_queued_when_flush_fails() {
        let mock = Arc::new(MockBackend::new(vec![MockPage::of(&["A", "B"], None)]));
        let mut session = opened(&mock).await;
        mock.fail_next_send(BackendError::ServerError { status: 503, body: String::new() });

        let id = ItemId::from_raw("A");
        let outcome = session.toggle_favorite(&id).await.unwrap();

        assert!(matches!(outcome, ToggleOutcome::Committed { favorited: true }));
        assert!(session.is_favorite(&id));
        assert_eq!(mock.favorite_calls(), [(id, true)]);
        assert_eq!(
            kinds(session.pending_events()),
            [
                (FeedEventType::Impression, "A", 0, None),
                (FeedEventType::Like, "A", 0, None),
            ]
        );
    }

    #[tokio::test]
    async fn favorite_in_empty_view_records_no_like() {
        let mock = Arc::new(MockBackend::new(vec![page_of(&ids("item", 3), None)]));
        let mut session = opened(&mock).await;
        session.set_filter(FilterTag::Farmer).await.unwrap();

        let id = ItemId::from_raw("item1");
        let outcome = session.toggle_favorite(&id).await.unwrap();

        assert!(matches!(outcome, ToggleOutcome::Committed { favorited: true }));
        assert_eq!(mock.favorite_calls(), [(id, true)]);
        assert!(session.pending_events().is_empty());
        assert!(mock
            .delivered_events()
            .iter()
            .all(|e| e.event_type != FeedEventType::Like));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_from_before_filter_switch_is_discarded() {
        let mock = Arc::new(MockBackend::new(vec![
            page_of(&ids("item", 3), None),
            MockPage::delayed(Duration::from_millis(500), MockPage::of(&["new0"], None)),
        ]));
        let mut session = opened(&mock).await;

        assert_eq!(session.start_background_refresh().unwrap(), LoadOutcome::Started);
        session.set_filter(FilterTag::Discounted).await.unwrap();

        let update = session.next_update().await.unwrap();
        assert_eq!(session.handle_update(update).await.unwrap(), LoadOutcome::Stale);
        assert_eq!(session.pending_new_items(), 0);
        assert!(!session.snapshot().refreshing);
    }

    #[tokio::test]
    async fn prefetch_starts_three_from_the_end() {
        let mock = Arc::new(MockBackend::new(vec![page_of(&ids("item", 10), Some("c1"))]));
        let mut session = opened(&mock).await;
        assert!(!session.debounce.is_pending());

        // Middle copy spans rows 10..20.
        session.on_scroll(16.0 * H).await.unwrap();
        assert_eq!(session.current_index(), Some(6));
        assert!(!session.debounce.is_pending());

        session.on_scroll(17.0 * H).await.unwrap();
        assert_eq!(session.current_index(), Some(7));
        assert!(session.debounce.is_pending());
    }

    #[tokio::test]
    async fn huge_prefetch_distance_does_not_overflow() {
        let mock = Arc::new(MockBackend::new(vec![page_of(&ids("item", 4), Some("c1"))]));
        let config = FeedConfig {
            prefetch_distance: usize::MAX,
            ..config()
        };
        let mut session = FeedSession::create(mock, config).unwrap();
        session.open(geo()).await.unwrap();
        let offset = session.take_recenter().unwrap();
        session.on_scroll(offset).await.unwrap();

        session.on_scroll(offset + H).await.unwrap();
        assert_eq!(session.current_index(), Some(1));
        assert!(session.debounce.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_cancels_pending_pagination() {
        let mock = Arc::new(MockBackend::new(vec![page_of(&ids("item", 2), Some("c1"))]));
        let mut session = opened(&mock).await;
        assert!(session.debounce.is_pending());

        let report = session.dispose().await.unwrap();
        assert_eq!(report.delivered, 2);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(session.try_next_update().is_none());
        assert_eq!(mock.page_requests().len(), 1);
    }

    #[tokio::test]
    async fn snapshot_serializes_for_hosts() {
        let mock = Arc::new(MockBackend::new(vec![page_of(&ids("item", 3), None)]));
        let session = opened(&mock).await;
        let json = serde_json::to_value(session.snapshot()).unwrap();
        assert_eq!(json["state"], "ready");
        assert_eq!(json["filter"], "all");
        assert_eq!(json["currentItem"], "item0");
        assert_eq!(json["filteredLen"], 3);
    }
}
