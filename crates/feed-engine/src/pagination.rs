use std::collections::HashSet;

use tracing::{debug, warn};

use feed_core::errors::BackendError;
use feed_core::ids::{Cursor, ItemId};
use feed_core::item::{FeedItem, FeedPage};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchKind {
    NextPage,
    BackgroundRefresh,
}

/// Identifies one outstanding fetch and the context it was started under.
///
/// Results are matched back against the controller's current context; a
/// ticket from an older context produces [`PageOutcome::Stale`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchTicket {
    id: u64,
    kind: FetchKind,
    epoch: u64,
    cursor: Option<Cursor>,
}

impl FetchTicket {
    pub fn kind(&self) -> FetchKind {
        self.kind
    }

    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageOutcome {
    /// Next page merged; count of items actually added.
    Appended(usize),
    /// Background refresh parked this many unseen items in the buffer.
    Buffered(usize),
    /// Started under a context that no longer applies; dropped.
    Stale,
    Failed,
}

/// Owns the fetched set and everything about how it grows.
#[derive(Debug, Default)]
pub struct PaginationController {
    items: Vec<FeedItem>,
    known: HashSet<ItemId>,
    cursor: Option<Cursor>,
    has_more: bool,
    next_in_flight: Option<u64>,
    refresh_in_flight: Option<u64>,
    epoch: u64,
    next_ticket: u64,
    new_items: Vec<FeedItem>,
}

impl PaginationController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[FeedItem] {
        &self.items
    }

    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_fetching_next(&self) -> bool {
        self.next_in_flight.is_some()
    }

    pub fn is_refreshing(&self) -> bool {
        self.refresh_in_flight.is_some()
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.known.contains(id)
    }

    pub fn new_items(&self) -> &[FeedItem] {
        &self.new_items
    }

    /// Replace the fetched set with a first page.
    pub fn replace(&mut self, page: FeedPage) {
        self.items.clear();
        self.known.clear();
        self.new_items.clear();
        self.epoch += 1;
        self.cursor = page.next_cursor;
        self.has_more = page.has_more;
        self.append_unique(page.items);
    }

    /// Mark every outstanding fetch as stale without cancelling it.
    pub fn invalidate(&mut self) {
        self.epoch += 1;
    }

    /// Claim the next-page slot. `None` while a cursor fetch is in flight
    /// or the backend reported no more pages.
    pub fn begin_next_page(&mut self) -> Option<FetchTicket> {
        if self.next_in_flight.is_some() || !self.has_more || self.cursor.is_none() {
            return None;
        }
        let ticket = self.ticket(FetchKind::NextPage, self.cursor.clone());
        self.next_in_flight = Some(ticket.id);
        Some(ticket)
    }

    /// Claim the background-refresh slot. Independent of cursor fetches.
    pub fn begin_refresh(&mut self) -> Option<FetchTicket> {
        if self.refresh_in_flight.is_some() {
            return None;
        }
        let ticket = self.ticket(FetchKind::BackgroundRefresh, None);
        self.refresh_in_flight = Some(ticket.id);
        Some(ticket)
    }

    fn ticket(&mut self, kind: FetchKind, cursor: Option<Cursor>) -> FetchTicket {
        self.next_ticket += 1;
        FetchTicket {
            id: self.next_ticket,
            kind,
            epoch: self.epoch,
            cursor,
        }
    }

    /// Apply the result of a fetch started with `ticket`.
    pub fn complete(
        &mut self,
        ticket: FetchTicket,
        result: Result<FeedPage, BackendError>,
    ) -> PageOutcome {
        let slot = match ticket.kind {
            FetchKind::NextPage => &mut self.next_in_flight,
            FetchKind::BackgroundRefresh => &mut self.refresh_in_flight,
        };
        if *slot == Some(ticket.id) {
            *slot = None;
        }

        let page = match result {
            Ok(page) => page,
            Err(e) => {
                warn!(
                    kind = ?ticket.kind,
                    cursor = ?ticket.cursor,
                    error = %e,
                    "page fetch failed"
                );
                return PageOutcome::Failed;
            }
        };

        if ticket.epoch != self.epoch
            || (ticket.kind == FetchKind::NextPage && ticket.cursor != self.cursor)
        {
            debug!(kind = ?ticket.kind, "discarding stale page");
            return PageOutcome::Stale;
        }

        match ticket.kind {
            FetchKind::NextPage => {
                self.cursor = page.next_cursor;
                self.has_more = page.has_more;
                PageOutcome::Appended(self.append_unique(page.items))
            }
            FetchKind::BackgroundRefresh => {
                let mut buffered: HashSet<ItemId> =
                    self.new_items.iter().map(|i| i.id.clone()).collect();
                let before = self.new_items.len();
                for item in page.items {
                    if !self.known.contains(&item.id) && buffered.insert(item.id.clone()) {
                        self.new_items.push(item);
                    }
                }
                PageOutcome::Buffered(self.new_items.len() - before)
            }
        }
    }

    /// Move buffered items to the front of the fetched set. Returns how many moved.
    pub fn splice_new_items(&mut self) -> usize {
        let fresh: Vec<FeedItem> = std::mem::take(&mut self.new_items)
            .into_iter()
            .filter(|item| !self.known.contains(&item.id))
            .collect();
        let count = fresh.len();
        for item in &fresh {
            self.known.insert(item.id.clone());
        }
        self.items.splice(0..0, fresh);
        count
    }

    fn append_unique(&mut self, items: Vec<FeedItem>) -> usize {
        let before = self.items.len();
        for item in items {
            if self.known.insert(item.id.clone()) {
                self.items.push(item);
            }
        }
        self.items.len() - before
    }
}
