use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs for a feed session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FeedConfig {
    /// Items requested per page.
    pub page_size: usize,
    /// Queue length at which the batcher flushes on its own.
    pub flush_threshold: usize,
    /// Fetch the next page once the index is this close to the end.
    pub prefetch_distance: usize,
    pub pagination_debounce_ms: u64,
    /// Height of one full-screen row, in the host's scroll units.
    pub item_height: f64,
}

impl FeedConfig {
    pub fn pagination_debounce(&self) -> Duration {
        Duration::from_millis(self.pagination_debounce_ms)
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            page_size: 20,
            flush_threshold: 5,
            prefetch_distance: 3,
            pagination_debounce_ms: 150,
            item_height: 800.0,
        }
    }
}
