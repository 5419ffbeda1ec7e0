use std::collections::HashMap;

use feed_core::filter::FilterTag;
use feed_core::ids::ItemId;
use feed_core::item::FeedItem;

/// Items of `fetched` that pass `filter`, in fetched order.
pub fn project<'a>(fetched: &'a [FeedItem], filter: &FilterTag) -> Vec<&'a FeedItem> {
    fetched.iter().filter(|item| filter.matches(item)).collect()
}

/// Position of every item in the unfiltered fetched set.
pub fn unfiltered_positions(fetched: &[FeedItem]) -> HashMap<ItemId, usize> {
    fetched
        .iter()
        .enumerate()
        .map(|(idx, item)| (item.id.clone(), idx))
        .collect()
}

/// Cached projection of the fetched set under one filter.
///
/// Holds indices into the fetched set rather than items, so it never owns or
/// reorders them. Rebuild whenever the fetched set or the filter changes.
#[derive(Clone, Debug, Default)]
pub struct Projection {
    filter: FilterTag,
    indices: Vec<usize>,
    positions: HashMap<ItemId, usize>,
}

impl Projection {
    pub fn build(fetched: &[FeedItem], filter: FilterTag) -> Self {
        let indices = fetched
            .iter()
            .enumerate()
            .filter(|(_, item)| filter.matches(item))
            .map(|(idx, _)| idx)
            .collect();
        Self {
            filter,
            indices,
            positions: unfiltered_positions(fetched),
        }
    }

    pub fn filter(&self) -> &FilterTag {
        &self.filter
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn item<'a>(&self, fetched: &'a [FeedItem], real_index: usize) -> Option<&'a FeedItem> {
        self.indices.get(real_index).and_then(|&idx| fetched.get(idx))
    }

    pub fn items<'a>(&self, fetched: &'a [FeedItem]) -> Vec<&'a FeedItem> {
        self.indices.iter().filter_map(|&idx| fetched.get(idx)).collect()
    }

    /// Index of `id` in the unfiltered fetched set.
    pub fn unfiltered_position(&self, id: &ItemId) -> Option<usize> {
        self.positions.get(id).copied()
    }
}
