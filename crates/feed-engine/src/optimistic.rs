use std::collections::HashSet;

use feed_core::errors::BackendError;
use feed_core::ids::ItemId;

/// Favorited ids, held apart from the fetched items.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FavoriteOverlay {
    ids: HashSet<ItemId>,
}

impl FavoriteOverlay {
    pub fn contains(&self, id: &ItemId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn set(&mut self, id: &ItemId, favorited: bool) {
        if favorited {
            self.ids.insert(id.clone());
        } else {
            self.ids.remove(id);
        }
    }

    /// Flip `id` locally and return the pending half of the update.
    pub fn begin_toggle(&mut self, id: &ItemId) -> PendingToggle {
        let previous = self.contains(id);
        self.set(id, !previous);
        PendingToggle {
            item_id: id.clone(),
            previous,
        }
    }
}

/// A locally applied toggle awaiting the backend's verdict.
///
/// Consumed by [`PendingToggle::settle`], which either keeps the local state or
/// restores the value it had before [`FavoriteOverlay::begin_toggle`].
#[must_use = "an optimistic toggle must be settled with the mutation result"]
#[derive(Debug)]
pub struct PendingToggle {
    item_id: ItemId,
    previous: bool,
}

#[derive(Debug)]
pub enum ToggleOutcome {
    Committed { favorited: bool },
    RolledBack { favorited: bool, error: BackendError },
}

impl ToggleOutcome {
    pub fn favorited(&self) -> bool {
        match self {
            Self::Committed { favorited } | Self::RolledBack { favorited, .. } => *favorited,
        }
    }

    pub fn is_rolled_back(&self) -> bool {
        matches!(self, Self::RolledBack { .. })
    }
}

impl PendingToggle {
    pub fn item_id(&self) -> &ItemId {
        &self.item_id
    }

    /// The state the toggle is trying to reach.
    pub fn target(&self) -> bool {
        !self.previous
    }

    pub fn settle(
        self,
        overlay: &mut FavoriteOverlay,
        result: Result<(), BackendError>,
    ) -> ToggleOutcome {
        match result {
            Ok(()) => ToggleOutcome::Committed {
                favorited: self.target(),
            },
            Err(error) => {
                overlay.set(&self.item_id, self.previous);
                ToggleOutcome::RolledBack {
                    favorited: self.previous,
                    error,
                }
            }
        }
    }
}
