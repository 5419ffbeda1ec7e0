pub mod batcher;
pub mod debounce;
pub mod error;
pub mod optimistic;
pub mod pagination;
pub mod projector;
pub mod session;
pub mod virtual_scroll;

pub use batcher::EventBatcher;
pub use error::SessionError;
pub use optimistic::{FavoriteOverlay, PendingToggle, ToggleOutcome};
pub use pagination::{FetchKind, FetchTicket, PageOutcome, PaginationController};
pub use projector::{project, Projection};
pub use session::{
    DisposeReport, FeedSession, LoadMode, LoadOutcome, ScrollResponse, SessionSnapshot,
    SessionState, SessionUpdate,
};
pub use virtual_scroll::{ScrollDirection, ScrollFrame, ScrollObservation, VirtualScroll};
