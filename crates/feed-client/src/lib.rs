pub mod http;
pub mod mock;

pub use http::{HttpBackend, HttpBackendConfig};
pub use mock::{MockBackend, MockPage};
