//! HTTP/SSE surface over the bridge.

pub mod routes;

pub use routes::{router, AppState};
