//! HTTP surface of the gateway

mod router;
mod server;

pub use router::{AppState, DEFAULT_TOP_K, MAX_QUERY_CHARS, MAX_TOP_K, RagRequest, create_router};
pub use server::Gateway;
