//! HTTP auth endpoint for reverse-proxy sub-requests

mod router;
mod server;

pub use router::{AppState, CLIENT_CERT_HEADER, ORIGINAL_URI_HEADER, create_router};
pub use server::Gateway;
