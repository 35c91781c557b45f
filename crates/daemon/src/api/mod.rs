/// REST API module for the VeilPort daemon
///
/// Read-only JSON endpoints reporting:
/// - Published hidden services with their dispatch counters
/// - Local proxy status

pub mod handlers;
pub mod responses;
pub mod server;

pub use handlers::AppState;
pub use responses::*;
pub use server::{router, ApiServer};
