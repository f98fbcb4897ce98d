//! REST API Server Module
//!
//! Exposes the oracle over HTTP: the health endpoint, registry and job
//! inspection, the attestation inbox used by peers, and operator controls
//! (pause, resume, re-drive).

mod generic;
mod jobs;

pub use generic::{ApiResponse, ApiServer};
pub use jobs::JobsQuery;
