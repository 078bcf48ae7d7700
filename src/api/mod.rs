//! HTTP boundary: the triage service and its axum routes.

pub mod routes;
pub mod service;

pub use routes::triage_routes;
pub use service::{RequestContext, ServiceError, TriageService};
