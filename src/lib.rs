//! Triage & Shield: comment-moderation decision engine.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod locks;
pub mod pipeline;
pub mod policy;
pub mod scoring;
pub mod shield;
pub mod stats;
pub mod store;
pub mod triage;
