//! Shield: protective actions against abusive authors.

pub mod action;
pub mod reincidence;

pub use action::{ShieldAction, ShieldActionType, ShieldStatus};
pub use reincidence::{OffenderState, RecommendedAction, ReincidenceOutcome, ReincidenceTracker};
