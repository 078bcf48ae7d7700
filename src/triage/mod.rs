//! Comment triage: classification bands, pre-scoring screen and the engine
//! that turns a comment into a decision.

pub mod classify;
pub mod engine;
pub mod rules;
pub mod types;

pub use engine::TriageEngine;
pub use types::{
    AnalyzeOptions, Comment, CommentPayload, Decision, DecisionAction, Organization, Role,
    UserContext,
};
