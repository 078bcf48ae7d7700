//! Platform ingestion pipeline.
//!
//! Every delivered comment flows through `CommentProcessor::process`:
//! dedup, triage, then side effects guarded so that each runs at most once
//! per comment. Jobs leave through `JobQueue` for external workers; nothing
//! is executed against a platform from here.

pub mod credits;
pub mod processor;
pub mod queue;

pub use credits::{CreditLedger, CreditReceipt, InMemoryCreditLedger, QuotaCheck};
pub use processor::{CommentProcessor, InboundComment, ProcessedComment};
pub use queue::{Job, JobQueue};
