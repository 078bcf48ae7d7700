//! Outbound job queue consumed by platform workers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;

use crate::error::Error;
use crate::shield::action::ShieldAction;

/// Default channel capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Work for external workers. The engine never executes these itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Job {
    /// Execute (or, in dry run, record) a Shield action on the platform.
    Shield { action: ShieldAction },
    /// Generate roast variants. Manual roasts wait for approval before publishing.
    RoastGeneration {
        organization_id: String,
        comment_id: String,
        requires_approval: bool,
    },
    /// Post an educational reply to a first offender.
    CorrectiveReply {
        organization_id: String,
        comment_id: String,
        strike_count: u32,
    },
}

impl Job {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Shield { .. } => "shield",
            Self::RoastGeneration { .. } => "roast_generation",
            Self::CorrectiveReply { .. } => "corrective_reply",
        }
    }

    pub fn comment_id(&self) -> &str {
        match self {
            Self::Shield { action } => &action.comment_id,
            Self::RoastGeneration { comment_id, .. } | Self::CorrectiveReply { comment_id, .. } => {
                comment_id
            }
        }
    }
}

/// Producer side of the job channel.
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
}

impl JobQueue {
    /// Create a queue and the receiver workers drain.
    pub fn channel(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Job>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Arc::new(Self { tx }), rx)
    }

    /// Enqueue a job, waiting for capacity.
    pub async fn enqueue(&self, job: Job) -> Result<(), Error> {
        let label = job.label();
        let comment_id = job.comment_id().to_string();
        self.tx
            .send(job)
            .await
            .map_err(|_| Error::Internal("job queue closed".into()))?;
        info!(job = label, comment_id = %comment_id, "Job enqueued");
        Ok(())
    }
}
