/// Offline-tolerant delivery of completion reports
///
/// Completion events become records in a queue owned by a single actor task.
/// The actor drains the queue whenever something is enqueued, on a retry
/// deadline, on a periodic timer and when connectivity comes back.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::ControlPayload;
use crate::route::CompletionEvent;

pub mod queue;

pub use queue::{DeliveryQueue, DeliveryQueueHandle};

/// Where completion reports go
#[async_trait]
pub trait ControlSink: Send + Sync {
    async fn deliver(&self, payload: &ControlPayload) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeliveryError {
    #[error("Device is not authorized to report for this route")]
    Unauthorized,
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Backend answered HTTP {0}")]
    Status(u16),
    #[error("Delivery attempt timed out")]
    Timeout,
}

impl DeliveryError {
    /// Permanent failures are never retried
    pub fn is_permanent(&self) -> bool {
        matches!(self, DeliveryError::Unauthorized)
    }
}

/// A completion event waiting to be delivered
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryRecord {
    pub id: String,
    pub event: CompletionEvent,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
}

impl DeliveryRecord {
    /// `sequence` keeps ids unique for events created within the same millisecond
    pub fn new(event: CompletionEvent, max_retries: u32, sequence: u64, created_at: DateTime<Utc>) -> Self {
        let id = format!(
            "{}_{}_{}-{}",
            event.assignment.device_id,
            event.waypoint_id,
            created_at.timestamp_millis(),
            sequence
        );

        Self {
            id,
            event,
            retry_count: 0,
            max_retries,
            created_at,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total: usize,
    /// Records that will be attempted again
    pub pending: usize,
    /// Records that used up their retries
    pub failed: usize,
}

impl QueueStats {
    pub fn from_records(records: &[DeliveryRecord]) -> Self {
        let failed = records.iter().filter(|r| r.is_exhausted()).count();
        Self {
            total: records.len(),
            pending: records.len() - failed,
            failed,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// User-visible delivery progress
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryNotice {
    Queued { id: String, waypoint: String },
    Delivered { id: String, waypoint: String },
    Retrying { id: String, waypoint: String, attempt: u32, error: String },
    /// Dropped after the last retry failed
    Exhausted { id: String, waypoint: String, attempts: u32 },
    /// Refused without a network attempt
    Rejected { id: String, waypoint: String },
}
