//! Job lifecycle notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use eventing_core::{JobPath, JobProperties};

/// Lifecycle transition a notification reports.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationTopic {
    /// The executor acknowledged the job.
    Started,
    /// An attempt failed and the job will be retried.
    Failed,
    /// Retries are exhausted; the job will not run again.
    Cancelled,
    /// The job completed successfully.
    Finished,
}

impl NotificationTopic {
    /// Topic string used when notifications leave the process.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "eventing/notification/job/started",
            Self::Failed => "eventing/notification/job/failed",
            Self::Cancelled => "eventing/notification/job/cancelled",
            Self::Finished => "eventing/notification/job/finished",
        }
    }
}

impl core::fmt::Display for NotificationTopic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a job at the moment of a lifecycle transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobNotification {
    pub topic: NotificationTopic,
    pub job_path: JobPath,
    pub job_topic: String,
    pub job_id: Option<String>,
    pub retry_count: u32,
    pub properties: JobProperties,
    pub occurred_at: DateTime<Utc>,
}
