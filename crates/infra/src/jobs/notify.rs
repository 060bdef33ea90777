//! Job lifecycle notifications.

use chrono::Utc;
use tracing::warn;

use eventing_events::{EventBus, JobNotification, NotificationTopic};

use super::types::JobRecord;

/// Receives lifecycle notifications. Failures are the sink's problem: the
/// engine never blocks or retries on a notification.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: JobNotification);
}

impl<B> NotificationSink for B
where
    B: EventBus<JobNotification>,
{
    fn notify(&self, notification: JobNotification) {
        let topic = notification.topic;
        let path = notification.job_path.clone();
        if let Err(err) = self.publish(notification) {
            warn!(notification = %topic, job_path = %path, error = %err, "failed to publish job notification");
        }
    }
}

pub fn notification(topic: NotificationTopic, job: &JobRecord) -> JobNotification {
    JobNotification {
        topic,
        job_path: job.path.clone(),
        job_topic: job.topic.to_string(),
        job_id: job.id.clone(),
        retry_count: job.retry_count,
        properties: job.properties.clone(),
        occurred_at: Utc::now(),
    }
}
