//! Job submission requests.
//!
//! A [`JobRequest`] is built either fluently from code or from the reserved
//! properties of an incoming job event. Either way it is turned into a
//! pending [`JobRecord`] by [`JobRequest::into_record`].

use chrono::Utc;
use serde_json::Value;

use eventing_core::properties::{
    self, PROPERTY_APPLICATION, PROPERTY_JOB_ID, PROPERTY_JOB_PARALLEL, PROPERTY_JOB_QUEUE_MAX_PARALLEL,
    PROPERTY_JOB_QUEUE_NAME, PROPERTY_JOB_QUEUE_ORDERED, PROPERTY_JOB_RETRIES, PROPERTY_JOB_RETRY_COUNT,
    PROPERTY_JOB_RETRY_DELAY, PROPERTY_JOB_RUN_LOCAL, PROPERTY_JOB_TOPIC,
};
use eventing_core::{ApplicationId, EventingError, EventingResult, JobPath, JobProperties, Topic};

use super::types::{JobRecord, JobState, Parallelism, QueueOptions, RetryLimit};

/// An incoming job event: a bag of properties whose reserved keys describe
/// the job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobEvent {
    pub properties: JobProperties,
}

impl JobEvent {
    pub fn new(properties: JobProperties) -> Self {
        Self { properties }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// A job to submit.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub topic: Topic,
    pub id: Option<String>,
    pub properties: JobProperties,
    pub queue: Option<QueueOptions>,
    pub parallelism: Parallelism,
    /// `None` applies the configured default.
    pub retries: Option<RetryLimit>,
    pub retry_count: u32,
    pub retry_delay_ms: Option<u64>,
    pub run_local: bool,
    pub application: Option<ApplicationId>,
}

impl JobRequest {
    pub fn new(topic: Topic) -> Self {
        Self {
            topic,
            id: None,
            properties: JobProperties::new(),
            queue: None,
            parallelism: Parallelism::Exclusive,
            retries: None,
            retry_count: 0,
            retry_delay_ms: None,
            run_local: false,
            application: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_properties(mut self, properties: JobProperties) -> Self {
        self.properties.extend(properties);
        self
    }

    pub fn with_queue(mut self, queue: QueueOptions) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_parallelism(mut self, parallelism: Parallelism) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_retries(mut self, retries: RetryLimit) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_retry_delay_ms(mut self, delay_ms: u64) -> Self {
        self.retry_delay_ms = Some(delay_ms);
        self
    }

    pub fn run_local(mut self) -> Self {
        self.run_local = true;
        self
    }

    /// Build a request from the reserved keys of a job event.
    ///
    /// Fails when the job topic is missing or invalid. The reserved keys stay
    /// in the payload so executors see the event unchanged.
    pub fn from_event(event: JobEvent) -> EventingResult<Self> {
        let props = event.properties;

        let topic = match properties::property_str(&props, PROPERTY_JOB_TOPIC) {
            Some(topic) => Topic::new(topic)?,
            None => {
                return Err(EventingError::validation(format!(
                    "job event has no '{PROPERTY_JOB_TOPIC}' property"
                )));
            }
        };

        let id = match props.get(PROPERTY_JOB_ID) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };

        let queue = properties::property_str(&props, PROPERTY_JOB_QUEUE_NAME).map(|name| {
            let max_parallel = properties::property_i64(&props, PROPERTY_JOB_QUEUE_MAX_PARALLEL)
                .filter(|n| *n > 0)
                .map(|n| u32::try_from(n).unwrap_or(u32::MAX));
            QueueOptions {
                name: name.to_string(),
                ordered: props.contains_key(PROPERTY_JOB_QUEUE_ORDERED),
                max_parallel,
            }
        });

        let application = properties::property_str(&props, PROPERTY_APPLICATION)
            .and_then(|s| s.parse::<ApplicationId>().ok());

        Ok(Self {
            topic,
            id,
            parallelism: Parallelism::from_property(props.get(PROPERTY_JOB_PARALLEL)),
            retries: properties::property_i64(&props, PROPERTY_JOB_RETRIES).map(RetryLimit::from),
            retry_count: properties::property_i64(&props, PROPERTY_JOB_RETRY_COUNT)
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(0),
            retry_delay_ms: properties::property_i64(&props, PROPERTY_JOB_RETRY_DELAY)
                .and_then(|n| u64::try_from(n).ok()),
            run_local: props.contains_key(PROPERTY_JOB_RUN_LOCAL),
            application,
            queue,
            properties: props,
        })
    }

    /// The durable path this request maps to (fresh for anonymous jobs).
    pub fn path(&self) -> JobPath {
        JobPath::for_job(&self.topic, self.id.as_deref())
    }

    /// Turn the request into a pending record owned by `application`.
    ///
    /// Degenerate limits are normalised: a topic bound below two is
    /// exclusive and a queue with zero parallel slots gets the default.
    pub fn into_record(self, default_retries: i64, application: ApplicationId) -> JobRecord {
        let now = Utc::now();
        let path = self.path();
        let queue = self.queue.map(|mut options| {
            options.max_parallel = options.max_parallel.filter(|n| *n > 0);
            options
        });
        JobRecord {
            path,
            topic: self.topic,
            id: self.id,
            properties: self.properties,
            retry_count: self.retry_count,
            retries: self.retries.unwrap_or(RetryLimit::from(default_retries)),
            retry_delay_ms: self.retry_delay_ms,
            queue,
            parallelism: self.parallelism.normalized(),
            state: JobState::Pending,
            claimed_by: None,
            run_local: self.run_local,
            application: Some(self.application.unwrap_or(application)),
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }
}
