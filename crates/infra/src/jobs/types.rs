//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use eventing_core::{ApplicationId, JobPath, JobProperties, Topic};

/// How many times a failed job may be retried.
///
/// Stored as an integer where `-1` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum RetryLimit {
    Limited(u32),
    Unlimited,
}

impl RetryLimit {
    /// Whether another attempt is permitted once `retry_count` attempts have
    /// been counted as failed.
    pub fn allows(&self, retry_count: u32) -> bool {
        match self {
            Self::Unlimited => true,
            Self::Limited(max) => retry_count <= *max,
        }
    }
}

impl From<i64> for RetryLimit {
    fn from(value: i64) -> Self {
        match value {
            -1 => Self::Unlimited,
            v if v < 0 => Self::Limited(0),
            v => Self::Limited(u32::try_from(v).unwrap_or(u32::MAX)),
        }
    }
}

impl From<RetryLimit> for i64 {
    fn from(value: RetryLimit) -> Self {
        match value {
            RetryLimit::Unlimited => -1,
            RetryLimit::Limited(n) => i64::from(n),
        }
    }
}

/// Per-topic concurrency policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parallelism {
    /// At most one job of the topic runs at a time.
    Exclusive,
    /// No per-topic limit.
    Unbounded,
    /// At most `n` jobs of the topic run at a time.
    Bounded(u32),
}

impl Parallelism {
    /// Interpret the `event.job.parallel` property.
    ///
    /// Missing, `false` or `"no"` is exclusive; `true` or any other
    /// non-numeric text is unbounded; a number above one is a bound, and any
    /// other number is exclusive.
    pub fn from_property(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) | Some(Value::Bool(false)) => Self::Exclusive,
            Some(Value::Bool(true)) => Self::Unbounded,
            Some(Value::Number(n)) => Self::from_count(n.as_i64().unwrap_or(1)),
            Some(Value::String(s)) => {
                let s = s.trim();
                if s.eq_ignore_ascii_case("no") || s.eq_ignore_ascii_case("false") {
                    Self::Exclusive
                } else {
                    match s.parse::<i64>() {
                        Ok(n) => Self::from_count(n),
                        Err(_) => Self::Unbounded,
                    }
                }
            }
            Some(_) => Self::Unbounded,
        }
    }

    fn from_count(n: i64) -> Self {
        if n > 1 {
            Self::Bounded(u32::try_from(n).unwrap_or(u32::MAX))
        } else {
            Self::Exclusive
        }
    }

    /// `Bounded(0)` and `Bounded(1)` both mean one job at a time.
    pub fn normalized(self) -> Self {
        match self {
            Self::Bounded(n) if n <= 1 => Self::Exclusive,
            other => other,
        }
    }

    /// Maximum concurrent jobs of the topic, `None` when unlimited. Never
    /// zero, so a stored `Bounded(0)` still admits one job.
    pub fn limit(&self) -> Option<u32> {
        match self {
            Self::Exclusive => Some(1),
            Self::Bounded(n) => Some((*n).max(1)),
            Self::Unbounded => None,
        }
    }
}

impl Default for Parallelism {
    fn default() -> Self {
        Self::Exclusive
    }
}

/// Lifecycle state of a durable job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Claimed,
    AwaitingAck,
    Finished,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::AwaitingAck => "awaiting_ack",
            Self::Finished => "finished",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "claimed" => Some(Self::Claimed),
            "awaiting_ack" => Some(Self::AwaitingAck),
            "finished" => Some(Self::Finished),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Routing of a job to a named queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    pub name: String,
    /// Strict one-at-a-time processing in arrival order.
    pub ordered: bool,
    /// Parallel slots of an unordered queue.
    pub max_parallel: Option<u32>,
}

impl QueueOptions {
    pub fn ordered(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ordered: true,
            max_parallel: None,
        }
    }

    pub fn unordered(name: impl Into<String>, max_parallel: Option<u32>) -> Self {
        Self {
            name: name.into(),
            ordered: false,
            max_parallel,
        }
    }
}

/// A durable job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub path: JobPath,
    pub topic: Topic,
    /// Caller-supplied id; identified jobs are de-duplicated by path.
    pub id: Option<String>,
    pub properties: JobProperties,
    /// Failed attempts counted so far.
    pub retry_count: u32,
    pub retries: RetryLimit,
    /// Delay before a failed job is re-enqueued, in milliseconds.
    pub retry_delay_ms: Option<u64>,
    pub queue: Option<QueueOptions>,
    pub parallelism: Parallelism,
    pub state: JobState,
    pub claimed_by: Option<ApplicationId>,
    /// Only the creating application may process the job.
    pub run_local: bool,
    pub application: Option<ApplicationId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed_by.is_some()
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms.unwrap_or(0))
    }

    pub fn queue_name(&self) -> Option<&str> {
        self.queue.as_ref().map(|q| q.name.as_str())
    }

    /// Whether this application may process the job.
    pub fn runnable_by(&self, app: ApplicationId) -> bool {
        !self.run_local || self.application.is_none_or(|owner| owner == app)
    }

    pub fn cursor(&self) -> LoadCursor {
        LoadCursor {
            created_at: self.created_at,
            path: self.path.clone(),
        }
    }
}

/// Result of writing a job record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// A new record was written (possibly superseding a finished one).
    Inserted(JobPath),
    /// An unfinished record already lives at the path; nothing was written.
    Existing(JobPath),
}

impl PutOutcome {
    pub fn path(&self) -> &JobPath {
        match self {
            Self::Inserted(p) | Self::Existing(p) => p,
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

/// Keyset position of the background loader: `(created_at, path)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct LoadCursor {
    pub created_at: DateTime<Utc>,
    pub path: JobPath,
}

impl LoadCursor {
    pub fn precedes(&self, job: &JobRecord) -> bool {
        (&self.created_at, &self.path) < (&job.created_at, &job.path)
    }
}

/// Property-equality filter: every entry must match.
pub type PropertyFilter = JobProperties;

/// Query over unfinished jobs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobQuery {
    pub topic: Option<Topic>,
    /// `Some(true)` only claimed jobs, `Some(false)` only unclaimed jobs.
    pub claimed: Option<bool>,
    /// A job matches if any filter matches; no filters match everything.
    pub filters: Vec<PropertyFilter>,
    pub limit: Option<usize>,
}

impl JobQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_topic(mut self, topic: Topic) -> Self {
        self.topic = Some(topic);
        self
    }

    pub fn with_claimed(mut self, claimed: bool) -> Self {
        self.claimed = Some(claimed);
        self
    }

    pub fn with_filters(mut self, filters: Vec<PropertyFilter>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &JobRecord) -> bool {
        if job.is_finished() {
            return false;
        }
        if self.topic.as_ref().is_some_and(|t| *t != job.topic) {
            return false;
        }
        if self.claimed.is_some_and(|c| c != job.is_claimed()) {
            return false;
        }
        self.filters.is_empty()
            || self.filters.iter().any(|filter| {
                filter
                    .iter()
                    .all(|(key, value)| job.properties.get(key) == Some(value))
            })
    }
}

/// A dispatched job as seen by an executor.
#[derive(Debug, Clone, PartialEq)]
pub struct JobHandle {
    pub job: JobRecord,
    pub dispatched_at: DateTime<Utc>,
}

impl JobHandle {
    pub fn new(job: JobRecord) -> Self {
        Self {
            job,
            dispatched_at: Utc::now(),
        }
    }

    pub fn path(&self) -> &JobPath {
        &self.job.path
    }

    pub fn topic(&self) -> &Topic {
        &self.job.topic
    }
}

/// Result of running a job in an executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Success,
    /// The attempt failed; the job is retried while its retry limit allows.
    Failure(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn parallel_property_interpretation() {
        assert_eq!(Parallelism::from_property(None), Parallelism::Exclusive);
        assert_eq!(Parallelism::from_property(Some(&json!(false))), Parallelism::Exclusive);
        assert_eq!(Parallelism::from_property(Some(&json!("No"))), Parallelism::Exclusive);
        assert_eq!(Parallelism::from_property(Some(&json!(true))), Parallelism::Unbounded);
        assert_eq!(Parallelism::from_property(Some(&json!("yes"))), Parallelism::Unbounded);
        assert_eq!(Parallelism::from_property(Some(&json!(4))), Parallelism::Bounded(4));
        assert_eq!(Parallelism::from_property(Some(&json!("3"))), Parallelism::Bounded(3));
        assert_eq!(Parallelism::from_property(Some(&json!(1))), Parallelism::Exclusive);
        assert_eq!(Parallelism::from_property(Some(&json!(0))), Parallelism::Exclusive);
    }

    #[test]
    fn degenerate_bounds_mean_exclusive() {
        assert_eq!(Parallelism::Bounded(0).normalized(), Parallelism::Exclusive);
        assert_eq!(Parallelism::Bounded(1).normalized(), Parallelism::Exclusive);
        assert_eq!(Parallelism::Bounded(3).normalized(), Parallelism::Bounded(3));
        assert_eq!(Parallelism::Bounded(0).limit(), Some(1));
    }

    #[test]
    fn retry_limit_serializes_as_integer() {
        assert_eq!(serde_json::to_value(RetryLimit::Unlimited).unwrap(), json!(-1));
        assert_eq!(serde_json::to_value(RetryLimit::Limited(3)).unwrap(), json!(3));
        let parsed: RetryLimit = serde_json::from_value(json!(-1)).unwrap();
        assert_eq!(parsed, RetryLimit::Unlimited);
    }

    #[test]
    fn state_names_round_trip() {
        for state in [
            JobState::Pending,
            JobState::Claimed,
            JobState::AwaitingAck,
            JobState::Finished,
            JobState::Cancelled,
        ] {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert_eq!(JobState::parse("bogus"), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

        /// A limit of N allows exactly N retries, i.e. N + 1 attempts.
        #[test]
        fn limited_retries_allow_n_plus_one_attempts(max in 0u32..50) {
            let limit = RetryLimit::Limited(max);
            let mut attempts = 1u32;
            let mut retry_count = 0u32;
            loop {
                retry_count += 1;
                if !limit.allows(retry_count) {
                    break;
                }
                attempts += 1;
            }
            prop_assert_eq!(attempts, max + 1);
        }

        #[test]
        fn unlimited_always_allows(count in any::<u32>()) {
            prop_assert!(RetryLimit::Unlimited.allows(count));
        }
    }
}
