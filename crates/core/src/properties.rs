//! Job properties: the ordered payload of a job plus the reserved keys that
//! incoming job events use to carry routing and retry metadata.

use std::collections::BTreeMap;

use serde_json::Value;

/// Ordered key → value job payload.
pub type JobProperties = BTreeMap<String, Value>;

/// Topic of the job carried by a job event.
pub const PROPERTY_JOB_TOPIC: &str = "event.job.topic";
/// Caller-supplied job id (enables de-duplication).
pub const PROPERTY_JOB_ID: &str = "event.job.id";
/// Named queue the job is routed to.
pub const PROPERTY_JOB_QUEUE_NAME: &str = "event.job.queuename";
/// Presence marks the named queue as ordered.
pub const PROPERTY_JOB_QUEUE_ORDERED: &str = "event.job.queueordered";
/// Parallel slot count of an unordered named queue.
pub const PROPERTY_JOB_QUEUE_MAX_PARALLEL: &str = "event.job.queue.maxparallel";
/// Per-topic parallelism (`false`/`no`, `true`, or a number).
pub const PROPERTY_JOB_PARALLEL: &str = "event.job.parallel";
/// Maximum number of retries, `-1` for unlimited.
pub const PROPERTY_JOB_RETRIES: &str = "event.job.retries";
/// Attempts made so far.
pub const PROPERTY_JOB_RETRY_COUNT: &str = "event.job.retrycount";
/// Delay in milliseconds before a failed job is re-enqueued.
pub const PROPERTY_JOB_RETRY_DELAY: &str = "event.job.retrydelay";
/// Presence restricts processing to the creating application.
pub const PROPERTY_JOB_RUN_LOCAL: &str = "event.job.run.local";
/// Application that created the job.
pub const PROPERTY_APPLICATION: &str = "event.application";

/// Keys that are metadata rather than payload.
pub const RESERVED_KEYS: &[&str] = &[
    PROPERTY_JOB_TOPIC,
    PROPERTY_JOB_ID,
    PROPERTY_JOB_QUEUE_NAME,
    PROPERTY_JOB_QUEUE_ORDERED,
    PROPERTY_JOB_QUEUE_MAX_PARALLEL,
    PROPERTY_JOB_PARALLEL,
    PROPERTY_JOB_RETRIES,
    PROPERTY_JOB_RETRY_COUNT,
    PROPERTY_JOB_RETRY_DELAY,
    PROPERTY_JOB_RUN_LOCAL,
    PROPERTY_APPLICATION,
];

pub fn is_reserved(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// String value of a property (numbers and booleans are not coerced).
pub fn property_str<'a>(props: &'a JobProperties, key: &str) -> Option<&'a str> {
    props.get(key).and_then(Value::as_str)
}

/// Integer value of a property; numeric strings are accepted.
pub fn property_i64(props: &JobProperties, key: &str) -> Option<i64> {
    match props.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Flag semantics: present and not explicitly `false`/`null`.
pub fn property_flag(props: &JobProperties, key: &str) -> bool {
    !matches!(props.get(key), None | Some(Value::Null) | Some(Value::Bool(false)))
}

/// Payload without the reserved metadata keys.
pub fn payload_only(props: &JobProperties) -> JobProperties {
    props
        .iter()
        .filter(|(k, _)| !is_reserved(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
