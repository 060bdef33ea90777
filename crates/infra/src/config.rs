//! Job handler configuration.
//!
//! Every delay the engine uses is configurable. Values come from code
//! (`with_*` builders), from a deserialized document, or from `EVENTING_*`
//! environment variables. Invalid environment values are logged and the
//! default is kept.

use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use eventing_core::ApplicationId;

pub const ENV_SLEEP_TIME_SECS: &str = "EVENTING_SLEEP_TIME_SECS";
pub const ENV_MAX_JOB_RETRIES: &str = "EVENTING_MAX_JOB_RETRIES";
pub const ENV_WAIT_FOR_ACK_SECS: &str = "EVENTING_WAIT_FOR_ACK_SECS";
pub const ENV_MAX_PARALLEL_JOBS: &str = "EVENTING_MAX_PARALLEL_JOBS";
pub const ENV_MAX_JOB_QUEUES: &str = "EVENTING_MAX_JOB_QUEUES";
pub const ENV_MAX_LOAD_JOBS: &str = "EVENTING_MAX_LOAD_JOBS";
pub const ENV_LOAD_THRESHOLD: &str = "EVENTING_LOAD_THRESHOLD";
pub const ENV_LOAD_DELAY_SECS: &str = "EVENTING_LOAD_DELAY_SECS";
pub const ENV_LOAD_CHECK_DELAY_SECS: &str = "EVENTING_LOAD_CHECK_DELAY_SECS";
pub const ENV_CLEANUP_PERIOD_MINS: &str = "EVENTING_CLEANUP_PERIOD_MINS";
pub const ENV_SCHEDULER_PERIOD_SECS: &str = "EVENTING_SCHEDULER_PERIOD_SECS";
pub const ENV_RESTART_RECHECK_MS: &str = "EVENTING_RESTART_RECHECK_MS";
pub const ENV_CLAIM_LEASE_SECS: &str = "EVENTING_CLAIM_LEASE_SECS";
pub const ENV_APPLICATION_ID: &str = "EVENTING_APPLICATION_ID";

/// Configuration of a [`JobEventHandler`](crate::jobs::JobEventHandler).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobHandlerConfig {
    /// Back-off before a job refused by its topic gate is tried again.
    #[serde(with = "secs")]
    pub sleep_time: Duration,
    /// Retry limit for jobs that do not carry their own.
    pub max_job_retries: i64,
    /// How long a dispatched job may stay unacknowledged.
    #[serde(with = "secs")]
    pub wait_for_ack: Duration,
    /// Global cap on concurrently running main-queue jobs.
    #[serde(with = "positive")]
    pub max_parallel_jobs: usize,
    /// Maximum number of named queues alive at once.
    #[serde(with = "positive")]
    pub max_job_queues: usize,
    /// Batch size of the background loader.
    #[serde(with = "positive")]
    pub max_load_jobs: usize,
    /// Queue depth above which the loader pauses.
    pub load_threshold: usize,
    /// Startup delay of the loader.
    #[serde(with = "secs")]
    pub load_delay: Duration,
    /// Loader pause while the queues are above `load_threshold`.
    #[serde(with = "secs")]
    pub load_check_delay: Duration,
    /// Age after which finished records are purged; zero disables purging.
    #[serde(with = "mins")]
    pub cleanup_period: Duration,
    /// Period of the maintenance sweep; must be positive.
    #[serde(with = "positive_secs")]
    pub scheduler_period: Duration,
    /// Grace period before unacknowledged jobs are taken back.
    #[serde(with = "millis")]
    pub restart_recheck_delay: Duration,
    /// Claims held by other instances and not renewed for this long are
    /// released and their jobs run here; zero disables the takeover. Each
    /// maintenance pass renews this instance's claims, so the lease should
    /// span several scheduler periods.
    #[serde(with = "secs")]
    pub claim_lease: Duration,
    /// Identity of this application instance; generated when absent.
    pub application_id: ApplicationId,
}

impl Default for JobHandlerConfig {
    fn default() -> Self {
        Self {
            sleep_time: Duration::from_secs(30),
            max_job_retries: 10,
            wait_for_ack: Duration::from_secs(90),
            max_parallel_jobs: 15,
            max_job_queues: 10,
            max_load_jobs: 1000,
            load_threshold: 400,
            load_delay: Duration::from_secs(30),
            load_check_delay: Duration::from_secs(240),
            cleanup_period: Duration::from_secs(5 * 60),
            scheduler_period: Duration::from_secs(300),
            restart_recheck_delay: Duration::from_millis(500),
            claim_lease: Duration::from_secs(900),
            application_id: ApplicationId::new(),
        }
    }
}

impl JobHandlerConfig {
    /// Defaults overridden by `EVENTING_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let lookup = &lookup;

        if let Some(v) = parse_var::<u64>(lookup, ENV_SLEEP_TIME_SECS) {
            config.sleep_time = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<i64>(lookup, ENV_MAX_JOB_RETRIES) {
            if v < -1 {
                warn!(var = ENV_MAX_JOB_RETRIES, value = v, "retry limit below -1 ignored");
            } else {
                config.max_job_retries = v;
            }
        }
        if let Some(v) = parse_var::<u64>(lookup, ENV_WAIT_FOR_ACK_SECS) {
            config.wait_for_ack = Duration::from_secs(v);
        }
        if let Some(v) = parse_positive(lookup, ENV_MAX_PARALLEL_JOBS) {
            config.max_parallel_jobs = v;
        }
        if let Some(v) = parse_positive(lookup, ENV_MAX_JOB_QUEUES) {
            config.max_job_queues = v;
        }
        if let Some(v) = parse_positive(lookup, ENV_MAX_LOAD_JOBS) {
            config.max_load_jobs = v;
        }
        if let Some(v) = parse_var::<usize>(lookup, ENV_LOAD_THRESHOLD) {
            config.load_threshold = v;
        }
        if let Some(v) = parse_var::<u64>(lookup, ENV_LOAD_DELAY_SECS) {
            config.load_delay = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<u64>(lookup, ENV_LOAD_CHECK_DELAY_SECS) {
            config.load_check_delay = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<u64>(lookup, ENV_CLEANUP_PERIOD_MINS) {
            match v.checked_mul(60) {
                Some(secs) => config.cleanup_period = Duration::from_secs(secs),
                None => warn!(var = ENV_CLEANUP_PERIOD_MINS, value = v, "cleanup period out of range; keeping default"),
            }
        }
        if let Some(v) = parse_var::<u64>(lookup, ENV_SCHEDULER_PERIOD_SECS) {
            if v == 0 {
                warn!(var = ENV_SCHEDULER_PERIOD_SECS, "scheduler period must be positive; keeping default");
            } else {
                config.scheduler_period = Duration::from_secs(v);
            }
        }
        if let Some(v) = parse_var::<u64>(lookup, ENV_RESTART_RECHECK_MS) {
            config.restart_recheck_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse_var::<u64>(lookup, ENV_CLAIM_LEASE_SECS) {
            config.claim_lease = Duration::from_secs(v);
        }
        if let Some(v) = parse_var::<ApplicationId>(lookup, ENV_APPLICATION_ID) {
            config.application_id = v;
        }

        config
    }

    pub fn with_sleep_time(mut self, value: Duration) -> Self {
        self.sleep_time = value;
        self
    }

    pub fn with_max_job_retries(mut self, value: i64) -> Self {
        self.max_job_retries = value;
        self
    }

    pub fn with_wait_for_ack(mut self, value: Duration) -> Self {
        self.wait_for_ack = value;
        self
    }

    pub fn with_max_parallel_jobs(mut self, value: usize) -> Self {
        self.max_parallel_jobs = value.max(1);
        self
    }

    pub fn with_max_job_queues(mut self, value: usize) -> Self {
        self.max_job_queues = value;
        self
    }

    pub fn with_max_load_jobs(mut self, value: usize) -> Self {
        self.max_load_jobs = value.max(1);
        self
    }

    pub fn with_load_threshold(mut self, value: usize) -> Self {
        self.load_threshold = value;
        self
    }

    pub fn with_load_delay(mut self, value: Duration) -> Self {
        self.load_delay = value;
        self
    }

    pub fn with_load_check_delay(mut self, value: Duration) -> Self {
        self.load_check_delay = value;
        self
    }

    pub fn with_cleanup_period(mut self, value: Duration) -> Self {
        self.cleanup_period = value;
        self
    }

    /// A zero period is raised to one millisecond.
    pub fn with_scheduler_period(mut self, value: Duration) -> Self {
        self.scheduler_period = value.max(Duration::from_millis(1));
        self
    }

    pub fn with_restart_recheck_delay(mut self, value: Duration) -> Self {
        self.restart_recheck_delay = value;
        self
    }

    pub fn with_claim_lease(mut self, value: Duration) -> Self {
        self.claim_lease = value;
        self
    }

    pub fn with_application_id(mut self, value: ApplicationId) -> Self {
        self.application_id = value;
        self
    }
}

fn parse_var<T>(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(var = key, value = %raw, error = %err, "invalid configuration value; keeping default");
            None
        }
    }
}

fn parse_positive(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<usize> {
    match parse_var::<usize>(lookup, key)? {
        0 => {
            warn!(var = key, "value must be positive; keeping default");
            None
        }
        v => Some(v),
    }
}

macro_rules! duration_serde {
    ($module:ident, $from:expr) => {
        mod $module {
            use std::time::Duration;

            use serde::de::Error;
            use serde::{Deserialize, Deserializer};

            pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
            where
                D: Deserializer<'de>,
            {
                let value = u64::deserialize(deserializer)?;
                let convert: fn(u64) -> Option<Duration> = $from;
                convert(value).ok_or_else(|| D::Error::custom(format!("invalid duration value {value}")))
            }
        }
    };
}

duration_serde!(secs, |s| Some(Duration::from_secs(s)));
duration_serde!(millis, |ms| Some(Duration::from_millis(ms)));
duration_serde!(mins, |m| m.checked_mul(60).map(Duration::from_secs));
duration_serde!(positive_secs, |s| (s > 0).then(|| Duration::from_secs(s)));

mod positive {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<usize, D::Error>
    where
        D: Deserializer<'de>,
    {
        match usize::deserialize(deserializer)? {
            0 => Err(D::Error::custom("value must be positive")),
            v => Ok(v),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let c = JobHandlerConfig::default();
        assert_eq!(c.sleep_time, Duration::from_secs(30));
        assert_eq!(c.max_job_retries, 10);
        assert_eq!(c.wait_for_ack, Duration::from_secs(90));
        assert_eq!(c.max_parallel_jobs, 15);
        assert_eq!(c.max_job_queues, 10);
        assert_eq!(c.max_load_jobs, 1000);
        assert_eq!(c.load_threshold, 400);
        assert_eq!(c.load_delay, Duration::from_secs(30));
        assert_eq!(c.load_check_delay, Duration::from_secs(240));
        assert_eq!(c.cleanup_period, Duration::from_secs(300));
        assert_eq!(c.scheduler_period, Duration::from_secs(300));
        assert_eq!(c.restart_recheck_delay, Duration::from_millis(500));
    }

    #[test]
    fn environment_overrides_defaults() {
        let app = ApplicationId::new();
        let app_str = app.to_string();
        let c = JobHandlerConfig::from_lookup(lookup(&[
            (ENV_SLEEP_TIME_SECS, "5"),
            (ENV_MAX_JOB_RETRIES, "-1"),
            (ENV_MAX_PARALLEL_JOBS, "3"),
            (ENV_CLEANUP_PERIOD_MINS, "0"),
            (ENV_RESTART_RECHECK_MS, "25"),
            (ENV_APPLICATION_ID, app_str.as_str()),
        ]));
        assert_eq!(c.sleep_time, Duration::from_secs(5));
        assert_eq!(c.max_job_retries, -1);
        assert_eq!(c.max_parallel_jobs, 3);
        assert_eq!(c.cleanup_period, Duration::ZERO);
        assert_eq!(c.restart_recheck_delay, Duration::from_millis(25));
        assert_eq!(c.application_id, app);
    }

    #[test]
    fn invalid_environment_values_keep_defaults() {
        let c = JobHandlerConfig::from_lookup(lookup(&[
            (ENV_SLEEP_TIME_SECS, "soon"),
            (ENV_MAX_JOB_RETRIES, "-7"),
            (ENV_MAX_PARALLEL_JOBS, "0"),
            (ENV_SCHEDULER_PERIOD_SECS, "0"),
            (ENV_APPLICATION_ID, "not-a-uuid"),
        ]));
        let d = JobHandlerConfig::default();
        assert_eq!(c.sleep_time, d.sleep_time);
        assert_eq!(c.max_job_retries, d.max_job_retries);
        assert_eq!(c.max_parallel_jobs, d.max_parallel_jobs);
        assert_eq!(c.scheduler_period, d.scheduler_period);
    }

    #[test]
    fn deserializes_with_unit_suffixed_fields() {
        let c: JobHandlerConfig = serde_json::from_value(serde_json::json!({
            "sleep_time": 2,
            "cleanup_period": 10,
            "restart_recheck_delay": 50,
            "max_job_queues": 4
        }))
        .unwrap();
        assert_eq!(c.sleep_time, Duration::from_secs(2));
        assert_eq!(c.cleanup_period, Duration::from_secs(600));
        assert_eq!(c.restart_recheck_delay, Duration::from_millis(50));
        assert_eq!(c.max_job_queues, 4);
        assert_eq!(c.max_parallel_jobs, 15);
    }

    #[test]
    fn oversized_cleanup_period_keeps_default() {
        let huge = u64::MAX.to_string();
        let c = JobHandlerConfig::from_lookup(lookup(&[(ENV_CLEANUP_PERIOD_MINS, huge.as_str())]));
        assert_eq!(c.cleanup_period, JobHandlerConfig::default().cleanup_period);

        let parsed = serde_json::from_value::<JobHandlerConfig>(serde_json::json!({ "cleanup_period": u64::MAX }));
        assert!(parsed.is_err());
    }

    #[test]
    fn deserialization_rejects_zero_periods_and_capacities() {
        for field in ["scheduler_period", "max_parallel_jobs", "max_job_queues", "max_load_jobs"] {
            let mut doc = serde_json::Map::new();
            doc.insert(field.to_string(), serde_json::json!(0));
            let parsed = serde_json::from_value::<JobHandlerConfig>(serde_json::Value::Object(doc));
            assert!(parsed.is_err(), "{field} = 0 should be rejected");
        }
    }

    #[test]
    fn claim_lease_is_configurable() {
        assert_eq!(JobHandlerConfig::default().claim_lease, Duration::from_secs(900));
        let c = JobHandlerConfig::from_lookup(lookup(&[(ENV_CLAIM_LEASE_SECS, "0")]));
        assert_eq!(c.claim_lease, Duration::ZERO);
    }

    #[test]
    fn builders_clamp_zero_capacities() {
        let c = JobHandlerConfig::default()
            .with_max_parallel_jobs(0)
            .with_max_load_jobs(0)
            .with_scheduler_period(Duration::ZERO);
        assert_eq!(c.scheduler_period, Duration::from_millis(1));
        assert_eq!(c.max_parallel_jobs, 1);
        assert_eq!(c.max_load_jobs, 1);
    }
}
