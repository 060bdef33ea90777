//! Job topics.
//!
//! A topic is the logical job type, written as a `/`-separated hierarchy
//! (`org/example/import`). It drives per-topic concurrency policy, handler
//! lookup and the first segment of a job's durable path.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::{EventingError, EventingResult};

/// A validated job topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic(String);

impl Topic {
    /// Validate and wrap a topic.
    ///
    /// Rejects empty topics, leading or trailing `/`, empty segments and
    /// whitespace.
    pub fn new(value: impl Into<String>) -> EventingResult<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(EventingError::validation("job topic must not be empty"));
        }
        if value.chars().any(char::is_whitespace) {
            return Err(EventingError::validation(format!(
                "job topic '{value}' must not contain whitespace"
            )));
        }
        if value.split('/').any(str::is_empty) {
            return Err(EventingError::validation(format!(
                "job topic '{value}' contains an empty segment"
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The topic flattened into a single path segment (`a/b/c` → `a.b.c`).
    pub fn path_segment(&self) -> String {
        self.0.replace('/', ".")
    }

    /// Match against a handler pattern: exact topic, `prefix/*` or `*`.
    pub fn matches(&self, pattern: &str) -> bool {
        if pattern == "*" || pattern == self.0 {
            return true;
        }
        match pattern.strip_suffix("/*") {
            Some(prefix) => self
                .0
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/')),
            None => false,
        }
    }
}

impl core::fmt::Display for Topic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for Topic {
    type Err = EventingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Topic {
    type Error = EventingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Topic> for String {
    fn from(value: Topic) -> Self {
        value.0
    }
}
