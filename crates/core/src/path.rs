//! Durable job paths.
//!
//! A job path is the storage key of a job record. Identified jobs map to a
//! deterministic path (`<topic segment>/<escaped id>`), so submitting the
//! same `(topic, id)` twice lands on the same record. Anonymous jobs get a
//! fresh UUIDv7 suffix and are always unique.

use serde::{Deserialize, Serialize};

use crate::id::JobUid;
use crate::topic::Topic;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobPath(String);

impl JobPath {
    /// Path for a job, deterministic when `id` is present.
    pub fn for_job(topic: &Topic, id: Option<&str>) -> Self {
        match id {
            Some(id) => Self::identified(topic, id),
            None => Self::anonymous(topic),
        }
    }

    pub fn identified(topic: &Topic, id: &str) -> Self {
        Self(format!("{}/{}", topic.path_segment(), escape_id(id)))
    }

    pub fn anonymous(topic: &Topic) -> Self {
        Self(format!("{}/{}", topic.path_segment(), JobUid::new()))
    }

    /// Wrap a path read back from storage.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading segment (the flattened topic).
    pub fn topic_segment(&self) -> &str {
        self.0.split('/').next().unwrap_or_default()
    }
}

impl core::fmt::Display for JobPath {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for JobPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Escape everything outside `[A-Za-z0-9._-]` as `%XX` (UTF-8 bytes).
fn escape_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => out.push(byte as char),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(s: &str) -> Topic {
        Topic::new(s).unwrap()
    }

    #[test]
    fn identified_paths_are_deterministic() {
        let t = topic("org/example/import");
        let a = JobPath::for_job(&t, Some("order-42"));
        let b = JobPath::for_job(&t, Some("order-42"));
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "org.example.import/order-42");
        assert_eq!(a.topic_segment(), "org.example.import");
    }

    #[test]
    fn anonymous_paths_are_unique() {
        let t = topic("mail/send");
        let a = JobPath::for_job(&t, None);
        let b = JobPath::for_job(&t, None);
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("mail.send/"));
    }

    #[test]
    fn ids_with_separators_are_escaped() {
        let t = topic("files");
        let p = JobPath::identified(&t, "dir/file name");
        assert_eq!(p.as_str(), "files/dir%2Ffile%20name");
        assert_eq!(p.as_str().matches('/').count(), 1);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

            /// Any id yields exactly one separator and only safe characters
            /// after it, and distinct ids never share a path.
            #[test]
            fn escaped_ids_stay_in_one_segment(a in ".{0,24}", b in ".{0,24}") {
                let t = topic("p/q");
                let pa = JobPath::identified(&t, &a);
                let pb = JobPath::identified(&t, &b);
                prop_assert_eq!(pa.as_str().matches('/').count(), 1);
                prop_assert!(pa.as_str().chars().all(|c| c.is_ascii_alphanumeric() || "._-%/".contains(c)));
                prop_assert_eq!(pa == pb, a == b);
            }
        }
    }
}
