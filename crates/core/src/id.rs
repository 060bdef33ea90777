//! Strongly-typed identifiers used by the job engine.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EventingError;

/// Identity of one application instance (process installation).
///
/// Used as the owner of job claims and to pin run-local jobs to the instance
/// that created them. Keep it stable across restarts so claims left behind by
/// a crash can be recognised and released.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApplicationId(Uuid);

/// Unique suffix of an anonymous job (a job submitted without an id).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobUid(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = EventingError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| EventingError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(ApplicationId, "ApplicationId");
impl_uuid_newtype!(JobUid, "JobUid");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_id_parses_its_display_form() {
        let id = ApplicationId::new();
        let parsed: ApplicationId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn garbage_is_rejected_with_type_name() {
        let err = "not-a-uuid".parse::<JobUid>().unwrap_err();
        match err {
            EventingError::InvalidId(msg) => assert!(msg.starts_with("JobUid")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn job_uids_are_unique() {
        let first = JobUid::new();
        let second = JobUid::new();
        assert_ne!(first, second);
    }
}
