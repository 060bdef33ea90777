//! Durable job storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use eventing_core::{ApplicationId, EventingError, JobPath};

use super::types::{JobQuery, JobRecord, JobState, LoadCursor, PutOutcome};

/// Job store abstraction.
///
/// The store is the source of truth for "does this job still need
/// processing". Claims are compare-and-set: at most one owner at a time.
pub trait JobStore: Send + Sync {
    /// Write a new record.
    ///
    /// An unfinished record already at the path wins (`Existing`); a finished
    /// one is superseded (`Inserted`).
    fn put(&self, record: JobRecord) -> Result<PutOutcome, JobStoreError>;

    /// Read a record.
    fn get(&self, path: &JobPath) -> Result<Option<JobRecord>, JobStoreError>;

    /// Claim an unfinished, unclaimed record for `owner`.
    fn claim(&self, path: &JobPath, owner: ApplicationId) -> Result<bool, JobStoreError>;

    /// Drop a claim; the record becomes pending again.
    fn release(&self, path: &JobPath) -> Result<(), JobStoreError>;

    /// Overwrite a stored record.
    fn update(&self, record: &JobRecord) -> Result<(), JobStoreError>;

    /// Move a record to a terminal state and drop its claim.
    fn mark_finished(&self, path: &JobPath, state: JobState) -> Result<(), JobStoreError>;

    /// Remove a record; `false` when there was none.
    fn delete(&self, path: &JobPath) -> Result<bool, JobStoreError>;

    /// Unfinished records created before `created_before`, ascending by
    /// `(created_at, path)` and strictly after `after`.
    fn query_unfinished(
        &self,
        after: Option<&LoadCursor>,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Unfinished records matching `query`, ascending by creation.
    fn query(&self, query: &JobQuery) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Remove terminal records finished before the cutoff.
    fn purge_finished(&self, finished_before: DateTime<Utc>) -> Result<usize, JobStoreError>;

    /// Drop every claim held by `owner` on unfinished records.
    fn release_claims_of(&self, owner: ApplicationId) -> Result<usize, JobStoreError>;

    /// Renew the lease of every claim `owner` holds on unfinished records.
    /// A claim's lease is its record's `updated_at`.
    fn renew_claims(&self, owner: ApplicationId) -> Result<usize, JobStoreError>;

    /// Drop claims held by anyone but `owner` whose lease was last renewed
    /// before `renewed_before`, and return the released records.
    fn release_expired_claims(
        &self,
        owner: ApplicationId,
        renewed_before: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobPath),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<JobStoreError> for EventingError {
    fn from(err: JobStoreError) -> Self {
        EventingError::storage(err.to_string())
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobPath, JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored records, finished ones included.
    pub fn len(&self) -> usize {
        self.jobs.read().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<JobPath, JobRecord>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<JobPath, JobRecord>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }
}

fn sorted(mut records: Vec<JobRecord>) -> Vec<JobRecord> {
    records.sort_by(|a, b| (a.created_at, &a.path).cmp(&(b.created_at, &b.path)));
    records
}

impl JobStore for InMemoryJobStore {
    fn put(&self, record: JobRecord) -> Result<PutOutcome, JobStoreError> {
        let mut jobs = self.write()?;
        let path = record.path.clone();
        if jobs.get(&path).is_some_and(|existing| !existing.is_finished()) {
            return Ok(PutOutcome::Existing(path));
        }
        jobs.insert(path.clone(), record);
        Ok(PutOutcome::Inserted(path))
    }

    fn get(&self, path: &JobPath) -> Result<Option<JobRecord>, JobStoreError> {
        Ok(self.read()?.get(path).cloned())
    }

    fn claim(&self, path: &JobPath, owner: ApplicationId) -> Result<bool, JobStoreError> {
        let mut jobs = self.write()?;
        match jobs.get_mut(path) {
            Some(job) if !job.is_finished() && job.claimed_by.is_none() => {
                job.claimed_by = Some(owner);
                job.state = JobState::Claimed;
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release(&self, path: &JobPath) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        if let Some(job) = jobs.get_mut(path) {
            if !job.is_finished() {
                job.claimed_by = None;
                job.state = JobState::Pending;
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    fn update(&self, record: &JobRecord) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        match jobs.get_mut(&record.path) {
            Some(job) => {
                *job = record.clone();
                Ok(())
            }
            None => Err(JobStoreError::NotFound(record.path.clone())),
        }
    }

    fn mark_finished(&self, path: &JobPath, state: JobState) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        let job = jobs
            .get_mut(path)
            .ok_or_else(|| JobStoreError::NotFound(path.clone()))?;
        let now = Utc::now();
        job.state = state;
        job.claimed_by = None;
        job.updated_at = now;
        job.finished_at = Some(now);
        Ok(())
    }

    fn delete(&self, path: &JobPath) -> Result<bool, JobStoreError> {
        Ok(self.write()?.remove(path).is_some())
    }

    fn query_unfinished(
        &self,
        after: Option<&LoadCursor>,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        let jobs = self.read()?;
        let candidates = jobs
            .values()
            .filter(|j| !j.is_finished() && j.created_at < created_before)
            .filter(|j| after.is_none_or(|cursor| cursor.precedes(j)))
            .cloned()
            .collect();
        let mut result = sorted(candidates);
        result.truncate(limit);
        Ok(result)
    }

    fn query(&self, query: &JobQuery) -> Result<Vec<JobRecord>, JobStoreError> {
        let jobs = self.read()?;
        let mut result = sorted(jobs.values().filter(|j| query.matches(j)).cloned().collect());
        if let Some(limit) = query.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    fn purge_finished(&self, finished_before: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let mut jobs = self.write()?;
        let before = jobs.len();
        jobs.retain(|_, j| !(j.is_finished() && j.finished_at.is_some_and(|at| at < finished_before)));
        Ok(before - jobs.len())
    }

    fn release_claims_of(&self, owner: ApplicationId) -> Result<usize, JobStoreError> {
        let mut jobs = self.write()?;
        let mut released = 0;
        for job in jobs.values_mut() {
            if !job.is_finished() && job.claimed_by == Some(owner) {
                job.claimed_by = None;
                job.state = JobState::Pending;
                job.updated_at = Utc::now();
                released += 1;
            }
        }
        Ok(released)
    }

    fn renew_claims(&self, owner: ApplicationId) -> Result<usize, JobStoreError> {
        let mut jobs = self.write()?;
        let now = Utc::now();
        let mut renewed = 0;
        for job in jobs.values_mut() {
            if !job.is_finished() && job.claimed_by == Some(owner) {
                job.updated_at = now;
                renewed += 1;
            }
        }
        Ok(renewed)
    }

    fn release_expired_claims(
        &self,
        owner: ApplicationId,
        renewed_before: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        let mut jobs = self.write()?;
        let now = Utc::now();
        let mut released = Vec::new();
        for job in jobs.values_mut() {
            let expired = job.claimed_by.is_some_and(|holder| holder != owner) && job.updated_at < renewed_before;
            if !job.is_finished() && expired {
                job.claimed_by = None;
                job.state = JobState::Pending;
                job.updated_at = now;
                released.push(job.clone());
            }
        }
        Ok(sorted(released))
    }
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn put(&self, record: JobRecord) -> Result<PutOutcome, JobStoreError> {
        (**self).put(record)
    }

    fn get(&self, path: &JobPath) -> Result<Option<JobRecord>, JobStoreError> {
        (**self).get(path)
    }

    fn claim(&self, path: &JobPath, owner: ApplicationId) -> Result<bool, JobStoreError> {
        (**self).claim(path, owner)
    }

    fn release(&self, path: &JobPath) -> Result<(), JobStoreError> {
        (**self).release(path)
    }

    fn update(&self, record: &JobRecord) -> Result<(), JobStoreError> {
        (**self).update(record)
    }

    fn mark_finished(&self, path: &JobPath, state: JobState) -> Result<(), JobStoreError> {
        (**self).mark_finished(path, state)
    }

    fn delete(&self, path: &JobPath) -> Result<bool, JobStoreError> {
        (**self).delete(path)
    }

    fn query_unfinished(
        &self,
        after: Option<&LoadCursor>,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).query_unfinished(after, created_before, limit)
    }

    fn query(&self, query: &JobQuery) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).query(query)
    }

    fn purge_finished(&self, finished_before: DateTime<Utc>) -> Result<usize, JobStoreError> {
        (**self).purge_finished(finished_before)
    }

    fn release_claims_of(&self, owner: ApplicationId) -> Result<usize, JobStoreError> {
        (**self).release_claims_of(owner)
    }

    fn renew_claims(&self, owner: ApplicationId) -> Result<usize, JobStoreError> {
        (**self).renew_claims(owner)
    }

    fn release_expired_claims(
        &self,
        owner: ApplicationId,
        renewed_before: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).release_expired_claims(owner, renewed_before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::request::JobRequest;
    use eventing_core::Topic;
    use serde_json::json;

    fn record(topic: &str, id: Option<&str>) -> JobRecord {
        let mut req = JobRequest::new(Topic::new(topic).unwrap());
        if let Some(id) = id {
            req = req.with_id(id);
        }
        req.into_record(3, ApplicationId::new())
    }

    #[test]
    fn put_dedupes_unfinished_and_supersedes_finished() {
        let store = InMemoryJobStore::new();
        let first = record("t", Some("a"));
        let path = first.path.clone();

        assert_eq!(store.put(first).unwrap(), PutOutcome::Inserted(path.clone()));
        assert_eq!(store.put(record("t", Some("a"))).unwrap(), PutOutcome::Existing(path.clone()));
        assert_eq!(store.len(), 1);

        store.mark_finished(&path, JobState::Finished).unwrap();
        assert_eq!(store.put(record("t", Some("a"))).unwrap(), PutOutcome::Inserted(path.clone()));
        assert_eq!(store.get(&path).unwrap().unwrap().state, JobState::Pending);
    }

    #[test]
    fn claim_is_exclusive() {
        let store = InMemoryJobStore::new();
        let job = record("t", None);
        let path = job.path.clone();
        store.put(job).unwrap();

        let a = ApplicationId::new();
        let b = ApplicationId::new();
        assert!(store.claim(&path, a).unwrap());
        assert!(!store.claim(&path, b).unwrap());

        store.release(&path).unwrap();
        assert!(store.claim(&path, b).unwrap());
        assert_eq!(store.get(&path).unwrap().unwrap().claimed_by, Some(b));
    }

    #[test]
    fn claim_fails_for_finished_or_missing_records() {
        let store = InMemoryJobStore::new();
        let job = record("t", Some("x"));
        let path = job.path.clone();
        store.put(job).unwrap();
        store.mark_finished(&path, JobState::Cancelled).unwrap();

        let owner = ApplicationId::new();
        assert!(!store.claim(&path, owner).unwrap());
        assert!(!store.claim(&JobPath::from_raw("t/missing"), owner).unwrap());
    }

    #[test]
    fn unfinished_query_pages_with_keyset_cursor() {
        let store = InMemoryJobStore::new();
        let stamp = Utc::now();
        for i in 0..5 {
            let mut job = record("t", Some(&format!("job-{i}")));
            // identical timestamps: ordering falls back to the path
            job.created_at = stamp;
            store.put(job).unwrap();
        }
        let cutoff = stamp + chrono::Duration::seconds(1);

        let first = store.query_unfinished(None, cutoff, 2).unwrap();
        assert_eq!(first.len(), 2);
        let cursor = first[1].cursor();
        let rest = store.query_unfinished(Some(&cursor), cutoff, 10).unwrap();
        assert_eq!(rest.len(), 3);

        let mut seen: Vec<_> = first.iter().chain(rest.iter()).map(|j| j.path.clone()).collect();
        seen.dedup();
        assert_eq!(seen.len(), 5);

        assert!(store.query_unfinished(None, stamp, 10).unwrap().is_empty());
    }

    #[test]
    fn query_applies_topic_claim_and_property_filters() {
        let store = InMemoryJobStore::new();
        let owner = ApplicationId::new();

        let mut a = record("mail/send", Some("a"));
        a.properties.insert("to".into(), json!("x@example.com"));
        let mut b = record("mail/send", Some("b"));
        b.properties.insert("to".into(), json!("y@example.com"));
        let c = record("report/build", Some("c"));
        let a_path = a.path.clone();
        for job in [a, b, c] {
            store.put(job).unwrap();
        }
        store.claim(&a_path, owner).unwrap();

        let topic = Topic::new("mail/send").unwrap();
        assert_eq!(store.query(&JobQuery::all().with_topic(topic.clone())).unwrap().len(), 2);
        assert_eq!(store.query(&JobQuery::all().with_claimed(true)).unwrap().len(), 1);
        assert_eq!(store.query(&JobQuery::all().with_claimed(false)).unwrap().len(), 2);

        let filter: crate::jobs::types::PropertyFilter =
            serde_json::from_value(json!({"to": "y@example.com"})).unwrap();
        let hits = store
            .query(&JobQuery::all().with_topic(topic).with_filters(vec![filter]))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id.as_deref(), Some("b"));
    }

    #[test]
    fn purge_and_release_claims() {
        let store = InMemoryJobStore::new();
        let owner = ApplicationId::new();
        let done = record("t", Some("done"));
        let open = record("t", Some("open"));
        let done_path = done.path.clone();
        let open_path = open.path.clone();
        store.put(done).unwrap();
        store.put(open).unwrap();

        store.mark_finished(&done_path, JobState::Finished).unwrap();
        store.claim(&open_path, owner).unwrap();

        assert_eq!(store.purge_finished(Utc::now() + chrono::Duration::seconds(1)).unwrap(), 1);
        assert_eq!(store.release_claims_of(owner).unwrap(), 1);
        assert!(store.get(&done_path).unwrap().is_none());
        assert!(!store.get(&open_path).unwrap().unwrap().is_claimed());
    }

    #[test]
    fn expired_foreign_claims_are_released() {
        let store = InMemoryJobStore::new();
        let me = ApplicationId::new();
        let other = ApplicationId::new();
        let long_ago = Utc::now() - chrono::Duration::hours(1);

        let mut stale = record("t", Some("stale"));
        stale.claimed_by = Some(other);
        stale.state = JobState::Claimed;
        stale.updated_at = long_ago;
        let mut fresh = record("t", Some("fresh"));
        fresh.claimed_by = Some(other);
        fresh.state = JobState::Claimed;
        let mut mine = record("t", Some("mine"));
        mine.claimed_by = Some(me);
        mine.state = JobState::Claimed;
        mine.updated_at = long_ago;
        let (stale_path, mine_path) = (stale.path.clone(), mine.path.clone());
        for job in [stale, fresh, mine] {
            store.put(job).unwrap();
        }

        let cutoff = Utc::now() - chrono::Duration::minutes(5);
        let released = store.release_expired_claims(me, cutoff).unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].path, stale_path);
        assert_eq!(released[0].state, JobState::Pending);
        assert!(!store.get(&stale_path).unwrap().unwrap().is_claimed());

        // own claims are renewed, never released
        assert_eq!(store.renew_claims(me).unwrap(), 1);
        assert!(store.get(&mine_path).unwrap().unwrap().updated_at > cutoff);
        assert!(store.release_expired_claims(me, cutoff).unwrap().is_empty());
    }
}
