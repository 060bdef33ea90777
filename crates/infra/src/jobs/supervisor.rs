//! Periodic maintenance: acknowledgement timeouts, purging of finished jobs,
//! claim leases and idle queue cleanup.
//!
//! A claim is leased: every pass renews the claims this instance holds, and
//! claims another instance stopped renewing are released and their jobs
//! routed here.

use std::sync::Arc;
use std::thread;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::engine::JobEngine;

/// What one maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// Jobs rescheduled because the executor never acknowledged them.
    pub timed_out: usize,
    /// Finished records removed from the store.
    pub purged: usize,
    /// Jobs taken over from instances whose claim lease expired.
    pub recovered: usize,
    /// Idle named queues torn down.
    pub removed_queues: Vec<String>,
}

pub(crate) fn run_maintenance(engine: &Arc<JobEngine>) -> MaintenanceReport {
    let mut report = MaintenanceReport::default();

    let candidates = engine.unacknowledged();

    if !engine.config.cleanup_period.is_zero() {
        match chrono::Duration::from_std(engine.config.cleanup_period) {
            Ok(age) => match engine.store.purge_finished(Utc::now() - age) {
                Ok(purged) => report.purged = purged,
                Err(err) => warn!(error = %err, "failed to purge finished jobs"),
            },
            Err(err) => warn!(error = %err, "cleanup period out of range; skipping purge"),
        }
    }

    if !candidates.is_empty() {
        // give late acknowledgements one more chance
        thread::sleep(engine.config.restart_recheck_delay);
        for (path, dispatched) in candidates {
            let Some(flight) = engine.take_in_flight(&path, |f| !f.acknowledged && f.dispatched == dispatched)
            else {
                continue;
            };
            warn!(
                job_path = %path,
                topic = %flight.job.topic,
                retry_count = flight.job.retry_count,
                "job not acknowledged in time; rescheduling"
            );
            engine.finish_in_flight(flight, true);
            report.timed_out += 1;
        }
    }

    if !engine.config.claim_lease.is_zero() {
        report.recovered = recover_expired_claims(engine);
    }

    report.removed_queues = engine.registry.sweep_idle();

    if report.timed_out > 0 || report.purged > 0 || report.recovered > 0 || !report.removed_queues.is_empty() {
        info!(
            timed_out = report.timed_out,
            purged = report.purged,
            recovered = report.recovered,
            removed_queues = report.removed_queues.len(),
            "job maintenance pass"
        );
    } else {
        debug!("job maintenance pass: nothing to do");
    }
    report
}

/// Renew this instance's claims, then release and route jobs whose claim
/// lease ran out.
fn recover_expired_claims(engine: &Arc<JobEngine>) -> usize {
    let owner = engine.application_id();
    if let Err(err) = engine.store.renew_claims(owner) {
        warn!(error = %err, "failed to renew job claims");
    }

    let cutoff = chrono::Duration::from_std(engine.config.claim_lease)
        .ok()
        .and_then(|lease| Utc::now().checked_sub_signed(lease));
    let Some(cutoff) = cutoff else {
        warn!("claim lease out of range; skipping claim recovery");
        return 0;
    };
    let released = match engine.store.release_expired_claims(owner, cutoff) {
        Ok(released) => released,
        Err(err) => {
            warn!(error = %err, "failed to release expired job claims");
            return 0;
        }
    };

    let mut recovered = 0;
    for job in released {
        let path = job.path.clone();
        let topic = job.topic.clone();
        match engine.route_recovered(job) {
            Ok(()) => {
                info!(job_path = %path, topic = %topic, "claim lease expired; job taken over");
                recovered += 1;
            }
            Err(err) => warn!(job_path = %path, topic = %topic, error = %err, "failed to queue job with expired claim"),
        }
    }
    recovered
}
