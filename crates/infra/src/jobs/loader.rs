//! Startup loading of persisted jobs.
//!
//! Jobs left unfinished by a previous run are read back in pages ordered by
//! creation time and routed like new submissions, except that a job whose
//! named queue cannot be created falls back to the main queue. Loading
//! pauses while the queues are deeper than the configured threshold.

use std::sync::Arc;

use tracing::{debug, info, warn};

use eventing_core::EventingError;

use super::engine::JobEngine;
use super::types::LoadCursor;
use crate::workers::ShutdownSignal;

pub(crate) fn run_loader(engine: Arc<JobEngine>, shutdown: ShutdownSignal) {
    let config = &engine.config;
    if !shutdown.sleep(config.load_delay) {
        return;
    }

    match engine.store.release_claims_of(engine.application_id()) {
        Ok(0) => {}
        Ok(released) => info!(released, "released claims left by a previous run"),
        Err(err) => warn!(error = %err, "failed to release stale claims"),
    }

    let mut cursor: Option<LoadCursor> = None;
    let mut batch = config.max_load_jobs.max(1);
    let mut loaded = 0usize;

    loop {
        if shutdown.is_requested() || !engine.is_running() {
            return;
        }

        let page = match engine
            .store
            .query_unfinished(cursor.as_ref(), engine.started_at, batch)
        {
            Ok(page) => page,
            Err(err) => {
                warn!(error = %err, "failed to load persisted jobs; retrying");
                if !shutdown.sleep(config.load_check_delay) {
                    return;
                }
                continue;
            }
        };

        let fetched = page.len();
        for job in page {
            cursor = Some(job.cursor());
            if job.is_claimed() {
                continue;
            }
            let path = job.path.clone();
            match engine.route_recovered(job) {
                Ok(()) => loaded += 1,
                Err(EventingError::Stopped) => return,
                Err(err) => warn!(job_path = %path, error = %err, "failed to queue persisted job"),
            }
        }

        if fetched < batch {
            break;
        }

        while engine.depth() > config.load_threshold {
            debug!(depth = engine.depth(), "queues above load threshold; pausing load");
            if !shutdown.sleep(config.load_check_delay) {
                return;
            }
        }
        batch = config.max_load_jobs.saturating_sub(engine.depth()).max(1);
    }

    info!(loaded, "finished loading persisted jobs");
}
