//! Startup crash detection.
//!
//! A lease left on disk by an engine that is no longer running (stale, or
//! its process has exited) means that engine stopped mid-execution.
//! Recovery is advisory: it records the crash and the last checkpoint, then
//! clears the lease. The state store and progress ledger drive the actual
//! resumption. A live engine's lease is left alone; the caller contends
//! for it through the queue.

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::io::audit::{AuditEvent, AuditKind, AuditLog};
use crate::io::checkpoint::{Checkpoint, CheckpointStore};
use crate::io::lock::{Lease, LockManager};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashReport {
    pub lease: Lease,
    pub checkpoint: Option<Checkpoint>,
}

/// Detect and clear a lease abandoned by a previous engine.
///
/// Leases owned by `lock` itself, or held by a live engine, are not crashes.
pub fn recover_on_startup(
    lock: &LockManager,
    checkpoints: &CheckpointStore,
    audit: &AuditLog,
) -> Result<Option<CrashReport>> {
    let Some(lease) = lock.read_lease() else {
        return Ok(None);
    };
    if lease.owner == lock.owner() {
        return Ok(None);
    }
    if !lock.is_abandoned(&lease, Utc::now()) {
        debug!(holder = %lease.owner, "lease held by a live engine");
        return Ok(None);
    }

    let checkpoint = match checkpoints.latest() {
        Ok(checkpoint) => checkpoint,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "could not read latest checkpoint");
            None
        }
    };
    match &checkpoint {
        Some(cp) => warn!(
            holder = %lease.owner,
            checkpoint = %cp.id,
            state = %cp.state,
            "previous engine stopped mid-execution"
        ),
        None => warn!(holder = %lease.owner, "previous engine stopped mid-execution, no checkpoint"),
    }
    audit.record(
        AuditEvent::new(
            AuditKind::CrashDetected,
            format!("abandoned lease held by {}", lease.owner),
        )
        .with_details(json!({
            "lease": lease,
            "checkpoint": checkpoint,
        })),
    );

    lock.force_clear()?;
    info!("abandoned lease cleared");
    Ok(Some(CrashReport { lease, checkpoint }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::types::ExecutionState;
    use crate::io::atomic::write_json;

    const WINDOW: Duration = Duration::from_secs(300);

    #[test]
    fn abandoned_lease_is_reported_and_cleared() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lock_path = temp.path().join("lock.json");
        let abandoned = Lease {
            owner: "engine-old".to_string(),
            acquired_at: Utc::now() - chrono::Duration::minutes(10),
        };
        write_json(&lock_path, &abandoned).expect("write lease");

        let checkpoints = CheckpointStore::new(temp.path().join("checkpoints"));
        let cp = checkpoints
            .create(ExecutionState::Implement, None, None)
            .expect("checkpoint");
        let audit = AuditLog::new(temp.path().join("audit.log"));

        let current = LockManager::with_owner(&lock_path, "engine-new", WINDOW);
        let report = recover_on_startup(&current, &checkpoints, &audit)
            .expect("recover")
            .expect("crash detected");
        assert_eq!(report.lease.owner, "engine-old");
        assert_eq!(report.checkpoint.map(|c| c.id), Some(cp.id));
        assert!(current.read_lease().is_none());
        let events = audit.events().expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AuditKind::CrashDetected);
    }

    #[test]
    fn live_lease_survives_a_second_engine_starting() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lock_path = temp.path().join("lock.json");
        let running = LockManager::new(&lock_path, WINDOW);
        assert!(running.acquire());
        let checkpoints = CheckpointStore::new(temp.path().join("checkpoints"));
        let audit = AuditLog::new(temp.path().join("audit.log"));

        let second = LockManager::new(&lock_path, WINDOW);
        assert!(recover_on_startup(&second, &checkpoints, &audit).expect("recover").is_none());
        assert!(!second.acquire(), "the running engine keeps its lease");
        assert!(running.owns_lease());
        assert!(audit.events().expect("events").is_empty());
    }

    #[test]
    fn clean_start_reports_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lock = LockManager::new(temp.path().join("lock.json"), WINDOW);
        let checkpoints = CheckpointStore::new(temp.path().join("checkpoints"));
        let audit = AuditLog::new(temp.path().join("audit.log"));
        assert!(recover_on_startup(&lock, &checkpoints, &audit).expect("recover").is_none());
        assert!(audit.events().expect("events").is_empty());
    }
}
