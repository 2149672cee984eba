//! Cooperative lease lock over the control directory.
//!
//! The lease is `lock.json` (`{"owner", "acquiredAt"}`). Acquisition never
//! blocks: callers retry through the execution queue. A lease older than the
//! staleness window is abandoned and any acquirer may reclaim it.
//!
//! New leases are written to a temp file and hard-linked into place, so the
//! lease file is created exclusively and never observed half-written.
//! A lease that is not stale is never removed by `acquire`; only
//! `force_clear` does that. Reclaiming a stale lease removes it first, so two
//! processes reclaiming the same stale lease at the same instant can both
//! remove before either links.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
}

impl Lease {
    /// Age at `now`; zero when the clock went backwards.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.acquired_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_stale(&self, window: Duration, now: DateTime<Utc>) -> bool {
        self.age(now) > window
    }

    /// Process id embedded in an `engine-<pid>-<suffix>` owner.
    pub fn owner_pid(&self) -> Option<u32> {
        let rest = self.owner.strip_prefix("engine-")?;
        let (pid, _) = rest.split_once('-')?;
        pid.parse().ok()
    }
}

#[derive(Debug, Clone)]
pub struct LockManager {
    path: PathBuf,
    owner: String,
    stale_after: Duration,
}

impl LockManager {
    pub fn new(path: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self::with_owner(path, generate_owner_id(), stale_after)
    }

    pub fn with_owner(path: impl Into<PathBuf>, owner: impl Into<String>, stale_after: Duration) -> Self {
        Self {
            path: path.into(),
            owner: owner.into(),
            stale_after,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current lease, treating any read or parse error as no lease.
    pub fn read_lease(&self) -> Option<Lease> {
        match self.probe() {
            Probe::Held(lease) => Some(lease),
            Probe::Absent | Probe::Corrupt => None,
        }
    }

    fn probe(&self) -> Probe {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Probe::Absent,
            Err(err) => {
                warn!(path = %self.path.display(), err = %err, "unreadable lease treated as absent");
                return Probe::Corrupt;
            }
        };
        match serde_json::from_str(&contents) {
            Ok(lease) => Probe::Held(lease),
            Err(err) => {
                warn!(path = %self.path.display(), err = %err, "corrupt lease treated as absent");
                Probe::Corrupt
            }
        }
    }

    /// Try to take the lease. Returns false when another owner holds a
    /// valid lease.
    #[instrument(skip_all, fields(owner = %self.owner))]
    pub fn acquire(&self) -> bool {
        let now = Utc::now();
        match self.probe() {
            Probe::Held(lease) if lease.owner == self.owner => {
                debug!("refreshing own lease");
                return match self.write_lease(now, true) {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(err = %err, "failed to refresh lease");
                        false
                    }
                };
            }
            Probe::Held(lease) if !lease.is_stale(self.stale_after, now) => {
                debug!(holder = %lease.owner, "lease held by another owner");
                return false;
            }
            Probe::Held(lease) => {
                info!(
                    holder = %lease.owner,
                    age_secs = lease.age(now).as_secs(),
                    "reclaiming stale lease"
                );
                self.remove_file();
            }
            Probe::Corrupt => self.remove_file(),
            Probe::Absent => {}
        }

        match self.write_lease(now, false) {
            Ok(()) => {
                debug!("lease acquired");
                true
            }
            Err(err) => {
                debug!(err = %err, "lease acquisition lost");
                false
            }
        }
    }

    /// Drop the lease if this manager owns it. Failures are swallowed.
    pub fn release(&self) {
        match self.read_lease() {
            Some(lease) if lease.owner == self.owner => {
                self.remove_file();
                debug!(owner = %self.owner, "lease released");
            }
            _ => {}
        }
    }

    /// True while any owner holds a non-stale lease.
    pub fn is_locked(&self) -> bool {
        self.read_lease()
            .is_some_and(|lease| !lease.is_stale(self.stale_after, Utc::now()))
    }

    pub fn owns_lease(&self) -> bool {
        self.read_lease()
            .is_some_and(|lease| lease.owner == self.owner && !lease.is_stale(self.stale_after, Utc::now()))
    }

    /// True when `lease` belongs to an engine that is no longer running:
    /// it outlived the staleness window, or its owning process is gone.
    pub fn is_abandoned(&self, lease: &Lease, now: DateTime<Utc>) -> bool {
        if lease.is_stale(self.stale_after, now) {
            return true;
        }
        lease
            .owner_pid()
            .filter(|pid| *pid != std::process::id())
            .and_then(process_alive)
            .is_some_and(|alive| !alive)
    }

    /// Remove the lease regardless of owner. Returns whether one existed.
    pub fn force_clear(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "lease force-cleared");
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("remove {}", self.path.display())),
        }
    }

    /// Acquire and return a guard that releases on drop.
    pub fn guard(&self) -> Option<LeaseGuard<'_>> {
        self.acquire().then_some(LeaseGuard { lock: self })
    }

    fn write_lease(&self, now: DateTime<Utc>, replace: bool) -> Result<()> {
        let lease = Lease {
            owner: self.owner.clone(),
            acquired_at: now,
        };
        let mut buf = serde_json::to_string_pretty(&lease).context("serialize lease")?;
        buf.push('\n');
        if replace {
            return crate::io::atomic::write_text(&self.path, &buf);
        }

        let parent = self
            .path
            .parent()
            .with_context(|| format!("lease path missing parent {}", self.path.display()))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
        let tmp = parent.join(format!(".lock.{}.tmp", sanitize(&self.owner)));
        fs::write(&tmp, buf).with_context(|| format!("write {}", tmp.display()))?;
        let linked = fs::hard_link(&tmp, &self.path);
        let _ = fs::remove_file(&tmp);
        linked.with_context(|| format!("create lease {}", self.path.display()))
    }

    fn remove_file(&self) {
        if let Err(err) = fs::remove_file(&self.path)
            && err.kind() != ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), err = %err, "failed to remove lease");
        }
    }
}

enum Probe {
    Absent,
    Corrupt,
    Held(Lease),
}

/// Releases the lease when dropped, on every exit path.
#[derive(Debug)]
pub struct LeaseGuard<'a> {
    lock: &'a LockManager,
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

fn generate_owner_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("engine-{}-{}", std::process::id(), suffix.to_lowercase())
}

/// Liveness of `pid`, when the platform can tell.
#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> Option<bool> {
    let proc_root = Path::new("/proc");
    if !proc_root.join("self").exists() {
        return None;
    }
    Some(proc_root.join(pid.to_string()).exists())
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> Option<bool> {
    None
}

fn sanitize(owner: &str) -> String {
    owner
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
