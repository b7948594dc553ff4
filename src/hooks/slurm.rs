//! Job-step rendezvous across all processes of a Slurm step.
//!
//! Every process of the step creates a uniquely named marker file in a
//! shared, job-scoped directory and polls until the marker count reaches
//! `SLURM_NTASKS`; the same happens symmetrically for departure. The first
//! process (`SLURM_PROCID == 0`) removes the directory once every peer has
//! signalled departure.
//!
//! ```text
//! <localRepo>/slurm_global_sync/slurm-jobid-<J>-stepid-<S>/
//! ├── arrival/slurm-procid-<P>
//! └── departure/slurm-procid-<P>
//! ```
//!
//! Creation races are benign: directory creation is idempotent and marker
//! files are uniquely named per process. The only shared mutation is the
//! final removal, performed by exactly one process after the departure
//! barrier.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::unistd::{Gid, Uid, chown};
use tracing::{debug, info};

use crate::constants::{
    SLURM_JOB_ID_VAR, SLURM_NTASKS_VAR, SLURM_PROCID_VAR, SLURM_STEPID_VAR, SLURM_SYNC_DIR,
    SLURM_SYNC_ACTIVATION_VAR, SLURM_SYNC_TIMEOUT_VAR, SYNC_DEFAULT_TIMEOUT, SYNC_POLL_INTERVAL,
};
use crate::error::{Error, Result};
use crate::hooks::HookContext;

/// The rendezvous hook for one process of a job step.
#[derive(Debug)]
pub struct SlurmSyncHook {
    sync_dir: PathBuf,
    procid: u64,
    ntasks: usize,
    owner: (Uid, Gid),
    deadline: Duration,
}

impl SlurmSyncHook {
    /// Builds the hook from the container's environment. Returns `None`
    /// when the activation variable or any of the Slurm variables is
    /// missing: an inactive hook is a clean no-op, not an error.
    pub fn from_context(context: &HookContext, local_repository: &Path) -> Result<Option<Self>> {
        if context.lookup_env(SLURM_SYNC_ACTIVATION_VAR) != Some("1") {
            debug!("rendezvous hook not activated");
            return Ok(None);
        }

        let slurm_vars = [
            SLURM_JOB_ID_VAR,
            SLURM_STEPID_VAR,
            SLURM_PROCID_VAR,
            SLURM_NTASKS_VAR,
        ];
        let mut values = Vec::with_capacity(slurm_vars.len());
        for name in slurm_vars {
            match context.lookup_env(name) {
                Some(value) => values.push(value),
                None => {
                    debug!("{} not set, rendezvous hook inactive", name);
                    return Ok(None);
                }
            }
        }

        let parse = |name: &str, value: &str| -> Result<u64> {
            value.parse().map_err(|_| Error::HookExecutionFailed {
                hook: "slurm-sync".to_string(),
                reason: format!("{} is not a number: '{}'", name, value),
            })
        };
        let jobid = parse(SLURM_JOB_ID_VAR, values[0])?;
        let stepid = parse(SLURM_STEPID_VAR, values[1])?;
        let procid = parse(SLURM_PROCID_VAR, values[2])?;
        let ntasks = parse(SLURM_NTASKS_VAR, values[3])? as usize;

        let deadline = context
            .lookup_env(SLURM_SYNC_TIMEOUT_VAR)
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(SYNC_DEFAULT_TIMEOUT);

        let sync_dir = local_repository
            .join(SLURM_SYNC_DIR)
            .join(format!("slurm-jobid-{}-stepid-{}", jobid, stepid));

        Ok(Some(Self {
            sync_dir,
            procid,
            ntasks,
            owner: (
                Uid::from_raw(context.spec.process.user.uid),
                Gid::from_raw(context.spec.process.user.gid),
            ),
            deadline,
        }))
    }

    /// Runs the full barrier: arrival, departure, then cleanup by the first
    /// process.
    pub fn perform_synchronization(&self) -> Result<()> {
        self.signal_arrival()?;
        self.wait_until("arrival", || self.all_instances_arrived())?;

        self.signal_departure()?;
        self.wait_until("departure", || self.all_instances_departed())?;

        if self.procid == 0 {
            self.cleanup_sync_dir()?;
        }
        info!("rendezvous complete for procid {}", self.procid);
        Ok(())
    }

    /// Creates this process's arrival marker. Idempotent.
    pub fn signal_arrival(&self) -> Result<()> {
        self.create_marker("arrival")
    }

    /// Whether every process of the step has arrived.
    pub fn all_instances_arrived(&self) -> Result<bool> {
        self.count_markers("arrival").map(|n| n == self.ntasks)
    }

    /// Creates this process's departure marker. Idempotent.
    pub fn signal_departure(&self) -> Result<()> {
        self.create_marker("departure")
    }

    /// Whether every process of the step has departed.
    pub fn all_instances_departed(&self) -> Result<bool> {
        self.count_markers("departure").map(|n| n == self.ntasks)
    }

    /// Removes the whole sync directory. Only the first process calls this,
    /// and only after the departure barrier.
    pub fn cleanup_sync_dir(&self) -> Result<()> {
        match fs::remove_dir_all(&self.sync_dir) {
            Ok(()) => {
                debug!("removed sync dir {}", self.sync_dir.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io_path(&self.sync_dir, e)),
        }
    }

    /// The sync directory of this job step.
    pub fn sync_dir(&self) -> &Path {
        &self.sync_dir
    }

    fn create_marker(&self, phase: &str) -> Result<()> {
        let dir = self.sync_dir.join(phase);
        let path = dir.join(format!("slurm-procid-{}", self.procid));
        fs::create_dir_all(&dir).map_err(|e| Error::io_path(&dir, e))?;

        if path.exists() {
            return Ok(());
        }
        File::create(&path).map_err(|e| Error::io_path(&path, e))?;

        // Marker files belong to the invoking user, so a later run of the
        // same user can clean up after a crash.
        let (uid, gid) = self.owner;
        if Uid::effective().is_root() {
            chown(&path, Some(uid), Some(gid)).map_err(|e| Error::HookExecutionFailed {
                hook: "slurm-sync".to_string(),
                reason: format!("chown {}: {}", path.display(), e),
            })?;
        }
        debug!("created marker {}", path.display());
        Ok(())
    }

    fn count_markers(&self, phase: &str) -> Result<usize> {
        let dir = self.sync_dir.join(phase);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::io_path(&dir, e)),
        };
        let mut count = 0;
        for entry in entries {
            let entry = entry.map_err(|e| Error::io_path(&dir, e))?;
            if entry
                .file_name()
                .to_string_lossy()
                .starts_with("slurm-procid-")
            {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Bounded poll until `condition` holds; expiry is an operator-visible
    /// launch failure, not a hang.
    fn wait_until(&self, phase: &str, condition: impl Fn() -> Result<bool>) -> Result<()> {
        let started = Instant::now();
        loop {
            if condition()? {
                return Ok(());
            }
            if started.elapsed() > self.deadline {
                return Err(Error::Timeout {
                    operation: format!(
                        "waiting for {} of {} processes in {}",
                        phase,
                        self.ntasks,
                        self.sync_dir.display()
                    ),
                    duration: self.deadline,
                });
            }
            std::thread::sleep(SYNC_POLL_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook(dir: &Path, procid: u64, ntasks: usize) -> SlurmSyncHook {
        SlurmSyncHook {
            sync_dir: dir.join("slurm-jobid-256-stepid-32"),
            procid,
            ntasks,
            owner: (Uid::current(), Gid::current()),
            deadline: Duration::from_secs(1),
        }
    }

    #[test]
    fn arrival_is_idempotent() {
        let temp = tempfile::TempDir::new().unwrap();
        let hook = hook(temp.path(), 0, 2);

        hook.signal_arrival().unwrap();
        hook.signal_arrival().unwrap();

        assert_eq!(hook.count_markers("arrival").unwrap(), 1);
    }

    #[test]
    fn barrier_counts_distinct_markers() {
        let temp = tempfile::TempDir::new().unwrap();
        let hook = hook(temp.path(), 0, 2);

        hook.signal_arrival().unwrap();
        assert!(!hook.all_instances_arrived().unwrap());

        // Simulate the peer's arrival.
        File::create(hook.sync_dir().join("arrival/slurm-procid-1")).unwrap();
        assert!(hook.all_instances_arrived().unwrap());
    }

    #[test]
    fn single_task_step_completes_immediately() {
        let temp = tempfile::TempDir::new().unwrap();
        let hook = hook(temp.path(), 0, 1);

        hook.perform_synchronization().unwrap();
        assert!(!hook.sync_dir().exists());
    }

    #[test]
    fn cleanup_removes_the_tree() {
        let temp = tempfile::TempDir::new().unwrap();
        let hook = hook(temp.path(), 0, 1);

        hook.signal_arrival().unwrap();
        hook.signal_departure().unwrap();
        assert!(hook.sync_dir().exists());

        hook.cleanup_sync_dir().unwrap();
        assert!(!hook.sync_dir().exists());
    }
}
