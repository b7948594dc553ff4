//! Low-level OCI runtime driver.
//!
//! Spawns the configured runc-compatible runtime on an assembled bundle,
//! forwards termination signals to it, and propagates its exit code. The
//! runtime binary is treated as an opaque trusted executable; it must pass
//! the untamperability check before every spawn.

use std::os::unix::process::ExitStatusExt;
use std::process::{Child, Command};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::bundle::Bundle;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::security;

/// Last forwardable signal received by the launcher, 0 when none.
static PENDING_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn record_signal(signum: libc::c_int) {
    PENDING_SIGNAL.store(signum, Ordering::SeqCst);
}

/// Drives one container run through the external runtime.
pub struct RuntimeDriver {
    config: Arc<Config>,
}

impl RuntimeDriver {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Runs the container and returns its exit code. The bundle is always
    /// torn down, on success and on every failure path.
    pub fn run(&self, bundle: &mut Bundle, container_id: &str) -> Result<i32> {
        let result = self.run_inner(bundle, container_id);
        bundle.teardown();
        result
    }

    fn run_inner(&self, bundle: &Bundle, container_id: &str) -> Result<i32> {
        security::assert_untamperable(&self.config.runc_path)?;

        let state_root = self.config.local_repository_base_dir.join("runc-state");

        info!("starting container {} via {}", container_id, self.config.runc_path.display());
        let child = Command::new(&self.config.runc_path)
            .arg("--root")
            .arg(&state_root)
            .arg("run")
            .arg("--bundle")
            .arg(bundle.path())
            .arg(container_id)
            .spawn()
            .map_err(|e| Error::RuntimeFailed(format!("failed to spawn runtime: {}", e)))?;

        install_forwarding_handlers()?;
        let status = wait_forwarding_signals(child)?;

        let code = match (status.code(), status.signal()) {
            (Some(code), _) => code,
            (None, Some(signum)) => 128 + signum,
            _ => 1,
        };
        debug!("container {} exited with {}", container_id, code);
        Ok(code)
    }
}

/// Installs handlers recording SIGINT, SIGTERM and SIGHUP for forwarding.
fn install_forwarding_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(record_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
        // SAFETY: the handler only performs an atomic store.
        unsafe { signal::sigaction(sig, &action) }
            .map_err(|e| Error::RuntimeFailed(format!("sigaction: {}", e)))?;
    }
    Ok(())
}

/// Waits for the runtime to exit, relaying any recorded signal to it.
fn wait_forwarding_signals(mut child: Child) -> Result<std::process::ExitStatus> {
    let pid = Pid::from_raw(child.id() as i32);
    loop {
        if let Some(status) = child
            .try_wait()
            .map_err(|e| Error::RuntimeFailed(format!("wait: {}", e)))?
        {
            return Ok(status);
        }

        let pending = PENDING_SIGNAL.swap(0, Ordering::SeqCst);
        if pending != 0 {
            match Signal::try_from(pending) {
                Ok(sig) => {
                    debug!("forwarding {} to the runtime", sig);
                    if let Err(e) = signal::kill(pid, sig) {
                        warn!("failed to forward {}: {}", sig, e);
                    }
                }
                Err(_) => warn!("ignoring unknown signal {}", pending),
            }
        }

        std::thread::sleep(Duration::from_millis(20));
    }
}
