//! Shared hook runtime.
//!
//! Every hook binary obeys the OCI hook contract: the runtime writes a JSON
//! State document on the hook's standard input, and the hook recovers the
//! container's environment and annotations from the bundle's `config.json`
//! on disk. Hooks never share address space with the launcher.
//!
//! This module provides the shared pieces: state ingestion, environment
//! lookup, namespace entry with verification, and the JSON-lines diagnostic
//! format hooks emit on stderr.

pub mod glibc;
pub mod slurm;
pub mod ssh;

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::sched::{CloneFlags, setns};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bundle::OciSpec;
use crate::error::{Error, Result};

// =============================================================================
// State Ingestion
// =============================================================================

/// The OCI runtime State document, as delivered on standard input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    pub oci_version: String,
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub pid: Option<i32>,
    pub bundle: PathBuf,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

impl ContainerState {
    /// Parses a State document from a reader (standard input in hooks).
    pub fn from_reader(mut reader: impl Read) -> Result<Self> {
        let mut raw = String::new();
        reader
            .read_to_string(&mut raw)
            .map_err(|e| Error::HookExecutionFailed {
                hook: "state".to_string(),
                reason: format!("failed to read state from stdin: {}", e),
            })?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Everything a hook needs for one invocation: the State document plus the
/// bundle's `config.json`.
#[derive(Debug)]
pub struct HookContext {
    pub state: ContainerState,
    pub spec: OciSpec,
}

impl HookContext {
    /// Reads the State from standard input and the spec from the bundle.
    pub fn from_stdin() -> Result<Self> {
        Self::from_reader(io::stdin().lock())
    }

    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let state = ContainerState::from_reader(reader)?;
        let config_path = state.bundle.join("config.json");
        let raw = fs::read_to_string(&config_path).map_err(|e| Error::io_path(&config_path, e))?;
        let spec: OciSpec = serde_json::from_str(&raw)?;
        Ok(Self { state, spec })
    }

    /// Looks a variable up in the container's `process.env`.
    pub fn lookup_env(&self, name: &str) -> Option<&str> {
        lookup_env(&self.spec.process.env, name)
    }

    /// Looks an annotation up, preferring the State document over the spec.
    pub fn annotation(&self, name: &str) -> Option<&str> {
        self.state
            .annotations
            .get(name)
            .or_else(|| self.spec.annotations.get(name))
            .map(String::as_str)
    }

    /// The container's rootfs, resolved against the bundle directory.
    pub fn rootfs(&self) -> PathBuf {
        let root = Path::new(&self.spec.root.path);
        if root.is_absolute() {
            root.to_path_buf()
        } else {
            self.state.bundle.join(root)
        }
    }

    /// The container init pid, required by namespace-entering hooks.
    pub fn container_pid(&self) -> Result<i32> {
        self.state.pid.filter(|p| *p > 0).ok_or_else(|| {
            Error::HookExecutionFailed {
                hook: "state".to_string(),
                reason: "state document carries no container pid".to_string(),
            }
        })
    }
}

/// Looks up `name` in `KEY=VALUE` environment entries.
pub fn lookup_env<'a>(env: &'a [String], name: &str) -> Option<&'a str> {
    env.iter().find_map(|kv| {
        kv.split_once('=')
            .filter(|(k, _)| *k == name)
            .map(|(_, v)| v)
    })
}

// =============================================================================
// Namespace Entry
// =============================================================================

/// Scoped entry into another process's namespace.
///
/// Records the caller's namespace before switching and restores it on drop,
/// unless [`NamespaceGuard::disarm`] was called (a hook about to exec has no
/// reason to switch back).
pub struct NamespaceGuard {
    original: Option<File>,
    kind: &'static str,
    flag: CloneFlags,
}

impl NamespaceGuard {
    /// Enters the mount namespace of `pid`.
    pub fn enter_mount_namespace(pid: i32) -> Result<Self> {
        Self::enter(pid, "mnt", CloneFlags::CLONE_NEWNS)
    }

    /// Enters the pid namespace of `pid` (effective for children only).
    pub fn enter_pid_namespace(pid: i32) -> Result<Self> {
        Self::enter(pid, "pid", CloneFlags::CLONE_NEWPID)
    }

    fn enter(pid: i32, kind: &'static str, flag: CloneFlags) -> Result<Self> {
        let ns_error = |reason: String| Error::HookExecutionFailed {
            hook: "setns".to_string(),
            reason,
        };

        let own_path = format!("/proc/self/ns/{}", kind);
        // A pid-namespace switch only applies to children; the caller's own
        // membership is visible through pid_for_children.
        let verify_path = match kind {
            "pid" => "/proc/self/ns/pid_for_children".to_string(),
            _ => own_path.clone(),
        };
        let target_path = format!("/proc/{}/ns/{}", pid, kind);

        // The target's namespace identifier, captured before switching so
        // the switch can be verified afterwards.
        let target_id = fs::read_link(&target_path)
            .map_err(|e| ns_error(format!("cannot read {}: {}", target_path, e)))?;

        let original = File::open(&own_path)
            .map_err(|e| ns_error(format!("cannot open {}: {}", own_path, e)))?;
        let target = File::open(&target_path)
            .map_err(|e| ns_error(format!("cannot open {}: {}", target_path, e)))?;

        setns(target.as_fd(), flag).map_err(|e| ns_error(format!("setns {}: {}", kind, e)))?;

        // Verify: our namespace identifier must now equal the target's.
        let current_id = fs::read_link(&verify_path)
            .map_err(|e| ns_error(format!("cannot verify {}: {}", verify_path, e)))?;
        if current_id != target_id {
            return Err(ns_error(format!(
                "namespace switch not effective: {:?} != {:?}",
                current_id, target_id
            )));
        }

        debug!("entered {} namespace of pid {}", kind, pid);
        Ok(Self {
            original: Some(original),
            kind,
            flag,
        })
    }

    /// Keeps the new namespace past the guard's lifetime.
    pub fn disarm(mut self) {
        self.original = None;
    }
}

impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        if let Some(original) = self.original.take() {
            if let Err(e) = setns(original.as_fd(), self.flag) {
                // Restoration failure must not panic a hook mid-teardown.
                eprintln!("failed to restore {} namespace: {}", self.kind, e);
            }
        }
    }
}

// =============================================================================
// Diagnostics
// =============================================================================

/// One JSON-lines diagnostic record, the hook stderr contract.
#[derive(Debug, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: String,
    pub message: String,
    pub timestamp: u64,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: "error".to_string(),
            message: message.into(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }
}

/// Writes a fatal diagnostic line to stderr.
pub fn emit_fatal(message: impl Into<String>) {
    let record = Diagnostic::error(message);
    if let Ok(line) = serde_json::to_string(&record) {
        let _ = writeln!(io::stderr(), "{}", line);
    }
}
