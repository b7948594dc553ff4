//! Constants for the container launcher and its hooks.
//!
//! All limits, timeouts, layout names and environment-variable names are
//! defined here to ensure consistency and prevent magic values throughout
//! the codebase.

use std::time::Duration;

// =============================================================================
// Size Limits
// =============================================================================

/// Maximum image reference length (bytes).
/// Prevents injection attacks via overly long image names.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum size of a single compressed image layer (512 MiB).
pub const MAX_LAYER_SIZE: usize = 512 * 1024 * 1024;

/// Maximum total expanded rootfs size (16 GiB).
/// HPC images carrying MPI stacks are considerably larger than
/// service-container images.
pub const MAX_ROOTFS_SIZE: u64 = 16 * 1024 * 1024 * 1024;

/// Maximum number of layers in an OCI image.
pub const MAX_LAYERS: usize = 128;

/// Maximum manifest size (1 MiB).
pub const MAX_MANIFEST_SIZE: usize = 1024 * 1024;

/// Maximum image config blob size (1 MiB).
pub const MAX_CONFIG_SIZE: usize = 1024 * 1024;

/// Maximum files per layer, against inode exhaustion.
pub const MAX_FILES_PER_LAYER: usize = 1_000_000;

// =============================================================================
// Timeouts and Retries
// =============================================================================

/// Timeout for a single registry network operation.
pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Attempts for transient registry failures (first try included).
pub const IMAGE_PULL_ATTEMPTS: u32 = 3;

/// Base delay of the exponential pull backoff.
pub const IMAGE_PULL_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Poll interval of the job-step rendezvous barrier.
pub const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default wall-clock deadline of the rendezvous barrier.
pub const SYNC_DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

// =============================================================================
// Repository Layout
// =============================================================================

/// Lock file serializing image-store mutations, relative to the store base.
pub const STORE_LOCK_FILE: &str = ".lock";

/// Extension of the packed image file.
pub const SQUASHFS_EXT: &str = "squashfs";

/// Extension of the image metadata file.
pub const METADATA_EXT: &str = "meta";

/// Subdirectory of the local repository holding job-step sync directories.
pub const SLURM_SYNC_DIR: &str = "slurm_global_sync";

/// Per-user hook state below the local repository.
pub const OCI_HOOKS_DIR: &str = ".oci-hooks";

// =============================================================================
// Image Reference Defaults
// =============================================================================

/// Default registry server.
pub const DEFAULT_SERVER: &str = "index.docker.io";

/// Default image namespace.
pub const DEFAULT_NAMESPACE: &str = "library";

/// Default image tag.
pub const DEFAULT_TAG: &str = "latest";

// =============================================================================
// OCI Spec
// =============================================================================

/// OCI Runtime Spec version emitted in config.json.
pub const OCI_RUNTIME_SPEC_VERSION: &str = "1.0.2";

/// Paths masked inside every container.
pub const MASKED_PATHS: &[&str] = &[
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/proc/scsi",
    "/sys/firmware",
];

/// Paths remounted read-only inside every container.
pub const READONLY_PATHS: &[&str] = &[
    "/proc/asound",
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

/// Minimal capability set granted to the container process.
pub const DEFAULT_CAPABILITIES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_NET_BIND_SERVICE",
];

// =============================================================================
// Hook Activation Environment
// =============================================================================

/// Installation prefix handed to hook processes, which re-read the admin
/// configuration from disk instead of sharing the launcher's address space.
pub const PREFIX_DIR_VAR: &str = "SARUS_PREFIX_DIR";

/// Activation variable of the job-step rendezvous hook.
pub const SLURM_SYNC_ACTIVATION_VAR: &str = "SARUS_SLURM_GLOBAL_SYNC_HOOK";

/// Slurm variables the rendezvous hook requires.
pub const SLURM_JOB_ID_VAR: &str = "SLURM_JOB_ID";
pub const SLURM_STEPID_VAR: &str = "SLURM_STEPID";
pub const SLURM_PROCID_VAR: &str = "SLURM_PROCID";
pub const SLURM_NTASKS_VAR: &str = "SLURM_NTASKS";

/// Override of the rendezvous deadline, in seconds.
pub const SLURM_SYNC_TIMEOUT_VAR: &str = "SARUS_SLURM_SYNC_TIMEOUT_SECONDS";

/// Activation variable of the SSH hook.
pub const SSH_ACTIVATION_VAR: &str = "SARUS_SSH_HOOK";

/// Annotation form of the SSH activation switch.
pub const SSH_ACTIVATION_ANNOTATION: &str = "com.hooks.ssh.enabled";

/// Annotation naming a public key to authorize inside the container.
pub const SSH_AUTHORIZE_KEY_ANNOTATION: &str = "com.hooks.ssh.authorize_ssh_key";

/// Colon-separated list of host libraries offered to the glibc hook.
pub const GLIBC_LIBS_VAR: &str = "GLIBC_LIBS";

/// Trusted ELF tooling consumed by the glibc hook.
pub const LDCONFIG_PATH_VAR: &str = "LDCONFIG_PATH";
pub const READELF_PATH_VAR: &str = "READELF_PATH";

/// SSH hook environment: host dropbear install, daemon port, key base dir.
pub const DROPBEAR_DIR_VAR: &str = "DROPBEAR_DIR";
pub const SERVER_PORT_VAR: &str = "SERVER_PORT";
pub const HOOK_BASE_DIR_VAR: &str = "HOOK_BASE_DIR";

/// Dropbear mountpoint inside the container.
pub const DROPBEAR_DIR_IN_CONTAINER: &str = "/opt/oci-hooks/dropbear";

/// Prefix of glibc backup files below the rootfs.
pub const GLIBC_BACKUP_PREFIX: &str = ".sarus.bak.";

// =============================================================================
// Process Exit Codes
// =============================================================================

/// Success.
pub const EXIT_OK: u8 = 0;
/// Invalid invocation.
pub const EXIT_USAGE: u8 = 1;
/// Configuration error.
pub const EXIT_CONFIG: u8 = 2;
/// Security violation.
pub const EXIT_SECURITY: u8 = 3;
/// Image not found.
pub const EXIT_IMAGE_NOT_FOUND: u8 = 4;
/// Hook failure.
pub const EXIT_HOOK: u8 = 5;
/// Underlying runtime failure.
pub const EXIT_RUNTIME: u8 = 6;
