//! Error types for the container launcher.

use std::path::PathBuf;

use crate::constants::{
    EXIT_CONFIG, EXIT_HOOK, EXIT_IMAGE_NOT_FOUND, EXIT_RUNTIME, EXIT_SECURITY, EXIT_USAGE,
};

/// Result type alias for launcher operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while pulling, assembling or running a container.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Security
    // =========================================================================
    /// A path that influences privileged execution is tamperable.
    #[error("security violation on {path}: {reason} (uid={uid}, mode={mode:o})")]
    SecurityViolation {
        path: PathBuf,
        reason: String,
        uid: u32,
        mode: u32,
    },

    // =========================================================================
    // Configuration
    // =========================================================================
    /// The admin configuration is missing, unreadable or invalid.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Invalid command-line invocation.
    #[error("invalid invocation: {0}")]
    InvalidInvocation(String),

    // =========================================================================
    // Images
    // =========================================================================
    /// Failed to parse an image reference.
    #[error("'{reference}' is not a valid server/namespace/image:tag reference: {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// The requested image is not in the local repository.
    #[error("image {0} is not in the repository, pull or load it first")]
    ImageNotFound(String),

    /// Registry pull failed after exhausting retries.
    #[error("giving up on pulling '{reference}': {reason}")]
    ImagePullFailed { reference: String, reason: String },

    /// Layer expansion failed.
    #[error("cannot expand layer {digest} into the staging rootfs: {reason}")]
    LayerExpansionFailed { digest: String, reason: String },

    /// An image or layer exceeds the configured size limits.
    #[error("refusing image data of {size} bytes (cap is {limit})")]
    ImageTooLarge { size: u64, limit: u64 },

    /// Path traversal attempt detected in a layer archive.
    #[error("layer entry '{path}' escapes the staging rootfs")]
    PathTraversal { path: String },

    // =========================================================================
    // Bundle and Mounts
    // =========================================================================
    /// Failed to assemble the OCI runtime bundle.
    #[error("bundle assembly failed: {0}")]
    BundleBuildFailed(String),

    /// A requested mount was rejected by validation.
    #[error("mount denied: {source_path} -> {destination}: {reason}")]
    MountDenied {
        source_path: PathBuf,
        destination: PathBuf,
        reason: String,
    },

    // =========================================================================
    // Hooks
    // =========================================================================
    /// A hook was invoked without its activation condition being satisfied.
    #[error("hook activation missing: {0}")]
    HookActivationMissing(String),

    /// A hook failed during execution.
    #[error("hook '{hook}' failed: {reason}")]
    HookExecutionFailed { hook: String, reason: String },

    // =========================================================================
    // Runtime
    // =========================================================================
    /// The low-level OCI runtime failed.
    #[error("runtime failed: {0}")]
    RuntimeFailed(String),

    // =========================================================================
    // I/O and Timeouts
    // =========================================================================
    /// Generic I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An I/O failure with path context.
    #[error("I/O error on {path}: {reason}")]
    IoPath { path: PathBuf, reason: String },

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },
}

impl Error {
    /// Maps an error to the process exit code contract.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::SecurityViolation { .. } | Error::MountDenied { .. } => EXIT_SECURITY,
            Error::ConfigInvalid(_) => EXIT_CONFIG,
            Error::InvalidInvocation(_) | Error::InvalidImageReference { .. } => EXIT_USAGE,
            Error::ImageNotFound(_) => EXIT_IMAGE_NOT_FOUND,
            Error::HookActivationMissing(_) | Error::HookExecutionFailed { .. } => EXIT_HOOK,
            Error::RuntimeFailed(_) => EXIT_RUNTIME,
            _ => EXIT_RUNTIME,
        }
    }

    /// Whether retrying the operation may succeed.
    ///
    /// Security and configuration errors are never retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ImagePullFailed { .. } | Error::Timeout { .. } | Error::Io(_)
        )
    }

    /// Attaches path context to an I/O error.
    pub fn io_path(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        Error::IoPath {
            path: path.into(),
            reason: err.to_string(),
        }
    }
}
