//! # sarus
//!
//! **Unprivileged OCI container launcher for HPC systems**
//!
//! This crate pulls OCI images, materializes them as read-only squashfs
//! root filesystems, assembles OCI runtime bundles and executes them through
//! an external runc-compatible runtime. A set of in-tree OCI hooks grafts
//! host resources into the running container: ABI-compatible host glibc
//! libraries, a job-wide rendezvous barrier over a shared filesystem, and an
//! on-demand dropbear SSH daemon.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                             sarus                                  │
//! ├────────────────────────────────────────────────────────────────────┤
//! │  ImageBuilder                  ImageStore                          │
//! │  pull / load → rootfs ───────► <server>/<ns>/<image>/<tag>.squashfs│
//! │  whiteouts │ mksquashfs        flock'd mutations, atomic renames   │
//! ├────────────────────────────────────────────────────────────────────┤
//! │  BundleAssembler               MountPlanner                        │
//! │  squashfs → loop → overlay     site │ user (validated) │ devices   │
//! │  config.json + hooks           read-only remount                   │
//! ├────────────────────────────────────────────────────────────────────┤
//! │  RuntimeDriver ──► runc ──► prestart hooks                         │
//! │  signal forwarding             glibc │ slurm-sync │ ssh            │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Security Model
//!
//! The launcher may run setuid-root on multi-user systems; the defenses are
//! layered accordingly:
//!
//! - **Untamperable paths**: every binary and hook consumed with privilege
//!   must be root-owned and not group/world-writable along its whole
//!   ancestor chain (see [`security`]).
//! - **Privilege discipline**: everything that does not need privilege runs
//!   with the invoking user's effective ids (see [`identity`]).
//! - **Mount validation**: user bind requests are checked for readability
//!   under the REAL uid, destination escapes and denied prefixes (see
//!   [`mounts`]).
//! - **Layer expansion**: path traversal rejection, size and entry caps,
//!   whiteouts confined to the staging rootfs (see [`image`]).
//!
//! # Hook Contract
//!
//! Hook binaries receive the OCI State document on standard input, re-read
//! the bundle's `config.json` from disk, and report fatal errors as JSON
//! lines `{level, message, timestamp}` on standard error (see [`hooks`]).

pub mod bundle;
pub mod config;
pub mod constants;
pub mod error;
pub mod hooks;
pub mod identity;
pub mod image;
pub mod mounts;
pub mod platform;
pub mod reference;
pub mod registry;
pub mod runtime;
pub mod security;
pub mod storage;

pub use bundle::{Bundle, BundleAssembler, HooksSpec, OciSpec, ProcessSpec};
pub use config::Config;
pub use error::{Error, Result};
pub use identity::{PrivilegeGuard, UserIdentity};
pub use image::{ImageBuilder, ImageMetadata, ImageSource, PackedImage};
pub use mounts::{Mount, MountPlanner, UserMountRequest};
pub use reference::ImageReference;
pub use runtime::RuntimeDriver;
pub use storage::{ImageStore, StoredImage};
