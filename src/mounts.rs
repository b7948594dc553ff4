//! Mount planning and application.
//!
//! Computes the ordered list of mounts applied inside the container's mount
//! namespace and validates user requests. Ordering contract:
//!
//! 1. Site-administrator mounts from the admin config.
//! 2. Validated user mounts.
//! 3. Device mounts (defaults plus allow-listed requests).
//! 4. A final read-only remount of the rootfs where configured.
//!
//! Each mount variant compiles to plain syscall arguments
//! ([`MountArgs`]); a single executor performs the mount(2) calls. The
//! compile step is pure and fully testable without privilege.
//!
//! ## User-mount validation
//!
//! A requested bind `src:dst` is accepted iff the source exists and is
//! readable by the invoking user (real uid, so a setuid launcher grants no
//! elevation), the destination resolves inside the rootfs without escaping
//! through symlinks, the destination is not under a denied prefix, and the
//! requested flags are a subset of the admin-allowed set.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};

use nix::mount::{MsFlags, mount};
use nix::sys::stat::{Mode, SFlag, mknod};
use nix::unistd::{AccessFlags, access};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};

/// Destination prefixes no user mount may target, beyond the admin denylist.
const BUILTIN_DENIED_PREFIXES: &[&str] = &["/etc", "/proc", "/sys", "/dev"];

/// Device files bound into every container.
const DEFAULT_DEVICES: &[&str] = &[
    "/dev/null",
    "/dev/zero",
    "/dev/full",
    "/dev/random",
    "/dev/urandom",
    "/dev/tty",
];

/// Symlink resolution depth bound inside the rootfs.
const MAX_SYMLINK_DEPTH: usize = 40;

// =============================================================================
// Flags
// =============================================================================

/// Parses a config-level flag name into mount bits.
pub fn parse_flag(name: &str) -> Result<MsFlags> {
    match name {
        "readonly" | "ro" => Ok(MsFlags::MS_RDONLY),
        "nosuid" => Ok(MsFlags::MS_NOSUID),
        "nodev" => Ok(MsFlags::MS_NODEV),
        "noexec" => Ok(MsFlags::MS_NOEXEC),
        "bind" => Ok(MsFlags::MS_BIND),
        "recursive" | "rec" => Ok(MsFlags::MS_REC),
        "private" => Ok(MsFlags::MS_PRIVATE),
        other => Err(Error::ConfigInvalid(format!("unknown mount flag '{}'", other))),
    }
}

fn parse_flags(names: &[String]) -> Result<MsFlags> {
    let mut flags = MsFlags::empty();
    for name in names {
        flags |= parse_flag(name)?;
    }
    Ok(flags)
}

// =============================================================================
// Mount Variants
// =============================================================================

/// A planned mount. The variant records who asked for it; validation
/// differs, application does not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mount {
    /// Site-administrator mount, trusted as configured.
    Site {
        source: PathBuf,
        destination: PathBuf,
        flags: MsFlags,
    },
    /// User-requested bind mount, only ever constructed by validation.
    User {
        source: PathBuf,
        destination: PathBuf,
        flags: MsFlags,
    },
    /// Host device file grafted into the container's /dev.
    Device {
        source: PathBuf,
        destination: PathBuf,
    },
}

/// Plain syscall arguments a mount compiles to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountArgs {
    pub source: PathBuf,
    /// Container-side destination, absolute within the rootfs.
    pub destination: PathBuf,
    pub flags: MsFlags,
}

impl Mount {
    /// Container-side destination of the mount.
    pub fn destination(&self) -> &Path {
        match self {
            Mount::Site { destination, .. }
            | Mount::User { destination, .. }
            | Mount::Device { destination, .. } => destination,
        }
    }

    /// Compiles the mount to syscall arguments. Bind semantics are implied
    /// for every variant; user mounts always carry nosuid and nodev.
    pub fn compile(&self) -> MountArgs {
        match self {
            Mount::Site {
                source,
                destination,
                flags,
            } => MountArgs {
                source: source.clone(),
                destination: destination.clone(),
                flags: *flags | MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            },
            Mount::User {
                source,
                destination,
                flags,
            } => MountArgs {
                source: source.clone(),
                destination: destination.clone(),
                flags: *flags
                    | MsFlags::MS_BIND
                    | MsFlags::MS_REC
                    | MsFlags::MS_PRIVATE
                    | MsFlags::MS_NOSUID
                    | MsFlags::MS_NODEV,
            },
            Mount::Device {
                source,
                destination,
            } => MountArgs {
                source: source.clone(),
                destination: destination.clone(),
                flags: MsFlags::MS_BIND | MsFlags::MS_NOSUID,
            },
        }
    }

    /// Applies the mount below `rootfs`. Must run inside the container's
    /// mount namespace.
    pub fn apply(&self, rootfs: &Path) -> Result<()> {
        let args = self.compile();
        let target = resolve_in_rootfs(rootfs, &args.destination)?;

        if let Mount::Device { source, .. } = self {
            create_device_node(source, &target)?;
        } else {
            prepare_mount_point(&args.source, &target)?;
        }

        bind_mount(&args.source, &target, args.flags)
    }
}

// =============================================================================
// Planner
// =============================================================================

/// A user-requested bind mount, before validation.
#[derive(Debug, Clone)]
pub struct UserMountRequest {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub flags: Vec<String>,
}

/// Computes and validates the ordered mount list for one run.
pub struct MountPlanner<'a> {
    config: &'a Config,
}

impl<'a> MountPlanner<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// Produces the full ordered mount plan.
    pub fn plan(
        &self,
        user_requests: &[UserMountRequest],
        user_devices: &[PathBuf],
        rootfs: &Path,
    ) -> Result<Vec<Mount>> {
        let mut mounts = Vec::new();

        for entry in &self.config.site_mounts {
            mounts.push(Mount::Site {
                source: entry.source.clone(),
                destination: entry.destination.clone(),
                flags: parse_flags(&entry.flags)?,
            });
        }

        for request in user_requests {
            mounts.push(self.validate_user_mount(request, rootfs)?);
        }

        for device in DEFAULT_DEVICES {
            mounts.push(Mount::Device {
                source: PathBuf::from(device),
                destination: PathBuf::from(device),
            });
        }
        for device in user_devices {
            mounts.push(self.validate_device_request(device)?);
        }

        Ok(mounts)
    }

    /// Validates one user bind request against the admin policy.
    pub fn validate_user_mount(
        &self,
        request: &UserMountRequest,
        rootfs: &Path,
    ) -> Result<Mount> {
        let policy = &self.config.user_mounts;
        let denied = |reason: String| Error::MountDenied {
            source_path: request.source.clone(),
            destination: request.destination.clone(),
            reason,
        };

        if !request.destination.is_absolute() {
            return Err(denied("destination must be absolute".to_string()));
        }
        if !request.source.is_absolute() {
            return Err(denied("source must be absolute".to_string()));
        }

        // Readability is checked against the REAL uid, so a setuid launcher
        // cannot be used to bind files the invoking user cannot read.
        if access(&request.source, AccessFlags::R_OK).is_err() {
            return Err(denied("source does not exist or is not readable".to_string()));
        }

        // Resolve the destination inside the rootfs; escape attempts fail.
        let resolved_host = resolve_in_rootfs(rootfs, &request.destination)
            .map_err(|_| denied("destination escapes the container rootfs".to_string()))?;
        let container_destination = container_side(rootfs, &resolved_host);

        if container_destination == Path::new("/") {
            return Err(denied("destination '/' is not allowed".to_string()));
        }
        for prefix in BUILTIN_DENIED_PREFIXES {
            if container_destination.starts_with(prefix) {
                return Err(denied(format!("destination under denied prefix {}", prefix)));
            }
        }
        for prefix in &policy.denied_prefixes {
            if container_destination.starts_with(prefix) {
                return Err(denied(format!(
                    "destination under denied prefix {}",
                    prefix.display()
                )));
            }
        }

        for flag in &request.flags {
            if !policy.allowed_flags.contains(flag) {
                return Err(denied(format!("flag '{}' not allowed by site policy", flag)));
            }
        }

        Ok(Mount::User {
            source: request.source.clone(),
            destination: container_destination,
            flags: parse_flags(&request.flags)?,
        })
    }

    fn validate_device_request(&self, device: &Path) -> Result<Mount> {
        if !self.config.user_mounts.allowed_devices.iter().any(|d| d == device) {
            return Err(Error::MountDenied {
                source_path: device.to_path_buf(),
                destination: device.to_path_buf(),
                reason: "device not in the site allow-list".to_string(),
            });
        }
        Ok(Mount::Device {
            source: device.to_path_buf(),
            destination: device.to_path_buf(),
        })
    }
}

// =============================================================================
// Application
// =============================================================================

/// Applies the plan in order, then remounts the rootfs read-only when the
/// admin marked it so.
pub fn apply_plan(mounts: &[Mount], rootfs: &Path, readonly_rootfs: bool) -> Result<()> {
    for planned in mounts {
        debug!("mounting {:?}", planned.destination());
        planned.apply(rootfs)?;
    }
    if readonly_rootfs {
        remount_readonly(rootfs)?;
    }
    Ok(())
}

/// Bind-mounts `source` on `target`, applying restrictive flags with the
/// remount pass that bind mounts require.
pub fn bind_mount(source: &Path, target: &Path, flags: MsFlags) -> Result<()> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | (flags & MsFlags::MS_REC),
        None::<&str>,
    )
    .map_err(|e| mount_error(source, target, "bind", e))?;

    let restrictive = flags
        & (MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC);
    if !restrictive.is_empty() {
        mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | restrictive,
            None::<&str>,
        )
        .map_err(|e| mount_error(source, target, "remount", e))?;
    }

    if flags.contains(MsFlags::MS_PRIVATE) {
        mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_PRIVATE | (flags & MsFlags::MS_REC),
            None::<&str>,
        )
        .map_err(|e| mount_error(source, target, "make-private", e))?;
    }
    Ok(())
}

/// Final read-only remount of the whole rootfs.
pub fn remount_readonly(rootfs: &Path) -> Result<()> {
    mount(
        None::<&str>,
        rootfs,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .map_err(|e| mount_error(rootfs, rootfs, "remount-ro", e))
}

fn mount_error(source: &Path, target: &Path, step: &str, errno: nix::errno::Errno) -> Error {
    Error::MountDenied {
        source_path: source.to_path_buf(),
        destination: target.to_path_buf(),
        reason: format!("{} failed: {}", step, errno),
    }
}

/// Creates the mount point for a bind: a directory for directory sources, an
/// empty file otherwise.
fn prepare_mount_point(source: &Path, target: &Path) -> Result<()> {
    let source_is_dir = fs::metadata(source)
        .map(|m| m.is_dir())
        .map_err(|e| Error::io_path(source, e))?;
    if source_is_dir {
        fs::create_dir_all(target).map_err(|e| Error::io_path(target, e))?;
    } else {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io_path(parent, e))?;
        }
        if !target.exists() {
            fs::File::create(target).map_err(|e| Error::io_path(target, e))?;
        }
    }
    Ok(())
}

/// Creates a device node matching the host device, falling back to an empty
/// regular file (the subsequent bind mount provides the device semantics).
fn create_device_node(source: &Path, target: &Path) -> Result<()> {
    if target.exists() {
        return Ok(());
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io_path(parent, e))?;
    }
    let meta = fs::metadata(source).map_err(|e| Error::io_path(source, e))?;
    let kind = SFlag::from_bits_truncate(meta.mode() & SFlag::S_IFMT.bits());
    let mode = Mode::from_bits_truncate(meta.mode() & 0o777);
    match mknod(target, kind, mode, meta.rdev()) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EPERM) => {
            warn!("mknod {} not permitted, using plain bind target", target.display());
            fs::File::create(target).map_err(|e| Error::io_path(target, e))?;
            Ok(())
        }
        Err(e) => Err(mount_error(source, target, "mknod", e)),
    }
}

// =============================================================================
// Rootfs-relative Path Resolution
// =============================================================================

/// Resolves `destination` below `rootfs`, following symlinks re-rooted at
/// the rootfs so that no link can escape it. Returns the host-side path.
pub fn resolve_in_rootfs(rootfs: &Path, destination: &Path) -> Result<PathBuf> {
    let mut resolved = rootfs.to_path_buf();
    let mut pending = owned_components(destination);
    let mut depth = 0usize;

    while let Some(name) = pending.pop() {
        if name == ".." {
            if resolved != *rootfs {
                resolved.pop();
            }
            continue;
        }

        let candidate = resolved.join(&name);
        match fs::symlink_metadata(&candidate) {
            Ok(meta) if meta.file_type().is_symlink() => {
                depth += 1;
                if depth > MAX_SYMLINK_DEPTH {
                    return Err(Error::MountDenied {
                        source_path: rootfs.to_path_buf(),
                        destination: destination.to_path_buf(),
                        reason: "too many levels of symbolic links".to_string(),
                    });
                }
                let link = fs::read_link(&candidate).map_err(|e| Error::io_path(&candidate, e))?;
                if link.is_absolute() {
                    // Absolute targets are relative to the rootfs.
                    resolved = rootfs.to_path_buf();
                }
                pending.extend(owned_components(&link));
            }
            _ => resolved = candidate,
        }
    }

    if !resolved.starts_with(rootfs) {
        return Err(Error::MountDenied {
            source_path: rootfs.to_path_buf(),
            destination: destination.to_path_buf(),
            reason: "destination escapes the container rootfs".to_string(),
        });
    }
    Ok(resolved)
}

/// Path components in pop order (first component last), `.` and the root
/// dropped, `..` kept for the resolver to interpret.
fn owned_components(path: &Path) -> Vec<std::ffi::OsString> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_os_string()),
            Component::ParentDir => Some(std::ffi::OsString::from("..")),
            _ => None,
        })
        .rev()
        .collect()
}

/// Container-side view of a resolved host path.
fn container_side(rootfs: &Path, resolved: &Path) -> PathBuf {
    match resolved.strip_prefix(rootfs) {
        Ok(rest) if rest.components().next().is_some() => Path::new("/").join(rest),
        _ => PathBuf::from("/"),
    }
}
