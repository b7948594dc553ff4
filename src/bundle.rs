//! OCI runtime bundle assembly.
//!
//! Builds the per-run bundle directory consumed by the low-level runtime:
//!
//! ```text
//! <bundle>/
//! ├── lower/       read-only squashfs mountpoint (loop device)
//! ├── upper/       overlay upper layer
//! ├── work/        overlay work dir
//! ├── rootfs/      overlay mountpoint, the container root
//! └── config.json  OCI runtime spec
//! ```
//!
//! A [`Bundle`] exclusively owns its directory tree for the lifetime of one
//! run. Teardown unmounts in reverse order (overlay, then squashfs, then
//! loop detach) and removes the tree; teardown errors are logged and
//! swallowed so that a failing run still cleans up as far as possible.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::mount::{MntFlags, MsFlags, mount, umount2};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::constants::{
    DEFAULT_CAPABILITIES, MASKED_PATHS, OCI_RUNTIME_SPEC_VERSION, READONLY_PATHS,
};
use crate::error::{Error, Result};
use crate::identity::UserIdentity;
use crate::image::ImageMetadata;
use crate::security;
use crate::storage::StoredImage;

// =============================================================================
// OCI Runtime Spec Types
// =============================================================================

/// OCI runtime spec document (the subset the launcher emits).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciSpec {
    pub oci_version: String,
    pub root: OciRoot,
    pub process: OciProcess,
    pub hostname: String,
    pub mounts: Vec<OciMount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hooks: Option<OciHooks>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linux: Option<OciLinux>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciRoot {
    pub path: String,
    pub readonly: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciProcess {
    pub terminal: bool,
    pub user: OciUser,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<OciCapabilities>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciUser {
    pub uid: u32,
    pub gid: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "additionalGids")]
    pub additional_gids: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciCapabilities {
    pub bounding: Vec<String>,
    pub effective: Vec<String>,
    pub permitted: Vec<String>,
    pub inheritable: Vec<String>,
    pub ambient: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciMount {
    pub destination: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OciHooks {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prestart: Vec<OciHook>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub poststart: Vec<OciHook>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub poststop: Vec<OciHook>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciHook {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciLinux {
    pub namespaces: Vec<OciNamespace>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub masked_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub readonly_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciNamespace {
    #[serde(rename = "type")]
    pub ns_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

// =============================================================================
// Process Spec
// =============================================================================

/// The resolved container process: image metadata merged with the run
/// request (a requested command overrides entrypoint+cmd).
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    pub terminal: bool,
}

impl ProcessSpec {
    /// Derives the process spec from image metadata and an optional
    /// command override.
    pub fn from_image(
        metadata: &ImageMetadata,
        command: Option<&[String]>,
        extra_env: &[String],
        terminal: bool,
    ) -> Self {
        let args = match command {
            Some(command) if !command.is_empty() => command.to_vec(),
            _ => {
                let mut args: Vec<String> =
                    metadata.entrypoint.clone().unwrap_or_default();
                args.extend(metadata.cmd.clone().unwrap_or_default());
                if args.is_empty() {
                    args.push("/bin/sh".to_string());
                }
                args
            }
        };

        let mut env: Vec<String> = metadata
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        if !metadata.env.iter().any(|(k, _)| k == "PATH") {
            env.push("PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string());
        }
        env.extend(extra_env.iter().cloned());

        let cwd = metadata.workdir.clone().unwrap_or_else(|| "/".to_string());

        Self {
            args,
            env,
            cwd,
            terminal,
        }
    }
}

// =============================================================================
// Assembler
// =============================================================================

/// Which in-tree hooks participate in a run.
#[derive(Debug, Clone, Default)]
pub struct HooksSpec {
    pub glibc: bool,
    pub slurm_sync: bool,
    pub ssh: bool,
}

/// An assembled bundle, exclusively owning its directory tree.
#[derive(Debug)]
pub struct Bundle {
    bundle_dir: PathBuf,
    rootfs_dir: PathBuf,
    lower_dir: PathBuf,
    loop_device: Option<LoopDevice>,
    lower_mounted: bool,
    overlay_mounted: bool,
}

/// Builds OCI runtime bundles for single runs.
pub struct BundleAssembler {
    config: Arc<Config>,
}

impl BundleAssembler {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Assembles the bundle for one run: overlay rootfs over the stored
    /// squashfs plus the generated `config.json`.
    pub fn assemble(
        &self,
        image: &StoredImage,
        process: &ProcessSpec,
        hooks: &HooksSpec,
        annotations: HashMap<String, String>,
        identity: &UserIdentity,
        readonly_rootfs: bool,
    ) -> Result<Bundle> {
        let bundle_dir = self
            .config
            .local_repository_base_dir
            .join("bundles")
            .join(format!("run-{}", uuid::Uuid::now_v7()));

        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&bundle_dir)
            .map_err(|e| Error::BundleBuildFailed(format!("create bundle dir: {}", e)))?;

        let lower = bundle_dir.join("lower");
        let upper = bundle_dir.join("upper");
        let work = bundle_dir.join("work");
        let rootfs = bundle_dir.join("rootfs");
        for dir in [&lower, &upper, &work, &rootfs] {
            fs::create_dir_all(dir)
                .map_err(|e| Error::BundleBuildFailed(format!("create {}: {}", dir.display(), e)))?;
        }

        let mut bundle = Bundle {
            bundle_dir: bundle_dir.clone(),
            rootfs_dir: rootfs.clone(),
            lower_dir: lower.clone(),
            loop_device: None,
            lower_mounted: false,
            overlay_mounted: false,
        };

        // Read-only lower: the squashfs through a loop device. The partially
        // built Bundle is live from here on, so a failure at any later step
        // unwinds whatever was already mounted.
        let loop_device = LoopDevice::attach(&image.squashfs_path)?;
        mount(
            Some(loop_device.path()),
            &lower,
            Some("squashfs"),
            MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|e| Error::BundleBuildFailed(format!("mount squashfs: {}", e)))?;
        bundle.loop_device = Some(loop_device);
        bundle.lower_mounted = true;

        let overlay_data = format!(
            "lowerdir={},upperdir={},workdir={}",
            lower.display(),
            upper.display(),
            work.display()
        );
        mount(
            Some("overlay"),
            &rootfs,
            Some("overlay"),
            MsFlags::empty(),
            Some(overlay_data.as_str()),
        )
        .map_err(|e| Error::BundleBuildFailed(format!("mount overlay: {}", e)))?;
        bundle.overlay_mounted = true;

        let spec = self.generate_spec(process, hooks, annotations, identity, readonly_rootfs)?;
        let config_path = bundle_dir.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(&spec)?)
            .map_err(|e| Error::BundleBuildFailed(format!("write config.json: {}", e)))?;

        info!("assembled bundle {}", bundle_dir.display());
        Ok(bundle)
    }

    /// Generates the OCI runtime spec. Pure; exercised directly by tests.
    pub fn generate_spec(
        &self,
        process: &ProcessSpec,
        hooks: &HooksSpec,
        annotations: HashMap<String, String>,
        identity: &UserIdentity,
        readonly_rootfs: bool,
    ) -> Result<OciSpec> {
        let capabilities: Vec<String> =
            DEFAULT_CAPABILITIES.iter().map(|c| c.to_string()).collect();

        let mut namespaces = vec![
            OciNamespace { ns_type: "mount".to_string(), path: None },
            OciNamespace { ns_type: "pid".to_string(), path: None },
            OciNamespace { ns_type: "uts".to_string(), path: None },
            OciNamespace { ns_type: "ipc".to_string(), path: None },
        ];
        if !UserIdentity::process_is_privileged() {
            namespaces.push(OciNamespace { ns_type: "user".to_string(), path: None });
        }

        Ok(OciSpec {
            oci_version: OCI_RUNTIME_SPEC_VERSION.to_string(),
            root: OciRoot {
                path: "rootfs".to_string(),
                readonly: readonly_rootfs,
            },
            process: OciProcess {
                terminal: process.terminal,
                user: OciUser {
                    uid: identity.uid.as_raw(),
                    gid: identity.gid.as_raw(),
                    additional_gids: identity
                        .supplementary_gids
                        .iter()
                        .map(|g| g.as_raw())
                        .collect(),
                },
                args: process.args.clone(),
                env: process.env.clone(),
                cwd: process.cwd.clone(),
                capabilities: Some(OciCapabilities {
                    bounding: capabilities.clone(),
                    effective: capabilities.clone(),
                    permitted: capabilities.clone(),
                    inheritable: Vec::new(),
                    ambient: Vec::new(),
                }),
            },
            hostname: "container".to_string(),
            mounts: default_mounts(),
            hooks: Some(self.hooks_section(hooks)?),
            annotations,
            linux: Some(OciLinux {
                namespaces,
                masked_paths: MASKED_PATHS.iter().map(|p| p.to_string()).collect(),
                readonly_paths: READONLY_PATHS.iter().map(|p| p.to_string()).collect(),
            }),
        })
    }

    /// The prestart list: enabled in-tree hooks first, then the admin's
    /// configured hooks, each checked untamperable before scheduling.
    fn hooks_section(&self, hooks: &HooksSpec) -> Result<OciHooks> {
        let hook_binary = self.config.prefix_dir.join("bin/sarus-hooks");

        // In-tree hooks re-read the admin configuration from disk, and the
        // glibc/ssh hooks take their tool paths from the environment the
        // launcher was started with.
        let mut hook_env = vec![format!(
            "{}={}",
            crate::constants::PREFIX_DIR_VAR,
            self.config.prefix_dir.display()
        )];
        hook_env.push(format!(
            "{}={}",
            crate::constants::HOOK_BASE_DIR_VAR,
            self.config.local_repository_base_dir.display()
        ));
        for var in [
            crate::constants::GLIBC_LIBS_VAR,
            crate::constants::LDCONFIG_PATH_VAR,
            crate::constants::READELF_PATH_VAR,
            crate::constants::DROPBEAR_DIR_VAR,
            crate::constants::SERVER_PORT_VAR,
        ] {
            if let Ok(value) = std::env::var(var) {
                hook_env.push(format!("{}={}", var, value));
            }
        }

        let in_tree = |subcommand: &str| OciHook {
            path: hook_binary.to_string_lossy().to_string(),
            args: Some(vec!["sarus-hooks".to_string(), subcommand.to_string()]),
            env: Some(hook_env.clone()),
        };

        let mut prestart = Vec::new();
        if hooks.glibc {
            prestart.push(in_tree("glibc"));
        }
        if hooks.slurm_sync {
            prestart.push(in_tree("slurm-sync"));
        }
        if hooks.ssh {
            prestart.push(in_tree("ssh"));
        }

        let mut section = OciHooks {
            prestart,
            ..Default::default()
        };
        for (configured, target) in [
            (&self.config.oci_hooks.prestart, &mut section.prestart),
            (&self.config.oci_hooks.poststart, &mut section.poststart),
            (&self.config.oci_hooks.poststop, &mut section.poststop),
        ] {
            for entry in configured {
                if self.config.security_checks {
                    security::assert_untamperable(&entry.path)?;
                }
                target.push(OciHook {
                    path: entry.path.to_string_lossy().to_string(),
                    args: entry.args.clone(),
                    env: entry.env.clone(),
                });
            }
        }
        Ok(section)
    }
}

fn default_mounts() -> Vec<OciMount> {
    vec![
        OciMount {
            destination: "/proc".to_string(),
            mount_type: "proc".to_string(),
            source: "proc".to_string(),
            options: vec![],
        },
        OciMount {
            destination: "/dev".to_string(),
            mount_type: "tmpfs".to_string(),
            source: "tmpfs".to_string(),
            options: vec![
                "nosuid".to_string(),
                "strictatime".to_string(),
                "mode=755".to_string(),
            ],
        },
        OciMount {
            destination: "/dev/pts".to_string(),
            mount_type: "devpts".to_string(),
            source: "devpts".to_string(),
            options: vec![
                "nosuid".to_string(),
                "noexec".to_string(),
                "newinstance".to_string(),
            ],
        },
        OciMount {
            destination: "/sys".to_string(),
            mount_type: "sysfs".to_string(),
            source: "sysfs".to_string(),
            options: vec![
                "nosuid".to_string(),
                "noexec".to_string(),
                "nodev".to_string(),
                "ro".to_string(),
            ],
        },
    ]
}

impl Bundle {
    pub fn path(&self) -> &Path {
        &self.bundle_dir
    }

    pub fn rootfs(&self) -> &Path {
        &self.rootfs_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.bundle_dir.join("config.json")
    }

    /// Unmounts and removes the bundle tree. Errors are logged, not
    /// propagated: every fatal launch path calls this and must not mask the
    /// original failure.
    pub fn teardown(&mut self) {
        if self.overlay_mounted {
            if let Err(e) = umount2(&self.rootfs_dir, MntFlags::MNT_DETACH) {
                warn!("failed to unmount overlay {}: {}", self.rootfs_dir.display(), e);
            }
            self.overlay_mounted = false;
        }
        if self.lower_mounted {
            if let Err(e) = umount2(&self.lower_dir, MntFlags::MNT_DETACH) {
                warn!("failed to unmount squashfs {}: {}", self.lower_dir.display(), e);
            }
            self.lower_mounted = false;
        }
        if let Some(device) = self.loop_device.take() {
            device.detach();
        }
        if let Err(e) = fs::remove_dir_all(&self.bundle_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove bundle {}: {}", self.bundle_dir.display(), e);
            }
        } else {
            debug!("removed bundle {}", self.bundle_dir.display());
        }
    }
}

impl Drop for Bundle {
    fn drop(&mut self) {
        self.teardown();
    }
}

// =============================================================================
// Loop Devices
// =============================================================================

const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;
const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;

/// A loop device holding a backing file open for the bundle's lifetime.
#[derive(Debug)]
struct LoopDevice {
    path: PathBuf,
    device: File,
    _backing: File,
}

impl LoopDevice {
    /// Attaches `backing` to the next free loop device.
    fn attach(backing_path: &Path) -> Result<Self> {
        let control = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/loop-control")
            .map_err(|e| Error::io_path("/dev/loop-control", e))?;

        // SAFETY: LOOP_CTL_GET_FREE takes no argument and returns the free
        // device index or a negative errno.
        let index = unsafe { libc::ioctl(control.as_raw_fd(), LOOP_CTL_GET_FREE) };
        if index < 0 {
            return Err(Error::BundleBuildFailed(format!(
                "no free loop device: {}",
                std::io::Error::last_os_error()
            )));
        }

        let path = PathBuf::from(format!("/dev/loop{}", index));
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::io_path(&path, e))?;
        let backing = File::open(backing_path).map_err(|e| Error::io_path(backing_path, e))?;

        // SAFETY: LOOP_SET_FD associates the backing fd with the device fd.
        let rc = unsafe { libc::ioctl(device.as_raw_fd(), LOOP_SET_FD, backing.as_raw_fd()) };
        if rc < 0 {
            return Err(Error::BundleBuildFailed(format!(
                "failed to attach {} to {}: {}",
                backing_path.display(),
                path.display(),
                std::io::Error::last_os_error()
            )));
        }

        debug!("attached {} to {}", backing_path.display(), path.display());
        Ok(Self {
            path,
            device,
            _backing: backing,
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    /// Best-effort detach; the kernel also releases the device once the
    /// last reference to the unmounted filesystem goes away.
    fn detach(self) {
        // SAFETY: LOOP_CLR_FD takes no argument.
        let rc = unsafe { libc::ioctl(self.device.as_raw_fd(), LOOP_CLR_FD) };
        if rc < 0 {
            warn!(
                "failed to detach loop device {}: {}",
                self.path.display(),
                std::io::Error::last_os_error()
            );
        }
    }
}

// =============================================================================
// Namespace Setup
// =============================================================================

/// Unshares the mount namespace of the calling process and makes its mount
/// tree private, so that bundle mounts never propagate to the host.
pub fn unshare_mount_namespace() -> Result<()> {
    nix::sched::unshare(nix::sched::CloneFlags::CLONE_NEWNS)
        .map_err(|e| Error::BundleBuildFailed(format!("unshare mount namespace: {}", e)))?;
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| Error::BundleBuildFailed(format!("make mount tree private: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_spec_prefers_command_override() {
        let metadata = ImageMetadata {
            cmd: Some(vec!["/bin/sh".to_string()]),
            entrypoint: Some(vec!["/entry".to_string()]),
            env: vec![],
            workdir: Some("/work".to_string()),
        };
        let override_command = vec!["/bin/echo".to_string(), "hi".to_string()];
        let spec = ProcessSpec::from_image(&metadata, Some(override_command.as_slice()), &[], false);
        assert_eq!(spec.args, ["/bin/echo", "hi"]);
        assert_eq!(spec.cwd, "/work");
    }

    #[test]
    fn process_spec_concatenates_entrypoint_and_cmd() {
        let metadata = ImageMetadata {
            cmd: Some(vec!["--serve".to_string()]),
            entrypoint: Some(vec!["/app".to_string()]),
            env: vec![("PATH".to_string(), "/bin".to_string())],
            workdir: None,
        };
        let spec = ProcessSpec::from_image(&metadata, None, &[], false);
        assert_eq!(spec.args, ["/app", "--serve"]);
        assert_eq!(spec.env, ["PATH=/bin"]);
        assert_eq!(spec.cwd, "/");
    }

    #[test]
    fn process_spec_adds_default_path() {
        let metadata = ImageMetadata::default();
        let spec = ProcessSpec::from_image(&metadata, None, &[], false);
        assert!(spec.env.iter().any(|e| e.starts_with("PATH=")));
        assert_eq!(spec.args, ["/bin/sh"]);
    }
}
