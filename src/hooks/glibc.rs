//! Host glibc injection.
//!
//! MPI stacks bind-mounted from the host are linked against the host's
//! glibc, which may be newer than the one the image ships. When the
//! container carries an OLDER 64-bit glibc, this hook replaces the matching
//! libraries under the container rootfs with bind-mounted host copies, after
//! verifying ABI compatibility. Containers without a glibc, or with a
//! same-or-newer one, are left untouched.
//!
//! The hook never deletes container files: each replaced library is first
//! renamed to `<rootfs>/.sarus.bak.<name>`, then the host copy is
//! bind-mounted over a fresh empty file. A failure partway through leaves
//! every original recoverable.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::mount::MsFlags;
use tracing::{debug, info, warn};

use crate::constants::{GLIBC_BACKUP_PREFIX, GLIBC_LIBS_VAR, LDCONFIG_PATH_VAR, READELF_PATH_VAR};
use crate::error::{Error, Result};
use crate::hooks::{HookContext, NamespaceGuard};
use crate::mounts;
use crate::security;

/// Injects host glibc libraries into one container if necessary.
pub struct GlibcHook {
    rootfs: PathBuf,
    container_pid: i32,
    ldconfig: PathBuf,
    readelf: PathBuf,
    host_libraries: Vec<PathBuf>,
}

impl GlibcHook {
    /// Builds the hook from the container state and the hook's own
    /// environment (`GLIBC_LIBS`, `LDCONFIG_PATH`, `READELF_PATH`).
    pub fn from_context(context: &HookContext) -> Result<Self> {
        let hook_error = |reason: String| Error::HookExecutionFailed {
            hook: "glibc".to_string(),
            reason,
        };

        let host_libraries = std::env::var(GLIBC_LIBS_VAR)
            .map_err(|_| hook_error(format!("{} is not set", GLIBC_LIBS_VAR)))?
            .split(':')
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect::<Vec<_>>();
        if host_libraries.is_empty() {
            return Err(hook_error(format!("{} names no libraries", GLIBC_LIBS_VAR)));
        }

        let ldconfig = PathBuf::from(
            std::env::var(LDCONFIG_PATH_VAR)
                .map_err(|_| hook_error(format!("{} is not set", LDCONFIG_PATH_VAR)))?,
        );
        let readelf = PathBuf::from(
            std::env::var(READELF_PATH_VAR)
                .map_err(|_| hook_error(format!("{} is not set", READELF_PATH_VAR)))?,
        );

        // The ELF tooling runs with root privilege over untrusted input
        // paths; it must itself be beyond tampering.
        security::assert_untamperable(&ldconfig)?;
        security::assert_untamperable(&readelf)?;

        Ok(Self {
            rootfs: context.rootfs(),
            container_pid: context.container_pid()?,
            ldconfig,
            readelf,
            host_libraries,
        })
    }

    /// The hook body. Runs unconditionally; no-ops unless the container has
    /// an older 64-bit glibc.
    pub fn inject_glibc_libraries_if_necessary(&self) -> Result<()> {
        let guard = NamespaceGuard::enter_mount_namespace(self.container_pid)?;

        let container_libraries = self.find_64bit_container_libraries()?;
        let container_libc = match find_libc(&container_libraries) {
            Some(libc) => libc,
            None => {
                info!("container has no 64-bit glibc, nothing to inject");
                drop(guard);
                return Ok(());
            }
        };
        let host_libc = match find_libc(&self.host_libraries) {
            Some(libc) => libc,
            None => {
                return Err(Error::HookExecutionFailed {
                    hook: "glibc".to_string(),
                    reason: format!("{} does not include libc.so.6", GLIBC_LIBS_VAR),
                });
            }
        };

        let container_version = self.glibc_version_of(&container_libc)?;
        let host_version = self.glibc_version_of(&host_libc)?;
        if container_version >= host_version {
            info!(
                "container glibc {}.{} is not older than host {}.{}, nothing to inject",
                container_version.0, container_version.1, host_version.0, host_version.1
            );
            drop(guard);
            return Ok(());
        }

        self.verify_abi_compatibility(&host_libc, &container_libc)?;
        self.replace_container_libraries(&container_libraries)?;

        drop(guard);
        Ok(())
    }

    /// Enumerates 64-bit dynamic libraries below the rootfs through the
    /// trusted ldconfig, filtering with the trusted readelf.
    fn find_64bit_container_libraries(&self) -> Result<Vec<PathBuf>> {
        let output = Command::new(&self.ldconfig)
            .arg("-r")
            .arg(&self.rootfs)
            .arg("-p")
            .output()
            .map_err(|e| Error::io_path(&self.ldconfig, e))?;
        if !output.status.success() {
            return Err(Error::HookExecutionFailed {
                hook: "glibc".to_string(),
                reason: format!("ldconfig failed with {}", output.status),
            });
        }

        let mut libraries = Vec::new();
        for container_path in parse_ldconfig_output(&String::from_utf8_lossy(&output.stdout)) {
            let host_path = self
                .rootfs
                .join(container_path.strip_prefix("/").unwrap_or(&container_path));
            if !host_path.exists() {
                continue;
            }
            match self.elf_header_of(&host_path) {
                Ok(header) if header.is_64bit => libraries.push(host_path),
                Ok(_) => {}
                Err(e) => debug!("skipping {}: {}", host_path.display(), e),
            }
        }
        Ok(libraries)
    }

    /// Highest `GLIBC_x.y` version defined by a library's symbol versions.
    fn glibc_version_of(&self, library: &Path) -> Result<(u32, u32)> {
        let output = Command::new(&self.readelf)
            .arg("-V")
            .arg(library)
            .output()
            .map_err(|e| Error::io_path(&self.readelf, e))?;
        parse_glibc_version(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            Error::HookExecutionFailed {
                hook: "glibc".to_string(),
                reason: format!("no GLIBC version tags in {}", library.display()),
            }
        })
    }

    fn elf_header_of(&self, library: &Path) -> Result<ElfHeader> {
        let output = Command::new(&self.readelf)
            .arg("-h")
            .arg(library)
            .output()
            .map_err(|e| Error::io_path(&self.readelf, e))?;
        if !output.status.success() {
            return Err(Error::HookExecutionFailed {
                hook: "glibc".to_string(),
                reason: format!("readelf -h failed on {}", library.display()),
            });
        }
        Ok(parse_elf_header(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Both libcs must be 64-bit builds for the same machine.
    fn verify_abi_compatibility(&self, host_libc: &Path, container_libc: &Path) -> Result<()> {
        let host = self.elf_header_of(host_libc)?;
        let container = self.elf_header_of(container_libc)?;

        let incompatible = |reason: String| Error::HookExecutionFailed {
            hook: "glibc".to_string(),
            reason,
        };
        if !host.is_64bit || !container.is_64bit {
            return Err(incompatible(
                "host and container libc must both be 64-bit".to_string(),
            ));
        }
        if host.machine != container.machine {
            return Err(incompatible(format!(
                "machine mismatch: host {} vs container {}",
                host.machine, container.machine
            )));
        }
        Ok(())
    }

    /// Bind-mounts each host library over its container counterpart, moving
    /// the original aside first.
    fn replace_container_libraries(&self, container_libraries: &[PathBuf]) -> Result<()> {
        for host_library in &self.host_libraries {
            let file_name = match host_library.file_name() {
                Some(name) => name,
                None => continue,
            };
            let target = container_libraries
                .iter()
                .find(|lib| lib.file_name() == Some(file_name));
            let target = match target {
                Some(target) => target,
                None => {
                    debug!(
                        "container has no counterpart for {}, skipping",
                        host_library.display()
                    );
                    continue;
                }
            };

            let backup = self
                .rootfs
                .join(format!("{}{}", GLIBC_BACKUP_PREFIX, file_name.to_string_lossy()));
            if backup.exists() {
                warn!("backup {} already exists, keeping it", backup.display());
            } else {
                fs::rename(target, &backup).map_err(|e| Error::io_path(target, e))?;
            }
            File::create(target).map_err(|e| Error::io_path(target, e))?;

            mounts::bind_mount(host_library, target, MsFlags::MS_RDONLY | MsFlags::MS_NOSUID)?;
            info!(
                "replaced {} with host {}",
                target.display(),
                host_library.display()
            );
        }
        Ok(())
    }
}

/// Parsed `readelf -h` fields the hook consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElfHeader {
    pub is_64bit: bool,
    pub machine: String,
}

/// Extracts library paths from `ldconfig -p` output lines of the form
/// `\tlibm.so.6 (libc6,x86-64) => /lib/x86_64-linux-gnu/libm.so.6`.
pub fn parse_ldconfig_output(output: &str) -> Vec<PathBuf> {
    output
        .lines()
        .filter_map(|line| line.split_once("=>"))
        .map(|(_, path)| PathBuf::from(path.trim()))
        .collect()
}

/// Extracts class and machine from `readelf -h` output.
pub fn parse_elf_header(output: &str) -> ElfHeader {
    let field = |name: &str| {
        output
            .lines()
            .find(|line| line.trim_start().starts_with(name))
            .and_then(|line| line.split_once(':'))
            .map(|(_, value)| value.trim().to_string())
            .unwrap_or_default()
    };
    ElfHeader {
        is_64bit: field("Class") == "ELF64",
        machine: field("Machine"),
    }
}

/// The highest `GLIBC_<major>.<minor>` tag in `readelf -V` output.
pub fn parse_glibc_version(output: &str) -> Option<(u32, u32)> {
    let mut best: Option<(u32, u32)> = None;
    for token in output.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '.')) {
        if let Some(version) = token.strip_prefix("GLIBC_") {
            let mut parts = version.split('.');
            if let (Some(major), Some(minor)) = (parts.next(), parts.next())
                && let (Ok(major), Ok(minor)) = (major.parse(), minor.parse())
            {
                let candidate = (major, minor);
                if best.is_none_or(|b| candidate > b) {
                    best = Some(candidate);
                }
            }
        }
    }
    best
}

/// The entry whose file name is `libc.so.6`.
pub fn find_libc(libraries: &[PathBuf]) -> Option<PathBuf> {
    libraries
        .iter()
        .find(|lib| lib.file_name().is_some_and(|n| n == "libc.so.6"))
        .cloned()
}
