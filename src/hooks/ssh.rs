//! On-demand SSH daemon injection.
//!
//! Gives every container of a job a dropbear daemon so that ranks can reach
//! each other over SSH, without the image having to ship one.
//!
//! Two entry points:
//!
//! - [`generate_ssh_keys`] runs with user privileges (`sarus-hooks ssh
//!   keygen`) and produces per-user dropbear keys under
//!   `<base>/<user>/.oci-hooks/ssh/keys/`.
//! - [`SshHook::start_ssh_daemon`] runs as the prestart hook, root inside
//!   the container's mount namespace: it grafts the host dropbear install
//!   into the rootfs, overlays a writable `~/.ssh` populated with the keys,
//!   installs an `ssh` wrapper and a login-shell environment shim, and
//!   forks the daemon.
//!
//! Any I/O error before the daemon fork aborts the launch; after the fork
//! the hook only verifies that the child came up.

use std::fs::{self, OpenOptions, Permissions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::mount::{MsFlags, mount};
use nix::unistd::{Gid, Uid, User, chown};
use tracing::info;

use crate::constants::{
    DROPBEAR_DIR_IN_CONTAINER, DROPBEAR_DIR_VAR, HOOK_BASE_DIR_VAR, OCI_HOOKS_DIR,
    SERVER_PORT_VAR, SSH_AUTHORIZE_KEY_ANNOTATION,
};
use crate::error::{Error, Result};
use crate::hooks::{HookContext, NamespaceGuard};
use crate::identity::{PrivilegeGuard, UserIdentity};
use crate::mounts;

const HOST_KEY_FILE: &str = "dropbear_ecdsa_host_key";
const CLIENT_KEY_FILE: &str = "id_dropbear";
const AUTHORIZED_KEYS_FILE: &str = "authorized_keys";

fn ssh_error(reason: impl Into<String>) -> Error {
    Error::HookExecutionFailed {
        hook: "ssh".to_string(),
        reason: reason.into(),
    }
}

// =============================================================================
// Key Generation (user-privileged entry point)
// =============================================================================

/// Generates the per-user dropbear key material.
///
/// Produces `dropbear_ecdsa_host_key`, `id_dropbear` and `authorized_keys`
/// (pre-populated with the generated public key), each mode 0600, under
/// `<base>/<user>/.oci-hooks/ssh/keys/`. Existing keys are kept unless
/// `overwrite` is set.
pub fn generate_ssh_keys(base_dir: &Path, dropbear_install: &Path, overwrite: bool) -> Result<()> {
    let identity = UserIdentity::from_process()?;
    let _guard = PrivilegeGuard::lower_to(&identity)?;

    let keys_dir = user_keys_dir(base_dir, identity.uid)?;
    let host_key = keys_dir.join(HOST_KEY_FILE);
    let client_key = keys_dir.join(CLIENT_KEY_FILE);
    let authorized_keys = keys_dir.join(AUTHORIZED_KEYS_FILE);

    if !overwrite && host_key.exists() && client_key.exists() && authorized_keys.exists() {
        info!("SSH keys already present in {}", keys_dir.display());
        return Ok(());
    }

    fs::create_dir_all(&keys_dir).map_err(|e| Error::io_path(&keys_dir, e))?;
    fs::set_permissions(&keys_dir, Permissions::from_mode(0o700))
        .map_err(|e| Error::io_path(&keys_dir, e))?;

    let dropbearkey = dropbear_install.join("bin/dropbearkey");
    for key in [&host_key, &client_key] {
        if key.exists() {
            fs::remove_file(key).map_err(|e| Error::io_path(key, e))?;
        }
        let output = Command::new(&dropbearkey)
            .arg("-t")
            .arg("ecdsa")
            .arg("-f")
            .arg(key)
            .output()
            .map_err(|e| Error::io_path(&dropbearkey, e))?;
        if !output.status.success() {
            return Err(ssh_error(format!(
                "dropbearkey failed on {}: {}",
                key.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        fs::set_permissions(key, Permissions::from_mode(0o600))
            .map_err(|e| Error::io_path(key, e))?;
    }

    // The public half of the client key seeds authorized_keys, so every
    // rank of the job accepts every other rank by default.
    let output = Command::new(&dropbearkey)
        .arg("-y")
        .arg("-f")
        .arg(&client_key)
        .output()
        .map_err(|e| Error::io_path(&dropbearkey, e))?;
    if !output.status.success() {
        return Err(ssh_error("dropbearkey -y failed to export the public key"));
    }
    let public_key = extract_public_key(&String::from_utf8_lossy(&output.stdout))
        .ok_or_else(|| ssh_error("dropbearkey -y produced no public key line"))?;

    fs::write(&authorized_keys, format!("{}\n", public_key))
        .map_err(|e| Error::io_path(&authorized_keys, e))?;
    fs::set_permissions(&authorized_keys, Permissions::from_mode(0o600))
        .map_err(|e| Error::io_path(&authorized_keys, e))?;

    info!("generated SSH keys in {}", keys_dir.display());
    Ok(())
}

/// The first `ssh-*` or `ecdsa-*` line of dropbearkey output.
pub fn extract_public_key(output: &str) -> Option<String> {
    output
        .lines()
        .find(|line| line.starts_with("ssh-") || line.starts_with("ecdsa-"))
        .map(str::to_string)
}

// =============================================================================
// Daemon Injection (root entry point)
// =============================================================================

/// Starts the SSH daemon inside one container.
pub struct SshHook {
    rootfs: PathBuf,
    container_pid: i32,
    bundle_dir: PathBuf,
    env: Vec<String>,
    user: (Uid, Gid),
    authorized_key_file: Option<PathBuf>,
    dropbear_dir: PathBuf,
    keys_dir: PathBuf,
    server_port: u16,
}

impl SshHook {
    /// Builds the hook from the container state and the hook environment.
    pub fn from_context(context: &HookContext) -> Result<Self> {
        let uid = Uid::from_raw(context.spec.process.user.uid);
        let gid = Gid::from_raw(context.spec.process.user.gid);

        let server_port = std::env::var(SERVER_PORT_VAR)
            .ok()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| ssh_error(format!("{} is not set or invalid", SERVER_PORT_VAR)))?;

        let keys_dir = user_keys_dir(&hook_base_dir()?, uid)?;
        if !keys_dir.join(CLIENT_KEY_FILE).exists() {
            return Err(Error::HookActivationMissing(format!(
                "no SSH keys in {}; run 'sarus ssh-keygen' first",
                keys_dir.display()
            )));
        }

        Ok(Self {
            rootfs: context.rootfs(),
            container_pid: context.container_pid()?,
            bundle_dir: context.state.bundle.clone(),
            env: context.spec.process.env.clone(),
            user: (uid, gid),
            authorized_key_file: context
                .annotation(SSH_AUTHORIZE_KEY_ANNOTATION)
                .map(PathBuf::from),
            dropbear_dir: dropbear_dir()?,
            keys_dir,
            server_port,
        })
    }

    /// The hook body: graft dropbear, populate `~/.ssh`, install the client
    /// wrapper and environment shim, then fork the daemon.
    pub fn start_ssh_daemon(&self) -> Result<()> {
        let guard = NamespaceGuard::enter_mount_namespace(self.container_pid)?;

        self.mount_dropbear()?;
        self.populate_user_ssh_dir()?;
        self.write_ssh_wrapper()?;
        self.write_profile_shim()?;
        self.write_environment_file()?;
        self.spawn_daemon()?;

        drop(guard);
        Ok(())
    }

    /// Bind-mounts the host dropbear install at its in-container path.
    fn mount_dropbear(&self) -> Result<()> {
        let target = self.container_path(DROPBEAR_DIR_IN_CONTAINER);
        fs::create_dir_all(&target).map_err(|e| Error::io_path(&target, e))?;
        mounts::bind_mount(&self.dropbear_dir, &target, MsFlags::MS_NOSUID)?;
        Ok(())
    }

    /// Overlays `~/.ssh` with a writable per-user layer and populates it
    /// with the host and client keys.
    fn populate_user_ssh_dir(&self) -> Result<()> {
        let home = self.container_home_dir()?;
        let ssh_dir = self.container_path(&home.join(".ssh"));
        fs::create_dir_all(&ssh_dir).map_err(|e| Error::io_path(&ssh_dir, e))?;

        let upper = self.bundle_dir.join("ssh-upper");
        let work = self.bundle_dir.join("ssh-work");
        for dir in [&upper, &work] {
            fs::create_dir_all(dir).map_err(|e| Error::io_path(dir, e))?;
        }
        let overlay_data = format!(
            "lowerdir={},upperdir={},workdir={}",
            ssh_dir.display(),
            upper.display(),
            work.display()
        );
        mount(
            Some("overlay"),
            &ssh_dir,
            Some("overlay"),
            MsFlags::empty(),
            Some(overlay_data.as_str()),
        )
        .map_err(|e| ssh_error(format!("overlay ~/.ssh: {}", e)))?;

        let (uid, gid) = self.user;
        chown(&ssh_dir, Some(uid), Some(gid)).map_err(|e| ssh_error(format!("chown: {}", e)))?;

        for file in [HOST_KEY_FILE, CLIENT_KEY_FILE, AUTHORIZED_KEYS_FILE] {
            let source = self.keys_dir.join(file);
            let target = ssh_dir.join(file);
            fs::copy(&source, &target).map_err(|e| Error::io_path(&source, e))?;
            fs::set_permissions(&target, Permissions::from_mode(0o600))
                .map_err(|e| Error::io_path(&target, e))?;
            chown(&target, Some(uid), Some(gid)).map_err(|e| ssh_error(format!("chown: {}", e)))?;
        }

        // An annotation may name an extra public key to authorize.
        if let Some(key_file) = &self.authorized_key_file {
            let key = fs::read_to_string(key_file).map_err(|e| Error::io_path(key_file, e))?;
            let authorized = ssh_dir.join(AUTHORIZED_KEYS_FILE);
            let mut file = OpenOptions::new()
                .append(true)
                .open(&authorized)
                .map_err(|e| Error::io_path(&authorized, e))?;
            writeln!(file, "{}", key.trim_end()).map_err(|e| Error::io_path(&authorized, e))?;
        }
        Ok(())
    }

    /// Installs `/usr/bin/ssh` as a dbclient wrapper.
    fn write_ssh_wrapper(&self) -> Result<()> {
        let path = self.container_path("/usr/bin/ssh");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io_path(parent, e))?;
        }
        fs::write(&path, render_ssh_wrapper(self.server_port)).map_err(|e| Error::io_path(&path, e))?;
        fs::set_permissions(&path, Permissions::from_mode(0o755))
            .map_err(|e| Error::io_path(&path, e))?;
        Ok(())
    }

    /// Installs the login-shell shim restoring the container environment
    /// for SSH sessions.
    fn write_profile_shim(&self) -> Result<()> {
        let path = self.container_path("/etc/profile.d/ssh-hook.sh");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io_path(parent, e))?;
        }
        fs::write(&path, render_profile_shim()).map_err(|e| Error::io_path(&path, e))?;
        fs::set_permissions(&path, Permissions::from_mode(0o644))
            .map_err(|e| Error::io_path(&path, e))?;
        Ok(())
    }

    /// Writes the container's `process.env` as an export script a login
    /// shell can source.
    fn write_environment_file(&self) -> Result<()> {
        let path = self.container_path(&Path::new(DROPBEAR_DIR_IN_CONTAINER).join("environment"));
        fs::write(&path, render_environment_file(&self.env)).map_err(|e| Error::io_path(&path, e))?;
        fs::set_permissions(&path, Permissions::from_mode(0o644))
            .map_err(|e| Error::io_path(&path, e))?;
        Ok(())
    }

    /// Forks the daemon chrooted into the rootfs. The hook does not wait;
    /// it only verifies that the child came up.
    fn spawn_daemon(&self) -> Result<()> {
        let rootfs = self.rootfs.clone();
        let host_key = Path::new(DROPBEAR_DIR_IN_CONTAINER).join(HOST_KEY_FILE);

        // The host key must exist inside the chroot.
        let host_key_in_rootfs = self.container_path(&host_key);
        fs::copy(self.keys_dir.join(HOST_KEY_FILE), &host_key_in_rootfs)
            .map_err(|e| Error::io_path(&host_key_in_rootfs, e))?;
        fs::set_permissions(&host_key_in_rootfs, Permissions::from_mode(0o600))
            .map_err(|e| Error::io_path(&host_key_in_rootfs, e))?;

        let mut command = Command::new(
            Path::new(DROPBEAR_DIR_IN_CONTAINER).join("bin/dropbear"),
        );
        command
            .arg("-E")
            .arg("-r")
            .arg(&host_key)
            .arg("-p")
            .arg(self.server_port.to_string());
        // SAFETY: chroot/chdir are async-signal-safe; nothing else runs
        // between fork and exec.
        unsafe {
            command.pre_exec(move || {
                nix::unistd::chroot(&rootfs).map_err(std::io::Error::from)?;
                std::env::set_current_dir("/")?;
                Ok(())
            });
        }
        let mut child = command
            .spawn()
            .map_err(|e| ssh_error(format!("failed to start dropbear: {}", e)))?;

        // After the fork the launch only fails if the daemon died at once.
        std::thread::sleep(std::time::Duration::from_millis(100));
        if let Some(status) = child
            .try_wait()
            .map_err(|e| ssh_error(format!("wait: {}", e)))?
        {
            return Err(ssh_error(format!("dropbear exited immediately with {}", status)));
        }
        info!("dropbear listening on port {}", self.server_port);
        Ok(())
    }

    /// The user's home directory as declared by the container's
    /// `/etc/passwd`, honoring non-standard homes.
    fn container_home_dir(&self) -> Result<PathBuf> {
        let passwd_path = self.rootfs.join("etc/passwd");
        let contents =
            fs::read_to_string(&passwd_path).map_err(|e| Error::io_path(&passwd_path, e))?;
        passwd_home(&contents, self.user.0.as_raw())
            .ok_or_else(|| ssh_error(format!("uid {} has no passwd entry in the container", self.user.0)))
    }

    /// Maps a container-absolute path to the host-side rootfs path.
    fn container_path(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        self.rootfs.join(path.strip_prefix("/").unwrap_or(path))
    }
}

// =============================================================================
// Rendering (pure, shared with tests)
// =============================================================================

/// The 2-line `/usr/bin/ssh` wrapper.
pub fn render_ssh_wrapper(server_port: u16) -> String {
    format!(
        "#!/bin/sh\n{}/bin/dbclient -y -p {} $*\n",
        DROPBEAR_DIR_IN_CONTAINER, server_port
    )
}

/// The `/etc/profile.d` shim sourcing the saved environment for SSH logins.
pub fn render_profile_shim() -> String {
    format!(
        "#!/bin/sh\nif [ \"$SSH_CONNECTION\" ]; then\n    . {}/environment\nfi\n",
        DROPBEAR_DIR_IN_CONTAINER
    )
}

/// The saved environment: one `export KEY="VALUE"` line per entry.
pub fn render_environment_file(env: &[String]) -> String {
    let mut out = String::from("#!/bin/sh\n");
    for entry in env {
        if let Some((key, value)) = entry.split_once('=') {
            out.push_str(&format!("export {}=\"{}\"\n", key, value));
        }
    }
    out
}

/// The home directory of `uid` in passwd-format `contents`.
pub fn passwd_home(contents: &str, uid: u32) -> Option<PathBuf> {
    contents.lines().find_map(|line| {
        let fields: Vec<&str> = line.split(':').collect();
        match fields.as_slice() {
            [_, _, entry_uid, _, _, home, ..] if entry_uid.parse() == Ok(uid) => {
                Some(PathBuf::from(home))
            }
            _ => None,
        }
    })
}

// =============================================================================
// Shared Environment
// =============================================================================

/// The key base directory handed to the hook process.
pub fn hook_base_dir() -> Result<PathBuf> {
    std::env::var(HOOK_BASE_DIR_VAR)
        .map(PathBuf::from)
        .map_err(|_| ssh_error(format!("{} is not set", HOOK_BASE_DIR_VAR)))
}

/// The host dropbear install handed to the hook process.
pub fn dropbear_dir() -> Result<PathBuf> {
    std::env::var(DROPBEAR_DIR_VAR)
        .map(PathBuf::from)
        .map_err(|_| ssh_error(format!("{} is not set", DROPBEAR_DIR_VAR)))
}

/// `<base>/<user>/.oci-hooks/ssh/keys` for the named uid.
fn user_keys_dir(base: &Path, uid: Uid) -> Result<PathBuf> {
    let user = User::from_uid(uid)
        .map_err(|e| ssh_error(format!("user lookup failed: {}", e)))?
        .ok_or_else(|| ssh_error(format!("uid {} has no passwd entry on the host", uid)))?;
    Ok(base.join(user.name).join(OCI_HOOKS_DIR).join("ssh/keys"))
}
