//! Admin configuration (`sarus.json`).
//!
//! The configuration is parsed once at process entry and shared immutably
//! for the rest of the run. Loading follows a strict order: read the file
//! contents FIRST, then verify that the file is root-owned and only
//! root-writable. Inverting the order would let an attacker replace the
//! contents between the check and the read.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::identity::UserIdentity;
use crate::security;

/// One hook entry in the admin configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciHookEntry {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
}

/// Admin-configured hooks by lifecycle phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OciHooksConfig {
    pub prestart: Vec<OciHookEntry>,
    pub poststart: Vec<OciHookEntry>,
    pub poststop: Vec<OciHookEntry>,
}

/// A site-administrator mount applied to every container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteMountEntry {
    pub source: PathBuf,
    pub destination: PathBuf,
    #[serde(default)]
    pub flags: Vec<String>,
}

/// Policy applied to user-requested bind mounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserMountPolicy {
    /// Flags a user is allowed to request.
    pub allowed_flags: Vec<String>,
    /// Destination prefixes denied in addition to the built-in set.
    pub denied_prefixes: Vec<PathBuf>,
    /// Device files a user may request under /dev.
    pub allowed_devices: Vec<PathBuf>,
}

impl Default for UserMountPolicy {
    fn default() -> Self {
        Self {
            allowed_flags: vec!["readonly".to_string(), "private".to_string()],
            denied_prefixes: Vec::new(),
            allowed_devices: Vec::new(),
        }
    }
}

/// The parsed `sarus.json` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub security_checks: bool,
    pub mksquashfs_path: PathBuf,
    pub init_path: PathBuf,
    pub runc_path: PathBuf,
    pub prefix_dir: PathBuf,
    pub local_repository_base_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub centralized_repository_dir: Option<PathBuf>,
    #[serde(default)]
    pub use_centralized_repository: bool,
    #[serde(default, rename = "OCIHooks")]
    pub oci_hooks: OciHooksConfig,
    #[serde(default)]
    pub site_mounts: Vec<SiteMountEntry>,
    #[serde(default)]
    pub user_mounts: UserMountPolicy,
    /// The invoking user, captured at startup. Not part of the JSON.
    #[serde(skip)]
    pub user_identity: Option<UserIdentity>,
}

impl Config {
    /// Loads `<prefix>/etc/sarus.json`, applying the weak self-check.
    pub fn load(prefix_dir: &Path) -> Result<Self> {
        let config_path = prefix_dir.join("etc/sarus.json");

        // Read before verifying (see module docs).
        let contents = fs::read_to_string(&config_path).map_err(|e| {
            Error::ConfigInvalid(format!("cannot read {}: {}", config_path.display(), e))
        })?;
        security::assert_file_untamperable(&config_path)?;

        let mut config: Config = serde_json::from_str(&contents)
            .map_err(|e| Error::ConfigInvalid(format!("{}: {}", config_path.display(), e)))?;
        config.validate()?;
        config.user_identity = Some(UserIdentity::from_process()?);

        info!("loaded configuration from {}", config_path.display());
        Ok(config)
    }

    /// Field-level validation, replacing schema validation.
    pub fn validate(&self) -> Result<()> {
        for (name, path) in [
            ("mksquashfsPath", &self.mksquashfs_path),
            ("initPath", &self.init_path),
            ("runcPath", &self.runc_path),
            ("prefixDir", &self.prefix_dir),
            ("localRepositoryBaseDir", &self.local_repository_base_dir),
        ] {
            if !path.is_absolute() {
                return Err(Error::ConfigInvalid(format!(
                    "{} must be an absolute path, got '{}'",
                    name,
                    path.display()
                )));
            }
        }
        if self.use_centralized_repository && self.centralized_repository_dir.is_none() {
            return Err(Error::ConfigInvalid(
                "useCentralizedRepository is set but centralizedRepositoryDir is missing"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Runs the untamperability sweep over everything the launcher trusts.
    ///
    /// The weak check on `sarus.json` itself happens at load time and is
    /// unconditional; the sweep below honors the `securityChecks` toggle.
    pub fn run_security_checks(&self) -> Result<()> {
        if !self.security_checks {
            info!("skipping security checks (disabled in sarus.json)");
            return Ok(());
        }

        for path in [&self.mksquashfs_path, &self.init_path, &self.runc_path] {
            security::assert_untamperable(path)?;
        }
        for entry in self
            .oci_hooks
            .prestart
            .iter()
            .chain(&self.oci_hooks.poststart)
            .chain(&self.oci_hooks.poststop)
        {
            debug!("checking OCI hook {}", entry.path.display());
            security::assert_untamperable(&entry.path)?;
        }
        let dropbear_dir = self.prefix_dir.join("dropbear");
        if dropbear_dir.exists() {
            security::assert_untamperable(&dropbear_dir)?;
        }
        Ok(())
    }

    /// The repository images are read from: the centralized repository when
    /// enabled, the local one otherwise. Mutations always target the local
    /// repository.
    pub fn read_repository_base(&self) -> &Path {
        if self.use_centralized_repository
            && let Some(dir) = &self.centralized_repository_dir
        {
            return dir;
        }
        &self.local_repository_base_dir
    }

    /// The invoking user captured at load time.
    pub fn identity(&self) -> Result<&UserIdentity> {
        self.user_identity
            .as_ref()
            .ok_or_else(|| Error::ConfigInvalid("user identity not captured".to_string()))
    }
}

/// Builds the environment map for a configured hook entry.
pub fn hook_env_map(entry: &OciHookEntry) -> HashMap<String, String> {
    entry
        .env
        .iter()
        .flatten()
        .filter_map(|kv| kv.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
        .collect()
}
