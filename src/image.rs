//! Image expansion and packing.
//!
//! Converts an image source (registry pull, Docker archive, OCI archive)
//! into an expanded rootfs, projects the image config into [`ImageMetadata`],
//! packs the rootfs into a squashfs with the trusted `mksquashfs` binary and
//! digests the result. The packed image is then handed to the
//! [`ImageStore`](crate::storage::ImageStore).
//!
//! ## Security Model
//!
//! Layer expansion is a critical boundary; malicious images can attempt to
//! escape the staging directory. Every tar entry is validated:
//!
//! - Paths containing `..` or starting with `/` are rejected.
//! - Cumulative size is capped by `MAX_ROOTFS_SIZE`, per-layer compressed
//!   size by `MAX_LAYER_SIZE`, entry count by `MAX_FILES_PER_LAYER`.
//! - Whiteout markers only ever remove paths below the staging rootfs.
//! - Symlinks are stored verbatim; their targets are only meaningful inside
//!   the container's mount namespace and are never followed here.
//! - Device nodes and setuid bits are preserved but logged.
//!
//! Expansion runs with the invoking user's effective ids; only the
//! `mksquashfs` invocation is privileged-path sensitive and the binary is
//! checked untamperable before spawning.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tar::{Archive, EntryType};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::constants::{MAX_FILES_PER_LAYER, MAX_LAYER_SIZE, MAX_ROOTFS_SIZE};
use crate::error::{Error, Result};
use crate::identity::PrivilegeGuard;
use crate::reference::ImageReference;
use crate::registry;
use crate::security;

// =============================================================================
// Metadata
// =============================================================================

/// Execution metadata projected from the OCI image config.
///
/// `env` is an ordered list of pairs: the order in which the image declared
/// its variables is preserved into the container's `process.env`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
}

/// The `config` section of an OCI image config blob.
#[derive(Debug, Clone, Default, Deserialize)]
struct OciImageConfigSection {
    #[serde(rename = "Cmd")]
    cmd: Option<Vec<String>>,
    #[serde(rename = "Entrypoint")]
    entrypoint: Option<Vec<String>>,
    #[serde(rename = "Env", default)]
    env: Vec<String>,
    #[serde(rename = "WorkingDir")]
    working_dir: Option<String>,
}

/// An OCI image config blob (the parts the launcher consumes).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OciImageConfig {
    #[serde(default)]
    config: OciImageConfigSection,
}

impl OciImageConfig {
    /// Parses an image config blob.
    pub fn from_json(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }

    /// Projects the blob into [`ImageMetadata`].
    pub fn project(&self) -> ImageMetadata {
        let env = self
            .config
            .env
            .iter()
            .filter_map(|kv| kv.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
            .collect();
        let workdir = self
            .config
            .working_dir
            .as_deref()
            .filter(|w| !w.is_empty())
            .map(String::from);
        ImageMetadata {
            cmd: self.config.cmd.clone(),
            entrypoint: self.config.entrypoint.clone(),
            env,
            workdir,
        }
    }
}

// =============================================================================
// Sources
// =============================================================================

/// Where an image comes from.
#[derive(Debug, Clone)]
pub enum ImageSource {
    /// Pull from a remote registry.
    RegistryPull {
        reference: ImageReference,
        credentials: Option<(String, String)>,
    },
    /// Import a `docker save` style archive.
    ArchiveImport { tar_path: PathBuf },
    /// Import an OCI image-layout archive.
    OciArchive { tar_path: PathBuf },
}

/// A packed image ready for the store.
///
/// Owns its staging directory; dropping the value removes the staged
/// squashfs and expansion tree.
#[derive(Debug)]
pub struct PackedImage {
    pub squashfs_path: PathBuf,
    pub metadata: ImageMetadata,
    pub digest: String,
    _staging: StagingDir,
}

/// An owned staging directory, removed on drop.
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    /// Creates a unique staging directory below `base`.
    pub fn create(base: &Path) -> Result<Self> {
        let path = base.join(format!(".staging-{}", uuid::Uuid::now_v7()));
        fs::create_dir_all(&path).map_err(|e| Error::io_path(&path, e))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("failed to remove staging dir {}: {}", self.path.display(), e);
            }
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Expands, packs and digests images.
pub struct ImageBuilder {
    config: Arc<Config>,
}

impl ImageBuilder {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Builds a packed image from any source.
    pub fn build(&self, source: &ImageSource) -> Result<PackedImage> {
        let staging = StagingDir::create(&self.config.local_repository_base_dir)?;
        let rootfs = staging.path().join("rootfs");
        fs::create_dir_all(&rootfs).map_err(|e| Error::io_path(&rootfs, e))?;

        // Expansion works on behalf of the user, never with privilege.
        let metadata = {
            let _guard = PrivilegeGuard::lower_to(self.config.identity()?)?;
            match source {
                ImageSource::RegistryPull {
                    reference,
                    credentials,
                } => self.expand_from_registry(reference, credentials.as_ref(), staging.path(), &rootfs)?,
                ImageSource::ArchiveImport { tar_path } => {
                    self.expand_from_docker_archive(tar_path, staging.path(), &rootfs)?
                }
                ImageSource::OciArchive { tar_path } => {
                    self.expand_from_oci_archive(tar_path, staging.path(), &rootfs)?
                }
            }
        };

        let squashfs_path = self.pack_squashfs(&rootfs, staging.path())?;
        let digest = digest_file(&squashfs_path)?;
        info!("packed image, digest {}", digest);

        Ok(PackedImage {
            squashfs_path,
            metadata,
            digest,
            _staging: staging,
        })
    }

    fn expand_from_registry(
        &self,
        reference: &ImageReference,
        credentials: Option<&(String, String)>,
        staging: &Path,
        rootfs: &Path,
    ) -> Result<ImageMetadata> {
        let fetched = registry::fetch(reference, credentials, staging)?;
        expand_layers(&fetched.layer_paths, rootfs)?;
        Ok(fetched.config.project())
    }

    /// Expands a `docker save` archive: `manifest.json` names the config
    /// blob and the ordered layer tars.
    fn expand_from_docker_archive(
        &self,
        tar_path: &Path,
        staging: &Path,
        rootfs: &Path,
    ) -> Result<ImageMetadata> {
        #[derive(Deserialize)]
        struct ManifestEntry {
            #[serde(rename = "Config")]
            config: String,
            #[serde(rename = "Layers")]
            layers: Vec<String>,
        }

        let unpack_dir = staging.join("archive");
        unpack_archive(tar_path, &unpack_dir)?;

        let manifest_path = unpack_dir.join("manifest.json");
        let manifest: Vec<ManifestEntry> = serde_json::from_str(
            &fs::read_to_string(&manifest_path).map_err(|e| Error::io_path(&manifest_path, e))?,
        )?;
        let entry = manifest.first().ok_or_else(|| {
            Error::LayerExpansionFailed {
                digest: tar_path.display().to_string(),
                reason: "archive manifest.json is empty".to_string(),
            }
        })?;

        let layer_paths: Vec<PathBuf> = entry.layers.iter().map(|l| unpack_dir.join(l)).collect();
        expand_layers(&layer_paths, rootfs)?;

        let config_raw = fs::read(unpack_dir.join(&entry.config))
            .map_err(|e| Error::io_path(unpack_dir.join(&entry.config), e))?;
        Ok(OciImageConfig::from_json(&config_raw)?.project())
    }

    /// Expands an OCI image-layout archive: `index.json` points at the
    /// manifest blob, which names the config and layer blobs.
    fn expand_from_oci_archive(
        &self,
        tar_path: &Path,
        staging: &Path,
        rootfs: &Path,
    ) -> Result<ImageMetadata> {
        #[derive(Deserialize)]
        struct OciIndex {
            manifests: Vec<OciDescriptor>,
        }
        #[derive(Deserialize)]
        struct OciDescriptor {
            digest: String,
        }
        #[derive(Deserialize)]
        struct OciManifest {
            config: OciDescriptor,
            layers: Vec<OciDescriptor>,
        }

        let unpack_dir = staging.join("archive");
        unpack_archive(tar_path, &unpack_dir)?;

        let blob_path = |digest: &str| -> Result<PathBuf> {
            let hash = digest.strip_prefix("sha256:").ok_or_else(|| {
                Error::LayerExpansionFailed {
                    digest: digest.to_string(),
                    reason: "unsupported digest algorithm".to_string(),
                }
            })?;
            if !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(Error::PathTraversal {
                    path: digest.to_string(),
                });
            }
            Ok(unpack_dir.join("blobs/sha256").join(hash))
        };

        let index_path = unpack_dir.join("index.json");
        let index: OciIndex = serde_json::from_str(
            &fs::read_to_string(&index_path).map_err(|e| Error::io_path(&index_path, e))?,
        )?;
        let manifest_desc = index.manifests.first().ok_or_else(|| {
            Error::LayerExpansionFailed {
                digest: tar_path.display().to_string(),
                reason: "OCI index has no manifests".to_string(),
            }
        })?;

        let manifest_raw = fs::read(blob_path(&manifest_desc.digest)?)
            .map_err(|e| Error::io_path(tar_path, e))?;
        let manifest: OciManifest = serde_json::from_slice(&manifest_raw)?;

        let mut layer_paths = Vec::with_capacity(manifest.layers.len());
        for layer in &manifest.layers {
            layer_paths.push(blob_path(&layer.digest)?);
        }
        expand_layers(&layer_paths, rootfs)?;

        let config_raw =
            fs::read(blob_path(&manifest.config.digest)?).map_err(|e| Error::io_path(tar_path, e))?;
        Ok(OciImageConfig::from_json(&config_raw)?.project())
    }

    /// Packs the expanded rootfs with the trusted mksquashfs binary.
    fn pack_squashfs(&self, rootfs: &Path, staging: &Path) -> Result<PathBuf> {
        if self.config.security_checks {
            security::assert_untamperable(&self.config.mksquashfs_path)?;
        }

        let out = staging.join("image.squashfs");
        let output = Command::new(&self.config.mksquashfs_path)
            .arg(rootfs)
            .arg(&out)
            .args(["-noappend", "-no-progress"])
            .output()
            .map_err(|e| Error::io_path(&self.config.mksquashfs_path, e))?;

        if !output.status.success() {
            return Err(Error::BundleBuildFailed(format!(
                "mksquashfs failed with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!("packed {} into {}", rootfs.display(), out.display());
        Ok(out)
    }
}

// =============================================================================
// Layer Expansion
// =============================================================================

/// Expands layer tars in manifest order with OCI whiteout semantics.
pub fn expand_layers(layer_paths: &[PathBuf], rootfs: &Path) -> Result<()> {
    let mut total_size = 0u64;
    for path in layer_paths {
        debug!("expanding layer {}", path.display());
        let file = File::open(path).map_err(|e| Error::io_path(path, e))?;
        let len = file.metadata().map_err(|e| Error::io_path(path, e))?.len();
        if len > MAX_LAYER_SIZE as u64 {
            return Err(Error::ImageTooLarge {
                size: len,
                limit: MAX_LAYER_SIZE as u64,
            });
        }
        let reader = maybe_gz(file, path)?;
        expand_one_layer(reader, rootfs, path, &mut total_size)?;
    }
    Ok(())
}

/// Wraps the layer file in a gzip decoder when it carries the gzip magic.
fn maybe_gz(mut file: File, path: &Path) -> Result<Box<dyn Read>> {
    use std::io::Seek;
    let mut magic = [0u8; 2];
    let is_gz = file.read_exact(&mut magic).is_ok() && magic == [0x1f, 0x8b];
    file.rewind().map_err(|e| Error::io_path(path, e))?;
    if is_gz {
        Ok(Box::new(GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

fn expand_one_layer(
    reader: Box<dyn Read>,
    rootfs: &Path,
    layer_path: &Path,
    total_size: &mut u64,
) -> Result<()> {
    let layer_name = layer_path.display().to_string();
    let expansion_error = |reason: String| Error::LayerExpansionFailed {
        digest: layer_name.clone(),
        reason,
    };

    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);

    // Paths created by THIS layer, consulted by opaque-dir clearing so a
    // layer never deletes its own entries.
    let mut created_this_layer: HashSet<PathBuf> = HashSet::new();
    let mut file_count = 0usize;

    for entry in archive.entries().map_err(|e| expansion_error(e.to_string()))? {
        file_count += 1;
        if file_count > MAX_FILES_PER_LAYER {
            return Err(expansion_error(format!(
                "exceeds maximum file count ({})",
                MAX_FILES_PER_LAYER
            )));
        }

        let mut entry = entry.map_err(|e| expansion_error(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| expansion_error(e.to_string()))?
            .into_owned();

        let path_str = path.to_string_lossy();
        if path_str.split('/').any(|c| c == "..") || path_str.starts_with('/') {
            return Err(Error::PathTraversal {
                path: path_str.to_string(),
            });
        }

        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");

        // Opaque marker: clear everything the directory inherited from
        // lower layers.
        if file_name == ".wh..wh..opq" {
            let dir = rootfs.join(path.parent().unwrap_or(Path::new("")));
            clear_inherited_entries(&dir, rootfs, &created_this_layer)?;
            continue;
        }

        // Plain whiteout: delete the named sibling from lower layers.
        if let Some(target) = file_name.strip_prefix(".wh.") {
            let target_path = rootfs
                .join(path.parent().unwrap_or(Path::new("")))
                .join(target);
            remove_any(&target_path);
            continue;
        }

        *total_size += entry.size();
        if *total_size > MAX_ROOTFS_SIZE {
            return Err(Error::ImageTooLarge {
                size: *total_size,
                limit: MAX_ROOTFS_SIZE,
            });
        }

        let entry_type = entry.header().entry_type();
        let mode = entry.header().mode().unwrap_or(0);

        // Preserved but flagged: setuid/setgid bits and device nodes.
        if mode & 0o6000 != 0 {
            warn!("layer {} carries setuid/setgid entry {}", layer_name, path_str);
        }
        match entry_type {
            EntryType::Block | EntryType::Char => {
                warn!("layer {} carries device node {}", layer_name, path_str);
                // Creating device nodes needs privilege the expansion path
                // deliberately does not hold; tolerate the failure.
                if let Err(e) = entry.unpack_in(rootfs) {
                    debug!("skipping device node {}: {}", path_str, e);
                }
                continue;
            }
            _ => {}
        }

        // A regular entry replaces whatever a lower layer put there.
        let destination = rootfs.join(&path);
        if destination.symlink_metadata().is_ok() && !created_this_layer.contains(&destination) {
            if !destination.is_dir() || !entry_type.is_dir() {
                remove_any(&destination);
            }
        }

        entry
            .unpack_in(rootfs)
            .map_err(|e| expansion_error(format!("{}: {}", path_str, e)))?;
        created_this_layer.insert(destination);
    }

    Ok(())
}

/// Removes the entries of `dir` that were inherited from lower layers.
fn clear_inherited_entries(
    dir: &Path,
    rootfs: &Path,
    created_this_layer: &HashSet<PathBuf>,
) -> Result<()> {
    if !dir.starts_with(rootfs) || !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir).map_err(|e| Error::io_path(dir, e))? {
        let entry = entry.map_err(|e| Error::io_path(dir, e))?;
        let path = entry.path();
        if !created_this_layer.contains(&path) {
            remove_any(&path);
        }
    }
    Ok(())
}

fn remove_any(path: &Path) {
    if let Ok(meta) = path.symlink_metadata() {
        let result = if meta.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        if let Err(e) = result {
            warn!("failed to remove {}: {}", path.display(), e);
        }
    }
}

/// Unpacks a trusted-side archive (docker/OCI save file) into `dir`.
fn unpack_archive(tar_path: &Path, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| Error::io_path(dir, e))?;
    let file = File::open(tar_path).map_err(|e| Error::io_path(tar_path, e))?;
    let mut archive = Archive::new(maybe_gz(file, tar_path)?);
    archive
        .unpack(dir)
        .map_err(|e| Error::io_path(tar_path, e))?;
    Ok(())
}

/// SHA-256 digest of a file, in `sha256:<hex>` form.
pub fn digest_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| Error::io_path(path, e))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|e| Error::io_path(path, e))?;
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}
