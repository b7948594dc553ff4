//! Local image repository.
//!
//! Stores squashfs-packed images keyed by their normalized reference:
//!
//! ```text
//! <base>/<server>/<namespace>/<image>/<tag>.squashfs
//! <base>/<server>/<namespace>/<image>/<tag>.meta
//! ```
//!
//! ## Concurrency
//!
//! Mutations (`put`, `remove`) hold an exclusive advisory lock on
//! `<base>/.lock`. Readers never take the lock: writers stage under unique
//! temp names and rename into place, renaming the metadata file AFTER the
//! squashfs, so a reader that sees a `.meta` always finds its squashfs.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::constants::{METADATA_EXT, SQUASHFS_EXT, STORE_LOCK_FILE};
use crate::error::{Error, Result};
use crate::image::ImageMetadata;
use crate::reference::ImageReference;

/// One image in the local repository.
#[derive(Debug, Clone)]
pub struct StoredImage {
    pub reference: ImageReference,
    pub squashfs_path: PathBuf,
    pub metadata_path: PathBuf,
    pub digest: String,
    pub created_at: u64,
    pub size: u64,
    pub metadata: ImageMetadata,
}

/// Persisted form of the `.meta` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMetadata {
    reference: ImageReference,
    digest: String,
    created_at: u64,
    size: u64,
    image: ImageMetadata,
}

/// Repository of squashfs-packed images.
pub struct ImageStore {
    base_dir: PathBuf,
}

impl ImageStore {
    /// Opens (creating if necessary) the repository at `base_dir`.
    pub fn open(base_dir: &Path) -> Result<Self> {
        fs::create_dir_all(base_dir).map_err(|e| Error::io_path(base_dir, e))?;
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
        })
    }

    /// Returns the repository base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Whether an image for `reference` is present.
    pub fn has(&self, reference: &ImageReference) -> bool {
        self.metadata_path(reference).exists()
    }

    /// Loads a stored image by reference.
    pub fn get(&self, reference: &ImageReference) -> Result<StoredImage> {
        let metadata_path = self.metadata_path(reference);
        let contents = fs::read_to_string(&metadata_path)
            .map_err(|_| Error::ImageNotFound(reference.canonical()))?;
        let stored: StoredMetadata = serde_json::from_str(&contents)?;

        let squashfs_path = self.squashfs_path(reference);
        if !squashfs_path.exists() {
            return Err(Error::ImageNotFound(reference.canonical()));
        }

        Ok(StoredImage {
            reference: stored.reference,
            squashfs_path,
            metadata_path,
            digest: stored.digest,
            created_at: stored.created_at,
            size: stored.size,
            metadata: stored.image,
        })
    }

    /// Stores a packed image, replacing any previous entry for `reference`.
    ///
    /// The squashfs is copied from `squashfs_src` into the repository under a
    /// unique temp name, fsynced, then renamed; the metadata follows the same
    /// pattern and is renamed last.
    pub fn put(
        &self,
        reference: &ImageReference,
        squashfs_src: &Path,
        digest: &str,
        metadata: &ImageMetadata,
    ) -> Result<StoredImage> {
        let _lock = self.lock_for_mutation()?;

        let squashfs_path = self.squashfs_path(reference);
        let metadata_path = self.metadata_path(reference);
        let parent = squashfs_path
            .parent()
            .ok_or_else(|| Error::ImageNotFound(reference.canonical()))?;
        fs::create_dir_all(parent).map_err(|e| Error::io_path(parent, e))?;

        let size = fs::metadata(squashfs_src)
            .map_err(|e| Error::io_path(squashfs_src, e))?
            .len();
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        // Stage and publish the squashfs first.
        let squashfs_tmp = parent.join(format!(".tmp.{}.{}", uuid::Uuid::now_v7(), SQUASHFS_EXT));
        copy_and_sync(squashfs_src, &squashfs_tmp)?;
        fs::rename(&squashfs_tmp, &squashfs_path).map_err(|e| {
            let _ = fs::remove_file(&squashfs_tmp);
            Error::io_path(&squashfs_path, e)
        })?;

        let stored = StoredMetadata {
            reference: reference.clone(),
            digest: digest.to_string(),
            created_at,
            size,
            image: metadata.clone(),
        };
        let metadata_tmp = parent.join(format!(".tmp.{}.{}", uuid::Uuid::now_v7(), METADATA_EXT));
        write_and_sync(&metadata_tmp, serde_json::to_string_pretty(&stored)?.as_bytes())?;
        fs::rename(&metadata_tmp, &metadata_path).map_err(|e| {
            let _ = fs::remove_file(&metadata_tmp);
            Error::io_path(&metadata_path, e)
        })?;

        info!("stored image {} ({} bytes)", reference.canonical(), size);
        Ok(StoredImage {
            reference: reference.clone(),
            squashfs_path,
            metadata_path,
            digest: digest.to_string(),
            created_at,
            size,
            metadata: metadata.clone(),
        })
    }

    /// Removes the entry for `reference`; the metadata goes first so readers
    /// never observe a dangling `.meta`.
    pub fn remove(&self, reference: &ImageReference) -> Result<()> {
        let _lock = self.lock_for_mutation()?;

        let metadata_path = self.metadata_path(reference);
        let squashfs_path = self.squashfs_path(reference);
        if !metadata_path.exists() && !squashfs_path.exists() {
            return Err(Error::ImageNotFound(reference.canonical()));
        }

        if metadata_path.exists() {
            fs::remove_file(&metadata_path).map_err(|e| Error::io_path(&metadata_path, e))?;
        }
        if squashfs_path.exists() {
            fs::remove_file(&squashfs_path).map_err(|e| Error::io_path(&squashfs_path, e))?;
        }
        debug!("removed image {}", reference.canonical());
        Ok(())
    }

    /// Lists all stored images.
    pub fn list(&self) -> Result<Vec<StoredImage>> {
        let mut images = Vec::new();
        let mut stack = vec![self.base_dir.clone()];
        while let Some(dir) = stack.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::io_path(&dir, e)),
            };
            for entry in entries {
                let entry = entry.map_err(|e| Error::io_path(&dir, e))?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().is_some_and(|e| e == METADATA_EXT)
                    && let Ok(contents) = fs::read_to_string(&path)
                    && let Ok(stored) = serde_json::from_str::<StoredMetadata>(&contents)
                {
                    // Tolerate concurrent writers: skip entries whose
                    // squashfs has not been published yet.
                    let squashfs = path.with_extension(SQUASHFS_EXT);
                    if squashfs.exists() {
                        images.push(StoredImage {
                            reference: stored.reference,
                            squashfs_path: squashfs,
                            metadata_path: path,
                            digest: stored.digest,
                            created_at: stored.created_at,
                            size: stored.size,
                            metadata: stored.image,
                        });
                    }
                }
            }
        }
        images.sort_by(|a, b| a.reference.canonical().cmp(&b.reference.canonical()));
        Ok(images)
    }

    fn lock_for_mutation(&self) -> Result<Flock<File>> {
        let lock_path = self.base_dir.join(STORE_LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| Error::io_path(&lock_path, e))?;
        Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
            Error::io_path(&lock_path, io::Error::from_raw_os_error(errno as i32))
        })
    }

    /// Repository path of the packed image.
    pub fn squashfs_path(&self, reference: &ImageReference) -> PathBuf {
        self.entry_dir(reference)
            .join(format!("{}.{}", reference.tag, SQUASHFS_EXT))
    }

    /// Repository path of the metadata file.
    pub fn metadata_path(&self, reference: &ImageReference) -> PathBuf {
        self.entry_dir(reference)
            .join(format!("{}.{}", reference.tag, METADATA_EXT))
    }

    fn entry_dir(&self, reference: &ImageReference) -> PathBuf {
        self.base_dir
            .join(reference.server.to_ascii_lowercase())
            .join(&reference.namespace)
            .join(&reference.image)
    }
}

fn copy_and_sync(src: &Path, dst: &Path) -> Result<()> {
    fs::copy(src, dst).map_err(|e| Error::io_path(dst, e))?;
    let file = File::open(dst).map_err(|e| Error::io_path(dst, e))?;
    file.sync_all().map_err(|e| Error::io_path(dst, e))?;
    Ok(())
}

fn write_and_sync(path: &Path, contents: &[u8]) -> Result<()> {
    fs::write(path, contents).map_err(|e| Error::io_path(path, e))?;
    let file = File::open(path).map_err(|e| Error::io_path(path, e))?;
    file.sync_all().map_err(|e| Error::io_path(path, e))?;
    Ok(())
}
