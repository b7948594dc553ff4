//! Untamperability checks on paths consumed with root privilege.
//!
//! A path is untamperable when it and every ancestor up to the filesystem
//! root are owned by uid 0 and writable by neither group nor other. Every
//! binary, hook and configuration directory whose contents influence
//! privileged execution must pass these checks before use.
//!
//! ## Check ordering
//!
//! Callers that both read a file and verify it must read FIRST and verify
//! SECOND. Verifying before reading opens a window in which an attacker can
//! swap the file contents between the check and the read.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};

use nix::sys::stat::Mode;
use tracing::debug;

use crate::error::{Error, Result};

/// Group- and world-write bits, the only mode bits the checks care about.
const TAMPER_MASK: u32 = Mode::S_IWGRP.bits() as u32 | Mode::S_IWOTH.bits() as u32;

/// Verifies that `path`, all its ancestors, and (for directories) all its
/// descendants are owned by root and not group- or world-writable.
pub fn assert_untamperable(path: &Path) -> Result<()> {
    debug!("checking that {} is untamperable", path.display());

    for ancestor in ancestors_up_to_root(path) {
        assert_root_owned(&ancestor)?;
        assert_not_group_or_world_writable(&ancestor)?;
    }

    let meta = fs::metadata(path).map_err(|e| Error::io_path(path, e))?;
    if meta.is_dir() {
        check_tree(path)?;
    }

    Ok(())
}

/// The single-path ownership check: the owning uid must be 0.
pub fn assert_root_owned(path: &Path) -> Result<()> {
    let meta = fs::metadata(path).map_err(|e| Error::io_path(path, e))?;
    if meta.uid() != 0 {
        return Err(Error::SecurityViolation {
            path: path.to_path_buf(),
            reason: "must be owned by root to prevent tampering".to_string(),
            uid: meta.uid(),
            mode: meta.mode() & 0o7777,
        });
    }
    Ok(())
}

/// The single-path permission check: neither S_IWGRP nor S_IWOTH may be set.
pub fn assert_not_group_or_world_writable(path: &Path) -> Result<()> {
    let meta = fs::metadata(path).map_err(|e| Error::io_path(path, e))?;
    let mode = meta.mode() & 0o7777;
    if mode & TAMPER_MASK != 0 {
        return Err(Error::SecurityViolation {
            path: path.to_path_buf(),
            reason: "must not be group- or world-writable".to_string(),
            uid: meta.uid(),
            mode,
        });
    }
    Ok(())
}

/// Both primitive checks on one path, without walking ancestors.
///
/// This is the "weak" check applied to the configuration file itself, whose
/// ancestors (e.g. an NFS-mounted prefix) may legitimately have other owners.
pub fn assert_file_untamperable(path: &Path) -> Result<()> {
    assert_root_owned(path)?;
    assert_not_group_or_world_writable(path)
}

fn check_tree(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir).map_err(|e| Error::io_path(dir, e))? {
        let entry = entry.map_err(|e| Error::io_path(dir, e))?;
        let path = entry.path();
        // Symlink targets are not followed; the link itself is what an
        // attacker would have to replace, and its parent is already checked.
        let meta = fs::symlink_metadata(&path).map_err(|e| Error::io_path(&path, e))?;
        if meta.file_type().is_symlink() {
            continue;
        }
        assert_root_owned(&path)?;
        assert_not_group_or_world_writable(&path)?;
        if meta.is_dir() {
            check_tree(&path)?;
        }
    }
    Ok(())
}

/// Yields `path` and every ancestor, innermost first, stopping at `/`.
fn ancestors_up_to_root(path: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut current = path.to_path_buf();
    loop {
        out.push(current.clone());
        match current.parent() {
            Some(parent) if parent.components().next().is_some() => {
                current = parent.to_path_buf();
            }
            _ => break,
        }
    }
    // Include the filesystem root itself when the path is absolute.
    if path.components().next() == Some(Component::RootDir)
        && out.last().map(|p| p.as_path()) != Some(Path::new("/"))
    {
        out.push(PathBuf::from("/"));
    }
    out
}
