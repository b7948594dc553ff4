//! Tests for the local image repository.
//!
//! Validates the reference-keyed layout, round-trips, atomic replacement
//! and the metadata/squashfs coexistence invariant.

use sarus::image::ImageMetadata;
use sarus::reference::ImageReference;
use sarus::storage::ImageStore;
use tempfile::TempDir;

fn metadata_fixture() -> ImageMetadata {
    ImageMetadata {
        cmd: Some(vec!["/bin/sh".to_string()]),
        entrypoint: None,
        env: vec![("PATH".to_string(), "/usr/bin:/bin".to_string())],
        workdir: Some("/work".to_string()),
    }
}

fn squashfs_fixture(dir: &TempDir, contents: &[u8]) -> std::path::PathBuf {
    let path = dir.path().join("staged.squashfs");
    std::fs::write(&path, contents).unwrap();
    path
}

// =============================================================================
// Round-trips
// =============================================================================

#[test]
fn test_put_get_roundtrip() {
    let temp = TempDir::new().unwrap();
    let store = ImageStore::open(&temp.path().join("repo")).unwrap();
    let reference = ImageReference::parse("alpine:3.18").unwrap();
    let squashfs = squashfs_fixture(&temp, b"squashfs bytes");

    let stored = store
        .put(&reference, &squashfs, "sha256:abc123", &metadata_fixture())
        .unwrap();

    assert!(store.has(&reference));
    let fetched = store.get(&reference).unwrap();
    assert_eq!(fetched.digest, stored.digest);
    assert_eq!(fetched.reference, reference);
    assert_eq!(fetched.size, b"squashfs bytes".len() as u64);
    assert_eq!(fetched.metadata.cmd, metadata_fixture().cmd);
    assert_eq!(
        std::fs::read(&fetched.squashfs_path).unwrap(),
        b"squashfs bytes"
    );
}

#[test]
fn test_digest_roundtrips_exactly() {
    let temp = TempDir::new().unwrap();
    let store = ImageStore::open(&temp.path().join("repo")).unwrap();
    let reference = ImageReference::parse("alpine:3.18").unwrap();
    let squashfs = squashfs_fixture(&temp, b"data");

    let digest = "sha256:4abcf20661432fb2d719aaf90656f55c287f8ca915dc1c92ec14ff61e67fbaf8";
    store
        .put(&reference, &squashfs, digest, &metadata_fixture())
        .unwrap();
    assert_eq!(store.get(&reference).unwrap().digest, digest);
}

#[test]
fn test_remove_then_has_is_false() {
    let temp = TempDir::new().unwrap();
    let store = ImageStore::open(&temp.path().join("repo")).unwrap();
    let reference = ImageReference::parse("alpine:3.18").unwrap();
    let squashfs = squashfs_fixture(&temp, b"data");

    store
        .put(&reference, &squashfs, "sha256:abc", &metadata_fixture())
        .unwrap();
    assert!(store.has(&reference));

    store.remove(&reference).unwrap();
    assert!(!store.has(&reference));
    assert!(store.get(&reference).is_err());
}

#[test]
fn test_remove_missing_image_fails() {
    let temp = TempDir::new().unwrap();
    let store = ImageStore::open(&temp.path().join("repo")).unwrap();
    let reference = ImageReference::parse("ghost:1").unwrap();
    assert!(store.remove(&reference).is_err());
}

#[test]
fn test_put_replaces_previous_entry() {
    let temp = TempDir::new().unwrap();
    let store = ImageStore::open(&temp.path().join("repo")).unwrap();
    let reference = ImageReference::parse("alpine:3.18").unwrap();

    let first = squashfs_fixture(&temp, b"first");
    store
        .put(&reference, &first, "sha256:one", &metadata_fixture())
        .unwrap();

    let second_path = temp.path().join("second.squashfs");
    std::fs::write(&second_path, b"second").unwrap();
    store
        .put(&reference, &second_path, "sha256:two", &metadata_fixture())
        .unwrap();

    let fetched = store.get(&reference).unwrap();
    assert_eq!(fetched.digest, "sha256:two");
    assert_eq!(std::fs::read(&fetched.squashfs_path).unwrap(), b"second");
    assert_eq!(store.list().unwrap().len(), 1, "one entry per reference");
}

// =============================================================================
// Layout
// =============================================================================

#[test]
fn test_layout_is_server_namespace_image_tag() {
    let temp = TempDir::new().unwrap();
    let store = ImageStore::open(&temp.path().join("repo")).unwrap();
    let reference = ImageReference::parse("quay.io/org/tool:2.1").unwrap();
    let squashfs = squashfs_fixture(&temp, b"data");

    store
        .put(&reference, &squashfs, "sha256:abc", &metadata_fixture())
        .unwrap();

    let expected = temp.path().join("repo/quay.io/org/tool/2.1.squashfs");
    assert!(expected.exists(), "expected {}", expected.display());
    assert!(expected.with_extension("meta").exists());
}

#[test]
fn test_metadata_always_coexists_with_squashfs() {
    let temp = TempDir::new().unwrap();
    let store = ImageStore::open(&temp.path().join("repo")).unwrap();
    let reference = ImageReference::parse("alpine:3.18").unwrap();
    let squashfs = squashfs_fixture(&temp, b"data");

    let stored = store
        .put(&reference, &squashfs, "sha256:abc", &metadata_fixture())
        .unwrap();
    assert!(stored.squashfs_path.exists());
    assert!(stored.metadata_path.exists());

    // A metadata file with no squashfs is invisible to readers.
    std::fs::remove_file(&stored.squashfs_path).unwrap();
    assert!(store.get(&reference).is_err());
    assert!(store.list().unwrap().is_empty());
}

// =============================================================================
// Listing
// =============================================================================

#[test]
fn test_list_is_sorted_and_complete() {
    let temp = TempDir::new().unwrap();
    let store = ImageStore::open(&temp.path().join("repo")).unwrap();
    let squashfs = squashfs_fixture(&temp, b"data");

    for name in ["zeta:1", "alpha:1", "mid:2"] {
        let reference = ImageReference::parse(name).unwrap();
        store
            .put(&reference, &squashfs, "sha256:abc", &metadata_fixture())
            .unwrap();
    }

    let listed = store.list().unwrap();
    assert_eq!(listed.len(), 3);
    let names: Vec<String> = listed.iter().map(|i| i.reference.image.clone()).collect();
    assert_eq!(names, ["alpha", "mid", "zeta"]);
}

#[test]
fn test_list_of_empty_store() {
    let temp = TempDir::new().unwrap();
    let store = ImageStore::open(&temp.path().join("repo")).unwrap();
    assert!(store.list().unwrap().is_empty());
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn test_concurrent_puts_of_different_references() {
    use std::sync::Arc;
    use std::thread;

    let temp = TempDir::new().unwrap();
    let store = Arc::new(ImageStore::open(&temp.path().join("repo")).unwrap());
    let squashfs = Arc::new(squashfs_fixture(&temp, b"data"));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let store = Arc::clone(&store);
            let squashfs = Arc::clone(&squashfs);
            thread::spawn(move || {
                let reference = ImageReference::parse(&format!("img{}:1", i)).unwrap();
                store
                    .put(&reference, &squashfs, "sha256:abc", &ImageMetadata::default())
                    .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.list().unwrap().len(), 8);
}
