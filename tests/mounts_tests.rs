//! Tests for mount planning and user-mount validation.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use nix::mount::MsFlags;
use sarus::config::Config;
use sarus::error::Error;
use sarus::mounts::{Mount, MountPlanner, UserMountRequest, resolve_in_rootfs};
use tempfile::TempDir;

fn config_fixture(allowed_flags: &[&str], denied_prefixes: &[&str]) -> Config {
    serde_json::from_value(serde_json::json!({
        "securityChecks": false,
        "mksquashfsPath": "/usr/bin/mksquashfs",
        "initPath": "/usr/bin/init",
        "runcPath": "/usr/bin/runc",
        "prefixDir": "/opt/sarus",
        "localRepositoryBaseDir": "/var/sarus",
        "siteMounts": [
            {"source": "/opt/site/mpi", "destination": "/usr/lib/site-mpi", "flags": ["readonly"]}
        ],
        "userMounts": {
            "allowedFlags": allowed_flags,
            "deniedPrefixes": denied_prefixes,
            "allowedDevices": ["/dev/null"]
        }
    }))
    .unwrap()
}

fn rootfs_fixture() -> TempDir {
    let temp = TempDir::new().unwrap();
    fs::create_dir_all(temp.path().join("etc")).unwrap();
    fs::create_dir_all(temp.path().join("data")).unwrap();
    temp
}

fn readable_source(temp: &TempDir) -> PathBuf {
    let source = temp.path().join("host-data");
    fs::create_dir_all(&source).unwrap();
    source
}

fn request(source: &Path, destination: &str, flags: &[&str]) -> UserMountRequest {
    UserMountRequest {
        source: source.to_path_buf(),
        destination: PathBuf::from(destination),
        flags: flags.iter().map(|f| f.to_string()).collect(),
    }
}

// =============================================================================
// Validation Denials
// =============================================================================

#[test]
fn test_destination_root_is_denied() {
    let config = config_fixture(&["readonly"], &[]);
    let rootfs = rootfs_fixture();
    let source = readable_source(&rootfs);

    let result = MountPlanner::new(&config)
        .validate_user_mount(&request(&source, "/", &[]), rootfs.path());
    assert!(matches!(result, Err(Error::MountDenied { .. })));
}

#[test]
fn test_escape_through_dotdot_is_denied() {
    let config = config_fixture(&["readonly"], &[]);
    let rootfs = rootfs_fixture();
    let source = readable_source(&rootfs);

    // Parent traversal clamps at the rootfs, leaving "/" as destination.
    let result = MountPlanner::new(&config)
        .validate_user_mount(&request(&source, "/../../..", &[]), rootfs.path());
    assert!(matches!(result, Err(Error::MountDenied { .. })));
}

#[test]
fn test_denied_builtin_prefixes() {
    let config = config_fixture(&["readonly"], &[]);
    let rootfs = rootfs_fixture();
    let source = readable_source(&rootfs);
    let planner = MountPlanner::new(&config);

    for destination in ["/etc/shadow", "/proc/sys/kernel", "/sys/fs", "/dev/null"] {
        let result =
            planner.validate_user_mount(&request(&source, destination, &[]), rootfs.path());
        assert!(
            matches!(result, Err(Error::MountDenied { .. })),
            "{} should be denied",
            destination
        );
    }
}

#[test]
fn test_admin_denylist_is_honored() {
    let config = config_fixture(&["readonly"], &["/secret"]);
    let rootfs = rootfs_fixture();
    let source = readable_source(&rootfs);

    let result = MountPlanner::new(&config)
        .validate_user_mount(&request(&source, "/secret/area", &[]), rootfs.path());
    assert!(matches!(result, Err(Error::MountDenied { .. })));
}

#[test]
fn test_missing_source_is_denied() {
    let config = config_fixture(&["readonly"], &[]);
    let rootfs = rootfs_fixture();

    let result = MountPlanner::new(&config).validate_user_mount(
        &request(Path::new("/no/such/source"), "/data", &[]),
        rootfs.path(),
    );
    assert!(matches!(result, Err(Error::MountDenied { .. })));
}

#[test]
fn test_flags_must_be_subset_of_policy() {
    let config = config_fixture(&[], &[]);
    let rootfs = rootfs_fixture();
    let source = readable_source(&rootfs);

    let result = MountPlanner::new(&config)
        .validate_user_mount(&request(&source, "/data", &["readonly"]), rootfs.path());
    assert!(matches!(result, Err(Error::MountDenied { .. })));
}

#[test]
fn test_relative_destination_is_denied() {
    let config = config_fixture(&["readonly"], &[]);
    let rootfs = rootfs_fixture();
    let source = readable_source(&rootfs);

    let result = MountPlanner::new(&config)
        .validate_user_mount(&request(&source, "data", &[]), rootfs.path());
    assert!(matches!(result, Err(Error::MountDenied { .. })));
}

// =============================================================================
// Validation Acceptance
// =============================================================================

#[test]
fn test_valid_request_is_accepted() {
    let config = config_fixture(&["readonly"], &[]);
    let rootfs = rootfs_fixture();
    let source = readable_source(&rootfs);

    let accepted = MountPlanner::new(&config)
        .validate_user_mount(&request(&source, "/data/in", &["readonly"]), rootfs.path())
        .unwrap();
    match accepted {
        Mount::User {
            destination, flags, ..
        } => {
            assert_eq!(destination, PathBuf::from("/data/in"));
            assert!(flags.contains(MsFlags::MS_RDONLY));
        }
        other => panic!("expected a user mount, got {:?}", other),
    }
}

#[test]
fn test_absolute_symlink_is_rerooted_not_followed() {
    let config = config_fixture(&["readonly"], &[]);
    let rootfs = rootfs_fixture();
    let source = readable_source(&rootfs);

    // /abs-link -> /data inside the container, regardless of the host /data.
    symlink("/data", rootfs.path().join("abs-link")).unwrap();
    let accepted = MountPlanner::new(&config)
        .validate_user_mount(&request(&source, "/abs-link/sub", &[]), rootfs.path())
        .unwrap();
    assert_eq!(accepted.destination(), Path::new("/data/sub"));
}

#[test]
fn test_symlink_to_denied_prefix_is_caught_after_resolution() {
    let config = config_fixture(&["readonly"], &[]);
    let rootfs = rootfs_fixture();
    let source = readable_source(&rootfs);

    symlink("/etc", rootfs.path().join("innocent")).unwrap();
    let result = MountPlanner::new(&config)
        .validate_user_mount(&request(&source, "/innocent/shadow", &[]), rootfs.path());
    assert!(matches!(result, Err(Error::MountDenied { .. })));
}

#[test]
fn test_relative_symlink_cannot_escape() {
    let rootfs = rootfs_fixture();
    symlink("../../../../outside", rootfs.path().join("data/up")).unwrap();

    let resolved = resolve_in_rootfs(rootfs.path(), Path::new("/data/up/file")).unwrap();
    assert!(resolved.starts_with(rootfs.path()));
}

// =============================================================================
// Planning and Ordering
// =============================================================================

#[test]
fn test_plan_orders_site_user_device() {
    let config = config_fixture(&["readonly"], &[]);
    let rootfs = rootfs_fixture();
    let source = readable_source(&rootfs);

    let plan = MountPlanner::new(&config)
        .plan(&[request(&source, "/data/in", &[])], &[], rootfs.path())
        .unwrap();

    assert!(matches!(plan[0], Mount::Site { .. }));
    assert!(matches!(plan[1], Mount::User { .. }));
    assert!(
        plan[2..].iter().all(|m| matches!(m, Mount::Device { .. })),
        "device mounts come last"
    );
    assert!(plan.len() > 3, "default devices are planned");
}

#[test]
fn test_plan_rejects_disallowed_device() {
    let config = config_fixture(&["readonly"], &[]);
    let rootfs = rootfs_fixture();

    let result = MountPlanner::new(&config).plan(
        &[],
        &[PathBuf::from("/dev/kvm")],
        rootfs.path(),
    );
    assert!(matches!(result, Err(Error::MountDenied { .. })));
}

#[test]
fn test_plan_accepts_allowlisted_device() {
    let config = config_fixture(&["readonly"], &[]);
    let rootfs = rootfs_fixture();

    let plan = MountPlanner::new(&config)
        .plan(&[], &[PathBuf::from("/dev/null")], rootfs.path())
        .unwrap();
    let devices: Vec<_> = plan
        .iter()
        .filter(|m| matches!(m, Mount::Device { .. }))
        .collect();
    // Defaults plus the requested one.
    assert_eq!(devices.len(), 7);
}

#[test]
fn test_mount_denied_maps_to_security_exit_code() {
    let config = config_fixture(&["readonly"], &[]);
    let rootfs = rootfs_fixture();
    let source = readable_source(&rootfs);

    let error = MountPlanner::new(&config)
        .validate_user_mount(&request(&source, "/etc/shadow", &[]), rootfs.path())
        .unwrap_err();
    assert_eq!(error.exit_code(), 3);
}
