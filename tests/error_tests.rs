//! Tests for error classification and the exit-code contract.

use std::path::PathBuf;
use std::time::Duration;

use sarus::error::Error;

#[test]
fn test_exit_code_contract() {
    let cases: Vec<(Error, u8)> = vec![
        (
            Error::InvalidInvocation("bad flag".to_string()),
            1,
        ),
        (Error::ConfigInvalid("missing field".to_string()), 2),
        (
            Error::SecurityViolation {
                path: PathBuf::from("/opt/runc"),
                reason: "group-writable".to_string(),
                uid: 0,
                mode: 0o775,
            },
            3,
        ),
        (
            Error::MountDenied {
                source_path: PathBuf::from("/etc/shadow"),
                destination: PathBuf::from("/etc/shadow"),
                reason: "denied prefix".to_string(),
            },
            3,
        ),
        (Error::ImageNotFound("alpine:3.18".to_string()), 4),
        (
            Error::HookExecutionFailed {
                hook: "ssh".to_string(),
                reason: "daemon died".to_string(),
            },
            5,
        ),
        (Error::HookActivationMissing("no keys".to_string()), 5),
        (Error::RuntimeFailed("runc not found".to_string()), 6),
    ];
    for (error, expected) in cases {
        assert_eq!(error.exit_code(), expected, "wrong code for {:?}", error);
    }
}

#[test]
fn test_fatal_kinds_are_never_transient() {
    assert!(
        !Error::SecurityViolation {
            path: PathBuf::from("/x"),
            reason: "r".to_string(),
            uid: 1,
            mode: 0o777,
        }
        .is_transient()
    );
    assert!(!Error::ConfigInvalid("x".to_string()).is_transient());
}

#[test]
fn test_pull_failures_and_timeouts_are_transient() {
    assert!(
        Error::ImagePullFailed {
            reference: "alpine".to_string(),
            reason: "connection reset".to_string(),
        }
        .is_transient()
    );
    assert!(
        Error::Timeout {
            operation: "pull".to_string(),
            duration: Duration::from_secs(300),
        }
        .is_transient()
    );
}

#[test]
fn test_security_violation_reports_uid_and_mode() {
    let message = Error::SecurityViolation {
        path: PathBuf::from("/opt/sarus/bin/runc"),
        reason: "must be owned by root to prevent tampering".to_string(),
        uid: 1000,
        mode: 0o775,
    }
    .to_string();
    assert!(message.contains("/opt/sarus/bin/runc"));
    assert!(message.contains("uid=1000"));
    assert!(message.contains("775"));
}

#[test]
fn test_io_errors_convert_with_context() {
    let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
    let error = Error::io_path("/var/sarus/.lock", io);
    let message = error.to_string();
    assert!(message.contains("/var/sarus/.lock"));
    assert!(message.contains("denied"));
}
