//! Tests for the SSH hook's rendered artifacts.
//!
//! Daemon startup and the ~/.ssh overlay need root and a container; the
//! rendered files carry the contract and are pure.

use sarus::hooks::ssh::{
    extract_public_key, passwd_home, render_environment_file, render_profile_shim,
    render_ssh_wrapper,
};
use std::path::PathBuf;

// =============================================================================
// /usr/bin/ssh Wrapper
// =============================================================================

#[test]
fn test_wrapper_invokes_dbclient_on_the_server_port() {
    assert_eq!(
        render_ssh_wrapper(15263),
        "#!/bin/sh\n/opt/oci-hooks/dropbear/bin/dbclient -y -p 15263 $*\n"
    );
}

#[test]
fn test_wrapper_is_exactly_two_lines() {
    assert_eq!(
        render_ssh_wrapper(22),
        "#!/bin/sh\n/opt/oci-hooks/dropbear/bin/dbclient -y -p 22 $*\n"
    );
    assert_eq!(render_ssh_wrapper(22).lines().count(), 2);
}

// =============================================================================
// Environment File
// =============================================================================

#[test]
fn test_environment_file_has_shebang_and_one_export_per_entry() {
    let env = vec![
        "PATH=/usr/local/bin:/usr/bin".to_string(),
        "TEST1=VariableTest1".to_string(),
        "TEST2=VariableTest2".to_string(),
    ];
    let rendered = render_environment_file(&env);

    let mut lines = rendered.lines();
    assert_eq!(lines.next(), Some("#!/bin/sh"));
    assert_eq!(
        lines.next(),
        Some("export PATH=\"/usr/local/bin:/usr/bin\"")
    );
    assert_eq!(lines.next(), Some("export TEST1=\"VariableTest1\""));
    assert_eq!(lines.next(), Some("export TEST2=\"VariableTest2\""));
    assert_eq!(lines.next(), None);
}

#[test]
fn test_environment_file_keeps_equals_in_values() {
    let rendered = render_environment_file(&["OPTS=a=b,c=d".to_string()]);
    assert!(rendered.contains("export OPTS=\"a=b,c=d\"\n"));
}

#[test]
fn test_environment_file_of_empty_env_is_just_the_shebang() {
    assert_eq!(render_environment_file(&[]), "#!/bin/sh\n");
}

// =============================================================================
// Profile Shim
// =============================================================================

#[test]
fn test_profile_shim_sources_only_for_ssh_sessions() {
    let shim = render_profile_shim();
    assert!(shim.starts_with("#!/bin/sh\n"));
    assert!(shim.contains("if [ \"$SSH_CONNECTION\" ]"));
    assert!(shim.contains(". /opt/oci-hooks/dropbear/environment"));
}

// =============================================================================
// Key Material Helpers
// =============================================================================

#[test]
fn test_extract_public_key_finds_the_key_line() {
    let output = "Public key portion is:\n\
                  ecdsa-sha2-nistp256 AAAAE2VjZHNhLXNoYTItbmlzdHAyNTY user@host\n\
                  Fingerprint: SHA256:abcdef\n";
    assert_eq!(
        extract_public_key(output).unwrap(),
        "ecdsa-sha2-nistp256 AAAAE2VjZHNhLXNoYTItbmlzdHAyNTY user@host"
    );
}

#[test]
fn test_extract_public_key_handles_missing_key() {
    assert!(extract_public_key("error: no key generated\n").is_none());
}

// =============================================================================
// Passwd-derived Homes
// =============================================================================

#[test]
fn test_home_of_user_with_nonstandard_home() {
    let passwd = "root:x:0:0:root:/root:/bin/bash\n\
                  daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin\n\
                  test:x:1000:1000::/users/test-home-dir:/bin/sh\n";
    assert_eq!(
        passwd_home(passwd, 1000),
        Some(PathBuf::from("/users/test-home-dir"))
    );
}

#[test]
fn test_home_lookup_ignores_malformed_lines() {
    let passwd = "garbage line without separators\ntest:x:1000:1000::/home/test:/bin/sh\n";
    assert_eq!(passwd_home(passwd, 1000), Some(PathBuf::from("/home/test")));
    assert_eq!(passwd_home(passwd, 7), None);
}
