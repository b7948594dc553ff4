//! Tests for the shared hook runtime: state ingestion, config.json
//! recovery, environment lookup and activation envelopes.

use std::fs;

use sarus::bundle::OciSpec;
use sarus::hooks::slurm::SlurmSyncHook;
use sarus::hooks::{ContainerState, HookContext, lookup_env};
use tempfile::TempDir;

fn spec_json(env: &[&str], annotations: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "ociVersion": "1.0.2",
        "root": {"path": "rootfs", "readonly": false},
        "process": {
            "terminal": false,
            "user": {"uid": 1000, "gid": 1000},
            "args": ["/bin/sh"],
            "env": env,
            "cwd": "/"
        },
        "hostname": "container",
        "mounts": [],
        "annotations": annotations
    })
}

fn state_json(bundle: &std::path::Path) -> String {
    serde_json::json!({
        "ociVersion": "1.0.2",
        "id": "sarus-test",
        "status": "created",
        "pid": 4242,
        "bundle": bundle,
        "annotations": {"from.state": "state-value"}
    })
    .to_string()
}

fn write_bundle(temp: &TempDir, env: &[&str], annotations: serde_json::Value) {
    fs::write(
        temp.path().join("config.json"),
        serde_json::to_string_pretty(&spec_json(env, annotations)).unwrap(),
    )
    .unwrap();
}

// =============================================================================
// State Ingestion
// =============================================================================

#[test]
fn test_context_reads_state_and_bundle_config() {
    let temp = TempDir::new().unwrap();
    write_bundle(
        &temp,
        &["PATH=/usr/bin", "MARKER=yes"],
        serde_json::json!({"from.spec": "spec-value"}),
    );

    let context = HookContext::from_reader(state_json(temp.path()).as_bytes()).unwrap();

    assert_eq!(context.state.id, "sarus-test");
    assert_eq!(context.container_pid().unwrap(), 4242);
    assert_eq!(context.lookup_env("MARKER"), Some("yes"));
    assert_eq!(context.lookup_env("ABSENT"), None);
    assert_eq!(context.rootfs(), temp.path().join("rootfs"));
}

#[test]
fn test_state_annotations_shadow_spec_annotations() {
    let temp = TempDir::new().unwrap();
    write_bundle(
        &temp,
        &[],
        serde_json::json!({"from.state": "spec-side", "from.spec": "spec-value"}),
    );

    let context = HookContext::from_reader(state_json(temp.path()).as_bytes()).unwrap();
    assert_eq!(context.annotation("from.state"), Some("state-value"));
    assert_eq!(context.annotation("from.spec"), Some("spec-value"));
    assert_eq!(context.annotation("missing"), None);
}

#[test]
fn test_state_without_pid_is_rejected_for_namespace_hooks() {
    let temp = TempDir::new().unwrap();
    write_bundle(&temp, &[], serde_json::json!({}));
    let raw = serde_json::json!({
        "ociVersion": "1.0.2",
        "id": "x",
        "status": "created",
        "bundle": temp.path()
    })
    .to_string();

    let context = HookContext::from_reader(raw.as_bytes()).unwrap();
    assert!(context.container_pid().is_err());
}

#[test]
fn test_malformed_state_is_an_error() {
    assert!(ContainerState::from_reader(b"not json".as_slice()).is_err());
}

#[test]
fn test_lookup_env_does_not_prefix_match() {
    let env = vec!["SLURM_JOB_ID=256".to_string(), "SLURM_JOB_IDX=999".to_string()];
    assert_eq!(lookup_env(&env, "SLURM_JOB_ID"), Some("256"));
}

// =============================================================================
// Activation Envelopes
// =============================================================================

fn slurm_context(temp: &TempDir, env: &[&str]) -> HookContext {
    write_bundle(temp, env, serde_json::json!({}));
    HookContext::from_reader(state_json(temp.path()).as_bytes()).unwrap()
}

#[test]
fn test_slurm_hook_inactive_without_activation_variable() {
    let temp = TempDir::new().unwrap();
    let context = slurm_context(
        &temp,
        &[
            "SLURM_JOB_ID=256",
            "SLURM_STEPID=32",
            "SLURM_PROCID=0",
            "SLURM_NTASKS=2",
        ],
    );
    let hook = SlurmSyncHook::from_context(&context, temp.path()).unwrap();
    assert!(hook.is_none());
}

#[test]
fn test_slurm_hook_inactive_without_all_slurm_variables() {
    let temp = TempDir::new().unwrap();
    let context = slurm_context(
        &temp,
        &["SARUS_SLURM_GLOBAL_SYNC_HOOK=1", "SLURM_JOB_ID=256"],
    );
    let hook = SlurmSyncHook::from_context(&context, temp.path()).unwrap();
    assert!(hook.is_none());
}

#[test]
fn test_slurm_hook_active_with_full_envelope() {
    let temp = TempDir::new().unwrap();
    let context = slurm_context(
        &temp,
        &[
            "SARUS_SLURM_GLOBAL_SYNC_HOOK=1",
            "SLURM_JOB_ID=256",
            "SLURM_STEPID=32",
            "SLURM_PROCID=0",
            "SLURM_NTASKS=2",
        ],
    );
    let hook = SlurmSyncHook::from_context(&context, temp.path())
        .unwrap()
        .expect("hook should activate");
    assert!(
        hook.sync_dir()
            .ends_with("slurm_global_sync/slurm-jobid-256-stepid-32")
    );
}

#[test]
fn test_slurm_hook_rejects_malformed_numbers() {
    let temp = TempDir::new().unwrap();
    let context = slurm_context(
        &temp,
        &[
            "SARUS_SLURM_GLOBAL_SYNC_HOOK=1",
            "SLURM_JOB_ID=not-a-number",
            "SLURM_STEPID=32",
            "SLURM_PROCID=0",
            "SLURM_NTASKS=2",
        ],
    );
    assert!(SlurmSyncHook::from_context(&context, temp.path()).is_err());
}

// =============================================================================
// Spec Round-trip
// =============================================================================

#[test]
fn test_bundle_spec_deserializes_from_runtime_form() {
    // A config.json as another OCI tool would write it.
    let raw = spec_json(&["A=1"], serde_json::json!({}));
    let spec: OciSpec = serde_json::from_value(raw).unwrap();
    assert_eq!(spec.process.user.uid, 1000);
    assert!(spec.hooks.is_none());
    assert!(spec.linux.is_none());
}
