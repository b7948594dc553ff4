//! Tests for the job-step rendezvous barrier.
//!
//! Ranks are simulated in-process: each hook instance is built from its own
//! container environment, and peers are either real threads or marker files
//! planted by the test, mirroring how independent job-step processes appear
//! to each other through the shared filesystem.

use std::fs::{self, File};
use std::path::Path;

use sarus::hooks::HookContext;
use sarus::hooks::slurm::SlurmSyncHook;
use tempfile::TempDir;

fn context_for_rank(temp: &TempDir, procid: u32, ntasks: u32) -> HookContext {
    let bundle = temp.path().join(format!("bundle-{}", procid));
    fs::create_dir_all(&bundle).unwrap();
    let env = [
        "SARUS_SLURM_GLOBAL_SYNC_HOOK=1".to_string(),
        "SLURM_JOB_ID=256".to_string(),
        "SLURM_STEPID=32".to_string(),
        format!("SLURM_PROCID={}", procid),
        format!("SLURM_NTASKS={}", ntasks),
        "SARUS_SLURM_SYNC_TIMEOUT_SECONDS=10".to_string(),
    ];
    let spec = serde_json::json!({
        "ociVersion": "1.0.2",
        "root": {"path": "rootfs", "readonly": false},
        "process": {
            "terminal": false,
            "user": {"uid": nix::unistd::Uid::current().as_raw(),
                     "gid": nix::unistd::Gid::current().as_raw()},
            "args": ["/bin/sh"],
            "env": env,
            "cwd": "/"
        },
        "hostname": "container",
        "mounts": []
    });
    fs::write(
        bundle.join("config.json"),
        serde_json::to_string(&spec).unwrap(),
    )
    .unwrap();
    let state = serde_json::json!({
        "ociVersion": "1.0.2",
        "id": format!("rank-{}", procid),
        "status": "created",
        "pid": std::process::id(),
        "bundle": bundle
    })
    .to_string();
    HookContext::from_reader(state.as_bytes()).unwrap()
}

fn hook_for_rank(temp: &TempDir, local_repo: &Path, procid: u32, ntasks: u32) -> SlurmSyncHook {
    SlurmSyncHook::from_context(&context_for_rank(temp, procid, ntasks), local_repo)
        .unwrap()
        .expect("hook should activate")
}

// =============================================================================
// Marker Semantics
// =============================================================================

#[test]
fn test_sync_dir_layout_matches_job_and_step() {
    let temp = TempDir::new().unwrap();
    let repo = temp.path().join("repo");
    let hook = hook_for_rank(&temp, &repo, 0, 2);
    assert_eq!(
        hook.sync_dir(),
        repo.join("slurm_global_sync/slurm-jobid-256-stepid-32")
    );
}

#[test]
fn test_signal_arrival_twice_leaves_one_file() {
    let temp = TempDir::new().unwrap();
    let repo = temp.path().join("repo");
    let hook = hook_for_rank(&temp, &repo, 0, 2);

    hook.signal_arrival().unwrap();
    hook.signal_arrival().unwrap();

    let entries: Vec<_> = fs::read_dir(hook.sync_dir().join("arrival"))
        .unwrap()
        .collect();
    assert_eq!(entries.len(), 1);
}

#[test]
fn test_all_arrived_counts_distinct_procids() {
    let temp = TempDir::new().unwrap();
    let repo = temp.path().join("repo");
    let hook = hook_for_rank(&temp, &repo, 0, 2);

    hook.signal_arrival().unwrap();
    assert!(!hook.all_instances_arrived().unwrap());

    File::create(hook.sync_dir().join("arrival/slurm-procid-1")).unwrap();
    assert!(hook.all_instances_arrived().unwrap());
}

#[test]
fn test_departure_mirrors_arrival() {
    let temp = TempDir::new().unwrap();
    let repo = temp.path().join("repo");
    let hook = hook_for_rank(&temp, &repo, 0, 2);

    hook.signal_departure().unwrap();
    assert!(!hook.all_instances_departed().unwrap());

    File::create(hook.sync_dir().join("departure/slurm-procid-1")).unwrap();
    assert!(hook.all_instances_departed().unwrap());
}

#[test]
fn test_foreign_files_do_not_count() {
    let temp = TempDir::new().unwrap();
    let repo = temp.path().join("repo");
    let hook = hook_for_rank(&temp, &repo, 0, 1);

    fs::create_dir_all(hook.sync_dir().join("arrival")).unwrap();
    File::create(hook.sync_dir().join("arrival/.stray")).unwrap();
    assert!(!hook.all_instances_arrived().unwrap());
}

// =============================================================================
// Full Barrier
// =============================================================================

#[test]
fn test_single_task_completes_immediately_and_cleans_up() {
    let temp = TempDir::new().unwrap();
    let repo = temp.path().join("repo");
    let hook = hook_for_rank(&temp, &repo, 0, 1);

    hook.perform_synchronization().unwrap();
    assert!(!hook.sync_dir().exists());
}

#[test]
fn test_two_ranks_rendezvous_and_rank_zero_cleans_up() {
    let temp = TempDir::new().unwrap();
    let repo = temp.path().join("repo");
    let rank0 = hook_for_rank(&temp, &repo, 0, 2);
    let rank1 = hook_for_rank(&temp, &repo, 1, 2);
    let sync_dir = rank0.sync_dir().to_path_buf();

    let t0 = std::thread::spawn(move || rank0.perform_synchronization());
    let t1 = std::thread::spawn(move || rank1.perform_synchronization());
    t0.join().unwrap().unwrap();
    t1.join().unwrap().unwrap();

    assert!(!sync_dir.exists(), "rank 0 removes the sync tree");
}

#[test]
fn test_nonzero_rank_does_not_clean_up() {
    let temp = TempDir::new().unwrap();
    let repo = temp.path().join("repo");
    let rank1 = hook_for_rank(&temp, &repo, 1, 2);

    // Peer already arrived and departed.
    fs::create_dir_all(rank1.sync_dir().join("arrival")).unwrap();
    fs::create_dir_all(rank1.sync_dir().join("departure")).unwrap();
    File::create(rank1.sync_dir().join("arrival/slurm-procid-0")).unwrap();
    File::create(rank1.sync_dir().join("departure/slurm-procid-0")).unwrap();

    rank1.perform_synchronization().unwrap();
    assert!(rank1.sync_dir().exists(), "cleanup is rank 0's job");
}

#[test]
fn test_missing_peer_times_out_with_diagnostic() {
    let temp = TempDir::new().unwrap();
    let repo = temp.path().join("repo");

    // Rebuild a rank-0 hook with a 1-second deadline.
    let bundle = temp.path().join("bundle-timeout");
    fs::create_dir_all(&bundle).unwrap();
    let spec = serde_json::json!({
        "ociVersion": "1.0.2",
        "root": {"path": "rootfs", "readonly": false},
        "process": {
            "terminal": false,
            "user": {"uid": nix::unistd::Uid::current().as_raw(),
                     "gid": nix::unistd::Gid::current().as_raw()},
            "args": ["/bin/sh"],
            "env": [
                "SARUS_SLURM_GLOBAL_SYNC_HOOK=1",
                "SLURM_JOB_ID=256",
                "SLURM_STEPID=32",
                "SLURM_PROCID=0",
                "SLURM_NTASKS=2",
                "SARUS_SLURM_SYNC_TIMEOUT_SECONDS=1"
            ],
            "cwd": "/"
        },
        "hostname": "container",
        "mounts": []
    });
    fs::write(bundle.join("config.json"), serde_json::to_string(&spec).unwrap()).unwrap();
    let state = serde_json::json!({
        "ociVersion": "1.0.2", "id": "t", "status": "created",
        "pid": std::process::id(), "bundle": bundle
    })
    .to_string();
    let context = HookContext::from_reader(state.as_bytes()).unwrap();
    let hook = SlurmSyncHook::from_context(&context, &repo).unwrap().unwrap();

    let error = hook.perform_synchronization().unwrap_err();
    let message = error.to_string();
    assert!(message.contains("timed out"), "message was: {}", message);
    assert!(message.contains("arrival"), "message was: {}", message);
}
