//! sarus-hooks - single entry point for the in-tree OCI hooks.
//!
//! The hook is selected by subcommand, or by `argv[0]` basename when the
//! binary is installed under a hook-specific name:
//!
//! ```sh
//! sarus-hooks glibc         # or argv[0] = glibc-hook
//! sarus-hooks slurm-sync    # or argv[0] = slurm-sync-hook
//! sarus-hooks ssh           # or argv[0] = ssh-hook
//! sarus-hooks ssh keygen [--overwrite]
//! ```
//!
//! Per the OCI hook contract the State document arrives on standard input;
//! fatal errors leave as JSON lines on standard error and a non-zero exit
//! code.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use sarus::config::Config;
use sarus::constants::{
    EXIT_HOOK, EXIT_OK, EXIT_USAGE, PREFIX_DIR_VAR, SSH_ACTIVATION_ANNOTATION, SSH_ACTIVATION_VAR,
};
use sarus::error::{Error, Result};
use sarus::hooks::glibc::GlibcHook;
use sarus::hooks::slurm::SlurmSyncHook;
use sarus::hooks::ssh::{self, SshHook};
use sarus::hooks::{HookContext, emit_fatal};

#[derive(Debug, PartialEq, Eq)]
enum HookKind {
    Glibc,
    SlurmSync,
    Ssh,
    SshKeygen { overwrite: bool },
}

/// Selects the hook from `argv[0]` or the first argument.
fn select_hook(args: &[String]) -> Option<HookKind> {
    let argv0 = Path::new(args.first().map(String::as_str).unwrap_or(""))
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let (name, rest) = match argv0.as_str() {
        "glibc-hook" => ("glibc", &args[1..]),
        "slurm-sync-hook" => ("slurm-sync", &args[1..]),
        "ssh-hook" => ("ssh", &args[1..]),
        _ => match args.get(1) {
            Some(sub) => (sub.as_str(), &args[2..]),
            None => return None,
        },
    };

    match name {
        "glibc" => Some(HookKind::Glibc),
        "slurm-sync" => Some(HookKind::SlurmSync),
        "ssh" => match rest.first().map(String::as_str) {
            Some("keygen") => Some(HookKind::SshKeygen {
                overwrite: rest.iter().any(|a| a == "--overwrite"),
            }),
            _ => Some(HookKind::Ssh),
        },
        _ => None,
    }
}

/// The local repository, recovered by re-reading the admin configuration.
fn local_repository_dir() -> Result<PathBuf> {
    let prefix = std::env::var(PREFIX_DIR_VAR).map(PathBuf::from).map_err(|_| {
        Error::ConfigInvalid(format!("{} is not set in the hook environment", PREFIX_DIR_VAR))
    })?;
    Ok(Config::load(&prefix)?.local_repository_base_dir)
}

fn run_hook(kind: HookKind) -> Result<()> {
    match kind {
        HookKind::SshKeygen { overwrite } => {
            // Key generation is the one entry point that runs without a
            // container: no state document, user privileges.
            let base = ssh::hook_base_dir().or_else(|_| local_repository_dir())?;
            ssh::generate_ssh_keys(&base, &ssh::dropbear_dir()?, overwrite)
        }
        HookKind::Glibc => {
            let context = HookContext::from_stdin()?;
            GlibcHook::from_context(&context)?.inject_glibc_libraries_if_necessary()
        }
        HookKind::SlurmSync => {
            let context = HookContext::from_stdin()?;
            match SlurmSyncHook::from_context(&context, &local_repository_dir()?)? {
                Some(hook) => hook.perform_synchronization(),
                None => Ok(()),
            }
        }
        HookKind::Ssh => {
            let context = HookContext::from_stdin()?;
            let activated = context.lookup_env(SSH_ACTIVATION_VAR) == Some("1")
                || context.annotation(SSH_ACTIVATION_ANNOTATION).is_some();
            if !activated {
                return Ok(());
            }
            SshHook::from_context(&context)?.start_ssh_daemon()
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let kind = match select_hook(&args) {
        Some(kind) => kind,
        None => {
            emit_fatal("usage: sarus-hooks <glibc|slurm-sync|ssh> (or ssh keygen)");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    match run_hook(kind) {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(e) => {
            emit_fatal(e.to_string());
            ExitCode::from(match e {
                Error::SecurityViolation { .. } => e.exit_code(),
                _ => EXIT_HOOK,
            })
        }
    }
}
