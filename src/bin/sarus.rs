//! sarus - container launcher CLI.
//!
//! ```sh
//! sarus pull <ref>
//! sarus run [--mount=src=S,dst=D[,readonly]]... [--ssh] <ref> [command...]
//! sarus images
//! sarus load <archive.tar> <ref>
//! sarus rmi <ref>
//! sarus ssh-keygen [--overwrite]
//! ```
//!
//! The full command-line surface and help rendering live elsewhere; this
//! binary only dispatches the core operations and maps errors to the
//! documented exit codes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use sarus::bundle::{self, BundleAssembler, HooksSpec, ProcessSpec};
use sarus::config::Config;
use sarus::constants::{
    EXIT_OK, EXIT_USAGE, PREFIX_DIR_VAR, SLURM_SYNC_ACTIVATION_VAR, SSH_ACTIVATION_VAR,
};
use sarus::error::{Error, Result};
use sarus::hooks::ssh;
use sarus::image::{ImageBuilder, ImageSource};
use sarus::mounts::{self, MountPlanner, UserMountRequest};
use sarus::reference::ImageReference;
use sarus::runtime::RuntimeDriver;
use sarus::storage::ImageStore;

/// Default installation prefix when the environment does not say otherwise.
const DEFAULT_PREFIX_DIR: &str = "/opt/sarus";

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum Command {
    Pull {
        reference: String,
    },
    Run {
        reference: String,
        command: Vec<String>,
        mounts: Vec<UserMountRequest>,
        ssh: bool,
    },
    Images,
    Load {
        archive: PathBuf,
        reference: String,
    },
    Rmi {
        reference: String,
    },
    SshKeygen {
        overwrite: bool,
    },
    Version,
    Help,
}

fn parse_args() -> Result<Command> {
    let args: Vec<String> = std::env::args().collect();
    let usage = |message: &str| Error::InvalidInvocation(message.to_string());

    if args.len() < 2 {
        return Ok(Command::Help);
    }

    match args[1].as_str() {
        "pull" => {
            let reference = args.get(2).ok_or_else(|| usage("pull requires <ref>"))?;
            Ok(Command::Pull {
                reference: reference.clone(),
            })
        }
        "run" => {
            let mut mounts = Vec::new();
            let mut ssh = false;
            let mut rest = Vec::new();
            for arg in &args[2..] {
                if let Some(spec) = arg.strip_prefix("--mount=") {
                    mounts.push(parse_mount_request(spec)?);
                } else if arg == "--ssh" {
                    ssh = true;
                } else {
                    rest.push(arg.clone());
                }
            }
            let (reference, command) = rest
                .split_first()
                .ok_or_else(|| usage("run requires <ref>"))?;
            Ok(Command::Run {
                reference: reference.clone(),
                command: command.to_vec(),
                mounts,
                ssh,
            })
        }
        "images" => Ok(Command::Images),
        "load" => {
            let archive = args.get(2).ok_or_else(|| usage("load requires <archive>"))?;
            let reference = args.get(3).ok_or_else(|| usage("load requires <ref>"))?;
            Ok(Command::Load {
                archive: PathBuf::from(archive),
                reference: reference.clone(),
            })
        }
        "rmi" => {
            let reference = args.get(2).ok_or_else(|| usage("rmi requires <ref>"))?;
            Ok(Command::Rmi {
                reference: reference.clone(),
            })
        }
        "ssh-keygen" => Ok(Command::SshKeygen {
            overwrite: args.iter().any(|a| a == "--overwrite"),
        }),
        "version" | "--version" | "-v" => Ok(Command::Version),
        "help" | "--help" | "-h" => Ok(Command::Help),
        unknown => Err(usage(&format!("unknown command: {}", unknown))),
    }
}

/// Parses `src=S,dst=D[,type=bind][,readonly]` mount requests.
fn parse_mount_request(spec: &str) -> Result<UserMountRequest> {
    let mut source = None;
    let mut destination = None;
    let mut flags = Vec::new();
    for part in spec.split(',') {
        match part.split_once('=') {
            Some(("src", v)) | Some(("source", v)) => source = Some(PathBuf::from(v)),
            Some(("dst", v)) | Some(("destination", v)) | Some(("target", v)) => {
                destination = Some(PathBuf::from(v))
            }
            Some(("type", "bind")) => {}
            Some(("type", other)) => {
                return Err(Error::InvalidInvocation(format!(
                    "unsupported mount type '{}'",
                    other
                )));
            }
            None if part == "readonly" || part == "ro" => flags.push("readonly".to_string()),
            _ => {
                return Err(Error::InvalidInvocation(format!(
                    "malformed mount option '{}'",
                    part
                )));
            }
        }
    }
    Ok(UserMountRequest {
        source: source
            .ok_or_else(|| Error::InvalidInvocation("mount requires src=".to_string()))?,
        destination: destination
            .ok_or_else(|| Error::InvalidInvocation("mount requires dst=".to_string()))?,
        flags,
    })
}

// =============================================================================
// Command Implementations
// =============================================================================

fn load_config() -> Result<Arc<Config>> {
    let prefix = std::env::var(PREFIX_DIR_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_PREFIX_DIR));
    let config = Config::load(&prefix)?;
    config.run_security_checks()?;
    Ok(Arc::new(config))
}

fn cmd_pull(config: Arc<Config>, raw_reference: &str) -> Result<()> {
    let reference = ImageReference::parse(raw_reference)?;
    let store = ImageStore::open(&config.local_repository_base_dir)?;

    let packed = ImageBuilder::new(config).build(&ImageSource::RegistryPull {
        reference: reference.clone(),
        credentials: None,
    })?;
    let stored = store.put(&reference, &packed.squashfs_path, &packed.digest, &packed.metadata)?;
    println!("{}  {}", stored.reference.canonical(), stored.digest);
    Ok(())
}

fn cmd_load(config: Arc<Config>, archive: PathBuf, raw_reference: &str) -> Result<()> {
    let reference = ImageReference::parse(raw_reference)?;
    let store = ImageStore::open(&config.local_repository_base_dir)?;

    let packed = ImageBuilder::new(config).build(&ImageSource::ArchiveImport { tar_path: archive })?;
    let stored = store.put(&reference, &packed.squashfs_path, &packed.digest, &packed.metadata)?;
    println!("{}  {}", stored.reference.canonical(), stored.digest);
    Ok(())
}

fn cmd_images(config: Arc<Config>) -> Result<()> {
    let store = ImageStore::open(config.read_repository_base())?;
    println!("REFERENCE\tDIGEST\tSIZE");
    for image in store.list()? {
        println!(
            "{}\t{}\t{}",
            image.reference.canonical(),
            image.digest,
            image.size
        );
    }
    Ok(())
}

fn cmd_rmi(config: Arc<Config>, raw_reference: &str) -> Result<()> {
    let reference = ImageReference::parse(raw_reference)?;
    let store = ImageStore::open(&config.local_repository_base_dir)?;
    store.remove(&reference)?;
    println!("removed {}", reference.canonical());
    Ok(())
}

fn cmd_ssh_keygen(config: Arc<Config>, overwrite: bool) -> Result<()> {
    let dropbear = ssh::dropbear_dir().unwrap_or_else(|_| config.prefix_dir.join("dropbear"));
    ssh::generate_ssh_keys(&config.local_repository_base_dir, &dropbear, overwrite)
}

fn cmd_run(
    config: Arc<Config>,
    raw_reference: &str,
    command: Vec<String>,
    mount_requests: Vec<UserMountRequest>,
    ssh: bool,
) -> Result<i32> {
    let reference = ImageReference::parse(raw_reference)?;
    let store = ImageStore::open(config.read_repository_base())?;

    // Pull on demand; a run of a known image never touches the network.
    // Pulls always land in the local repository, even when reads prefer
    // the centralized one.
    let image = if store.has(&reference) {
        store.get(&reference)?
    } else {
        cmd_pull(Arc::clone(&config), raw_reference)?;
        ImageStore::open(&config.local_repository_base_dir)?.get(&reference)?
    };
    let identity = config.identity()?.clone();

    // All bundle and plan mounts stay inside a private mount namespace.
    bundle::unshare_mount_namespace()?;

    let hooks = HooksSpec {
        glibc: true,
        slurm_sync: std::env::var(SLURM_SYNC_ACTIVATION_VAR).as_deref() == Ok("1"),
        ssh,
    };
    let mut extra_env = Vec::new();
    if hooks.slurm_sync {
        extra_env.push(format!("{}=1", SLURM_SYNC_ACTIVATION_VAR));
        for var in ["SLURM_JOB_ID", "SLURM_STEPID", "SLURM_PROCID", "SLURM_NTASKS"] {
            if let Ok(value) = std::env::var(var) {
                extra_env.push(format!("{}={}", var, value));
            }
        }
    }
    if ssh {
        extra_env.push(format!("{}=1", SSH_ACTIVATION_VAR));
    }

    let process = ProcessSpec::from_image(
        &image.metadata,
        if command.is_empty() { None } else { Some(command.as_slice()) },
        &extra_env,
        false,
    );

    let assembler = BundleAssembler::new(Arc::clone(&config));
    let mut bundle = assembler.assemble(
        &image,
        &process,
        &hooks,
        HashMap::new(),
        &identity,
        true,
    )?;

    let planner = MountPlanner::new(&config);
    let plan = planner.plan(&mount_requests, &[], bundle.rootfs())?;
    if let Err(e) = mounts::apply_plan(&plan, bundle.rootfs(), false) {
        bundle.teardown();
        return Err(e);
    }

    let container_id = format!("sarus-{}", uuid::Uuid::now_v7());
    RuntimeDriver::new(config).run(&mut bundle, &container_id)
}

// =============================================================================
// Main
// =============================================================================

fn cmd_version() {
    println!("sarus {}", env!("CARGO_PKG_VERSION"));
}

fn cmd_help() {
    println!(
        r#"sarus - unprivileged OCI container launcher for HPC systems

USAGE:
    sarus <command> [options]

COMMANDS:
    pull <ref>                    Pull an image into the local repository
    run [options] <ref> [cmd...]  Run a container from a stored image
    images                        List stored images
    load <archive> <ref>          Import a docker/OCI archive
    rmi <ref>                     Remove a stored image
    ssh-keygen [--overwrite]      Generate the per-user SSH hook keys
    version                       Show version info
    help                          Show this help

RUN OPTIONS:
    --mount=src=S,dst=D[,readonly]  Request a validated bind mount
    --ssh                           Enable the SSH hook
"#
    );
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let command = match parse_args() {
        Ok(command) => command,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let result: Result<i32> = match command {
        Command::Version => {
            cmd_version();
            Ok(EXIT_OK as i32)
        }
        Command::Help => {
            cmd_help();
            Ok(EXIT_OK as i32)
        }
        command => match load_config() {
            Err(e) => Err(e),
            Ok(config) => match command {
                Command::Pull { reference } => cmd_pull(config, &reference).map(|_| 0),
                Command::Run {
                    reference,
                    command,
                    mounts,
                    ssh,
                } => cmd_run(config, &reference, command, mounts, ssh),
                Command::Images => cmd_images(config).map(|_| 0),
                Command::Load { archive, reference } => {
                    cmd_load(config, archive, &reference).map(|_| 0)
                }
                Command::Rmi { reference } => cmd_rmi(config, &reference).map(|_| 0),
                Command::SshKeygen { overwrite } => {
                    cmd_ssh_keygen(config, overwrite).map(|_| 0)
                }
                Command::Version | Command::Help => unreachable!(),
            },
        },
    };

    match result {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
