//! ddp-launch - spawn and run data-parallel workers on one node
//!
//! ## Commands
//!
//! - `run` - Spawn one worker process per rank and wait for all of them
//! - `worker` - Run a single rank (spawned by `run`, configured through the
//!   `RANK`, `WORLD_SIZE`, `LOCAL_RANK` and `MASTER_*` variables)
//! - `generate-config` - Write the default configuration file

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ddp::env::{EnvStore, LOCAL_RANK, MASTER_ADDR, MASTER_PORT, RANK, WORLD_SIZE};
use ddp::observability::{init_logging, init_simple_logging};
use ddp::{
    copy_source, init_processes, LauncherConfig, ProcessEnv, ReduceOp, Rendezvous, Tensor,
    WorkerContext,
};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use tracing::{error, info};

const DEFAULT_CONFIG_PATH: &str = "~/.ddp/launch.toml";

/// Data-parallel process launcher
#[derive(Parser, Debug)]
#[command(name = "ddp-launch")]
#[command(about = "Launch data-parallel workers sharing a process group", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Spawn one worker per rank on this node
    Run {
        /// Worker processes to start (overrides config file)
        #[arg(short = 'n', long = "nproc-per-node")]
        nproc_per_node: Option<usize>,

        /// Rendezvous address (overrides config file)
        #[arg(long)]
        master_address: Option<String>,

        /// Rendezvous port (overrides config file)
        #[arg(long)]
        master_port: Option<u16>,

        /// Configuration file path
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: String,

        /// Override log level (trace, debug, info, warn, error)
        #[arg(short, long)]
        log_level: Option<String>,

        /// Parameter tensors each worker synchronizes
        #[arg(short, long, default_value = "4")]
        params: usize,

        /// Directory receiving a copy of the configuration used for the run
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Run a single rank
    Worker {
        /// Configuration file path
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: String,

        /// Worker processes on this node (overrides config file)
        #[arg(short = 'n', long = "nproc-per-node")]
        nproc_per_node: Option<usize>,

        /// Override log level (trace, debug, info, warn, error)
        #[arg(short, long)]
        log_level: Option<String>,

        /// Parameter tensors to synchronize
        #[arg(short, long, default_value = "4")]
        params: usize,
    },

    /// Generate default config and exit
    GenerateConfig {
        /// Configuration file path
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            nproc_per_node,
            master_address,
            master_port,
            config,
            log_level,
            params,
            output_dir,
        } => {
            let config_path = expand_path(&config);
            let mut launcher_config = load_or_create(&config_path)?;

            if let Some(n) = nproc_per_node {
                launcher_config.launch.num_process_per_node = n;
            }
            if let Some(address) = master_address {
                launcher_config.launch.master_address = address;
            }
            if let Some(port) = master_port {
                launcher_config.launch.master_port = port;
            }
            if let Some(level) = log_level {
                launcher_config.logging.level = level;
            }
            launcher_config
                .validate()
                .context("Invalid launch configuration")?;

            init_logging(&launcher_config.logging, None)?;
            cmd_run(&launcher_config, &config_path, params, output_dir.as_deref())?;
        }

        Commands::Worker {
            config,
            nproc_per_node,
            log_level,
            params,
        } => {
            let config_path = expand_path(&config);
            let mut launcher_config = if config_path.exists() {
                LauncherConfig::load(&config_path)?
            } else {
                LauncherConfig::default()
            };

            if let Some(n) = nproc_per_node {
                launcher_config.launch.num_process_per_node = n;
            }
            if let Some(level) = log_level {
                launcher_config.logging.level = level;
            }

            cmd_worker(launcher_config, params)?;
        }

        Commands::GenerateConfig { config } => {
            init_simple_logging("warn")?;
            let config_path = expand_path(&config);
            LauncherConfig::default().save(&config_path)?;

            println!("Generated default configuration at: {}", config_path.display());
            println!("\nEdit the configuration file and then start workers with:");
            println!("  ddp-launch run --config {} --nproc-per-node 2", config);
        }
    }

    Ok(())
}

fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

fn load_or_create(path: &Path) -> Result<LauncherConfig> {
    if path.exists() {
        return LauncherConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()));
    }

    // Auto-generate default config on first run
    let config = LauncherConfig::default();
    config
        .save(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    println!("First run detected - created default configuration at: {}", path.display());

    Ok(config)
}

fn cmd_run(
    config: &LauncherConfig,
    config_path: &Path,
    params: usize,
    output_dir: Option<&Path>,
) -> Result<()> {
    let world_size = config.launch.num_process_per_node;

    // Children inherit the defaulted rendezvous variables
    let rendezvous = Rendezvous::from_env(&ProcessEnv, &config.launch)?;

    if let Some(dir) = output_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        if already_in_dir(config_path, dir) {
            info!(dir = %dir.display(), "Configuration already lives in the output directory");
        } else {
            copy_source(config_path, dir)?;
        }
    }

    info!(
        world_size,
        endpoint = %rendezvous.endpoint(),
        params,
        "Launching workers"
    );

    let exe = std::env::current_exe().context("Cannot locate the ddp-launch executable")?;
    let mut children: Vec<(usize, Child)> = Vec::with_capacity(world_size);

    for rank in 0..world_size {
        let mut command = Command::new(&exe);
        command
            .arg("worker")
            .arg("--config")
            .arg(config_path)
            .arg("--nproc-per-node")
            .arg(world_size.to_string())
            .arg("--log-level")
            .arg(&config.logging.level)
            .arg("--params")
            .arg(params.to_string())
            .env(RANK, rank.to_string())
            .env(WORLD_SIZE, world_size.to_string())
            .env(LOCAL_RANK, rank.to_string())
            .env(MASTER_ADDR, &rendezvous.master_addr)
            .env(MASTER_PORT, rendezvous.master_port.to_string());

        match command.spawn() {
            Ok(child) => children.push((rank, child)),
            Err(e) => {
                // Don't leave the ranks already started waiting on rendezvous
                for (_, child) in children.iter_mut() {
                    let _ = child.kill();
                    let _ = child.wait();
                }
                return Err(e).with_context(|| format!("Failed to spawn rank {rank}"));
            }
        }
    }

    let mut failed = Vec::new();
    for (rank, mut child) in children {
        let status = child
            .wait()
            .with_context(|| format!("Failed to wait for rank {rank}"))?;

        if status.success() {
            info!(rank, "Worker finished");
        } else {
            error!(rank, %status, "Worker failed");
            failed.push(rank);
        }
    }

    if !failed.is_empty() {
        bail!("{} of {} workers failed (ranks {:?})", failed.len(), world_size, failed);
    }

    println!("All {world_size} workers finished with identical parameters");
    Ok(())
}

fn cmd_worker(mut config: LauncherConfig, params: usize) -> Result<()> {
    let env = ProcessEnv;
    let rank = env_usize(&env, RANK)?.unwrap_or(0);
    let world_size = env_usize(&env, WORLD_SIZE)?;
    if let Some(local_rank) = env_usize(&env, LOCAL_RANK)? {
        config.launch.local_rank = Some(local_rank);
    }

    init_logging(&config.logging, Some(rank))?;

    let checksum = init_processes(
        rank,
        world_size,
        |ctx| sync_parameters(ctx, params),
        &config.launch,
    )?;

    println!("rank {rank}: parameters in sync (checksum {checksum:.3})");
    Ok(())
}

/// Build rank-dependent parameters, take rank 0's copy, and check that every
/// rank ended up with the same values.
fn sync_parameters(ctx: WorkerContext<'_>, params: usize) -> Result<f64> {
    let mut tensors: Vec<Tensor> = (0..params)
        .map(|i| Tensor::filled(vec![4, 4], (ctx.rank * 100 + i) as f32))
        .collect();

    ctx.broadcast_params(&mut tensors)?;

    let local: f64 = tensors.iter().map(Tensor::checksum).sum();
    let mut mean = [local as f32];
    if let Some(group) = ctx.group() {
        group.all_reduce(&mut mean, ReduceOp::Mean)?;
    }

    let tolerance = 1e-3 * local.abs().max(1.0);
    if (f64::from(mean[0]) - local).abs() > tolerance {
        bail!(
            "rank {} holds checksum {local}, group mean is {}",
            ctx.rank,
            mean[0]
        );
    }

    info!(
        rank = ctx.rank,
        world_size = ctx.world_size,
        device = ?ctx.device,
        checksum = local,
        "Parameters synchronized"
    );
    Ok(local)
}

fn already_in_dir(file: &Path, dir: &Path) -> bool {
    let parent = std::fs::canonicalize(file)
        .ok()
        .and_then(|f| f.parent().map(Path::to_path_buf));
    match (parent, std::fs::canonicalize(dir)) {
        (Some(parent), Ok(dir)) => parent == dir,
        _ => false,
    }
}

fn env_usize(env: &dyn EnvStore, key: &str) -> Result<Option<usize>> {
    env.get(key)
        .map(|value| {
            value
                .trim()
                .parse::<usize>()
                .with_context(|| format!("{key}={value:?} is not a non-negative integer"))
        })
        .transpose()
}
