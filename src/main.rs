// Copyright 2025-2026 Arcade Loop Contributors
// Licensed under the Apache License, Version 2.0

//! Loop controller entry point.
//!
//! ## Subcommands
//!
//! - `arcade-loop run`  - serve the control plane and drive the training loop
//! - `arcade-loop fork` - create a new run as a cheap lineage fork

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::prelude::*;

use arcade_loop::config::FileConfig;
use arcade_loop::organizer::DirectoryOrganizer;
use arcade_loop::training::SubprocessTrainer;
use arcade_loop::{ControllerParams, LoopController, TrainingParams};

#[derive(Parser)]
#[command(name = "arcade-loop", version, about = "AlphaZero-style training loop controller")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Decrease log verbosity (-q, -qq)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    quiet: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the control plane and drive the training loop.
    Run(RunArgs),
    /// Fork an existing run's artifacts into a new run directory.
    Fork(ForkArgs),
}

#[derive(Args)]
struct RunArgs {
    /// TCP port to listen on
    #[arg(long, default_value_t = 1234)]
    port: u16,

    /// Run root directory
    #[arg(short, long)]
    output_dir: PathBuf,

    /// Game played by the connected workers
    #[arg(short, long)]
    game: String,

    /// Optional run tag
    #[arg(long)]
    tag: Option<String>,

    /// Per-generation row budget; unlimited when omitted
    #[arg(long)]
    max_positions_per_generation: Option<u64>,

    /// Default training device
    #[arg(long, default_value = "cuda:0")]
    cuda_device: String,

    /// External trainer command invoked for each train step
    #[arg(long)]
    trainer_cmd: PathBuf,

    /// Worker binary to stage into bins/
    #[arg(long)]
    binary: Option<PathBuf>,

    /// Optional TOML overlay for scheduling knobs
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct ForkArgs {
    /// New (empty) run root
    #[arg(short, long)]
    output_dir: PathBuf,

    /// Existing run to fork from
    #[arg(long)]
    from: PathBuf,

    /// Fork up to and including this generation; parent's latest when omitted
    #[arg(long)]
    gen: Option<u32>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => {
            init_logging(cli.verbose, cli.quiet, Some(&args.output_dir));
            match run(args).await {
                Ok(code) => code,
                Err(e) => {
                    tracing::error!(error = %e, "controller failed");
                    ExitCode::FAILURE
                }
            }
        }
        Command::Fork(args) => {
            init_logging(cli.verbose, cli.quiet, None);
            match fork(args) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!(error = %e, "fork failed");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

async fn run(args: RunArgs) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut params = ControllerParams {
        port: args.port,
        output_dir: args.output_dir,
        game: args.game,
        tag: args.tag,
        max_positions_per_generation: args.max_positions_per_generation,
        cuda_device: args.cuda_device,
        ..ControllerParams::default()
    };
    let mut training_params = TrainingParams::default();
    if let Some(path) = &args.config {
        FileConfig::load(path)?.apply(&mut params, &mut training_params);
    }

    let trainer = Arc::new(SubprocessTrainer::new(args.trainer_cmd));
    let controller = LoopController::new(params, training_params, trainer)?;

    if let Some(binary) = &args.binary {
        let staged = controller.organizer().stage_binary(binary)?;
        tracing::info!(binary = %staged.display(), "staged worker binary");
    }

    let code = controller.run().await;
    Ok(ExitCode::from(code.clamp(0, 255) as u8))
}

fn fork(args: ForkArgs) -> Result<(), Box<dyn std::error::Error>> {
    let parent = DirectoryOrganizer::new(&args.from);
    let child = DirectoryOrganizer::new(&args.output_dir);
    let gen = args.gen.unwrap_or_else(|| parent.latest_generation());
    let summary = child.fork_from(&parent, gen)?;
    tracing::info!(?summary, "fork complete");
    Ok(())
}

/// Console logging plus a plain-text file layer under the run's `logs/`.
fn init_logging(verbose: u8, quiet: u8, output_dir: Option<&PathBuf>) {
    let level = match i16::from(verbose) - i16::from(quiet) {
        i16::MIN..=-2 => "error",
        -1 => "warn",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let file_layer = output_dir.and_then(|dir| {
        let logs_dir = dir.join("logs");
        std::fs::create_dir_all(&logs_dir).ok()?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(logs_dir.join("loop-controller.log"))
            .ok()?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(file)),
        )
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
}
