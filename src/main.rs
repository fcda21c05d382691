//! CLI entry point for the training orchestrator.
//!
//! Drives one SPMD worker per configured rank. Ranks rendezvous through
//! `MASTER_ADDR` / `MASTER_PORT`; sensible localhost defaults are filled in
//! when the variables are unset.

use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context};
use candle_core::DType;
use candle_nn::{VarBuilder, VarMap};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pose_graph_train_rs::{
    FrameDataset, GammaLossSuite, ProcessGroup, SyntheticTrajectoryDataset, TinyRefineNet,
    TrainCheckpoint, TrainConfig, Trainer,
};

#[derive(Parser)]
#[command(name = "train")]
#[command(about = "Distributed iterative-refinement training orchestrator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Start training
    Train {
        /// Path to configuration file
        config: String,
        /// Resume from checkpoint
        #[arg(long)]
        resume: Option<String>,
        /// Override the configured step count
        #[arg(long)]
        steps: Option<usize>,
        /// Override the configured world size
        #[arg(long)]
        world_size: Option<usize>,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "train.json")]
        output: String,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            let config = TrainConfig::from_file(&config)?;
            config.validate()?;
            println!("configuration is valid");
            println!("  experiment:  {}", config.experiment);
            println!("  world size:  {}", config.world_size);
            println!("  steps:       {}", config.steps);
            println!(
                "  expected refinement rounds per step: {:.2}",
                config.expected_rounds()
            );
        }
        Commands::Train {
            config,
            resume,
            steps,
            world_size,
        } => {
            let mut config = TrainConfig::from_file(&config)?;
            if let Some(steps) = steps {
                config.steps = steps;
            }
            if let Some(world_size) = world_size {
                config.world_size = world_size;
            }
            config.validate()?;
            run(config, resume)?;
        }
        Commands::Init { output } => {
            TrainConfig::default().to_file(&output)?;
            println!("configuration written to {output}");
        }
    }

    Ok(())
}

/// Spawn one worker per rank and wait for all of them.
fn run(config: TrainConfig, resume: Option<String>) -> anyhow::Result<()> {
    if std::env::var("MASTER_ADDR").is_err() {
        std::env::set_var("MASTER_ADDR", "127.0.0.1");
    }
    if std::env::var("MASTER_PORT").is_err() {
        std::env::set_var("MASTER_PORT", "12396");
    }

    let checkpoint = resume
        .map(|path| {
            TrainCheckpoint::load(std::path::Path::new(&path))
                .with_context(|| format!("loading checkpoint {path}"))
        })
        .transpose()?;

    let world_size = config.world_size;
    let workers: Vec<_> = (0..world_size)
        .map(|rank| {
            let config = config.clone();
            let checkpoint = checkpoint.clone();
            thread::Builder::new()
                .name(format!("rank-{rank}"))
                .spawn(move || worker(rank, config, checkpoint))
        })
        .collect::<Result<_, _>>()?;

    for worker in workers {
        worker
            .join()
            .map_err(|_| anyhow!("worker thread panicked"))??;
    }
    Ok(())
}

/// Body of one rank.
fn worker(
    rank: usize,
    config: TrainConfig,
    checkpoint: Option<TrainCheckpoint>,
) -> anyhow::Result<()> {
    let group = ProcessGroup::init(rank, config.world_size)?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, group.device());
    let network = TinyRefineNet::new(vb)?;

    // Reference data feed; a real dataset plugs in through FrameDataset.
    let train_dataset = Arc::new(SyntheticTrajectoryDataset::new(
        1024,
        config.frames,
        96,
        128,
        config.seed,
    ));
    let val_dataset = Arc::new(SyntheticTrajectoryDataset::new(
        64,
        config.frames,
        96,
        128,
        config.seed.wrapping_add(1),
    ));

    let mut trainer = Trainer::new(
        config,
        group,
        Box::new(network),
        varmap,
        Box::new(GammaLossSuite::default()),
        train_dataset as Arc<dyn FrameDataset>,
        val_dataset,
    )?;
    if let Some(checkpoint) = &checkpoint {
        trainer.resume(checkpoint)?;
    }

    trainer.train()?;
    trainer.group().shutdown();
    Ok(())
}
