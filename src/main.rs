//! SoftCon Fine-Tuning CLI
//!
//! Entry point for LoRA fine-tuning of a SoftCon ViT-B/14 on one country of
//! BigEarthNet v2.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use softcon_finetune::backend::{backend_name, TrainingBackend};
use softcon_finetune::config::FinetuneConfig;
use softcon_finetune::dataset::metadata::MetadataTable;
use softcon_finetune::dataset::{decode_targets, BigEarthNetDataset};
use softcon_finetune::dataset::split::{split_country, SplitConfig};
use softcon_finetune::training::run_training;
use softcon_finetune::utils::logging::{init_logging, LogConfig};
use softcon_finetune::utils::format_number;

/// SoftCon ViT-B/14 + LoRA fine-tuning on BigEarthNet v2
#[derive(Parser, Debug)]
#[command(name = "softcon-finetune")]
#[command(version)]
#[command(about = "LoRA fine-tuning of a SoftCon ViT on BigEarthNet v2 with Burn", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, default_value = "false", conflicts_with = "verbose")]
    quiet: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

/// Overrides shared by the data-facing subcommands
#[derive(Args, Debug)]
struct RunArgs {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Country to sample from
    #[arg(long)]
    country: Option<String>,

    /// Number of sampled patches
    #[arg(short, long)]
    n_samples: Option<usize>,

    /// Seed for the split (and, for training, the run)
    #[arg(short, long)]
    seed: Option<u64>,
}

impl RunArgs {
    /// Defaults, then the TOML file, then the flags
    fn resolve(&self) -> Result<FinetuneConfig> {
        let mut config = match &self.config {
            Some(path) => FinetuneConfig::from_toml_file(path)?,
            None => FinetuneConfig::default(),
        };
        if let Some(country) = &self.country {
            config.data.country = country.clone();
        }
        if let Some(n) = self.n_samples {
            config.data.n_samples = n;
        }
        if let Some(seed) = self.seed {
            config.data.seed = seed;
            config.training.seed = seed;
        }
        Ok(config)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fine-tune the classifier and save the weights
    Train {
        #[command(flatten)]
        run: RunArgs,

        /// Number of training epochs
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Load the pretrained weights into the backbone
        #[arg(long, default_value = "false")]
        apply_checkpoint: bool,
    },

    /// Compute the country split and print its statistics
    Split {
        #[command(flatten)]
        run: RunArgs,

        /// Write the train/validation ids as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the default configuration as TOML
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else if cli.quiet {
        LogConfig::quiet()
    } else {
        LogConfig::default()
    };

    let _ = init_logging(&log_config);

    match cli.command {
        Commands::Train {
            run,
            epochs,
            apply_checkpoint,
        } => {
            print_banner();
            let mut config = run.resolve()?;
            if let Some(epochs) = epochs {
                config.training.epochs = epochs;
            }
            if apply_checkpoint {
                config.model.apply_checkpoint = true;
            }
            cmd_train(&config)?;
        }

        Commands::Split { run, output } => {
            let config = run.resolve()?;
            cmd_split(&config, output)?;
        }

        Commands::Config => {
            print!("{}", FinetuneConfig::default().to_toml_string()?);
        }
    }

    Ok(())
}

fn print_banner() {
    println!(
        "{}",
        r#"
 ==================================================================
    SoftCon ViT-B/14 + LoRA
    BigEarthNet v2 multi-label fine-tuning with Burn + Rust
 ==================================================================
  "#
        .green()
    );
}

fn cmd_train(config: &FinetuneConfig) -> Result<()> {
    config.validate()?;

    println!("{}", "Training Configuration:".cyan().bold());
    println!("  Country:          {}", config.data.country);
    println!("  Samples:          {}", format_number(config.data.n_samples));
    println!("  Epochs:           {}", config.training.epochs);
    println!("  Batch size:       {}", config.training.batch_size);
    println!("  Learning rate:    {}", config.training.learning_rate);
    println!(
        "  LoRA:             rank {}, alpha {}",
        config.model.lora_rank, config.model.lora_alpha
    );
    println!("  Backend:          {}", backend_name());
    println!();

    let outcome = run_training::<TrainingBackend>(config).context("fine-tuning failed")?;

    println!();
    println!("{}", "Training Complete!".green().bold());
    if let Some(valid) = &outcome.summary.final_valid {
        println!("  Final validation: {}", valid);
    }
    println!("  Saved to: {}", outcome.summary.weights.display());

    Ok(())
}

fn cmd_split(config: &FinetuneConfig, output: Option<PathBuf>) -> Result<()> {
    info!("Reading metadata from {}", config.data.metadata_parquet.display());
    let metadata = MetadataTable::from_parquet(&config.data.metadata_parquet)?;

    let split_config = SplitConfig::new(
        config.data.country.clone(),
        config.data.n_samples,
        config.data.seed,
        config.data.train_fraction,
    );
    let assignment = split_country(&metadata, &split_config)?;

    println!("{}", format!("Split for {}:", config.data.country).cyan().bold());
    assignment.stats().print();

    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for entry in BigEarthNetDataset::entries_for(&metadata, &assignment.train_ids)? {
        for name in decode_targets(&entry.targets) {
            *counts.entry(name).or_default() += 1;
        }
    }
    println!("{}", "Train label counts:".cyan().bold());
    for (name, count) in &counts {
        println!("  {:<45} {:>6}", name, count);
    }

    if let Some(path) = output {
        let json = serde_json::to_string_pretty(&assignment)?;
        fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
        println!("  Ids written to {}", path.display());
    }

    Ok(())
}
