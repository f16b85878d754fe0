use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lmtune::cli;

#[derive(Parser)]
#[command(name = "lmtune")]
#[command(about = "GPU query, text generation and LoRA/QLoRA fine-tuning with Candle", long_about = None)]
#[command(version)]
struct Cli {
    /// Comma-separated GPU ids exposed to the process
    #[arg(long, global = true, env = "LMTUNE_VISIBLE_DEVICES")]
    visible_devices: Option<String>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report GPU availability and properties
    Gpu,

    /// Generate text from a prompt
    Generate(cli::GenerateArgs),

    /// Fine-tune a causal LM with LoRA or QLoRA
    Finetune(cli::FinetuneArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "lmtune=debug" } else { "lmtune=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(devices) = &cli.visible_devices {
        lmtune::utils::apply_visible_devices(devices)?;
    }

    match cli.command {
        Commands::Gpu => cli::gpu()?,
        Commands::Generate(args) => cli::generate(args)?,
        Commands::Finetune(args) => cli::finetune(args)?,
    }

    Ok(())
}
