mod cmd;

use clap::{Parser, Subcommand};
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "modelkit")]
#[command(version)]
#[command(about = "Resolve model descriptors and run generation or scoring against them", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show which adapter a model descriptor resolves to
    Resolve {
        model: String,
        #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
        options: Vec<String>,
    },
    /// Generate a continuation of a prompt, streaming tokens to stdout
    Generate {
        model: String,
        prompt: String,
        #[arg(long, default_value_t = 64)]
        max_tokens: usize,
        #[arg(long, default_value_t = 0.0)]
        temperature: f64,
        #[arg(short, long, value_name = "TOKEN=BIAS")]
        bias: Vec<String>,
        #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
        options: Vec<String>,
    },
    /// Rank candidate continuations of a prompt by log-probability
    Score {
        model: String,
        prompt: String,
        #[arg(required = true)]
        values: Vec<String>,
        #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
        options: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Resolve { model, options } => cmd::resolve(&model, &options).await,
        Commands::Generate {
            model,
            prompt,
            max_tokens,
            temperature,
            bias,
            options,
        } => cmd::generate(&model, &prompt, max_tokens, temperature, &bias, &options).await,
        Commands::Score {
            model,
            prompt,
            values,
            options,
        } => cmd::score(&model, &prompt, &values, &options).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
