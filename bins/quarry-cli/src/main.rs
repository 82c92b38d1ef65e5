mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "quarry-cli")]
#[command(about = "Quarry CLI - Run analyses locally and manage the sandbox", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline on local files and print the resolved JSON
    Run {
        /// Files to upload (questions.txt plus any attachments)
        #[arg(short, long = "file", required = true)]
        files: Vec<PathBuf>,

        /// Sandbox backend (docker or local); defaults to QUARRY_SANDBOX
        #[arg(short, long)]
        sandbox: Option<String>,

        /// Keep the request workspace after the run
        #[arg(long, default_value = "false")]
        keep: bool,
    },

    /// Initialize a new Quarry project
    Init {
        /// Project path
        #[arg(short, long, default_value = ".")]
        path: String,
    },

    /// Build the sandbox Docker image
    BuildImage {
        /// Skip build cache
        #[arg(long, default_value = "false")]
        no_cache: bool,
    },

    /// Remove old request workspaces from the upload root
    Clean {
        /// Only remove workspaces not modified for this many hours
        #[arg(long, default_value = "24")]
        older_than_hours: i64,

        /// List what would be removed without deleting anything
        #[arg(long, default_value = "false")]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // Logs go to stderr so stdout carries only the result
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            files,
            sandbox,
            keep,
        } => {
            commands::run_files(&files, sandbox.as_deref(), keep).await?;
        }
        Commands::Init { path } => {
            commands::init_project(&path).await?;
        }
        Commands::BuildImage { no_cache } => {
            commands::build_docker_image(no_cache).await?;
        }
        Commands::Clean {
            older_than_hours,
            dry_run,
        } => {
            commands::clean(older_than_hours, dry_run).await?;
        }
    }

    Ok(())
}
