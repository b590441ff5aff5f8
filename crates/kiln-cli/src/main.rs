//! Kiln CLI tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Kiln build server", long_about = None)]
struct Cli {
    /// Controller configuration file
    #[arg(long, env = "KILN_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding build records (overrides the configuration)
    #[arg(long, env = "KILN_ROOT")]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a job file
    Validate {
        /// Path to the job file
        #[arg(default_value = "jobs.kdl")]
        path: PathBuf,
    },
    /// Build jobs on the local node and wait for the results
    Build {
        /// Jobs to build
        #[arg(required = true)]
        jobs: Vec<String>,
        /// Path to the job file
        #[arg(long, short = 'f', default_value = "jobs.kdl")]
        file: PathBuf,
        /// Build parameter (repeatable)
        #[arg(long = "param", short = 'p', value_parser = commands::parse_param)]
        params: Vec<(String, String)>,
        /// Also wait for the downstream builds they trigger
        #[arg(long)]
        downstream: bool,
    },
    /// List recorded builds of a job
    Runs {
        job: String,
        /// Maximum number of builds to show
        #[arg(long, default_value = "10")]
        limit: usize,
        /// Print the console log of this build number
        #[arg(long)]
        log: Option<u32>,
    },
    /// Show a fingerprint record, by md5 or by file
    Fingerprint {
        /// md5 sum, or path of a file to digest
        target: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::Build {
            jobs,
            file,
            params,
            downstream,
        } => {
            let config = commands::load_config(cli.config.as_deref(), cli.root)?;
            commands::build::run(config, &file, &jobs, params, downstream).await?;
        }
        Commands::Runs { job, limit, log } => {
            let config = commands::load_config(cli.config.as_deref(), cli.root)?;
            commands::runs::list(&config, &job, limit, log).await?;
        }
        Commands::Fingerprint { target } => {
            let config = commands::load_config(cli.config.as_deref(), cli.root)?;
            commands::fingerprint::show(&config, &target).await?;
        }
    }

    Ok(())
}
