use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dp_conversion::ConversionJob;
use dp_storage::PublishOptions;
use dp_sync::{db, init_tracing, DataPoolConfig, LogRing, Service};
use dp_web::AppState;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "dp-cli")]
#[command(about = "Datapool landing-zone dispatcher")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Watch the operational landing zone and dispatch arriving files.
    RunServer {
        #[arg(long)]
        landing_zone: Option<PathBuf>,
        #[arg(long)]
        backup_dir: Option<PathBuf>,
        #[arg(long)]
        pid_file: Option<PathBuf>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run a conversion script on a raw file and report every problem found.
    Check {
        script: PathBuf,
        raw: PathBuf,
        /// Source name for source-specific scripts.
        #[arg(long)]
        source: Option<String>,
        /// Keep the converted table as CSV.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Copy the operational landing zone into a new development zone.
    StartDevelop {
        development: PathBuf,
        #[arg(long)]
        operational: Option<PathBuf>,
    },
    /// Publish new and changed files of a development zone.
    UpdateOperational {
        development: PathBuf,
        #[arg(long)]
        operational: Option<PathBuf>,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        copy_raw: bool,
    },
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let ring = LogRing::default();
    init_tracing(&ring, "info");
    let mut config = DataPoolConfig::from_env();

    match cli.command {
        Commands::RunServer {
            landing_zone,
            backup_dir,
            pid_file,
            port,
        } => {
            if let Some(path) = landing_zone {
                config.landing_zone = path;
            }
            if let Some(path) = backup_dir {
                config.backup_dir = path;
            }
            if let Some(path) = pid_file {
                config.pid_file = path;
            }
            if let Some(port) = port {
                config.http_port = port;
            }
            let port = config.http_port;
            let service = Service::new(config)?;
            let web_state = AppState::new(service.metrics(), ring, service.state().started());
            service
                .run_with(move |token| dp_web::serve(web_state, port, token))
                .await?;
        }
        Commands::Check {
            script,
            raw,
            source,
            output,
        } => {
            let mut runner = config.runner(Arc::new(config.subprocess_factory()));
            let job = ConversionJob {
                script,
                raw,
                source,
            };
            let report = runner.check(&job, output.as_deref()).await;
            runner.shutdown().await;
            for message in &report.messages {
                println!("{message}");
            }
            if report.failed {
                bail!("check failed");
            }
            println!("check passed: {} signals", report.signals);
        }
        Commands::StartDevelop {
            development,
            operational,
        } => {
            let operational = operational.unwrap_or(config.landing_zone);
            let state = dp_storage::start_develop(&operational, &development)?;
            println!(
                "checked out {} files into {}",
                state.files.len(),
                development.display()
            );
        }
        Commands::UpdateOperational {
            development,
            operational,
            force,
            copy_raw,
        } => {
            let operational = operational.unwrap_or(config.landing_zone);
            let options = PublishOptions {
                force,
                copy_raw_files: copy_raw,
                ..PublishOptions::default()
            };
            let report = dp_storage::update_operational(&development, &operational, &options)
                .await
                .with_context(|| format!("publishing {}", development.display()))?;
            for rel in &report.copied {
                println!("copied {rel}");
            }
            for rel in &report.skipped_raw {
                println!("skipped raw file {rel}");
            }
        }
        Commands::Migrate => {
            let pool = db::connect(&config.database_url).await?;
            db::migrate(&pool).await?;
            info!(database = %config.database_url, "schema up to date");
            pool.close().await;
        }
    }

    Ok(())
}
