use clap::{Parser, Subcommand};
use logship::config::Config;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "logship", about = "Delivers staged log files to tenant destinations")]
struct Cli {
    #[arg(long, default_value = "logship.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Consume notifications from the staging queue.
    Worker,
    /// Deliver a single staged object and exit.
    Deliver {
        #[arg(long)]
        bucket: String,
        #[arg(long)]
        key: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::from_file(&cli.config) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("Failed to load {}: {error}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };

    let _telemetry = match logship::telemetry::init(&config.logging, config.metrics.as_ref()) {
        Ok(guard) => guard,
        Err(error) => {
            eprintln!("Failed to initialize telemetry: {error}");
            return ExitCode::FAILURE;
        }
    };

    let token = CancellationToken::new();
    logship::spawn_signal_handlers(&token);

    match cli.command {
        CliCommand::Worker => {
            tracing::info!("Starting worker");
            if let Err(error) = logship::run_worker(config, token).await {
                tracing::error!(error = %error, "Worker failed");
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        CliCommand::Deliver { bucket, key } => {
            match logship::deliver_object(config, &bucket, &key, token).await {
                Ok(report) => {
                    for leg in &report.legs {
                        tracing::info!(
                            destination = leg.kind.as_str(),
                            target = %leg.target,
                            stats = ?leg.stats,
                            error = leg.error.as_ref().map(tracing::field::display),
                            "Delivery leg finished"
                        );
                    }
                    match report.error {
                        None => ExitCode::SUCCESS,
                        Some(error) => {
                            tracing::error!(
                                error = %error,
                                outcome = report.outcome.as_str(),
                                "Delivery failed"
                            );
                            ExitCode::FAILURE
                        }
                    }
                }
                Err(error) => {
                    tracing::error!(error = %error, "Delivery failed");
                    ExitCode::FAILURE
                }
            }
        }
    }
}
