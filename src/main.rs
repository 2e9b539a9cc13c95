//! fedhub - broker front end
//!
//! Runs a broker node until interrupted. Exit codes: 0 clean finalize,
//! 1 configuration error, 2 transport failure, 3 federation error.

use std::process::ExitCode;

use clap::Parser;
use eyre::Context;
use tracing::{error, info};

use fedhub::broker::Broker;
use fedhub::cli::{Cli, Command};
use fedhub::config::BrokerConfig;

fn setup_logging(verbose: bool) {
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            error!("{err:#}");
            return ExitCode::from(1);
        }
    };

    match cli.command {
        Command::Broker { .. } => run_broker(config).await,
    }
}

fn load_config(cli: &Cli) -> eyre::Result<BrokerConfig> {
    if let Some(path) = &cli.config {
        return BrokerConfig::load(path).context("loading configuration file");
    }
    cli.command.broker_config()
}

async fn run_broker(config: BrokerConfig) -> ExitCode {
    if !config.root && config.broker_address.is_none() {
        error!("a non-root broker requires --broker-address");
        return ExitCode::from(1);
    }
    // Cross-process transports plug in below the broker; the process-local
    // front end only hosts root brokers directly.
    if !config.root {
        error!("no transport available for a non-root broker in this build");
        return ExitCode::from(2);
    }

    let broker = Broker::new(config);
    info!(identifier = %broker.get_identifier(), "starting root broker");
    let router = tokio::spawn(broker.run());

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(err) => {
            error!(%err, "signal handler failed");
            router.abort();
            return ExitCode::from(3);
        }
    }
    router.abort();
    ExitCode::SUCCESS
}
