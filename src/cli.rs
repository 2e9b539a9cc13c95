//! CLI command definitions

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::BrokerConfig;

/// fedhub - co-simulation broker runtime
#[derive(Parser)]
#[command(
    name = "fedhub",
    about = "Federates independent simulators around a shared virtual clock",
    version
)]
pub struct Cli {
    /// Path to a YAML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a broker node
    Broker {
        /// Raw initialization string; overrides the individual flags
        #[arg(long)]
        init: Option<String>,

        /// Broker identifier
        #[arg(long)]
        name: Option<String>,

        /// Act as the federation root
        #[arg(long)]
        root: bool,

        /// Forward all off-node traffic through the parent
        #[arg(long)]
        gateway: bool,

        /// Minimum federates before reporting init-ready
        #[arg(long, value_name = "N")]
        min_federates: Option<u32>,

        /// Minimum child brokers before reporting init-ready
        #[arg(long, value_name = "N")]
        min_brokers: Option<u32>,

        /// Address of the parent broker
        #[arg(long)]
        broker_address: Option<String>,
    },
}

impl Command {
    /// Fold the CLI flags (or the raw init string) into a broker config.
    pub fn broker_config(&self) -> eyre::Result<BrokerConfig> {
        let Command::Broker {
            init,
            name,
            root,
            gateway,
            min_federates,
            min_brokers,
            broker_address,
        } = self;

        if let Some(init) = init {
            return BrokerConfig::from_init_string(init);
        }

        let mut config = BrokerConfig::default();
        config.name = name.clone();
        config.root = *root;
        config.gateway = *gateway;
        if let Some(n) = min_federates {
            config.min_federates = *n;
        }
        if let Some(n) = min_brokers {
            config.min_brokers = *n;
        }
        config.broker_address = broker_address.clone();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_flags() {
        let cli = Cli::parse_from(["fedhub", "broker", "--name", "hub", "--root", "--min-federates", "2"]);
        let config = cli.command.broker_config().unwrap();
        assert_eq!(config.name.as_deref(), Some("hub"));
        assert!(config.root);
        assert_eq!(config.min_federates, 2);
        assert_eq!(config.min_brokers, 1);
    }

    #[test]
    fn test_init_string_wins() {
        let cli = Cli::parse_from(["fedhub", "broker", "--name", "ignored", "--init", "name=hub root"]);
        let config = cli.command.broker_config().unwrap();
        assert_eq!(config.name.as_deref(), Some("hub"));
        assert!(config.root);
    }
}
