//! Command line options shared by pipeline binaries.
//!
//! Each binary flattens [`RunnerArgs`] into its own `clap` parser and
//! applies it over the loaded configuration.

use clap::ArgAction;
use std::path::PathBuf;

use crate::config::{Config, ConfigError};

#[derive(clap::Args, Debug, Clone, Default)]
pub struct RunnerArgs {
    /// Increase log verbosity (-v warnings, -vv info, -vvv debug)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Suspend every other consumer of the subscription and take its traffic
    #[arg(long)]
    pub takeover: bool,

    /// Consumers to register per topic
    #[arg(long)]
    pub threads: Option<usize>,

    /// Subscription name shared by all instances of this component
    #[arg(long, env = "PIPELINE_SUBSCRIPTION")]
    pub subscription: Option<String>,

    /// Configuration file (default: config/pipeline.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl RunnerArgs {
    /// Overlay the flags that were given onto `config`
    pub fn apply(&self, config: &mut Config) {
        if self.verbose > 0 {
            config.telemetry.verbosity = self.verbose;
        }
        if self.takeover {
            config.runner.takeover_mode = true;
        }
        if let Some(threads) = self.threads {
            config.runner.threads = threads;
        }
        if let Some(subscription) = &self.subscription {
            config.runner.subscription_name = subscription.clone();
        }
    }

    /// Load configuration, apply the flags and validate the result
    pub fn load_config(&self) -> Result<Config, ConfigError> {
        let mut config = Config::load_unvalidated(self.config.clone())?;
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }
}
