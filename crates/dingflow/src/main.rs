// SPDX-FileCopyrightText: 2026 Dingflow Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Dingflow - streams AI completions into DingTalk conversations.
//!
//! This is the binary entry point for the bridge.

mod check;
mod serve;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use dingflow_config::{ConfigError, DingflowConfig};

/// Dingflow - streams AI completions into DingTalk conversations.
#[derive(Parser, Debug)]
#[command(name = "dingflow", version, about, long_about = None)]
struct Cli {
    /// Read configuration from this file instead of the default locations.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect every enabled account and start bridging messages.
    Serve,
    /// Validate the configuration and print a summary.
    CheckConfig,
}

fn load(path: Option<&Path>) -> Result<DingflowConfig, Vec<ConfigError>> {
    match path {
        Some(path) => dingflow_config::load_and_validate_path(path),
        None => dingflow_config::load_and_validate(),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(errors) => {
            dingflow_config::render_errors(&errors);
            std::process::exit(1);
        }
    };

    match cli.command {
        Some(Commands::Serve) => {
            if let Err(errors) = dingflow_config::validation::validate_serving(&config) {
                dingflow_config::render_errors(&errors);
                std::process::exit(1);
            }
            if let Err(e) = serve::run_serve(config).await {
                eprintln!("error: {e}");
                std::process::exit(1);
            }
        }
        Some(Commands::CheckConfig) => {
            print!("{}", check::summary(&config));
        }
        None => {
            println!("dingflow: use --help for available commands");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_global_config_flag_after_subcommand() {
        let cli = Cli::parse_from(["dingflow", "check-config", "--config", "/tmp/d.toml"]);
        assert!(matches!(cli.command, Some(Commands::CheckConfig)));
        assert_eq!(cli.config.as_deref(), Some(Path::new("/tmp/d.toml")));
    }
}
