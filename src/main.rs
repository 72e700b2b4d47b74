//! Binary entrypoint: argument parsing, logging setup, and dispatch to the
//! `server` / `config-check` / `export-config` subcommands.

mod cli;

use clap::Parser;
use herdns::config::ConfigFile;
use herdns::lifecycle;
use herdns::logging;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = cli::Cli::parse();

    let debug_level = if cli.debug() { 2 } else { 0 };
    if let Err(err) = logging::init_subscriber(debug_level) {
        eprintln!("failed to install logging: {err}");
    }

    let config_path = cli.config();
    let secret_path = cli.secret();
    let command = cli.command.unwrap_or_default();

    match command {
        cli::Commands::Server { .. } => match lifecycle::run(config_path, secret_path).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("server exited with an error: {err}");
                ExitCode::FAILURE
            }
        },
        cli::Commands::ConfigCheck { .. } => match ConfigFile::try_from_file(config_path.as_deref()) {
            Ok(config) => {
                println!("configuration is valid ({} zone(s), {} rule(s), {} plugin(s))", config.zones.len(), config.rules.len(), config.plugins.len());
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("configuration is invalid: {err}");
                ExitCode::FAILURE
            }
        },
        cli::Commands::ExportConfig { .. } => match ConfigFile::try_from_file(config_path.as_deref()) {
            Ok(config) => match config.as_toml_pretty() {
                Ok(toml) => {
                    println!("{toml}");
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    eprintln!("failed to render configuration: {err}");
                    ExitCode::FAILURE
                }
            },
            Err(err) => {
                eprintln!("failed to load configuration: {err}");
                ExitCode::FAILURE
            }
        },
    }
}
