//! tagsync: keep policy tags in step with the roles that use them.

#![forbid(unsafe_code)]

mod cli;
mod commands;
mod logging;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tagsync_core::Config;

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.log_format);

    match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "tagsync failed");
            eprintln!("error: {err:#}");
            ExitCode::from(commands::EXIT_FATAL)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let mut config = load_config(&cli)?;
    match &cli.command {
        Command::Run(args) => {
            args.apply(&mut config);
            validate(&config)?;
            commands::run(&config, args).await
        }
        Command::Plan(args) => {
            args.apply(&mut config);
            validate(&config)?;
            commands::plan(&config).await
        }
        Command::CheckConfig => {
            validate(&config)?;
            commands::check_config(&config)
        }
    }
}

/// Defaults, then the file, then the environment. Flags are applied per command.
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    config
        .apply_process_env()
        .context("invalid environment override")?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    config.validate().context("invalid configuration")
}
