pub mod analysis;
pub mod cli;
pub mod commands;
pub mod config;
pub mod device;
pub mod errors;
pub mod executor;
pub mod game;
pub mod logging;
pub mod perception;
pub mod tasks;
pub mod vlm;

use clap::Parser;

use crate::cli::{Cli, Command, RunArgs};
use crate::errors::BotResult;

/// Parses the command line, sets up logging and runs the chosen command.
pub async fn run() -> BotResult<()> {
    // .env is optional
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = commands::load(cli.config.as_deref(), cli.debug)?;
    logging::init_logging(&config.logging.level, config.debug_mode, config.logging.file.as_deref())?;
    tracing::debug!(?config, "configuration");

    let command = cli.command.unwrap_or_else(|| Command::Run(RunArgs::default()));
    commands::dispatch(config, command).await
}
