mod cli;
mod commands;
mod config;
mod paths;
mod progress;
mod providers;
mod resource_set;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use config::YardConfig;
use converge::CancelToken;
use std::io;
use std::process::ExitCode;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub config: YardConfig,
    /// Set by Ctrl-C; in-flight resources finish, nothing new starts
    pub cancel: CancelToken,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            ui::error(&format!("{e:#}"));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<bool> {
    if let Command::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "yard", &mut io::stdout());
        return Ok(true);
    }

    let cancel = CancelToken::new();
    let flag = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if !flag.is_cancelled() {
            eprintln!("\nInterrupted, waiting for running resources to finish...");
        }
        flag.cancel();
    }) {
        log::warn!("Could not install Ctrl-C handler: {e}");
    }

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        config: YardConfig::load(cli.config.as_deref())?,
        cancel,
    };

    match cli.command {
        Command::Apply(args) => commands::apply::run(&ctx, args),
        Command::Destroy(args) => commands::destroy::run(&ctx, args),
        Command::Plan(args) => commands::plan::run(&ctx, args),
        Command::State(cmd) => commands::state::run(&ctx, cmd),
        Command::Completions { .. } => Ok(true),
    }
}
