mod cli;
mod commands;
mod config;
mod interrupt;
mod kubectl;
mod lock;
mod paths;
mod progress;
mod state;
mod ui;

use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use commands::{EXIT_ERROR, Exit};
use std::io;
use std::path::PathBuf;

/// Global context for the application
pub struct Context {
    pub quiet: bool,
    /// Config file given on the command line
    pub config: Option<PathBuf>,
}

fn main() {
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

    let ctx = Context {
        quiet: cli.quiet,
        config: cli.config,
    };

    let result = match cli.command {
        Command::Reconcile(args) => commands::reconcile::run(&ctx, args),
        Command::Plan(args) => commands::plan::run(&ctx, args),
        Command::Teardown(args) => commands::teardown::run(&ctx, args),
        Command::Targets { long } => commands::targets::run(&ctx, long),
        Command::Status => commands::status::run(&ctx),
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "stackctl", &mut io::stdout());
            Ok(Exit::Success)
        }
    };

    match result {
        Ok(exit) => std::process::exit(exit.code()),
        Err(e) => {
            ui::error(&format!("{e:#}"));
            std::process::exit(EXIT_ERROR);
        }
    }
}
