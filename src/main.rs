mod cli;
mod commands;
mod config;
mod inventory;
mod logging;
mod paths;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use config::Settings;
use safeguard::{LockManager, LogTail, Safeguard, SafetyConfig};
use std::io;
use std::panic;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub settings: Settings,
    pub log_tail: LogTail,
}

impl Context {
    /// Safety core for this invocation, capturing recent log lines into reports
    pub fn safeguard(&self) -> Safeguard {
        Safeguard::new(self.settings.safety.clone()).with_log_tail(self.log_tail.clone())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_tail = LogTail::default();
    logging::init(cli.verbose, cli.quiet, log_tail.clone())?;

    if let Command::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "cloudsweep", &mut io::stdout());
        return Ok(());
    }

    let settings = config::load(cli.config.as_deref())?;
    if let Some(source) = &settings.source {
        log::debug!("Using config {}", source.display());
    }
    log::debug!(
        "Locks in {}, state in {}",
        settings.safety.lock_dir.display(),
        settings.safety.state_file.display()
    );

    install_panic_hook(&settings.safety);

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        settings,
        log_tail,
    };

    let result = match cli.command {
        Command::Locks(cmd) => commands::locks::run(&ctx, cmd),
        Command::State(cmd) => commands::state::run(&ctx, cmd),
        Command::Deps(args) => commands::deps::run(&ctx, args),
        Command::Delete(args) => commands::delete::run(&ctx, args),
        Command::Errors(cmd) => commands::errors::run(&ctx, cmd),
        Command::Completions { .. } => Ok(()),
    };
    if result.is_err() {
        release_own_locks(&ctx.settings.safety);
    }
    result
}

/// Release builds abort on panic, so lock guards never get to run there.
fn install_panic_hook(safety: &SafetyConfig) {
    let safety = safety.clone();
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        release_own_locks(&safety);
        default_hook(info);
    }));
}

/// Drop any lock entry this process still owns.
fn release_own_locks(safety: &SafetyConfig) {
    match LockManager::from_config(safety).release_all() {
        Ok(released) if !released.is_empty() => {
            log::warn!("Released {} leftover lock(s)", released.len());
        }
        Ok(_) => {}
        Err(e) => log::error!("Could not release leftover locks: {e}"),
    }
}
