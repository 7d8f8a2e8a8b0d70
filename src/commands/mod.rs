pub mod delete;
pub mod deps;
pub mod errors;
pub mod locks;
pub mod state;

use anyhow::{Result, anyhow};
use colored::Colorize;
use safeguard::{ErrorReport, Outcome};
use std::path::PathBuf;

use crate::Context;
use crate::ui;

/// Unwrap an outcome, printing the filed report when it gave up.
pub fn finish<T>(outcome: Outcome<T>) -> Result<T> {
    match outcome {
        Outcome::Succeeded(value) => Ok(value),
        Outcome::Reported { report, error } => {
            print_report_notice(&report);
            Err(anyhow!(error).context(report.category.description()))
        }
    }
}

fn print_report_notice(report: &ErrorReport) {
    ui::error(&report.message);
    eprintln!("  {} {}", "advice:".dimmed(), report.category.advice());
    eprintln!(
        "  {} {} ({})",
        "report:".dimmed(),
        report.id.cyan(),
        format!("cloudsweep errors show {}", report.id).dimmed()
    );
}

/// Inventory from the flag, the environment or the config file.
pub fn inventory_path(ctx: &Context, flag: Option<PathBuf>) -> Result<PathBuf> {
    flag.or_else(|| ctx.settings.inventory.clone()).ok_or_else(|| {
        anyhow!("No inventory given. Pass --inventory or set `inventory` in config.toml")
    })
}
