use anyhow::{Context as _, Result};
use chrono::Utc;
use colored::Colorize;
use safeguard::LockStatus;

use crate::Context;
use crate::cli::LocksCommand;
use crate::ui;

pub fn run(ctx: &Context, cmd: LocksCommand) -> Result<()> {
    match cmd {
        LocksCommand::List => list(ctx),
        LocksCommand::Sweep => sweep(ctx),
    }
}

/// Show every held lock
fn list(ctx: &Context) -> Result<()> {
    let guard = ctx.safeguard();
    let locks = guard.locks().list().context("Failed to read lock directory")?;

    ui::header("Locks");
    ui::kv("Directory", &guard.locks().dir().display().to_string());

    if locks.is_empty() {
        println!();
        ui::info("No locks held");
        return Ok(());
    }

    println!();
    let now = Utc::now();
    for status in &locks {
        print_status(status, now);
    }

    let stale = locks.iter().filter(|s| s.is_stale()).count();
    if stale > 0 {
        println!();
        ui::warn(&format!(
            "{stale} stale lock(s). Run 'cloudsweep locks sweep' to remove them."
        ));
    }
    Ok(())
}

fn print_status(status: &LockStatus, now: chrono::DateTime<Utc>) {
    let verdict = if status.alive {
        "live".green()
    } else {
        "stale".red()
    };
    match &status.record {
        Some(record) => println!(
            "  {:<6} {}  {}  {}",
            verdict,
            record.resource.to_string().cyan(),
            record.owner,
            format!("{} ago", ui::format_age(record.acquired_at, now)).dimmed()
        ),
        None => println!(
            "  {:<6} {}  {}",
            verdict,
            status.path.display(),
            "unreadable entry".dimmed()
        ),
    }
}

/// Remove locks left behind by exited processes
fn sweep(ctx: &Context) -> Result<()> {
    let guard = ctx.safeguard();
    let reclaimed = guard
        .locks()
        .sweep_stale()
        .context("Failed to sweep lock directory")?;

    if let Err(e) = guard.state().mark_cleanup() {
        log::warn!("Could not record cleanup time: {e}");
    }

    if reclaimed.is_empty() {
        ui::success("No stale locks");
        return Ok(());
    }

    let now = Utc::now();
    for status in &reclaimed {
        print_status(status, now);
    }
    ui::success(&format!("Removed {} stale lock(s)", reclaimed.len()));
    Ok(())
}
