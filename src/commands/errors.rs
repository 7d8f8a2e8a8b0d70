use anyhow::{Context as _, Result, bail};
use chrono::Utc;
use colored::Colorize;
use safeguard::{ErrorReport, RecoveryOutcome, list_reports, load_report};

use crate::Context;
use crate::cli::ErrorsCommand;
use crate::ui;

/// Log lines shown per report unless -v is given
const DEFAULT_TAIL_LINES: usize = 20;

pub fn run(ctx: &Context, cmd: ErrorsCommand) -> Result<()> {
    match cmd {
        ErrorsCommand::List { limit } => list(ctx, limit),
        ErrorsCommand::Show { id } => show(ctx, &id),
    }
}

fn recovery_label(outcome: RecoveryOutcome) -> colored::ColoredString {
    let label = outcome.to_string();
    match outcome {
        RecoveryOutcome::Succeeded => label.green(),
        RecoveryOutcome::Failed => label.red(),
        RecoveryOutcome::NotAttempted => label.dimmed(),
    }
}

fn list(ctx: &Context, limit: usize) -> Result<()> {
    let dir = &ctx.settings.safety.diagnostics_dir;
    let reports = list_reports(dir).context("Failed to read diagnostics directory")?;

    ui::header("Error reports");
    ui::kv("Directory", &dir.display().to_string());
    println!();

    if reports.is_empty() {
        ui::success("No errors recorded");
        return Ok(());
    }

    let now = Utc::now();
    let skip = reports.len().saturating_sub(limit);
    for report in reports.iter().skip(skip) {
        println!(
            "  {}  {:<14} {:>4}  {}",
            report.id.cyan(),
            recovery_label(report.recovery),
            ui::format_age(report.created_at, now).dimmed(),
            ui::truncate(&report.message, 60)
        );
    }
    if skip > 0 {
        println!();
        ui::dim(&format!("{skip} older report(s) not shown; use -n to see more"));
    }
    Ok(())
}

fn show(ctx: &Context, id: &str) -> Result<()> {
    let dir = &ctx.settings.safety.diagnostics_dir;
    let Some(report) = load_report(dir, id).context("Failed to read report")? else {
        bail!("No report '{id}' in {}", dir.display());
    };
    print_report(&report, ctx.verbose > 0);
    Ok(())
}

fn print_report(report: &ErrorReport, full_tail: bool) {
    ui::header(&report.id);
    ui::kv("Category", report.category.description());
    ui::kv("Message", &report.message);
    ui::kv("Operation", &report.context.to_string());
    ui::kv("Created", &report.created_at.to_rfc3339());
    ui::kv("Recovery", &recovery_label(report.recovery).to_string());
    ui::kv("Attempts", &report.attempts.to_string());

    if !report.transitions.is_empty() {
        let steps: Vec<String> = report.transitions.iter().map(ToString::to_string).collect();
        ui::kv("Steps", &steps.join(" → "));
    }

    ui::section("Advice");
    println!("  {}", report.category.advice());

    ui::section("Environment");
    let env = &report.environment;
    ui::kv("Host", &env.hostname);
    ui::kv("Process", &format!("{} (pid {})", env.args.join(" "), env.pid));
    if let Some(user) = &env.user {
        ui::kv("User", user);
    }
    ui::kv("Platform", &format!("{}/{}", env.os, env.arch));
    if let Some(cwd) = &env.cwd {
        ui::kv("Directory", &cwd.display().to_string());
    }
    for (key, value) in &env.env {
        ui::kv(key, value);
    }

    if !report.log_tail.is_empty() {
        ui::section("Log");
        let skip = if full_tail {
            0
        } else {
            report.log_tail.len().saturating_sub(DEFAULT_TAIL_LINES)
        };
        if skip > 0 {
            ui::dim(&format!("{skip} earlier line(s) hidden; use -v to see all"));
        }
        for line in report.log_tail.iter().skip(skip) {
            ui::dim(line);
        }
    }
}
