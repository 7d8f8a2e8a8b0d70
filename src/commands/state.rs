use anyhow::{Context as _, Result, bail};
use chrono::Utc;
use colored::Colorize;
use safeguard::{
    ErrorCategory, OperationContext, ResourceId, ResourceState, StateError, Validation,
};

use crate::Context;
use crate::cli::StateCommand;
use crate::commands::finish;
use crate::ui;

pub fn run(ctx: &Context, cmd: StateCommand) -> Result<()> {
    match cmd {
        StateCommand::Show { json, limit } => show(ctx, json, limit),
        StateCommand::Get { resource } => get(ctx, &resource),
        StateCommand::Set { resource, state } => set(ctx, &resource, state),
        StateCommand::Validate => validate(ctx),
        StateCommand::Repair => repair(ctx),
    }
}

fn show(ctx: &Context, json: bool, limit: usize) -> Result<()> {
    let guard = ctx.safeguard();
    let doc = guard.state().snapshot().map_err(unreadable)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    let now = Utc::now();
    ui::header("State");
    ui::kv("Document", &guard.state().path().display().to_string());
    if let Some(at) = doc.last_cleanup {
        ui::kv("Last sweep", &format!("{} ago", ui::format_age(at, now)));
    }

    ui::section("Resources");
    if doc.resources.is_empty() {
        ui::dim("none tracked");
    }
    for (key, record) in &doc.resources {
        println!(
            "  {:<40} {:<10} {}",
            key.cyan(),
            ui::state_badge(record.state),
            format!("{} ago", ui::format_age(record.timestamp, now)).dimmed()
        );
    }

    if !doc.operations.is_empty() {
        ui::section("Recent transitions");
        let skip = doc.operations.len().saturating_sub(limit);
        for op in doc.operations.iter().skip(skip) {
            println!(
                "  {} {} {} → {} {}",
                op.at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
                op.resource,
                ui::state_badge(op.from),
                ui::state_badge(op.to),
                format!("(pid {})", op.pid).dimmed()
            );
        }
    }
    Ok(())
}

fn unreadable(e: StateError) -> anyhow::Error {
    let hint = if e.category() == ErrorCategory::StateCorruption {
        "Run 'cloudsweep state repair' first"
    } else {
        "Failed to read state document"
    };
    anyhow::Error::new(e).context(hint)
}

fn get(ctx: &Context, resource: &ResourceId) -> Result<()> {
    let guard = ctx.safeguard();
    let record = guard.state().read_resource(resource).map_err(unreadable)?;

    let Some(record) = record else {
        ui::info(&format!(
            "{resource} is not tracked ({})",
            ui::state_badge(ResourceState::Unknown)
        ));
        return Ok(());
    };

    ui::header(&resource.to_string());
    ui::kv("State", &ui::state_badge(record.state).to_string());
    ui::kv("Updated", &record.timestamp.to_rfc3339());
    for (key, value) in &record.metadata {
        ui::kv(key, &value.to_string());
    }
    if let Some(holder) = guard.locks().holder(resource)? {
        ui::kv("Locked by", &holder.owner.to_string());
    }
    Ok(())
}

/// Record a state by hand, holding the resource lock while writing
fn set(ctx: &Context, resource: &ResourceId, state: ResourceState) -> Result<()> {
    let guard = ctx.safeguard();
    let op = OperationContext::for_resource("state set", resource.clone());
    let outcome = guard.coordinator().run(&op, || {
        let written = guard
            .locks()
            .with_lock(resource, || guard.state().update_resource_state(resource, state))?;
        written?;
        Ok(())
    });
    finish(outcome)?;

    if !ctx.quiet {
        ui::success(&format!("{resource} is now {}", ui::state_badge(state)));
    }
    Ok(())
}

fn validate(ctx: &Context) -> Result<()> {
    let guard = ctx.safeguard();
    let path = guard.state().path().display().to_string();
    match guard.state().validate().context("Failed to read state document")? {
        Validation::Valid => {
            ui::success(&format!("{path} is valid"));
            Ok(())
        }
        Validation::Corrupt(reason) => {
            ui::error(&format!("{path} is corrupt: {reason}"));
            ui::dim("Run 'cloudsweep state repair' to move it aside");
            bail!("State document is corrupt")
        }
    }
}

/// Move a corrupt document aside and start over, filing a report
fn repair(ctx: &Context) -> Result<()> {
    let guard = ctx.safeguard();
    let reason = match guard.state().validate().context("Failed to read state document")? {
        Validation::Valid => {
            ui::success("State document is valid, nothing to repair");
            return Ok(());
        }
        Validation::Corrupt(reason) => reason,
    };

    match guard.state().backup_and_repair().context("Failed to repair state document")? {
        Some(backup) => {
            ui::success("Started a fresh state document");
            ui::kv("Backup", &backup.display().to_string());
        }
        None => ui::info("Another process repaired the document first"),
    }

    let report = guard.coordinator().handle(
        ErrorCategory::StateCorruption,
        &OperationContext::new("state repair"),
        &reason,
    );
    ui::kv("Report", &report.id);
    println!(
        "  {}",
        "Resource states were reset to unknown; re-run pending operations.".yellow()
    );
    Ok(())
}
