use anyhow::{Context as _, Result};
use colored::Colorize;
use dialoguer::Confirm;
use safeguard::{DeleteRequest, DeleteSummary, DeletionPolicy, LockManager, Safeguard};

use crate::Context;
use crate::cli::DeleteArgs;
use crate::commands::{finish, inventory_path};
use crate::inventory::InventoryProvider;
use crate::ui;

pub fn run(ctx: &Context, args: DeleteArgs) -> Result<()> {
    let inventory = InventoryProvider::load(
        &inventory_path(ctx, args.inventory)?,
        LockManager::from_config(&ctx.settings.safety),
    )?;
    let guard = ctx.safeguard();

    let mut request = DeleteRequest::new(args.resource.clone());
    if args.cascade {
        request.policy = DeletionPolicy::Cascade;
    }

    // Always authorize first; an unsafe plan fails here without prompting
    let preview = plan(&guard, &inventory, &request)?;
    print_plan(&preview);

    if args.dry_run {
        println!();
        ui::info("Dry run, nothing deleted");
        return Ok(());
    }

    if !args.yes {
        println!();
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Delete {} resource(s)?",
                preview.plan.resources().len()
            ))
            .default(false)
            .interact()
            .context("Failed to read confirmation")?;
        if !confirmed {
            ui::info("Cancelled");
            return Ok(());
        }
    }

    let summary = finish(guard.delete(&inventory, &request))?;
    if !ctx.quiet {
        println!();
        for id in &summary.deleted {
            ui::success(&format!("Deleted {id}"));
        }
    }
    ui::success(&format!(
        "{} resource(s) deleted from {}",
        summary.deleted.len(),
        inventory.path().display()
    ));
    Ok(())
}

fn plan(
    guard: &Safeguard,
    inventory: &InventoryProvider,
    request: &DeleteRequest,
) -> Result<DeleteSummary> {
    let dry = DeleteRequest {
        dry_run: true,
        ..request.clone()
    };
    finish(guard.delete(inventory, &dry))
}

fn print_plan(preview: &DeleteSummary) {
    ui::header(&format!("Deletion plan for {}", preview.plan.root));
    for (n, id) in preview.plan.resources().iter().enumerate() {
        let marker = if *id == preview.plan.root {
            "target".yellow()
        } else {
            "dependent".dimmed()
        };
        println!("  {:>3}. {id} {marker}", n + 1);
    }
}
