use anyhow::Result;
use colored::Colorize;
use safeguard::{
    CycleCheck, DependencyGraph, LockManager, OperationContext, ResourceId, RetryConfig,
    detect_cycle,
};
use std::collections::HashSet;

use crate::Context;
use crate::cli::DepsArgs;
use crate::commands::{finish, inventory_path};
use crate::inventory::InventoryProvider;
use crate::ui;

pub fn run(ctx: &Context, args: DepsArgs) -> Result<()> {
    let inventory = InventoryProvider::load(
        &inventory_path(ctx, args.inventory)?,
        LockManager::from_config(&ctx.settings.safety),
    )?;
    let guard = ctx.safeguard();

    let op = OperationContext::for_resource("deps", args.resource.clone());
    let builder = guard
        .graph_builder(&inventory)
        .with_retry(RetryConfig::no_retry());
    let graph = finish(
        guard
            .coordinator()
            .run(&op, || Ok(builder.build(&args.resource)?)),
    )?;

    ui::header(&format!("Dependents of {}", args.resource));
    ui::dim(&format!("from {}", inventory.path().display()));
    println!();
    print_tree(&graph);

    println!();
    match detect_cycle(&graph) {
        CycleCheck::Acyclic => {
            let others = graph.len() - 1;
            if others == 0 {
                ui::success("Nothing depends on it; safe to delete");
            } else {
                ui::warn(&format!(
                    "{others} resource(s) depend on it; delete them first or use --cascade"
                ));
            }
        }
        CycleCheck::CycleFound(path) => {
            let path: Vec<String> = path.iter().map(ToString::to_string).collect();
            ui::error(&format!("Dependency cycle: {}", path.join(" → ")));
            ui::dim("No member of a cycle can be deleted until it is broken by hand");
        }
    }
    Ok(())
}

/// Print the graph as a tree rooted at the target, dependents below.
///
/// A node reached a second time is printed once more and marked, without
/// descending again.
fn print_tree(graph: &DependencyGraph) {
    let mut seen = HashSet::new();
    let mut stack: Vec<(ResourceId, usize)> = vec![(graph.root().clone(), 0)];

    while let Some((id, depth)) = stack.pop() {
        let indent = "  ".repeat(depth + 1);
        if !seen.insert(id.clone()) {
            println!("{indent}{} {}", id.to_string().dimmed(), "(see above)".dimmed());
            continue;
        }
        if depth == 0 {
            println!("{indent}{}", id.to_string().cyan().bold());
        } else {
            println!("{indent}└─ {id}");
        }
        for dependent in graph.dependents_of(&id).into_iter().rev() {
            stack.push((dependent, depth + 1));
        }
    }
}
