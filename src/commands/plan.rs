//! `yard plan`

use super::Workspace;
use crate::Context;
use crate::cli::PlanArgs;
use crate::ui;
use anyhow::Result;
use colored::{ColoredString, Colorize};
use converge::{Engine, PlannedAction, PlannedChange};

pub fn run(ctx: &Context, args: PlanArgs) -> Result<bool> {
    let workspace = Workspace::open(ctx, args.state.as_deref())?;
    let resources = workspace.load(&args.file)?;

    let engine = Engine::new(&workspace.registry, &workspace.store).with_cancel(ctx.cancel.clone());
    let plan = engine.plan(resources)?;

    ui::header(&format!("Plan for {}", args.file.display()));
    for change in &plan.changes {
        if !change.action.is_change() && ctx.verbose == 0 {
            continue;
        }
        println!("  {}", format_change(change));
    }

    let summary = plan.summary();
    println!();
    if !plan.has_changes() && summary.unknown == 0 {
        ui::success("No changes. Resources match the resource set.");
        return Ok(true);
    }
    ui::info(&format!(
        "{} to create, {} to replace, {} to remove, {} unchanged",
        summary.create, summary.replace, summary.remove, summary.refresh
    ));
    if summary.unknown > 0 {
        ui::warn(&format!("{} resource(s) could not be diffed", summary.unknown));
    }
    Ok(summary.unknown == 0)
}

fn symbol(action: &PlannedAction) -> ColoredString {
    match action {
        PlannedAction::Create => "+".green(),
        PlannedAction::Replace(_) => "~".yellow(),
        PlannedAction::Refresh => "=".dimmed(),
        PlannedAction::Remove => "-".red(),
        PlannedAction::Unknown { .. } => "?".magenta(),
    }
}

/// One plan line, e.g. `~ file.motd (config changed)`
pub fn format_change(change: &PlannedChange) -> String {
    let detail = match &change.action {
        PlannedAction::Create => "create".to_string(),
        PlannedAction::Replace(reason) => reason.to_string(),
        PlannedAction::Refresh => "unchanged".to_string(),
        PlannedAction::Remove => "no longer declared".to_string(),
        PlannedAction::Unknown { error } => error.to_string(),
    };
    format!(
        "{} {} {}",
        symbol(&change.action),
        change.id,
        format!("({detail})").dimmed()
    )
}
