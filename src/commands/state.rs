//! `yard state list|show`

use super::Workspace;
use crate::Context;
use crate::cli::StateCommand;
use crate::ui;
use anyhow::{Result, bail};
use colored::Colorize;
use converge::Engine;

pub fn run(ctx: &Context, cmd: StateCommand) -> Result<bool> {
    match cmd {
        StateCommand::List { state } => list(ctx, &Workspace::open(ctx, state.as_deref())?),
        StateCommand::Show { id, state } => show(ctx, &Workspace::open(ctx, state.as_deref())?, &id),
    }
}

fn list(ctx: &Context, workspace: &Workspace) -> Result<bool> {
    let state = workspace.store.snapshot();
    if state.is_empty() {
        ui::info(&format!(
            "No resources in {}",
            workspace.store.path().display()
        ));
        return Ok(true);
    }

    ui::header(&format!("{} applied resource(s)", state.len()));
    for entry in &state.resources {
        let applied = entry.applied_at.format("%Y-%m-%d %H:%M:%S").to_string();
        println!("  {} {}", entry.id.bold(), applied.dimmed());
        if ctx.verbose > 0 && !entry.depends_on.is_empty() {
            let deps: Vec<&str> = entry.depends_on.iter().map(String::as_str).collect();
            ui::dim(&format!("depends on {}", deps.join(", ")));
        }
    }
    if let Some(kind) = state.last_run {
        println!();
        ui::dim(&format!(
            "last {kind} at {}",
            state.last_updated.format("%Y-%m-%d %H:%M:%S")
        ));
    }
    Ok(true)
}

fn show(ctx: &Context, workspace: &Workspace, id: &str) -> Result<bool> {
    let Some(entry) = workspace.store.find_by_id(id) else {
        bail!("No resource '{id}' in {}", workspace.store.path().display());
    };

    ui::header(&entry.id);
    ui::kv("type", &entry.resource_type);
    ui::kv("name", &entry.name);
    if !entry.module.is_empty() {
        ui::kv("module", &entry.module);
    }
    if let Some(source) = &entry.source_file {
        ui::kv("source", source);
    }
    ui::kv("applied", &entry.applied_at.to_rfc3339());
    ui::kv("config hash", &entry.config_hash);
    if let Some(checksum) = &entry.checksum {
        ui::kv("checksum", checksum);
    }

    ui::section("Config");
    println!("{}", serde_json::to_string_pretty(&entry.config)?);
    if !entry.outputs.is_null() {
        ui::section("Outputs");
        println!("{}", serde_json::to_string_pretty(&entry.outputs)?);
    }

    let engine = Engine::new(&workspace.registry, &workspace.store).with_cancel(ctx.cancel.clone());
    match engine.lookup(&entry.to_resource()) {
        Ok(handles) => {
            ui::section("Handles");
            for handle in handles {
                println!("  {handle}");
            }
        }
        Err(e) => ui::warn(&format!("Lookup failed: {e}")),
    }
    Ok(true)
}
