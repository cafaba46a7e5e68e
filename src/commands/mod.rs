//! Command implementations
//!
//! Every command returns `Ok(true)` when the run fully succeeded; `main`
//! turns `Ok(false)` into a non-zero exit status.

pub mod apply;
pub mod destroy;
pub mod plan;
pub mod state;

use crate::Context;
use crate::providers;
use crate::resource_set;
use crate::ui;
use anyhow::{Context as AnyhowContext, Result};
use colored::Colorize;
use converge::{Registry, Resource, RunResult, StateStore};
use std::path::Path;

/// Registry and state store shared by every command
pub struct Workspace {
    pub registry: Registry,
    pub store: StateStore,
}

impl Workspace {
    pub fn open(ctx: &Context, state_override: Option<&Path>) -> Result<Self> {
        let registry = providers::registry(&ctx.config.serial_types)
            .context("Invalid serial_types in config")?;
        let state_path = ctx.config.state_path(state_override)?;
        let store = StateStore::open(&state_path)?;
        log::debug!("Using state file {}", state_path.display());
        Ok(Self { registry, store })
    }

    pub fn load(&self, file: &Path) -> Result<Vec<Resource>> {
        resource_set::load(file, &self.registry)
    }
}

/// Print the end-of-run summary and any failures
pub fn print_result(ctx: &Context, result: &RunResult) {
    let summary = result.summary();

    let failures: Vec<_> = result.failed().collect();
    if !failures.is_empty() {
        ui::section("Failures");
        for o in &failures {
            println!("  {} {}: {}", "✗".red(), o.id, o.outcome.label());
            if let converge::Outcome::Failed { error } | converge::Outcome::DestroyFailed { error } =
                &o.outcome
            {
                ui::dim(&error.to_string());
            }
        }
    }

    if ctx.verbose > 0 {
        for o in result.blocked() {
            ui::dim(&format!("{} skipped ({})", o.id, o.outcome.label()));
        }
    }

    let elapsed = result
        .outcomes
        .iter()
        .map(|o| o.elapsed)
        .max()
        .unwrap_or_default();

    let mut parts = Vec::new();
    for (count, label) in [
        (summary.created, "created"),
        (summary.replaced, "replaced"),
        (summary.refreshed, "unchanged"),
        (summary.destroyed, "destroyed"),
        (summary.absent, "absent"),
        (summary.failed + summary.destroy_failed, "failed"),
        (summary.blocked, "blocked"),
        (summary.cancelled, "cancelled"),
    ] {
        if count > 0 {
            parts.push(format!("{count} {label}"));
        }
    }
    let line = if parts.is_empty() {
        "Nothing to do".to_string()
    } else {
        parts.join(", ")
    };

    println!();
    if result.cancelled {
        ui::warn(&format!("Interrupted: {line}"));
    } else if result.is_success() {
        ui::success(&format!("{} complete: {line}", result.kind));
    } else {
        ui::error(&format!("{} finished with errors: {line}", result.kind));
    }
    if ctx.verbose > 0 {
        ui::dim(&format!("slowest resource took {}", ui::format_duration(elapsed)));
    }
}
