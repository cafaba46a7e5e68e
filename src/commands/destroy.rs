//! `yard destroy`

use super::{Workspace, print_result};
use crate::Context;
use crate::cli::DestroyArgs;
use crate::progress::TerminalProgress;
use crate::ui;
use anyhow::Result;
use converge::Engine;

pub fn run(ctx: &Context, args: DestroyArgs) -> Result<bool> {
    let workspace = Workspace::open(ctx, args.state.as_deref())?;
    let resources = workspace.load(&args.file)?;

    let applied = workspace.store.snapshot().len();
    if applied == 0 {
        ui::info("State is empty, nothing to destroy");
        return Ok(true);
    }

    if !args.yes {
        ui::warn(&format!(
            "This tears down {applied} applied resource(s) recorded in {}",
            workspace.store.path().display()
        ));
        if args.force {
            ui::dim("--force: failed destroys are retried with the non-graceful strategy");
        }
        if !ui::confirm("Continue?", false)? {
            ui::info("Aborted");
            return Ok(true);
        }
    }

    let progress = TerminalProgress::new(ctx.quiet);
    let engine = Engine::new(&workspace.registry, &workspace.store)
        .with_options(ctx.config.execute_options(args.jobs))
        .with_progress(&progress)
        .with_cancel(ctx.cancel.clone());

    let result = engine.destroy(resources, args.force)?;
    print_result(ctx, &result);
    Ok(result.is_success())
}
