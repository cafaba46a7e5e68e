//! `yard apply`

use super::{Workspace, print_result};
use crate::Context;
use crate::cli::ApplyArgs;
use crate::progress::TerminalProgress;
use crate::ui;
use anyhow::Result;
use converge::Engine;

pub fn run(ctx: &Context, args: ApplyArgs) -> Result<bool> {
    let workspace = Workspace::open(ctx, args.state.as_deref())?;
    let resources = workspace.load(&args.file)?;

    if !ctx.quiet {
        ui::header(&format!("Applying {}", args.file.display()));
        ui::kv("resources", &resources.len().to_string());
        ui::kv("state", &workspace.store.path().display().to_string());
        println!();
    }

    let progress = TerminalProgress::new(ctx.quiet);
    let engine = Engine::new(&workspace.registry, &workspace.store)
        .with_options(ctx.config.execute_options(args.jobs))
        .with_progress(&progress)
        .with_cancel(ctx.cancel.clone());

    let result = engine.apply(resources)?;
    print_result(ctx, &result);
    Ok(result.is_success())
}
