//! Terminal progress reporting for engine runs

use colored::Colorize;
use converge::{Outcome, ProgressCallback, ResourceOutcome, RunKind, RunResult};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Progress bar plus one line per finished resource
pub struct TerminalProgress {
    bar: ProgressBar,
}

impl TerminalProgress {
    pub fn new(quiet: bool) -> Self {
        let bar = ProgressBar::new(0);
        if quiet {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        }
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} {prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("=>-"));
        }
        Self { bar }
    }

    fn line(&self, text: String) {
        if !self.bar.is_hidden() {
            self.bar.println(text);
        }
    }
}

impl ProgressCallback for TerminalProgress {
    fn on_run_start(&self, kind: RunKind, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_prefix(kind.to_string());
    }

    fn on_level_start(&self, index: usize, count: usize) {
        self.bar
            .set_message(format!("level {} ({count} resources)", index + 1));
    }

    fn on_resource_start(&self, id: &str) {
        self.bar.set_message(id.to_string());
    }

    fn on_resource_complete(&self, outcome: &ResourceOutcome) {
        self.bar.inc(1);
        self.line(format_outcome(outcome));
    }

    fn on_resource_blocked(&self, id: &str, by: &str) {
        self.bar.inc(1);
        self.line(format!(
            "  {} {} {}",
            "⊘".yellow(),
            id,
            format!("(blocked by {by})").dimmed()
        ));
    }

    fn on_run_complete(&self, _result: &RunResult) {
        self.bar.finish_and_clear();
    }
}

/// One report line for a finished resource
pub fn format_outcome(o: &ResourceOutcome) -> String {
    let symbol = match &o.outcome {
        Outcome::Created | Outcome::Replaced | Outcome::Destroyed => "✓".green(),
        Outcome::Refreshed | Outcome::Absent => "=".dimmed(),
        Outcome::Failed { .. } | Outcome::DestroyFailed { .. } => "✗".red(),
        Outcome::Blocked { .. } | Outcome::Cancelled => "⊘".yellow(),
    };
    let detail = match &o.outcome {
        Outcome::Failed { error } | Outcome::DestroyFailed { error } => error.to_string(),
        Outcome::Blocked { by } => format!("blocked by {by}"),
        other => format!("{} in {:.1}s", other.label(), o.elapsed.as_secs_f64()),
    };
    format!("  {} {} {}", symbol, o.id, format!("({detail})").dimmed())
}
