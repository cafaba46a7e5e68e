//! Core types for convergence runs

use crate::error::ResourceError;
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Per-run status of a declared resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Not executed yet
    #[default]
    Pending,
    /// Created, replaced or refreshed successfully
    Created,
    /// The resource's own operation failed
    Failed,
    /// Skipped because an ancestor failed
    Blocked,
}

/// Provider lifecycle operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Init,
    Diff,
    Create,
    Destroy,
    Refresh,
    Lookup,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Diff => "diff",
            Self::Create => "create",
            Self::Destroy => "destroy",
            Self::Refresh => "refresh",
            Self::Lookup => "lookup",
        };
        f.write_str(name)
    }
}

/// Kind of engine run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Apply,
    Destroy,
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Apply => f.write_str("apply"),
            Self::Destroy => f.write_str("destroy"),
        }
    }
}

/// Result of running one resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// No prior state; created
    Created,
    /// Declared config or external content drifted; destroyed and re-created
    Replaced,
    /// Unchanged; refreshed in place
    Refreshed,
    /// The resource's own operation failed
    Failed { error: ResourceError },
    /// Not executed because the named ancestor failed
    Blocked { by: String },
    /// Torn down and removed from state
    Destroyed,
    /// Teardown failed; the state entry is kept
    DestroyFailed { error: ResourceError },
    /// Nothing to destroy (no state entry)
    Absent,
    /// Not started, or aborted, because the run was cancelled
    Cancelled,
}

impl Outcome {
    /// Check if the outcome counts as success for the aggregate status
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Created | Self::Replaced | Self::Refreshed | Self::Destroyed | Self::Absent
        )
    }

    /// Check if the outcome represents a change to the managed system
    pub fn is_change(&self) -> bool {
        matches!(self, Self::Created | Self::Replaced | Self::Destroyed)
    }

    /// Resource status implied by this outcome
    pub fn status(&self) -> Status {
        match self {
            Self::Created | Self::Replaced | Self::Refreshed => Status::Created,
            Self::Failed { .. } | Self::DestroyFailed { .. } => Status::Failed,
            Self::Blocked { .. } => Status::Blocked,
            Self::Destroyed | Self::Absent | Self::Cancelled => Status::Pending,
        }
    }

    /// Short lowercase label for reports
    pub fn label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Replaced => "replaced",
            Self::Refreshed => "refreshed",
            Self::Failed { .. } => "failed",
            Self::Blocked { .. } => "blocked",
            Self::Destroyed => "destroyed",
            Self::DestroyFailed { .. } => "destroy failed",
            Self::Absent => "absent",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Outcome of one resource within a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceOutcome {
    pub id: String,
    pub resource_type: String,
    pub outcome: Outcome,
    pub elapsed: Duration,
}

/// Counts of outcomes in a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub created: usize,
    pub replaced: usize,
    pub refreshed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub destroyed: usize,
    pub destroy_failed: usize,
    pub absent: usize,
    pub cancelled: usize,
}

impl RunSummary {
    /// Total number of actual changes made
    pub fn total_changes(&self) -> usize {
        self.created + self.replaced + self.destroyed
    }

    /// Check if execution was fully successful
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.blocked == 0 && self.destroy_failed == 0 && self.cancelled == 0
    }

    /// Total number of resources processed
    pub fn total(&self) -> usize {
        self.created
            + self.replaced
            + self.refreshed
            + self.failed
            + self.blocked
            + self.destroyed
            + self.destroy_failed
            + self.absent
            + self.cancelled
    }

    /// Merge another summary into this one
    pub fn merge(&mut self, other: &RunSummary) {
        self.created += other.created;
        self.replaced += other.replaced;
        self.refreshed += other.refreshed;
        self.failed += other.failed;
        self.blocked += other.blocked;
        self.destroyed += other.destroyed;
        self.destroy_failed += other.destroy_failed;
        self.absent += other.absent;
        self.cancelled += other.cancelled;
    }

    /// Add an outcome to the summary
    pub fn add_outcome(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Created => self.created += 1,
            Outcome::Replaced => self.replaced += 1,
            Outcome::Refreshed => self.refreshed += 1,
            Outcome::Failed { .. } => self.failed += 1,
            Outcome::Blocked { .. } => self.blocked += 1,
            Outcome::Destroyed => self.destroyed += 1,
            Outcome::DestroyFailed { .. } => self.destroy_failed += 1,
            Outcome::Absent => self.absent += 1,
            Outcome::Cancelled => self.cancelled += 1,
        }
    }
}

/// Per-resource outcomes of a run, in execution order
#[derive(Debug, Clone)]
pub struct RunResult {
    pub kind: RunKind,
    pub outcomes: Vec<ResourceOutcome>,
    /// Whether the run observed the cancellation signal
    pub cancelled: bool,
}

impl RunResult {
    pub fn new(kind: RunKind) -> Self {
        Self {
            kind,
            outcomes: Vec::new(),
            cancelled: false,
        }
    }

    /// Aggregate status: false if any resource failed, is blocked, or was
    /// cancelled
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.outcomes.iter().all(|o| o.outcome.is_success())
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary::default();
        for o in &self.outcomes {
            summary.add_outcome(&o.outcome);
        }
        summary
    }

    /// Find the outcome of a resource by ID
    pub fn get(&self, id: &str) -> Option<&Outcome> {
        self.outcomes.iter().find(|o| o.id == id).map(|o| &o.outcome)
    }

    /// Resources whose own operation failed
    pub fn failed(&self) -> impl Iterator<Item = &ResourceOutcome> {
        self.outcomes.iter().filter(|o| {
            matches!(
                o.outcome,
                Outcome::Failed { .. } | Outcome::DestroyFailed { .. }
            )
        })
    }

    /// Resources skipped because of a failed ancestor
    pub fn blocked(&self) -> impl Iterator<Item = &ResourceOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.outcome, Outcome::Blocked { .. }))
    }

    pub(crate) fn push(&mut self, outcome: ResourceOutcome) {
        self.outcomes.push(outcome);
    }
}

/// Options for execution
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Number of worker threads per level
    pub jobs: usize,
    /// Retry policy for retryable provider errors
    pub retry: RetryConfig,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            jobs: 4,
            retry: RetryConfig::default(),
        }
    }
}
