//! # Converge
//!
//! A resource dependency graph engine.
//!
//! This crate turns a set of declared resources with explicit dependency
//! edges into running state, and re-converges that state idempotently on
//! repeated runs.
//!
//! ## Core Concepts
//!
//! - **Resource**: A declared unit of desired infrastructure with a unique ID
//! - **Provider**: The logic bound to one resource that creates, destroys and
//!   refreshes it against a backend system
//! - **Graph**: Resources plus `depends_on` edges, executed in levels
//! - **StateStore**: Crash-consistent record of what has been applied
//! - **Engine**: Walks the graph, diffs against state and calls providers
//!
//! ## Example
//!
//! ```ignore
//! use converge::{Engine, Registry, Resource, StateStore};
//!
//! let registry = Registry::builder()
//!     .register("container", || Box::new(ContainerProvider::default()))
//!     .build()?;
//! let store = StateStore::open("state.json")?;
//!
//! let resources = vec![
//!     Resource::new("certificate_ca", "root"),
//!     Resource::new("container", "consul").depends_on("certificate_ca.root"),
//! ];
//!
//! let result = Engine::new(&registry, &store).apply(resources)?;
//! if !result.is_success() {
//!     for failed in result.failed() {
//!         eprintln!("{}: {:?}", failed.id, failed.outcome);
//!     }
//! }
//! ```
//!
//! ## Callback Traits
//!
//! - [`ProgressCallback`]: Receives per-level and per-resource progress
//! - [`RetryCallback`]: Notified before a retryable failure is retried
//!
//! Cancellation is a shared [`CancelToken`]; the caller decides what trips it.

pub mod context;
pub mod diff;
pub mod error;
pub mod executor;
pub mod graph;
pub mod provider;
pub mod resource;
pub mod retry;
pub mod state;
pub mod types;

// Re-export main types at crate root
pub use context::{CancelToken, NoProgress, ProgressCallback, ProviderContext, ProviderLogger};
pub use diff::{
    Action, ChangeReason, DiffSummary, Plan, PlannedAction, PlannedChange, config_hash,
};
pub use error::{
    Error, ErrorClass, GraphError, ProviderError, RegistryError, ResourceError, Result, StateError,
};
pub use executor::Engine;
pub use graph::Graph;
pub use provider::{Provider, ProviderFactory, ProviderType, Registry, RegistryBuilder};
pub use resource::{Resource, compose_id};
pub use retry::{RetryCallback, RetryConfig, with_retry};
pub use state::{STATE_VERSION, State, StateEntry, StateStore};
pub use types::{
    ExecuteOptions, Operation, Outcome, ResourceOutcome, RunKind, RunResult, RunSummary, Status,
};
