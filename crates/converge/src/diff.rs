//! Change detection between declared resources and persisted state
//!
//! A resource with a state entry is changed when the structural hash of its
//! declared config differs from the stored hash, or when its provider reports
//! that external content drifted. Upstream outputs are never consulted, so a
//! replaced dependency does not cascade into its dependents.

use crate::context::{CancelToken, ProviderContext, ProviderLogger};
use crate::error::{ProviderError, ResourceError};
use crate::graph::Graph;
use crate::provider::{Provider, Registry};
use crate::resource::Resource;
use crate::state::{StateEntry, StateStore};
use crate::types::Operation;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

/// Prefix of every config hash
pub const HASH_PREFIX: &str = "b3:";

/// Stable structural hash of a config value
///
/// Object keys are sorted recursively before hashing, so two configs that
/// differ only in key order hash identically.
pub fn config_hash(config: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(config, &mut canonical);
    format!("{HASH_PREFIX}{}", blake3::hash(canonical.as_bytes()).to_hex())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::from(key.as_str()).to_string());
                out.push(':');
                if let Some(v) = map.get(key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Why an existing resource must be replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    /// Declared config hash differs from the stored one
    ConfigChanged,
    /// The provider reported drift in external content
    ContentChanged,
}

impl fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigChanged => f.write_str("config changed"),
            Self::ContentChanged => f.write_str("content changed"),
        }
    }
}

/// What the executor must do for one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// No state entry: create
    Create,
    /// Changed: destroy, then create
    Replace(ChangeReason),
    /// Unchanged: refresh computed fields
    Refresh,
}

/// Decide the action for a resource whose provider is already initialized
///
/// The provider is only consulted when the config hash matches.
pub fn decide(
    resource: &Resource,
    entry: Option<&StateEntry>,
    provider: &dyn Provider,
    ctx: &ProviderContext,
) -> Result<Action, ProviderError> {
    let Some(entry) = entry else {
        return Ok(Action::Create);
    };

    if config_hash(&resource.config) != entry.config_hash {
        return Ok(Action::Replace(ChangeReason::ConfigChanged));
    }

    if provider.changed(ctx)? {
        return Ok(Action::Replace(ChangeReason::ContentChanged));
    }

    Ok(Action::Refresh)
}

/// Copy persisted checksum and outputs onto a declared resource
///
/// Providers compare the previous checksum in `changed()` and may reuse the
/// previous outputs in `refresh()`.
pub(crate) fn hydrate(resource: &Resource, entry: Option<&StateEntry>) -> Resource {
    let mut resource = resource.clone();
    if let Some(entry) = entry {
        resource.checksum = entry.checksum.clone();
        resource.outputs = entry.outputs.clone();
    }
    resource
}

// ============================================================================
// Plan
// ============================================================================

/// Previewed action for one resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedAction {
    Create,
    Replace(ChangeReason),
    Refresh,
    /// In state but no longer declared
    Remove,
    /// The provider could not be resolved or initialized, or its change
    /// check failed
    Unknown { error: ResourceError },
}

impl PlannedAction {
    pub fn is_change(&self) -> bool {
        !matches!(self, Self::Refresh)
    }
}

impl From<Action> for PlannedAction {
    fn from(action: Action) -> Self {
        match action {
            Action::Create => Self::Create,
            Action::Replace(reason) => Self::Replace(reason),
            Action::Refresh => Self::Refresh,
        }
    }
}

/// Planned change for one resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedChange {
    pub id: String,
    pub resource_type: String,
    pub action: PlannedAction,
}

/// Counts of planned actions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffSummary {
    pub create: usize,
    pub replace: usize,
    pub refresh: usize,
    pub remove: usize,
    pub unknown: usize,
}

impl DiffSummary {
    pub fn total_changes(&self) -> usize {
        self.create + self.replace + self.remove
    }
}

/// Ordered preview of what an apply would do
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// Declared resources in level order, then orphaned state entries
    pub changes: Vec<PlannedChange>,
}

impl Plan {
    pub fn summary(&self) -> DiffSummary {
        let mut summary = DiffSummary::default();
        for change in &self.changes {
            match change.action {
                PlannedAction::Create => summary.create += 1,
                PlannedAction::Replace(_) => summary.replace += 1,
                PlannedAction::Refresh => summary.refresh += 1,
                PlannedAction::Remove => summary.remove += 1,
                PlannedAction::Unknown { .. } => summary.unknown += 1,
            }
        }
        summary
    }

    pub fn has_changes(&self) -> bool {
        self.changes.iter().any(|c| c.action.is_change())
    }

    pub fn get(&self, id: &str) -> Option<&PlannedAction> {
        self.changes.iter().find(|c| c.id == id).map(|c| &c.action)
    }
}

/// Preview an apply of `graph` against the stored state
///
/// Providers are initialized and asked `changed()`; no lifecycle call that
/// touches the managed system is made.
pub fn plan(graph: &Graph, store: &StateStore, registry: &Registry, cancel: &CancelToken) -> Plan {
    let ctx = ProviderContext::new(cancel, store);
    let mut changes = Vec::with_capacity(graph.len());

    for id in graph.levels().into_iter().flatten() {
        let Some(declared) = graph.get(&id) else {
            continue;
        };
        let entry = store.find_by_id(&id);
        let action = match plan_one(declared, entry.as_ref(), registry, &ctx) {
            Ok(action) => action.into(),
            Err(error) => PlannedAction::Unknown { error },
        };
        changes.push(PlannedChange {
            id,
            resource_type: declared.resource_type.clone(),
            action,
        });
    }

    let declared: BTreeSet<&str> = graph.ids().collect();
    for entry in store.snapshot().resources.iter().rev() {
        if !declared.contains(entry.id.as_str()) {
            changes.push(PlannedChange {
                id: entry.id.clone(),
                resource_type: entry.resource_type.clone(),
                action: PlannedAction::Remove,
            });
        }
    }

    Plan { changes }
}

fn plan_one(
    declared: &Resource,
    entry: Option<&StateEntry>,
    registry: &Registry,
    ctx: &ProviderContext,
) -> Result<Action, ResourceError> {
    let resource = hydrate(declared, entry);
    let mut provider = registry
        .resolve(&resource)
        .map_err(|e| ResourceError::new(Operation::Init, e))?;
    provider
        .init(&resource, ProviderLogger::new(&resource.id))
        .map_err(|e| ResourceError::new(Operation::Init, e))?;
    decide(&resource, entry, provider.as_ref(), ctx)
        .map_err(|e| ResourceError::new(Operation::Diff, e))
}
