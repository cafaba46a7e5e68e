//! Declared resource record
//!
//! A Resource is a desired unit of infrastructure handed to the engine by
//! the parser, with its dependency edges already resolved.

use crate::types::Status;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// A declared resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Globally unique ID: `[module.<path>.]<type>.<name>`
    pub id: String,
    /// Resource name within its module
    pub name: String,
    /// Resource kind, used to resolve a provider
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Dot-separated module path; empty for top-level resources
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub module: String,
    /// File the resource was declared in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    /// IDs of resources this one depends on
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<String>,
    /// Type-specific attribute bag, opaque to the engine
    #[serde(default)]
    pub config: Value,
    /// Computed fields written by the bound provider
    #[serde(default)]
    pub outputs: Value,
    /// Content-derived checksum for drift detection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Per-run status; never persisted
    #[serde(skip)]
    pub status: Status,
}

impl Resource {
    /// Create a top-level resource with an empty config
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        let resource_type = resource_type.into();
        let name = name.into();
        Self {
            id: compose_id("", &resource_type, &name),
            name,
            resource_type,
            module: String::new(),
            source_file: None,
            depends_on: BTreeSet::new(),
            config: Value::Null,
            outputs: Value::Null,
            checksum: None,
            status: Status::Pending,
        }
    }

    /// Place the resource in a module, recomputing its ID
    pub fn in_module(mut self, module: impl Into<String>) -> Self {
        self.module = module.into();
        self.id = compose_id(&self.module, &self.resource_type, &self.name);
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_source_file(mut self, file: impl Into<String>) -> Self {
        self.source_file = Some(file.into());
        self
    }

    /// Add a dependency edge to another resource ID
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    /// Look up a config attribute by key
    pub fn config_value(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }

    /// Look up a string config attribute by key
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }
}

/// Compose a resource ID from module path, type and name
///
/// - `("", "container", "consul")` → `container.consul`
/// - `("network", "container", "consul")` → `module.network.container.consul`
pub fn compose_id(module: &str, resource_type: &str, name: &str) -> String {
    if module.is_empty() {
        format!("{resource_type}.{name}")
    } else {
        format!("module.{module}.{resource_type}.{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_compose_id() {
        assert_eq!(compose_id("", "container", "consul"), "container.consul");
        assert_eq!(
            compose_id("network", "container", "consul"),
            "module.network.container.consul"
        );
        assert_eq!(
            compose_id("a.b", "certificate_leaf", "leaf"),
            "module.a.b.certificate_leaf.leaf"
        );
    }

    #[test]
    fn test_builder() {
        let r = Resource::new("container", "consul")
            .in_module("network")
            .with_config(json!({"image": "consul:1.16"}))
            .depends_on("module.network.certificate_leaf.leaf");

        assert_eq!(r.id, "module.network.container.consul");
        assert_eq!(r.config_str("image"), Some("consul:1.16"));
        assert!(r.depends_on.contains("module.network.certificate_leaf.leaf"));
        assert_eq!(r.status, Status::Pending);
    }

    #[test]
    fn test_status_not_serialized() {
        let mut r = Resource::new("copy", "files");
        r.status = Status::Failed;
        let json = serde_json::to_value(&r).unwrap();
        assert!(json.get("status").is_none());
        assert_eq!(json["type"], "copy");
    }
}
