//! Resource set files
//!
//! A resource set is a TOML file of already-resolved resources:
//!
//! ```toml
//! [[resource]]
//! type = "file"
//! name = "motd"
//! module = "base"                      # optional, dot-separated
//! depends_on = ["exec.bootstrap"]      # full resource IDs
//!
//! [resource.config]
//! path = "/tmp/yard/motd"
//! content = "hello"
//! ```

use anyhow::{Context, Result, bail};
use converge::{Registry, Resource};
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Valid resource and module segment names
const NAME_PATTERN: &str = r"^[a-zA-Z0-9\-_]+$";

/// Maximum length of a resource name
pub const MAX_NAME_LEN: usize = 128;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResourceSetFile {
    #[serde(default, rename = "resource")]
    resources: Vec<DeclaredResource>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeclaredResource {
    #[serde(rename = "type")]
    resource_type: String,
    name: String,
    #[serde(default)]
    module: String,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    config: toml::Table,
}

/// Load a resource set file and fill in each type's default config
pub fn load(path: &Path, registry: &Registry) -> Result<Vec<Resource>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Could not read resource set {}", path.display()))?;
    parse(&content, &path.display().to_string(), registry)
        .with_context(|| format!("Invalid resource set {}", path.display()))
}

/// Parse resource set content; `source` is recorded on every resource
pub fn parse(content: &str, source: &str, registry: &Registry) -> Result<Vec<Resource>> {
    let file: ResourceSetFile = toml::from_str(content).context("Invalid TOML")?;
    let pattern = Regex::new(NAME_PATTERN).context("Invalid name pattern")?;

    let mut resources = Vec::with_capacity(file.resources.len());
    for declared in file.resources {
        validate_name(&pattern, &declared.name)?;
        if declared.resource_type.is_empty() {
            bail!("Resource '{}' has no type", declared.name);
        }
        if !declared.module.is_empty() {
            for segment in declared.module.split('.') {
                validate_name(&pattern, segment)
                    .with_context(|| format!("Invalid module path '{}'", declared.module))?;
            }
        }
        if !registry.contains(&declared.resource_type) {
            log::warn!(
                "No provider for resource type '{}' ({})",
                declared.resource_type,
                declared.name
            );
        }

        let config = serde_json::to_value(&declared.config)
            .with_context(|| format!("Unsupported config value in '{}'", declared.name))?;

        let mut resource = Resource::new(&declared.resource_type, &declared.name)
            .in_module(&declared.module)
            .with_config(config)
            .with_source_file(source);
        for dep in declared.depends_on {
            resource = resource.depends_on(dep);
        }
        registry.apply_defaults(&mut resource);

        log::trace!("Declared {}", resource.id);
        resources.push(resource);
    }

    log::debug!("Loaded {} resources from {}", resources.len(), source);
    Ok(resources)
}

fn validate_name(pattern: &Regex, name: &str) -> Result<()> {
    if name.len() > MAX_NAME_LEN {
        bail!("Name '{name}' is longer than {MAX_NAME_LEN} characters");
    }
    if !pattern.is_match(name) {
        bail!("Name '{name}' may only contain letters, digits, '-' and '_'");
    }
    Ok(())
}
