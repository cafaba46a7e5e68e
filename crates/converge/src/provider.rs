//! Provider capability trait and the type registry
//!
//! A [`Provider`] is the executable logic bound to one resource instance.
//! The [`Registry`] maps a resource type name to the factory producing
//! providers for that type, built once at startup and passed by reference
//! into the engine.

use crate::context::{ProviderContext, ProviderLogger};
use crate::error::{ProviderError, RegistryError};
use crate::resource::Resource;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Lifecycle operations for one resource instance
///
/// The engine instantiates a fresh provider per resource and per run, and
/// always calls [`Provider::init`] before any other method.
pub trait Provider: Send {
    /// Bind the provider to a resource and its resolved config
    fn init(&mut self, resource: &Resource, log: ProviderLogger) -> Result<(), ProviderError>;

    /// Bring the resource into existence
    fn create(&mut self, ctx: &ProviderContext) -> Result<(), ProviderError>;

    /// Tear the resource down
    fn destroy(&mut self, ctx: &ProviderContext) -> Result<(), ProviderError>;

    /// Re-derive computed fields of an unchanged resource without side effects
    fn refresh(&mut self, ctx: &ProviderContext) -> Result<(), ProviderError>;

    /// Whether external content the engine cannot see has drifted
    fn changed(&self, ctx: &ProviderContext) -> Result<bool, ProviderError>;

    /// Identifiers of the backend objects realizing this resource
    fn lookup(&self, ctx: &ProviderContext) -> Result<Vec<String>, ProviderError>;

    /// Computed fields to persist after a successful create or refresh
    fn outputs(&self) -> Value {
        Value::Null
    }

    /// Content checksum to persist for drift detection
    fn checksum(&self) -> Option<String> {
        None
    }

    /// Non-graceful teardown, tried once after `destroy` fails in forced mode
    fn force_destroy(&mut self, ctx: &ProviderContext) -> Result<(), ProviderError> {
        self.destroy(ctx)
    }
}

/// Factory producing an uninitialized provider
pub type ProviderFactory = Box<dyn Fn() -> Box<dyn Provider> + Send + Sync>;

/// Registration of one resource type
pub struct ProviderType {
    name: String,
    defaults: Value,
    factory: ProviderFactory,
    serial: bool,
}

impl ProviderType {
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Provider> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            defaults: Value::Null,
            factory: Box::new(factory),
            serial: false,
        }
    }

    /// Zero-value config merged under every declared resource of this type
    pub fn with_defaults(mut self, defaults: Value) -> Self {
        self.defaults = defaults;
        self
    }

    /// Run resources of this type one at a time within a level
    pub fn serial(mut self) -> Self {
        self.serial = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderType")
            .field("name", &self.name)
            .field("defaults", &self.defaults)
            .field("serial", &self.serial)
            .finish_non_exhaustive()
    }
}

/// Resource type name → provider factory
#[derive(Debug, Default)]
pub struct Registry {
    types: BTreeMap<String, ProviderType>,
}

impl Registry {
    /// Build a registry from the full set of known types
    pub fn new(types: impl IntoIterator<Item = ProviderType>) -> Result<Self, RegistryError> {
        let mut map = BTreeMap::new();
        for t in types {
            if map.contains_key(&t.name) {
                return Err(RegistryError::Duplicate(t.name));
            }
            map.insert(t.name.clone(), t);
        }
        log::debug!("Provider registry: {} types", map.len());
        Ok(Self { types: map })
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Instantiate an uninitialized provider for a resource
    pub fn resolve(&self, resource: &Resource) -> Result<Box<dyn Provider>, ProviderError> {
        self.types
            .get(&resource.resource_type)
            .map(|t| (t.factory)())
            .ok_or_else(|| ProviderError::UnknownType(resource.resource_type.clone()))
    }

    pub fn contains(&self, resource_type: &str) -> bool {
        self.types.contains_key(resource_type)
    }

    /// Whether resources of this type must not run concurrently
    pub fn is_serial(&self, resource_type: &str) -> bool {
        self.types.get(resource_type).is_some_and(|t| t.serial)
    }

    pub fn defaults(&self, resource_type: &str) -> Option<&Value> {
        self.types
            .get(resource_type)
            .map(|t| &t.defaults)
            .filter(|v| !v.is_null())
    }

    /// Fill config keys the resource does not declare from the type's defaults
    pub fn apply_defaults(&self, resource: &mut Resource) {
        let Some(Value::Object(defaults)) = self.defaults(&resource.resource_type) else {
            return;
        };

        if resource.config.is_null() {
            resource.config = Value::Object(serde_json::Map::new());
        }
        if let Value::Object(config) = &mut resource.config {
            for (key, value) in defaults {
                config.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
    }

    /// Registered type names, sorted
    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }
}

/// Incremental [`Registry`] construction
#[derive(Default)]
pub struct RegistryBuilder {
    types: Vec<ProviderType>,
    serial: BTreeSet<String>,
}

impl RegistryBuilder {
    pub fn register<F>(self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Provider> + Send + Sync + 'static,
    {
        self.register_type(ProviderType::new(name, factory))
    }

    pub fn register_type(mut self, provider_type: ProviderType) -> Self {
        self.types.push(provider_type);
        self
    }

    /// Flag a type as serial; applied at build time
    pub fn serial(mut self, name: impl Into<String>) -> Self {
        self.serial.insert(name.into());
        self
    }

    pub fn build(self) -> Result<Registry, RegistryError> {
        let mut registry = Registry::new(self.types)?;
        for name in &self.serial {
            match registry.types.get_mut(name) {
                Some(t) => t.serial = true,
                None => log::warn!("Serial hint for unregistered resource type '{name}'"),
            }
        }
        Ok(registry)
    }
}
