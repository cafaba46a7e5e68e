//! Built-in providers
//!
//! Every resource type the binary understands is registered here, once, and
//! the resulting registry is passed into the engine.

pub mod copy;
pub mod exec;
pub mod file;
pub mod health_check;

use converge::{ProviderType, Registry, RegistryError};
use serde_json::json;

/// Build the registry of built-in types
///
/// `serial_types` come from `yard.toml` and may name any registered type.
pub fn registry(serial_types: &[String]) -> Result<Registry, RegistryError> {
    let mut builder = Registry::builder()
        .register_type(ProviderType::new("file", file::FileProvider::boxed))
        .register_type(ProviderType::new("copy", copy::CopyProvider::boxed))
        .register_type(
            ProviderType::new("exec", exec::ExecProvider::boxed).with_defaults(json!({
                "args": [],
                "environment": {},
            })),
        )
        .register_type(
            ProviderType::new("health_check", health_check::HealthCheckProvider::boxed)
                .with_defaults(json!({
                    "timeout_secs": health_check::DEFAULT_TIMEOUT_SECS,
                    "interval_ms": health_check::DEFAULT_INTERVAL_MS,
                })),
        );

    for t in serial_types {
        builder = builder.serial(t);
    }
    builder.build()
}
