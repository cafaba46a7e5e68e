//! `copy` - copy a file or directory tree to a destination
//!
//! The source's content hash is recorded as the resource checksum, so edits
//! to the source between runs replace the copy even when the declared config
//! is unchanged.

use crate::paths;
use converge::{Provider, ProviderContext, ProviderError, ProviderLogger, Resource};
use serde::Deserialize;
use serde_json::{Value, json};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CopyConfig {
    source: String,
    destination: String,
}

#[derive(Default)]
pub struct CopyProvider {
    source: PathBuf,
    destination: PathBuf,
    /// Source hash recorded by the last successful create
    checksum: Option<String>,
    log: Option<ProviderLogger>,
}

impl CopyProvider {
    pub fn boxed() -> Box<dyn Provider> {
        Box::new(Self::default())
    }

    /// Hash the source; a missing source may still be produced upstream
    fn source_hash(&self) -> Result<String, ProviderError> {
        match dirhash::hash_path(&self.source) {
            Ok(hash) => Ok(hash),
            Err(dirhash::Error::PathNotFound(path)) => Err(ProviderError::retryable(format!(
                "source {} does not exist",
                path.display()
            ))),
            Err(e) => Err(ProviderError::failed(e)),
        }
    }

    fn remove_destination(&self) -> std::io::Result<()> {
        let result = if self.destination.is_dir() {
            fs::remove_dir_all(&self.destination)
        } else {
            fs::remove_file(&self.destination)
        };
        match result {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

impl Provider for CopyProvider {
    fn init(&mut self, resource: &Resource, log: ProviderLogger) -> Result<(), ProviderError> {
        let config: CopyConfig = serde_json::from_value(resource.config.clone())?;
        self.source = paths::expand(&config.source);
        self.destination = paths::expand(&config.destination);
        self.checksum = resource.checksum.clone();
        self.log = Some(log);
        Ok(())
    }

    fn create(&mut self, ctx: &ProviderContext) -> Result<(), ProviderError> {
        let hash = self.source_hash()?;
        self.remove_destination()?;

        if self.source.is_dir() {
            copy_tree(&self.source, &self.destination, ctx)?;
        } else {
            if let Some(parent) = self.destination.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&self.source, &self.destination)?;
        }

        if let Some(log) = &self.log {
            log.info(format_args!(
                "copied {} -> {} ({hash})",
                self.source.display(),
                self.destination.display()
            ));
        }
        self.checksum = Some(hash);
        Ok(())
    }

    fn destroy(&mut self, _ctx: &ProviderContext) -> Result<(), ProviderError> {
        self.remove_destination()?;
        Ok(())
    }

    fn refresh(&mut self, _ctx: &ProviderContext) -> Result<(), ProviderError> {
        Ok(())
    }

    fn changed(&self, _ctx: &ProviderContext) -> Result<bool, ProviderError> {
        if !self.destination.exists() {
            return Ok(true);
        }
        let current = self.source_hash()?;
        Ok(self.checksum.as_deref() != Some(current.as_str()))
    }

    fn lookup(&self, _ctx: &ProviderContext) -> Result<Vec<String>, ProviderError> {
        Ok(vec![self.destination.display().to_string()])
    }

    fn outputs(&self) -> Value {
        json!({
            "destination": self.destination.display().to_string(),
            "checksum": self.checksum,
        })
    }

    fn checksum(&self) -> Option<String> {
        self.checksum.clone()
    }
}

/// Recursively copy a directory, checking for cancellation between entries
fn copy_tree(source: &Path, destination: &Path, ctx: &ProviderContext) -> Result<(), ProviderError> {
    for entry in WalkDir::new(source).follow_links(false) {
        ctx.check_cancelled()?;
        let entry = entry.map_err(ProviderError::failed)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(ProviderError::failed)?;
        let target = destination.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target)?;
        } else {
            log::debug!("Skipping special file {}", entry.path().display());
        }
    }
    Ok(())
}
