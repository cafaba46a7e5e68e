//! `file` - a file with literal content

use crate::paths;
use converge::{Provider, ProviderContext, ProviderError, ProviderLogger, Resource};
use serde::Deserialize;
use serde_json::{Value, json};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    path: String,
    #[serde(default)]
    content: String,
}

#[derive(Default)]
pub struct FileProvider {
    path: PathBuf,
    content: String,
    log: Option<ProviderLogger>,
}

impl FileProvider {
    pub fn boxed() -> Box<dyn Provider> {
        Box::new(Self::default())
    }

    fn debug(&self, msg: impl std::fmt::Display) {
        if let Some(log) = &self.log {
            log.debug(msg);
        }
    }
}

impl Provider for FileProvider {
    fn init(&mut self, resource: &Resource, log: ProviderLogger) -> Result<(), ProviderError> {
        let config: FileConfig = serde_json::from_value(resource.config.clone())?;
        self.path = paths::expand(&config.path);
        self.content = config.content;
        self.log = Some(log);
        Ok(())
    }

    fn create(&mut self, _ctx: &ProviderContext) -> Result<(), ProviderError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, &self.content)?;
        self.debug(format_args!("wrote {}", self.path.display()));
        Ok(())
    }

    fn destroy(&mut self, _ctx: &ProviderContext) -> Result<(), ProviderError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                self.debug(format_args!("removed {}", self.path.display()));
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn refresh(&mut self, _ctx: &ProviderContext) -> Result<(), ProviderError> {
        Ok(())
    }

    /// The file was deleted or edited outside yard
    fn changed(&self, _ctx: &ProviderContext) -> Result<bool, ProviderError> {
        match fs::read_to_string(&self.path) {
            Ok(current) => Ok(current != self.content),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    fn lookup(&self, _ctx: &ProviderContext) -> Result<Vec<String>, ProviderError> {
        Ok(vec![self.path.display().to_string()])
    }

    fn outputs(&self) -> Value {
        json!({ "path": self.path.display().to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::testing::Scratch;

    fn provider(scratch: &Scratch, name: &str, content: &str) -> FileProvider {
        let resource = Resource::new("file", name)
            .with_config(json!({ "path": scratch.path(name), "content": content }));
        let mut p = FileProvider::default();
        p.init(&resource, ProviderLogger::new(&resource.id)).unwrap();
        p
    }

    #[test]
    fn test_create_and_destroy() {
        let scratch = Scratch::new();
        let mut p = provider(&scratch, "motd", "hello");
        let ctx = scratch.ctx();

        p.create(&ctx).unwrap();
        assert_eq!(fs::read_to_string(scratch.path("motd")).unwrap(), "hello");
        assert!(!p.changed(&ctx).unwrap());
        assert_eq!(p.outputs()["path"], scratch.path("motd"));

        p.destroy(&ctx).unwrap();
        assert!(!PathBuf::from(scratch.path("motd")).exists());
        // Destroying again is fine
        p.destroy(&ctx).unwrap();
    }

    #[test]
    fn test_external_edit_is_a_change() {
        let scratch = Scratch::new();
        let mut p = provider(&scratch, "motd", "hello");
        let ctx = scratch.ctx();
        p.create(&ctx).unwrap();

        fs::write(scratch.path("motd"), "tampered").unwrap();
        assert!(p.changed(&ctx).unwrap());

        fs::remove_file(scratch.path("motd")).unwrap();
        assert!(p.changed(&ctx).unwrap());
    }

    #[test]
    fn test_missing_path_is_config_error() {
        let resource = Resource::new("file", "bad").with_config(json!({ "content": "x" }));
        let err = FileProvider::default()
            .init(&resource, ProviderLogger::new(&resource.id))
            .unwrap_err();
        assert!(matches!(err, ProviderError::Config(_)));
    }
}
