//! Where yard keeps its config and state
//!
//! Each directory is resolved from, in order: its `YARD_*` override, the
//! matching XDG base directory, then a default under `$HOME`.
//!
//! | dir    | override          | XDG               | default               |
//! |--------|-------------------|-------------------|-----------------------|
//! | config | `YARD_CONFIG_DIR` | `XDG_CONFIG_HOME` | `~/.config/yard`      |
//! | state  | `YARD_STATE_DIR`  | `XDG_STATE_HOME`  | `~/.local/state/yard` |

use anyhow::{Context, Result};
use std::borrow::Cow;
use std::env;
use std::path::PathBuf;

pub const ENV_CONFIG_DIR: &str = "YARD_CONFIG_DIR";
pub const ENV_STATE_DIR: &str = "YARD_STATE_DIR";

pub const CONFIG_FILE: &str = "yard.toml";
pub const STATE_FILE: &str = "state.json";

/// One of yard's base directories
struct BaseDir {
    override_var: &'static str,
    xdg_var: &'static str,
    home_relative: &'static [&'static str],
}

const CONFIG: BaseDir = BaseDir {
    override_var: ENV_CONFIG_DIR,
    xdg_var: "XDG_CONFIG_HOME",
    home_relative: &[".config"],
};

const STATE: BaseDir = BaseDir {
    override_var: ENV_STATE_DIR,
    xdg_var: "XDG_STATE_HOME",
    home_relative: &[".local", "state"],
};

impl BaseDir {
    fn resolve(&self) -> Result<PathBuf> {
        if let Ok(dir) = env::var(self.override_var) {
            let path = expand(&dir);
            log::debug!("{} = {}", self.override_var, path.display());
            return Ok(path);
        }
        if let Ok(base) = env::var(self.xdg_var) {
            return Ok(PathBuf::from(base).join("yard"));
        }

        let mut path = dirs::home_dir().context("Could not determine home directory")?;
        path.extend(self.home_relative);
        Ok(path.join("yard"))
    }
}

pub fn config_dir() -> Result<PathBuf> {
    CONFIG.resolve()
}

pub fn state_dir() -> Result<PathBuf> {
    STATE.resolve()
}

/// Default `yard.toml` location
pub fn config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE))
}

/// Default state file location
pub fn state_file() -> Result<PathBuf> {
    Ok(state_dir()?.join(STATE_FILE))
}

/// Expand `~` and `$VARS`; unknown variables are left as written
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}
