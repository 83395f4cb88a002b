//! Directory layout for vch-portlayer.
//!
//! Resolves the standard directories with XDG conventions:
//!
//! - Config:  `$XDG_CONFIG_HOME/vch-portlayer/` or `~/.config/vch-portlayer/`
//! - Data:    `$XDG_DATA_HOME/vch-portlayer/` or `~/.local/share/vch-portlayer/`
//!   (the simulated datastore and disk mount points live here)
//! - Logs:    `<data>/logs/`

use std::path::{Path, PathBuf};

use tracing::debug;

const APP_NAME: &str = "vch-portlayer";

/// Config file name inside the config directory.
pub const CONFIG_FILE: &str = "portlayer.toml";

/// Log file name inside the log directory.
pub const LOG_FILE: &str = "port-layer.log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortLayerPaths {
    pub config: PathBuf,
    pub data: PathBuf,
    pub logs: PathBuf,
}

impl PortLayerPaths {
    /// Resolve all paths from the environment. Does not create anything;
    /// call [`ensure`](Self::ensure) for that.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;
        Some(Self::under(&home))
    }

    fn under(home: &Path) -> Self {
        let config = match std::env::var("XDG_CONFIG_HOME") {
            Ok(xdg) if !xdg.is_empty() => PathBuf::from(xdg).join(APP_NAME),
            _ => home.join(".config").join(APP_NAME),
        };
        let data = match std::env::var("XDG_DATA_HOME") {
            Ok(xdg) if !xdg.is_empty() => PathBuf::from(xdg).join(APP_NAME),
            _ => home.join(".local").join("share").join(APP_NAME),
        };
        Self {
            config,
            logs: data.join("logs"),
            data,
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config.join(CONFIG_FILE)
    }

    pub fn datastore(&self) -> PathBuf {
        self.data.join("datastore")
    }

    pub fn mounts(&self) -> PathBuf {
        self.data.join("mnt")
    }

    /// Create every directory that does not exist yet.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.config, &self.data, &self.logs] {
            std::fs::create_dir_all(dir)?;
            debug!(dir = %dir.display(), "ensured directory");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_hangs_off_data() {
        let paths = PortLayerPaths {
            config: PathBuf::from("/c/vch-portlayer"),
            data: PathBuf::from("/d/vch-portlayer"),
            logs: PathBuf::from("/d/vch-portlayer/logs"),
        };
        assert_eq!(paths.config_file(), PathBuf::from("/c/vch-portlayer/portlayer.toml"));
        assert_eq!(paths.datastore(), PathBuf::from("/d/vch-portlayer/datastore"));
        assert_eq!(paths.mounts(), PathBuf::from("/d/vch-portlayer/mnt"));
    }

    #[test]
    fn ensure_creates_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = PortLayerPaths {
            config: tmp.path().join("config"),
            data: tmp.path().join("data"),
            logs: tmp.path().join("data/logs"),
        };
        paths.ensure().unwrap();
        assert!(paths.config.is_dir());
        assert!(paths.logs.is_dir());
    }
}
