//! Configuration file support.
//!
//! The configuration file is optional. When present it is TOML:
//!
//! ```toml
//! [paths]
//! layers = "/srv/image-layers"
//!
//! [nspawn]
//! binds = ["/var/cache/pacman/pkg"]
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::LaminaResult;
use crate::paths::LaminaPaths;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/lamina/lamina.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LaminaConfig {
    /// Path overrides.
    pub paths: PathOverrides,
    /// Build container settings.
    pub nspawn: NspawnConfig,
}

/// Optional overrides of [`LaminaPaths`] entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathOverrides {
    /// Layer store.
    pub layers: Option<PathBuf>,
    /// Machine image directory.
    pub machines: Option<PathBuf>,
    /// systemd unit directory.
    pub units: Option<PathBuf>,
    /// State directory.
    pub state: Option<PathBuf>,
}

/// Settings for `systemd-nspawn` build containers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NspawnConfig {
    /// Host directories bind-mounted into every build container.
    pub binds: Vec<PathBuf>,
}

impl Default for NspawnConfig {
    fn default() -> Self {
        Self {
            binds: vec![
                PathBuf::from("/var/cache/pacman/pkg"),
                PathBuf::from("/var/cache/pip/http"),
            ],
        }
    }
}

impl LaminaConfig {
    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or has unknown keys.
    pub fn from_toml(content: &str) -> LaminaResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from a file.
    ///
    /// A missing file yields the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> LaminaResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                tracing::debug!(path = %path.display(), "Loaded configuration");
                Self::from_toml(&content)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No configuration file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve the effective paths, applying overrides on top of `base`.
    #[must_use]
    pub fn resolve_paths(&self, base: LaminaPaths) -> LaminaPaths {
        let o = &self.paths;
        LaminaPaths {
            layers: o.layers.clone().unwrap_or(base.layers),
            machines: o.machines.clone().unwrap_or(base.machines),
            units: o.units.clone().unwrap_or(base.units),
            state: o.state.clone().unwrap_or(base.state),
        }
    }

    /// Bind directories that exist on this host.
    #[must_use]
    pub fn existing_binds(&self) -> Vec<PathBuf> {
        self.nspawn
            .binds
            .iter()
            .filter(|dir| dir.is_dir())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = LaminaConfig::from_toml("").unwrap();
        assert_eq!(config, LaminaConfig::default());
        assert_eq!(config.nspawn.binds.len(), 2);
    }

    #[test]
    fn path_overrides() {
        let config = LaminaConfig::from_toml(
            r#"
            [paths]
            layers = "/srv/layers"
            "#,
        )
        .unwrap();

        let paths = config.resolve_paths(LaminaPaths::with_root("/tmp/x"));
        assert_eq!(paths.layers, PathBuf::from("/srv/layers"));
        assert_eq!(paths.machines, PathBuf::from("/tmp/x/machines"));
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(LaminaConfig::from_toml("[paths]\nbogus = 1\n").is_err());
    }

    #[test]
    fn missing_file_is_default() {
        let temp = tempfile::tempdir().unwrap();
        let config = LaminaConfig::load(&temp.path().join("nope.toml")).unwrap();
        assert_eq!(config, LaminaConfig::default());
    }

    #[test]
    fn existing_binds_filters_missing_dirs() {
        let temp = tempfile::tempdir().unwrap();
        let config = LaminaConfig {
            nspawn: NspawnConfig {
                binds: vec![temp.path().to_path_buf(), temp.path().join("missing")],
            },
            ..LaminaConfig::default()
        };
        assert_eq!(config.existing_binds(), vec![temp.path().to_path_buf()]);
    }
}
