//! Standard filesystem paths for Lamina.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

fn env_path(var: &str, default: &str) -> PathBuf {
    std::env::var(var).map_or_else(|_| PathBuf::from(default), PathBuf::from)
}

/// Default layer store (persisted layered images).
pub static LAMINA_LAYERS_DIR: Lazy<PathBuf> =
    Lazy::new(|| env_path("LAMINA_LAYERS_DIR", "/var/lib/image-layers"));

/// Default machine image directory, shared with systemd-machined.
pub static LAMINA_MACHINES_DIR: Lazy<PathBuf> =
    Lazy::new(|| env_path("LAMINA_MACHINES_DIR", "/var/lib/machines"));

/// Default directory for generated systemd units.
pub static LAMINA_UNIT_DIR: Lazy<PathBuf> =
    Lazy::new(|| env_path("LAMINA_UNIT_DIR", "/etc/systemd/system"));

/// Default state directory (downloads, cloned build sources).
pub static LAMINA_STATE_DIR: Lazy<PathBuf> =
    Lazy::new(|| env_path("LAMINA_STATE_DIR", "/var/lib/lamina"));

const WORK_DIR: &str = ".work";

/// Standard paths used by the Lamina tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaminaPaths {
    /// Layer store (default: /var/lib/image-layers).
    pub layers: PathBuf,
    /// Machine images and tags (default: /var/lib/machines).
    pub machines: PathBuf,
    /// systemd unit directory (default: /etc/systemd/system).
    pub units: PathBuf,
    /// State directory (default: /var/lib/lamina).
    pub state: PathBuf,
}

impl LaminaPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths nested under a single root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            layers: root.join("image-layers"),
            machines: root.join("machines"),
            units: root.join("units"),
            state: root.join("state"),
        }
    }

    /// Persisted directory of a layered image.
    #[must_use]
    pub fn layer_root(&self, name: &str) -> PathBuf {
        self.layers.join(name)
    }

    /// Content subtree of a layered image.
    #[must_use]
    pub fn layer_fs_root(&self, name: &str) -> PathBuf {
        self.layer_root(name).join("rootfs")
    }

    /// Overlay work directory, shared by all layered images.
    #[must_use]
    pub fn overlay_work(&self) -> PathBuf {
        self.layers.join(WORK_DIR)
    }

    /// Whether a directory name inside the layer store is reserved.
    #[must_use]
    pub fn is_reserved_layer_entry(name: &str) -> bool {
        name == WORK_DIR
    }

    /// Mount point of an image.
    #[must_use]
    pub fn image_path(&self, name: &str) -> PathBuf {
        self.machines.join(name)
    }

    /// Symlink that represents a tag.
    #[must_use]
    pub fn tag_path(&self, tag: &str) -> PathBuf {
        self.machines.join(tag)
    }

    /// A unit file in the unit directory.
    #[must_use]
    pub fn unit_file(&self, unit: &str) -> PathBuf {
        self.units.join(unit)
    }

    /// Cache directory for downloaded archives.
    #[must_use]
    pub fn downloads(&self) -> PathBuf {
        self.state.join("downloads")
    }

    /// Directory holding cloned build sources.
    #[must_use]
    pub fn sources(&self) -> PathBuf {
        self.state.join("sources")
    }

    /// Whether `path` lies inside the layer store.
    #[must_use]
    pub fn is_in_layer_store(&self, path: &Path) -> bool {
        path.starts_with(&self.layers)
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.layers)?;
        std::fs::create_dir_all(&self.machines)?;
        std::fs::create_dir_all(&self.units)?;
        std::fs::create_dir_all(self.downloads())?;
        std::fs::create_dir_all(self.sources())?;
        Ok(())
    }
}

impl Default for LaminaPaths {
    fn default() -> Self {
        Self {
            layers: LAMINA_LAYERS_DIR.clone(),
            machines: LAMINA_MACHINES_DIR.clone(),
            units: LAMINA_UNIT_DIR.clone(),
            state: LAMINA_STATE_DIR.clone(),
        }
    }
}
