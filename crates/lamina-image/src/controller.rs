//! The layered image controller.

use lamina_common::{ImageName, LaminaError, LaminaPaths, LaminaResult};
use lamina_host::Host;

use crate::facade::ImageCtl;
use crate::image::{AnyImage, Image};
use crate::layered::LayeredImage;
use crate::tag::TagStore;

/// Creates, resolves and lists layered images.
#[derive(Debug, Clone)]
pub struct LayeredImageCtl {
    host: Host,
    tags: TagStore,
}

impl LayeredImageCtl {
    /// Controller for the layer store of `host`.
    #[must_use]
    pub fn new(host: Host) -> Self {
        let tags = TagStore::new(host.paths.machines.clone());
        Self { host, tags }
    }

    /// Load a layered image, following a tag.
    ///
    /// # Errors
    ///
    /// Returns [`LaminaError::NoSuchImage`] if it is not in the layer store.
    pub async fn get_image(&self, name: &str) -> LaminaResult<LayeredImage> {
        let name = self.tags.read_tag(name).unwrap_or_else(|_| name.to_string());
        LayeredImage::load(self.host.clone(), &name).await
    }

    /// All loadable images in the layer store.
    ///
    /// Entries that fail to load are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer store cannot be read.
    pub async fn list_images(&self) -> LaminaResult<Vec<LayeredImage>> {
        let entries = match std::fs::read_dir(&self.host.paths.layers) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut images = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if LaminaPaths::is_reserved_layer_entry(&name) {
                continue;
            }

            match LayeredImage::load(self.host.clone(), &name).await {
                Ok(image) => images.push(image),
                Err(e) => tracing::debug!(image = %name, error = %e, "Skipping layer directory"),
            }
        }
        Ok(images)
    }

    /// Create and mount a layered image on top of `base`.
    ///
    /// # Errors
    ///
    /// Fails with [`LaminaError::BaseWritable`] if `base` is not read-only,
    /// [`LaminaError::BaseDoesNotExist`] if part of its chain is gone, and
    /// [`LaminaError::ImageExists`] if `name` already resolves to an
    /// image. Nothing is written in either case.
    pub async fn create_image(&self, name: &str, base: Option<AnyImage>) -> LaminaResult<LayeredImage> {
        let name = ImageName::new(name)?;

        if let Some(base) = &base {
            if !base.read_only() {
                return Err(LaminaError::BaseWritable {
                    name: base.name().to_string(),
                });
            }
            if let Some(missing) = base.as_layered().and_then(LayeredImage::missing_ancestor) {
                return Err(LaminaError::BaseDoesNotExist {
                    name: missing.to_string(),
                });
            }
        }

        let exists = match ImageCtl::new(self.host.clone()).get_image(name.as_str()).await {
            Ok(_) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e),
        };
        if exists || self.host.paths.layer_root(name.as_str()).exists() {
            return Err(LaminaError::ImageExists {
                name: name.to_string(),
            });
        }

        LayeredImage::create(self.host.clone(), name.as_str(), base).await
    }
}
