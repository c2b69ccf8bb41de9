//! The image facade: one entry point over tags, layered and flat images.

use std::collections::BTreeMap;

use lamina_common::{ImageName, LaminaError, LaminaResult};
use lamina_host::Host;

use crate::controller::LayeredImageCtl;
use crate::flat::FlatImage;
use crate::image::{AnyImage, Image};
use crate::layered::LayeredImage;
use crate::tag::TagStore;

/// Looks images up across the layer store and the container registry.
///
/// Lookup order: tags, then the layer store, then the registry.
#[derive(Debug, Clone)]
pub struct ImageCtl {
    host: Host,
    layered: LayeredImageCtl,
    tags: TagStore,
}

impl ImageCtl {
    /// Facade over the stores of `host`.
    #[must_use]
    pub fn new(host: Host) -> Self {
        Self {
            layered: LayeredImageCtl::new(host.clone()),
            tags: TagStore::new(host.paths.machines.clone()),
            host,
        }
    }

    /// The host handle.
    #[must_use]
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// The layered image controller.
    #[must_use]
    pub fn layered(&self) -> &LayeredImageCtl {
        &self.layered
    }

    /// Resolve `name` (an image or a tag) to an image.
    ///
    /// # Errors
    ///
    /// Returns [`LaminaError::NoSuchImage`] if neither store has it.
    pub async fn get_image(&self, name: &str) -> LaminaResult<AnyImage> {
        self.resolve(name, &[]).await
    }

    /// [`get_image`](Self::get_image) for the base of the layered images in
    /// `below`, nearest last. Fails with [`LaminaError::BaseCycle`] if the
    /// chain leads back into `below`.
    pub(crate) async fn resolve(&self, name: &str, below: &[String]) -> LaminaResult<AnyImage> {
        let resolved = self.tags.read_tag(name).unwrap_or_else(|_| name.to_string());

        match LayeredImage::load_below(self.host.clone(), &resolved, below).await {
            Ok(image) => return Ok(image.into()),
            Err(LaminaError::NoSuchImage { .. }) => {}
            Err(e) => return Err(e),
        }

        match FlatImage::load(self.host.machines.clone(), &resolved).await {
            Ok(image) => Ok(image.into()),
            Err(LaminaError::NoSuchImage { .. }) => Err(LaminaError::NoSuchImage {
                name: name.to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    /// Load a layered image, failing with [`LaminaError::Impossible`] for
    /// flat ones.
    ///
    /// # Errors
    ///
    /// Returns an error if the image does not exist or is flat.
    pub async fn get_layered(&self, name: &str, operation: &str) -> LaminaResult<LayeredImage> {
        self.get_image(name).await?.into_layered(operation)
    }

    /// All images, sorted by name. A layered image hides a registry entry
    /// of the same name.
    ///
    /// # Errors
    ///
    /// Returns an error if either store cannot be listed.
    pub async fn list_images(&self) -> LaminaResult<Vec<AnyImage>> {
        let mut images: BTreeMap<String, AnyImage> = BTreeMap::new();

        for descriptor in self.host.machines.list_images().await? {
            match FlatImage::load(self.host.machines.clone(), &descriptor.name).await {
                Ok(image) => {
                    images.insert(image.name().to_string(), image.into());
                }
                Err(e) => tracing::debug!(image = %descriptor.name, error = %e, "Skipping registry image"),
            }
        }

        for image in self.layered.list_images().await? {
            images.insert(image.name().to_string(), image.into());
        }

        Ok(images.into_values().collect())
    }

    /// Create a layered image, optionally on top of `base` (an image or tag).
    ///
    /// # Errors
    ///
    /// Fails with [`LaminaError::BaseDoesNotExist`],
    /// [`LaminaError::BaseWritable`] or [`LaminaError::ImageExists`].
    pub async fn create_image(&self, name: &str, base: Option<&str>) -> LaminaResult<LayeredImage> {
        let base = match base {
            None => None,
            Some(base_name) => match self.get_image(base_name).await {
                Ok(image) => Some(image),
                Err(e) if e.is_not_found() => {
                    return Err(LaminaError::BaseDoesNotExist {
                        name: base_name.to_string(),
                    });
                }
                Err(e) => return Err(e),
            },
        };

        self.layered.create_image(name, base).await
    }

    /// Make `tag` an alias of `name`.
    ///
    /// # Errors
    ///
    /// Fails with [`LaminaError::ImageExists`] if `tag` already resolves and
    /// [`LaminaError::NoSuchImage`] if `name` does not.
    pub async fn tag(&self, tag: &str, name: &str) -> LaminaResult<()> {
        let tag = ImageName::new(tag)?;
        match self.get_image(tag.as_str()).await {
            Ok(_) => {
                return Err(LaminaError::ImageExists {
                    name: tag.to_string(),
                });
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let image = self.get_image(name).await?;
        self.tags.tag(tag.as_str(), image.name())
    }

    /// The image `tag` points to.
    ///
    /// # Errors
    ///
    /// Returns [`LaminaError::NotATag`] if `tag` is not a tag.
    pub fn read_tag(&self, tag: &str) -> LaminaResult<String> {
        self.tags.read_tag(tag)
    }

    /// Remove `tag`, returning its previous target. The image is untouched.
    ///
    /// # Errors
    ///
    /// Returns [`LaminaError::NotATag`] if `tag` is not a tag.
    pub fn untag(&self, tag: &str) -> LaminaResult<String> {
        self.tags.untag(tag)
    }
}
