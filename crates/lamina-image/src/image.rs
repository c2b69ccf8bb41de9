//! The image capability set and its closed set of variants.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use lamina_common::{LaminaError, LaminaResult};
use lamina_host::mount::MountSpec;
use lamina_host::nspawn::NspawnCommand;
use lamina_host::process::CommandLine;
use serde::Serialize;

use crate::flat::FlatImage;
use crate::layered::LayeredImage;
use crate::optimizer::OptimizeReport;

/// A problem noticed while loading an image.
///
/// Loading never repairs anything; see [`LayeredImage::repair`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caveat {
    /// The frozen marker is missing or unreadable; the image is treated as
    /// writable.
    MissingFrozenMarker,
    /// The image is mounted, but the installed mount unit does not match
    /// the persisted layers.
    StaleMount {
        /// What the installed unit mounts, if there is one.
        installed: Option<MountSpec>,
        /// What the persisted layers call for.
        expected: MountSpec,
    },
    /// The base named in the persisted metadata cannot be found. The image
    /// can be listed, unmounted, rebased or removed, but not mounted.
    MissingBase {
        /// The persisted base name.
        name: String,
    },
}

impl fmt::Display for Caveat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingFrozenMarker => {
                f.write_str("frozen marker is missing, treating the image as writable")
            }
            Self::StaleMount { installed: None, .. } => {
                f.write_str("image is mounted without a mount unit")
            }
            Self::StaleMount {
                installed: Some(installed),
                expected,
            } => write!(
                f,
                "mount unit is stale (mounts '{}', expected '{}')",
                installed.options, expected.options
            ),
            Self::MissingBase { name } => write!(f, "base image {name} does not exist"),
        }
    }
}

/// Row of an image listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageSummary {
    /// Image name.
    pub name: String,
    /// Image type.
    pub image_type: String,
    /// Read-only flag.
    pub read_only: bool,
    /// Ready flag.
    pub ready: bool,
    /// Alive flag.
    pub alive: bool,
}

/// What every image can do.
///
/// `alive` implies `ready`. Mutating operations fail with
/// [`LaminaError::ImageAlive`] while the image is alive, and are no-ops
/// when the image is already in the requested state.
#[async_trait]
pub trait Image: Send + Sync + fmt::Debug {
    /// Unique name.
    fn name(&self) -> &str;

    /// Where the image is (or would be) available.
    fn path(&self) -> &Path;

    /// Type tag (`layered`, `directory`, ...).
    fn image_type(&self) -> &str;

    /// Whether the image is read-only.
    fn read_only(&self) -> bool;

    /// Whether the image is available at its path.
    fn ready(&self) -> bool;

    /// Whether a running container uses the image.
    fn alive(&self) -> bool;

    /// Problems noticed by the last [`update`](Self::update).
    fn caveats(&self) -> &[Caveat] {
        &[]
    }

    /// Reload all properties from their authoritative source.
    async fn update(&mut self) -> LaminaResult<()>;

    /// Make the image unavailable and delete it.
    async fn remove(&mut self) -> LaminaResult<()>;

    /// Change the read-only flag.
    async fn set_read_only(&mut self, read_only: bool) -> LaminaResult<()>;

    /// Make the image available at its path, or withdraw it.
    async fn set_ready(&mut self, ready: bool) -> LaminaResult<()>;

    /// Drop content that duplicates the image's base.
    ///
    /// Failures are reported through `on_error` and never abort the pass.
    fn optimize(
        &self,
        on_status: &mut dyn FnMut(&str),
        on_error: &mut dyn FnMut(LaminaError),
    ) -> OptimizeReport;

    /// Translate an absolute path inside the image to a host path.
    fn real_path(&self, path: &Path) -> PathBuf {
        debug_assert!(path.is_absolute(), "real_path needs an absolute path");
        let mut real = self.path().to_path_buf();
        real.extend(path.components().filter(|c| matches!(c, Component::Normal(_))));
        real
    }

    /// Command running `program` inside the image.
    fn command(&self, nspawn: &NspawnCommand, program: &str, args: &[String]) -> CommandLine {
        nspawn.command(self.name(), self.path(), program, args)
    }

    /// Listing row.
    fn summary(&self) -> ImageSummary {
        ImageSummary {
            name: self.name().to_string(),
            image_type: self.image_type().to_string(),
            read_only: self.read_only(),
            ready: self.ready(),
            alive: self.alive(),
        }
    }
}

/// Either kind of image.
#[derive(Debug)]
pub enum AnyImage {
    /// Managed by the container registry.
    Flat(FlatImage),
    /// Managed by Lamina.
    Layered(LayeredImage),
}

impl AnyImage {
    /// The layered image, if this is one.
    #[must_use]
    pub fn as_layered(&self) -> Option<&LayeredImage> {
        match self {
            Self::Layered(image) => Some(image),
            Self::Flat(_) => None,
        }
    }

    /// The layered image, if this is one.
    pub fn as_layered_mut(&mut self) -> Option<&mut LayeredImage> {
        match self {
            Self::Layered(image) => Some(image),
            Self::Flat(_) => None,
        }
    }

    /// Fail with [`LaminaError::Impossible`] unless this is a layered image.
    ///
    /// # Errors
    ///
    /// Returns an error for flat images.
    pub fn into_layered(self, operation: &str) -> LaminaResult<LayeredImage> {
        match self {
            Self::Layered(image) => Ok(image),
            Self::Flat(image) => Err(LaminaError::Impossible {
                name: image.name().to_string(),
                operation: operation.to_string(),
            }),
        }
    }

    fn inner(&self) -> &dyn Image {
        match self {
            Self::Flat(image) => image,
            Self::Layered(image) => image,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Image {
        match self {
            Self::Flat(image) => image,
            Self::Layered(image) => image,
        }
    }
}

impl From<FlatImage> for AnyImage {
    fn from(image: FlatImage) -> Self {
        Self::Flat(image)
    }
}

impl From<LayeredImage> for AnyImage {
    fn from(image: LayeredImage) -> Self {
        Self::Layered(image)
    }
}

#[async_trait]
impl Image for AnyImage {
    fn name(&self) -> &str {
        self.inner().name()
    }

    fn path(&self) -> &Path {
        self.inner().path()
    }

    fn image_type(&self) -> &str {
        self.inner().image_type()
    }

    fn read_only(&self) -> bool {
        self.inner().read_only()
    }

    fn ready(&self) -> bool {
        self.inner().ready()
    }

    fn alive(&self) -> bool {
        self.inner().alive()
    }

    fn caveats(&self) -> &[Caveat] {
        self.inner().caveats()
    }

    async fn update(&mut self) -> LaminaResult<()> {
        self.inner_mut().update().await
    }

    async fn remove(&mut self) -> LaminaResult<()> {
        self.inner_mut().remove().await
    }

    async fn set_read_only(&mut self, read_only: bool) -> LaminaResult<()> {
        self.inner_mut().set_read_only(read_only).await
    }

    async fn set_ready(&mut self, ready: bool) -> LaminaResult<()> {
        self.inner_mut().set_ready(ready).await
    }

    fn optimize(
        &self,
        on_status: &mut dyn FnMut(&str),
        on_error: &mut dyn FnMut(LaminaError),
    ) -> OptimizeReport {
        self.inner().optimize(on_status, on_error)
    }
}

/// Guard used by every mutating operation.
pub(crate) fn ensure_not_alive(image: &dyn Image) -> LaminaResult<()> {
    if image.alive() {
        Err(LaminaError::ImageAlive {
            name: image.name().to_string(),
        })
    } else {
        Ok(())
    }
}
