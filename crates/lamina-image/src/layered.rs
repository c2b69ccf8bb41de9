//! Layered images.
//!
//! A layered image persists as a directory in the layer store:
//!
//! ```text
//! <layers>/<name>/id        image name
//! <layers>/<name>/base      base image name (absent for root images)
//! <layers>/<name>/frozen    `y` or `n`
//! <layers>/<name>/rootfs/   the image's own changes relative to its base
//! ```
//!
//! The persisted layers are the source of truth. The mount at
//! `<machines>/<name>` is derived from them and can always be torn down
//! and rebuilt.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use async_trait::async_trait;
use lamina_common::{LaminaError, LaminaPaths, LaminaResult};
use lamina_host::mount::MountSpec;
use lamina_host::{Host, MountOrchestrator, machine};

use crate::facade::ImageCtl;
use crate::image::{AnyImage, Caveat, Image, ensure_not_alive};
use crate::optimizer::{self, OptimizeReport};

const ID_FILE: &str = "id";
const BASE_FILE: &str = "base";
const FROZEN_FILE: &str = "frozen";

/// An image expressed as a delta against its base.
#[derive(Debug)]
pub struct LayeredImage {
    host: Host,
    name: String,
    path: PathBuf,
    base: Option<Box<AnyImage>>,
    /// Persisted base name that did not resolve.
    missing_base: Option<String>,
    frozen: bool,
    ready: bool,
    alive: bool,
    caveats: Vec<Caveat>,
}

impl LayeredImage {
    fn unloaded(host: Host, name: &str) -> Self {
        let path = host.paths.image_path(name);
        Self {
            host,
            name: name.to_string(),
            path,
            base: None,
            missing_base: None,
            frozen: false,
            ready: false,
            alive: false,
            caveats: Vec::new(),
        }
    }

    /// Load a persisted image.
    ///
    /// # Errors
    ///
    /// Returns [`LaminaError::NoSuchImage`] if there is no such image in the
    /// layer store, or an error resolving its base.
    pub async fn load(host: Host, name: &str) -> LaminaResult<Self> {
        Self::load_below(host, name, &[]).await
    }

    /// Load `name` as an ancestor of the images in `below`.
    pub(crate) async fn load_below(host: Host, name: &str, below: &[String]) -> LaminaResult<Self> {
        if below.iter().any(|n| n == name) {
            return Err(LaminaError::BaseCycle {
                name: below.last().cloned().unwrap_or_default(),
                base: name.to_string(),
            });
        }
        let mut image = Self::unloaded(host, name);
        image.reload(below).await?;
        Ok(image)
    }

    /// Persist a new image on top of `base` and mount it.
    ///
    /// Callers check that the name is free and the base is read-only.
    pub(crate) async fn create(host: Host, name: &str, base: Option<AnyImage>) -> LaminaResult<Self> {
        let mut image = Self::unloaded(host, name);
        image.base = base.map(Box::new);

        create_dir_with_mode(&image.layer_root(), 0o700)?;
        create_dir_with_mode(&image.layer_fs_root(), 0o755)?;
        image.save_metadata()?;
        tracing::info!(
            image = %image.name,
            base = image.base_name().unwrap_or("-"),
            "Created layered image"
        );

        image.set_ready(true).await?;
        Ok(image)
    }

    /// Persisted directory of this image.
    #[must_use]
    pub fn layer_root(&self) -> PathBuf {
        self.host.paths.layer_root(&self.name)
    }

    /// This image's own content layer.
    #[must_use]
    pub fn layer_fs_root(&self) -> PathBuf {
        self.host.paths.layer_fs_root(&self.name)
    }

    fn layer_path(&self, file: &str) -> PathBuf {
        self.layer_root().join(file)
    }

    /// The base image, if any.
    #[must_use]
    pub fn base(&self) -> Option<&AnyImage> {
        self.base.as_deref()
    }

    /// Name of the base image, if any.
    #[must_use]
    pub fn base_name(&self) -> Option<&str> {
        self.base().map(Image::name)
    }

    /// The first base in the chain whose persisted name did not resolve.
    #[must_use]
    pub fn missing_ancestor(&self) -> Option<&str> {
        self.missing_base.as_deref().or_else(|| match self.base() {
            Some(AnyImage::Layered(base)) => base.missing_ancestor(),
            _ => None,
        })
    }

    fn ensure_base(&self) -> LaminaResult<()> {
        match self.missing_ancestor() {
            Some(name) => Err(LaminaError::BaseDoesNotExist {
                name: name.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Names of the layered images whose persisted base is this image.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer store cannot be read.
    pub fn dependents(&self) -> LaminaResult<Vec<String>> {
        let mut dependents = Vec::new();
        for entry in std::fs::read_dir(&self.host.paths.layers)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name == self.name || LaminaPaths::is_reserved_layer_entry(&name) {
                continue;
            }
            let base = std::fs::read_to_string(entry.path().join(BASE_FILE));
            if base.is_ok_and(|base| base.trim() == self.name) {
                dependents.push(name);
            }
        }
        dependents.sort();
        Ok(dependents)
    }

    /// The layers below this image, from the most distant ancestor to the
    /// nearest.
    #[must_use]
    pub fn base_layers(&self) -> Vec<PathBuf> {
        match self.base() {
            None => Vec::new(),
            Some(AnyImage::Layered(base)) => {
                let mut layers = base.base_layers();
                layers.push(base.layer_fs_root());
                layers
            }
            Some(AnyImage::Flat(base)) => vec![base.path().to_path_buf()],
        }
    }

    /// Whether `name` is this image or one of its ancestors.
    #[must_use]
    pub fn derives_from(&self, name: &str) -> bool {
        self.name == name
            || match self.base() {
                None => false,
                Some(AnyImage::Layered(base)) => base.derives_from(name),
                Some(AnyImage::Flat(base)) => base.name() == name,
            }
    }

    fn orchestrator(&self) -> MountOrchestrator {
        self.host.orchestrator()
    }

    /// Read-only layers and the writable layer for the current state.
    fn layers(&self) -> (Vec<PathBuf>, Option<PathBuf>) {
        let mut ro = self.base_layers();
        if self.frozen {
            ro.push(self.layer_fs_root());
            (ro, None)
        } else {
            (ro, Some(self.layer_fs_root()))
        }
    }

    /// The mount the persisted layers call for.
    #[must_use]
    pub fn expected_mount(&self) -> MountSpec {
        let (ro, rw) = self.layers();
        self.orchestrator().overlay_spec(&ro, rw.as_deref(), &self.path)
    }

    fn save_metadata(&self) -> LaminaResult<()> {
        std::fs::write(self.layer_path(ID_FILE), &self.name)?;

        let base_file = self.layer_path(BASE_FILE);
        match self.base_name().or(self.missing_base.as_deref()) {
            Some(base) => std::fs::write(&base_file, base)?,
            None => match std::fs::remove_file(&base_file) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            },
        }

        std::fs::write(
            self.layer_path(FROZEN_FILE),
            if self.frozen { "y" } else { "n" },
        )?;

        tracing::debug!(image = %self.name, frozen = self.frozen, "Saved metadata");
        Ok(())
    }

    async fn mount(&self) -> LaminaResult<()> {
        let (ro, rw) = self.layers();
        let orchestrator = self.orchestrator();
        orchestrator
            .setup_overlay(&ro, rw.as_deref(), &self.path)
            .await?;
        orchestrator.mount(&self.path).await?;
        tracing::info!(image = %self.name, path = %self.path.display(), "Mounted image");
        Ok(())
    }

    async fn unmount(&self) -> LaminaResult<()> {
        let orchestrator = self.orchestrator();
        orchestrator.unmount(&self.path).await?;
        orchestrator.destroy(&self.path).await?;
        tracing::info!(image = %self.name, "Unmounted image");
        Ok(())
    }

    /// Move the image onto another base.
    ///
    /// The image is unmounted while its metadata changes and remounted if it
    /// was ready.
    ///
    /// # Errors
    ///
    /// Fails with [`LaminaError::ImageAlive`], [`LaminaError::BaseWritable`]
    /// or [`LaminaError::BaseCycle`] before changing anything.
    pub async fn rebase(&mut self, new_base: AnyImage) -> LaminaResult<()> {
        ensure_not_alive(self)?;
        if !new_base.read_only() {
            return Err(LaminaError::BaseWritable {
                name: new_base.name().to_string(),
            });
        }
        let cycle = match &new_base {
            AnyImage::Layered(base) => base.derives_from(&self.name),
            AnyImage::Flat(base) => base.name() == self.name,
        };
        if cycle {
            return Err(LaminaError::BaseCycle {
                name: self.name.clone(),
                base: new_base.name().to_string(),
            });
        }
        if let Some(missing) = new_base.as_layered().and_then(LayeredImage::missing_ancestor) {
            return Err(LaminaError::BaseDoesNotExist {
                name: missing.to_string(),
            });
        }

        let ready = self.ready;
        self.set_ready(false).await?;

        let old = self
            .base_name()
            .or(self.missing_base.as_deref())
            .map(str::to_string);
        self.base = Some(Box::new(new_base));
        self.missing_base = None;
        self.caveats.retain(|c| !matches!(c, Caveat::MissingBase { .. }));
        self.save_metadata()?;
        tracing::info!(
            image = %self.name,
            from = old.as_deref().unwrap_or("-"),
            to = self.base_name().unwrap_or("-"),
            "Rebased image"
        );

        self.set_ready(ready).await
    }

    /// Fix the problems reported as caveats.
    ///
    /// Rewrites a missing frozen marker and rebuilds a stale mount from the
    /// persisted layers. A missing base is left for [`rebase`](Self::rebase).
    ///
    /// # Errors
    ///
    /// Fails with [`LaminaError::ImageAlive`] before changing anything.
    pub async fn repair(&mut self) -> LaminaResult<()> {
        ensure_not_alive(self)?;

        if self.caveats.contains(&Caveat::MissingFrozenMarker) {
            self.save_metadata()?;
        }

        let stale = self
            .caveats
            .iter()
            .any(|c| matches!(c, Caveat::StaleMount { .. }));
        if stale {
            let orchestrator = self.orchestrator();
            if orchestrator.installed_spec(&self.path)?.is_some() {
                self.unmount().await?;
            } else {
                // Mount point without units: nothing to stop.
                std::fs::remove_dir(&self.path)?;
            }
            self.ready = false;
            self.mount().await?;
            self.ready = true;
        }

        self.caveats.retain(|c| matches!(c, Caveat::MissingBase { .. }));
        tracing::info!(image = %self.name, "Repaired image");
        Ok(())
    }

    fn check_mount(&mut self) -> LaminaResult<()> {
        // Without the whole chain there is nothing to compare against.
        if !self.ready || self.missing_ancestor().is_some() {
            return Ok(());
        }
        let installed = self.orchestrator().installed_spec(&self.path)?;
        let expected = self.expected_mount();
        if installed.as_ref() != Some(&expected) {
            tracing::warn!(image = %self.name, "Mount unit does not match the persisted layers");
            self.caveats.push(Caveat::StaleMount {
                installed,
                expected,
            });
        }
        Ok(())
    }

    /// Reload from the layer store. `below` holds the images already being
    /// loaded on top of this one.
    fn reload<'a>(
        &'a mut self,
        below: &'a [String],
    ) -> Pin<Box<dyn Future<Output = LaminaResult<()>> + Send + 'a>> {
        Box::pin(async move {
            if std::fs::read(self.layer_path(ID_FILE)).is_err() {
                return Err(LaminaError::NoSuchImage {
                    name: self.name.clone(),
                });
            }
            self.caveats.clear();
            self.missing_base = None;

            self.base = match std::fs::read_to_string(self.layer_path(BASE_FILE)) {
                Ok(base) => {
                    let base = base.trim();
                    if base == self.name {
                        return Err(LaminaError::BaseCycle {
                            name: self.name.clone(),
                            base: base.to_string(),
                        });
                    }
                    let mut chain = below.to_vec();
                    chain.push(self.name.clone());
                    let ctl = ImageCtl::new(self.host.clone());
                    match ctl.resolve(base, &chain).await {
                        Ok(image) => Some(Box::new(image)),
                        Err(e) if e.is_not_found() => {
                            tracing::warn!(image = %self.name, base, "Base image does not exist");
                            self.missing_base = Some(base.to_string());
                            self.caveats.push(Caveat::MissingBase {
                                name: base.to_string(),
                            });
                            None
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(_) => None,
            };
            let inherited = self
                .base()
                .and_then(AnyImage::as_layered)
                .and_then(LayeredImage::missing_ancestor)
                .map(str::to_string);
            if let Some(name) = inherited {
                self.caveats.push(Caveat::MissingBase { name });
            }

            self.frozen = match std::fs::read(self.layer_path(FROZEN_FILE)).as_deref() {
                Ok(b"y") => true,
                Ok(b"n") => false,
                _ => {
                    tracing::warn!(image = %self.name, "Frozen marker missing or unreadable, treating image as writable");
                    self.caveats.push(Caveat::MissingFrozenMarker);
                    false
                }
            };

            self.ready = self.path.is_dir();
            self.alive = machine::is_alive(self.host.machines.as_ref(), &self.name).await?;
            self.check_mount()?;
            Ok(())
        })
    }
}

fn create_dir_with_mode(path: &Path, mode: u32) -> LaminaResult<()> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)?;
    Ok(())
}

#[async_trait]
impl Image for LayeredImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn image_type(&self) -> &str {
        "layered"
    }

    fn read_only(&self) -> bool {
        self.frozen
    }

    fn ready(&self) -> bool {
        self.ready
    }

    fn alive(&self) -> bool {
        self.alive
    }

    fn caveats(&self) -> &[Caveat] {
        &self.caveats
    }

    async fn update(&mut self) -> LaminaResult<()> {
        self.reload(&[]).await
    }

    async fn remove(&mut self) -> LaminaResult<()> {
        ensure_not_alive(self)?;
        let dependents = self.dependents()?;
        if !dependents.is_empty() {
            return Err(LaminaError::BaseInUse {
                name: self.name.clone(),
                dependents: dependents.join(", "),
            });
        }
        self.set_ready(false).await?;
        std::fs::remove_dir_all(self.layer_root())?;
        tracing::info!(image = %self.name, "Removed layered image");
        Ok(())
    }

    async fn set_read_only(&mut self, read_only: bool) -> LaminaResult<()> {
        if self.frozen == read_only {
            return Ok(());
        }
        ensure_not_alive(self)?;
        let ready = self.ready;
        if ready {
            self.ensure_base()?;
        }
        self.set_ready(false).await?;

        self.frozen = read_only;
        self.save_metadata()?;
        tracing::info!(image = %self.name, frozen = read_only, "Changed read-only flag");

        self.set_ready(ready).await
    }

    async fn set_ready(&mut self, ready: bool) -> LaminaResult<()> {
        if self.ready == ready {
            return Ok(());
        }
        ensure_not_alive(self)?;

        if ready {
            self.ensure_base()?;
            self.mount().await?;
        } else {
            self.unmount().await?;
        }

        self.ready = ready;
        Ok(())
    }

    fn optimize(
        &self,
        on_status: &mut dyn FnMut(&str),
        on_error: &mut dyn FnMut(LaminaError),
    ) -> OptimizeReport {
        if let Err(e) = ensure_not_alive(self) {
            on_error(e);
            return OptimizeReport::default();
        }
        if let Err(e) = self.ensure_base() {
            on_error(e);
            return OptimizeReport::default();
        }
        if self.base.is_none() {
            return OptimizeReport::default();
        }

        let mut chain = self.base_layers();
        chain.reverse();
        optimizer::optimize(&self.layer_fs_root(), &chain, on_status, on_error)
    }
}
