//! Flat images, owned by the container registry.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use lamina_common::{LaminaError, LaminaResult};
use lamina_host::machine::{self, ImageDescriptor, MachineRegistry};

use crate::image::{Image, ensure_not_alive};
use crate::optimizer::OptimizeReport;

/// An image the registry already provides as a complete tree.
#[derive(Debug)]
pub struct FlatImage {
    registry: Arc<dyn MachineRegistry>,
    name: String,
    path: PathBuf,
    image_type: String,
    read_only: bool,
    ready: bool,
    alive: bool,
}

impl FlatImage {
    /// Look `name` up in the registry.
    ///
    /// # Errors
    ///
    /// Returns [`LaminaError::NoSuchImage`] if the registry does not know it.
    pub async fn load(registry: Arc<dyn MachineRegistry>, name: &str) -> LaminaResult<Self> {
        let mut image = Self {
            registry,
            name: name.to_string(),
            path: PathBuf::new(),
            image_type: String::new(),
            read_only: false,
            ready: false,
            alive: false,
        };
        image.update().await?;
        Ok(image)
    }

    fn apply(&mut self, descriptor: ImageDescriptor) {
        self.name = descriptor.name;
        self.path = descriptor.path;
        self.image_type = descriptor.image_type;
        self.read_only = descriptor.read_only;
        self.ready = true;
    }
}

#[async_trait]
impl Image for FlatImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn image_type(&self) -> &str {
        &self.image_type
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn ready(&self) -> bool {
        self.ready
    }

    fn alive(&self) -> bool {
        self.alive
    }

    async fn update(&mut self) -> LaminaResult<()> {
        match self.registry.get_image(&self.name).await {
            Ok(descriptor) => self.apply(descriptor),
            Err(e) => {
                self.ready = false;
                return Err(match e {
                    LaminaError::NoSuchImage { .. } => LaminaError::NoSuchImage {
                        name: self.name.clone(),
                    },
                    other => other,
                });
            }
        }
        self.alive = machine::is_alive(self.registry.as_ref(), &self.name).await?;
        Ok(())
    }

    async fn remove(&mut self) -> LaminaResult<()> {
        ensure_not_alive(self)?;
        self.registry.remove_image(&self.name).await?;
        self.ready = false;
        Ok(())
    }

    async fn set_read_only(&mut self, read_only: bool) -> LaminaResult<()> {
        if self.read_only == read_only {
            return Ok(());
        }
        ensure_not_alive(self)?;

        self.registry
            .mark_image_read_only(&self.name, read_only)
            .await?;
        self.read_only = read_only;
        tracing::info!(image = %self.name, read_only, "Changed read-only flag");
        Ok(())
    }

    async fn set_ready(&mut self, ready: bool) -> LaminaResult<()> {
        if self.ready == ready {
            return Ok(());
        }
        ensure_not_alive(self)?;

        if !self.ready {
            return Err(LaminaError::Impossible {
                name: self.name.clone(),
                operation: "make a flat image ready".to_string(),
            });
        }

        // The registry keeps flat images available; there is nothing to
        // withdraw.
        Ok(())
    }

    fn optimize(
        &self,
        _on_status: &mut dyn FnMut(&str),
        on_error: &mut dyn FnMut(LaminaError),
    ) -> OptimizeReport {
        if let Err(e) = ensure_not_alive(self) {
            on_error(e);
        }
        OptimizeReport::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lamina_common::ErrorKind;
    use lamina_host::testing::FakeMachineRegistry;

    fn registry() -> (tempfile::TempDir, Arc<FakeMachineRegistry>) {
        let temp = tempfile::tempdir().unwrap();
        let registry = Arc::new(FakeMachineRegistry::new(temp.path()));
        (temp, registry)
    }

    #[tokio::test]
    async fn loads_from_registry() {
        let (_temp, registry) = registry();
        registry.add_image("arch", true).unwrap();

        let image = FlatImage::load(registry.clone(), "arch").await.unwrap();
        assert_eq!(image.name(), "arch");
        assert_eq!(image.image_type(), "directory");
        assert!(image.read_only());
        assert!(image.ready());
        assert!(!image.alive());
    }

    #[tokio::test]
    async fn unknown_image() {
        let (_temp, registry) = registry();
        let err = FlatImage::load(registry, "nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn mutations_refused_while_alive() {
        let (_temp, registry) = registry();
        registry.add_image("arch", false).unwrap();
        registry.start_machine("arch");

        let mut image = FlatImage::load(registry.clone(), "arch").await.unwrap();
        assert!(image.alive() && image.ready());
        assert_eq!(image.set_read_only(true).await.unwrap_err().kind(), ErrorKind::Busy);
        assert_eq!(image.set_ready(false).await.unwrap_err().kind(), ErrorKind::Busy);
        assert_eq!(image.remove().await.unwrap_err().kind(), ErrorKind::Busy);

        let mut errors = Vec::new();
        image.optimize(&mut |_| {}, &mut |e| errors.push(e.kind()));
        assert_eq!(errors, vec![ErrorKind::Busy]);
    }

    #[tokio::test]
    async fn set_read_only_goes_through_registry() {
        let (_temp, registry) = registry();
        registry.add_image("arch", false).unwrap();

        let mut image = FlatImage::load(registry.clone(), "arch").await.unwrap();
        image.set_read_only(true).await.unwrap();
        image.update().await.unwrap();
        assert!(image.read_only());
    }

    #[tokio::test]
    async fn unready_is_a_noop_and_ready_is_impossible() {
        let (_temp, registry) = registry();
        registry.add_image("arch", false).unwrap();

        let mut image = FlatImage::load(registry.clone(), "arch").await.unwrap();
        image.set_ready(false).await.unwrap();
        assert!(image.path().is_dir());

        registry.remove_image("arch").await.unwrap();
        assert!(image.update().await.is_err());
        assert!(!image.ready());
        assert_eq!(
            image.set_ready(true).await.unwrap_err().kind(),
            ErrorKind::Impossible
        );
    }
}
