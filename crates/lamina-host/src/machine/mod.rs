//! The container registry (systemd-machined) contract.

mod machinectl;

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use lamina_common::{LaminaError, LaminaResult};
use serde::{Deserialize, Serialize};

pub use machinectl::Machinectl;

/// An image known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    /// Image name.
    pub name: String,
    /// Location of the image.
    pub path: PathBuf,
    /// Registry type (`directory`, `subvolume`, `raw`, ...).
    pub image_type: String,
    /// Whether the registry marks the image read-only.
    pub read_only: bool,
}

/// A running machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineHandle {
    /// Machine name.
    pub name: String,
    /// Machine class (`container`, `vm`).
    pub class: String,
    /// PID of the machine leader, if reported.
    pub leader: Option<u32>,
}

/// The subset of the machined API that Lamina uses.
#[async_trait]
pub trait MachineRegistry: Send + Sync + fmt::Debug {
    /// Look up an image; fails with [`LaminaError::NoSuchImage`].
    async fn get_image(&self, name: &str) -> LaminaResult<ImageDescriptor>;

    /// Look up a running machine; fails with [`LaminaError::NoSuchMachine`].
    async fn get_machine(&self, name: &str) -> LaminaResult<MachineHandle>;

    /// All images known to the registry.
    async fn list_images(&self) -> LaminaResult<Vec<ImageDescriptor>>;

    /// Remove an image.
    async fn remove_image(&self, name: &str) -> LaminaResult<()>;

    /// Set or clear the read-only flag of an image.
    async fn mark_image_read_only(&self, name: &str, read_only: bool) -> LaminaResult<()>;
}

/// Whether a machine named `name` is running.
///
/// # Errors
///
/// Propagates registry failures other than "no such machine".
pub async fn is_alive(registry: &dyn MachineRegistry, name: &str) -> LaminaResult<bool> {
    match registry.get_machine(name).await {
        Ok(_) => Ok(true),
        Err(LaminaError::NoSuchMachine { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}
