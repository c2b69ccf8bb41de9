//! # lamina-host
//!
//! The host services Lamina drives, at their narrow contract.
//!
//! This crate provides:
//! - systemd unit-name escaping and the [`UnitManager`] contract
//! - the machined [`MachineRegistry`] contract
//! - the [`MountOrchestrator`], which realises overlay compositions as
//!   systemd mount units
//! - child process execution with concurrent output draining
//! - fakes for all of the above behind the `testing` feature

#![warn(missing_docs)]

pub mod machine;
pub mod mount;
pub mod nspawn;
pub mod process;
pub mod systemd;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::path::PathBuf;
use std::sync::Arc;

use lamina_common::{LaminaConfig, LaminaPaths};

pub use machine::{ImageDescriptor, MachineHandle, MachineRegistry, Machinectl};
pub use mount::{MountOrchestrator, MountSpec};
pub use nspawn::NspawnCommand;
pub use systemd::{Systemctl, UnitManager};

/// Handle to everything outside the process: storage locations, the
/// init-system manager and the container registry.
///
/// Passed explicitly to every component so tests can substitute fakes.
#[derive(Debug, Clone)]
pub struct Host {
    /// On-disk locations.
    pub paths: LaminaPaths,
    /// The init-system manager.
    pub units: Arc<dyn UnitManager>,
    /// The container registry.
    pub machines: Arc<dyn MachineRegistry>,
    /// How build containers are started.
    pub nspawn: NspawnCommand,
}

impl Host {
    /// Create a host handle without extra container binds.
    pub fn new(
        paths: LaminaPaths,
        units: Arc<dyn UnitManager>,
        machines: Arc<dyn MachineRegistry>,
    ) -> Self {
        Self {
            paths,
            units,
            machines,
            nspawn: NspawnCommand::default(),
        }
    }

    /// Bind-mount `binds` into build containers.
    #[must_use]
    pub fn with_binds(mut self, binds: Vec<PathBuf>) -> Self {
        self.nspawn = NspawnCommand::new(binds);
        self
    }

    /// The real system: `systemctl`, `machinectl`, configured paths.
    #[must_use]
    pub fn system(config: &LaminaConfig) -> Self {
        Self::new(
            config.resolve_paths(LaminaPaths::new()),
            Arc::new(Systemctl::new()),
            Arc::new(Machinectl::new()),
        )
        .with_binds(config.existing_binds())
    }

    /// A mount orchestrator writing to this host's unit directory.
    #[must_use]
    pub fn orchestrator(&self) -> MountOrchestrator {
        MountOrchestrator::new(
            Arc::clone(&self.units),
            self.paths.units.clone(),
            self.paths.overlay_work(),
        )
    }
}
