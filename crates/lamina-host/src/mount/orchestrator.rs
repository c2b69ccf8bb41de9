//! Mount lifecycle through systemd mount and automount units.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use lamina_common::{LaminaError, LaminaResult};

use super::compose::{MountSpec, compose};
use super::unit::{MountUnit, MountUnitNames, render_automount};
use crate::systemd::{JobMode, UnitManager};

/// Installs, starts and tears down generated mount units.
///
/// Setup and teardown of a mount point are strictly sequential: each
/// call completes its reload/enable/start before returning.
#[derive(Debug, Clone)]
pub struct MountOrchestrator {
    units: Arc<dyn UnitManager>,
    unit_dir: PathBuf,
    work_root: PathBuf,
}

fn remove_if_exists(path: &Path) -> LaminaResult<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

impl MountOrchestrator {
    /// Create an orchestrator writing units to `unit_dir` and overlay work
    /// directories below `work_root`.
    pub fn new(
        units: Arc<dyn UnitManager>,
        unit_dir: impl Into<PathBuf>,
        work_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            units,
            unit_dir: unit_dir.into(),
            work_root: work_root.into(),
        }
    }

    /// Overlay work directory for the mount at `where_`.
    ///
    /// Every mount gets its own: overlayfs refuses a work directory that is
    /// in use by another mount.
    #[must_use]
    pub fn work_dir(&self, where_: &Path) -> PathBuf {
        self.work_root.join(MountUnitNames::for_path(where_).base)
    }

    /// The spec [`setup_overlay`](Self::setup_overlay) would install.
    #[must_use]
    pub fn overlay_spec(&self, ro_layers: &[PathBuf], rw_layer: Option<&Path>, where_: &Path) -> MountSpec {
        compose(ro_layers, rw_layer, &self.work_dir(where_))
    }

    /// Compose an overlay from the layers and set up its mount point.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created or systemd fails.
    pub async fn setup_overlay(
        &self,
        ro_layers: &[PathBuf],
        rw_layer: Option<&Path>,
        where_: &Path,
    ) -> LaminaResult<MountSpec> {
        let spec = self.overlay_spec(ro_layers, rw_layer, where_);
        if spec.option("workdir").is_some() {
            create_private_dir(&self.work_dir(where_))?;
        }
        self.setup(&spec, where_).await?;
        Ok(spec)
    }

    /// Install and activate the mount point at `where_`.
    ///
    /// Writes the `.mount` and `.automount` units, reloads systemd, enables
    /// and starts the automount. The mount itself is started separately by
    /// [`mount`](Self::mount).
    ///
    /// # Errors
    ///
    /// Returns [`LaminaError::MissingInstallSection`] if systemd reports that
    /// the generated automount cannot be enabled, or any systemd failure.
    pub async fn setup(&self, spec: &MountSpec, where_: &Path) -> LaminaResult<()> {
        let names = MountUnitNames::for_path(where_);

        create_private_dir(where_)?;
        std::fs::create_dir_all(&self.unit_dir)?;

        let unit = MountUnit {
            where_: where_.to_path_buf(),
            spec: spec.clone(),
        };
        std::fs::write(self.unit_dir.join(&names.mount), unit.render())?;
        std::fs::write(self.unit_dir.join(&names.automount), render_automount(where_))?;
        tracing::debug!(
            unit = %names.mount,
            what = %spec.what,
            options = %spec.options,
            "Wrote mount units"
        );

        self.units.reload().await?;

        let outcome = self
            .units
            .enable_unit_files(std::slice::from_ref(&names.automount), false, false)
            .await?;
        if !outcome.carries_install_info {
            return Err(LaminaError::MissingInstallSection {
                unit: names.automount,
            });
        }

        // Activation happens on first access, there is nothing to wait for.
        self.units.start_unit(&names.automount, JobMode::Replace).await?;

        tracing::debug!(path = %where_.display(), "Mount point set up");
        Ok(())
    }

    /// Reverse [`setup`](Self::setup): stop and disable the automount,
    /// remove both units, reload, remove the mount point.
    ///
    /// # Errors
    ///
    /// Returns an error if systemd fails or a file cannot be removed.
    pub async fn destroy(&self, where_: &Path) -> LaminaResult<()> {
        let names = MountUnitNames::for_path(where_);

        self.units
            .stop_unit(&names.automount, JobMode::Replace)
            .await?
            .wait_done()
            .await?;
        self.units
            .disable_unit_files(std::slice::from_ref(&names.automount), false)
            .await?;

        remove_if_exists(&self.unit_dir.join(&names.mount))?;
        remove_if_exists(&self.unit_dir.join(&names.automount))?;

        self.units.reload().await?;

        match std::fs::remove_dir(where_) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        let work = self.work_dir(where_);
        if work.exists() {
            if let Err(e) = std::fs::remove_dir_all(&work) {
                tracing::warn!(path = %work.display(), error = %e, "Could not remove overlay work directory");
            }
        }

        tracing::debug!(path = %where_.display(), "Mount point destroyed");
        Ok(())
    }

    /// Start the mount unit and wait for it.
    ///
    /// # Errors
    ///
    /// Returns [`LaminaError::UnitJob`] if the job does not finish with `done`.
    pub async fn mount(&self, where_: &Path) -> LaminaResult<()> {
        let unit = MountUnitNames::for_path(where_).mount;
        self.units.start_unit(&unit, JobMode::Replace).await?.wait_done().await?;
        tracing::debug!(unit = %unit, "Mounted");
        Ok(())
    }

    /// Stop the mount unit and wait for it.
    ///
    /// # Errors
    ///
    /// Returns [`LaminaError::UnitJob`] if the job does not finish with `done`.
    pub async fn unmount(&self, where_: &Path) -> LaminaResult<()> {
        let unit = MountUnitNames::for_path(where_).mount;
        self.units.stop_unit(&unit, JobMode::Replace).await?.wait_done().await?;
        tracing::debug!(unit = %unit, "Unmounted");
        Ok(())
    }

    /// Restart the mount unit and wait for it.
    ///
    /// # Errors
    ///
    /// Returns [`LaminaError::UnitJob`] if the job does not finish with `done`.
    pub async fn remount(&self, where_: &Path) -> LaminaResult<()> {
        let unit = MountUnitNames::for_path(where_).mount;
        self.units
            .restart_unit(&unit, JobMode::Replace)
            .await?
            .wait_done()
            .await?;
        tracing::debug!(unit = %unit, "Remounted");
        Ok(())
    }

    /// The spec of the installed `.mount` unit for `where_`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the unit file exists but cannot be read.
    pub fn installed_spec(&self, where_: &Path) -> LaminaResult<Option<MountSpec>> {
        let path = self.unit_dir.join(MountUnitNames::for_path(where_).mount);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(MountUnit::parse(&content).map(|unit| unit.spec)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn create_private_dir(path: &Path) -> LaminaResult<()> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)?;
    Ok(())
}
