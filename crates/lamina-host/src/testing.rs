//! In-process fakes of the host services.
//!
//! [`FakeUnitManager`] reads the generated `.mount` units and materialises
//! them by copying: a tmpfs becomes an empty directory, a bind copies the
//! source, an overlay copies its lower layers from the lowest priority up
//! and the upper layer last (whiteouts delete). The mounted view is a
//! snapshot; writes to it do not reach the layers.

use std::collections::{BTreeMap, BTreeSet};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use lamina_common::{LaminaError, LaminaResult};

use crate::machine::{ImageDescriptor, MachineHandle, MachineRegistry};
use crate::mount::{MountUnit, Strategy, has_install_section};
use crate::systemd::{EnableOutcome, JOB_DONE, Job, JobMode, UnitChange, UnitManager};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unit_missing(verb: &str, unit: &str) -> LaminaError {
    LaminaError::Command {
        command: format!("systemctl {verb} {unit}"),
        output: format!("Unit {unit} not found."),
    }
}

/// Remove everything inside `dir`, keeping `dir` itself.
fn clear_dir(dir: &Path) -> std::io::Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() && !path.is_symlink() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

fn remove_any(path: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Copy the tree at `src` over `dst`, merging directories.
///
/// Character devices 0:0 (overlay whiteouts) delete the entry at `dst`.
pub fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;

    for entry in walkdir::WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry.path().strip_prefix(src).map_err(std::io::Error::other)?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            if target.symlink_metadata().is_ok_and(|m| !m.is_dir()) {
                remove_any(&target)?;
            }
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            remove_any(&target)?;
            std::os::unix::fs::symlink(std::fs::read_link(entry.path())?, &target)?;
        } else if file_type.is_char_device() {
            if entry.metadata().map_err(std::io::Error::other)?.rdev() == 0 {
                remove_any(&target)?;
            }
        } else if file_type.is_file() {
            if target.symlink_metadata().is_ok_and(|m| m.is_dir()) {
                remove_any(&target)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}

#[derive(Debug, Default)]
struct UnitState {
    calls: Vec<String>,
    enabled: BTreeSet<String>,
    active: BTreeSet<String>,
    failures: BTreeMap<String, String>,
    reloads: usize,
}

/// A systemd manager that keeps unit state in memory.
#[derive(Debug)]
pub struct FakeUnitManager {
    unit_dir: PathBuf,
    state: Mutex<UnitState>,
}

impl FakeUnitManager {
    /// Serve units written to `unit_dir`.
    pub fn new(unit_dir: impl Into<PathBuf>) -> Self {
        Self {
            unit_dir: unit_dir.into(),
            state: Mutex::new(UnitState::default()),
        }
    }

    /// Every call so far, e.g. `"start a.mount"`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        lock(&self.state).calls.clear();
    }

    /// Number of `daemon-reload`s.
    #[must_use]
    pub fn reloads(&self) -> usize {
        lock(&self.state).reloads
    }

    /// Whether `unit` is enabled.
    #[must_use]
    pub fn is_enabled(&self, unit: &str) -> bool {
        lock(&self.state).enabled.contains(unit)
    }

    /// Whether `unit` is active.
    #[must_use]
    pub fn is_active(&self, unit: &str) -> bool {
        lock(&self.state).active.contains(unit)
    }

    /// Make every following job on `unit` finish with `result`.
    pub fn fail_unit(&self, unit: &str, result: &str) {
        lock(&self.state)
            .failures
            .insert(unit.to_string(), result.to_string());
    }

    /// Let jobs on `unit` succeed again.
    pub fn clear_failure(&self, unit: &str) {
        lock(&self.state).failures.remove(unit);
    }

    fn record(&self, call: String) -> Option<String> {
        let mut state = lock(&self.state);
        let unit = call.rsplit(' ').next().unwrap_or_default().to_string();
        state.calls.push(call);
        state.failures.get(&unit).cloned()
    }

    fn read_unit(&self, verb: &str, unit: &str) -> LaminaResult<String> {
        std::fs::read_to_string(self.unit_dir.join(unit)).map_err(|_| unit_missing(verb, unit))
    }

    fn read_mount(&self, verb: &str, unit: &str) -> LaminaResult<MountUnit> {
        let content = self.read_unit(verb, unit)?;
        MountUnit::parse(&content).ok_or_else(|| LaminaError::Command {
            command: format!("systemctl {verb} {unit}"),
            output: format!("Unit {unit} has a bad unit file setting."),
        })
    }

    fn activate(&self, unit: &str) -> LaminaResult<()> {
        if unit.ends_with(".mount") {
            let mount = self.read_mount("start", unit)?;
            std::fs::create_dir_all(&mount.where_)?;
            clear_dir(&mount.where_)?;

            match mount.spec.strategy() {
                Strategy::Tmpfs => {}
                Strategy::Bind => copy_tree(Path::new(&mount.spec.what), &mount.where_)?,
                Strategy::Overlay => {
                    for lower in mount.spec.lower_dirs().iter().rev() {
                        copy_tree(lower, &mount.where_)?;
                    }
                    if let Some(upper) = mount.spec.option("upperdir") {
                        copy_tree(Path::new(upper), &mount.where_)?;
                    }
                }
            }
        } else {
            self.read_unit("start", unit)?;
        }

        lock(&self.state).active.insert(unit.to_string());
        Ok(())
    }

    fn deactivate(&self, unit: &str) -> LaminaResult<()> {
        let was_active = lock(&self.state).active.remove(unit);
        if was_active && unit.ends_with(".mount") {
            let mount = self.read_mount("stop", unit)?;
            clear_dir(&mount.where_)?;
        }
        Ok(())
    }
}

#[async_trait]
impl UnitManager for FakeUnitManager {
    async fn reload(&self) -> LaminaResult<()> {
        let mut state = lock(&self.state);
        state.calls.push("reload".to_string());
        state.reloads += 1;
        Ok(())
    }

    async fn enable_unit_files(
        &self,
        names: &[String],
        _runtime: bool,
        _force: bool,
    ) -> LaminaResult<EnableOutcome> {
        let mut outcome = EnableOutcome {
            carries_install_info: true,
            changes: Vec::new(),
        };

        for name in names {
            self.record(format!("enable {name}"));
            let content = self.read_unit("enable", name)?;
            if has_install_section(&content) {
                lock(&self.state).enabled.insert(name.clone());
                outcome.changes.push(UnitChange::Symlink {
                    path: self
                        .unit_dir
                        .join("local-fs.target.wants")
                        .join(name)
                        .display()
                        .to_string(),
                    target: self.unit_dir.join(name).display().to_string(),
                });
            } else {
                outcome.carries_install_info = false;
            }
        }

        Ok(outcome)
    }

    async fn disable_unit_files(
        &self,
        names: &[String],
        _runtime: bool,
    ) -> LaminaResult<Vec<UnitChange>> {
        let mut changes = Vec::new();
        for name in names {
            self.record(format!("disable {name}"));
            if lock(&self.state).enabled.remove(name) {
                changes.push(UnitChange::Unlink {
                    path: self
                        .unit_dir
                        .join("local-fs.target.wants")
                        .join(name)
                        .display()
                        .to_string(),
                });
            }
        }
        Ok(changes)
    }

    async fn start_unit(&self, name: &str, _mode: JobMode) -> LaminaResult<Job> {
        if let Some(result) = self.record(format!("start {name}")) {
            return Ok(Job::completed(name, result));
        }
        self.activate(name)?;
        Ok(Job::completed(name, JOB_DONE))
    }

    async fn stop_unit(&self, name: &str, _mode: JobMode) -> LaminaResult<Job> {
        if let Some(result) = self.record(format!("stop {name}")) {
            return Ok(Job::completed(name, result));
        }
        self.deactivate(name)?;
        Ok(Job::completed(name, JOB_DONE))
    }

    async fn restart_unit(&self, name: &str, _mode: JobMode) -> LaminaResult<Job> {
        if let Some(result) = self.record(format!("restart {name}")) {
            return Ok(Job::completed(name, result));
        }
        self.deactivate(name)?;
        self.activate(name)?;
        Ok(Job::completed(name, JOB_DONE))
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    images: BTreeMap<String, ImageDescriptor>,
    machines: BTreeMap<String, MachineHandle>,
}

/// A machine registry that keeps images and machines in memory.
#[derive(Debug)]
pub struct FakeMachineRegistry {
    image_dir: PathBuf,
    state: Mutex<RegistryState>,
}

impl FakeMachineRegistry {
    /// Create a registry whose images live in `image_dir`.
    pub fn new(image_dir: impl Into<PathBuf>) -> Self {
        Self {
            image_dir: image_dir.into(),
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Register a directory image at `<image_dir>/<name>`, creating it.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn add_image(&self, name: &str, read_only: bool) -> LaminaResult<ImageDescriptor> {
        let path = self.image_dir.join(name);
        std::fs::create_dir_all(&path)?;
        let descriptor = ImageDescriptor {
            name: name.to_string(),
            path,
            image_type: "directory".to_string(),
            read_only,
        };
        lock(&self.state)
            .images
            .insert(name.to_string(), descriptor.clone());
        Ok(descriptor)
    }

    /// Pretend a container named `name` is running.
    pub fn start_machine(&self, name: &str) {
        lock(&self.state).machines.insert(
            name.to_string(),
            MachineHandle {
                name: name.to_string(),
                class: "container".to_string(),
                leader: Some(1),
            },
        );
    }

    /// Stop the pretend container `name`.
    pub fn stop_machine(&self, name: &str) {
        lock(&self.state).machines.remove(name);
    }

    fn no_such_image(name: &str) -> LaminaError {
        LaminaError::NoSuchImage {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl MachineRegistry for FakeMachineRegistry {
    async fn get_image(&self, name: &str) -> LaminaResult<ImageDescriptor> {
        lock(&self.state)
            .images
            .get(name)
            .cloned()
            .ok_or_else(|| Self::no_such_image(name))
    }

    async fn get_machine(&self, name: &str) -> LaminaResult<MachineHandle> {
        lock(&self.state)
            .machines
            .get(name)
            .cloned()
            .ok_or_else(|| LaminaError::NoSuchMachine {
                name: name.to_string(),
            })
    }

    async fn list_images(&self) -> LaminaResult<Vec<ImageDescriptor>> {
        Ok(lock(&self.state).images.values().cloned().collect())
    }

    async fn remove_image(&self, name: &str) -> LaminaResult<()> {
        let descriptor = lock(&self.state)
            .images
            .remove(name)
            .ok_or_else(|| Self::no_such_image(name))?;
        remove_any(&descriptor.path)?;
        Ok(())
    }

    async fn mark_image_read_only(&self, name: &str, read_only: bool) -> LaminaResult<()> {
        lock(&self.state)
            .images
            .get_mut(name)
            .map(|image| image.read_only = read_only)
            .ok_or_else(|| Self::no_such_image(name))
    }
}
