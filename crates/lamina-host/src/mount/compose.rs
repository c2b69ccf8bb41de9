//! Mount composition: read-only layers plus an optional writable layer.

use std::path::{Path, PathBuf};

/// What a mount unit mounts, and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Mount source (`What=`).
    pub what: String,
    /// Filesystem type (`Type=`).
    pub fstype: String,
    /// Mount options (`Options=`).
    pub options: String,
}

/// How a composition is realised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Ephemeral empty filesystem.
    Tmpfs,
    /// Bind mount of a single directory.
    Bind,
    /// Overlay filesystem.
    Overlay,
}

impl MountSpec {
    fn new(what: impl Into<String>, fstype: &str, options: impl Into<String>) -> Self {
        Self {
            what: what.into(),
            fstype: fstype.to_string(),
            options: options.into(),
        }
    }

    /// The strategy this spec uses.
    #[must_use]
    pub fn strategy(&self) -> Strategy {
        match self.fstype.as_str() {
            "tmpfs" => Strategy::Tmpfs,
            "overlay" => Strategy::Overlay,
            _ => Strategy::Bind,
        }
    }

    /// Whether the composed view is read-only.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        match self.strategy() {
            Strategy::Tmpfs => true,
            Strategy::Bind => self.options.split(',').any(|o| o == "ro"),
            Strategy::Overlay => !self.options.contains("upperdir="),
        }
    }

    /// Value of a `key=value` mount option.
    #[must_use]
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.split(',').find_map(|opt| {
            opt.split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }

    /// Overlay lower directories, highest priority first.
    #[must_use]
    pub fn lower_dirs(&self) -> Vec<PathBuf> {
        self.option("lowerdir")
            .map(|dirs| dirs.split(':').map(PathBuf::from).collect())
            .unwrap_or_default()
    }
}

fn join(paths: &[&Path]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(":")
}

/// Compose a mount from read-only layers and an optional writable layer.
///
/// `ro_layers` is ordered from the most distant ancestor to the nearest;
/// overlayfs wants the highest priority first, so the order is reversed.
/// `work_dir` is only used when there is a writable layer on top of at
/// least one read-only layer.
#[must_use]
pub fn compose(ro_layers: &[PathBuf], rw_layer: Option<&Path>, work_dir: &Path) -> MountSpec {
    let lower: Vec<&Path> = ro_layers.iter().rev().map(PathBuf::as_path).collect();

    match (lower.as_slice(), rw_layer) {
        ([], None) => MountSpec::new("tmpfs", "tmpfs", "ro"),
        ([single], None) => MountSpec::new(single.display().to_string(), "none", "bind,ro"),
        (lower, None) => MountSpec::new("overlay", "overlay", format!("lowerdir={}", join(lower))),
        ([], Some(rw)) => MountSpec::new(rw.display().to_string(), "none", "bind"),
        (lower, Some(rw)) => MountSpec::new(
            "overlay",
            "overlay",
            format!(
                "lowerdir={},upperdir={},workdir={}",
                join(lower),
                rw.display(),
                work_dir.display()
            ),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn empty_is_tmpfs() {
        let spec = compose(&[], None, Path::new("/w"));
        assert_eq!(spec, MountSpec::new("tmpfs", "tmpfs", "ro"));
        assert_eq!(spec.strategy(), Strategy::Tmpfs);
        assert!(spec.is_read_only());
    }

    #[test]
    fn single_ro_is_bind() {
        let spec = compose(&paths(&["/a"]), None, Path::new("/w"));
        assert_eq!(spec, MountSpec::new("/a", "none", "bind,ro"));
        assert!(spec.is_read_only());
    }

    #[test]
    fn many_ro_is_reversed_overlay() {
        let spec = compose(&paths(&["/a", "/b", "/c"]), None, Path::new("/w"));
        assert_eq!(spec.fstype, "overlay");
        assert_eq!(spec.options, "lowerdir=/c:/b:/a");
        assert_eq!(spec.lower_dirs(), paths(&["/c", "/b", "/a"]));
        assert!(spec.is_read_only());
    }

    #[test]
    fn rw_only_is_bind() {
        let spec = compose(&[], Some(Path::new("/rw")), Path::new("/w"));
        assert_eq!(spec, MountSpec::new("/rw", "none", "bind"));
        assert!(!spec.is_read_only());
    }

    #[test]
    fn ro_and_rw_is_overlay_with_upper() {
        let spec = compose(&paths(&["/a", "/b"]), Some(Path::new("/rw")), Path::new("/w"));
        assert_eq!(spec.options, "lowerdir=/b:/a,upperdir=/rw,workdir=/w");
        assert_eq!(spec.option("upperdir"), Some("/rw"));
        assert_eq!(spec.option("workdir"), Some("/w"));
        assert!(!spec.is_read_only());
    }
}
