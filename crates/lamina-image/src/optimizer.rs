//! The layer optimizer.
//!
//! Drops content from a layer that its base already provides:
//!
//! 1. Regular files identical to the base's (size, mode, owner, bytes) are
//!    removed. Subtrees the base does not have, and opaque directories,
//!    are not descended into.
//! 2. Directories that the base also has, that are empty and not opaque,
//!    are removed, repeatedly, until a full pass removes nothing.
//!
//! The base is a stack of layer directories, nearest first, read with
//! overlay semantics: whiteouts and opaque directories hide lower layers.

use std::fs::{self, File, Metadata};
use std::io::{self, BufReader, Read};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Component, Path, PathBuf};

use lamina_common::LaminaError;
use walkdir::WalkDir;

const OPAQUE_XATTRS: [&str; 2] = ["trusted.overlay.opaque", "user.overlay.opaque"];

/// What an optimization removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizeReport {
    /// Redundant files removed.
    pub files_removed: usize,
    /// Empty directories removed.
    pub dirs_removed: usize,
    /// Size of the removed files.
    pub bytes_freed: u64,
}

impl OptimizeReport {
    /// Whether nothing was removed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files_removed == 0 && self.dirs_removed == 0
    }
}

/// Whether `path` is a directory marked opaque.
///
/// # Errors
///
/// Returns an error if the extended attributes cannot be read.
pub fn is_opaque(path: &Path) -> io::Result<bool> {
    for attr in OPAQUE_XATTRS {
        match xattr::get(path, attr) {
            Ok(Some(value)) if value == b"y" => return Ok(true),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Unsupported => return Ok(false),
            Err(e) => return Err(e),
        }
    }
    Ok(false)
}

/// Whether `meta` describes an overlay whiteout (character device 0:0).
#[must_use]
pub fn is_whiteout(meta: &Metadata) -> bool {
    meta.file_type().is_char_device() && meta.rdev() == 0
}

/// Find what the base stack shows at `rel`.
fn resolve_in_base(chain: &[PathBuf], rel: &Path) -> Option<PathBuf> {
    let components: Vec<Component<'_>> = rel.components().collect();
    let (_, ancestors) = components.split_last()?;

    for layer in chain {
        let mut dir = layer.clone();
        let mut blocked = false;
        let mut present = true;

        for component in ancestors {
            dir.push(component);
            match fs::symlink_metadata(&dir) {
                Ok(meta) if meta.is_dir() => {
                    // Unreadable markers are treated as opaque: nothing below
                    // is compared against content that might be hidden.
                    if is_opaque(&dir).unwrap_or(true) {
                        blocked = true;
                    }
                }
                // A whiteout or a non-directory hides everything below.
                Ok(_) => return None,
                Err(_) => {
                    present = false;
                    break;
                }
            }
        }

        if present {
            let candidate = layer.join(rel);
            match fs::symlink_metadata(&candidate) {
                Ok(meta) if is_whiteout(&meta) => return None,
                Ok(_) => return Some(candidate),
                Err(_) => {}
            }
        }

        if blocked {
            return None;
        }
    }

    None
}

fn base_dir(chain: &[PathBuf], rel: &Path) -> bool {
    resolve_in_base(chain, rel).is_some_and(|p| p.is_dir() && !p.is_symlink())
}

fn same_content(a: &Path, b: &Path) -> io::Result<bool> {
    let mut a = BufReader::with_capacity(64 * 1024, File::open(a)?);
    let mut b = BufReader::with_capacity(64 * 1024, File::open(b)?);
    let mut buf_a = [0u8; 8192];
    let mut buf_b = [0u8; 8192];

    loop {
        let n = a.read(&mut buf_a)?;
        if n == 0 {
            return Ok(b.read(&mut buf_b)? == 0);
        }
        let mut filled = 0;
        while filled < n {
            let m = b.read(&mut buf_b[filled..n])?;
            if m == 0 {
                return Ok(false);
            }
            filled += m;
        }
        if buf_a[..n] != buf_b[..n] {
            return Ok(false);
        }
    }
}

/// Whether the layer file `path` is identical to the base file `base`.
fn identical(path: &Path, meta: &Metadata, base: &Path) -> io::Result<bool> {
    let base_meta = fs::symlink_metadata(base)?;
    if !base_meta.is_file()
        || base_meta.len() != meta.len()
        || base_meta.mode() != meta.mode()
        || base_meta.uid() != meta.uid()
        || base_meta.gid() != meta.gid()
    {
        return Ok(false);
    }
    same_content(path, base)
}

fn display(rel: &Path) -> String {
    format!("/{}", rel.display())
}

fn io_error(path: &Path, err: impl Into<io::Error>) -> LaminaError {
    let err: io::Error = err.into();
    LaminaError::Io(io::Error::new(err.kind(), format!("{}: {err}", path.display())))
}

/// Optimize `layer` against the base stack `chain` (nearest layer first).
pub fn optimize(
    layer: &Path,
    chain: &[PathBuf],
    on_status: &mut dyn FnMut(&str),
    on_error: &mut dyn FnMut(LaminaError),
) -> OptimizeReport {
    let mut report = OptimizeReport::default();
    remove_redundant_files(layer, chain, &mut report, on_status, on_error);
    prune_empty_dirs(layer, chain, &mut report, on_status, on_error);
    tracing::debug!(
        layer = %layer.display(),
        files = report.files_removed,
        dirs = report.dirs_removed,
        bytes = report.bytes_freed,
        "Optimized layer"
    );
    report
}

fn remove_redundant_files(
    layer: &Path,
    chain: &[PathBuf],
    report: &mut OptimizeReport,
    on_status: &mut dyn FnMut(&str),
    on_error: &mut dyn FnMut(LaminaError),
) {
    let mut walker = WalkDir::new(layer).min_depth(1).into_iter();

    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().unwrap_or(layer).to_path_buf();
                on_error(io_error(&path, e));
                continue;
            }
        };
        let path = entry.path();
        let Ok(rel) = path.strip_prefix(layer) else {
            continue;
        };
        let file_type = entry.file_type();

        if file_type.is_dir() {
            if !base_dir(chain, rel) {
                walker.skip_current_dir();
                continue;
            }
            match is_opaque(path) {
                Ok(false) => {}
                Ok(true) => {
                    on_status(&format!("Found opaque subtree: {}", display(rel)));
                    walker.skip_current_dir();
                }
                Err(e) => {
                    on_error(io_error(path, e));
                    walker.skip_current_dir();
                }
            }
            continue;
        }

        if !file_type.is_file() {
            continue;
        }

        let Some(base) = resolve_in_base(chain, rel) else {
            continue;
        };
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                on_error(io_error(path, e));
                continue;
            }
        };

        match identical(path, &meta, &base) {
            Ok(true) => match fs::remove_file(path) {
                Ok(()) => {
                    report.files_removed += 1;
                    report.bytes_freed += meta.len();
                    on_status(&format!("Removed {}", display(rel)));
                    tracing::debug!(path = %path.display(), "Removed redundant file");
                }
                Err(e) => on_error(io_error(path, e)),
            },
            Ok(false) => {}
            Err(e) => on_error(io_error(path, e)),
        }
    }
}

fn is_empty_dir(path: &Path) -> io::Result<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}

fn prune_empty_dirs(
    layer: &Path,
    chain: &[PathBuf],
    report: &mut OptimizeReport,
    on_status: &mut dyn FnMut(&str),
    on_error: &mut dyn FnMut(LaminaError),
) {
    loop {
        let mut candidates = Vec::new();

        for entry in WalkDir::new(layer).min_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().unwrap_or(layer).to_path_buf();
                    on_error(io_error(&path, e));
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            let path = entry.path();
            let Ok(rel) = path.strip_prefix(layer) else {
                continue;
            };

            match is_empty_dir(path) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    on_error(io_error(path, e));
                    continue;
                }
            }
            match is_opaque(path) {
                Ok(false) => {}
                Ok(true) => continue,
                Err(e) => {
                    on_error(io_error(path, e));
                    continue;
                }
            }
            if base_dir(chain, rel) {
                candidates.push(rel.to_path_buf());
            }
        }

        let mut removed = 0;
        for rel in candidates {
            let path = layer.join(&rel);
            match fs::remove_dir(&path) {
                Ok(()) => {
                    removed += 1;
                    on_status(&format!("Removed {}/", display(&rel)));
                    tracing::debug!(path = %path.display(), "Removed empty directory");
                }
                Err(e) => on_error(io_error(&path, e)),
            }
        }

        report.dirs_removed += removed;
        if removed == 0 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    struct Layers {
        _temp: tempfile::TempDir,
        base: PathBuf,
        layer: PathBuf,
    }

    fn layers() -> Layers {
        let temp = tempfile::tempdir().unwrap();
        let base = temp.path().join("base");
        let layer = temp.path().join("layer");
        fs::create_dir_all(&base).unwrap();
        fs::create_dir_all(&layer).unwrap();
        Layers {
            _temp: temp,
            base,
            layer,
        }
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn run(l: &Layers) -> (OptimizeReport, Vec<String>, usize) {
        let mut status = Vec::new();
        let mut errors = 0;
        let report = optimize(
            &l.layer,
            std::slice::from_ref(&l.base),
            &mut |s| status.push(s.to_string()),
            &mut |_| errors += 1,
        );
        (report, status, errors)
    }

    /// Set `user.overlay.opaque`; `false` if the filesystem refuses.
    fn mark_opaque(path: &Path) -> bool {
        xattr::set(path, "user.overlay.opaque", b"y").is_ok()
    }

    #[test]
    fn removes_identical_file() {
        let l = layers();
        write(&l.base, "etc/x", "v1");
        write(&l.layer, "etc/x", "v1");

        let (report, status, errors) = run(&l);
        assert_eq!(errors, 0);
        assert_eq!(report.files_removed, 1);
        assert_eq!(report.bytes_freed, 2);
        assert!(!l.layer.join("etc/x").exists());
        assert!(status.contains(&"Removed /etc/x".to_string()));
        // etc/ was left empty and exists in the base.
        assert!(!l.layer.join("etc").exists());
        assert_eq!(report.dirs_removed, 1);
        assert!(l.layer.is_dir());
    }

    #[test]
    fn keeps_files_that_differ() {
        let l = layers();
        write(&l.base, "size", "abc");
        write(&l.layer, "size", "abcd");
        write(&l.base, "byte", "abc");
        write(&l.layer, "byte", "abd");
        write(&l.base, "mode", "abc");
        write(&l.layer, "mode", "abc");
        fs::set_permissions(l.layer.join("mode"), fs::Permissions::from_mode(0o600)).unwrap();
        fs::set_permissions(l.base.join("mode"), fs::Permissions::from_mode(0o644)).unwrap();
        write(&l.layer, "new", "x");

        let (report, _, errors) = run(&l);
        assert_eq!(errors, 0);
        assert!(report.is_empty());
        for name in ["size", "byte", "mode", "new"] {
            assert!(l.layer.join(name).exists(), "{name} was removed");
        }
    }

    #[test]
    fn skips_subtrees_missing_from_base() {
        let l = layers();
        write(&l.layer, "opt/app/file", "x");
        fs::create_dir_all(l.layer.join("opt/empty")).unwrap();

        let (report, _, _) = run(&l);
        assert!(report.is_empty());
        assert!(l.layer.join("opt/empty").is_dir());
    }

    #[test]
    fn prunes_nested_empty_dirs_to_fixpoint() {
        let l = layers();
        fs::create_dir_all(l.base.join("a/b/c")).unwrap();
        fs::create_dir_all(l.layer.join("a/b/c")).unwrap();

        let (report, _, _) = run(&l);
        assert_eq!(report.dirs_removed, 3);
        assert!(!l.layer.join("a").exists());
    }

    #[test]
    fn second_run_removes_nothing() {
        let l = layers();
        write(&l.base, "etc/x", "v1");
        write(&l.layer, "etc/x", "v1");
        write(&l.layer, "etc/y", "mine");

        let (first, _, _) = run(&l);
        assert_eq!(first.files_removed, 1);
        let (second, status, _) = run(&l);
        assert!(second.is_empty());
        assert!(status.is_empty());
        assert!(l.layer.join("etc/y").exists());
    }

    #[test]
    fn opaque_dirs_are_left_alone() {
        let l = layers();
        write(&l.base, "var/cache/x", "v1");
        write(&l.layer, "var/cache/x", "v1");
        fs::create_dir_all(l.base.join("var/empty")).unwrap();
        fs::create_dir_all(l.layer.join("var/empty")).unwrap();
        if !mark_opaque(&l.layer.join("var/cache")) || !mark_opaque(&l.layer.join("var/empty")) {
            eprintln!("user xattrs unsupported here, skipping");
            return;
        }

        let (report, status, errors) = run(&l);
        assert_eq!(errors, 0);
        assert!(report.is_empty());
        assert!(l.layer.join("var/cache/x").exists());
        assert!(l.layer.join("var/empty").is_dir());
        assert!(status.contains(&"Found opaque subtree: /var/cache".to_string()), "{status:?}");
        assert!(status.contains(&"Found opaque subtree: /var/empty".to_string()), "{status:?}");
    }

    #[test]
    fn resolves_through_nearest_layer() {
        let temp = tempfile::tempdir().unwrap();
        let near = temp.path().join("near");
        let far = temp.path().join("far");
        write(&far, "etc/x", "far");
        write(&near, "etc/x", "near");
        write(&far, "etc/only-far", "f");

        let chain = vec![near, far.clone()];
        assert_eq!(
            resolve_in_base(&chain, Path::new("etc/x")),
            Some(chain[0].join("etc/x"))
        );
        assert_eq!(
            resolve_in_base(&chain, Path::new("etc/only-far")),
            Some(far.join("etc/only-far"))
        );
        assert_eq!(resolve_in_base(&chain, Path::new("etc/none")), None);
    }

    #[test]
    fn non_directory_in_near_layer_hides_far_layer() {
        let temp = tempfile::tempdir().unwrap();
        let near = temp.path().join("near");
        let far = temp.path().join("far");
        write(&far, "etc/x", "far");
        write(&near, "etc", "now a file");

        assert_eq!(resolve_in_base(&[near, far], Path::new("etc/x")), None);
    }
}
