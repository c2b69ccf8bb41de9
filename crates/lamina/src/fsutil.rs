//! Copying trees into a mounted image.

use std::fs;
use std::io;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Copy `src` like `cp -R src dest`.
///
/// If `dest` is an existing directory (or ends in `/`), `src` lands inside
/// it under its own name; otherwise it is copied to `dest`. Returns the
/// resulting path.
///
/// # Errors
///
/// Fails if `src` cannot be read or the target cannot be written.
pub fn copy_into(src: &Path, dest: &Path) -> io::Result<PathBuf> {
    let into_dir = dest.is_dir() || dest.as_os_str().to_string_lossy().ends_with('/');
    let target = match src.file_name() {
        Some(name) if into_dir => dest.join(name),
        _ => dest.to_path_buf(),
    };

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    merge_tree(src, &target)?;
    Ok(target)
}

/// Copy everything below `src` onto `dst`, merging directories.
///
/// Symlinks are copied as symlinks and permission bits are kept. Existing
/// files are replaced.
///
/// # Errors
///
/// Fails on the first entry that cannot be copied.
pub fn merge_tree(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let target = if rel.as_os_str().is_empty() {
            dst.to_path_buf()
        } else {
            dst.join(rel)
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            if target.is_symlink() || (target.exists() && !target.is_dir()) {
                fs::remove_file(&target)?;
            }
            fs::create_dir_all(&target)?;
            let mode = entry.metadata().map_err(io::Error::from)?.permissions().mode();
            fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
        } else {
            replace(&target)?;
            if file_type.is_symlink() {
                symlink(fs::read_link(entry.path())?, &target)?;
            } else {
                fs::copy(entry.path(), &target)?;
            }
        }
        tracing::trace!(path = %target.display(), "Copied");
    }
    Ok(())
}

/// Make room for a non-directory at `path`.
fn replace(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Move the contents of `src` onto `dst` and delete `src`.
///
/// A missing `src` is not an error.
///
/// # Errors
///
/// Fails if the copy or the removal fails.
pub fn move_tree(src: &Path, dst: &Path) -> io::Result<()> {
    if fs::symlink_metadata(src).is_err() {
        return Ok(());
    }
    merge_tree(src, dst)?;
    fs::remove_dir_all(src)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_file_into_existing_dir() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("nginx.conf");
        fs::write(&src, "worker_processes 1;").unwrap();
        let dest = temp.path().join("etc");
        fs::create_dir(&dest).unwrap();

        let target = copy_into(&src, &dest).unwrap();
        assert_eq!(target, dest.join("nginx.conf"));
        assert_eq!(fs::read_to_string(target).unwrap(), "worker_processes 1;");
    }

    #[test]
    fn copy_to_new_name_and_trailing_slash() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("a");
        fs::write(&src, "a").unwrap();

        let renamed = copy_into(&src, &temp.path().join("b")).unwrap();
        assert_eq!(fs::read_to_string(renamed).unwrap(), "a");

        let slash = PathBuf::from(format!("{}/new/", temp.path().display()));
        let nested = copy_into(&src, &slash).unwrap();
        assert_eq!(nested, temp.path().join("new").join("a"));
    }

    #[test]
    fn merge_keeps_symlinks_and_existing_content() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        fs::create_dir_all(src.join("wants")).unwrap();
        fs::write(src.join("web.service"), "[Unit]").unwrap();
        symlink("../web.service", src.join("wants/web.service")).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(dst.join("keep"), "keep").unwrap();

        merge_tree(&src, &dst).unwrap();
        assert_eq!(
            fs::read_link(dst.join("wants/web.service")).unwrap(),
            PathBuf::from("../web.service")
        );
        assert!(dst.join("keep").exists());
        assert!(dst.join("web.service").exists());
    }

    #[test]
    fn move_tree_removes_source() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("etc/systemd/system");
        let dst = temp.path().join("usr/lib/systemd/system");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.service"), "a").unwrap();

        move_tree(&src, &dst).unwrap();
        assert!(!src.exists());
        assert!(dst.join("a.service").exists());

        move_tree(&temp.path().join("missing"), &dst).unwrap();
    }
}
