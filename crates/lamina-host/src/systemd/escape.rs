//! systemd unit name escaping.
//!
//! Mirrors `systemd-escape` and `systemd-escape --path`: bytes outside
//! `[A-Za-z0-9:_.]` (and a leading `.`) become `\xNN`, `/` becomes `-`.

use std::fmt::Write;
use std::path::Path;

fn is_allowed(c: u8) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, b':' | b'_' | b'.')
}

fn escape(input: &[u8], is_path: bool) -> String {
    let mut escaped = String::with_capacity(input.len());
    let mut in_slashes = false;
    let mut start = true;

    for &c in input {
        if is_path {
            if c == b'/' {
                in_slashes = true;
                continue;
            } else if in_slashes {
                if !start {
                    escaped.push('-');
                }
                in_slashes = false;
            }
        }

        if c == b'/' {
            escaped.push('-');
        } else if (start && c == b'.') || !is_allowed(c) {
            let _ = write!(escaped, "\\x{c:02x}");
        } else {
            escaped.push(char::from(c));
        }
        start = false;
    }

    if is_path && escaped.is_empty() {
        escaped.push('-');
    }

    escaped
}

/// Escape an arbitrary string for use in a unit name.
#[must_use]
pub fn unit_name_escape(input: &str) -> String {
    escape(input.as_bytes(), false)
}

/// Escape a path for use in a unit name (`foo.mount` for mount point `/foo`).
///
/// Duplicate, leading and trailing slashes are dropped; the root directory
/// escapes to `-`.
#[must_use]
pub fn unit_name_path_escape(path: &Path) -> String {
    use std::os::unix::ffi::OsStrExt;

    escape(path.as_os_str().as_bytes(), true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn escapes_paths() {
        assert_eq!(
            unit_name_path_escape(&PathBuf::from("/var/lib/machines/web")),
            "var-lib-machines-web"
        );
        assert_eq!(unit_name_path_escape(&PathBuf::from("/")), "-");
        assert_eq!(unit_name_path_escape(&PathBuf::from("//a//b/")), "a-b");
    }

    #[test]
    fn escapes_special_bytes_in_paths() {
        assert_eq!(
            unit_name_path_escape(&PathBuf::from("/var/lib/machines/my-image")),
            "var-lib-machines-my\\x2dimage"
        );
        assert_eq!(
            unit_name_path_escape(&PathBuf::from("/.hidden")),
            "\\x2ehidden"
        );
    }

    #[test]
    fn escapes_strings() {
        assert_eq!(
            unit_name_escape("https://example.com/a.tar"),
            "https:--example.com-a.tar"
        );
        assert_eq!(unit_name_escape("a b"), "a\\x20b");
        assert_eq!(unit_name_escape(".x"), "\\x2ex");
    }
}
