//! Rendering and parsing of generated `.mount` / `.automount` units.

use std::path::{Path, PathBuf};

use super::compose::MountSpec;
use crate::systemd::unit_name_path_escape;

/// Unit names for a mount point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountUnitNames {
    /// The escaped mount point, without suffix.
    pub base: String,
    /// `<base>.mount`
    pub mount: String,
    /// `<base>.automount`
    pub automount: String,
}

impl MountUnitNames {
    /// Derive the unit names for `where_`.
    #[must_use]
    pub fn for_path(where_: &Path) -> Self {
        let base = unit_name_path_escape(where_);
        Self {
            mount: format!("{base}.mount"),
            automount: format!("{base}.automount"),
            base,
        }
    }
}

/// A parsed `.mount` unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountUnit {
    /// Mount point.
    pub where_: PathBuf,
    /// What is mounted there.
    pub spec: MountSpec,
}

impl MountUnit {
    /// Render the `.mount` unit.
    #[must_use]
    pub fn render(&self) -> String {
        format!(
            "[Mount]\nWhat={}\nWhere={}\nType={}\nOptions={}\n",
            self.spec.what,
            self.where_.display(),
            self.spec.fstype,
            self.spec.options
        )
    }

    /// Parse a `.mount` unit; `None` if a required key is missing.
    #[must_use]
    pub fn parse(content: &str) -> Option<Self> {
        let mut what = None;
        let mut where_ = None;
        let mut fstype = None;
        let mut options = String::new();

        for line in content.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key.trim() {
                "What" => what = Some(value.trim().to_string()),
                "Where" => where_ = Some(PathBuf::from(value.trim())),
                "Type" => fstype = Some(value.trim().to_string()),
                "Options" => value.trim().clone_into(&mut options),
                _ => {}
            }
        }

        Some(Self {
            where_: where_?,
            spec: MountSpec {
                what: what?,
                fstype: fstype.unwrap_or_else(|| "auto".to_string()),
                options,
            },
        })
    }
}

/// Render the `.automount` unit that triggers the mount at `where_`.
#[must_use]
pub fn render_automount(where_: &Path) -> String {
    format!(
        "[Automount]\nWhere={}\n\n[Install]\nWantedBy=local-fs.target\n",
        where_.display()
    )
}

/// Whether unit text has an `[Install]` section.
#[must_use]
pub fn has_install_section(content: &str) -> bool {
    content.lines().any(|l| l.trim() == "[Install]")
}
