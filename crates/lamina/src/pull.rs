//! Building straight from a git repository.

use std::path::{Path, PathBuf};

use lamina_common::{LaminaError, LaminaResult};
use lamina_host::process::{self, CommandLine};
use lamina_host::systemd::unit_name_escape;
use lamina_image::ImageCtl;
use reqwest::Url;

use crate::pipeline::{self, Built};
use crate::task::Task;

/// A repository to build from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitSource {
    /// URL handed to `git clone`.
    pub url: String,
    /// Directory inside the repository holding the `Laminafile`.
    pub subdir: Option<String>,
}

impl GitSource {
    /// Parse `git://...` or `git+<scheme>://...`, optionally followed by
    /// `#subdir`.
    ///
    /// # Errors
    ///
    /// Returns [`LaminaError::InvalidSource`] for other URIs.
    pub fn parse(uri: &str) -> LaminaResult<Self> {
        let invalid = |message: String| LaminaError::InvalidSource {
            uri: uri.to_string(),
            message,
        };

        let (location, fragment) = match uri.split_once('#') {
            Some((location, fragment)) => (location, Some(fragment)),
            None => (uri, None),
        };
        let parsed = Url::parse(location).map_err(|e| invalid(e.to_string()))?;

        let scheme = parsed.scheme();
        let url = if scheme == "git" {
            location.to_string()
        } else if let Some(inner) = scheme.strip_prefix("git+") {
            format!("{inner}{}", &location[scheme.len()..])
        } else {
            return Err(invalid(format!("unsupported scheme '{scheme}'")));
        };

        let subdir = fragment
            .map(|f| f.trim_matches('/'))
            .filter(|f| !f.is_empty())
            .map(str::to_string);
        if subdir.as_deref().is_some_and(|s| s.split('/').any(|c| c == "..")) {
            return Err(invalid("sub-directory must stay inside the repository".to_string()));
        }

        Ok(Self { url, subdir })
    }

    /// Where the clone lives below `sources`.
    #[must_use]
    pub fn checkout_dir(&self, sources: &Path) -> PathBuf {
        sources.join(unit_name_escape(&self.url))
    }
}

/// Clone or update the repository behind `uri`, then build it.
///
/// # Errors
///
/// Fails if the URI is invalid, git fails, or the build fails.
pub async fn pull(ctl: &ImageCtl, uri: &str, task: &Task) -> LaminaResult<Built> {
    let source = GitSource::parse(uri)?;
    let repo = source.checkout_dir(&ctl.host().paths.sources());

    let (label, command) = match tokio::fs::metadata(&repo).await {
        Ok(meta) if meta.is_dir() => {
            tracing::info!(url = %source.url, path = %repo.display(), "Updating repository");
            ("Updating", CommandLine::new("git").path_arg("-C", &repo).arg("pull"))
        }
        Ok(_) => {
            return Err(LaminaError::InvalidSource {
                uri: uri.to_string(),
                message: format!("{} is not a directory", repo.display()),
            });
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(url = %source.url, path = %repo.display(), "Cloning repository");
            if let Some(parent) = repo.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let command = CommandLine::new("git").arg("clone").arg(&source.url).arg(&repo);
            ("Cloning", command)
        }
        Err(e) => return Err(e.into()),
    };

    let sub = task.subtask(label);
    process::run_streamed(&command, sub.sink()).await?;

    let dir = match &source.subdir {
        Some(subdir) => repo.join(subdir),
        None => repo,
    };
    pipeline::build(ctl, &dir, task).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn git_scheme() {
        let source = GitSource::parse("git://example.org/images.git").unwrap();
        assert_eq!(source.url, "git://example.org/images.git");
        assert_eq!(source.subdir, None);
    }

    #[test]
    fn git_plus_scheme_and_fragment() {
        let source = GitSource::parse("git+https://example.org/images.git#web/").unwrap();
        assert_eq!(source.url, "https://example.org/images.git");
        assert_eq!(source.subdir.as_deref(), Some("web"));

        let ssh = GitSource::parse("git+ssh://git@example.org/images.git#a/b").unwrap();
        assert_eq!(ssh.url, "ssh://git@example.org/images.git");
        assert_eq!(ssh.subdir.as_deref(), Some("a/b"));
    }

    #[test]
    fn other_schemes_are_rejected() {
        for uri in ["https://example.org/images.git", "not a uri", "file:///srv/images"] {
            let err = GitSource::parse(uri).unwrap_err();
            assert!(matches!(err, LaminaError::InvalidSource { .. }), "{uri}");
        }
        assert!(GitSource::parse("git://example.org/x.git#../../etc").is_err());
    }

    #[test]
    fn checkout_dir_is_one_component() {
        let source = GitSource::parse("git+https://example.org/images.git").unwrap();
        let dir = source.checkout_dir(Path::new("/var/lib/lamina/sources"));
        assert_eq!(dir.parent(), Some(Path::new("/var/lib/lamina/sources")));
    }
}
