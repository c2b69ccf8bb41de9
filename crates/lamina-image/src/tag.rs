//! Tags: symlinks in the machine directory naming another image.

use std::path::PathBuf;

use lamina_common::{ImageName, LaminaError, LaminaResult};

/// Reads and writes tag symlinks.
#[derive(Debug, Clone)]
pub struct TagStore {
    dir: PathBuf,
}

impl TagStore {
    /// Tags live in `dir` (the machine directory).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Point `tag` at `target`.
    ///
    /// # Errors
    ///
    /// Returns [`LaminaError::ImageExists`] if something named `tag`
    /// already exists.
    pub fn tag(&self, tag: &str, target: &str) -> LaminaResult<()> {
        let tag = ImageName::new(tag)?;
        std::fs::create_dir_all(&self.dir)?;

        match std::os::unix::fs::symlink(target, self.dir.join(tag.as_str())) {
            Ok(()) => {
                tracing::info!(tag = %tag, target, "Tagged image");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(LaminaError::ImageExists {
                    name: tag.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The image `tag` points to.
    ///
    /// # Errors
    ///
    /// Any failure to read the link is [`LaminaError::NotATag`].
    pub fn read_tag(&self, tag: &str) -> LaminaResult<String> {
        let not_a_tag = || LaminaError::NotATag {
            name: tag.to_string(),
        };
        if tag.is_empty() || tag.contains('/') {
            return Err(not_a_tag());
        }
        std::fs::read_link(self.dir.join(tag))
            .map_err(|_| not_a_tag())
            .and_then(|target| target.into_os_string().into_string().map_err(|_| not_a_tag()))
    }

    /// Remove `tag`, returning its previous target.
    ///
    /// # Errors
    ///
    /// Returns [`LaminaError::NotATag`] if `tag` is not a tag.
    pub fn untag(&self, tag: &str) -> LaminaResult<String> {
        let target = self.read_tag(tag)?;
        std::fs::remove_file(self.dir.join(tag))?;
        tracing::info!(tag, target = %target, "Removed tag");
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lamina_common::ErrorKind;

    #[test]
    fn tag_read_untag() {
        let temp = tempfile::tempdir().unwrap();
        let tags = TagStore::new(temp.path());

        tags.tag("stable", "web").unwrap();
        assert_eq!(tags.read_tag("stable").unwrap(), "web");
        assert_eq!(tags.untag("stable").unwrap(), "web");
        assert_eq!(tags.read_tag("stable").unwrap_err().kind(), ErrorKind::NotATag);
    }

    #[test]
    fn directories_are_not_tags() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir(temp.path().join("web")).unwrap();
        let tags = TagStore::new(temp.path());

        assert!(matches!(tags.read_tag("web"), Err(LaminaError::NotATag { .. })));
        assert!(matches!(tags.untag("web"), Err(LaminaError::NotATag { .. })));
        assert!(temp.path().join("web").is_dir());
    }

    #[test]
    fn existing_name_conflicts() {
        let temp = tempfile::tempdir().unwrap();
        let tags = TagStore::new(temp.path());
        tags.tag("stable", "a").unwrap();

        let err = tags.tag("stable", "b").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(tags.read_tag("stable").unwrap(), "a");
    }

    #[test]
    fn invalid_tag_name_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let tags = TagStore::new(temp.path());
        assert!(matches!(
            tags.tag("../escape", "a"),
            Err(LaminaError::InvalidImageName { .. })
        ));
    }
}
