//! Archive sources for `UNTAR`.
//!
//! A source is a path relative to the build directory or an `http(s)` URL,
//! optionally followed by `#subdir`. Only entries below `subdir` are
//! unpacked, with `subdir` itself stripped (`1 + count('/')` leading
//! components, as `tar --strip-components` would).

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use futures::StreamExt;
use lamina_common::{LaminaError, LaminaResult};
use lamina_host::systemd::unit_name_escape;
use tokio::io::AsyncWriteExt;

/// A parsed `UNTAR` source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSource {
    /// The location without the fragment.
    pub location: String,
    /// Sub-directory to extract, if any.
    pub subdir: Option<String>,
}

impl ArchiveSource {
    /// Split `source` into location and `#subdir`.
    #[must_use]
    pub fn parse(source: &str) -> Self {
        match source.split_once('#') {
            Some((location, subdir)) if !subdir.trim_matches('/').is_empty() => Self {
                location: location.to_string(),
                subdir: Some(subdir.trim_matches('/').to_string()),
            },
            Some((location, _)) => Self {
                location: location.to_string(),
                subdir: None,
            },
            None => Self {
                location: source.to_string(),
                subdir: None,
            },
        }
    }

    /// Whether the location must be downloaded.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        self.location.starts_with("http://") || self.location.starts_with("https://")
    }

    /// Leading components removed from each entry.
    #[must_use]
    pub fn strip_components(&self) -> usize {
        self.subdir
            .as_deref()
            .map_or(0, |subdir| 1 + subdir.matches('/').count())
    }

    /// Where a download of this source is cached below `downloads`.
    #[must_use]
    pub fn cache_path(&self, downloads: &Path) -> PathBuf {
        downloads.join(unit_name_escape(&self.location))
    }
}

/// Download `url` to `target` unless it is already there.
///
/// The body is streamed into `<target>.part` and renamed once complete, so
/// an interrupted download is retried on the next build.
///
/// # Errors
///
/// Returns [`LaminaError::Download`] for HTTP failures.
pub async fn download(url: &str, target: &Path) -> LaminaResult<()> {
    if target.is_file() {
        tracing::debug!(url, path = %target.display(), "Using cached download");
        return Ok(());
    }
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let failed = |e: reqwest::Error| LaminaError::Download {
        url: url.to_string(),
        message: e.to_string(),
    };

    tracing::info!(url, "Downloading");
    let response = reqwest::get(url)
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(failed)?;

    let mut partial = target.as_os_str().to_owned();
    partial.push(".part");
    let partial = PathBuf::from(partial);
    let mut file = tokio::fs::File::create(&partial).await?;
    let mut body = response.bytes_stream();
    let mut size = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(failed)?;
        size += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&partial, target).await?;
    tracing::debug!(url, bytes = size, path = %target.display(), "Downloaded");
    Ok(())
}

/// Compression of an archive, detected from its magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Uncompressed tar.
    None,
    /// gzip.
    Gzip,
    /// zstd.
    Zstd,
    /// Anything else (xz, bzip2, ...), left to the system `tar`.
    Other,
}

impl Compression {
    /// Detect from the first bytes of the file.
    #[must_use]
    pub fn detect(head: &[u8]) -> Self {
        if head.starts_with(&[0x1f, 0x8b]) {
            Self::Gzip
        } else if head.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Self::Zstd
        } else if head.len() >= 262 && &head[257..262] == b"ustar" {
            Self::None
        } else {
            Self::Other
        }
    }

    /// Detect from the file at `path`.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read.
    pub fn of_file(path: &Path) -> io::Result<Self> {
        let mut head = Vec::with_capacity(512);
        File::open(path)?.take(512).read_to_end(&mut head)?;
        Ok(Self::detect(&head))
    }
}

/// Entry path relative to the destination, or `None` to skip the entry.
fn target_path(entry: &Path, subdir: Option<&str>, strip: usize) -> Option<PathBuf> {
    let mut components = Vec::new();
    for component in entry.components() {
        match component {
            Component::Normal(part) => components.push(part),
            Component::CurDir => {}
            // Absolute or escaping entries are never unpacked.
            _ => return None,
        }
    }

    if let Some(subdir) = subdir {
        let prefix: Vec<&str> = subdir.split('/').filter(|p| !p.is_empty()).collect();
        if components.len() < prefix.len()
            || components.iter().zip(&prefix).any(|(c, p)| c.to_str() != Some(*p))
        {
            return None;
        }
    }

    if components.len() <= strip {
        return None;
    }
    Some(components[strip..].iter().collect())
}

/// Unpack a gzip, zstd or plain tar archive into `dest`.
///
/// Returns the number of entries unpacked.
///
/// # Errors
///
/// Fails on the first entry that cannot be read or written.
pub fn unpack<'a>(
    reader: impl Read + 'a,
    compression: Compression,
    dest: &Path,
    source: &ArchiveSource,
) -> io::Result<usize> {
    let reader: Box<dyn Read + 'a> = match compression {
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(reader)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(reader)?),
        Compression::None => Box::new(reader),
        Compression::Other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unsupported archive compression",
            ));
        }
    };

    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_unpack_xattrs(true);
    archive.set_overwrite(true);

    let strip = source.strip_components();
    let mut count = 0;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let Some(rel) = target_path(&path, source.subdir.as_deref(), strip) else {
            continue;
        };

        let target = dest.join(&rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&target)?;
        count += 1;
    }
    Ok(count)
}

/// Unpack the archive file at `path` into `dest`.
///
/// # Errors
///
/// Fails if the file cannot be opened or unpacked.
pub fn unpack_file(path: &Path, dest: &Path, source: &ArchiveSource) -> io::Result<usize> {
    let compression = Compression::of_file(path)?;
    let file = BufReader::new(File::open(path)?);
    unpack(file, compression, dest, source)
}
