//! Common error types for the Lamina tools.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`LaminaError`].
pub type LaminaResult<T> = Result<T, LaminaError>;

/// Coarse classification of a [`LaminaError`].
///
/// Callers that need to react to a failure (the CLI, the build pipeline,
/// tests) match on the kind rather than on individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No such image, tag, base or machine.
    NotFound,
    /// The image already exists, or the base is writable.
    Conflict,
    /// A container is currently running against the image.
    Busy,
    /// The backing store cannot perform the operation.
    Impossible,
    /// The name is not a tag.
    NotATag,
    /// Failure reported by systemd, machined or a child process.
    External,
    /// Malformed input (names, build scripts, arguments).
    Invalid,
    /// Bug or broken invariant.
    Internal,
}

/// Common errors across the Lamina tools.
#[derive(Error, Diagnostic, Debug)]
pub enum LaminaError {
    /// Image not found.
    #[error("Image not found: {name}")]
    #[diagnostic(code(lamina::image::not_found))]
    NoSuchImage {
        /// The image name that was not found.
        name: String,
    },

    /// Base image not found while creating or rebasing an image.
    #[error("Base image does not exist: {name}")]
    #[diagnostic(code(lamina::image::base_not_found))]
    BaseDoesNotExist {
        /// The base image name.
        name: String,
    },

    /// No running machine uses the image.
    #[error("No machine named {name}")]
    #[diagnostic(code(lamina::machine::not_found))]
    NoSuchMachine {
        /// The machine name.
        name: String,
    },

    /// The name does not refer to a tag.
    #[error("Not a tag: {name}")]
    #[diagnostic(code(lamina::tag::not_a_tag))]
    NotATag {
        /// The name that was looked up.
        name: String,
    },

    /// An image with this name already exists.
    #[error("Image already exists: {name}")]
    #[diagnostic(
        code(lamina::image::exists),
        help("Refusing to overwrite. Remove the existing image or pick another name")
    )]
    ImageExists {
        /// The conflicting name.
        name: String,
    },

    /// The base image is writable.
    #[error("Base image is writable: {name}")]
    #[diagnostic(
        code(lamina::image::base_writable),
        help("Freeze it first: lamina set-read-only {name}")
    )]
    BaseWritable {
        /// The base image name.
        name: String,
    },

    /// Rebasing would make the image its own ancestor.
    #[error("Image {name} cannot be based on {base}: {base} already derives from it")]
    #[diagnostic(code(lamina::image::base_cycle))]
    BaseCycle {
        /// The image being rebased.
        name: String,
        /// The requested base.
        base: String,
    },

    /// Other layered images are built on the image.
    #[error("Image {name} is the base of {dependents}")]
    #[diagnostic(
        code(lamina::image::base_in_use),
        help("Remove or rebase the images built on it first")
    )]
    BaseInUse {
        /// The image being removed.
        name: String,
        /// Comma-separated names of the images built on it.
        dependents: String,
    },

    /// The image is used by a running machine.
    #[error("Image is alive: {name}")]
    #[diagnostic(
        code(lamina::image::alive),
        help("The image is currently running as a machine. Stop it first: machinectl stop {name}")
    )]
    ImageAlive {
        /// The image name.
        name: String,
    },

    /// The backing store cannot perform the operation.
    #[error("Impossible operation on {name}: {operation}")]
    #[diagnostic(code(lamina::image::impossible))]
    Impossible {
        /// The image name.
        name: String,
        /// The attempted operation.
        operation: String,
    },

    /// Invalid image name format.
    #[error("Invalid image name: {name}")]
    #[diagnostic(
        code(lamina::image::invalid_name),
        help("Image names must be 1-64 characters of letters, digits, '-', '_' and '.', not starting with '.'")
    )]
    InvalidImageName {
        /// The invalid name.
        name: String,
    },

    /// A build instruction got too few arguments.
    #[error("{instruction} requires at least {expected} argument(s)")]
    #[diagnostic(code(lamina::build::not_enough_arguments))]
    NotEnoughArguments {
        /// The instruction word.
        instruction: String,
        /// Minimum number of arguments.
        expected: usize,
    },

    /// Unknown build instruction.
    #[error("Unknown command: {instruction}")]
    #[diagnostic(
        code(lamina::build::unknown_instruction),
        help("Known commands: ID FROM NAME VERSION RUN COPY UNTAR SET ADD_UNIT ENABLE")
    )]
    UnknownInstruction {
        /// The instruction word.
        instruction: String,
    },

    /// Build script syntax error.
    #[error("Invalid line {line}: {message}")]
    #[diagnostic(code(lamina::build::parse))]
    Parse {
        /// 1-based line number.
        line: usize,
        /// What went wrong.
        message: String,
    },

    /// A systemd job finished with a result other than `done`.
    #[error("Job for {unit} finished with result '{result}'")]
    #[diagnostic(
        code(lamina::systemd::job),
        help("See 'systemctl status {unit}' and 'journalctl -xeu {unit}' for details")
    )]
    UnitJob {
        /// The unit name.
        unit: String,
        /// The raw job result string.
        result: String,
    },

    /// A generated unit cannot be enabled.
    #[error("Internal error: Auto-generated {unit} does not have an [Install] section")]
    #[diagnostic(
        code(lamina::systemd::missing_install),
        help("This is a bug, please report it at https://github.com/lamina-images/lamina/issues")
    )]
    MissingInstallSection {
        /// The unit name.
        unit: String,
    },

    /// A child process failed.
    #[error("Command failed: {command}\n{output}")]
    #[diagnostic(code(lamina::command))]
    Command {
        /// The command line that was run.
        command: String,
        /// Exit status and the captured tail of its output.
        output: String,
    },

    /// A build source could not be downloaded.
    #[error("Failed to download {url}: {message}")]
    #[diagnostic(code(lamina::build::download))]
    Download {
        /// The source URL.
        url: String,
        /// What went wrong.
        message: String,
    },

    /// A pull URI that cannot be fetched.
    #[error("Unsupported source {uri}: {message}")]
    #[diagnostic(
        code(lamina::pull::source),
        help("Use git://host/repo or git+https://host/repo, optionally followed by #subdir")
    )]
    InvalidSource {
        /// The URI as given.
        uri: String,
        /// What is wrong with it.
        message: String,
    },

    /// The container registry rejected a request.
    #[error("Registry error: {message}")]
    #[diagnostic(code(lamina::registry))]
    Registry {
        /// The error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(lamina::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(lamina::serialization))]
    Serialization(String),

    /// Permission denied.
    #[error("Permission denied: {operation}")]
    #[diagnostic(
        code(lamina::permission_denied),
        help("Try running with elevated privileges (sudo)")
    )]
    PermissionDenied {
        /// The operation that was denied.
        operation: String,
    },

    /// Feature not supported.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(code(lamina::unsupported))]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(lamina::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(lamina::internal),
        help("This is a bug, please report it at https://github.com/lamina-images/lamina/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl LaminaError {
    /// Classify the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NoSuchImage { .. } | Self::BaseDoesNotExist { .. } | Self::NoSuchMachine { .. } => {
                ErrorKind::NotFound
            }
            Self::ImageExists { .. }
            | Self::BaseWritable { .. }
            | Self::BaseCycle { .. }
            | Self::BaseInUse { .. } => ErrorKind::Conflict,
            Self::ImageAlive { .. } => ErrorKind::Busy,
            Self::Impossible { .. } => ErrorKind::Impossible,
            Self::NotATag { .. } => ErrorKind::NotATag,
            Self::UnitJob { .. }
            | Self::Command { .. }
            | Self::Registry { .. }
            | Self::Download { .. }
            | Self::Io(_)
            | Self::PermissionDenied { .. } => ErrorKind::External,
            Self::InvalidImageName { .. }
            | Self::NotEnoughArguments { .. }
            | Self::UnknownInstruction { .. }
            | Self::Parse { .. }
            | Self::InvalidSource { .. }
            | Self::Config { .. }
            | Self::Unsupported { .. } => ErrorKind::Invalid,
            Self::MissingInstallSection { .. } | Self::Serialization(_) | Self::Internal { .. } => {
                ErrorKind::Internal
            }
        }
    }

    /// Shorthand for `kind() == ErrorKind::NotFound`.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound)
    }
}

impl From<serde_json::Error> for LaminaError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for LaminaError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = LaminaError::NoSuchImage {
            name: "abc123".to_string(),
        };
        assert_eq!(err.to_string(), "Image not found: abc123");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: LaminaError = io_err.into();
        assert!(matches!(err, LaminaError::Io(_)));
        assert_eq!(err.kind(), ErrorKind::External);
    }

    #[test]
    fn error_kinds() {
        let alive = LaminaError::ImageAlive {
            name: "web".to_string(),
        };
        assert_eq!(alive.kind(), ErrorKind::Busy);

        let writable = LaminaError::BaseWritable {
            name: "base".to_string(),
        };
        assert_eq!(writable.kind(), ErrorKind::Conflict);

        let job = LaminaError::UnitJob {
            unit: "var-lib-machines-web.mount".to_string(),
            result: "timeout".to_string(),
        };
        assert_eq!(job.kind(), ErrorKind::External);
        assert!(job.to_string().contains("'timeout'"));

        assert!(
            LaminaError::BaseDoesNotExist {
                name: "x".to_string()
            }
            .is_not_found()
        );
    }
}
