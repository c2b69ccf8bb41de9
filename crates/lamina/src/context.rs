//! Executes build instructions against the image being built.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use lamina_common::{LaminaError, LaminaResult};
use lamina_host::process::{self, CommandLine};
use lamina_image::{Image, ImageCtl, LayeredImage};

use crate::archive::{self, ArchiveSource, Compression};
use crate::fsutil;
use crate::laminafile::{Instruction, Step};
use crate::task::Task;

/// Where `ADD_UNIT` and `ENABLE` install unit files.
const UNIT_DIR: &str = "/usr/lib/systemd/system/";

/// `name` with `.service` appended unless it already names a service or
/// socket.
#[must_use]
pub fn unit_file_name(name: &str) -> String {
    if name.ends_with(".service") || name.ends_with(".socket") {
        name.to_string()
    } else {
        format!("{name}.service")
    }
}

/// `program (arg) (arg)`
fn describe(command: &CommandLine) -> String {
    let mut text = command.program().to_string_lossy().into_owned();
    for arg in command.arguments() {
        text.push_str(" (");
        text.push_str(&arg.to_string_lossy());
        text.push(')');
    }
    text
}

async fn blocking<T, F>(f: F) -> LaminaResult<T>
where
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| LaminaError::Internal {
            message: format!("blocking task failed: {e}"),
        })?
        .map_err(LaminaError::from)
}

/// Build metadata collected from `ID`, `FROM`, `NAME` and `VERSION`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildMeta {
    /// Image name.
    pub id: Option<String>,
    /// Base image.
    pub base: Option<String>,
    /// Tag name, defaulting to the ID.
    pub name: Option<String>,
    /// Tag version suffix.
    pub version: Option<String>,
}

impl BuildMeta {
    /// `NAME[-VERSION]`, falling back to the ID for the name.
    #[must_use]
    pub fn tag(&self) -> Option<String> {
        let name = self.name.as_ref().or(self.id.as_ref())?;
        Some(match &self.version {
            Some(version) => format!("{name}-{version}"),
            None => name.clone(),
        })
    }
}

/// State of a running build.
#[derive(Debug)]
pub struct BuildContext<'a> {
    ctl: &'a ImageCtl,
    dir: PathBuf,
    task: Task,
    meta: BuildMeta,
    image: Option<LayeredImage>,
}

impl<'a> BuildContext<'a> {
    /// Build from `dir`, reporting to `task`.
    #[must_use]
    pub fn new(ctl: &'a ImageCtl, dir: PathBuf, task: Task) -> Self {
        Self {
            ctl,
            dir,
            task,
            meta: BuildMeta::default(),
            image: None,
        }
    }

    /// Metadata seen so far.
    #[must_use]
    pub const fn meta(&self) -> &BuildMeta {
        &self.meta
    }

    /// The image, once created.
    #[must_use]
    pub const fn image(&self) -> Option<&LayeredImage> {
        self.image.as_ref()
    }

    /// Give up the image.
    #[must_use]
    pub fn into_image(self) -> Option<LayeredImage> {
        self.image
    }

    /// Create and mount the image unless that already happened.
    ///
    /// # Errors
    ///
    /// Fails with [`LaminaError::Parse`] if no `ID` came before `line`, or
    /// with the errors of [`ImageCtl::create_image`].
    pub async fn ensure_image(&mut self, line: usize) -> LaminaResult<&LayeredImage> {
        if self.image.is_none() {
            let Some(id) = self.meta.id.clone() else {
                return Err(LaminaError::Parse {
                    line,
                    message: "ID must be set before the first build instruction".to_string(),
                });
            };

            self.task.header(&format!("Creating an image: {id}"));
            let image = self
                .ctl
                .create_image(&id, self.meta.base.as_deref())
                .await?;
            self.image = Some(image);
        }

        self.image.as_ref().ok_or_else(|| LaminaError::Internal {
            message: "image missing after creation".to_string(),
        })
    }

    fn built_image(&self) -> LaminaResult<&LayeredImage> {
        self.image.as_ref().ok_or_else(|| LaminaError::Internal {
            message: "build instruction before the image was created".to_string(),
        })
    }

    /// Host path of `path` inside the image.
    fn inside(&self, line: usize, path: &str) -> LaminaResult<PathBuf> {
        if !path.starts_with('/') {
            return Err(LaminaError::Parse {
                line,
                message: format!("'{path}' must be an absolute path inside the image"),
            });
        }
        Ok(self.built_image()?.real_path(Path::new(path)))
    }

    /// Host path of `path` in the build directory.
    fn source(&self, line: usize, path: &str) -> LaminaResult<PathBuf> {
        if path.starts_with('/') {
            return Err(LaminaError::Parse {
                line,
                message: format!("'{path}' must be relative to the build directory"),
            });
        }
        Ok(self.dir.join(path))
    }

    /// Execute one step.
    ///
    /// # Errors
    ///
    /// Returns the first failure; nothing is rolled back.
    pub async fn exec(&mut self, step: &Step) -> LaminaResult<()> {
        let line = step.line;
        match &step.instruction {
            Instruction::Id(id) => self.meta.id = Some(id.clone()),
            Instruction::From(base) => self.meta.base = Some(base.clone()),
            Instruction::Name(name) => self.meta.name = Some(name.clone()),
            Instruction::Version(version) => self.meta.version = Some(version.clone()),
            Instruction::Run { program, args } => self.run(program, args).await?,
            Instruction::Copy { sources, dest } => self.copy(line, sources, dest).await?,
            Instruction::Untar { sources, dest } => self.untar(line, sources, dest).await?,
            Instruction::Set { path, value } => self.set(line, path, value).await?,
            Instruction::AddUnit(name) => self.add_unit(&unit_file_name(name)).await?,
            Instruction::Enable(name) => self.enable(name).await?,
        }
        Ok(())
    }

    /// Run `command` as a subtask, streaming its output.
    ///
    /// # Errors
    ///
    /// Returns [`LaminaError::Command`] if it fails.
    pub async fn run_command(&self, command: &CommandLine) -> LaminaResult<()> {
        let sub = self.task.subtask(&describe(command));
        process::run_streamed(command, sub.sink()).await
    }

    async fn run(&self, program: &str, args: &[String]) -> LaminaResult<()> {
        let image = self.built_image()?;
        let command = image.command(&self.ctl.host().nspawn, program, args);
        self.run_command(&command).await
    }

    async fn copy(&self, line: usize, sources: &[String], dest: &str) -> LaminaResult<()> {
        let target = self.inside(line, dest)?;
        if sources.len() > 1 {
            tokio::fs::create_dir_all(&target).await?;
        }

        for src in sources {
            let from = self.source(line, src)?;
            let into = target.clone();
            let copied = blocking(move || fsutil::copy_into(&from, &into)).await?;
            tracing::debug!(src = %src, path = %copied.display(), "Copied into image");
        }
        Ok(())
    }

    async fn untar(&self, line: usize, sources: &[String], dest: &str) -> LaminaResult<()> {
        let target = self.inside(line, dest)?;
        tokio::fs::create_dir_all(&target).await?;

        for raw in sources {
            let source = ArchiveSource::parse(raw);
            let file = if source.is_remote() {
                let cached = source.cache_path(&self.ctl.host().paths.downloads());
                archive::download(&source.location, &cached).await?;
                cached
            } else {
                self.source(line, &source.location)?
            };

            let compression = {
                let file = file.clone();
                blocking(move || Compression::of_file(&file)).await?
            };

            if compression == Compression::Other {
                let mut command = CommandLine::new("tar")
                    .arg("-xf")
                    .arg(&file)
                    .arg("-C")
                    .arg(&target);
                if let Some(subdir) = &source.subdir {
                    command = command
                        .arg(subdir)
                        .arg("--strip-components")
                        .arg(source.strip_components().to_string());
                }
                self.run_command(&command).await?;
            } else {
                let dest = target.clone();
                let entries = {
                    let source = source.clone();
                    blocking(move || archive::unpack_file(&file, &dest, &source)).await?
                };
                self.task
                    .print(&format!("Unpacked {entries} entries from {}", source.location));
            }
        }
        Ok(())
    }

    async fn set(&self, line: usize, path: &str, value: &str) -> LaminaResult<()> {
        let target = self.inside(line, path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, value).await?;
        tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o644)).await?;
        tracing::debug!(path = %target.display(), "Wrote file");
        Ok(())
    }

    async fn add_unit(&self, unit: &str) -> LaminaResult<()> {
        let from = self.dir.join(unit);
        if !from.exists() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} does not exist", from.display()),
            )
            .into());
        }
        let into = self.built_image()?.real_path(Path::new(UNIT_DIR));
        tokio::fs::create_dir_all(&into).await?;
        blocking(move || fsutil::copy_into(&from, &into)).await?;
        Ok(())
    }

    async fn enable(&self, name: &str) -> LaminaResult<()> {
        let unit = unit_file_name(name);
        if self.dir.join(&unit).exists() {
            self.add_unit(&unit).await?;
        } else {
            self.task.warn(&format!("{unit} file not found"));
        }
        self.run("systemctl", &["enable".to_string(), unit]).await
    }
}
