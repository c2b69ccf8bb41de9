//! CLI command definitions and handlers.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use console::style;
use lamina_common::config::DEFAULT_CONFIG_PATH;
use lamina_common::{ErrorKind, LaminaConfig, LaminaError, LaminaResult};
use lamina_host::Host;
use lamina_image::{Image, ImageCtl, ImageSummary};
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::pipeline::{self, Built};
use crate::pull;
use crate::task::Task;

/// Lamina - layered images for systemd-nspawn
#[derive(Parser)]
#[command(name = "lamina")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file
    #[arg(
        long,
        global = true,
        env = "LAMINA_CONFIG",
        default_value = DEFAULT_CONFIG_PATH
    )]
    pub config: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Image commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Build an image from a directory containing a Laminafile
    Build {
        /// Build directory
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Clone or update a git repository and build it
    Pull {
        /// git://... or git+https://..., optionally followed by #subdir
        uri: String,
    },

    /// Create a new image
    #[command(visible_alias = "new")]
    Create {
        /// Image name
        name: String,

        /// Read-only image to build on
        base: Option<String>,
    },

    /// Create an alias for an image
    Tag {
        /// Alias to create
        tag: String,

        /// Image (or tag) it points to
        name: String,
    },

    /// Remove an alias
    Untag {
        /// Alias to remove
        tag: String,
    },

    /// Mark or unmark an image read-only
    #[command(visible_aliases = ["ro", "read-only"])]
    SetReadOnly {
        /// Image name
        name: String,

        /// yes/no
        #[arg(value_parser = parse_bool, default_value = "yes", action = clap::ArgAction::Set)]
        value: bool,
    },

    /// Assemble or disassemble an image
    SetReady {
        /// Image name
        name: String,

        /// yes/no
        #[arg(value_parser = parse_bool, default_value = "yes", action = clap::ArgAction::Set)]
        value: bool,
    },

    /// Remove an image, or a tag and the image it points to
    #[command(visible_alias = "rm")]
    Remove {
        /// Image or tag name
        name: String,
    },

    /// Move an image onto a different base
    Rebase {
        /// Image name
        name: String,

        /// New read-only base
        base: String,
    },

    /// Drop files that duplicate the image's base
    Optimize {
        /// Image name
        name: String,
    },

    /// Restore the frozen marker and mount of an image
    Repair {
        /// Image name
        name: String,
    },

    /// Show available images
    #[command(visible_aliases = ["ls", "images", "list-images"])]
    List,
}

/// Parse the boolean words accepted on the command line.
///
/// # Errors
///
/// Returns a message for anything else.
pub fn parse_bool(value: &str) -> Result<bool, String> {
    match value {
        "1" | "y" | "yes" | "true" | "Y" | "YES" | "TRUE" => Ok(true),
        "0" | "n" | "no" | "false" | "N" | "NO" | "FALSE" => Ok(false),
        other => Err(format!("invalid boolean value '{other}'")),
    }
}

#[derive(Tabled)]
struct ImageRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "TYPE")]
    image_type: String,
    #[tabled(rename = "RO")]
    read_only: String,
    #[tabled(rename = "READY")]
    ready: String,
    #[tabled(rename = "ALIVE")]
    alive: String,
}

impl From<ImageSummary> for ImageRow {
    fn from(summary: ImageSummary) -> Self {
        let read_only = if summary.read_only {
            style("RO").green()
        } else {
            style("RW").blue()
        };
        let ready = if summary.ready {
            style("yes").green()
        } else {
            style("no").red()
        };
        // Writable images are normally running.
        let alive = if summary.alive {
            style("yes").green()
        } else if summary.read_only {
            style("no").blue()
        } else {
            style("no").red()
        };

        Self {
            name: summary.name,
            image_type: summary.image_type,
            read_only: read_only.to_string(),
            ready: ready.to_string(),
            alive: alive.to_string(),
        }
    }
}

fn print_caveats(image: &dyn Image) {
    for caveat in image.caveats() {
        eprintln!(
            "{}",
            style(format!("Warning: {}: {caveat}", image.name()))
                .for_stderr()
                .yellow()
        );
    }
}

fn print_built(built: &Built) {
    println!("Image {} built.", built.image);
    if let Some(tag) = &built.tag {
        println!("Tagged as {tag}.");
    }
}

impl Commands {
    /// Whether the command changes images, mounts or units.
    #[must_use]
    pub const fn mutates(&self) -> bool {
        !matches!(self, Self::List)
    }

    /// Run the command against `ctl`.
    ///
    /// # Errors
    ///
    /// Returns the failure of the underlying image operation.
    pub async fn run(self, ctl: &ImageCtl) -> LaminaResult<()> {
        match self {
            Self::Build { path } => {
                let built = pipeline::build(ctl, &path, &Task::stderr()).await?;
                print_built(&built);
            }

            Self::Pull { uri } => {
                let built = pull::pull(ctl, &uri, &Task::stderr()).await?;
                print_built(&built);
            }

            Self::Create { name, base } => {
                let image = ctl.create_image(&name, base.as_deref()).await?;
                print_caveats(&image);
                println!("Image created.");
                println!("Use machinectl start {} to start the container.", image.name());
            }

            Self::Tag { tag, name } => {
                ctl.tag(&tag, &name).await?;
                println!("Tag created.");
            }

            Self::Untag { tag } => {
                let target = ctl.untag(&tag)?;
                tracing::debug!(tag = %tag, target = %target, "Removed tag");
                println!("Tag removed.");
            }

            Self::SetReadOnly { name, value } => {
                let mut image = ctl.get_image(&name).await?;
                print_caveats(&image);
                image.set_read_only(value).await?;
                if image.read_only() {
                    println!("Image is now read-only.");
                } else {
                    println!("Image is now writable.");
                }
            }

            Self::SetReady { name, value } => {
                let mut image = ctl.get_image(&name).await?;
                print_caveats(&image);
                image.set_ready(value).await?;
                if image.ready() {
                    println!("Image is now ready.");
                } else {
                    println!("Image is now not ready.");
                }
            }

            Self::Remove { name } => {
                let name = match ctl.untag(&name) {
                    Ok(target) => {
                        println!("Tag removed.");
                        target
                    }
                    Err(e) if e.kind() == ErrorKind::NotATag => name,
                    Err(e) => return Err(e),
                };
                let mut image = ctl.get_image(&name).await?;
                image.remove().await?;
                println!("Image removed.");
            }

            Self::Rebase { name, base } => {
                let mut image = ctl.get_layered(&name, "rebase").await?;
                print_caveats(&image);
                let base = match ctl.get_image(&base).await {
                    Ok(base) => base,
                    Err(e) if e.is_not_found() => {
                        return Err(LaminaError::BaseDoesNotExist { name: base });
                    }
                    Err(e) => return Err(e),
                };
                image.rebase(base).await?;
                println!("Image rebased onto {}.", image.base_name().unwrap_or("nothing"));
            }

            Self::Optimize { name } => {
                let image = ctl.get_image(&name).await?;
                print_caveats(&image);
                let task = Task::stderr();
                let report = image.optimize(
                    &mut |status| task.print(status),
                    &mut |error| task.warn(&error.to_string()),
                );
                println!(
                    "{} files and {} directories removed, {} bytes freed.",
                    report.files_removed, report.dirs_removed, report.bytes_freed
                );
            }

            Self::Repair { name } => {
                let mut image = ctl.get_layered(&name, "repair").await?;
                let caveats = image.caveats().len();
                image.repair().await?;
                if caveats == 0 {
                    println!("Nothing to repair.");
                } else {
                    println!("Image repaired.");
                }
            }

            Self::List => {
                let images = ctl.list_images().await?;
                let count = images.len();
                let rows: Vec<ImageRow> = images.iter().map(|i| i.summary().into()).collect();
                let mut table = Table::new(rows);
                table.with(Style::blank());
                println!("{table}");
                println!();
                println!("{count} images listed.");
            }
        }
        Ok(())
    }
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        if self.command.mutates() && !rustix::process::geteuid().is_root() {
            return Err(LaminaError::PermissionDenied {
                operation: "changing images requires root".to_string(),
            }
            .into());
        }

        let config = LaminaConfig::load(&self.config)?;
        let ctl = ImageCtl::new(Host::system(&config));

        self.command.run(&ctl).await?;
        Ok(())
    }
}
