//! [`MachineRegistry`] backed by the `machinectl` binary.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use lamina_common::{LaminaError, LaminaResult};
use serde::Deserialize;

use super::{ImageDescriptor, MachineHandle, MachineRegistry};
use crate::process::{CommandLine, run_captured};

/// Talks to systemd-machined through `machinectl`.
#[derive(Debug, Clone)]
pub struct Machinectl {
    program: String,
}

impl Default for Machinectl {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct ListedImage {
    name: String,
}

fn parse_properties(text: &str) -> HashMap<&str, &str> {
    text.lines()
        .filter_map(|line| line.split_once('='))
        .collect()
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "yes" | "true" | "1")
}

impl Machinectl {
    /// Use `machinectl` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_program("machinectl")
    }

    /// Use a specific `machinectl` binary.
    #[must_use]
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self) -> CommandLine {
        CommandLine::new(&self.program).args(["--no-pager", "--no-ask-password"])
    }

    async fn run(&self, command: CommandLine) -> LaminaResult<String> {
        let captured = run_captured(&command).await?.check(&command)?;
        Ok(captured.stdout)
    }
}

#[async_trait]
impl MachineRegistry for Machinectl {
    async fn get_image(&self, name: &str) -> LaminaResult<ImageDescriptor> {
        let command = self.command().arg("show-image").arg(name);
        let captured = run_captured(&command).await?;
        if !captured.success() {
            if captured.stderr.contains("No image") {
                return Err(LaminaError::NoSuchImage {
                    name: name.to_string(),
                });
            }
            return Err(captured.into_error(&command));
        }

        let props = parse_properties(&captured.stdout);
        Ok(ImageDescriptor {
            name: props.get("Name").copied().unwrap_or(name).to_string(),
            path: PathBuf::from(props.get("Path").copied().unwrap_or_default()),
            image_type: props.get("Type").copied().unwrap_or("directory").to_string(),
            read_only: props.get("ReadOnly").is_some_and(|v| parse_bool(v)),
        })
    }

    async fn get_machine(&self, name: &str) -> LaminaResult<MachineHandle> {
        let command = self.command().arg("show").arg(name);
        let captured = run_captured(&command).await?;
        if !captured.success() {
            if captured.stderr.contains("No machine") {
                return Err(LaminaError::NoSuchMachine {
                    name: name.to_string(),
                });
            }
            return Err(captured.into_error(&command));
        }

        let props = parse_properties(&captured.stdout);
        Ok(MachineHandle {
            name: props.get("Name").copied().unwrap_or(name).to_string(),
            class: props.get("Class").copied().unwrap_or("container").to_string(),
            leader: props.get("Leader").and_then(|v| v.parse().ok()),
        })
    }

    async fn list_images(&self) -> LaminaResult<Vec<ImageDescriptor>> {
        let output = self
            .run(self.command().args(["list-images", "--output=json"]))
            .await?;
        let listed: Vec<ListedImage> = serde_json::from_str(&output)?;

        let mut images = Vec::with_capacity(listed.len());
        for image in listed {
            match self.get_image(&image.name).await {
                Ok(descriptor) => images.push(descriptor),
                // Removed between listing and lookup.
                Err(LaminaError::NoSuchImage { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(images)
    }

    async fn remove_image(&self, name: &str) -> LaminaResult<()> {
        self.run(self.command().arg("remove").arg(name)).await?;
        tracing::info!(image = %name, "Removed image");
        Ok(())
    }

    async fn mark_image_read_only(&self, name: &str, read_only: bool) -> LaminaResult<()> {
        let flag = if read_only { "true" } else { "false" };
        self.run(self.command().arg("read-only").arg(name).arg(flag))
            .await?;
        tracing::debug!(image = %name, read_only, "Marked image");
        Ok(())
    }
}
