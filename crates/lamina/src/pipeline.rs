//! The build sequence.
//!
//! 1. Parse `<dir>/Laminafile`.
//! 2. Create and mount the image before the first instruction that needs
//!    it (or after the last one).
//! 3. Run each instruction under a `# WORD (arg) (arg)` header.
//! 4. Move `/etc/systemd/{system,user,network}` into `/usr/lib/systemd/`.
//! 5. Unmount, optimize, freeze, mount.
//! 6. Point the tag `NAME[-VERSION]` at the image.
//!
//! The first failure stops the build. Nothing is rolled back; the
//! half-built image is left for inspection.

use std::path::Path;

use lamina_common::{ErrorKind, LaminaError, LaminaResult};
use lamina_image::{Image, ImageCtl};

use crate::context::BuildContext;
use crate::fsutil;
use crate::laminafile::Laminafile;
use crate::task::Task;

/// Configuration directories moved out of `/etc/systemd`.
const SYSTEMD_CONFIG_DIRS: [&str; 3] = ["system", "user", "network"];

/// Result of a successful build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Built {
    /// Name of the new image.
    pub image: String,
    /// Tag pointing at it, if it differs from the name.
    pub tag: Option<String>,
}

/// Build the image described by `<dir>/Laminafile`.
///
/// # Errors
///
/// Returns the first failure of any step.
pub async fn build(ctl: &ImageCtl, dir: &Path, task: &Task) -> LaminaResult<Built> {
    let dir = std::path::absolute(dir)?;
    let file = Laminafile::load(&dir)?;
    tracing::info!(dir = %dir.display(), steps = file.steps.len(), "Building image");

    let mut context = BuildContext::new(ctl, dir, task.clone());
    for step in &file.steps {
        if !step.instruction.is_meta() {
            context.ensure_image(step.line).await?;
        }
        task.header(&step.to_string());
        context.exec(step).await?;
    }
    let last_line = file.steps.last().map_or(0, |step| step.line);
    context.ensure_image(last_line).await?;

    let meta = context.meta().clone();
    let mut image = context.into_image().ok_or_else(|| LaminaError::Internal {
        message: "build finished without an image".to_string(),
    })?;

    task.header("Cleaning up the container...");
    for name in SYSTEMD_CONFIG_DIRS {
        let from = image.real_path(&Path::new("/etc/systemd").join(name));
        let to = image.real_path(&Path::new("/usr/lib/systemd").join(name));
        tokio::task::spawn_blocking(move || fsutil::move_tree(&from, &to))
            .await
            .map_err(|e| LaminaError::Internal {
                message: format!("blocking task failed: {e}"),
            })??;
    }

    task.header("Unmounting...");
    image.set_ready(false).await?;

    task.header("Reducing layer size...");
    let report = image.optimize(
        &mut |status| task.print(status),
        &mut |error| task.warn(&error.to_string()),
    );
    task.print(&format!(
        "{} files and {} directories removed, {} bytes freed",
        report.files_removed, report.dirs_removed, report.bytes_freed
    ));

    task.header("Freezing...");
    image.set_read_only(true).await?;

    task.header("Mounting...");
    image.set_ready(true).await?;

    let tag = meta.tag().filter(|tag| tag != image.name());
    if let Some(tag) = &tag {
        task.header("Tagging...");
        match ctl.untag(tag) {
            Ok(previous) => task.print(&format!("Moved {tag} from {previous}")),
            Err(e) if e.kind() == ErrorKind::NotATag => {}
            Err(e) => return Err(e),
        }
        ctl.tag(tag, image.name()).await?;
    }

    tracing::info!(image = %image.name(), tag = tag.as_deref().unwrap_or("-"), "Built image");
    Ok(Built {
        image: image.name().to_string(),
        tag,
    })
}
