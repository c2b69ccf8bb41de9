//! [`UnitManager`] backed by the `systemctl` binary.

use async_trait::async_trait;
use lamina_common::LaminaResult;

use super::manager::{EnableOutcome, JOB_DONE, Job, JobMode, UnitChange, UnitManager};
use crate::process::{CommandLine, run_captured};

const NO_INSTALL_INFO: &str = "no installation config";

/// Drives the system manager through `systemctl`.
#[derive(Debug, Clone)]
pub struct Systemctl {
    program: String,
}

impl Default for Systemctl {
    fn default() -> Self {
        Self::new()
    }
}

impl Systemctl {
    /// Use `systemctl` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_program("systemctl")
    }

    /// Use a specific `systemctl` binary.
    #[must_use]
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self) -> CommandLine {
        CommandLine::new(&self.program).arg("--no-ask-password")
    }

    fn job(&self, verb: &'static str, name: &str, mode: JobMode) -> Job {
        let (job, tx) = Job::pending(name);
        let command = self
            .command()
            .arg(verb)
            .arg(format!("--job-mode={mode}"))
            .arg(name);
        let unit = name.to_string();

        tokio::spawn(async move {
            let result = match run_captured(&command).await {
                Ok(captured) if captured.success() => JOB_DONE.to_string(),
                Ok(captured) => {
                    tracing::debug!(unit = %unit, stderr = %captured.stderr.trim(), "Job failed");
                    classify_failure(&captured.stderr).to_string()
                }
                Err(e) => {
                    tracing::warn!(unit = %unit, error = %e, "Could not queue job");
                    "failed".to_string()
                }
            };
            let _ = tx.send(result);
        });

        job
    }
}

/// Map `systemctl` error text onto a systemd job result.
fn classify_failure(stderr: &str) -> &'static str {
    let text = stderr.to_ascii_lowercase();
    if text.contains("timed out") || text.contains("timeout") {
        "timeout"
    } else if text.contains("canceled") || text.contains("cancelled") {
        "canceled"
    } else if text.contains("dependency") {
        "dependency"
    } else {
        "failed"
    }
}

/// Parse `Created symlink A → B.` / `Removed "A".` lines.
fn parse_changes(output: &str) -> Vec<UnitChange> {
    let unquote = |s: &str| {
        s.trim()
            .trim_end_matches('.')
            .trim_matches(|c| c == '"' || c == '\'')
            .to_string()
    };

    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("Created symlink ") {
                let (path, target) = rest.split_once(" → ").or_else(|| rest.split_once(" -> "))?;
                Some(UnitChange::Symlink {
                    path: unquote(path),
                    target: unquote(target),
                })
            } else {
                line.strip_prefix("Removed ").map(|path| UnitChange::Unlink {
                    path: unquote(path),
                })
            }
        })
        .collect()
}

#[async_trait]
impl UnitManager for Systemctl {
    async fn reload(&self) -> LaminaResult<()> {
        let command = self.command().arg("daemon-reload");
        run_captured(&command).await?.check(&command)?;
        Ok(())
    }

    async fn enable_unit_files(
        &self,
        names: &[String],
        runtime: bool,
        force: bool,
    ) -> LaminaResult<EnableOutcome> {
        let mut command = self.command().arg("enable");
        if runtime {
            command = command.arg("--runtime");
        }
        if force {
            command = command.arg("--force");
        }
        let command = command.args(names);

        let captured = run_captured(&command).await?.check(&command)?;
        let text = format!("{}\n{}", captured.stdout, captured.stderr);

        Ok(EnableOutcome {
            carries_install_info: !text.contains(NO_INSTALL_INFO),
            changes: parse_changes(&text),
        })
    }

    async fn disable_unit_files(
        &self,
        names: &[String],
        runtime: bool,
    ) -> LaminaResult<Vec<UnitChange>> {
        let mut command = self.command().arg("disable");
        if runtime {
            command = command.arg("--runtime");
        }
        let command = command.args(names);

        let captured = run_captured(&command).await?.check(&command)?;
        Ok(parse_changes(&format!(
            "{}\n{}",
            captured.stdout, captured.stderr
        )))
    }

    async fn start_unit(&self, name: &str, mode: JobMode) -> LaminaResult<Job> {
        Ok(self.job("start", name, mode))
    }

    async fn stop_unit(&self, name: &str, mode: JobMode) -> LaminaResult<Job> {
        Ok(self.job("stop", name, mode))
    }

    async fn restart_unit(&self, name: &str, mode: JobMode) -> LaminaResult<Job> {
        Ok(self.job("restart", name, mode))
    }
}
