//! The init-system manager contract.

use std::fmt;

use async_trait::async_trait;
use lamina_common::{LaminaError, LaminaResult};
use tokio::sync::oneshot;

/// Job result reported by systemd on success.
pub const JOB_DONE: &str = "done";

/// How a new job interacts with already queued jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobMode {
    /// Replace conflicting queued jobs.
    #[default]
    Replace,
    /// Fail if the job conflicts with a queued job.
    Fail,
    /// Start the unit and stop all others.
    Isolate,
    /// Ignore all unit dependencies.
    IgnoreDependencies,
}

impl JobMode {
    /// The name systemd uses for this mode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Fail => "fail",
            Self::Isolate => "isolate",
            Self::IgnoreDependencies => "ignore-dependencies",
        }
    }
}

impl fmt::Display for JobMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change made to the unit directory by enable/disable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitChange {
    /// A symlink was created at `path` pointing to `target`.
    Symlink {
        /// Link path.
        path: String,
        /// Link target.
        target: String,
    },
    /// The file at `path` was removed.
    Unlink {
        /// Removed path.
        path: String,
    },
}

/// Result of enabling unit files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnableOutcome {
    /// Whether the units carry installation info (an `[Install]` section).
    pub carries_install_info: bool,
    /// Changes made to the unit directory.
    pub changes: Vec<UnitChange>,
}

/// A queued systemd job.
///
/// The terminal result string arrives asynchronously; [`Job::wait`]
/// blocks until it does. Dropping a job does not cancel it.
#[derive(Debug)]
pub struct Job {
    unit: String,
    result: oneshot::Receiver<String>,
}

impl Job {
    /// Create a job whose result will be delivered through the returned sender.
    #[must_use]
    pub fn pending(unit: impl Into<String>) -> (Self, oneshot::Sender<String>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                unit: unit.into(),
                result: rx,
            },
            tx,
        )
    }

    /// Create a job that has already finished with `result`.
    #[must_use]
    pub fn completed(unit: impl Into<String>, result: impl Into<String>) -> Self {
        let (job, tx) = Self::pending(unit);
        let _ = tx.send(result.into());
        job
    }

    /// The unit this job acts on.
    #[must_use]
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Wait for the job to finish and return its raw result string.
    ///
    /// # Errors
    ///
    /// Returns an error if the manager went away before reporting a result.
    pub async fn wait(self) -> LaminaResult<String> {
        self.result.await.map_err(|_| LaminaError::Internal {
            message: format!("job for {} was dropped without a result", self.unit),
        })
    }

    /// Wait for the job and fail unless it finished with `done`.
    ///
    /// # Errors
    ///
    /// Returns [`LaminaError::UnitJob`] carrying the raw result otherwise.
    pub async fn wait_done(self) -> LaminaResult<()> {
        let unit = self.unit.clone();
        let result = self.wait().await?;
        if result == JOB_DONE {
            Ok(())
        } else {
            Err(LaminaError::UnitJob { unit, result })
        }
    }
}

/// The subset of the systemd manager API that Lamina drives.
#[async_trait]
pub trait UnitManager: Send + Sync + fmt::Debug {
    /// Reload the unit graph (`daemon-reload`).
    async fn reload(&self) -> LaminaResult<()>;

    /// Enable unit files. `runtime` enables only until the next reboot.
    async fn enable_unit_files(
        &self,
        names: &[String],
        runtime: bool,
        force: bool,
    ) -> LaminaResult<EnableOutcome>;

    /// Disable unit files.
    async fn disable_unit_files(
        &self,
        names: &[String],
        runtime: bool,
    ) -> LaminaResult<Vec<UnitChange>>;

    /// Queue a start job.
    async fn start_unit(&self, name: &str, mode: JobMode) -> LaminaResult<Job>;

    /// Queue a stop job.
    async fn stop_unit(&self, name: &str, mode: JobMode) -> LaminaResult<Job>;

    /// Queue a restart job.
    async fn restart_unit(&self, name: &str, mode: JobMode) -> LaminaResult<Job>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completed_job_reports_result() {
        let job = Job::completed("a.mount", "done");
        assert_eq!(job.unit(), "a.mount");
        assert_eq!(job.wait().await.unwrap(), "done");
    }

    #[tokio::test]
    async fn wait_done_surfaces_raw_result() {
        let job = Job::completed("a.mount", "dependency");
        let err = job.wait_done().await.unwrap_err();
        assert!(matches!(
            err,
            LaminaError::UnitJob { ref unit, ref result } if unit == "a.mount" && result == "dependency"
        ));
    }

    #[tokio::test]
    async fn pending_job_resolves_later() {
        let (job, tx) = Job::pending("b.mount");
        tokio::spawn(async move {
            let _ = tx.send("done".to_string());
        });
        job.wait_done().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_sender_is_internal_error() {
        let (job, tx) = Job::pending("c.mount");
        drop(tx);
        assert!(matches!(
            job.wait().await,
            Err(LaminaError::Internal { .. })
        ));
    }

    #[test]
    fn job_mode_names() {
        assert_eq!(JobMode::default().as_str(), "replace");
        assert_eq!(JobMode::IgnoreDependencies.to_string(), "ignore-dependencies");
    }
}
