//! systemd integration: unit naming and the manager contract.

mod escape;
mod manager;
mod systemctl;

pub use escape::{unit_name_escape, unit_name_path_escape};
pub use manager::{EnableOutcome, JOB_DONE, Job, JobMode, UnitChange, UnitManager};
pub use systemctl::Systemctl;
