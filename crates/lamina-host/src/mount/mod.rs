//! The Mount Orchestrator.
//!
//! Turns an ordered stack of read-only layers plus an optional writable
//! layer into a systemd-managed mount:
//!
//! | read-only | writable | mount                              |
//! |-----------|----------|------------------------------------|
//! | none      | none     | empty read-only tmpfs              |
//! | one       | none     | read-only bind                     |
//! | several   | none     | read-only overlay                  |
//! | none      | present  | read-write bind                    |
//! | some      | present  | overlay with the writable layer up |

mod compose;
mod orchestrator;
mod unit;

pub use compose::{MountSpec, Strategy, compose};
pub use orchestrator::MountOrchestrator;
pub use unit::{MountUnit, MountUnitNames, has_install_section, render_automount};
