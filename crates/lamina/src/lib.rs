//! # lamina
//!
//! Builds layered images from a `Laminafile` and exposes image management
//! on the command line.
//!
//! - [`laminafile`]: the build script format
//! - [`context`]: executes build instructions against a mounted image
//! - [`pipeline`]: the full build sequence
//! - [`pull`]: builds from a git repository
//! - [`task`]: nested, indented build output
//! - [`cli`]: the `lamina` command

#![warn(missing_docs)]

pub mod archive;
pub mod cli;
pub mod context;
pub mod fsutil;
pub mod laminafile;
pub mod pipeline;
pub mod pull;
pub mod task;
