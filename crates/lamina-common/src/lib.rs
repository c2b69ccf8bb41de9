//! # lamina-common
//!
//! Shared utilities and types for the Lamina image tools.
//!
//! This crate provides common functionality used across all Lamina crates:
//! - The error taxonomy shared by the image engine and the CLI
//! - Standard filesystem paths for layers, images and unit files
//! - Image name validation
//! - The optional TOML configuration file

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod name;
pub mod paths;

pub use config::LaminaConfig;
pub use error::{ErrorKind, LaminaError, LaminaResult};
pub use name::ImageName;
pub use paths::LaminaPaths;
