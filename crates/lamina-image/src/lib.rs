//! # lamina-image
//!
//! Layered images for systemd-nspawn containers.
//!
//! This crate provides:
//! - the [`Image`] capability set, implemented by [`FlatImage`] (owned by
//!   the container registry) and [`LayeredImage`] (owned by Lamina)
//! - the [`LayeredImageCtl`] and the [`ImageCtl`] facade
//! - tags
//! - the layer optimizer

#![warn(missing_docs)]

pub mod controller;
pub mod facade;
pub mod flat;
pub mod image;
pub mod layered;
pub mod optimizer;
pub mod tag;

pub use controller::LayeredImageCtl;
pub use facade::ImageCtl;
pub use flat::FlatImage;
pub use image::{AnyImage, Caveat, Image, ImageSummary};
pub use layered::LayeredImage;
pub use optimizer::OptimizeReport;
pub use tag::TagStore;
