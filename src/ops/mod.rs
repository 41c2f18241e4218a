//! high-level operations on bale containers

pub mod export;

pub use export::{export_images, ExportMode, ExportOptions};
