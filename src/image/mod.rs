//! In-memory PE images of built-in modules.
//!
//! - [`layout`] - header structures, sizes and offsets
//! - [`region`] - the executable mapping an image lives in
//! - [`builder`] - staging and synthesis of a complete image
//! - [`exports`] - read-back of a synthesized export directory
//! - [`io`] - bounds-checked little-endian buffer access

pub mod builder;
pub mod exports;
pub mod io;
pub mod layout;
pub mod region;

pub use builder::{synthesize, ImageBuilder, SynthesizedImage};
pub use exports::{ExportEntry, ExportView};
pub use layout::{ImageLayout, Machine};
pub use region::{ImageRegion, Protection};
