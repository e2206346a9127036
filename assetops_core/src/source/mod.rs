//! Bundled [`SourceAdapter`](crate::automation::traits::SourceAdapter) implementations.

pub mod json_lines;
pub mod memory;

pub use json_lines::JsonLinesSource;
pub use memory::StaticSource;
