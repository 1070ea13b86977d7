//! Core functionality for ytstream

pub mod engine;
pub mod progress;

pub use engine::*;
pub use progress::*;
