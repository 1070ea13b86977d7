//! Utility functions for ytstream

pub mod cache;
pub mod url;

pub use cache::*;
pub use url::*;
