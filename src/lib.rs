//! # ytstream - stream format resolution and resilient segment retrieval
//!
//! Turns a video id into directly fetchable stream URLs and pulls
//! multi-segment media down with bounded concurrency.
//!
//! ## Features
//!
//! - Ordered client persona fallback with a per-persona outcome record
//! - Signature and throttling-parameter transforms run in an isolated sandbox
//! - Format cache that honours stream URL expiry
//! - Bounded-concurrency segment pool with exponential backoff and cancellation
//! - Single-flight merge jobs with rate-bounded progress events
//! - HLS playlist expansion
//!
//! ## Example
//!
//! ```rust,no_run
//! use ytstream::{Engine, EngineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::new(EngineConfig::default())?;
//!
//!     let resolution = engine.resolve("https://www.youtube.com/watch?v=dQw4w9WgXcQ").await?;
//!     println!("{} formats via {}", resolution.formats.len(), resolution.persona);
//!
//!     let segments = engine.playlist_segments("https://cdn.example/index.m3u8").await?;
//!     let output = engine.start_merge("job-1", segments)?.wait().await?;
//!     println!("{} bytes", output.total_bytes());
//!
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod core;
pub mod download;
pub mod error;
pub mod platform;
pub mod utils;

// Re-export main types
pub use crate::core::{Engine, EngineConfig, SegmentProgress};
pub use download::{MergeCoordinator, MergeEvent, MergeHandle, SegmentFetchPool};
pub use error::StreamError;
pub use platform::{
    ClientPersona, ClientPersonaResolver, FormatResolution, PageObservation, PersonaRegistry,
    ResolvedFormat,
};

/// Result type alias for ytstream operations
pub type Result<T> = std::result::Result<T, StreamError>;
