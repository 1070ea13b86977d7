//! Segment retrieval: retries, the fetch pool, merge jobs and playlists

pub mod merge;
pub mod playlist;
pub mod pool;
pub mod retry;

pub use merge::*;
pub use playlist::*;
pub use pool::*;
pub use retry::*;
