//! Video platform API client and related functionality

pub mod cipher;
pub mod client;
pub mod formats;
pub mod innertube;
pub mod observation;
pub mod persona;
pub mod resolver;
pub mod sandbox;

pub use cipher::*;
pub use client::*;
pub use formats::*;
pub use innertube::*;
pub use observation::*;
pub use persona::*;
pub use resolver::*;
pub use sandbox::*;
