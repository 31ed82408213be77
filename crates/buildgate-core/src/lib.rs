//! buildgate Core Library
//!
//! Shared functionality for the buildgate gateway:
//! - Build job model exchanged with remote workers
//! - Archive transcoding (zip build context to gzipped tar)
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod archive;
pub mod config;
pub mod error;
pub mod model;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
