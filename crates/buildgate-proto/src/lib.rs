//! buildgate Protocol Buffers
//!
//! Generated protobuf code for the buildgate gRPC API.
//!
//! This crate contains:
//! - `DockerService` for build submission and log streaming
//! - `WorkerService` for the local worker backplane

#![allow(clippy::derive_partial_eq_without_eq)]

/// buildgate v1 API definitions.
pub mod v1 {
    tonic::include_proto!("buildgate.v1");
}

pub use v1::*;
