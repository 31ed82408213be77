//! buildgate gateway library
//!
//! Accepts Docker build submissions over gRPC and turns each one into a build
//! session:
//! - the zip build context is transcoded to a `.tar.gz` and uploaded to artifact storage
//! - a build job is published on the broker queue
//! - the worker's log channel is relayed back on the client's response stream
//!
//! The storage, broker and pub/sub collaborators sit behind traits; the
//! binary wires local backends that build workers reach through `WorkerService`.

pub mod broker;
pub mod pubsub;
pub mod relay;
pub mod server;
pub mod session;
pub mod storage;
