//! Remote-side contracts consumed by the sync engine.
//!
//! This module provides trait-based interfaces for the row service
//! ([`RemoteApi`]), the blob service ([`ObjectStorage`]) and the liveness
//! check ([`ConnectivityProbe`]), together with REST implementations and
//! in-memory implementations for tests and development.
//!
//! # Design Principles
//! - Backend isolation: no transport-specific logic in the engine
//! - Async operations: every remote call is an await point
//! - Unified error semantics: transient failures map to `Error::Network`,
//!   explicit rejections to `Error::RemoteRejected`

pub mod memory;
pub mod object;
pub mod probe;
pub mod remote;
pub mod rest;

pub use memory::{MemoryObjectStorage, MemoryRemote, RemoteCall};
pub use object::ObjectStorage;
pub use probe::{ConnectivityProbe, HttpProbe, StaticProbe};
pub use remote::{RemoteApi, RemoteFilter};
pub use rest::{RestConfig, RestObjectStorage, RestRemote};
