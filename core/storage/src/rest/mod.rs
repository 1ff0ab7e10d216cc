//! REST backends (PostgREST-style rows, storage-object API).

mod client;
mod remote;
mod storage;

pub use client::RestConfig;
pub use remote::RestRemote;
pub use storage::RestObjectStorage;
