//! # Chorus KvStore
//!
//! A replicated key-value store driven by the Chorus broadcast stream. The
//! store implements the state-machine trait from `chorus-core`: committed
//! transactions carry encoded [`KvOp`] payloads, and every mutation flows
//! through the ordered apply path on coordinator and replicas alike.
//!
//! Reads are local and lock-free. Change observation uses one-shot watches:
//! armed on a key, fired exactly once by the next committed change.

pub mod operations;
pub mod store;
pub mod watches;

pub use operations::KvOp;
pub use store::KvStore;
pub use watches::{WatchEvent, WatchId, WatchRegistry};
