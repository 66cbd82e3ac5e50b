//! # Chorus Persistence
//!
//! Storage backends for the Chorus coordination protocol: epoch scalars,
//! the transaction log, and state-machine snapshots.
//!
//! ## Implementations
//!
//! - [`InMemoryEpochStore`], [`InMemoryLog`], [`InMemorySnapshotStore`] -
//!   volatile storage for testing and embedded use
//! - [`FileEpochStore`], [`FileLog`], [`FileSnapshotStore`] - file-backed
//!   storage that survives restarts
//!
//! Epoch files are written atomically (temp file then rename) so a crash
//! mid-write never leaves a torn epoch on disk. The two epoch scalars are
//! kept in separate files because they advance at different points of the
//! establishment handshake.
//!
//! ## Example
//!
//! ```rust
//! use chorus_core::storage::EpochStore;
//! use chorus_core::Epoch;
//! use chorus_persistence::InMemoryEpochStore;
//!
//! # tokio_test::block_on(async {
//! let store = InMemoryEpochStore::new();
//! store.set_accepted_epoch(Epoch::new(5)).await.unwrap();
//! assert_eq!(store.accepted_epoch().await.unwrap(), Epoch::new(5));
//! // The current epoch trails the accepted epoch until establishment completes.
//! assert_eq!(store.current_epoch().await.unwrap(), Epoch::new(0));
//! # });
//! ```

pub mod file_system;
pub mod in_memory;

pub use file_system::{FileEpochStore, FileLog, FileSnapshotStore};
pub use in_memory::{InMemoryEpochStore, InMemoryLog, InMemorySnapshotStore};
