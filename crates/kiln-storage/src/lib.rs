//! Persistence layer for the Kiln build server.
//!
//! Provides the filesystem and in-memory `Persistence` backends and the
//! stores built on top of them: build records, fingerprints, change logs and
//! the history queries that combine them.

pub mod changeset;
pub mod error;
pub mod fingerprint;
pub mod fs;
pub mod history;
pub mod memory;
pub mod runs;

pub use changeset::ChangeSetCache;
pub use error::{StorageError, StorageResult};
pub use fingerprint::FingerprintStore;
pub use fs::FsPersistence;
pub use history::{BuildHistory, DependencyChange};
pub use memory::MemoryPersistence;
pub use runs::RunStore;
