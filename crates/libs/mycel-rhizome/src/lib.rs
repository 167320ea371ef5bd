//! Rhizome: the store-and-forward content replication subsystem. Bundles
//! (a signed manifest plus an optional payload, addressed by public key)
//! are kept in a SQLite-backed store with priority-bounded eviction and
//! reconciled between peers with BAR cursors over a multipart HTTP protocol.

pub mod bar;
pub mod config;
pub mod cursor;
pub mod error;
pub mod http;
pub mod manifest;
pub mod store;
pub mod sync;

pub use bar::Bar;
pub use config::RhizomeConfig;
pub use cursor::SyncCursor;
pub use error::RhizomeError;
pub use manifest::Manifest;
pub use store::{AddOutcome, RhizomeStore};
