// src/storage/mod.rs
// Storage engine (spec.md §4.E): pooled SQLite + sqlite-vec store, the
// ingest_log short-circuit, the store_entries write path, and bulk mode.

pub mod bulk;
pub mod entries;
pub mod ingest_log;
pub mod judge;
pub mod pool;
pub mod schema;

pub use entries::{StoreOptions, StoreResult, store_entries};
pub use pool::AgenrPool;
