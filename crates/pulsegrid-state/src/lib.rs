//! pulsegrid-state: embedded state store for PulseGrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for aggregated buckets, the raw score log, and circuit breaker /
//! quota records.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{entity}#{resolution}#{start}`, `{entity}#{ts}#{seq}`)
//! embed order-preserving timestamps so time ranges become key range scans.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod repository;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use repository::{GuardRepository, RawScoreLog, TimeseriesStore};
pub use store::StateStore;
pub use types::*;
