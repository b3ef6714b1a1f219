//! opless-store — typed KV facade shared by the manager and router.
//!
//! Backed by Redis (keyspace notifications provide the change feed the
//! router subscribes to) with an in-memory backend for tests. Records are
//! self-describing JSON under `<prefix>:<id>` keys.

pub mod error;
pub mod kv;

pub use error::{StoreError, StoreResult};
pub use kv::{Event, KvStore, Subscription};
