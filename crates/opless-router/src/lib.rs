//! opless-router — HTTP front door for deployed functions.
//!
//! Maintains a longest-prefix routing table fed by the KV store's endpoint
//! records and their keyspace events, and reverse-proxies every inbound
//! request to the matching function container.

pub mod proxy;
pub mod table;

pub use proxy::{build_router, ProxyState};
pub use table::{spawn_watch, RouteError, RouteTable};
