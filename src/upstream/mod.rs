//! Mutual-TLS connections to backend targets.

pub mod connector;
pub mod pool;

pub use connector::{Established, UpstreamConnector, UpstreamSender};
pub use pool::{ConnectionPool, PoolKey, PoolSettings, PooledConnection};
