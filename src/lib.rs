pub mod config;
pub mod error;
/// rolepool - Role-aware client connection pool for replicated primary/replica data stores
///
/// A pool keeps one multiplexed connection per cluster node, probes every
/// node for its role (read-write primary or read-only replica) and routes
/// each request by a per-request mode:
/// 1. `Any`: any live node
/// 2. `PreferReadWrite` / `PreferReadOnly`: matching role first, the other as fallback
/// 3. `RequireReadWrite` / `RequireReadOnly`: matching role only
///
/// Failed links are reconnected in the background and requests that lose
/// their link are retried once on the next candidate.
pub mod core;
pub mod dispatch;
pub mod health;
pub mod protocol;
pub mod routing;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;

pub use crate::config::{init_logging, Config};
pub use crate::core::connection::{ConnState, ConnectOptions, Connection};
pub use crate::core::pool::Pool;
pub use crate::core::transport::{Link, TcpTransport, Transport};
pub use crate::core::{Health, Node, Role};
pub use crate::dispatch::{default_mode, Dispatcher};
pub use crate::error::{ConnectError, PoolError, PoolResult};
pub use crate::health::{NodeMonitor, ProbeStatus, Prober, RoleProber};
pub use crate::protocol::{Operation, Response};
pub use crate::routing::{RoutingMode, Router};

/// Connect to a single node; an empty address means `localhost:3301`
pub async fn connect(addr: &str) -> PoolResult<Dispatcher> {
    Dispatcher::connect(addr).await
}

/// Connect to several nodes with `config`; an empty list means `localhost:3301`
pub async fn connect_pool<S: AsRef<str>>(addrs: &[S], config: Config) -> PoolResult<Dispatcher> {
    Dispatcher::connect_pool(addrs, config).await
}
