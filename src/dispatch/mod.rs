//! Request dispatch: the public face of the pool
//!
//! Every verb resolves a routing mode (the caller's, or the verb's default),
//! asks the router for candidates over a fresh snapshot and sends on the
//! first one. Availability failures get one more try on the next candidate;
//! server errors and timeouts go straight back to the caller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::{Config, DEFAULT_ADDR};
use crate::core::pool::Pool;
use crate::core::transport::{TcpTransport, Transport};
use crate::core::Node;
use crate::error::{ErrorSeverity, PoolError, PoolResult};
use crate::protocol::{Opcode, Operation, Response};
use crate::routing::{RoutingMode, Router};

/// Attempts per request: the routed node plus one failover
const MAX_ATTEMPTS: usize = 2;

/// Routing mode a verb uses when the caller gives none
pub fn default_mode(op: &Operation) -> RoutingMode {
    match op {
        Operation::Select { .. } | Operation::Ping => RoutingMode::Any,
        Operation::Insert { .. }
        | Operation::Replace { .. }
        | Operation::Update { .. }
        | Operation::Delete { .. }
        | Operation::Upsert { .. } => RoutingMode::RequireReadWrite,
        Operation::Call16 { .. } | Operation::Call17 { .. } | Operation::Eval { .. } => {
            RoutingMode::PreferReadWrite
        }
    }
}

/// Routes requests over a shared [`Pool`]. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    pool: Arc<Pool>,
    router: Arc<Router>,
    request_timeout: Duration,
}

impl Dispatcher {
    pub fn new(pool: Arc<Pool>, request_timeout: Duration) -> Self {
        Self::with_router(pool, Arc::new(Router::new()), request_timeout)
    }

    pub fn with_router(pool: Arc<Pool>, router: Arc<Router>, request_timeout: Duration) -> Self {
        Self {
            pool,
            router,
            request_timeout,
        }
    }

    /// Single-node pool over TCP; an empty address means `localhost:3301`
    pub async fn connect(addr: &str) -> PoolResult<Self> {
        Self::connect_pool(&[addr], Config::default()).await
    }

    /// Pool over TCP to `addrs`, which replace `config.nodes`. Empty
    /// addresses are dropped; none left means `localhost:3301`.
    pub async fn connect_pool<S: AsRef<str>>(addrs: &[S], mut config: Config) -> PoolResult<Self> {
        config.nodes = addrs
            .iter()
            .map(|addr| addr.as_ref().trim())
            .filter(|addr| !addr.is_empty())
            .map(str::to_string)
            .collect();
        if config.nodes.is_empty() {
            config.nodes.push(DEFAULT_ADDR.to_string());
        }
        Self::from_config(config).await
    }

    /// Pool over TCP to `config.nodes`
    pub async fn from_config(config: Config) -> PoolResult<Self> {
        let transport = Arc::new(TcpTransport::new(config.connection.connect_timeout()));
        Self::with_transport(config, transport).await
    }

    pub async fn with_transport(config: Config, transport: Arc<dyn Transport>) -> PoolResult<Self> {
        let pool = Pool::connect(&config, transport).await?;
        info!("Dispatcher ready with {} nodes", pool.len().await);
        Ok(Self::new(Arc::new(pool), config.connection.request_timeout()))
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub async fn snapshot(&self) -> Vec<Node> {
        self.pool.snapshot().await
    }

    pub async fn add_node(&self, addr: &str) -> PoolResult<()> {
        self.pool.add_node(addr).await
    }

    pub async fn remove_node(&self, addr: &str) -> PoolResult<()> {
        self.pool.remove_node(addr).await
    }

    /// Close the shared pool; every clone of this dispatcher is affected
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Route and send `op`, returning the raw response.
    ///
    /// `None` uses the verb's default mode, see [`default_mode`].
    pub async fn execute(&self, op: Operation, mode: Option<RoutingMode>) -> PoolResult<Response> {
        if self.pool.is_closed() {
            return Err(PoolError::PoolClosed);
        }

        let opcode = op.opcode();
        let mode = mode.unwrap_or_else(|| default_mode(&op));
        // One deadline for every attempt
        let request = op.into_request(Instant::now() + self.request_timeout)?;

        let snapshot = self.pool.snapshot().await;
        let candidates = match self.router.candidates(mode, &snapshot) {
            Ok(candidates) => candidates,
            Err(e) => {
                log_failure(opcode, &e);
                return Err(e);
            }
        };

        let mut last_error = PoolError::no_eligible_node(mode);
        for (attempt, addr) in candidates.iter().take(MAX_ATTEMPTS).enumerate() {
            let result = match self.pool.connection(addr).await {
                Some(conn) => conn
                    .send(request.clone())
                    .await
                    .and_then(Response::into_result),
                // Removed since the snapshot was taken
                None => Err(PoolError::no_eligible_node(mode)),
            };

            match result {
                Ok(response) => {
                    if attempt > 0 {
                        info!("{} succeeded on {} after failover", opcode, addr);
                    }
                    return Ok(response);
                }
                Err(e) if e.is_retryable() => {
                    // Closing the pool closes its connections; report the cause
                    if self.pool.is_closed() {
                        return Err(PoolError::PoolClosed);
                    }
                    debug!("{} on {} failed ({}), trying next candidate", opcode, addr, e);
                    last_error = e;
                }
                Err(e) => {
                    log_failure(opcode, &e);
                    return Err(e);
                }
            }
        }

        log_failure(opcode, &last_error);
        Err(last_error)
    }

    async fn data(&self, op: Operation, mode: Option<RoutingMode>) -> PoolResult<Vec<Value>> {
        self.execute(op, mode).await?.data()
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn select(
        &self,
        space: impl Into<Value>,
        index: impl Into<Value>,
        offset: u32,
        limit: u32,
        iterator: u32,
        key: impl Into<Value>,
        mode: Option<RoutingMode>,
    ) -> PoolResult<Vec<Value>> {
        let op = Operation::Select {
            space: space.into(),
            index: index.into(),
            offset,
            limit,
            iterator,
            key: key.into(),
        };
        self.data(op, mode).await
    }

    pub async fn insert(
        &self,
        space: impl Into<Value>,
        tuple: impl Into<Value>,
        mode: Option<RoutingMode>,
    ) -> PoolResult<Vec<Value>> {
        let op = Operation::Insert {
            space: space.into(),
            tuple: tuple.into(),
        };
        self.data(op, mode).await
    }

    pub async fn replace(
        &self,
        space: impl Into<Value>,
        tuple: impl Into<Value>,
        mode: Option<RoutingMode>,
    ) -> PoolResult<Vec<Value>> {
        let op = Operation::Replace {
            space: space.into(),
            tuple: tuple.into(),
        };
        self.data(op, mode).await
    }

    pub async fn delete(
        &self,
        space: impl Into<Value>,
        index: impl Into<Value>,
        key: impl Into<Value>,
        mode: Option<RoutingMode>,
    ) -> PoolResult<Vec<Value>> {
        let op = Operation::Delete {
            space: space.into(),
            index: index.into(),
            key: key.into(),
        };
        self.data(op, mode).await
    }

    pub async fn update(
        &self,
        space: impl Into<Value>,
        index: impl Into<Value>,
        key: impl Into<Value>,
        ops: impl Into<Value>,
        mode: Option<RoutingMode>,
    ) -> PoolResult<Vec<Value>> {
        let op = Operation::Update {
            space: space.into(),
            index: index.into(),
            key: key.into(),
            ops: ops.into(),
        };
        self.data(op, mode).await
    }

    pub async fn upsert(
        &self,
        space: impl Into<Value>,
        tuple: impl Into<Value>,
        ops: impl Into<Value>,
        mode: Option<RoutingMode>,
    ) -> PoolResult<Vec<Value>> {
        let op = Operation::Upsert {
            space: space.into(),
            tuple: tuple.into(),
            ops: ops.into(),
        };
        self.data(op, mode).await
    }

    /// Call a stored function, old calling convention
    pub async fn call(
        &self,
        function: &str,
        args: impl Into<Value>,
        mode: Option<RoutingMode>,
    ) -> PoolResult<Vec<Value>> {
        let op = Operation::Call16 {
            function: function.to_string(),
            args: args.into(),
        };
        self.data(op, mode).await
    }

    /// Call a stored function, returning its results unwrapped
    pub async fn call17(
        &self,
        function: &str,
        args: impl Into<Value>,
        mode: Option<RoutingMode>,
    ) -> PoolResult<Vec<Value>> {
        let op = Operation::Call17 {
            function: function.to_string(),
            args: args.into(),
        };
        self.data(op, mode).await
    }

    pub async fn eval(
        &self,
        expr: &str,
        args: impl Into<Value>,
        mode: Option<RoutingMode>,
    ) -> PoolResult<Vec<Value>> {
        let op = Operation::Eval {
            expr: expr.to_string(),
            args: args.into(),
        };
        self.data(op, mode).await
    }

    pub async fn ping(&self, mode: Option<RoutingMode>) -> PoolResult<()> {
        self.execute(Operation::Ping, mode).await.map(|_| ())
    }

    pub async fn select_prefer_rw(
        &self,
        space: impl Into<Value>,
        index: impl Into<Value>,
        offset: u32,
        limit: u32,
        iterator: u32,
        key: impl Into<Value>,
    ) -> PoolResult<Vec<Value>> {
        let mode = Some(RoutingMode::PreferReadWrite);
        self.select(space, index, offset, limit, iterator, key, mode).await
    }

    pub async fn select_prefer_ro(
        &self,
        space: impl Into<Value>,
        index: impl Into<Value>,
        offset: u32,
        limit: u32,
        iterator: u32,
        key: impl Into<Value>,
    ) -> PoolResult<Vec<Value>> {
        let mode = Some(RoutingMode::PreferReadOnly);
        self.select(space, index, offset, limit, iterator, key, mode).await
    }

    pub async fn call_prefer_rw(
        &self,
        function: &str,
        args: impl Into<Value>,
    ) -> PoolResult<Vec<Value>> {
        self.call(function, args, Some(RoutingMode::PreferReadWrite)).await
    }

    pub async fn call_prefer_ro(
        &self,
        function: &str,
        args: impl Into<Value>,
    ) -> PoolResult<Vec<Value>> {
        self.call(function, args, Some(RoutingMode::PreferReadOnly)).await
    }

    pub async fn call17_prefer_ro(
        &self,
        function: &str,
        args: impl Into<Value>,
    ) -> PoolResult<Vec<Value>> {
        self.call17(function, args, Some(RoutingMode::PreferReadOnly)).await
    }

    pub async fn call17_rw(
        &self,
        function: &str,
        args: impl Into<Value>,
    ) -> PoolResult<Vec<Value>> {
        self.call17(function, args, Some(RoutingMode::RequireReadWrite)).await
    }

    pub async fn eval_prefer_rw(
        &self,
        expr: &str,
        args: impl Into<Value>,
    ) -> PoolResult<Vec<Value>> {
        self.eval(expr, args, Some(RoutingMode::PreferReadWrite)).await
    }

    pub async fn eval_prefer_ro(
        &self,
        expr: &str,
        args: impl Into<Value>,
    ) -> PoolResult<Vec<Value>> {
        self.eval(expr, args, Some(RoutingMode::PreferReadOnly)).await
    }

    pub async fn eval_rw(
        &self,
        expr: &str,
        args: impl Into<Value>,
    ) -> PoolResult<Vec<Value>> {
        self.eval(expr, args, Some(RoutingMode::RequireReadWrite)).await
    }
}

fn log_failure(opcode: Opcode, e: &PoolError) {
    match e.severity() {
        ErrorSeverity::Critical | ErrorSeverity::Error => error!("{} failed: {}", opcode, e),
        ErrorSeverity::Warning => warn!("{} failed: {}", opcode, e),
        ErrorSeverity::Info => debug!("{} failed: {}", opcode, e),
    }
}
