//! Pool membership
//!
//! Each member pairs a node record with its connection and owns two
//! background tasks: a [`NodeMonitor`] that keeps the record current and a
//! reconnect loop that brings the connection back with backoff.
//!
//! Membership is the only shared mutable structure. Readers take snapshots
//! under a read lock; additions and removals are serialized by a separate
//! mutex so their connect I/O never happens under the read/write lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, Notify, RwLock};
use tracing::{debug, info, warn};

use crate::config::{validate_addr, Config};
use crate::core::connection::{ConnState, ConnectOptions, Connection};
use crate::core::transport::Transport;
use crate::core::Node;
use crate::error::{ConnectError, PoolError, PoolResult};
use crate::health::{NodeMonitor, Prober, RoleProber};
use crate::utils::{format_duration, Backoff};

struct Member {
    addr: String,
    node: Arc<watch::Sender<Node>>,
    conn: Connection,
    shutdown: watch::Sender<bool>,
}

impl Member {
    fn stop(&self) {
        self.shutdown.send_replace(true);
        self.conn.close();
    }
}

impl Drop for Member {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The set of nodes a client talks to
pub struct Pool {
    members: RwLock<Vec<Arc<Member>>>,
    membership: Mutex<()>,
    transport: Arc<dyn Transport>,
    monitor: Arc<NodeMonitor>,
    options: ConnectOptions,
    reconnect_base: Duration,
    reconnect_max: Duration,
    closed: AtomicBool,
}

impl Pool {
    /// An empty pool probing roles with [`RoleProber`]
    pub fn new(config: &Config, transport: Arc<dyn Transport>) -> Self {
        let prober = Arc::new(RoleProber::from_config(&config.health));
        Self::with_prober(config, transport, prober)
    }

    pub fn with_prober(
        config: &Config,
        transport: Arc<dyn Transport>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        Self {
            members: RwLock::new(Vec::new()),
            membership: Mutex::new(()),
            transport,
            monitor: Arc::new(NodeMonitor::new(prober, &config.health)),
            options: ConnectOptions::from(&config.connection),
            reconnect_base: config.connection.reconnect_base(),
            reconnect_max: config.connection.reconnect_max(),
            closed: AtomicBool::new(false),
        }
    }

    /// Build a pool over `config.nodes`.
    ///
    /// Nodes that cannot be reached are kept as down members and retried in
    /// the background. Fails only when none of the nodes could be reached.
    pub async fn connect(config: &Config, transport: Arc<dyn Transport>) -> PoolResult<Self> {
        config.validate()?;
        let pool = Self::new(config, transport);

        let mut reached = 0usize;
        let mut first_error: Option<ConnectError> = None;
        {
            let _membership = pool.membership.lock().await;
            for addr in &config.nodes {
                if pool.contains(addr).await {
                    warn!("Ignoring duplicate node {} in pool configuration", addr);
                    continue;
                }

                let opened =
                    Connection::open(addr.as_str(), &*pool.transport, &pool.options).await;
                let conn = match opened {
                    Ok(conn) => {
                        reached += 1;
                        conn
                    }
                    Err(e) => {
                        warn!("Node {} unreachable, will keep retrying: {}", addr, e);
                        first_error.get_or_insert(e);
                        Connection::new(addr.as_str())
                    }
                };
                pool.join(conn).await?;
            }
        }

        if reached == 0 {
            if let Some(e) = first_error {
                pool.close().await;
                return Err(e.into());
            }
        }

        info!(
            "Connection pool ready: {}/{} nodes reachable",
            reached,
            config.nodes.len()
        );
        Ok(pool)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> PoolResult<()> {
        if self.is_closed() {
            Err(PoolError::PoolClosed)
        } else {
            Ok(())
        }
    }

    async fn contains(&self, addr: &str) -> bool {
        self.members.read().await.iter().any(|m| m.addr == addr)
    }

    /// Connect to `addr`, learn its role and start routing to it
    pub async fn add_node(&self, addr: &str) -> PoolResult<()> {
        self.ensure_open()?;
        validate_addr(addr)?;

        let _membership = self.membership.lock().await;
        if self.contains(addr).await {
            return Err(PoolError::DuplicateNode {
                addr: addr.to_string(),
            });
        }

        let conn = Connection::open(addr, &*self.transport, &self.options).await?;
        self.join(conn).await?;
        info!("Added node {} to the pool", addr);
        Ok(())
    }

    /// Stop routing to `addr` and close its connection.
    ///
    /// Requests still in flight on it resolve with `Closed`.
    pub async fn remove_node(&self, addr: &str) -> PoolResult<()> {
        self.ensure_open()?;

        let _membership = self.membership.lock().await;
        let member = {
            let mut members = self.members.write().await;
            let index = members
                .iter()
                .position(|m| m.addr == addr)
                .ok_or_else(|| PoolError::UnknownNode {
                    addr: addr.to_string(),
                })?;
            members.remove(index)
        };

        member.stop();
        info!("Removed node {} from the pool", addr);
        Ok(())
    }

    /// Probe a fresh connection once, then publish it with its tasks.
    /// Caller holds the membership mutex.
    async fn join(&self, conn: Connection) -> PoolResult<()> {
        let addr = conn.addr().to_string();
        let node = Arc::new(watch::channel(Node::new(addr.as_str())).0);
        if conn.is_connected() {
            self.monitor.check(&conn, &node).await;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let probe_now = Arc::new(Notify::new());

        tokio::spawn({
            let monitor = Arc::clone(&self.monitor);
            let conn = conn.clone();
            let node = Arc::clone(&node);
            let probe_now = Arc::clone(&probe_now);
            let shutdown = shutdown_rx.clone();
            async move { monitor.run(conn, node, probe_now, shutdown).await }
        });

        tokio::spawn(reconnect_loop(
            conn.clone(),
            Arc::clone(&self.transport),
            self.options.clone(),
            Backoff::new(self.reconnect_base, self.reconnect_max),
            probe_now,
            shutdown_rx,
        ));

        let member = Arc::new(Member {
            addr,
            node,
            conn,
            shutdown,
        });

        let mut members = self.members.write().await;
        // close() may have run while we were probing
        if self.is_closed() {
            drop(members);
            member.stop();
            return Err(PoolError::PoolClosed);
        }
        members.push(member);
        Ok(())
    }

    /// Copy of every node record, in membership order
    pub async fn snapshot(&self) -> Vec<Node> {
        self.members
            .read()
            .await
            .iter()
            .map(|m| m.node.borrow().clone())
            .collect()
    }

    /// Connection of the member at `addr`, if it is still a member
    pub async fn connection(&self, addr: &str) -> Option<Connection> {
        self.members
            .read()
            .await
            .iter()
            .find(|m| m.addr == addr)
            .map(|m| m.conn.clone())
    }

    /// Watch the record of the member at `addr`
    pub async fn subscribe(&self, addr: &str) -> Option<watch::Receiver<Node>> {
        self.members
            .read()
            .await
            .iter()
            .find(|m| m.addr == addr)
            .map(|m| m.node.subscribe())
    }

    pub async fn len(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.read().await.is_empty()
    }

    /// Stop every monitor and reconnect task and close every connection.
    /// Later operations fail with `PoolClosed`; calling it again does nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _membership = self.membership.lock().await;
        let members = std::mem::take(&mut *self.members.write().await);
        for member in &members {
            member.stop();
        }
        info!("Connection pool closed ({} members)", members.len());
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Bring `conn` back whenever it drops, until shutdown
async fn reconnect_loop(
    conn: Connection,
    transport: Arc<dyn Transport>,
    options: ConnectOptions,
    mut backoff: Backoff,
    probe_now: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut state = conn.subscribe();

    loop {
        let disconnected = async {
            state
                .wait_for(|s| matches!(s, ConnState::Disconnected | ConnState::Closing))
                .await
                .map(|s| *s)
        };
        tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => break,
            current = disconnected => match current {
                Ok(ConnState::Disconnected) => {}
                _ => break,
            },
        }

        let delay = backoff.next_delay();
        debug!(
            "Reconnecting to {} in {} (attempt {})",
            conn.addr(),
            format_duration(delay),
            backoff.attempt()
        );
        tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => break,
            _ = tokio::time::sleep(delay) => {}
        }

        match conn.connect(&*transport, &options).await {
            Ok(()) => {
                info!(
                    "Reconnected to {} after {} attempts",
                    conn.addr(),
                    backoff.attempt()
                );
                backoff.reset();
                probe_now.notify_one();
            }
            Err(e) => debug!("Reconnect to {} failed: {}", conn.addr(), e),
        }
    }

    debug!("Reconnect task for {} stopped", conn.addr());
}
