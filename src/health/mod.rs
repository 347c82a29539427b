/// Node monitoring: role probes and health dampening
pub mod role;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Notify};
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::core::connection::{ConnState, Connection};
use crate::core::{Health, Node, Role};

pub use role::RoleProber;

/// Outcome of one probe
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeStatus {
    Healthy { role: Role },
    Unhealthy { reason: String },
    Timeout,
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeStatus::Healthy { role } => write!(f, "Healthy ({})", role),
            ProbeStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            ProbeStatus::Timeout => write!(f, "Timeout"),
        }
    }
}

impl ProbeStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeStatus::Healthy { .. })
    }
}

/// Asks a node for its health and role over its pooled connection
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, conn: &Connection) -> ProbeStatus;

    /// Upper bound for one probe
    fn probe_timeout(&self) -> Duration;
}

/// Keeps one node record current.
///
/// Successful probes set role and health. Failed probes make the node
/// `Suspect` first and `Down` only after `failure_threshold` failures in a
/// row. A connection reported `Disconnected` marks the node `Down` at once.
pub struct NodeMonitor {
    prober: Arc<dyn Prober>,
    interval: Duration,
    failure_threshold: u32,
}

impl NodeMonitor {
    pub fn new(prober: Arc<dyn Prober>, config: &HealthConfig) -> Self {
        Self {
            prober,
            interval: config.interval(),
            failure_threshold: config.failure_threshold,
        }
    }

    /// Probe once and fold the outcome into `node`
    pub async fn check(&self, conn: &Connection, node: &watch::Sender<Node>) -> ProbeStatus {
        let status = match timeout(self.prober.probe_timeout(), self.prober.probe(conn)).await {
            Ok(status) => status,
            Err(_) => ProbeStatus::Timeout,
        };

        let addr = conn.addr();
        let threshold = self.failure_threshold;
        node.send_modify(|node| {
            let before = (node.role, node.health);
            match &status {
                ProbeStatus::Healthy { role } => node.probe_succeeded(*role),
                _ => node.probe_failed(threshold),
            }

            if before.0 != Role::Unknown && before.0 != node.role {
                warn!("Node {} changed role: {} -> {}", addr, before.0, node.role);
            }
            if before.1 != node.health {
                match node.health {
                    Health::Up => info!("Node {} is up ({})", addr, node.role),
                    Health::Suspect => warn!("Node {} is suspect: {}", addr, status),
                    Health::Down => warn!(
                        "Node {} is down after {} failed probes",
                        addr, node.failures
                    ),
                }
            }
        });

        debug!("Probe of {}: {}", addr, status);
        status
    }

    /// Monitor one member until `shutdown` flips or its sender goes away.
    ///
    /// `probe_now` skips the wait for the next tick; the pool fires it after
    /// a reconnect so the node is re-admitted without delay.
    pub async fn run(
        &self,
        conn: Connection,
        node: Arc<watch::Sender<Node>>,
        probe_now: Arc<Notify>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut state = conn.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = *state.borrow_and_update();
                    if matches!(current, ConnState::Disconnected | ConnState::Closing) {
                        mark_down(&node, conn.addr());
                    }
                    continue;
                }
                _ = probe_now.notified() => ticker.reset(),
                _ = ticker.tick() => {}
            }

            if conn.is_connected() {
                self.check(&conn, &node).await;
            } else {
                mark_down(&node, conn.addr());
            }
        }

        debug!("Monitor for {} stopped", conn.addr());
    }
}

fn mark_down(node: &watch::Sender<Node>, addr: &str) {
    node.send_if_modified(|node| {
        if node.health == Health::Down {
            return false;
        }
        node.mark_down();
        warn!("Node {} is down: connection lost", addr);
        true
    });
}
