//! Core abstractions: node records, connections, transports and the pool
pub mod connection;
pub mod pool;
pub mod transport;

use std::fmt;
use std::time::SystemTime;

/// Capability of a node as last observed by a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Primary, accepts writes
    ReadWrite,
    /// Replica, serves reads only
    ReadOnly,
    /// Never probed successfully
    Unknown,
}

impl Role {
    pub fn from_read_only(read_only: bool) -> Self {
        if read_only {
            Role::ReadOnly
        } else {
            Role::ReadWrite
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::ReadWrite => write!(f, "rw"),
            Role::ReadOnly => write!(f, "ro"),
            Role::Unknown => write!(f, "unknown"),
        }
    }
}

/// Health of a node.
///
/// `Suspect` sits between `Up` and `Down`: the node has failed recent probes
/// but not enough of them in a row to be written off. It stays routable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Health {
    Up,
    Suspect,
    Down,
}

impl Health {
    /// Whether the router may hand out this node
    pub fn is_routable(&self) -> bool {
        !matches!(self, Health::Down)
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Health::Up => write!(f, "up"),
            Health::Suspect => write!(f, "suspect"),
            Health::Down => write!(f, "down"),
        }
    }
}

/// One server instance of the cluster, identified by its address
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub addr: String,
    pub role: Role,
    pub health: Health,
    pub last_probe: Option<SystemTime>,
    /// Consecutive failed probes since the last success
    pub failures: u32,
}

impl Node {
    /// A freshly added node: role unknown, down until a probe says otherwise
    pub fn new<S: Into<String>>(addr: S) -> Self {
        Self {
            addr: addr.into(),
            role: Role::Unknown,
            health: Health::Down,
            last_probe: None,
            failures: 0,
        }
    }

    /// Convenience constructor for a probed node
    pub fn with_state<S: Into<String>>(addr: S, role: Role, health: Health) -> Self {
        Self {
            addr: addr.into(),
            role,
            health,
            last_probe: Some(SystemTime::now()),
            failures: 0,
        }
    }

    /// Record a successful probe
    pub fn probe_succeeded(&mut self, role: Role) {
        self.role = role;
        self.health = Health::Up;
        self.failures = 0;
        self.last_probe = Some(SystemTime::now());
    }

    /// Record a failed probe; `Down` only once `threshold` failures piled up
    pub fn probe_failed(&mut self, threshold: u32) {
        self.failures = self.failures.saturating_add(1);
        self.last_probe = Some(SystemTime::now());
        self.health = if self.failures >= threshold.max(1) {
            Health::Down
        } else {
            Health::Suspect
        };
    }

    /// Link is gone; no point waiting for more failed probes
    pub fn mark_down(&mut self) {
        self.health = Health::Down;
    }
}
