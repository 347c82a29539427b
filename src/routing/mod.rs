//! Role-aware request routing
//!
//! The router is a pure function of a routing mode and a pool snapshot, plus
//! one shared round-robin counter. It never touches the network, which keeps
//! every selection rule testable on hand-built snapshots.
pub mod balancer;

use std::fmt;

use crate::core::{Node, Role};
use crate::error::{PoolError, PoolResult};
use balancer::{LoadBalancingAlgorithm, RoundRobin};

/// Per-request policy choosing which node roles are eligible
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutingMode {
    /// Any live node
    Any,
    /// Live primaries, falling back to replicas when there are none
    PreferReadWrite,
    /// Live replicas, falling back to primaries when there are none
    PreferReadOnly,
    /// Live primaries only
    RequireReadWrite,
    /// Live replicas only
    RequireReadOnly,
}

impl RoutingMode {
    /// Role a node must have, for the strict modes
    pub fn required_role(&self) -> Option<Role> {
        match self {
            RoutingMode::RequireReadWrite => Some(Role::ReadWrite),
            RoutingMode::RequireReadOnly => Some(Role::ReadOnly),
            _ => None,
        }
    }

    /// Role to favour, for the modes that may fall back
    pub fn preferred_role(&self) -> Option<Role> {
        match self {
            RoutingMode::PreferReadWrite => Some(Role::ReadWrite),
            RoutingMode::PreferReadOnly => Some(Role::ReadOnly),
            _ => None,
        }
    }
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingMode::Any => write!(f, "any"),
            RoutingMode::PreferReadWrite => write!(f, "prefer-rw"),
            RoutingMode::PreferReadOnly => write!(f, "prefer-ro"),
            RoutingMode::RequireReadWrite => write!(f, "require-rw"),
            RoutingMode::RequireReadOnly => write!(f, "require-ro"),
        }
    }
}

/// Ordered candidate addresses produced by one selection.
///
/// The first entry is the round-robin pick. The rest are the remaining
/// members of the same partition, then (for the `Prefer*` modes) the
/// fallback partition; the dispatcher walks them when it retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidates {
    mode: RoutingMode,
    addrs: Vec<String>,
}

impl Candidates {
    pub fn mode(&self) -> RoutingMode {
        self.mode
    }

    /// The selected node
    pub fn first(&self) -> &str {
        // Construction guarantees at least one entry
        self.addrs.first().map(String::as_str).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.addrs.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

/// Routing decision maker shared by all dispatchers of a pool
pub struct Router {
    balancer: Box<dyn LoadBalancingAlgorithm>,
}

impl Router {
    pub fn new() -> Self {
        Self::with_algorithm(Box::new(RoundRobin::new()))
    }

    pub fn with_algorithm(balancer: Box<dyn LoadBalancingAlgorithm>) -> Self {
        Self { balancer }
    }

    /// Select one node address for `mode`
    pub fn select(&self, mode: RoutingMode, snapshot: &[Node]) -> PoolResult<String> {
        let candidates = self.candidates(mode, snapshot)?;
        Ok(candidates.first().to_string())
    }

    /// Build the ordered candidate set for `mode`, advancing the round-robin
    /// counter exactly once.
    pub fn candidates(&self, mode: RoutingMode, snapshot: &[Node]) -> PoolResult<Candidates> {
        let live = snapshot.iter().filter(|node| node.health.is_routable());

        let (primary, fallback): (Vec<&Node>, Vec<&Node>) =
            match (mode.required_role(), mode.preferred_role()) {
                (Some(role), _) => (live.filter(|node| node.role == role).collect(), Vec::new()),
                (None, Some(role)) => {
                    let (matching, other): (Vec<&Node>, Vec<&Node>) =
                        live.partition(|node| node.role == role);
                    if matching.is_empty() {
                        (other, Vec::new())
                    } else {
                        (matching, other)
                    }
                }
                (None, None) => (live.collect(), Vec::new()),
            };

        let start = self
            .balancer
            .select_index(primary.len())
            .ok_or(PoolError::no_eligible_node(mode))?;

        let mut addrs = Vec::with_capacity(primary.len() + fallback.len());
        addrs.extend(rotated(&primary, start));
        if !fallback.is_empty() {
            addrs.extend(rotated(&fallback, start % fallback.len()));
        }

        tracing::trace!(%mode, selected = %addrs[0], candidates = addrs.len(), "routed request");
        Ok(Candidates { mode, addrs })
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

fn rotated<'a>(nodes: &'a [&'a Node], start: usize) -> impl Iterator<Item = String> + 'a {
    nodes[start..]
        .iter()
        .chain(nodes[..start].iter())
        .map(|node| node.addr.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Health;

    const ALL_MODES: [RoutingMode; 5] = [
        RoutingMode::Any,
        RoutingMode::PreferReadWrite,
        RoutingMode::PreferReadOnly,
        RoutingMode::RequireReadWrite,
        RoutingMode::RequireReadOnly,
    ];

    fn node(addr: &str, role: Role, health: Health) -> Node {
        Node::with_state(addr, role, health)
    }

    #[test]
    fn test_all_down_never_routes() {
        let router = Router::new();
        let snapshot = vec![
            node("a:1", Role::ReadWrite, Health::Down),
            node("b:1", Role::ReadOnly, Health::Down),
            node("c:1", Role::Unknown, Health::Down),
        ];

        for mode in ALL_MODES {
            let result = router.select(mode, &snapshot);
            assert!(
                matches!(result, Err(PoolError::NoEligibleNode { mode: m }) if m == mode),
                "mode {} routed to a down node",
                mode
            );
        }
    }

    #[test]
    fn test_empty_snapshot() {
        let router = Router::new();
        for mode in ALL_MODES {
            assert!(router.select(mode, &[]).is_err());
        }
    }

    #[test]
    fn test_require_rw_never_returns_replica() {
        let router = Router::new();
        let snapshot = vec![
            node("rw:1", Role::ReadWrite, Health::Down),
            node("ro:1", Role::ReadOnly, Health::Up),
            node("ro:2", Role::ReadOnly, Health::Up),
        ];

        for _ in 0..10 {
            assert!(matches!(
                router.select(RoutingMode::RequireReadWrite, &snapshot),
                Err(PoolError::NoEligibleNode { .. })
            ));
        }

        let snapshot = vec![
            node("ro:1", Role::ReadOnly, Health::Up),
            node("rw:1", Role::ReadWrite, Health::Up),
            node("ro:2", Role::ReadOnly, Health::Up),
        ];
        for _ in 0..10 {
            let candidates = router.candidates(RoutingMode::RequireReadWrite, &snapshot).unwrap();
            assert_eq!(candidates.iter().collect::<Vec<_>>(), vec!["rw:1"]);
        }
    }

    #[test]
    fn test_require_ro_filters_primaries() {
        let router = Router::new();
        let snapshot = vec![
            node("rw:1", Role::ReadWrite, Health::Up),
            node("ro:1", Role::ReadOnly, Health::Up),
        ];
        assert_eq!(router.select(RoutingMode::RequireReadOnly, &snapshot).unwrap(), "ro:1");
    }

    #[test]
    fn test_prefer_rw_falls_back_to_replica() {
        let router = Router::new();
        let snapshot = vec![
            node("rw:1", Role::ReadWrite, Health::Down),
            node("ro:1", Role::ReadOnly, Health::Up),
        ];
        assert_eq!(router.select(RoutingMode::PreferReadWrite, &snapshot).unwrap(), "ro:1");
    }

    #[test]
    fn test_prefer_ro_picks_replica_and_keeps_fallback_last() {
        let router = Router::new();
        let snapshot = vec![
            node("rw:1", Role::ReadWrite, Health::Up),
            node("ro:1", Role::ReadOnly, Health::Up),
        ];
        let candidates = router.candidates(RoutingMode::PreferReadOnly, &snapshot).unwrap();
        assert_eq!(candidates.first(), "ro:1");
        assert_eq!(candidates.iter().collect::<Vec<_>>(), vec!["ro:1", "rw:1"]);
    }

    #[test]
    fn test_unknown_role_only_eligible_for_any() {
        let router = Router::new();
        let snapshot = vec![node("u:1", Role::Unknown, Health::Up)];

        assert_eq!(router.select(RoutingMode::Any, &snapshot).unwrap(), "u:1");
        assert!(router.select(RoutingMode::RequireReadOnly, &snapshot).is_err());
        assert!(router.select(RoutingMode::RequireReadWrite, &snapshot).is_err());
        // Prefer modes fall back to whatever is live
        assert_eq!(router.select(RoutingMode::PreferReadWrite, &snapshot).unwrap(), "u:1");
    }

    #[test]
    fn test_suspect_nodes_stay_routable() {
        let router = Router::new();
        let snapshot = vec![node("a:1", Role::ReadWrite, Health::Suspect)];
        assert_eq!(router.select(RoutingMode::RequireReadWrite, &snapshot).unwrap(), "a:1");
    }

    #[test]
    fn test_round_robin_rotates_candidates() {
        let router = Router::new();
        let snapshot = vec![
            node("a:1", Role::ReadOnly, Health::Up),
            node("b:1", Role::ReadOnly, Health::Up),
            node("c:1", Role::ReadOnly, Health::Up),
        ];

        let first = router.candidates(RoutingMode::Any, &snapshot).unwrap();
        let second = router.candidates(RoutingMode::Any, &snapshot).unwrap();
        assert_eq!(first.iter().collect::<Vec<_>>(), vec!["a:1", "b:1", "c:1"]);
        assert_eq!(second.iter().collect::<Vec<_>>(), vec!["b:1", "c:1", "a:1"]);
    }

    #[test]
    fn test_round_robin_fairness_over_stable_set() {
        let router = Router::new();
        let snapshot = vec![
            node("a:1", Role::ReadOnly, Health::Up),
            node("b:1", Role::ReadOnly, Health::Up),
            node("c:1", Role::ReadWrite, Health::Up),
            node("d:1", Role::ReadOnly, Health::Down),
        ];

        let n = 100;
        let k = 3;
        let mut counts = std::collections::HashMap::new();
        for _ in 0..n {
            let addr = router.select(RoutingMode::Any, &snapshot).unwrap();
            *counts.entry(addr).or_insert(0usize) += 1;
        }

        assert_eq!(counts.len(), k);
        assert!(!counts.contains_key("d:1"));
        for count in counts.values() {
            assert!(*count >= n / k);
        }
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(RoutingMode::PreferReadOnly.to_string(), "prefer-ro");
        assert_eq!(RoutingMode::RequireReadWrite.required_role(), Some(Role::ReadWrite));
        assert_eq!(RoutingMode::Any.preferred_role(), None);
    }
}
