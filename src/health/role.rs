/// Role probe: evaluate `box.info.ro` on the node
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{ProbeStatus, Prober};
use crate::config::HealthConfig;
use crate::core::connection::Connection;
use crate::core::Role;
use crate::error::PoolError;
use crate::protocol::{Operation, ROLE_PROBE_EXPR};

/// Asks each node whether it is read-only over its pooled connection
pub struct RoleProber {
    probe_timeout: Duration,
}

impl RoleProber {
    pub fn new(probe_timeout: Duration) -> Self {
        Self { probe_timeout }
    }

    pub fn from_config(config: &HealthConfig) -> Self {
        Self::new(config.timeout())
    }

    fn parse_role(data: &[Value]) -> ProbeStatus {
        match data.first().and_then(Value::as_bool) {
            Some(read_only) => ProbeStatus::Healthy {
                role: Role::from_read_only(read_only),
            },
            None => ProbeStatus::Unhealthy {
                reason: format!("unexpected probe result {:?}", data),
            },
        }
    }
}

#[async_trait]
impl Prober for RoleProber {
    async fn probe(&self, conn: &Connection) -> ProbeStatus {
        let op = Operation::Eval {
            expr: ROLE_PROBE_EXPR.to_string(),
            args: json!([]),
        };
        let request = match op.into_request(Instant::now() + self.probe_timeout) {
            Ok(request) => request,
            Err(e) => {
                return ProbeStatus::Unhealthy {
                    reason: e.to_string(),
                }
            }
        };

        let response = conn.send(request).await.and_then(|r| r.into_result());
        match response {
            Ok(response) => match response.data() {
                Ok(data) => Self::parse_role(&data),
                Err(e) => ProbeStatus::Unhealthy {
                    reason: e.to_string(),
                },
            },
            Err(PoolError::Timeout { .. }) => ProbeStatus::Timeout,
            Err(e) => ProbeStatus::Unhealthy {
                reason: e.to_string(),
            },
        }
    }

    fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }
}
