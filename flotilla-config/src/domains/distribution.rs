//! Distribution configuration: worker count, timeouts and RPC binding

use crate::domains::utils::serde_duration;
use crate::error::ConfigResult;
use crate::validation::{validate_nonzero_duration, validate_positive, validate_required_string, Validatable};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on the pause between heartbeats of a busy RPC server
pub const MAX_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// Heartbeats must fit at least three times into the RPC timeout
const HEARTBEATS_PER_TIMEOUT: u32 = 3;

/// How many workers to launch and how they talk to the pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    /// Number of workers to launch, including the local one
    pub worker_count: u32,

    /// Launch every worker remotely and keep the coordinator free of tasks
    pub use_dedicated_coordinator: bool,

    /// How long a remote worker may sit idle before shutting itself down
    #[serde(with = "serde_duration")]
    pub idle_timeout: Duration,

    /// Attempts per task before its last error is reported
    pub max_attempts: u32,

    /// How long an RPC peer may stay silent before it is considered gone
    #[serde(with = "serde_duration")]
    pub rpc_timeout: Duration,

    /// Address RPC servers bind to
    pub bind_address: String,

    /// Host name or address advertised in endpoints instead of the
    /// detected local addresses
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_host: Option<String>,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            use_dedicated_coordinator: false,
            idle_timeout: Duration::from_secs(600),
            max_attempts: 2,
            rpc_timeout: Duration::from_secs(10),
            bind_address: "0.0.0.0".to_string(),
            advertise_host: None,
        }
    }
}

impl DistributionConfig {
    /// Number of workers started through the remote launcher
    pub fn remote_worker_count(&self) -> u32 {
        if self.use_dedicated_coordinator {
            self.worker_count
        } else {
            self.worker_count.saturating_sub(1)
        }
    }

    /// Whether a worker runs next to the coordinator
    pub fn launches_local_worker(&self) -> bool {
        !self.use_dedicated_coordinator && self.worker_count > 0
    }

    /// Interval at which servers send heartbeats during a long request.
    /// Clients restart their timeout on every heartbeat, so a busy worker
    /// is never mistaken for a lost one.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.rpc_timeout / HEARTBEATS_PER_TIMEOUT).min(MAX_HEARTBEAT_INTERVAL)
    }
}

impl Validatable for DistributionConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.max_attempts, "max_attempts", self.domain_name())?;
        validate_nonzero_duration(self.idle_timeout, "idle_timeout", self.domain_name())?;
        validate_nonzero_duration(self.rpc_timeout, "rpc_timeout", self.domain_name())?;
        validate_required_string(&self.bind_address, "bind_address", self.domain_name())?;

        let heartbeat = self.heartbeat_interval();
        if heartbeat < Duration::from_millis(1) || heartbeat >= self.rpc_timeout {
            return Err(self.validation_error(format!(
                "rpc_timeout of {:?} leaves no room for heartbeats; use at least 3ms",
                self.rpc_timeout
            )));
        }

        if let Some(host) = &self.advertise_host {
            validate_required_string(host, "advertise_host", self.domain_name())?;
        }

        if self.use_dedicated_coordinator && self.worker_count == 0 {
            log::warn!("Dedicated coordinator requested with zero workers; tasks will wait for a worker to register");
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "distribution"
    }
}
