use crate::types::PodAddress;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runtime options of the sharding core.
///
/// Durations deserialize from humantime strings ("100ms", "1min"). All
/// fields have production defaults; deployments typically override
/// `number_of_shards` (which must agree across every pod) and the self
/// address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Divisor of the shard function. Must be identical on every pod.
    pub number_of_shards: u32,
    /// Hostname under which peer pods reach this pod.
    pub self_host: String,
    /// Port of the pod-to-pod transport.
    pub sharding_port: u16,
    /// Default timeout applied by messengers. `None` disables it.
    #[serde(with = "humantime_serde")]
    pub send_timeout: Option<Duration>,
    /// How long an entity may go without receiving before it is terminated.
    #[serde(with = "humantime_serde")]
    pub entity_max_idle_time: Duration,
    /// Bound on waiting for entities to drain during graceful termination.
    #[serde(with = "humantime_serde")]
    pub entity_termination_timeout: Duration,
    /// Backoff between restarts of the assignment refresh pipeline.
    #[serde(with = "humantime_serde")]
    pub refresh_assignments_retry_interval: Duration,
    /// Debounce for reporting unreachable pods to the shard manager.
    #[serde(with = "humantime_serde")]
    pub unhealthy_pod_report_interval: Duration,
    /// When true, self-targeted sends still go through the encode, transport
    /// and decode loop. Used to exercise serialization in single-pod tests.
    pub simulate_remote_pods: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            number_of_shards: 300,
            self_host: "localhost".to_string(),
            sharding_port: 54321,
            send_timeout: Some(Duration::from_secs(10)),
            entity_max_idle_time: Duration::from_secs(60),
            entity_termination_timeout: Duration::from_secs(3),
            refresh_assignments_retry_interval: Duration::from_secs(5),
            unhealthy_pod_report_interval: Duration::from_secs(5),
            simulate_remote_pods: false,
        }
    }
}

impl Config {
    /// The address this pod advertises to the shard manager.
    pub fn self_address(&self) -> PodAddress {
        PodAddress::new(self.self_host.clone(), self.sharding_port)
    }
}
