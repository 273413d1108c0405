//! Configuration of the service discovery backend.
//!
//! All other knobs of the cache (segment count, TTLs, ring replicas, RPC deadline) are
//! constants next to the code they tune; only the registry settings vary per
//! deployment and are therefore collected here and filled from the command line.
use std::time::Duration;

/// Service name used as registry prefix unless one is configured.
pub const DEFAULT_SERVICE_NAME: &str = "fishcache";

/// Deadline for registry operations (connect, list, lease grant).
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings for the etcd backed service registry.
#[derive(Clone, Debug)]
pub struct EtcdConfig {
    /// The etcd endpoints to connect to.
    pub endpoints: Vec<String>,

    /// Deadline applied to individual registry operations.
    pub timeout: Duration,

    /// The prefix under which all peers of this ring register themselves.
    pub service_name: String,
}

impl EtcdConfig {
    /// Creates a config for the given endpoints, keeping the default timeout and
    /// service name.
    pub fn new(endpoints: Vec<String>) -> Self {
        EtcdConfig {
            endpoints,
            ..EtcdConfig::default()
        }
    }
}

impl Default for EtcdConfig {
    fn default() -> Self {
        EtcdConfig {
            endpoints: Vec::new(),
            timeout: DEFAULT_DISCOVERY_TIMEOUT,
            service_name: DEFAULT_SERVICE_NAME.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied() {
        let config = EtcdConfig::new(vec!["127.0.0.1:2379".to_owned()]);
        assert_eq!(config.endpoints.len(), 1);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.service_name, "fishcache");
    }
}
