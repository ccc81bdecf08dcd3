//! Node configuration.
//!
//! Static for the process lifetime; loaded from the environment and validated
//! once at startup. The trigger-capable type set and the undeploy timeout are
//! configuration rather than constants so operators can tune them per node.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;

/// Default number of pre-warmed VMs sustained by the pool.
const DEFAULT_POOL_SIZE: usize = 1;

/// Default deadline for the agent handshake after a VM launch.
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5000;

/// Default deadline for deploy acknowledgement from the agent.
const DEFAULT_DEPLOY_TIMEOUT_MS: u64 = 1000;

/// Default deadline for graceful undeploy before teardown proceeds anyway.
const DEFAULT_UNDEPLOY_TIMEOUT_MS: u64 = 500;

/// Default deadline for a forwarded trigger execution.
const DEFAULT_TRIGGER_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Warm pool size N.
    pub machine_pool_size: usize,

    /// Workload type tags this node accepts.
    pub workload_types: Vec<String>,

    /// Subset of workload types allowed to register trigger subjects.
    pub trigger_capable_types: Vec<String>,

    /// Issuer public keys accepted on deploy claims. Empty accepts any.
    pub valid_issuers: Vec<String>,

    /// Deadline for the agent handshake.
    pub handshake_timeout: Duration,

    /// Deadline for deploy acknowledgement.
    pub deploy_timeout: Duration,

    /// Deadline for graceful undeploy.
    pub undeploy_timeout: Duration,

    /// Deadline for forwarded trigger execution.
    pub trigger_timeout: Duration,

    /// Skip the CNI reset at startup.
    pub preserve_network: bool,

    /// Operator tags published in ping/info responses.
    pub tags: HashMap<String, String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            machine_pool_size: DEFAULT_POOL_SIZE,
            workload_types: vec![
                "native".to_string(),
                "v8".to_string(),
                "wasm".to_string(),
            ],
            trigger_capable_types: vec!["v8".to_string(), "wasm".to_string()],
            valid_issuers: Vec::new(),
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            deploy_timeout: Duration::from_millis(DEFAULT_DEPLOY_TIMEOUT_MS),
            undeploy_timeout: Duration::from_millis(DEFAULT_UNDEPLOY_TIMEOUT_MS),
            trigger_timeout: Duration::from_millis(DEFAULT_TRIGGER_TIMEOUT_MS),
            preserve_network: false,
            tags: HashMap::new(),
        }
    }
}

impl NodeConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(size) = env_parse::<usize>("NEX_MACHINE_POOL_SIZE") {
            config.machine_pool_size = size;
        }

        if let Ok(types) = std::env::var("NEX_WORKLOAD_TYPES") {
            config.workload_types = split_list(&types);
        }

        if let Ok(types) = std::env::var("NEX_TRIGGER_CAPABLE_TYPES") {
            config.trigger_capable_types = split_list(&types);
        }

        if let Ok(issuers) = std::env::var("NEX_VALID_ISSUERS") {
            config.valid_issuers = split_list(&issuers);
        }

        if let Some(ms) = env_parse::<u64>("NEX_HANDSHAKE_TIMEOUT_MS") {
            config.handshake_timeout = Duration::from_millis(ms);
        }

        if let Some(ms) = env_parse::<u64>("NEX_DEPLOY_TIMEOUT_MS") {
            config.deploy_timeout = Duration::from_millis(ms);
        }

        if let Some(ms) = env_parse::<u64>("NEX_UNDEPLOY_TIMEOUT_MS") {
            config.undeploy_timeout = Duration::from_millis(ms);
        }

        if let Some(ms) = env_parse::<u64>("NEX_TRIGGER_TIMEOUT_MS") {
            config.trigger_timeout = Duration::from_millis(ms);
        }

        config.preserve_network = std::env::var("NEX_PRESERVE_NETWORK")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        if let Ok(tags) = std::env::var("NEX_NODE_TAGS") {
            // comma-separated key=value pairs
            for pair in tags.split(',') {
                if let Some((k, v)) = pair.split_once('=') {
                    config.tags.insert(k.trim().to_string(), v.trim().to_string());
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate invariants the rest of the node relies on.
    pub fn validate(&self) -> Result<()> {
        if self.machine_pool_size == 0 {
            anyhow::bail!("machine pool size must be at least 1");
        }

        if self.workload_types.is_empty() {
            anyhow::bail!("at least one accepted workload type is required");
        }

        for t in &self.trigger_capable_types {
            if !self.supports_workload_type(t) {
                anyhow::bail!("trigger-capable type {t} is not an accepted workload type");
            }
        }

        Ok(())
    }

    /// Whether this node accepts the given workload type tag.
    pub fn supports_workload_type(&self, workload_type: &str) -> bool {
        self.workload_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(workload_type))
    }

    /// Whether the given workload type may register trigger subjects.
    pub fn supports_trigger_subjects(&self, workload_type: &str) -> bool {
        self.trigger_capable_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(workload_type))
    }

    /// Whether the given claim issuer is acceptable. An empty list accepts any.
    pub fn issuer_is_valid(&self, issuer: &str) -> bool {
        self.valid_issuers.is_empty() || self.valid_issuers.iter().any(|i| i == issuer)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.supports_workload_type("native"));
        assert!(config.supports_trigger_subjects("v8"));
        assert!(!config.supports_trigger_subjects("native"));
    }

    #[test]
    fn test_trigger_capability_is_case_insensitive() {
        let config = NodeConfig::default();
        assert!(config.supports_trigger_subjects("V8"));
        assert!(config.supports_trigger_subjects("Wasm"));
    }

    #[test]
    fn test_empty_issuer_list_accepts_any() {
        let config = NodeConfig::default();
        assert!(config.issuer_is_valid("anyone"));

        let restricted = NodeConfig {
            valid_issuers: vec!["X".to_string()],
            ..NodeConfig::default()
        };
        assert!(restricted.issuer_is_valid("X"));
        assert!(!restricted.issuer_is_valid("Y"));
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let config = NodeConfig {
            machine_pool_size: 0,
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_trigger_capable_must_be_accepted() {
        let config = NodeConfig {
            workload_types: vec!["native".to_string()],
            trigger_capable_types: vec!["v8".to_string()],
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
