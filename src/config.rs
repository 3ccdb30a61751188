//! # Routing Configuration
//!
//! Every tunable used by the table, the handshake and the forwarding engine is a
//! field on [`RoutingConfig`]. A node takes one validated snapshot at construction
//! and shares it as `Arc<RoutingConfig>`; nothing mutates it afterwards.

use std::time::Duration;

use crate::error::ConfigError;

// ============================================================================
// Defaults (reference tuning)
// ============================================================================

/// Worker threads for the node runtime.
pub const DEFAULT_THREAD_COUNT: usize = 8;

/// Peers returned by a FindGroup query.
pub const DEFAULT_CLOSEST_NODES_SIZE: usize = 8;

/// Vaults per group.
pub const DEFAULT_NODE_GROUP_SIZE: usize = 4;

/// Hard cap on the routing set.
pub const DEFAULT_MAX_ROUTING_TABLE_SIZE: usize = 64;

/// High-water mark past which a removable node is offered for eviction.
pub const DEFAULT_ROUTING_TABLE_SIZE_THRESHOLD: usize = DEFAULT_MAX_ROUTING_TABLE_SIZE / 2;

/// Routing set cap when the owner runs as a client.
pub const DEFAULT_MAX_CLIENT_ROUTING_TABLE_SIZE: usize = 8;

/// Cap on attached clients and bootstrap sessions.
pub const DEFAULT_MAX_NON_ROUTING_TABLE_SIZE: usize = 64;

/// Target occupancy of each distance bucket.
pub const DEFAULT_BUCKET_TARGET_SIZE: usize = 1;

/// Largest serialized payload accepted by `seal`.
pub const DEFAULT_MAX_DATA_SIZE: usize = 67_107_840;

pub const DEFAULT_FIND_NODE_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_RECOVERY_TIME_LAG: Duration = Duration::from_secs(5);
pub const DEFAULT_RE_BOOTSTRAP_TIME_LAG: Duration = Duration::from_secs(10);
pub const DEFAULT_FIND_CLOSE_NODE_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_MAXIMUM_FIND_CLOSE_NODE_FAILURES: usize = 10;

/// Relayer ids remembered in a header.
pub const DEFAULT_MAX_ROUTE_HISTORY: usize = 5;

/// Initial `hops_remaining` on every originated message.
pub const DEFAULT_HOPS_TO_LIVE: u16 = 20;

pub const DEFAULT_CONNECT_RPC_PRUNE_TIMEOUT: Duration = Duration::from_secs(10);

/// Entries in the duplicate-receipt cache.
pub const DEFAULT_MESSAGE_HISTORY_SIZE: usize = 1024;

/// Routing configuration snapshot.
#[derive(Clone, Debug)]
pub struct RoutingConfig {
    // ========================================================================
    // Runtime
    // ========================================================================
    pub thread_count: usize,

    // ========================================================================
    // Groups and discovery
    // ========================================================================
    pub closest_nodes_size: usize,
    pub node_group_size: usize,

    // ========================================================================
    // Table bounds
    // ========================================================================
    pub max_routing_table_size: usize,
    pub routing_table_size_threshold: usize,
    pub max_client_routing_table_size: usize,
    pub max_non_routing_table_size: usize,
    pub bucket_target_size: usize,

    // ========================================================================
    // Messages
    // ========================================================================
    pub max_data_size: usize,
    pub max_route_history: usize,
    pub hops_to_live: u16,
    pub message_history_size: usize,

    // ========================================================================
    // Timers
    // ========================================================================
    pub find_node_interval: Duration,
    pub recovery_time_lag: Duration,
    pub re_bootstrap_time_lag: Duration,
    pub find_close_node_interval: Duration,
    pub maximum_find_close_node_failures: usize,
    pub connect_rpc_prune_timeout: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            thread_count: DEFAULT_THREAD_COUNT,

            closest_nodes_size: DEFAULT_CLOSEST_NODES_SIZE,
            node_group_size: DEFAULT_NODE_GROUP_SIZE,

            max_routing_table_size: DEFAULT_MAX_ROUTING_TABLE_SIZE,
            routing_table_size_threshold: DEFAULT_ROUTING_TABLE_SIZE_THRESHOLD,
            max_client_routing_table_size: DEFAULT_MAX_CLIENT_ROUTING_TABLE_SIZE,
            max_non_routing_table_size: DEFAULT_MAX_NON_ROUTING_TABLE_SIZE,
            bucket_target_size: DEFAULT_BUCKET_TARGET_SIZE,

            max_data_size: DEFAULT_MAX_DATA_SIZE,
            max_route_history: DEFAULT_MAX_ROUTE_HISTORY,
            hops_to_live: DEFAULT_HOPS_TO_LIVE,
            message_history_size: DEFAULT_MESSAGE_HISTORY_SIZE,

            find_node_interval: DEFAULT_FIND_NODE_INTERVAL,
            recovery_time_lag: DEFAULT_RECOVERY_TIME_LAG,
            re_bootstrap_time_lag: DEFAULT_RE_BOOTSTRAP_TIME_LAG,
            find_close_node_interval: DEFAULT_FIND_CLOSE_NODE_INTERVAL,
            maximum_find_close_node_failures: DEFAULT_MAXIMUM_FIND_CLOSE_NODE_FAILURES,
            connect_rpc_prune_timeout: DEFAULT_CONNECT_RPC_PRUNE_TIMEOUT,
        }
    }
}

impl RoutingConfig {
    /// Reject snapshots the table or engine cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_count == 0 {
            return Err(ConfigError::Invalid("thread_count must be at least 1"));
        }
        if self.node_group_size == 0 {
            return Err(ConfigError::Invalid("node_group_size must be at least 1"));
        }
        if self.closest_nodes_size < self.node_group_size {
            return Err(ConfigError::Invalid(
                "closest_nodes_size must not be smaller than node_group_size",
            ));
        }
        if self.max_routing_table_size < self.node_group_size {
            return Err(ConfigError::Invalid(
                "max_routing_table_size must hold at least one group",
            ));
        }
        if self.routing_table_size_threshold > self.max_routing_table_size {
            return Err(ConfigError::Invalid(
                "routing_table_size_threshold exceeds max_routing_table_size",
            ));
        }
        if self.max_client_routing_table_size == 0 || self.max_non_routing_table_size == 0 {
            return Err(ConfigError::Invalid("table capacities must be non-zero"));
        }
        if self.bucket_target_size == 0 {
            return Err(ConfigError::Invalid("bucket_target_size must be at least 1"));
        }
        if self.hops_to_live == 0 {
            return Err(ConfigError::Invalid("hops_to_live must be at least 1"));
        }
        if self.message_history_size == 0 {
            return Err(ConfigError::Invalid("message_history_size must be at least 1"));
        }
        if self.max_data_size == 0 {
            return Err(ConfigError::Invalid("max_data_size must be non-zero"));
        }
        for (name, interval) in [
            ("find_node_interval", self.find_node_interval),
            ("find_close_node_interval", self.find_close_node_interval),
            ("connect_rpc_prune_timeout", self.connect_rpc_prune_timeout),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::ZeroInterval(name));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = RoutingConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.routing_table_size_threshold, config.max_routing_table_size / 2);
        assert_eq!(config.node_group_size, 4);
        assert_eq!(config.hops_to_live, 20);
    }

    #[test]
    fn rejects_inconsistent_snapshots() {
        let config = RoutingConfig {
            closest_nodes_size: 2,
            ..RoutingConfig::default()
        };
        assert!(config.validate().is_err());

        let config = RoutingConfig {
            routing_table_size_threshold: 100,
            ..RoutingConfig::default()
        };
        assert!(config.validate().is_err());

        let config = RoutingConfig {
            find_node_interval: Duration::ZERO,
            ..RoutingConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroInterval("find_node_interval"))
        );
    }
}
