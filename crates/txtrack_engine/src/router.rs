//! Shard routing for node mutations.

use crate::config::{ShardConfig, ShardMethod};
use tracing::info;
use txtrack_protocol::{NodeMutation, NodeStatus};

/// Decides which node mutations this shard owns.
///
/// Owned mutations pass through unchanged. Everything else is replaced by a
/// stripped cascade marker so the index can still maintain ancestry and ACL
/// relationships for nodes stored elsewhere.
#[derive(Debug, Clone)]
pub struct ShardRouter {
    shard: ShardConfig,
    cascade_enabled: bool,
    expanded: bool,
}

impl ShardRouter {
    /// Creates a router for the given shard configuration.
    pub fn new(shard: ShardConfig, cascade_enabled: bool) -> Self {
        Self {
            shard,
            cascade_enabled,
            expanded: false,
        }
    }

    /// Route a key to a shard instance using seahash.
    pub fn shard_for(key: u64, shard_count: u32) -> u32 {
        if shard_count == 0 {
            return 0;
        }
        let hash = seahash::hash(&key.to_le_bytes());
        (hash % u64::from(shard_count)) as u32
    }

    /// Returns the routing configuration in effect.
    pub fn config(&self) -> &ShardConfig {
        &self.shard
    }

    /// Returns the owned node id range for DB id range sharding.
    pub fn range(&self) -> Option<(u64, u64)> {
        match self.shard.method {
            ShardMethod::DbIdRange { start, end } => Some((start, end)),
            _ => None,
        }
    }

    /// Returns true once the range has been raised to the index cap.
    pub fn is_expanded(&self) -> bool {
        self.expanded
    }

    /// Returns true if this shard stores `node`.
    pub fn owns(&self, node: &NodeMutation) -> bool {
        let shard = &self.shard;
        match shard.method {
            ShardMethod::All => true,
            ShardMethod::DbId => Self::shard_for(node.id, shard.shard_count) == shard.shard_instance,
            ShardMethod::AclId => {
                Self::shard_for(node.acl_id, shard.shard_count) == shard.shard_instance
            }
            ShardMethod::DbIdRange { start, end } => node.id >= start && node.id < end,
        }
    }

    /// Routes one mutation.
    pub fn route(&self, node: NodeMutation) -> NodeMutation {
        if self.owns(&node) {
            return node;
        }
        if self.cascade_enabled && node.status == NodeStatus::Updated {
            node.stripped(NodeStatus::NonShardUpdated)
        } else {
            node.stripped(NodeStatus::NonShardDeleted)
        }
    }

    /// Routes every mutation, keeping their order.
    pub fn route_all(&self, nodes: Vec<NodeMutation>) -> Vec<NodeMutation> {
        nodes.into_iter().map(|node| self.route(node)).collect()
    }

    /// Raises the end of a DB id range to `cap` when the index allows more.
    ///
    /// Returns true if the range changed.
    pub fn expand_to(&mut self, cap: u64) -> bool {
        let ShardMethod::DbIdRange { start, end } = self.shard.method else {
            return false;
        };
        if cap <= end {
            return false;
        }
        info!(start, old_end = end, new_end = cap, "expanding shard range to index cap");
        self.shard.method = ShardMethod::DbIdRange { start, end: cap };
        self.expanded = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use txtrack_protocol::NodeContent;

    fn node(id: u64) -> NodeMutation {
        NodeMutation::updated(id, 7, 3, format!("workspace://SpacesStore/{id}"))
            .with_tenant("acme")
            .with_content(NodeContent::new("cm:content").with_property("cm:name", "a.txt"))
    }

    #[test]
    fn unsharded_owns_everything() {
        let router = ShardRouter::new(ShardConfig::unsharded(), true);
        assert_eq!(router.route(node(1)), node(1));
    }

    #[test]
    fn range_routing_with_cascade() {
        let router = ShardRouter::new(ShardConfig::db_id_range(0, 100), true);

        assert_eq!(router.route(node(99)), node(99));

        let routed = router.route(node(100));
        assert_eq!(routed.status, NodeStatus::NonShardUpdated);
        assert_eq!(routed.id, 100);
        assert_eq!(routed.acl_id, 3);
        assert_eq!(routed.txn_id, 7);
        assert_eq!(routed.tenant, "acme");
        assert!(routed.content.is_none());

        let deleted = NodeMutation::deleted(500, 7, 3, "r");
        assert_eq!(router.route(deleted).status, NodeStatus::NonShardDeleted);
        assert_eq!(
            router.route(NodeMutation::unknown(500)).status,
            NodeStatus::NonShardDeleted
        );
    }

    #[test]
    fn cascade_disabled_emits_deletes() {
        let router = ShardRouter::new(ShardConfig::db_id_range(0, 100), false);
        assert_eq!(router.route(node(150)).status, NodeStatus::NonShardDeleted);
    }

    #[test]
    fn hashed_routing_is_stable() {
        let config = ShardConfig::hashed(ShardMethod::DbId, 4, 1);
        let router = ShardRouter::new(config, true);

        for id in 0..200 {
            let owned = ShardRouter::shard_for(id, 4) == 1;
            assert_eq!(router.owns(&node(id)), owned);
        }
        assert_eq!(ShardRouter::shard_for(42, 4), ShardRouter::shard_for(42, 4));
    }

    #[test]
    fn acl_routing_uses_acl_id() {
        let instance = ShardRouter::shard_for(3, 2);
        let router = ShardRouter::new(ShardConfig::hashed(ShardMethod::AclId, 2, instance), true);
        assert!((0..50).all(|id| router.owns(&node(id))));
    }

    #[test]
    fn expansion_only_grows() {
        let mut router = ShardRouter::new(ShardConfig::db_id_range(0, 100), true);
        assert!(!router.expand_to(50));
        assert!(!router.is_expanded());

        assert!(router.expand_to(1_000));
        assert_eq!(router.range(), Some((0, 1_000)));
        assert!(router.is_expanded());
        assert!(router.owns(&node(500)));

        let mut hashed = ShardRouter::new(ShardConfig::hashed(ShardMethod::DbId, 2, 0), true);
        assert!(!hashed.expand_to(1_000));
    }
}
