//! Node mutations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Status of a node mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Node was created or updated.
    Updated,
    /// Node was deleted.
    Deleted,
    /// State unknown; the index must resolve the node itself.
    Unknown,
    /// Node belongs to another shard but changed in a way this shard tracks.
    NonShardUpdated,
    /// Node belongs to another shard; any local copy must be removed.
    NonShardDeleted,
}

impl NodeStatus {
    /// Converts to a numeric code.
    pub fn to_code(&self) -> u8 {
        match self {
            NodeStatus::Updated => 1,
            NodeStatus::Deleted => 2,
            NodeStatus::Unknown => 3,
            NodeStatus::NonShardUpdated => 4,
            NodeStatus::NonShardDeleted => 5,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(NodeStatus::Updated),
            2 => Some(NodeStatus::Deleted),
            3 => Some(NodeStatus::Unknown),
            4 => Some(NodeStatus::NonShardUpdated),
            5 => Some(NodeStatus::NonShardDeleted),
            _ => None,
        }
    }

    /// Returns true for the synthetic statuses emitted for non-owned nodes.
    pub fn is_cascade(&self) -> bool {
        matches!(self, NodeStatus::NonShardUpdated | NodeStatus::NonShardDeleted)
    }

    /// Returns true if applying the mutation removes the node from the index.
    pub fn is_removal(&self) -> bool {
        matches!(self, NodeStatus::Deleted | NodeStatus::NonShardDeleted)
    }
}

/// Indexable content of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeContent {
    /// Node type, e.g. `cm:content`.
    pub node_type: String,
    /// Property values keyed by qualified name.
    pub properties: BTreeMap<String, String>,
}

impl NodeContent {
    /// Creates content of the given type with no properties.
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Adds a property value.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }
}

/// A single node change belonging to a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMutation {
    /// Repository node id.
    pub id: u64,
    /// Mutation status.
    pub status: NodeStatus,
    /// ACL governing the node.
    pub acl_id: u64,
    /// Transaction that produced the mutation.
    pub txn_id: u64,
    /// Stable node reference, e.g. `workspace://SpacesStore/<uuid>`.
    pub node_ref: String,
    /// Tenant domain; empty for the default tenant.
    pub tenant: String,
    /// Indexable content, absent for deletes and cascade markers.
    pub content: Option<NodeContent>,
}

impl NodeMutation {
    /// Creates an `Updated` mutation.
    pub fn updated(id: u64, txn_id: u64, acl_id: u64, node_ref: impl Into<String>) -> Self {
        Self {
            id,
            status: NodeStatus::Updated,
            acl_id,
            txn_id,
            node_ref: node_ref.into(),
            tenant: String::new(),
            content: None,
        }
    }

    /// Creates a `Deleted` mutation.
    pub fn deleted(id: u64, txn_id: u64, acl_id: u64, node_ref: impl Into<String>) -> Self {
        Self {
            status: NodeStatus::Deleted,
            ..Self::updated(id, txn_id, acl_id, node_ref)
        }
    }

    /// Creates a stub for a node requested by id only.
    ///
    /// The stub has status `Unknown` and `txn_id = u64::MAX`; the index is
    /// expected to resolve the current state of the node itself.
    pub fn unknown(id: u64) -> Self {
        Self {
            id,
            status: NodeStatus::Unknown,
            acl_id: 0,
            txn_id: u64::MAX,
            node_ref: String::new(),
            tenant: String::new(),
            content: None,
        }
    }

    /// Sets the tenant.
    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = tenant.into();
        self
    }

    /// Sets the content.
    pub fn with_content(mut self, content: NodeContent) -> Self {
        self.content = Some(content);
        self
    }

    /// Returns a content-free copy with the given status.
    ///
    /// Only id, acl id, node ref, tenant and transaction id are carried over.
    pub fn stripped(&self, status: NodeStatus) -> Self {
        Self {
            id: self.id,
            status,
            acl_id: self.acl_id,
            txn_id: self.txn_id,
            node_ref: self.node_ref.clone(),
            tenant: self.tenant.clone(),
            content: None,
        }
    }
}

/// Identifies a repository store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreRef {
    /// Store protocol, e.g. `workspace`.
    pub protocol: String,
    /// Store identifier, e.g. `SpacesStore`.
    pub identifier: String,
}

impl StoreRef {
    /// Creates a store reference.
    pub fn new(protocol: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            identifier: identifier.into(),
        }
    }
}

impl Default for StoreRef {
    fn default() -> Self {
        Self::new("workspace", "SpacesStore")
    }
}

impl fmt::Display for StoreRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.identifier)
    }
}

/// Parameters for listing node mutations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeQuery {
    /// Transactions whose nodes are requested.
    pub transaction_ids: Vec<u64>,
    /// Inclusive lower node id bound.
    pub from_node_id: Option<u64>,
    /// Inclusive upper node id bound.
    pub to_node_id: Option<u64>,
    /// Store the nodes live in.
    pub store: StoreRef,
    /// Property the repository should return for property-based sharding.
    pub shard_property: Option<String>,
}

impl NodeQuery {
    /// Requests all nodes of the given transactions.
    pub fn for_transactions(transaction_ids: Vec<u64>, store: StoreRef) -> Self {
        Self {
            transaction_ids,
            store,
            ..Self::default()
        }
    }

    /// Requests a single node by id, regardless of transaction.
    pub fn for_node(node_id: u64) -> Self {
        Self {
            from_node_id: Some(node_id),
            to_node_id: Some(node_id),
            ..Self::default()
        }
    }

    /// Sets the shard property.
    pub fn with_shard_property(mut self, property: Option<String>) -> Self {
        self.shard_property = property;
        self
    }

    /// Returns true if `node` satisfies the transaction and id filters.
    pub fn matches(&self, node: &NodeMutation) -> bool {
        (self.transaction_ids.is_empty() || self.transaction_ids.contains(&node.txn_id))
            && self.from_node_id.map_or(true, |id| node.id >= id)
            && self.to_node_id.map_or(true, |id| node.id <= id)
    }
}
