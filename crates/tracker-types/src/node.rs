//! Node and store references.
//!
//! The index is partitioned by store. Nodes are addressed as
//! `protocol://identifier/id`, e.g. `workspace://SpacesStore/0a1b...`.

use serde::{Deserialize, Serialize};

/// Protocol of stores that are versioned separately and never indexed here.
pub const PROTOCOL_AVM: &str = "avm";

/// Association type used when removing a deleted node from the index.
pub const ASSOC_CHILDREN: &str = "cm:children";

/// Reference to a store partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreRef {
    /// Store protocol (`workspace`, `archive`, `avm`, ...)
    pub protocol: String,
    /// Store identifier within the protocol
    pub identifier: String,
}

impl StoreRef {
    pub fn new(protocol: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            identifier: identifier.into(),
        }
    }

    /// The live content store.
    pub fn workspace_spaces_store() -> Self {
        Self::new("workspace", "SpacesStore")
    }

    /// The archive (trashcan) store.
    pub fn archive_spaces_store() -> Self {
        Self::new("archive", "SpacesStore")
    }

    /// Whether this store is excluded from transaction tracking.
    pub fn is_avm(&self) -> bool {
        self.protocol == PROTOCOL_AVM
    }
}

impl std::fmt::Display for StoreRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.protocol, self.identifier)
    }
}

/// Reference to a node within a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeRef {
    pub store: StoreRef,
    pub id: String,
}

impl NodeRef {
    pub fn new(store: StoreRef, id: impl Into<String>) -> Self {
        Self {
            store,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.store, self.id)
    }
}

/// A node touched by a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeChange {
    pub node: NodeRef,
    /// The node no longer exists in the store
    pub deleted: bool,
}

impl NodeChange {
    pub fn updated(node: NodeRef) -> Self {
        Self {
            node,
            deleted: false,
        }
    }

    pub fn deleted(node: NodeRef) -> Self {
        Self { node, deleted: true }
    }
}

/// Child association reference handed to the index when deleting a node.
///
/// Only the child matters for a delete; parent and name are unknown once
/// the node is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildAssocRef {
    pub assoc_type: String,
    pub parent: Option<NodeRef>,
    pub qname: Option<String>,
    pub child: NodeRef,
}

impl ChildAssocRef {
    /// Best-available association for a node that has been deleted.
    pub fn for_deleted(child: NodeRef) -> Self {
        Self {
            assoc_type: ASSOC_CHILDREN.to_string(),
            parent: None,
            qname: None,
            child,
        }
    }
}
