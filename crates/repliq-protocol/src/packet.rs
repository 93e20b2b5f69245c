//! Packets exchanged between nodes.
//!
//! Every frame on a connection carries exactly one [`Packet`]. Packets fall
//! into four groups:
//!
//! - **connection**: [`Packet::Hello`] and [`Packet::ObjectList`] announce
//!   which sources a node hosts;
//! - **object**: handshake, property sync, signals and method calls for a
//!   single named object;
//! - **registry**: [`Packet::AddSource`] / [`Packet::RemoveSource`];
//! - **model**: structure and data for replicated item models.
//!
//! All object and model packets carry the object name so one connection can
//! multiplex any number of replicas. Enums use serde's default (external)
//! tagging so both the JSON and the binary codec can represent them.

use std::fmt;

use repliq_transport::Endpoint;
use serde::{Deserialize, Serialize};

use crate::api::CapabilityMap;
use crate::signature::ObjectSignature;
use crate::Value;

/// Version sent in [`Packet::Hello`]. Peers with a different version are
/// disconnected.
pub const PROTOCOL_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Connection-level types
// ---------------------------------------------------------------------------

/// One entry of a node's hosted-object list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub name: String,
    pub type_name: String,
    pub signature: ObjectSignature,
}

/// Where a named source can be reached. The registry's unit of storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    pub name: String,
    pub endpoint: Endpoint,
}

impl SourceLocation {
    pub fn new(name: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            name: name.into(),
            endpoint,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.endpoint)
    }
}

// ---------------------------------------------------------------------------
// Model types
// ---------------------------------------------------------------------------

/// A data role of a model cell (display text, tooltip, user roles…).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(pub u32);

impl Role {
    pub const DISPLAY: Role = Role(0);
    pub const DECORATION: Role = Role(1);
    pub const EDIT: Role = Role(2);
    pub const TOOLTIP: Role = Role(3);
    pub const STATUS_TIP: Role = Role(4);
    /// First role id available to applications.
    pub const USER: Role = Role(0x100);
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "role-{}", self.0)
    }
}

bitflags::bitflags! {
    /// Per-cell capability flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ItemFlags: u32 {
        const SELECTABLE = 1;
        const EDITABLE = 1 << 1;
        const DRAG_ENABLED = 1 << 2;
        const DROP_ENABLED = 1 << 3;
        const USER_CHECKABLE = 1 << 4;
        const ENABLED = 1 << 5;
        const NEVER_HAS_CHILDREN = 1 << 7;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Orientation {
    Horizontal,
    Vertical,
}

/// One step of an [`IndexPath`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cell {
    pub row: u32,
    pub column: u32,
}

/// Position of a model item as the chain of `(row, column)` steps from the
/// invisible root. The empty path is the root itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexPath(pub Vec<Cell>);

impl IndexPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Path of the item at `(row, column)` under `self`.
    pub fn child(&self, row: u32, column: u32) -> Self {
        let mut cells = self.0.clone();
        cells.push(Cell { row, column });
        Self(cells)
    }

    /// Path of the parent item; the root's parent is the root.
    pub fn parent(&self) -> Self {
        let mut cells = self.0.clone();
        cells.pop();
        Self(cells)
    }

    /// The last step, or `None` for the root.
    pub fn last(&self) -> Option<Cell> {
        self.0.last().copied()
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for IndexPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for cell in &self.0 {
            write!(f, "/{},{}", cell.row, cell.column)?;
        }
        Ok(())
    }
}

/// Role values and flags of a single cell.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CellData {
    pub values: Vec<(Role, Value)>,
    pub flags: ItemFlags,
}

/// All columns of one row, plus whether the row has children.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RowData {
    pub cells: Vec<CellData>,
    pub has_children: bool,
}

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Packet {
    // -- Connection --
    /// First packet on every connection, sent by both sides.
    Hello {
        version: u32,
        objects: Vec<ObjectInfo>,
    },
    /// The sender's hosted set changed.
    ObjectList { objects: Vec<ObjectInfo> },

    // -- Object replication --
    /// Replica → source: subscribe. `signature: None` asks for a dynamic
    /// replica, and the reply then carries the capability map.
    Handshake {
        name: String,
        signature: Option<ObjectSignature>,
    },
    /// Source → replica: full property snapshot in capability-map order.
    InitReply {
        name: String,
        signature: ObjectSignature,
        api: Option<CapabilityMap>,
        properties: Vec<Value>,
    },
    /// Source → replica: the handshake signature did not match.
    SignatureMismatch {
        name: String,
        signature: ObjectSignature,
    },
    PropertyChanged {
        name: String,
        index: u32,
        value: Value,
    },
    /// Replica → source: write a read-write property.
    SetProperty {
        name: String,
        index: u32,
        value: Value,
    },
    Signal {
        name: String,
        index: u32,
        args: Vec<Value>,
    },
    /// `call_id` is `None` for void methods, which get no reply.
    Invoke {
        name: String,
        method: u32,
        args: Vec<Value>,
        call_id: Option<u64>,
    },
    InvokeReply {
        name: String,
        call_id: u64,
        result: Result<Value, String>,
    },
    /// Replica → source: unsubscribe.
    Release { name: String },

    // -- Registry --
    AddSource { location: SourceLocation },
    RemoveSource { location: SourceLocation },

    // -- Models --
    /// Replica → model source: subscribe with the roles of interest.
    AcquireModel {
        name: String,
        roles: Vec<Role>,
        prefetch_rows: u32,
    },
    ModelInit {
        name: String,
        rows: u32,
        columns: u32,
        role_names: Vec<(Role, String)>,
        horizontal_headers: Vec<Value>,
        vertical_headers: Vec<Value>,
        /// Data for the first `prefetch_rows` root rows.
        prefetched: Vec<RowData>,
    },
    RowsInserted {
        name: String,
        parent: IndexPath,
        first: u32,
        last: u32,
    },
    RowsRemoved {
        name: String,
        parent: IndexPath,
        first: u32,
        last: u32,
    },
    ColumnsInserted {
        name: String,
        parent: IndexPath,
        first: u32,
        last: u32,
    },
    ColumnsRemoved {
        name: String,
        parent: IndexPath,
        first: u32,
        last: u32,
    },
    ModelReset {
        name: String,
        rows: u32,
        columns: u32,
    },
    DataChanged {
        name: String,
        top_left: IndexPath,
        bottom_right: IndexPath,
        roles: Vec<Role>,
    },
    /// Replica → model source: data for rows `first..=last` under `parent`.
    DataRequest {
        name: String,
        request_id: u64,
        parent: IndexPath,
        first: u32,
        last: u32,
        roles: Vec<Role>,
    },
    DataReply {
        name: String,
        request_id: u64,
        rows: Vec<RowData>,
    },
    /// Replica → model source: child row/column counts of `parent`.
    SizeRequest {
        name: String,
        request_id: u64,
        parent: IndexPath,
    },
    SizeReply {
        name: String,
        request_id: u64,
        rows: u32,
        columns: u32,
    },
    SetData {
        name: String,
        index: IndexPath,
        role: Role,
        value: Value,
    },
}

impl Packet {
    /// Name of the object or model the packet addresses, if any.
    pub fn object_name(&self) -> Option<&str> {
        match self {
            Self::Hello { .. }
            | Self::ObjectList { .. }
            | Self::AddSource { .. }
            | Self::RemoveSource { .. } => None,
            Self::Handshake { name, .. }
            | Self::InitReply { name, .. }
            | Self::SignatureMismatch { name, .. }
            | Self::PropertyChanged { name, .. }
            | Self::SetProperty { name, .. }
            | Self::Signal { name, .. }
            | Self::Invoke { name, .. }
            | Self::InvokeReply { name, .. }
            | Self::Release { name }
            | Self::AcquireModel { name, .. }
            | Self::ModelInit { name, .. }
            | Self::RowsInserted { name, .. }
            | Self::RowsRemoved { name, .. }
            | Self::ColumnsInserted { name, .. }
            | Self::ColumnsRemoved { name, .. }
            | Self::ModelReset { name, .. }
            | Self::DataChanged { name, .. }
            | Self::DataRequest { name, .. }
            | Self::DataReply { name, .. }
            | Self::SizeRequest { name, .. }
            | Self::SizeReply { name, .. }
            | Self::SetData { name, .. } => Some(name),
        }
    }

    /// Variant name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "Hello",
            Self::ObjectList { .. } => "ObjectList",
            Self::Handshake { .. } => "Handshake",
            Self::InitReply { .. } => "InitReply",
            Self::SignatureMismatch { .. } => "SignatureMismatch",
            Self::PropertyChanged { .. } => "PropertyChanged",
            Self::SetProperty { .. } => "SetProperty",
            Self::Signal { .. } => "Signal",
            Self::Invoke { .. } => "Invoke",
            Self::InvokeReply { .. } => "InvokeReply",
            Self::Release { .. } => "Release",
            Self::AddSource { .. } => "AddSource",
            Self::RemoveSource { .. } => "RemoveSource",
            Self::AcquireModel { .. } => "AcquireModel",
            Self::ModelInit { .. } => "ModelInit",
            Self::RowsInserted { .. } => "RowsInserted",
            Self::RowsRemoved { .. } => "RowsRemoved",
            Self::ColumnsInserted { .. } => "ColumnsInserted",
            Self::ColumnsRemoved { .. } => "ColumnsRemoved",
            Self::ModelReset { .. } => "ModelReset",
            Self::DataChanged { .. } => "DataChanged",
            Self::DataRequest { .. } => "DataRequest",
            Self::DataReply { .. } => "DataReply",
            Self::SizeRequest { .. } => "SizeRequest",
            Self::SizeReply { .. } => "SizeReply",
            Self::SetData { .. } => "SetData",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_path_navigation() {
        let root = IndexPath::root();
        assert!(root.is_root());
        assert_eq!(root.parent(), root);

        let leaf = root.child(3, 0).child(1, 2);
        assert_eq!(leaf.depth(), 2);
        assert_eq!(leaf.last(), Some(Cell { row: 1, column: 2 }));
        assert_eq!(leaf.parent(), root.child(3, 0));
        assert_eq!(leaf.to_string(), "/3,0/1,2");
        assert_eq!(root.to_string(), "/");
    }

    #[test]
    fn test_role_serializes_as_plain_number() {
        let json = serde_json::to_string(&Role::USER).unwrap();
        assert_eq!(json, "256");
    }

    #[test]
    fn test_packet_object_name() {
        let p = Packet::Release {
            name: "alpha".into(),
        };
        assert_eq!(p.object_name(), Some("alpha"));
        assert_eq!(p.kind(), "Release");

        let hello = Packet::Hello {
            version: PROTOCOL_VERSION,
            objects: vec![],
        };
        assert_eq!(hello.object_name(), None);
    }

    #[test]
    fn test_packet_json_is_externally_tagged() {
        let p = Packet::Release {
            name: "alpha".into(),
        };
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, r#"{"Release":{"name":"alpha"}}"#);
    }

    #[test]
    fn test_source_location_display() {
        let loc = SourceLocation::new("alpha", Endpoint::parse("tcp://127.0.0.1:9001").unwrap());
        assert_eq!(loc.to_string(), "alpha@tcp://127.0.0.1:9001");
    }
}
