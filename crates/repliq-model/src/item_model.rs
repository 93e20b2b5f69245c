//! The `ItemModel` trait: a hierarchical table a node can host.

use repliq_protocol::{IndexPath, ItemFlags, Orientation, Role, Value};

/// A structural or data change a model reports to its replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelChange {
    RowsInserted { parent: IndexPath, first: u32, last: u32 },
    RowsRemoved { parent: IndexPath, first: u32, last: u32 },
    ColumnsInserted { parent: IndexPath, first: u32, last: u32 },
    ColumnsRemoved { parent: IndexPath, first: u32, last: u32 },
    DataChanged {
        top_left: IndexPath,
        bottom_right: IndexPath,
        roles: Vec<Role>,
    },
    Reset,
}

/// Role names every model advertises unless it overrides
/// [`ItemModel::role_names`].
pub fn default_role_names() -> Vec<(Role, String)> {
    vec![
        (Role::DISPLAY, "display".into()),
        (Role::DECORATION, "decoration".into()),
        (Role::EDIT, "edit".into()),
        (Role::TOOLTIP, "toolTip".into()),
        (Role::STATUS_TIP, "statusTip".into()),
    ]
}

/// A hierarchical table of items.
///
/// Items are addressed by [`IndexPath`]; children hang off column 0 of a
/// row. Implementations record their own changes and hand them out through
/// [`ItemModel::drain_changes`] so the hosting node can forward them.
pub trait ItemModel: Send + 'static {
    fn row_count(&self, parent: &IndexPath) -> u32;

    fn column_count(&self, parent: &IndexPath) -> u32;

    /// Value of `role` at `index`; [`Value::Null`] for unknown roles or
    /// indices.
    fn data(&self, index: &IndexPath, role: Role) -> Value;

    fn flags(&self, _index: &IndexPath) -> ItemFlags {
        ItemFlags::SELECTABLE | ItemFlags::ENABLED
    }

    fn has_children(&self, index: &IndexPath) -> bool {
        self.row_count(index) > 0
    }

    fn header_data(&self, _section: u32, _orientation: Orientation, _role: Role) -> Value {
        Value::Null
    }

    fn role_names(&self) -> Vec<(Role, String)> {
        default_role_names()
    }

    /// Writes `value`. Returns `false` if the model refused it.
    fn set_data(&mut self, _index: &IndexPath, _role: Role, _value: Value) -> bool {
        false
    }

    /// Changes recorded since the last call, oldest first.
    fn drain_changes(&mut self) -> Vec<ModelChange> {
        Vec::new()
    }
}
