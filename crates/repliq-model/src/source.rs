//! `ModelSource`: serves an [`ItemModel`] to model replicas.

use std::any::Any;
use std::fmt;
use std::sync::OnceLock;

use repliq_protocol::{
    CapabilityMap, CellData, IndexPath, ObjectInfo, ObjectSignature, Orientation, Packet, Role,
    RowData, Value,
};
use repliq_source::Dispatch;

use crate::item_model::{ItemModel, ModelChange};

/// Type name models advertise in object lists.
pub const MODEL_TYPE_NAME: &str = "ItemModel";

/// The signature shared by every hosted model. Model replicas adapt to
/// whatever shape the source reports, so the type itself is fixed.
pub fn model_signature() -> ObjectSignature {
    static SIGNATURE: OnceLock<ObjectSignature> = OnceLock::new();
    *SIGNATURE.get_or_init(|| CapabilityMap::builder(MODEL_TYPE_NAME).build().signature())
}

trait HostedModel: Send {
    fn model(&self) -> &dyn ItemModel;
    fn model_mut(&mut self) -> &mut dyn ItemModel;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<M: ItemModel> HostedModel for M {
    fn model(&self) -> &dyn ItemModel {
        self
    }

    fn model_mut(&mut self) -> &mut dyn ItemModel {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A hosted model plus the logic answering replica requests.
pub struct ModelSource {
    name: String,
    model: Box<dyn HostedModel>,
}

impl ModelSource {
    pub fn new<M: ItemModel>(name: impl Into<String>, model: M) -> Self {
        let mut model: Box<dyn HostedModel> = Box::new(model);
        // Whatever the model recorded while being populated is already
        // part of its initial state.
        model.model_mut().drain_changes();
        Self {
            name: name.into(),
            model,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info(&self) -> ObjectInfo {
        ObjectInfo {
            name: self.name.clone(),
            type_name: MODEL_TYPE_NAME.to_string(),
            signature: model_signature(),
        }
    }

    fn roles_or_all(&self, roles: &[Role]) -> Vec<Role> {
        if roles.is_empty() {
            self.model.model().role_names().into_iter().map(|(r, _)| r).collect()
        } else {
            roles.to_vec()
        }
    }

    fn row_data(&self, parent: &IndexPath, row: u32, roles: &[Role]) -> RowData {
        let model = self.model.model();
        let columns = model.column_count(parent);
        let cells = (0..columns)
            .map(|column| {
                let index = parent.child(row, column);
                CellData {
                    values: roles.iter().map(|&r| (r, model.data(&index, r))).collect(),
                    flags: model.flags(&index),
                }
            })
            .collect();
        RowData {
            cells,
            has_children: model.has_children(&parent.child(row, 0)),
        }
    }

    /// Data for rows `first..=last` under `parent`, clamped to the rows
    /// that exist. Unknown roles come back as [`Value::Null`].
    pub fn rows(&self, parent: &IndexPath, first: u32, last: u32, roles: &[Role]) -> Vec<RowData> {
        let count = self.model.model().row_count(parent);
        if count == 0 || first >= count || last < first {
            return Vec::new();
        }
        let roles = self.roles_or_all(roles);
        (first..=last.min(count - 1))
            .map(|row| self.row_data(parent, row, &roles))
            .collect()
    }

    fn headers(&self, orientation: Orientation, sections: u32) -> Vec<Value> {
        let model = self.model.model();
        let mut headers: Vec<Value> = (0..sections)
            .map(|s| model.header_data(s, orientation, Role::DISPLAY))
            .collect();
        while headers.last().is_some_and(Value::is_null) {
            headers.pop();
        }
        headers
    }

    /// The reply to an `AcquireModel`.
    pub fn init(&self, roles: &[Role], prefetch_rows: u32) -> Packet {
        let model = self.model.model();
        let root = IndexPath::root();
        let rows = model.row_count(&root);
        let columns = model.column_count(&root);
        let prefetched = match prefetch_rows {
            0 => Vec::new(),
            n => self.rows(&root, 0, n - 1, roles),
        };
        Packet::ModelInit {
            name: self.name.clone(),
            rows,
            columns,
            role_names: model.role_names(),
            horizontal_headers: self.headers(Orientation::Horizontal, columns),
            vertical_headers: self.headers(Orientation::Vertical, rows),
            prefetched,
        }
    }

    /// Handles a request from a model replica.
    pub fn dispatch(&mut self, packet: Packet) -> Dispatch {
        let mut out = Dispatch::default();
        match packet {
            Packet::AcquireModel {
                roles,
                prefetch_rows,
                ..
            } => {
                out.reply = Some(self.init(&roles, prefetch_rows));
            }
            Packet::DataRequest {
                request_id,
                parent,
                first,
                last,
                roles,
                ..
            } => {
                out.reply = Some(Packet::DataReply {
                    name: self.name.clone(),
                    request_id,
                    rows: self.rows(&parent, first, last, &roles),
                });
            }
            Packet::SizeRequest {
                request_id, parent, ..
            } => {
                let model = self.model.model();
                out.reply = Some(Packet::SizeReply {
                    name: self.name.clone(),
                    request_id,
                    rows: model.row_count(&parent),
                    columns: model.column_count(&parent),
                });
            }
            Packet::SetData {
                index, role, value, ..
            } => {
                if !self.model.model_mut().set_data(&index, role, value) {
                    tracing::warn!(name = %self.name, %index, %role, "model refused remote write");
                }
                out.broadcast = self.take_changes();
            }
            other => {
                tracing::warn!(name = %self.name, kind = other.kind(), "unexpected packet for model");
            }
        }
        out
    }

    /// Runs `f` against the concrete model and returns the change packets
    /// it produced. `None` if the model is not an `M`.
    pub fn update<M, R>(&mut self, f: impl FnOnce(&mut M) -> R) -> Option<(R, Vec<Packet>)>
    where
        M: ItemModel,
    {
        let model = self.model.as_any_mut().downcast_mut::<M>()?;
        let result = f(model);
        Some((result, self.take_changes()))
    }

    /// Drains the model's recorded changes as packets.
    pub fn take_changes(&mut self) -> Vec<Packet> {
        let changes = self.model.model_mut().drain_changes();
        let name = &self.name;
        changes
            .into_iter()
            .map(|change| match change {
                ModelChange::RowsInserted { parent, first, last } => Packet::RowsInserted {
                    name: name.clone(),
                    parent,
                    first,
                    last,
                },
                ModelChange::RowsRemoved { parent, first, last } => Packet::RowsRemoved {
                    name: name.clone(),
                    parent,
                    first,
                    last,
                },
                ModelChange::ColumnsInserted { parent, first, last } => Packet::ColumnsInserted {
                    name: name.clone(),
                    parent,
                    first,
                    last,
                },
                ModelChange::ColumnsRemoved { parent, first, last } => Packet::ColumnsRemoved {
                    name: name.clone(),
                    parent,
                    first,
                    last,
                },
                ModelChange::DataChanged {
                    top_left,
                    bottom_right,
                    roles,
                } => Packet::DataChanged {
                    name: name.clone(),
                    top_left,
                    bottom_right,
                    roles,
                },
                ModelChange::Reset => {
                    let root = IndexPath::root();
                    let model = self.model.model();
                    Packet::ModelReset {
                        name: name.clone(),
                        rows: model.row_count(&root),
                        columns: model.column_count(&root),
                    }
                }
            })
            .collect()
    }
}

impl fmt::Debug for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelSource")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
