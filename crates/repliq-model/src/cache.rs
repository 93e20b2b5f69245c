//! `ModelCache`: the replica-side state of a replicated item model.
//!
//! The cache is sans-IO. It consumes model packets through
//! [`ModelCache::handle`], queues the packets it wants sent in an outbox
//! ([`ModelCache::take_outbox`]) and reports what changed as
//! [`ModelEvent`]s ([`ModelCache::take_events`]). The node drives it; tests
//! drive it directly.
//!
//! # Shape and data are cached separately
//!
//! The shape of the model (which rows exist, child counts, column counts)
//! lives in a [`NodeTree`] and is never evicted. Role values live in an LRU
//! keyed by [`NodeId`] and bounded by
//! [`CacheConfig::root_cache_size`] rows; evicting a row forgets its values
//! but not its existence, so reading it again costs one data request and
//! no structural rediscovery.
//!
//! # Requests follow rows, not positions
//!
//! A data request remembers the ids of the rows it asked for. Structural
//! changes under the same parent invalidate outstanding requests there,
//! since the source will answer them against the new layout; invalidated
//! replies are ignored and the rows are requested again on the next read.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;

use lru::LruCache;
use repliq_protocol::{IndexPath, ItemFlags, Orientation, Packet, Role, RowData, Value};

use crate::tree::{NodeId, NodeTree};
use crate::{CacheConfig, InitialAction, ModelError};

/// A cell of the replicated model: a row node and a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelIndex {
    pub node: NodeId,
    pub column: u32,
}

/// What changed in a [`ModelCache`] since the last
/// [`ModelCache::take_events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelEvent {
    /// The model was (re)initialized from the source.
    Ready,
    /// The source reset the model; every previous [`NodeId`] is gone.
    Reset,
    RowsInserted { parent: NodeId, first: u32, last: u32 },
    RowsRemoved { parent: NodeId, first: u32, last: u32 },
    ColumnsInserted { parent: NodeId, first: u32, last: u32 },
    ColumnsRemoved { parent: NodeId, first: u32, last: u32 },
    /// Values for rows `first..=last` under `parent` arrived.
    DataChanged { parent: NodeId, first: u32, last: u32 },
}

#[derive(Debug, Clone, Default)]
struct CellCache {
    values: HashMap<Role, Value>,
    flags: ItemFlags,
}

#[derive(Debug, Clone, Default)]
struct RowCache {
    cells: Vec<CellCache>,
}

impl From<RowData> for RowCache {
    fn from(data: RowData) -> Self {
        Self {
            cells: data
                .cells
                .into_iter()
                .map(|cell| CellCache {
                    values: cell.values.into_iter().collect(),
                    flags: cell.flags,
                })
                .collect(),
        }
    }
}

#[derive(Debug)]
enum Pending {
    Data { parent: NodeId, rows: Vec<NodeId> },
    Size { node: NodeId },
}

/// Replica-side cache of one remote model.
pub struct ModelCache {
    name: String,
    config: CacheConfig,
    roles: Vec<Role>,
    role_names: Vec<(Role, String)>,
    horizontal_headers: Vec<Value>,
    vertical_headers: Vec<Value>,
    tree: NodeTree,
    rows: LruCache<NodeId, RowCache>,
    pending: HashMap<u64, Pending>,
    in_flight: HashSet<NodeId>,
    sizing: HashSet<NodeId>,
    next_request: u64,
    ready: bool,
    outbox: Vec<Packet>,
    events: Vec<ModelEvent>,
}

impl ModelCache {
    pub fn new(name: impl Into<String>, config: CacheConfig) -> Self {
        let config = config.validated();
        let capacity = NonZeroUsize::new(config.root_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            name: name.into(),
            roles: config.roles.clone(),
            config,
            role_names: Vec::new(),
            horizontal_headers: Vec::new(),
            vertical_headers: Vec::new(),
            tree: NodeTree::new(),
            rows: LruCache::new(capacity),
            pending: HashMap::new(),
            in_flight: HashSet::new(),
            sizing: HashSet::new(),
            next_request: 1,
            ready: false,
            outbox: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn root(&self) -> NodeId {
        self.tree.root()
    }

    /// Roles this cache replicates.
    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    pub fn role_names(&self) -> &[(Role, String)] {
        &self.role_names
    }

    /// Number of rows whose values are currently cached.
    pub fn cached_rows(&self) -> usize {
        self.rows.len()
    }

    /// Returns `true` if packets are waiting in the outbox.
    pub fn has_outbox(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Packets queued for the source since the last call.
    pub fn take_outbox(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_events(&mut self) -> Vec<ModelEvent> {
        std::mem::take(&mut self.events)
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Queues the subscription request. Called on every (re)connection.
    pub fn acquire(&mut self) {
        self.forget_requests();
        self.outbox.push(Packet::AcquireModel {
            name: self.name.clone(),
            roles: self.config.roles.clone(),
            prefetch_rows: self.config.initial_rows(),
        });
    }

    /// The link to the source is gone. Cached values stay readable;
    /// outstanding requests are forgotten.
    pub fn disconnect(&mut self) {
        self.ready = false;
        self.forget_requests();
        self.outbox.clear();
    }

    fn forget_requests(&mut self) {
        self.pending.clear();
        self.in_flight.clear();
        self.sizing.clear();
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// The cell at `(row, column)` under `parent`, if it exists.
    pub fn index(&self, parent: NodeId, row: u32, column: u32) -> Option<ModelIndex> {
        if column >= self.tree.column_count(parent) {
            return None;
        }
        let node = self.tree.child(parent, row)?;
        Some(ModelIndex { node, column })
    }

    /// Value of `role` at `index`. A miss returns [`Value::Null`] and
    /// queues a request; the value arrives later with a
    /// [`ModelEvent::DataChanged`]. Roles outside [`Self::roles`] are
    /// never requested.
    pub fn data(&mut self, index: ModelIndex, role: Role) -> Value {
        if !self.tree.contains(index.node) || !self.roles.contains(&role) {
            return Value::Null;
        }
        let hit = self.rows.get(&index.node).map(|row| {
            row.cells
                .get(index.column as usize)
                .and_then(|cell| cell.values.get(&role))
                .cloned()
        });
        match hit {
            Some(Some(value)) => value,
            _ => {
                self.queue_row(index.node, false);
                Value::Null
            }
        }
    }

    /// Root-level shorthand for [`Self::data`].
    pub fn fetch(&mut self, row: u32, column: u32, role: Role) -> Value {
        match self.index(self.tree.root(), row, column) {
            Some(index) => self.data(index, role),
            None => Value::Null,
        }
    }

    /// Returns `true` if `role` at `index` is answered without a request.
    pub fn is_cached(&self, index: ModelIndex, role: Role) -> bool {
        self.rows
            .peek(&index.node)
            .and_then(|row| row.cells.get(index.column as usize))
            .is_some_and(|cell| cell.values.contains_key(&role))
    }

    /// Flags of the cell; empty until the row's data has arrived.
    pub fn flags(&mut self, index: ModelIndex) -> ItemFlags {
        match self.rows.get(&index.node) {
            Some(row) => row
                .cells
                .get(index.column as usize)
                .map_or(ItemFlags::empty(), |c| c.flags),
            None => {
                if self.tree.contains(index.node) {
                    self.queue_row(index.node, false);
                }
                ItemFlags::empty()
            }
        }
    }

    /// Child row count of `parent`. Unknown counts read as 0 and are
    /// requested; a [`ModelEvent::RowsInserted`] follows.
    pub fn row_count(&mut self, parent: NodeId) -> u32 {
        if let Some(count) = self.tree.row_count(parent) {
            return count;
        }
        if self.tree.has_children(parent) {
            self.queue_size(parent);
        }
        0
    }

    pub fn column_count(&self, parent: NodeId) -> u32 {
        self.tree.column_count(parent)
    }

    pub fn has_children(&self, node: NodeId) -> bool {
        self.tree.has_children(node)
    }

    /// Parent of `node`; top-level rows have the root as parent.
    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.tree.parent(node)
    }

    /// Current row number of `node`.
    pub fn row_of(&self, node: NodeId) -> Option<u32> {
        self.tree.row_of(node)
    }

    /// Current path of a cell, as the source addresses it.
    pub fn path_of(&self, index: ModelIndex) -> Option<IndexPath> {
        let mut path = self.tree.path_of(index.node)?;
        let last = path.0.last_mut()?;
        last.column = index.column;
        Some(path)
    }

    pub fn node_at(&self, path: &IndexPath) -> Option<NodeId> {
        self.tree.node_at(path)
    }

    /// Header text delivered with the model. Only the display role is
    /// replicated.
    pub fn header_data(&self, section: u32, orientation: Orientation, role: Role) -> Value {
        if role != Role::DISPLAY {
            return Value::Null;
        }
        let headers = match orientation {
            Orientation::Horizontal => &self.horizontal_headers,
            Orientation::Vertical => &self.vertical_headers,
        };
        headers.get(section as usize).cloned().unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Asks the source to store `value`. The cache changes only when the
    /// source confirms with a data change.
    pub fn set_data(&mut self, index: ModelIndex, role: Role, value: Value) -> Result<(), ModelError> {
        if !self.ready {
            return Err(ModelError::NotReady(self.name.clone()));
        }
        let path = self
            .path_of(index)
            .ok_or_else(|| ModelError::InvalidIndex(IndexPath::root()))?;
        let flags = self
            .rows
            .peek(&index.node)
            .and_then(|row| row.cells.get(index.column as usize))
            .map(|cell| cell.flags);
        if flags.is_some_and(|f| !f.contains(ItemFlags::EDITABLE)) {
            return Err(ModelError::NotEditable(path));
        }
        self.outbox.push(Packet::SetData {
            name: self.name.clone(),
            index: path,
            role,
            value,
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Requests
    // -----------------------------------------------------------------------

    fn next_id(&mut self) -> u64 {
        let id = self.next_request;
        self.next_request += 1;
        id
    }

    /// Queues a data request for row `id`, extending the last queued
    /// request when the row directly follows it. `force` re-requests rows
    /// already in flight.
    fn queue_row(&mut self, id: NodeId, force: bool) {
        if !force && self.in_flight.contains(&id) {
            return;
        }
        let (Some(parent), Some(row)) = (self.tree.parent(id), self.tree.row_of(id)) else {
            return;
        };
        let Some(parent_path) = self.tree.path_of(parent) else {
            return;
        };
        self.in_flight.insert(id);

        if let Some(Packet::DataRequest {
            request_id,
            parent: queued_parent,
            last,
            ..
        }) = self.outbox.last_mut()
            && *queued_parent == parent_path
            && *last + 1 == row
            && let Some(Pending::Data { rows, .. }) = self.pending.get_mut(&*request_id)
        {
            *last = row;
            rows.push(id);
            return;
        }

        let request_id = self.next_id();
        tracing::debug!(name = %self.name, request_id, %parent_path, row, "requesting row data");
        self.pending.insert(
            request_id,
            Pending::Data {
                parent,
                rows: vec![id],
            },
        );
        self.outbox.push(Packet::DataRequest {
            name: self.name.clone(),
            request_id,
            parent: parent_path,
            first: row,
            last: row,
            roles: self.roles.clone(),
        });
    }

    fn queue_size(&mut self, node: NodeId) {
        if !self.sizing.insert(node) {
            return;
        }
        let Some(path) = self.tree.path_of(node) else {
            self.sizing.remove(&node);
            return;
        };
        let request_id = self.next_id();
        self.pending.insert(request_id, Pending::Size { node });
        self.outbox.push(Packet::SizeRequest {
            name: self.name.clone(),
            request_id,
            parent: path,
        });
    }

    fn is_within(&self, node: NodeId, ancestor: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.tree.parent(id);
        }
        false
    }

    /// Drops requests the source will answer against a changed layout
    /// under `parent`.
    fn invalidate_under(&mut self, parent: NodeId) {
        let stale: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| match p {
                Pending::Data { parent: p, .. } => self.is_within(*p, parent),
                Pending::Size { node } => *node != parent && self.is_within(*node, parent),
            })
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            match self.pending.remove(&id) {
                Some(Pending::Data { rows, .. }) => {
                    for row in rows {
                        self.in_flight.remove(&row);
                    }
                }
                Some(Pending::Size { node }) => {
                    self.sizing.remove(&node);
                }
                None => {}
            }
        }
    }

    fn forget_nodes(&mut self, ids: &[NodeId]) {
        for id in ids {
            self.rows.pop(id);
            self.in_flight.remove(id);
            self.sizing.remove(id);
        }
    }

    fn store_row(&mut self, id: NodeId, data: RowData) {
        self.tree.set_has_children(id, data.has_children);
        if let Some((evicted, _)) = self.rows.push(id, data.into())
            && evicted != id
        {
            tracing::trace!(name = %self.name, %evicted, "evicted row data");
        }
    }

    // -----------------------------------------------------------------------
    // Incoming packets
    // -----------------------------------------------------------------------

    /// Applies a packet from the model source.
    pub fn handle(&mut self, packet: Packet) {
        match packet {
            Packet::ModelInit {
                rows,
                columns,
                role_names,
                horizontal_headers,
                vertical_headers,
                prefetched,
                ..
            } => self.on_init(rows, columns, role_names, horizontal_headers, vertical_headers, prefetched),
            Packet::ModelReset { rows, columns, .. } => self.on_reset(rows, columns),
            Packet::RowsInserted {
                parent, first, last, ..
            } => self.on_rows_inserted(&parent, first, last),
            Packet::RowsRemoved {
                parent, first, last, ..
            } => self.on_rows_removed(&parent, first, last),
            Packet::ColumnsInserted {
                parent, first, last, ..
            } => self.on_columns_inserted(&parent, first, last),
            Packet::ColumnsRemoved {
                parent, first, last, ..
            } => self.on_columns_removed(&parent, first, last),
            Packet::DataChanged {
                top_left,
                bottom_right,
                ..
            } => self.on_data_changed(&top_left, &bottom_right),
            Packet::DataReply {
                request_id, rows, ..
            } => self.on_data_reply(request_id, rows),
            Packet::SizeReply {
                request_id,
                rows,
                columns,
                ..
            } => self.on_size_reply(request_id, rows, columns),
            other => {
                tracing::warn!(name = %self.name, kind = other.kind(), "unexpected packet for model replica");
            }
        }
    }

    fn on_init(
        &mut self,
        rows: u32,
        columns: u32,
        role_names: Vec<(Role, String)>,
        horizontal_headers: Vec<Value>,
        vertical_headers: Vec<Value>,
        prefetched: Vec<RowData>,
    ) {
        self.tree.reset(rows, columns);
        self.rows.clear();
        self.forget_requests();
        if self.config.roles.is_empty() {
            let mut roles: Vec<Role> = role_names.iter().map(|(r, _)| *r).collect();
            roles.sort();
            roles.dedup();
            self.roles = roles;
        }
        self.role_names = role_names;
        self.horizontal_headers = horizontal_headers;
        self.vertical_headers = vertical_headers;

        let root = self.tree.root();
        let ids: Vec<NodeId> = self.tree.children(root).unwrap_or_default().to_vec();
        let count = prefetched.len();
        for (id, data) in ids.into_iter().zip(prefetched) {
            self.store_row(id, data);
        }
        tracing::info!(name = %self.name, rows, columns, prefetched = count, "model replica ready");
        self.ready = true;
        self.events.push(ModelEvent::Ready);
    }

    fn on_reset(&mut self, rows: u32, columns: u32) {
        self.tree.reset(rows, columns);
        self.rows.clear();
        self.forget_requests();
        self.vertical_headers.clear();
        self.events.push(ModelEvent::Reset);
        if self.config.initial_action == InitialAction::PrefetchData {
            let root = self.tree.root();
            let prefetch: Vec<NodeId> = self
                .tree
                .children(root)
                .unwrap_or_default()
                .iter()
                .take(self.config.prefetch_rows as usize)
                .copied()
                .collect();
            for id in prefetch {
                self.queue_row(id, false);
            }
        }
    }

    fn resolve(&self, path: &IndexPath, what: &str) -> Option<NodeId> {
        let node = self.tree.node_at(path);
        if node.is_none() {
            tracing::debug!(name = %self.name, %path, what, "change for an unknown parent ignored");
        }
        node
    }

    fn on_rows_inserted(&mut self, parent: &IndexPath, first: u32, last: u32) {
        let Some(p) = self.resolve(parent, "rows inserted") else {
            return;
        };
        if self.tree.children(p).is_none() {
            // Children not fetched yet; they will arrive with the count.
            self.tree.set_has_children(p, true);
            return;
        }
        self.invalidate_under(p);
        if self.tree.insert_rows(p, first, last).is_none() {
            tracing::warn!(name = %self.name, %parent, first, last, "rows inserted out of range");
            return;
        }
        if p == self.tree.root() && first as usize <= self.vertical_headers.len() {
            let count = (last - first + 1) as usize;
            self.vertical_headers.splice(
                first as usize..first as usize,
                std::iter::repeat_n(Value::Null, count),
            );
        }
        self.events.push(ModelEvent::RowsInserted { parent: p, first, last });
    }

    fn on_rows_removed(&mut self, parent: &IndexPath, first: u32, last: u32) {
        let Some(p) = self.resolve(parent, "rows removed") else {
            return;
        };
        if self.tree.children(p).is_none() {
            return;
        }
        self.invalidate_under(p);
        let Some(dropped) = self.tree.remove_rows(p, first, last) else {
            tracing::warn!(name = %self.name, %parent, first, last, "rows removed out of range");
            return;
        };
        self.forget_nodes(&dropped);
        if p == self.tree.root() {
            let end = (last as usize + 1).min(self.vertical_headers.len());
            if (first as usize) < end {
                self.vertical_headers.drain(first as usize..end);
            }
        }
        self.events.push(ModelEvent::RowsRemoved { parent: p, first, last });
    }

    fn child_rows(&self, parent: NodeId) -> Vec<NodeId> {
        self.tree.children(parent).unwrap_or_default().to_vec()
    }

    fn on_columns_inserted(&mut self, parent: &IndexPath, first: u32, last: u32) {
        let Some(p) = self.resolve(parent, "columns inserted") else {
            return;
        };
        let columns = self.tree.column_count(p);
        let total = last
            .checked_sub(first)
            .filter(|_| first <= columns)
            .and_then(|span| span.checked_add(1))
            .and_then(|count| columns.checked_add(count).map(|total| (count, total)));
        let Some((count, total)) = total else {
            tracing::warn!(name = %self.name, %parent, first, last, columns, "columns inserted out of range");
            return;
        };
        let count = count as usize;
        self.invalidate_under(p);
        self.tree.set_column_count(p, total);
        for id in self.child_rows(p) {
            if let Some(row) = self.rows.peek_mut(&id)
                && first as usize <= row.cells.len()
            {
                row.cells.splice(
                    first as usize..first as usize,
                    std::iter::repeat_with(CellCache::default).take(count),
                );
            }
        }
        if p == self.tree.root() && first as usize <= self.horizontal_headers.len() {
            self.horizontal_headers.splice(
                first as usize..first as usize,
                std::iter::repeat_n(Value::Null, count),
            );
        }
        self.events.push(ModelEvent::ColumnsInserted { parent: p, first, last });
    }

    fn on_columns_removed(&mut self, parent: &IndexPath, first: u32, last: u32) {
        let Some(p) = self.resolve(parent, "columns removed") else {
            return;
        };
        let columns = self.tree.column_count(p);
        if last < first || last >= columns {
            tracing::warn!(name = %self.name, %parent, first, last, columns, "columns removed out of range");
            return;
        }
        let count = last - first + 1;
        self.invalidate_under(p);
        self.tree.set_column_count(p, columns - count);
        for id in self.child_rows(p) {
            if let Some(row) = self.rows.peek_mut(&id) {
                let end = (last as usize + 1).min(row.cells.len());
                if (first as usize) < end {
                    row.cells.drain(first as usize..end);
                }
            }
        }
        if p == self.tree.root() {
            let end = (last as usize + 1).min(self.horizontal_headers.len());
            if (first as usize) < end {
                self.horizontal_headers.drain(first as usize..end);
            }
        }
        self.events.push(ModelEvent::ColumnsRemoved { parent: p, first, last });
    }

    /// Re-requests cached or in-flight rows in the changed range. Old
    /// values stay readable until the new ones arrive.
    fn on_data_changed(&mut self, top_left: &IndexPath, bottom_right: &IndexPath) {
        let (Some(tl), Some(br)) = (top_left.last(), bottom_right.last()) else {
            return;
        };
        let Some(p) = self.resolve(&top_left.parent(), "data changed") else {
            return;
        };
        for row in tl.row..=br.row {
            let Some(id) = self.tree.child(p, row) else {
                break;
            };
            if self.rows.contains(&id) || self.in_flight.contains(&id) {
                self.queue_row(id, true);
            }
        }
    }

    fn on_data_reply(&mut self, request_id: u64, data: Vec<RowData>) {
        let Some(pending) = self.pending.remove(&request_id) else {
            tracing::debug!(name = %self.name, request_id, "stale data reply ignored");
            return;
        };
        let Pending::Data { parent, rows } = pending else {
            tracing::warn!(name = %self.name, request_id, "data reply for a size request");
            return;
        };
        let mut data = data.into_iter();
        let mut span: Option<(u32, u32)> = None;
        for id in rows {
            self.in_flight.remove(&id);
            let Some(row_data) = data.next() else {
                continue;
            };
            if !self.tree.contains(id) {
                continue;
            }
            self.store_row(id, row_data);
            if let Some(row) = self.tree.row_of(id) {
                span = Some(match span {
                    Some((lo, hi)) => (lo.min(row), hi.max(row)),
                    None => (row, row),
                });
            }
        }
        if let Some((first, last)) = span {
            self.events.push(ModelEvent::DataChanged { parent, first, last });
        }
    }

    fn on_size_reply(&mut self, request_id: u64, rows: u32, columns: u32) {
        let Some(Pending::Size { node }) = self.pending.remove(&request_id) else {
            tracing::debug!(name = %self.name, request_id, "stale size reply ignored");
            return;
        };
        self.sizing.remove(&node);
        if !self.tree.contains(node) {
            return;
        }
        let dropped = self.tree.set_children(node, rows, columns);
        self.forget_nodes(&dropped);
        if rows > 0 {
            self.events.push(ModelEvent::RowsInserted {
                parent: node,
                first: 0,
                last: rows - 1,
            });
        }
    }
}

impl std::fmt::Debug for ModelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCache")
            .field("name", &self.name)
            .field("ready", &self.ready)
            .field("nodes", &self.tree.len())
            .field("cached_rows", &self.rows.len())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}
