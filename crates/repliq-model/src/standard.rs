//! `StandardModel`: an in-memory tree model ready to host.

use std::collections::BTreeMap;

use repliq_protocol::{IndexPath, ItemFlags, Orientation, Role, Value};

use crate::item_model::{default_role_names, ItemModel, ModelChange};

#[derive(Debug, Clone, PartialEq)]
struct CellStore {
    values: BTreeMap<Role, Value>,
    flags: ItemFlags,
}

impl Default for CellStore {
    fn default() -> Self {
        Self {
            values: BTreeMap::new(),
            flags: ItemFlags::SELECTABLE | ItemFlags::ENABLED | ItemFlags::EDITABLE,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Item {
    cells: Vec<CellStore>,
    children: Vec<Item>,
}

impl Item {
    fn with_display(columns: u32, values: Vec<Value>) -> Self {
        let mut cells = vec![CellStore::default(); columns as usize];
        for (cell, value) in cells.iter_mut().zip(values) {
            cell.values.insert(Role::DISPLAY, value);
        }
        Self {
            cells,
            children: Vec::new(),
        }
    }
}

/// A tree of items with a uniform column count at every level.
///
/// `Role::EDIT` is an alias of `Role::DISPLAY`: writing either stores the
/// display value.
#[derive(Debug, Clone)]
pub struct StandardModel {
    columns: u32,
    rows: Vec<Item>,
    horizontal_headers: Vec<Value>,
    vertical_headers: Vec<Value>,
    role_names: Vec<(Role, String)>,
    changes: Vec<ModelChange>,
}

fn storage_role(role: Role) -> Role {
    if role == Role::EDIT { Role::DISPLAY } else { role }
}

impl StandardModel {
    pub fn new(columns: u32) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            horizontal_headers: Vec::new(),
            vertical_headers: Vec::new(),
            role_names: default_role_names(),
            changes: Vec::new(),
        }
    }

    /// Display headers for the columns.
    pub fn with_headers<V: Into<Value>>(mut self, headers: impl IntoIterator<Item = V>) -> Self {
        self.horizontal_headers = headers.into_iter().map(Into::into).collect();
        self
    }

    /// Display headers for the root rows.
    pub fn with_row_headers<V: Into<Value>>(mut self, headers: impl IntoIterator<Item = V>) -> Self {
        self.vertical_headers = headers.into_iter().map(Into::into).collect();
        self
    }

    /// Advertises an application role under `name`.
    pub fn with_role_name(mut self, role: Role, name: impl Into<String>) -> Self {
        self.role_names.retain(|(r, _)| *r != role);
        self.role_names.push((role, name.into()));
        self
    }

    fn children(&self, parent: &IndexPath) -> Option<&Vec<Item>> {
        let mut rows = &self.rows;
        for cell in &parent.0 {
            if cell.column != 0 {
                return None;
            }
            rows = &rows.get(cell.row as usize)?.children;
        }
        Some(rows)
    }

    fn children_mut(&mut self, parent: &IndexPath) -> Option<&mut Vec<Item>> {
        let mut rows = &mut self.rows;
        for cell in &parent.0 {
            if cell.column != 0 {
                return None;
            }
            rows = &mut rows.get_mut(cell.row as usize)?.children;
        }
        Some(rows)
    }

    fn cell(&self, index: &IndexPath) -> Option<&CellStore> {
        let last = index.last()?;
        self.children(&index.parent())?
            .get(last.row as usize)?
            .cells
            .get(last.column as usize)
    }

    fn cell_mut(&mut self, index: &IndexPath) -> Option<&mut CellStore> {
        let last = index.last()?;
        self.children_mut(&index.parent())?
            .get_mut(last.row as usize)?
            .cells
            .get_mut(last.column as usize)
    }

    /// Inserts rows of display values at `first` under `parent`. Returns
    /// `false` if `parent` does not exist or `first` is past the end.
    pub fn insert_rows(&mut self, parent: &IndexPath, first: u32, rows: Vec<Vec<Value>>) -> bool {
        if rows.is_empty() {
            return true;
        }
        let columns = self.columns;
        let count = rows.len() as u32;
        let Some(children) = self.children_mut(parent) else {
            return false;
        };
        if first as usize > children.len() {
            return false;
        }
        let items = rows.into_iter().map(|values| Item::with_display(columns, values));
        children.splice(first as usize..first as usize, items);
        self.changes.push(ModelChange::RowsInserted {
            parent: parent.clone(),
            first,
            last: first + count - 1,
        });
        true
    }

    /// Appends one row under `parent` and returns its row number.
    pub fn append_row(&mut self, parent: &IndexPath, values: Vec<Value>) -> Option<u32> {
        let row = self.row_count(parent);
        self.insert_rows(parent, row, vec![values]).then_some(row)
    }

    /// Removes `count` rows starting at `first` under `parent`.
    pub fn remove_rows(&mut self, parent: &IndexPath, first: u32, count: u32) -> bool {
        if count == 0 {
            return true;
        }
        let Some(children) = self.children_mut(parent) else {
            return false;
        };
        let end = first as usize + count as usize;
        if end > children.len() {
            return false;
        }
        children.drain(first as usize..end);
        self.changes.push(ModelChange::RowsRemoved {
            parent: parent.clone(),
            first,
            last: first + count - 1,
        });
        true
    }

    fn parents_with_rows(&self) -> Vec<IndexPath> {
        fn walk(rows: &[Item], path: &IndexPath, out: &mut Vec<IndexPath>) {
            if rows.is_empty() {
                return;
            }
            out.push(path.clone());
            for (row, item) in rows.iter().enumerate() {
                walk(&item.children, &path.child(row as u32, 0), out);
            }
        }
        let mut out = Vec::new();
        walk(&self.rows, &IndexPath::root(), &mut out);
        out
    }

    /// Inserts `count` empty columns at `first`, at every level.
    pub fn insert_columns(&mut self, first: u32, count: u32) -> bool {
        if count == 0 || first > self.columns {
            return count == 0;
        }
        self.columns += count;
        fn shift(rows: &mut [Item], first: usize, count: usize) {
            for item in rows {
                item.cells
                    .splice(first..first, std::iter::repeat_with(CellStore::default).take(count));
                shift(&mut item.children, first, count);
            }
        }
        shift(&mut self.rows, first as usize, count as usize);
        if (first as usize) <= self.horizontal_headers.len() {
            self.horizontal_headers
                .splice(first as usize..first as usize, std::iter::repeat_n(Value::Null, count as usize));
        }
        let last = first + count - 1;
        let parents = self.parents_with_rows();
        self.changes.extend(
            parents
                .into_iter()
                .map(|parent| ModelChange::ColumnsInserted { parent, first, last }),
        );
        true
    }

    /// Removes `count` columns starting at `first`, at every level.
    pub fn remove_columns(&mut self, first: u32, count: u32) -> bool {
        if count == 0 {
            return true;
        }
        if first + count > self.columns {
            return false;
        }
        self.columns -= count;
        let range = first as usize..(first + count) as usize;
        fn drop_cells(rows: &mut [Item], range: &std::ops::Range<usize>) {
            for item in rows {
                item.cells.drain(range.clone());
                drop_cells(&mut item.children, range);
            }
        }
        drop_cells(&mut self.rows, &range);
        if range.end <= self.horizontal_headers.len() {
            self.horizontal_headers.drain(range);
        }
        let last = first + count - 1;
        let parents = self.parents_with_rows();
        self.changes.extend(
            parents
                .into_iter()
                .map(|parent| ModelChange::ColumnsRemoved { parent, first, last }),
        );
        true
    }

    /// Stores a value and records a data change for that cell.
    pub fn set_item_data(&mut self, index: &IndexPath, role: Role, value: Value) -> bool {
        let stored = storage_role(role);
        let Some(cell) = self.cell_mut(index) else {
            return false;
        };
        if cell.values.get(&stored) == Some(&value) {
            return true;
        }
        cell.values.insert(stored, value);
        let roles = if stored == Role::DISPLAY {
            vec![Role::DISPLAY, Role::EDIT]
        } else {
            vec![stored]
        };
        self.changes.push(ModelChange::DataChanged {
            top_left: index.clone(),
            bottom_right: index.clone(),
            roles,
        });
        true
    }

    pub fn set_flags(&mut self, index: &IndexPath, flags: ItemFlags) -> bool {
        let Some(cell) = self.cell_mut(index) else {
            return false;
        };
        cell.flags = flags;
        self.changes.push(ModelChange::DataChanged {
            top_left: index.clone(),
            bottom_right: index.clone(),
            roles: Vec::new(),
        });
        true
    }

    /// Removes every row.
    pub fn clear(&mut self) {
        self.rows.clear();
        self.vertical_headers.clear();
        self.changes.push(ModelChange::Reset);
    }

    /// Replaces the content in one step, reported as a reset.
    pub fn reset_rows(&mut self, rows: Vec<Vec<Value>>) {
        let columns = self.columns;
        self.rows = rows
            .into_iter()
            .map(|values| Item::with_display(columns, values))
            .collect();
        self.changes.push(ModelChange::Reset);
    }
}

impl ItemModel for StandardModel {
    fn row_count(&self, parent: &IndexPath) -> u32 {
        self.children(parent).map_or(0, |rows| rows.len() as u32)
    }

    fn column_count(&self, parent: &IndexPath) -> u32 {
        if self.children(parent).is_some() {
            self.columns
        } else {
            0
        }
    }

    fn data(&self, index: &IndexPath, role: Role) -> Value {
        self.cell(index)
            .and_then(|cell| cell.values.get(&storage_role(role)))
            .cloned()
            .unwrap_or_default()
    }

    fn flags(&self, index: &IndexPath) -> ItemFlags {
        self.cell(index).map_or(ItemFlags::empty(), |cell| cell.flags)
    }

    fn header_data(&self, section: u32, orientation: Orientation, role: Role) -> Value {
        if role != Role::DISPLAY {
            return Value::Null;
        }
        let headers = match orientation {
            Orientation::Horizontal => &self.horizontal_headers,
            Orientation::Vertical => &self.vertical_headers,
        };
        headers.get(section as usize).cloned().unwrap_or_default()
    }

    fn role_names(&self) -> Vec<(Role, String)> {
        self.role_names.clone()
    }

    fn set_data(&mut self, index: &IndexPath, role: Role, value: Value) -> bool {
        let editable = self
            .cell(index)
            .is_some_and(|cell| cell.flags.contains(ItemFlags::EDITABLE));
        editable && self.set_item_data(index, role, value)
    }

    fn drain_changes(&mut self) -> Vec<ModelChange> {
        std::mem::take(&mut self.changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(n: u32) -> Vec<Vec<Value>> {
        (0..n)
            .map(|i| vec![Value::from(format!("r{i}")), Value::Int(i.into())])
            .collect()
    }

    fn model() -> StandardModel {
        let mut m = StandardModel::new(2).with_headers(["name", "value"]);
        assert!(m.insert_rows(&IndexPath::root(), 0, rows(3)));
        m.drain_changes();
        m
    }

    #[test]
    fn test_insert_rows_records_change() {
        let mut m = model();
        assert!(m.insert_rows(&IndexPath::root(), 1, rows(2)));
        assert_eq!(m.row_count(&IndexPath::root()), 5);
        assert_eq!(
            m.drain_changes(),
            vec![ModelChange::RowsInserted { parent: IndexPath::root(), first: 1, last: 2 }]
        );
        assert!(m.drain_changes().is_empty());
    }

    #[test]
    fn test_insert_rows_past_end_is_refused() {
        let mut m = model();
        assert!(!m.insert_rows(&IndexPath::root(), 9, rows(1)));
        assert!(m.drain_changes().is_empty());
    }

    #[test]
    fn test_children_and_data() {
        let mut m = model();
        let parent = IndexPath::root().child(1, 0);
        assert_eq!(m.append_row(&parent, vec!["child".into()]), Some(0));
        assert!(m.has_children(&parent));
        assert_eq!(m.column_count(&parent), 2);
        assert_eq!(m.data(&parent.child(0, 0), Role::DISPLAY), Value::from("child"));
        assert_eq!(m.data(&parent.child(0, 0), Role::EDIT), Value::from("child"));
        assert_eq!(m.data(&parent.child(0, 1), Role::DISPLAY), Value::Null);
        // Children hang off column 0 only.
        assert_eq!(m.row_count(&IndexPath::root().child(1, 1)), 0);
    }

    #[test]
    fn test_remove_rows_bounds() {
        let mut m = model();
        assert!(!m.remove_rows(&IndexPath::root(), 2, 5));
        assert!(m.remove_rows(&IndexPath::root(), 0, 2));
        assert_eq!(m.data(&IndexPath::root().child(0, 0), Role::DISPLAY), Value::from("r2"));
    }

    #[test]
    fn test_set_data_respects_editable_flag() {
        let mut m = model();
        let index = IndexPath::root().child(0, 1);
        assert!(m.set_data(&index, Role::EDIT, Value::Int(9)));
        assert_eq!(m.data(&index, Role::DISPLAY), Value::Int(9));
        m.drain_changes();

        m.set_flags(&index, ItemFlags::ENABLED);
        assert!(!m.set_data(&index, Role::DISPLAY, Value::Int(1)));
        assert_eq!(m.data(&index, Role::DISPLAY), Value::Int(9));
    }

    #[test]
    fn test_insert_columns_shifts_cells_and_headers() {
        let mut m = model();
        assert!(m.insert_columns(1, 1));
        assert_eq!(m.column_count(&IndexPath::root()), 3);
        assert_eq!(m.data(&IndexPath::root().child(0, 2), Role::DISPLAY), Value::Int(0));
        assert_eq!(m.header_data(2, Orientation::Horizontal, Role::DISPLAY), Value::from("value"));
        assert_eq!(
            m.drain_changes(),
            vec![ModelChange::ColumnsInserted { parent: IndexPath::root(), first: 1, last: 1 }]
        );
    }

    #[test]
    fn test_remove_columns() {
        let mut m = model();
        assert!(m.remove_columns(0, 1));
        assert_eq!(m.data(&IndexPath::root().child(2, 0), Role::DISPLAY), Value::Int(2));
        assert!(!m.remove_columns(0, 5));
    }

    #[test]
    fn test_role_names_include_custom_roles() {
        let m = StandardModel::new(1).with_role_name(Role::USER, "price");
        let names = m.role_names();
        assert!(names.contains(&(Role::USER, "price".to_string())));
        assert!(names.contains(&(Role::DISPLAY, "display".to_string())));
    }
}
