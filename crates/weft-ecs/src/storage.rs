//! Structure-of-arrays column storage for trait fields.
//!
//! Each registered non-tag trait owns a [`ColumnStore`]: one dense array per
//! schema field, indexed by the entity's row. Columns grow with the world's
//! row capacity and are kind-homogeneous, so hot loops can borrow a single
//! field's backing `Vec` directly via [`Column`] accessors instead of going
//! through per-entity [`Record`] snapshots.

use crate::entity::Entity;
use crate::trait_def::{FieldKind, FieldValue, Record, Trait};

// ---------------------------------------------------------------------------
// Column
// ---------------------------------------------------------------------------

/// One dense field array. The variant is fixed by the field's schema kind.
#[derive(Debug, Clone)]
pub enum Column {
    Number(Vec<f64>),
    Flag(Vec<bool>),
    Ref(Vec<Option<Entity>>),
    Tag(Vec<u32>),
}

impl Column {
    fn for_kind(kind: FieldKind) -> Column {
        match kind {
            FieldKind::Number => Column::Number(Vec::new()),
            FieldKind::Flag => Column::Flag(Vec::new()),
            FieldKind::Ref => Column::Ref(Vec::new()),
            FieldKind::Tag => Column::Tag(Vec::new()),
        }
    }

    fn ensure(&mut self, rows: usize) {
        match self {
            Column::Number(v) => {
                if v.len() < rows {
                    v.resize(rows, 0.0)
                }
            }
            Column::Flag(v) => {
                if v.len() < rows {
                    v.resize(rows, false)
                }
            }
            Column::Ref(v) => {
                if v.len() < rows {
                    v.resize(rows, None)
                }
            }
            Column::Tag(v) => {
                if v.len() < rows {
                    v.resize(rows, 0)
                }
            }
        }
    }

    fn get(&self, row: usize) -> FieldValue {
        match self {
            Column::Number(v) => FieldValue::Number(v[row]),
            Column::Flag(v) => FieldValue::Flag(v[row]),
            Column::Ref(v) => FieldValue::Ref(v[row]),
            Column::Tag(v) => FieldValue::Tag(v[row]),
        }
    }

    /// Write `value` into `row`, returning whether the stored value changed.
    ///
    /// The caller has already validated the value's kind against the schema;
    /// a mismatch here is a bug in the registry.
    fn set(&mut self, row: usize, value: &FieldValue) -> bool {
        match (self, value) {
            (Column::Number(v), FieldValue::Number(n)) => {
                let changed = v[row] != *n;
                v[row] = *n;
                changed
            }
            (Column::Flag(v), FieldValue::Flag(b)) => {
                let changed = v[row] != *b;
                v[row] = *b;
                changed
            }
            (Column::Ref(v), FieldValue::Ref(e)) => {
                let changed = v[row] != *e;
                v[row] = *e;
                changed
            }
            (Column::Tag(v), FieldValue::Tag(t)) => {
                let changed = v[row] != *t;
                v[row] = *t;
                changed
            }
            _ => unreachable!("field kind validated before column write"),
        }
    }

    /// The backing array, if this is a `Number` column.
    pub fn as_numbers(&self) -> Option<&[f64]> {
        match self {
            Column::Number(v) => Some(v),
            _ => None,
        }
    }

    /// The backing array, if this is a `Flag` column.
    pub fn as_flags(&self) -> Option<&[bool]> {
        match self {
            Column::Flag(v) => Some(v),
            _ => None,
        }
    }

    /// The backing array, if this is a `Ref` column.
    pub fn as_refs(&self) -> Option<&[Option<Entity>]> {
        match self {
            Column::Ref(v) => Some(v),
            _ => None,
        }
    }

    /// The backing array, if this is a `Tag` column.
    pub fn as_tags(&self) -> Option<&[u32]> {
        match self {
            Column::Tag(v) => Some(v),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ColumnStore
// ---------------------------------------------------------------------------

/// The per-trait, per-world field storage: one [`Column`] per schema field,
/// in schema declaration order.
#[derive(Debug)]
pub struct ColumnStore {
    fields: Vec<(String, Column)>,
}

impl ColumnStore {
    pub(crate) fn for_trait(trait_: &Trait, rows: usize) -> ColumnStore {
        let mut fields: Vec<(String, Column)> = trait_
            .schema()
            .map(|(name, kind)| (name.to_owned(), Column::for_kind(kind)))
            .collect();
        for (_, column) in &mut fields {
            column.ensure(rows);
        }
        ColumnStore { fields }
    }

    /// Grow every column to cover `rows` rows.
    pub(crate) fn ensure_rows(&mut self, rows: usize) {
        for (_, column) in &mut self.fields {
            column.ensure(rows);
        }
    }

    /// Overwrite the row with the trait's defaults. Used when a trait is
    /// (re-)added to an entity, so recycled rows never leak prior values.
    pub(crate) fn write_defaults(&mut self, row: usize, defaults: &Record) {
        for (field, value) in defaults.iter() {
            if let Some((_, column)) = self.fields.iter_mut().find(|(name, _)| name == field) {
                column.set(row, value);
            }
        }
    }

    /// Snapshot the full row as a [`Record`].
    pub(crate) fn get_row(&self, row: usize) -> Record {
        let mut record = Record::new();
        for (field, column) in &self.fields {
            record.insert(field, column.get(row));
        }
        record
    }

    /// Field-wise partial assignment, reporting whether any stored value
    /// actually changed.
    pub(crate) fn set_with_change_detection(&mut self, row: usize, values: &Record) -> bool {
        let mut changed = false;
        for (field, value) in values.iter() {
            if let Some((_, column)) = self.fields.iter_mut().find(|(name, _)| name == field) {
                changed |= column.set(row, value);
            }
        }
        changed
    }

    /// Borrow one field's column for direct iteration.
    pub fn field(&self, name: &str) -> Option<&Column> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, column)| column)
    }

    /// All columns in schema order.
    pub fn columns(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.fields.iter().map(|(name, column)| (name.as_str(), column))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
