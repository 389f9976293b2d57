//! Trait descriptors, field schemas, and the dynamic value vocabulary.
//!
//! A [`Trait`] describes a unit of data an entity can carry: a named field
//! schema plus default values. Traits are global values -- the same `Trait`
//! handle can be used across any number of worlds, each of which assigns it a
//! local bitflag on first use. Identity is a process-unique integer id
//! assigned at construction, so traits can key registries without relying on
//! pointer identity.
//!
//! A trait with an empty schema is a *tag*: presence is conveyed purely by
//! the entity's mask and no column storage is allocated for it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::entity::Entity;
use crate::EcsError;

static NEXT_TRAIT_ID: AtomicU32 = AtomicU32::new(0);

pub(crate) fn next_trait_id() -> u32 {
    NEXT_TRAIT_ID.fetch_add(1, Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Field kinds and values
// ---------------------------------------------------------------------------

/// The element kind of one schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    /// A 64-bit float.
    Number,
    /// A boolean flag.
    Flag,
    /// An optional reference to another entity, stored by value.
    Ref,
    /// A small integer discriminant.
    Tag,
}

/// A single field value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Number(f64),
    Flag(bool),
    Ref(Option<Entity>),
    Tag(u32),
}

impl FieldValue {
    /// The kind this value belongs to.
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Number(_) => FieldKind::Number,
            FieldValue::Flag(_) => FieldKind::Flag,
            FieldValue::Ref(_) => FieldKind::Ref,
            FieldValue::Tag(_) => FieldKind::Tag,
        }
    }

    /// The zero value for a kind, used when a schema is declared without
    /// explicit defaults.
    pub fn zero(kind: FieldKind) -> FieldValue {
        match kind {
            FieldKind::Number => FieldValue::Number(0.0),
            FieldKind::Flag => FieldValue::Flag(false),
            FieldKind::Ref => FieldValue::Ref(None),
            FieldKind::Tag => FieldValue::Tag(0),
        }
    }

    /// The inner number, if this is a [`FieldValue::Number`].
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The inner flag, if this is a [`FieldValue::Flag`].
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            FieldValue::Flag(b) => Some(*b),
            _ => None,
        }
    }

    /// The inner entity reference, if this is a [`FieldValue::Ref`].
    pub fn as_ref_entity(&self) -> Option<Option<Entity>> {
        match self {
            FieldValue::Ref(e) => Some(*e),
            _ => None,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Number(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Flag(v)
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::Tag(v)
    }
}

impl From<Entity> for FieldValue {
    fn from(v: Entity) -> Self {
        FieldValue::Ref(Some(v))
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// An ordered field-name -> value map.
///
/// Records are used both as snapshots returned by `get` and as (possibly
/// partial) assignments passed to `set` and spawn initializers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, FieldValue>,
}

impl Record {
    /// An empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion.
    ///
    /// ```
    /// use weft_ecs::prelude::*;
    /// let r = Record::new().with("x", 1.0).with("grounded", true);
    /// assert_eq!(r.get("x"), Some(&FieldValue::Number(1.0)));
    /// ```
    pub fn with(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.to_owned(), value.into());
        self
    }

    /// Insert or overwrite one field.
    pub fn insert(&mut self, name: &str, value: impl Into<FieldValue>) {
        self.fields.insert(name.to_owned(), value.into());
    }

    /// Look up one field.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Iterate fields in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of fields present.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Provenance of a relation-instance trait: which relation produced it and
/// which target it is bound to. Carried on the trait itself so that worlds
/// can run exclusivity and destroy-time cascades without access to the
/// originating factory.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RelationLink {
    pub relation_id: u32,
    pub target: Entity,
    pub exclusive: bool,
    pub auto_remove_target: bool,
}

#[derive(Debug)]
struct TraitData {
    id: u32,
    name: String,
    /// Field schema in declaration order.
    schema: Vec<(String, FieldKind)>,
    /// Complete default record (one entry per schema field).
    defaults: Record,
    relation: Option<RelationLink>,
}

/// An immutable trait descriptor. Cheap to clone; equality and hashing go by
/// the process-unique id.
#[derive(Clone)]
pub struct Trait {
    data: Arc<TraitData>,
}

impl Trait {
    /// Define a trait whose schema and defaults both come from `defaults`.
    ///
    /// ```
    /// use weft_ecs::prelude::*;
    /// let position = Trait::new("position", Record::new().with("x", 0.0).with("y", 0.0));
    /// assert!(!position.is_tag());
    /// ```
    pub fn new(name: &str, defaults: Record) -> Trait {
        let schema = defaults
            .iter()
            .map(|(field, value)| (field.to_owned(), value.kind()))
            .collect();
        Self::build(name, schema, defaults, None)
    }

    /// Define a trait from an explicit schema, with zero defaults per field.
    pub fn with_schema(name: &str, fields: &[(&str, FieldKind)]) -> Trait {
        let schema: Vec<(String, FieldKind)> = fields
            .iter()
            .map(|(field, kind)| ((*field).to_owned(), *kind))
            .collect();
        let mut defaults = Record::new();
        for (field, kind) in &schema {
            defaults.insert(field, FieldValue::zero(*kind));
        }
        Self::build(name, schema, defaults, None)
    }

    /// Define a tag trait: empty schema, no storage, presence-only.
    pub fn tag(name: &str) -> Trait {
        Self::build(name, Vec::new(), Record::new(), None)
    }

    pub(crate) fn relation_instance(name: String, link: RelationLink) -> Trait {
        Trait {
            data: Arc::new(TraitData {
                id: next_trait_id(),
                name,
                schema: Vec::new(),
                defaults: Record::new(),
                relation: Some(link),
            }),
        }
    }

    fn build(
        name: &str,
        schema: Vec<(String, FieldKind)>,
        defaults: Record,
        relation: Option<RelationLink>,
    ) -> Trait {
        Trait {
            data: Arc::new(TraitData {
                id: next_trait_id(),
                name: name.to_owned(),
                schema,
                defaults,
                relation,
            }),
        }
    }

    /// The process-unique id assigned at construction.
    pub fn id(&self) -> u32 {
        self.data.id
    }

    /// The trait's name.
    pub fn name(&self) -> &str {
        &self.data.name
    }

    /// Whether this trait has an empty schema.
    pub fn is_tag(&self) -> bool {
        self.data.schema.is_empty()
    }

    /// The field schema in declaration order.
    pub fn schema(&self) -> impl Iterator<Item = (&str, FieldKind)> {
        self.data.schema.iter().map(|(field, kind)| (field.as_str(), *kind))
    }

    /// The kind of one schema field.
    pub fn field_kind(&self, field: &str) -> Option<FieldKind> {
        self.data
            .schema
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, kind)| *kind)
    }

    /// The complete default record.
    pub fn defaults(&self) -> &Record {
        &self.data.defaults
    }

    pub(crate) fn relation(&self) -> Option<&RelationLink> {
        self.data.relation.as_ref()
    }

    /// Validate that every field of `record` exists in this trait's schema
    /// with a matching kind.
    pub(crate) fn check_record(&self, record: &Record) -> Result<(), EcsError> {
        for (field, value) in record.iter() {
            match self.field_kind(field) {
                Some(kind) if kind == value.kind() => {}
                _ => {
                    return Err(EcsError::SchemaMismatch {
                        trait_name: self.data.name.clone(),
                        field: field.to_owned(),
                    })
                }
            }
        }
        Ok(())
    }
}

impl PartialEq for Trait {
    fn eq(&self, other: &Self) -> bool {
        self.data.id == other.data.id
    }
}

impl Eq for Trait {}

impl std::hash::Hash for Trait {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.data.id.hash(state);
    }
}

impl fmt::Debug for Trait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Trait({}, id={})", self.data.name, self.data.id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_inferred_from_defaults() {
        let t = Trait::new("position", Record::new().with("x", 1.5).with("y", 2.5));
        assert_eq!(t.field_kind("x"), Some(FieldKind::Number));
        assert_eq!(t.field_kind("y"), Some(FieldKind::Number));
        assert_eq!(t.field_kind("z"), None);
        assert_eq!(t.defaults().get("x"), Some(&FieldValue::Number(1.5)));
    }

    #[test]
    fn explicit_schema_gets_zero_defaults() {
        let t = Trait::with_schema(
            "body",
            &[("mass", FieldKind::Number), ("pinned", FieldKind::Flag)],
        );
        assert_eq!(t.defaults().get("mass"), Some(&FieldValue::Number(0.0)));
        assert_eq!(t.defaults().get("pinned"), Some(&FieldValue::Flag(false)));
    }

    #[test]
    fn tags_have_empty_schema() {
        let t = Trait::tag("frozen");
        assert!(t.is_tag());
        assert_eq!(t.schema().count(), 0);
    }

    #[test]
    fn ids_are_unique_and_drive_equality() {
        let a = Trait::tag("same-name");
        let b = Trait::tag("same-name");
        assert_ne!(a.id(), b.id());
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn check_record_rejects_unknown_field_and_kind_mismatch() {
        let t = Trait::new("position", Record::new().with("x", 0.0));
        assert!(t.check_record(&Record::new().with("x", 3.0)).is_ok());
        assert!(t.check_record(&Record::new().with("nope", 3.0)).is_err());
        assert!(t.check_record(&Record::new().with("x", true)).is_err());
    }

    #[test]
    fn field_value_conversions() {
        assert_eq!(FieldValue::from(2.0), FieldValue::Number(2.0));
        assert_eq!(FieldValue::from(true), FieldValue::Flag(true));
        assert_eq!(FieldValue::from(7u32), FieldValue::Tag(7));
        assert_eq!(FieldValue::zero(FieldKind::Ref), FieldValue::Ref(None));
    }
}
