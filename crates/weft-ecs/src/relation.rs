//! Relation trait factories.
//!
//! A [`Relation`] turns a target entity into a concrete [`Trait`]:
//! `relation.of(target)` yields a trait that is distinct per target and
//! identity-stable -- asking for the same target twice returns the same trait.
//! Targets are held by value (entity id, not reference), so relation edges
//! never extend an entity's lifetime; liveness stays governed solely by the
//! entity index.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::entity::Entity;
use crate::trait_def::{next_trait_id, RelationLink, Trait};

/// Behavior switches for a relation.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelationOptions {
    /// Adding a new target implicitly removes any prior target of the same
    /// relation from the entity.
    pub exclusive: bool,
    /// When a target entity is destroyed: `true` destroys every entity
    /// carrying a pair bound to it, `false` merely removes the pair.
    pub auto_remove_target: bool,
}

#[derive(Debug)]
struct RelationData {
    id: u32,
    name: String,
    options: RelationOptions,
    /// Memoized target -> trait instances, shared across worlds.
    instances: Mutex<HashMap<Entity, Trait>>,
}

/// A trait factory parameterized by a target entity. Cheap to clone;
/// equality goes by the factory's unique id.
#[derive(Clone)]
pub struct Relation {
    data: Arc<RelationData>,
}

impl Relation {
    /// Define a relation.
    ///
    /// ```
    /// use weft_ecs::prelude::*;
    /// let child_of = Relation::new("child-of", RelationOptions { exclusive: true, ..Default::default() });
    /// ```
    pub fn new(name: &str, options: RelationOptions) -> Relation {
        Relation {
            data: Arc::new(RelationData {
                id: next_trait_id(),
                name: name.to_owned(),
                options,
                instances: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The concrete trait binding this relation to `target`.
    ///
    /// Memoized: the same target always yields the same [`Trait`].
    pub fn of(&self, target: Entity) -> Trait {
        let mut instances = self.data.instances.lock().expect("relation memo poisoned");
        instances
            .entry(target)
            .or_insert_with(|| {
                Trait::relation_instance(
                    format!("{}({})", self.data.name, target),
                    RelationLink {
                        relation_id: self.data.id,
                        target,
                        exclusive: self.data.options.exclusive,
                        auto_remove_target: self.data.options.auto_remove_target,
                    },
                )
            })
            .clone()
    }

    /// The factory's process-unique id.
    pub fn id(&self) -> u32 {
        self.data.id
    }

    /// The relation's name.
    pub fn name(&self) -> &str {
        &self.data.name
    }

    /// The behavior switches this relation was defined with.
    pub fn options(&self) -> RelationOptions {
        self.data.options
    }
}

impl PartialEq for Relation {
    fn eq(&self, other: &Self) -> bool {
        self.data.id == other.data.id
    }
}

impl Eq for Relation {}

impl fmt::Debug for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Relation({}, id={})", self.data.name, self.data.id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
