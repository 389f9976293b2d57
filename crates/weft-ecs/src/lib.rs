//! Weft ECS -- a bitmask-indexed entity-trait system with cached queries,
//! change tracking, and entity relations.
//!
//! Entities are lightweight generational handles; the data they carry lives
//! in *traits* -- runtime-described field schemas stored column-wise
//! (Structure-of-Arrays) per world. Per-entity bitmasks record which traits
//! an entity carries, and queries compile to pre-computed word masks that are
//! cached, incrementally maintained, and observable through subscriptions.
//!
//! # Quick Start
//!
//! ```
//! use weft_ecs::prelude::*;
//!
//! let position = Trait::new("position", Record::new().with("x", 0.0).with("y", 0.0));
//! let frozen = Trait::tag("frozen");
//!
//! let mut world = World::new();
//! let e = world.spawn_with(&position).unwrap();
//! world.set(e, &position, &Record::new().with("x", 4.0)).unwrap();
//!
//! assert_eq!(world.query(&[QueryParam::all(&position)]), vec![e]);
//! assert!(world.query(&[QueryParam::all(&frozen)]).is_empty());
//!
//! let snapshot = world.get(e, &position).unwrap();
//! assert_eq!(snapshot.get("x"), Some(&FieldValue::Number(4.0)));
//! ```

#![deny(unsafe_code)]

pub mod entity;
pub mod mask;
pub mod query;
pub mod relation;
pub mod storage;
pub mod trait_def;
pub mod world;

use entity::Entity;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by world operations.
///
/// The core is *total*: malformed operations that have an obvious meaning
/// (double remove, `set` on an absent trait, querying a never-used trait)
/// are no-ops. These variants cover the remaining programmer errors, raised
/// to the immediate caller and never caught internally.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// Operation on an entity whose generation no longer matches.
    #[error("entity {0} is stale (generation mismatch or never allocated)")]
    StaleEntity(Entity),

    /// Entity used with a world that did not issue it.
    #[error("entity {entity} belongs to another world, not world {world_id}")]
    WrongWorld { entity: Entity, world_id: u32 },

    /// A record named a field outside the trait's schema, or with the wrong
    /// kind.
    #[error("trait '{trait_name}' has no field '{field}' of that kind")]
    SchemaMismatch { trait_name: String, field: String },

    /// A relation pair was bound to a target that is not a live entity of
    /// this world.
    #[error("relation target {0} is not a live entity of this world")]
    RelationMisuse(Entity),

    /// The process-wide world id space is exhausted.
    #[error("all world ids are in use")]
    WorldsExhausted,
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::entity::Entity;
    pub use crate::query::{Added, Changed, QueryEvent, QueryParam, Removed};
    pub use crate::relation::{Relation, RelationOptions};
    pub use crate::storage::{Column, ColumnStore};
    pub use crate::trait_def::{FieldKind, FieldValue, Record, Trait};
    pub use crate::world::{SubscriptionId, TraitBundle, World};
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::prelude::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn position() -> Trait {
        Trait::new("position", Record::new().with("x", 0.0).with("y", 0.0))
    }

    // -- membership and subscriptions ---------------------------------------

    #[test]
    fn query_shrinks_and_notifies_on_remove() {
        let mut world = World::new();
        let pos = position();

        let e1 = world.spawn_with(&pos).unwrap();
        let e2 = world.spawn_with(&pos).unwrap();
        let e3 = world.spawn_with(&pos).unwrap();
        assert_eq!(world.query(&[QueryParam::all(&pos)]), vec![e1, e2, e3]);

        let events: Rc<RefCell<Vec<(Entity, QueryEvent)>>> = Rc::default();
        let sink = events.clone();
        world.subscribe(&[QueryParam::all(&pos)], move |_, entity, event| {
            sink.borrow_mut().push((entity, event));
        });

        world.remove(e2, &pos).unwrap();
        assert_eq!(world.query(&[QueryParam::all(&pos)]), vec![e1, e3]);
        assert_eq!(events.borrow().as_slice(), &[(e2, QueryEvent::Removed)]);
    }

    #[test]
    fn double_add_does_not_fire_subscribers() {
        let mut world = World::new();
        let tag = Trait::tag("marker");
        let e = world.spawn_empty();

        let fired = Rc::new(RefCell::new(0u32));
        let sink = fired.clone();
        world.subscribe(&[QueryParam::all(&tag)], move |_, _, _| {
            *sink.borrow_mut() += 1;
        });

        world.add(e, &tag).unwrap();
        world.add(e, &tag).unwrap();
        assert_eq!(*fired.borrow(), 1, "second add is a complete no-op");
    }

    #[test]
    fn subscribers_run_in_registration_order() {
        let mut world = World::new();
        let tag = Trait::tag("marker");
        let order: Rc<RefCell<Vec<u8>>> = Rc::default();

        for label in [1u8, 2, 3] {
            let sink = order.clone();
            world.subscribe(&[QueryParam::all(&tag)], move |_, _, _| {
                sink.borrow_mut().push(label);
            });
        }
        let e = world.spawn_empty();
        world.add(e, &tag).unwrap();
        assert_eq!(order.borrow().as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let mut world = World::new();
        let tag = Trait::tag("marker");
        let fired = Rc::new(RefCell::new(0u32));
        let sink = fired.clone();
        let sub = world.subscribe(&[QueryParam::all(&tag)], move |_, _, _| {
            *sink.borrow_mut() += 1;
        });

        let e = world.spawn_empty();
        world.add(e, &tag).unwrap();
        world.unsubscribe(sub);
        world.remove(e, &tag).unwrap();
        assert_eq!(*fired.borrow(), 1);
    }

    #[test]
    fn subscribers_may_mutate_the_world() {
        let mut world = World::new();
        let tag = Trait::tag("contagious");
        let spread: Rc<RefCell<Vec<Entity>>> = Rc::default();

        let sink = spread.clone();
        let inner_tag = tag.clone();
        world.subscribe(&[QueryParam::all(&tag)], move |world, _, event| {
            if event == QueryEvent::Added && sink.borrow().len() < 3 {
                // Re-entrant mutation: each infection spawns another carrier.
                let next = world.spawn_empty();
                world.add(next, &inner_tag).unwrap();
                sink.borrow_mut().push(next);
            }
        });

        let patient_zero = world.spawn_empty();
        world.add(patient_zero, &tag).unwrap();
        assert_eq!(spread.borrow().len(), 3);
        assert_eq!(world.query(&[QueryParam::all(&tag)]).len(), 4);
    }

    #[test]
    fn panicking_subscriber_does_not_starve_later_ones() {
        let mut world = World::new();
        let tag = Trait::tag("marker");
        let fired = Rc::new(RefCell::new(0u32));

        world.subscribe(&[QueryParam::all(&tag)], |_, _, _| {
            panic!("subscriber failure");
        });
        let sink = fired.clone();
        world.subscribe(&[QueryParam::all(&tag)], move |_, _, _| {
            *sink.borrow_mut() += 1;
        });

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let e = world.spawn_empty();
            world.add(e, &tag).unwrap();
        }));
        assert!(result.is_err(), "first panic is re-raised");
        assert_eq!(*fired.borrow(), 1, "later subscribers still ran");
    }

    // -- change tracking ----------------------------------------------------

    #[test]
    fn on_change_fires_only_for_real_changes() {
        let mut world = World::new();
        let pos = position();
        let e = world.spawn_with(&pos).unwrap();

        let fired = Rc::new(RefCell::new(0u32));
        let sink = fired.clone();
        world.on_change(&pos, move |_, _| {
            *sink.borrow_mut() += 1;
        });

        world.set(e, &pos, &Record::new().with("x", 1.0)).unwrap();
        assert_eq!(*fired.borrow(), 1);
        // Same value again: no change, no event.
        world.set(e, &pos, &Record::new().with("x", 1.0)).unwrap();
        assert_eq!(*fired.borrow(), 1);
    }

    #[test]
    fn added_tracker_consumes_on_read() {
        let mut world = World::new();
        let pos = position();
        let added = Added::new();

        let e = world.spawn_with(&pos).unwrap();
        assert_eq!(world.query(&[added.of(&pos)]), vec![e]);
        assert!(world.query(&[added.of(&pos)]).is_empty());

        // A later add shows up on the next read.
        let e2 = world.spawn_with(&pos).unwrap();
        assert_eq!(world.query(&[added.of(&pos)]), vec![e2]);
    }

    #[test]
    fn removed_tracker_reports_between_snapshots() {
        let mut world = World::new();
        let pos = position();
        let removed = Removed::new();

        let e = world.spawn_with(&pos).unwrap();
        // Establish the snapshot (consume the initial state).
        assert!(world.query(&[removed.of(&pos)]).is_empty());

        world.remove(e, &pos).unwrap();
        assert_eq!(world.query(&[removed.of(&pos)]), vec![e]);
        assert!(world.query(&[removed.of(&pos)]).is_empty());
    }

    #[test]
    fn changed_tracker_reports_value_mutations() {
        let mut world = World::new();
        let pos = position();
        let changed = Changed::new();

        let e = world.spawn_with(&pos).unwrap();
        assert!(world.query(&[changed.of(&pos)]).is_empty());

        world.set(e, &pos, &Record::new().with("y", 2.0)).unwrap();
        assert_eq!(world.query(&[changed.of(&pos)]), vec![e]);
        assert!(world.query(&[changed.of(&pos)]).is_empty());

        // Writing the same value back is not a change.
        world.set(e, &pos, &Record::new().with("y", 2.0)).unwrap();
        assert!(world.query(&[changed.of(&pos)]).is_empty());
    }

    #[test]
    fn independent_trackers_have_independent_snapshots() {
        let mut world = World::new();
        let pos = position();
        let first = Added::new();
        let second = Added::new();

        let e = world.spawn_with(&pos).unwrap();
        assert_eq!(world.query(&[first.of(&pos)]), vec![e]);
        // Consuming `first` leaves `second` untouched.
        assert_eq!(world.query(&[second.of(&pos)]), vec![e]);
    }

    #[test]
    fn tracked_run_does_not_fire_subscribers() {
        let mut world = World::new();
        let pos = position();
        let added = Added::new();

        let fired = Rc::new(RefCell::new(0u32));
        let sink = fired.clone();
        world.subscribe(&[added.of(&pos)], move |_, _, _| {
            *sink.borrow_mut() += 1;
        });

        let _e = world.spawn_with(&pos).unwrap();
        let fired_by_mutation = *fired.borrow();
        world.query(&[added.of(&pos)]);
        world.query(&[added.of(&pos)]);
        assert_eq!(
            *fired.borrow(),
            fired_by_mutation,
            "snapshot advance on run must not notify"
        );
    }

    // -- predicate edge cases -----------------------------------------------

    #[test]
    fn not_on_unused_trait_matches_all_live_entities() {
        let mut world = World::new();
        let never_used = Trait::tag("never-used");
        let e1 = world.spawn_empty();
        let e2 = world.spawn_empty();
        assert_eq!(world.query(&[QueryParam::not(&never_used)]), vec![e1, e2]);
        // ... and All on it matches nothing.
        assert!(world.query(&[QueryParam::all(&never_used)]).is_empty());
    }

    #[test]
    fn empty_any_matches_nothing() {
        let mut world = World::new();
        world.spawn_empty();
        assert!(world.query(&[QueryParam::any(&[])]).is_empty());
    }

    #[test]
    fn any_and_not_combine() {
        let mut world = World::new();
        let a = Trait::tag("a");
        let b = Trait::tag("b");
        let c = Trait::tag("c");

        let e1 = world.spawn_with(&a).unwrap();
        let e2 = world.spawn_with(&b).unwrap();
        let _e3 = world.spawn_with(&c).unwrap();

        let mut bundle = TraitBundle::new();
        bundle.add(&a);
        bundle.add(&c);
        let _e4 = world.spawn(bundle).unwrap();

        let hits = world.query(&[QueryParam::any(&[&a, &b]), QueryParam::not(&c)]);
        assert_eq!(hits, vec![e1, e2]);
    }

    // -- relations ----------------------------------------------------------

    #[test]
    fn exclusive_relation_swaps_targets() {
        let mut world = World::new();
        let child_of = Relation::new(
            "child-of",
            RelationOptions {
                exclusive: true,
                ..Default::default()
            },
        );

        let p1 = world.spawn_empty();
        let p2 = world.spawn_empty();
        let c = world.spawn_empty();

        world.add(c, &child_of.of(p1)).unwrap();
        world.add(c, &child_of.of(p2)).unwrap();

        assert!(!world.has(c, &child_of.of(p1)));
        assert!(world.has(c, &child_of.of(p2)));
        assert_eq!(world.targets_of(&child_of, c), vec![p2]);
    }

    #[test]
    fn non_exclusive_relation_accumulates_targets() {
        let mut world = World::new();
        let likes = Relation::new("likes", RelationOptions::default());

        let a = world.spawn_empty();
        let b = world.spawn_empty();
        let e = world.spawn_empty();

        world.add(e, &likes.of(a)).unwrap();
        world.add(e, &likes.of(b)).unwrap();
        assert_eq!(world.targets_of(&likes, e), vec![a, b]);
    }

    #[test]
    fn target_destruction_unlinks_by_default() {
        let mut world = World::new();
        let likes = Relation::new("likes", RelationOptions::default());

        let target = world.spawn_empty();
        let fan = world.spawn_empty();
        world.add(fan, &likes.of(target)).unwrap();

        world.despawn(target).unwrap();
        assert!(world.is_alive(fan));
        assert!(world.targets_of(&likes, fan).is_empty());
    }

    #[test]
    fn auto_remove_target_destroys_carriers() {
        let mut world = World::new();
        let child_of = Relation::new(
            "child-of",
            RelationOptions {
                auto_remove_target: true,
                ..Default::default()
            },
        );

        let parent = world.spawn_empty();
        let child = world.spawn_empty();
        let grandchild = world.spawn_empty();
        world.add(child, &child_of.of(parent)).unwrap();
        world.add(grandchild, &child_of.of(child)).unwrap();

        // The cascade runs transitively and completes before despawn returns.
        world.despawn(parent).unwrap();
        assert!(!world.is_alive(child));
        assert!(!world.is_alive(grandchild));
    }

    #[test]
    fn relation_target_must_be_alive() {
        let mut world = World::new();
        let likes = Relation::new("likes", RelationOptions::default());
        let target = world.spawn_empty();
        world.despawn(target).unwrap();

        let e = world.spawn_empty();
        assert!(matches!(
            world.add(e, &likes.of(target)),
            Err(EcsError::RelationMisuse(_))
        ));
    }

    // -- round trips --------------------------------------------------------

    #[test]
    fn add_then_get_merges_defaults_and_initializer() {
        let mut world = World::new();
        let pos = position();
        let e = world.spawn_empty();
        world
            .add_with(e, &pos, Record::new().with("y", 7.0))
            .unwrap();

        let record = world.get(e, &pos).unwrap();
        assert_eq!(record.get("x"), Some(&FieldValue::Number(0.0)));
        assert_eq!(record.get("y"), Some(&FieldValue::Number(7.0)));
    }

    #[test]
    fn respawn_after_despawn_yields_equivalent_record() {
        let mut world = World::new();
        let pos = position();
        let init = Record::new().with("x", 2.0).with("y", 3.0);

        let mut bundle = TraitBundle::new();
        bundle.add_with(&pos, init.clone());
        let e = world.spawn(bundle).unwrap();
        let first = world.get(e, &pos).unwrap();
        world.despawn(e).unwrap();

        let mut bundle = TraitBundle::new();
        bundle.add_with(&pos, init);
        let e2 = world.spawn(bundle).unwrap();
        assert_eq!(world.get(e2, &pos).unwrap(), first);
    }

    #[test]
    fn entity_centric_facade_delegates_to_the_world() {
        let mut world = World::new();
        let pos = position();
        let e = world.spawn_empty();

        e.add_with(&mut world, &pos, Record::new().with("x", 1.0))
            .unwrap();
        assert!(e.has(&world, &pos));
        assert!(e.is_alive(&world));

        e.set(&mut world, &pos, &Record::new().with("y", 2.0)).unwrap();
        let record = e.get(&world, &pos).unwrap();
        assert_eq!(record.get("x"), Some(&FieldValue::Number(1.0)));
        assert_eq!(record.get("y"), Some(&FieldValue::Number(2.0)));

        e.remove(&mut world, &pos).unwrap();
        assert!(!e.has(&world, &pos));
    }

    // -- multi-world isolation ----------------------------------------------

    #[test]
    fn worlds_are_isolated() {
        let mut a = World::new();
        let mut b = World::new();
        let pos = position();

        let ea = a.spawn_with(&pos).unwrap();
        let _eb = b.spawn_with(&pos).unwrap();

        assert_eq!(a.query(&[QueryParam::all(&pos)]), vec![ea]);
        assert_ne!(
            ea.world_id(),
            b.world_entity().world_id(),
            "worlds get distinct ids"
        );
        assert!(!b.is_alive(ea));
    }
}
