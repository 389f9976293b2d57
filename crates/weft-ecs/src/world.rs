//! The [`World`] is the top-level container: it owns the entity index, the
//! per-trait registry entries and their column stores, the presence and
//! tracking mask layers, the cached queries, and all subscriber tables.
//!
//! Worlds are numbered from a process-wide id pool with a free-list; the id
//! is embedded in every entity the world issues, so handles can be validated
//! against the world they are used with. Each world also owns a
//! distinguished *world entity* carrying a hidden exclusion tag -- world-level
//! traits attach to it, and cached queries never report it.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::{Mutex, OnceLock};

use crate::entity::{Entity, EntityIndex, MAX_WORLDS};
use crate::mask::{MaskLayer, TrackingMasks, WORD_BITS};
use crate::query::{QueryEvent, QueryKey, QueryParam, QueryPlan, QueryState};
use crate::relation::Relation;
use crate::storage::ColumnStore;
use crate::trait_def::{Record, Trait};
use crate::EcsError;

// ---------------------------------------------------------------------------
// Process-wide world id pool
// ---------------------------------------------------------------------------

struct WorldIdPool {
    free: Vec<u32>,
    next: u32,
}

fn world_id_pool() -> &'static Mutex<WorldIdPool> {
    static POOL: OnceLock<Mutex<WorldIdPool>> = OnceLock::new();
    POOL.get_or_init(|| {
        Mutex::new(WorldIdPool {
            free: Vec::new(),
            next: 0,
        })
    })
}

fn acquire_world_id() -> Result<u32, EcsError> {
    let mut pool = world_id_pool().lock().expect("world id pool poisoned");
    if let Some(id) = pool.free.pop() {
        return Ok(id);
    }
    if pool.next >= MAX_WORLDS {
        return Err(EcsError::WorldsExhausted);
    }
    let id = pool.next;
    pool.next += 1;
    Ok(id)
}

fn release_world_id(id: u32) {
    match world_id_pool().lock() {
        Ok(mut pool) => pool.free.push(id),
        Err(_) => tracing::warn!(world = id, "world id pool poisoned during release"),
    }
}

/// The hidden tag that keeps the world entity out of query results.
fn excluded_tag() -> &'static Trait {
    static TAG: OnceLock<Trait> = OnceLock::new();
    TAG.get_or_init(|| Trait::tag("__excluded"))
}

// ---------------------------------------------------------------------------
// TraitBundle
// ---------------------------------------------------------------------------

/// A helper for building the initial trait set passed to [`World::spawn`].
///
/// ```
/// use weft_ecs::prelude::*;
/// let position = Trait::new("position", Record::new().with("x", 0.0).with("y", 0.0));
/// let mut world = World::new();
/// let mut bundle = TraitBundle::new();
/// bundle.add_with(&position, Record::new().with("x", 3.0));
/// let entity = world.spawn(bundle).unwrap();
/// assert!(world.has(entity, &position));
/// ```
#[derive(Default)]
pub struct TraitBundle {
    entries: Vec<(Trait, Option<Record>)>,
}

impl TraitBundle {
    /// Create an empty bundle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a trait with its default values.
    ///
    /// # Panics
    ///
    /// Panics if the trait has already been added to this bundle.
    pub fn add(&mut self, trait_: &Trait) {
        self.push(trait_, None);
    }

    /// Add a trait with defaults overlaid by `values`.
    ///
    /// # Panics
    ///
    /// Panics if the trait has already been added to this bundle.
    pub fn add_with(&mut self, trait_: &Trait, values: Record) {
        self.push(trait_, Some(values));
    }

    fn push(&mut self, trait_: &Trait, values: Option<Record>) {
        if self.entries.iter().any(|(t, _)| t.id() == trait_.id()) {
            panic!(
                "duplicate trait '{}' in TraitBundle -- each trait can only be added once",
                trait_.name()
            );
        }
        self.entries.push((trait_.clone(), values));
    }

    /// Number of traits in the bundle.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the bundle is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn into_entries(self) -> Vec<(Trait, Option<Record>)> {
        self.entries
    }
}

// ---------------------------------------------------------------------------
// Subscriptions and deferred notifications
// ---------------------------------------------------------------------------

/// Callback invoked when a watched trait's value changes on an entity.
pub type ChangeCallback = Box<dyn FnMut(&mut World, Entity)>;

/// Opaque handle returned by [`World::subscribe`] and [`World::on_change`];
/// pass it to [`World::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

enum SubTarget {
    Query(QueryKey),
    Change(u32),
}

enum Pending {
    Query {
        key: QueryKey,
        entity: Entity,
        event: QueryEvent,
    },
    Change {
        trait_id: u32,
        entity: Entity,
    },
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// Registry entry for one trait within one world.
struct TraitEntry {
    trait_: Trait,
    /// The bitflag this trait occupies in the world's mask words.
    bit: u32,
    /// Column storage; `None` for tags.
    store: Option<ColumnStore>,
    /// Live entities currently carrying the trait, in handle order.
    carriers: BTreeSet<Entity>,
}

/// An isolated universe of entities, traits, masks, and queries.
pub struct World {
    id: u32,
    index: EntityIndex,
    /// Global trait id -> registry entry.
    entries: HashMap<u32, TraitEntry>,
    /// Bitflag -> global trait id, in assignment order.
    bits: Vec<u32>,
    presence: MaskLayer,
    /// Tracker id -> snapshot/changed layers, allocated lazily.
    trackers: HashMap<u32, TrackingMasks>,
    queries: HashMap<QueryKey, QueryState>,
    /// Reverse index: trait id -> cached queries whose static predicate
    /// touches its bitflag.
    queries_by_trait: HashMap<u32, Vec<QueryKey>>,
    change_subs: HashMap<u32, Vec<(u64, Option<ChangeCallback>)>>,
    /// Routing table for unsubscribe.
    sub_locations: HashMap<u64, SubTarget>,
    /// Ids unsubscribed while their callback was checked out for invocation.
    dead_subs: HashSet<u64>,
    next_sub_id: u64,
    pending: VecDeque<Pending>,
    notifying: bool,
    world_entity: Entity,
    initial_traits: Vec<Trait>,
}

impl World {
    /// Create a new, empty world.
    ///
    /// # Panics
    ///
    /// Panics if the process-wide world id space is exhausted; use
    /// [`try_new`](Self::try_new) to handle that case.
    pub fn new() -> World {
        Self::try_new().expect("world id space exhausted")
    }

    /// Fallible variant of [`new`](Self::new).
    pub fn try_new() -> Result<World, EcsError> {
        Self::try_with_traits(&[])
    }

    /// Create a world whose world entity carries `initial` from the start.
    /// The initial set is re-applied by [`reset`](Self::reset).
    pub fn with_traits(initial: &[&Trait]) -> World {
        Self::try_with_traits(initial).expect("world id space exhausted")
    }

    /// Fallible variant of [`with_traits`](Self::with_traits).
    pub fn try_with_traits(initial: &[&Trait]) -> Result<World, EcsError> {
        let id = acquire_world_id()?;
        let mut world = World {
            id,
            index: EntityIndex::new(id),
            entries: HashMap::new(),
            bits: Vec::new(),
            presence: MaskLayer::new(),
            trackers: HashMap::new(),
            queries: HashMap::new(),
            queries_by_trait: HashMap::new(),
            change_subs: HashMap::new(),
            sub_locations: HashMap::new(),
            dead_subs: HashSet::new(),
            next_sub_id: 0,
            pending: VecDeque::new(),
            notifying: false,
            world_entity: Entity::from_raw(0),
            initial_traits: initial.iter().map(|t| (*t).clone()).collect(),
        };
        world.init_world_entity();
        Ok(world)
    }

    fn init_world_entity(&mut self) {
        let entity = self.index.allocate();
        self.sync_rows();
        self.add_inner(entity, excluded_tag(), None, false)
            .expect("world entity initialization cannot fail");
        for trait_ in self.initial_traits.clone() {
            self.add_inner(entity, &trait_, None, false)
                .expect("initial world traits must not be relation pairs");
        }
        self.world_entity = entity;
        // Initialization is not an observable mutation.
        self.pending.clear();
    }

    /// The distinguished entity carrying world-level traits. Excluded from
    /// query results.
    pub fn world_entity(&self) -> Entity {
        self.world_entity
    }

    /// Number of currently alive entities, the world entity included.
    pub fn entity_count(&self) -> usize {
        self.index.alive_count()
    }

    /// Number of traits registered in this world, not counting the internal
    /// exclusion tag.
    pub fn trait_count(&self) -> usize {
        self.entries.len().saturating_sub(1)
    }

    /// A stable snapshot of all alive entities (world entity included), in
    /// row order.
    pub fn entities(&self) -> Vec<Entity> {
        self.index.alive_entities()
    }

    /// Whether `entity` was issued by this world and is still alive.
    pub fn is_alive(&self, entity: Entity) -> bool {
        entity.world_id() == self.id && self.index.is_alive(entity)
    }

    /// Destroy all entities and release the world id back to the pool.
    pub fn destroy(self) {
        // Drop does the work.
    }

    /// Clear all entities, traits, queries, and subscribers, keeping the
    /// world id and re-applying the initial trait set.
    pub fn reset(&mut self) {
        self.index = EntityIndex::new(self.id);
        self.entries.clear();
        self.bits.clear();
        self.presence = MaskLayer::new();
        self.trackers.clear();
        self.queries.clear();
        self.queries_by_trait.clear();
        self.change_subs.clear();
        self.sub_locations.clear();
        self.dead_subs.clear();
        self.pending.clear();
        self.init_world_entity();
    }

    // -- registration -------------------------------------------------------

    /// Register `trait_` in this world if needed, returning its bitflag.
    fn ensure_registered(&mut self, trait_: &Trait) -> u32 {
        if let Some(entry) = self.entries.get(&trait_.id()) {
            return entry.bit;
        }
        let bit = self.bits.len() as u32;
        self.bits.push(trait_.id());
        let stride = (bit / WORD_BITS) as usize + 1;
        if stride > self.presence.stride() {
            self.presence.grow_stride(stride);
            for masks in self.trackers.values_mut() {
                masks.grow_stride(stride);
            }
        }
        let store = if trait_.is_tag() {
            None
        } else {
            Some(ColumnStore::for_trait(trait_, self.index.capacity()))
        };
        self.entries.insert(
            trait_.id(),
            TraitEntry {
                trait_: trait_.clone(),
                bit,
                store,
                carriers: BTreeSet::new(),
            },
        );
        bit
    }

    /// Grow every row-indexed layer to the index's current capacity.
    fn sync_rows(&mut self) {
        let rows = self.index.capacity();
        self.presence.ensure_rows(rows);
        for masks in self.trackers.values_mut() {
            masks.ensure_rows(rows);
        }
    }

    fn check_entity(&self, entity: Entity) -> Result<(), EcsError> {
        if entity.world_id() != self.id {
            return Err(EcsError::WrongWorld {
                entity,
                world_id: self.id,
            });
        }
        if !self.index.is_alive(entity) {
            return Err(EcsError::StaleEntity(entity));
        }
        Ok(())
    }

    // -- entity lifecycle ---------------------------------------------------

    /// Allocate a new entity with no traits.
    pub fn spawn_empty(&mut self) -> Entity {
        let entity = self.spawn_inner();
        self.flush_notifications();
        entity
    }

    /// Allocate a new entity carrying `trait_` with default values.
    pub fn spawn_with(&mut self, trait_: &Trait) -> Result<Entity, EcsError> {
        let mut bundle = TraitBundle::new();
        bundle.add(trait_);
        self.spawn(bundle)
    }

    /// Allocate a new entity with the given initial traits.
    ///
    /// On error (e.g. a relation pair bound to a dead target) the
    /// half-initialized entity is despawned before returning.
    pub fn spawn(&mut self, bundle: TraitBundle) -> Result<Entity, EcsError> {
        let entity = self.spawn_inner();
        for (trait_, values) in bundle.into_entries() {
            if let Err(err) = self.add_inner(entity, &trait_, values.as_ref(), false) {
                self.despawn_inner(entity);
                self.flush_notifications();
                return Err(err);
            }
        }
        self.flush_notifications();
        Ok(entity)
    }

    fn spawn_inner(&mut self) -> Entity {
        let entity = self.index.allocate();
        self.sync_rows();
        // A fresh entity can already satisfy `Not`-only predicates.
        let row = entity.row() as usize;
        for (key, state) in &mut self.queries {
            if state.plan.matches_static(&self.presence, row) && state.result.insert(entity) {
                self.pending.push_back(Pending::Query {
                    key: key.clone(),
                    entity,
                    event: QueryEvent::Added,
                });
            }
        }
        entity
    }

    /// Destroy an entity: run relation cascades, drop all trait memberships,
    /// and free the row (bumping its generation).
    pub fn despawn(&mut self, entity: Entity) -> Result<(), EcsError> {
        self.check_entity(entity)?;
        self.despawn_inner(entity);
        self.flush_notifications();
        Ok(())
    }

    fn despawn_inner(&mut self, entity: Entity) {
        if !self.index.is_alive(entity) {
            // Already gone; cascade cycles end here.
            return;
        }
        self.index.free(entity);
        let row = entity.row() as usize;

        // Cascades: this entity as a relation target. Collect first -- the
        // cascade itself mutates the registry.
        let mut doomed_carriers: Vec<Entity> = Vec::new();
        let mut unlink: Vec<(Entity, Trait)> = Vec::new();
        for entry in self.entries.values() {
            let Some(link) = entry.trait_.relation() else {
                continue;
            };
            if link.target != entity {
                continue;
            }
            if link.auto_remove_target {
                doomed_carriers.extend(entry.carriers.iter().copied());
            } else {
                unlink.extend(entry.carriers.iter().map(|c| (*c, entry.trait_.clone())));
            }
        }
        for carrier in doomed_carriers {
            self.despawn_inner(carrier);
        }
        for (carrier, pair) in unlink {
            if self.index.is_alive(carrier) {
                let _ = self.remove_inner(carrier, &pair, false);
            }
        }

        // Drop this entity's own memberships.
        let present: Vec<u32> = self
            .bits
            .iter()
            .enumerate()
            .filter(|(bit, _)| self.presence.get(row, *bit as u32))
            .map(|(_, trait_id)| *trait_id)
            .collect();
        for trait_id in present {
            if let Some(entry) = self.entries.get_mut(&trait_id) {
                entry.carriers.remove(&entity);
            }
        }

        // Leave every cached query.
        for (key, state) in &mut self.queries {
            if state.result.remove(&entity) {
                self.pending.push_back(Pending::Query {
                    key: key.clone(),
                    entity,
                    event: QueryEvent::Removed,
                });
            }
        }

        self.presence.clear_row(row);
        for masks in self.trackers.values_mut() {
            masks.clear_row(row);
        }
    }

    // -- trait mutation -----------------------------------------------------

    /// Add `trait_` to `entity` with default values.
    ///
    /// If the entity already carries the trait this is a membership no-op.
    pub fn add(&mut self, entity: Entity, trait_: &Trait) -> Result<(), EcsError> {
        self.add_inner(entity, trait_, None, true)
    }

    /// Add `trait_` with defaults overlaid by `values`.
    ///
    /// If the entity already carries the trait, `values` is applied with
    /// [`set`](Self::set) semantics instead.
    pub fn add_with(
        &mut self,
        entity: Entity,
        trait_: &Trait,
        values: Record,
    ) -> Result<(), EcsError> {
        self.add_inner(entity, trait_, Some(&values), true)
    }

    fn add_inner(
        &mut self,
        entity: Entity,
        trait_: &Trait,
        values: Option<&Record>,
        flush: bool,
    ) -> Result<(), EcsError> {
        self.check_entity(entity)?;
        if let Some(values) = values {
            trait_.check_record(values)?;
        }

        if let Some(link) = trait_.relation() {
            if link.target.world_id() != self.id || !self.index.is_alive(link.target) {
                return Err(EcsError::RelationMisuse(link.target));
            }
            if link.exclusive {
                let row = entity.row() as usize;
                let prior: Vec<Trait> = self
                    .entries
                    .values()
                    .filter(|entry| {
                        entry.trait_.id() != trait_.id()
                            && entry
                                .trait_
                                .relation()
                                .is_some_and(|l| l.relation_id == link.relation_id)
                            && self.presence.get(row, entry.bit)
                    })
                    .map(|entry| entry.trait_.clone())
                    .collect();
                for pair in prior {
                    self.remove_inner(entity, &pair, false)?;
                }
            }
        }

        let bit = self.ensure_registered(trait_);
        let row = entity.row() as usize;

        if self.presence.get(row, bit) {
            if let Some(values) = values {
                self.set_inner(entity, trait_, values, false)?;
            }
        } else {
            self.presence.set(row, bit);
            let rows = self.index.capacity();
            let entry = self
                .entries
                .get_mut(&trait_.id())
                .expect("trait registered above");
            entry.carriers.insert(entity);
            if let Some(store) = &mut entry.store {
                store.ensure_rows(rows);
                store.write_defaults(row, entry.trait_.defaults());
                if let Some(values) = values {
                    store.set_with_change_detection(row, values);
                }
            }
            self.refresh_queries_for_trait(trait_.id(), entity);
        }

        if flush {
            self.flush_notifications();
        }
        Ok(())
    }

    /// Remove `trait_` from `entity`. A no-op if the trait is absent or was
    /// never registered.
    pub fn remove(&mut self, entity: Entity, trait_: &Trait) -> Result<(), EcsError> {
        self.remove_inner(entity, trait_, true)
    }

    fn remove_inner(
        &mut self,
        entity: Entity,
        trait_: &Trait,
        flush: bool,
    ) -> Result<(), EcsError> {
        self.check_entity(entity)?;
        let row = entity.row() as usize;
        let bit = match self.entries.get(&trait_.id()) {
            Some(entry) => entry.bit,
            None => return Ok(()),
        };
        if self.presence.get(row, bit) {
            self.presence.clear(row, bit);
            self.entries
                .get_mut(&trait_.id())
                .expect("entry checked above")
                .carriers
                .remove(&entity);
            self.refresh_queries_for_trait(trait_.id(), entity);
        }
        if flush {
            self.flush_notifications();
        }
        Ok(())
    }

    /// Field-wise assignment with change detection. Fires `on_change`
    /// subscribers and marks `Changed` trackers iff at least one stored field
    /// actually changed. A no-op if the entity does not carry the trait.
    pub fn set(&mut self, entity: Entity, trait_: &Trait, values: &Record) -> Result<(), EcsError> {
        self.set_inner(entity, trait_, values, true)
    }

    fn set_inner(
        &mut self,
        entity: Entity,
        trait_: &Trait,
        values: &Record,
        flush: bool,
    ) -> Result<(), EcsError> {
        self.check_entity(entity)?;
        trait_.check_record(values)?;
        let row = entity.row() as usize;
        let bit = match self.entries.get(&trait_.id()) {
            Some(entry) => entry.bit,
            None => return Ok(()),
        };
        if !self.presence.get(row, bit) {
            return Ok(());
        }
        let changed = self
            .entries
            .get_mut(&trait_.id())
            .expect("entry checked above")
            .store
            .as_mut()
            .is_some_and(|store| store.set_with_change_detection(row, values));
        if changed {
            for masks in self.trackers.values_mut() {
                masks.changed.set(row, bit);
            }
            self.pending.push_back(Pending::Change {
                trait_id: trait_.id(),
                entity,
            });
        }
        if flush {
            self.flush_notifications();
        }
        Ok(())
    }

    // -- trait access -------------------------------------------------------

    /// Snapshot of `entity`'s values for `trait_`, or `None` if the entity is
    /// stale, foreign, or does not carry the trait. Tags yield an empty
    /// record.
    pub fn get(&self, entity: Entity, trait_: &Trait) -> Option<Record> {
        if entity.world_id() != self.id || !self.index.is_alive(entity) {
            return None;
        }
        let entry = self.entries.get(&trait_.id())?;
        let row = entity.row() as usize;
        if !self.presence.get(row, entry.bit) {
            return None;
        }
        Some(match &entry.store {
            Some(store) => store.get_row(row),
            None => Record::new(),
        })
    }

    /// Whether `entity` currently carries `trait_`.
    pub fn has(&self, entity: Entity, trait_: &Trait) -> bool {
        entity.world_id() == self.id
            && self.index.is_alive(entity)
            && self
                .entries
                .get(&trait_.id())
                .is_some_and(|entry| self.presence.get(entity.row() as usize, entry.bit))
    }

    /// Borrow `trait_`'s column store for direct per-field iteration.
    /// `None` for tags and unregistered traits.
    pub fn columns(&self, trait_: &Trait) -> Option<&ColumnStore> {
        self.entries.get(&trait_.id())?.store.as_ref()
    }

    // -- queries ------------------------------------------------------------

    /// Run a cached query, returning a buffered snapshot of matching
    /// entities in handle order.
    ///
    /// Queries with tracked modifiers (`Added`/`Removed`/`Changed`) are
    /// consume-on-read: running them advances their trackers' snapshots, so
    /// an immediate second run with no interleaved mutations yields nothing.
    pub fn query(&mut self, params: &[QueryParam]) -> Vec<Entity> {
        let key = self.get_or_create_query(params);
        let state = self.queries.get(&key).expect("query created above");
        if !state.plan.has_tracked() {
            return state.result.iter().copied().collect();
        }
        let result: Vec<Entity> = state
            .result
            .iter()
            .copied()
            .filter(|entity| {
                state
                    .plan
                    .matches_tracked(&self.presence, &self.trackers, entity.row() as usize)
            })
            .collect();
        let tracker_ids: Vec<u32> = state.plan.tracked.iter().map(|t| t.tracker).collect();
        for tracker in tracker_ids {
            if let Some(masks) = self.trackers.get_mut(&tracker) {
                masks.consume(&self.presence);
            }
        }
        result
    }

    /// Subscribe to membership deltas of the query described by `params`.
    ///
    /// The callback fires synchronously after the triggering mutation's state
    /// is visible, in registration order; it receives the world and may issue
    /// further mutations (notifications are buffered and flushed after the
    /// current pass).
    pub fn subscribe(
        &mut self,
        params: &[QueryParam],
        callback: impl FnMut(&mut World, Entity, QueryEvent) + 'static,
    ) -> SubscriptionId {
        let key = self.get_or_create_query(params);
        let id = self.next_sub_id;
        self.next_sub_id += 1;
        let compact = !self.notifying;
        let state = self.queries.get_mut(&key).expect("query created above");
        if compact {
            state.subscribers.retain(|(_, cb)| cb.is_some());
        }
        state.subscribers.push((id, Some(Box::new(callback))));
        self.sub_locations.insert(id, SubTarget::Query(key));
        SubscriptionId(id)
    }

    /// Subscribe to value changes of `trait_` on any entity of this world.
    /// Fires iff a `set` actually changed at least one stored field.
    pub fn on_change(
        &mut self,
        trait_: &Trait,
        callback: impl FnMut(&mut World, Entity) + 'static,
    ) -> SubscriptionId {
        self.ensure_registered(trait_);
        let id = self.next_sub_id;
        self.next_sub_id += 1;
        let compact = !self.notifying;
        let slots = self.change_subs.entry(trait_.id()).or_default();
        if compact {
            slots.retain(|(_, cb)| cb.is_some());
        }
        slots.push((id, Some(Box::new(callback))));
        self.sub_locations.insert(id, SubTarget::Change(trait_.id()));
        SubscriptionId(id)
    }

    /// Cancel a subscription. Safe to call from inside a callback, including
    /// on the running callback itself.
    pub fn unsubscribe(&mut self, sub: SubscriptionId) {
        let Some(target) = self.sub_locations.remove(&sub.0) else {
            return;
        };
        match &target {
            SubTarget::Query(key) => {
                let slot = self
                    .queries
                    .get_mut(key)
                    .and_then(|state| state.subscribers.iter_mut().find(|(id, _)| *id == sub.0));
                if let Some((_, callback)) = slot {
                    if callback.is_some() {
                        *callback = None;
                    } else {
                        // Checked out for invocation right now; drop it on reinsert.
                        self.dead_subs.insert(sub.0);
                    }
                }
            }
            SubTarget::Change(trait_id) => {
                let slot = self
                    .change_subs
                    .get_mut(trait_id)
                    .and_then(|slots| slots.iter_mut().find(|(id, _)| *id == sub.0));
                if let Some((_, callback)) = slot {
                    if callback.is_some() {
                        *callback = None;
                    } else {
                        // Checked out for invocation right now; drop it on reinsert.
                        self.dead_subs.insert(sub.0);
                    }
                }
            }
        }
    }

    fn get_or_create_query(&mut self, params: &[QueryParam]) -> QueryKey {
        // Traits referenced by a query register lazily: an unregistered
        // `All` then matches nothing and an unregistered `Not` matches all
        // live entities, with no special casing.
        for param in params {
            for trait_ in param.traits() {
                self.ensure_registered(trait_);
            }
        }
        let key = QueryKey::canonicalize(params);
        if self.queries.contains_key(&key) {
            return key;
        }

        let excluded_bit = self
            .entries
            .get(&excluded_tag().id())
            .expect("exclusion tag registered at world init")
            .bit;
        let plan = QueryPlan::build(
            &key,
            |id| self.entries.get(&id).expect("registered above").bit,
            excluded_bit,
        );

        let rows = self.index.capacity();
        let stride = self.presence.stride();
        for tracked in &plan.tracked {
            self.trackers
                .entry(tracked.tracker)
                .or_insert_with(|| TrackingMasks::new(rows, stride));
        }

        let mut state = QueryState::new(plan);
        for entity in self.index.alive_entities() {
            if state
                .plan
                .matches_static(&self.presence, entity.row() as usize)
            {
                state.result.insert(entity);
            }
        }

        for param in params {
            if param.is_static() {
                for trait_ in param.traits() {
                    let keys = self.queries_by_trait.entry(trait_.id()).or_default();
                    if !keys.contains(&key) {
                        keys.push(key.clone());
                    }
                }
            }
        }

        self.queries.insert(key.clone(), state);
        key
    }

    /// Re-evaluate membership of `entity` in every cached query whose static
    /// predicate touches `trait_id`'s bitflag.
    fn refresh_queries_for_trait(&mut self, trait_id: u32, entity: Entity) {
        let Some(keys) = self.queries_by_trait.get(&trait_id) else {
            return;
        };
        let row = entity.row() as usize;
        let alive = self.index.is_alive(entity);
        for key in keys {
            let Some(state) = self.queries.get_mut(key) else {
                continue;
            };
            let matches = alive && state.plan.matches_static(&self.presence, row);
            if matches {
                if state.result.insert(entity) {
                    self.pending.push_back(Pending::Query {
                        key: key.clone(),
                        entity,
                        event: QueryEvent::Added,
                    });
                }
            } else if state.result.remove(&entity) {
                self.pending.push_back(Pending::Query {
                    key: key.clone(),
                    entity,
                    event: QueryEvent::Removed,
                });
            }
        }
    }

    // -- relations ----------------------------------------------------------

    /// The targets `entity` is related to through `relation`, in bitflag
    /// assignment order.
    pub fn targets_of(&self, relation: &Relation, entity: Entity) -> Vec<Entity> {
        if entity.world_id() != self.id || !self.index.is_alive(entity) {
            return Vec::new();
        }
        let row = entity.row() as usize;
        let mut pairs: Vec<(u32, Entity)> = self
            .entries
            .values()
            .filter_map(|entry| {
                let link = entry.trait_.relation()?;
                (link.relation_id == relation.id() && self.presence.get(row, entry.bit))
                    .then_some((entry.bit, link.target))
            })
            .collect();
        pairs.sort_by_key(|(bit, _)| *bit);
        pairs.into_iter().map(|(_, target)| target).collect()
    }

    // -- deferred notification delivery -------------------------------------

    /// Drain the pending event queue, invoking subscribers. Re-entrant calls
    /// (mutations issued from inside a callback) only enqueue; the outermost
    /// flush delivers everything in order.
    ///
    /// A panicking callback does not corrupt world state: the remaining
    /// notifications still run, then the first captured panic is re-raised.
    fn flush_notifications(&mut self) {
        if self.notifying {
            return;
        }
        self.notifying = true;
        let mut panics: Vec<Box<dyn std::any::Any + Send>> = Vec::new();

        while let Some(event) = self.pending.pop_front() {
            match event {
                Pending::Query { key, entity, event } => {
                    let count = self
                        .queries
                        .get(&key)
                        .map(|state| state.subscribers.len())
                        .unwrap_or(0);
                    for slot in 0..count {
                        let Some((id, callback)) = self
                            .queries
                            .get_mut(&key)
                            .and_then(|state| state.subscribers.get_mut(slot))
                            .and_then(|(id, cb)| cb.take().map(|cb| (*id, cb)))
                        else {
                            continue;
                        };
                        let mut callback = callback;
                        if let Err(payload) =
                            catch_unwind(AssertUnwindSafe(|| callback(self, entity, event)))
                        {
                            panics.push(payload);
                        }
                        if self.dead_subs.remove(&id) {
                            continue;
                        }
                        if let Some((slot_id, cb)) = self
                            .queries
                            .get_mut(&key)
                            .and_then(|state| state.subscribers.get_mut(slot))
                        {
                            if *slot_id == id {
                                *cb = Some(callback);
                            }
                        }
                    }
                }
                Pending::Change { trait_id, entity } => {
                    let count = self
                        .change_subs
                        .get(&trait_id)
                        .map(|slots| slots.len())
                        .unwrap_or(0);
                    for slot in 0..count {
                        let Some((id, callback)) = self
                            .change_subs
                            .get_mut(&trait_id)
                            .and_then(|slots| slots.get_mut(slot))
                            .and_then(|(id, cb)| cb.take().map(|cb| (*id, cb)))
                        else {
                            continue;
                        };
                        let mut callback = callback;
                        if let Err(payload) =
                            catch_unwind(AssertUnwindSafe(|| callback(self, entity)))
                        {
                            panics.push(payload);
                        }
                        if self.dead_subs.remove(&id) {
                            continue;
                        }
                        if let Some((slot_id, cb)) = self
                            .change_subs
                            .get_mut(&trait_id)
                            .and_then(|slots| slots.get_mut(slot))
                        {
                            if *slot_id == id {
                                *cb = Some(callback);
                            }
                        }
                    }
                }
            }
        }

        self.notifying = false;
        if !panics.is_empty() {
            if panics.len() > 1 {
                tracing::warn!(
                    suppressed = panics.len() - 1,
                    "multiple subscriber panics in one notification pass; re-raising the first"
                );
            }
            resume_unwind(panics.remove(0));
        }
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for World {
    fn drop(&mut self) {
        release_world_id(self.id);
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("id", &self.id)
            .field("entity_count", &self.entity_count())
            .field("trait_count", &self.trait_count())
            .field("query_count", &self.queries.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
