//! Entity identifiers and the per-world generational index.
//!
//! An [`Entity`] is a 32-bit handle that packs a *generation* counter, the id
//! of the owning world, and a *row* index into the world's dense storage.
//! The generation is bumped every time a row is recycled, which allows
//! immediate stale-handle detection; the world id lets any handle be routed
//! back to (and validated against) the world that issued it.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use crate::trait_def::{Record, Trait};
use crate::world::World;
use crate::EcsError;

/// Bits reserved for the row index (low bits).
pub(crate) const ROW_BITS: u32 = 18;
/// Bits reserved for the world id.
pub(crate) const WORLD_BITS: u32 = 6;
/// Bits reserved for the generation counter (high bits).
pub(crate) const GENERATION_BITS: u32 = 8;

/// Maximum number of rows a single world can address.
pub(crate) const MAX_ROWS: u32 = 1 << ROW_BITS;
/// Maximum number of concurrently live worlds.
pub const MAX_WORLDS: u32 = 1 << WORLD_BITS;

const ROW_MASK: u32 = MAX_ROWS - 1;
const WORLD_MASK: u32 = (1 << WORLD_BITS) - 1;
const GENERATION_MASK: u32 = (1 << GENERATION_BITS) - 1;

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A generational entity handle.
///
/// Layout: `[generation: 8 | world: 6 | row: 18]`
///
/// Two entities are equal iff all three fields match; a handle whose
/// generation no longer matches the world's current generation for that row
/// is *stale* and never observes live data.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Entity(u32);

impl Entity {
    /// Construct an `Entity` from its three fields.
    #[inline]
    pub(crate) fn pack(row: u32, world: u32, generation: u32) -> Self {
        debug_assert!(row < MAX_ROWS);
        debug_assert!(world < MAX_WORLDS);
        Self(
            (generation & GENERATION_MASK) << (ROW_BITS + WORLD_BITS)
                | (world & WORLD_MASK) << ROW_BITS
                | (row & ROW_MASK),
        )
    }

    /// The row index into the owning world's dense storage.
    #[inline]
    pub fn row(self) -> u32 {
        self.0 & ROW_MASK
    }

    /// The id of the world that issued this handle.
    #[inline]
    pub fn world_id(self) -> u32 {
        (self.0 >> ROW_BITS) & WORLD_MASK
    }

    /// The generation counter for this handle's row.
    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> (ROW_BITS + WORLD_BITS)) & GENERATION_MASK
    }

    /// Raw `u32` representation.
    #[inline]
    pub fn to_raw(self) -> u32 {
        self.0
    }

    /// Reconstruct from a raw `u32`.
    #[inline]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    // -- facade conveniences (delegate to the owning world) -----------------

    /// Add `trait_` to this entity with default values.
    pub fn add(self, world: &mut World, trait_: &Trait) -> Result<(), EcsError> {
        world.add(self, trait_)
    }

    /// Add `trait_` with defaults overlaid by `values`.
    pub fn add_with(self, world: &mut World, trait_: &Trait, values: Record) -> Result<(), EcsError> {
        world.add_with(self, trait_, values)
    }

    /// Remove `trait_` from this entity. A no-op if the trait is absent.
    pub fn remove(self, world: &mut World, trait_: &Trait) -> Result<(), EcsError> {
        world.remove(self, trait_)
    }

    /// Field-wise assignment with change detection.
    pub fn set(self, world: &mut World, trait_: &Trait, values: &Record) -> Result<(), EcsError> {
        world.set(self, trait_, values)
    }

    /// Snapshot of this entity's values for `trait_`.
    pub fn get(self, world: &World, trait_: &Trait) -> Option<Record> {
        world.get(self, trait_)
    }

    /// Whether this entity currently carries `trait_`.
    pub fn has(self, world: &World, trait_: &Trait) -> bool {
        world.has(self, trait_)
    }

    /// Whether this handle refers to a live entity of `world`.
    pub fn is_alive(self, world: &World) -> bool {
        world.is_alive(self)
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}v{}@w{})", self.row(), self.generation(), self.world_id())
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}@w{}", self.row(), self.generation(), self.world_id())
    }
}

// ---------------------------------------------------------------------------
// EntityIndex
// ---------------------------------------------------------------------------

/// Allocates and recycles [`Entity`] handles for one world.
///
/// Free rows are kept in a FIFO queue so that generations are spread out over
/// time rather than concentrated on a hot row.
#[derive(Debug)]
pub(crate) struct EntityIndex {
    /// Id of the owning world, embedded in every handle issued.
    world_id: u32,
    /// Current generation for each row slot.
    generations: Vec<u8>,
    /// Whether the slot is currently alive.
    alive: Vec<bool>,
    /// Free-list of recyclable rows (FIFO queue).
    free_rows: VecDeque<u32>,
    /// Number of currently alive rows.
    alive_count: usize,
}

impl EntityIndex {
    pub fn new(world_id: u32) -> Self {
        Self {
            world_id,
            generations: Vec::new(),
            alive: Vec::new(),
            free_rows: VecDeque::new(),
            alive_count: 0,
        }
    }

    /// Allocate a fresh [`Entity`].
    ///
    /// If a recycled row is available it is reused with its already-bumped
    /// generation; otherwise a brand-new row is appended.
    ///
    /// # Panics
    ///
    /// Panics if the world's 20-bit row space is exhausted.
    pub fn allocate(&mut self) -> Entity {
        self.alive_count += 1;
        if let Some(row) = self.free_rows.pop_front() {
            self.alive[row as usize] = true;
            Entity::pack(row, self.world_id, self.generations[row as usize] as u32)
        } else {
            let row = self.generations.len() as u32;
            assert!(row < MAX_ROWS, "entity row space exhausted for world {}", self.world_id);
            self.generations.push(0);
            self.alive.push(true);
            Entity::pack(row, self.world_id, 0)
        }
    }

    /// Free an entity, bumping the generation for its row so that any
    /// outstanding handles become stale.
    ///
    /// Returns `true` if the entity was alive and is now freed, `false` if it
    /// was already dead or had a stale generation.
    pub fn free(&mut self, entity: Entity) -> bool {
        let row = entity.row() as usize;
        if row >= self.generations.len() {
            return false;
        }
        if self.generations[row] as u32 != entity.generation() || !self.alive[row] {
            return false;
        }
        self.alive[row] = false;
        self.generations[row] = self.generations[row].wrapping_add(1);
        self.free_rows.push_back(entity.row());
        self.alive_count -= 1;
        true
    }

    /// Whether `entity` refers to a currently alive row with a matching
    /// generation.
    pub fn is_alive(&self, entity: Entity) -> bool {
        let row = entity.row() as usize;
        row < self.generations.len()
            && self.alive[row]
            && self.generations[row] as u32 == entity.generation()
    }

    /// A stable snapshot of all currently alive entities, in row order.
    pub fn alive_entities(&self) -> Vec<Entity> {
        self.generations
            .iter()
            .zip(self.alive.iter())
            .enumerate()
            .filter(|(_, (_, alive))| **alive)
            .map(|(row, (gen, _))| Entity::pack(row as u32, self.world_id, *gen as u32))
            .collect()
    }

    /// Total number of row slots ever created (alive and dead).
    pub fn capacity(&self) -> usize {
        self.generations.len()
    }

    /// Number of currently alive entities.
    pub fn alive_count(&self) -> usize {
        self.alive_count
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
