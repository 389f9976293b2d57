//! Query parameters, canonical keys, and cached query plans.
//!
//! A query is a list of [`QueryParam`]s. Worlds canonicalize the list into a
//! [`QueryKey`] -- a sorted, deduplicated vector of `(modifier, trait id)`
//! entries -- and cache one [`QueryState`] per key, so two semantically equal
//! queries always share a plan, a maintained result set, and subscribers.
//!
//! The plan pre-computes, per mask word, an AND-mask/AND-value pair plus one
//! OR-mask per `Any` group. A row matches when every word passes its AND test
//! and every OR group intersects at least one word non-trivially. `Added`,
//! `Removed`, and `Changed` parameters attach a tracker whose layers are
//! folded in at run time and consumed on read.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::entity::Entity;
use crate::mask::{MaskLayer, TrackingMasks, WORD_BITS};
use crate::trait_def::Trait;
use crate::world::World;

static NEXT_TRACKER_ID: AtomicU32 = AtomicU32::new(0);

fn next_tracker_id() -> u32 {
    NEXT_TRACKER_ID.fetch_add(1, Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// One element of a query's predicate.
#[derive(Debug, Clone)]
pub enum QueryParam {
    /// The entity must carry the trait.
    All(Trait),
    /// The entity must carry at least one of the traits.
    Any(Vec<Trait>),
    /// The entity must not carry the trait.
    Not(Trait),
    /// The trait was added since the tracker's snapshot.
    Added { tracker: u32, trait_: Trait },
    /// The trait was removed since the tracker's snapshot.
    Removed { tracker: u32, trait_: Trait },
    /// The trait's value changed since the tracker's snapshot.
    Changed { tracker: u32, trait_: Trait },
}

impl QueryParam {
    /// Require `trait_` to be present. This is the default modifier.
    pub fn all(trait_: &Trait) -> QueryParam {
        QueryParam::All(trait_.clone())
    }

    /// Require at least one of `traits` to be present. An empty list is a
    /// static-false predicate.
    pub fn any(traits: &[&Trait]) -> QueryParam {
        QueryParam::Any(traits.iter().map(|t| (*t).clone()).collect())
    }

    /// Require `trait_` to be absent.
    pub fn not(trait_: &Trait) -> QueryParam {
        QueryParam::Not(trait_.clone())
    }

    /// Every trait this parameter references.
    pub(crate) fn traits(&self) -> Vec<&Trait> {
        match self {
            QueryParam::All(t) | QueryParam::Not(t) => vec![t],
            QueryParam::Any(ts) => ts.iter().collect(),
            QueryParam::Added { trait_, .. }
            | QueryParam::Removed { trait_, .. }
            | QueryParam::Changed { trait_, .. } => vec![trait_],
        }
    }

    /// Whether this parameter constrains maintained (static) membership,
    /// as opposed to attaching a tracker folded in at run time.
    pub(crate) fn is_static(&self) -> bool {
        matches!(
            self,
            QueryParam::All(_) | QueryParam::Any(_) | QueryParam::Not(_)
        )
    }
}

/// Membership delta kinds delivered to query subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryEvent {
    /// The entity entered the query's result set.
    Added,
    /// The entity left the query's result set.
    Removed,
}

// ---------------------------------------------------------------------------
// Tracker factories
// ---------------------------------------------------------------------------

/// Factory for `Added` parameters. Each instance owns an independent tracker:
/// its snapshot starts empty and advances when a query using it runs.
#[derive(Debug, Clone, Copy)]
pub struct Added(u32);

impl Added {
    pub fn new() -> Self {
        Self(next_tracker_id())
    }

    /// `trait_` was added since this tracker's snapshot.
    pub fn of(&self, trait_: &Trait) -> QueryParam {
        QueryParam::Added {
            tracker: self.0,
            trait_: trait_.clone(),
        }
    }
}

impl Default for Added {
    fn default() -> Self {
        Self::new()
    }
}

/// Factory for `Removed` parameters; see [`Added`] for tracker semantics.
#[derive(Debug, Clone, Copy)]
pub struct Removed(u32);

impl Removed {
    pub fn new() -> Self {
        Self(next_tracker_id())
    }

    /// `trait_` was removed since this tracker's snapshot.
    pub fn of(&self, trait_: &Trait) -> QueryParam {
        QueryParam::Removed {
            tracker: self.0,
            trait_: trait_.clone(),
        }
    }
}

impl Default for Removed {
    fn default() -> Self {
        Self::new()
    }
}

/// Factory for `Changed` parameters; see [`Added`] for tracker semantics.
#[derive(Debug, Clone, Copy)]
pub struct Changed(u32);

impl Changed {
    pub fn new() -> Self {
        Self(next_tracker_id())
    }

    /// `trait_`'s value changed since this tracker's snapshot.
    pub fn of(&self, trait_: &Trait) -> QueryParam {
        QueryParam::Changed {
            tracker: self.0,
            trait_: trait_.clone(),
        }
    }
}

impl Default for Changed {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Canonical keys
// ---------------------------------------------------------------------------

/// One canonicalized parameter. Trait identity is the global trait id;
/// ordering is derived so that semantically equal parameter lists always
/// produce identical key vectors.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum CanonParam {
    All(u32),
    Any(Vec<u32>),
    Not(u32),
    Added(u32, u32),
    Removed(u32, u32),
    Changed(u32, u32),
}

/// The cache key of a query: a sorted, deduplicated canonical parameter list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct QueryKey(Vec<CanonParam>);

impl QueryKey {
    pub fn canonicalize(params: &[QueryParam]) -> QueryKey {
        let mut canon: Vec<CanonParam> = params
            .iter()
            .map(|param| match param {
                QueryParam::All(t) => CanonParam::All(t.id()),
                QueryParam::Any(ts) => {
                    let mut ids: Vec<u32> = ts.iter().map(Trait::id).collect();
                    ids.sort_unstable();
                    ids.dedup();
                    CanonParam::Any(ids)
                }
                QueryParam::Not(t) => CanonParam::Not(t.id()),
                QueryParam::Added { tracker, trait_ } => CanonParam::Added(*tracker, trait_.id()),
                QueryParam::Removed { tracker, trait_ } => {
                    CanonParam::Removed(*tracker, trait_.id())
                }
                QueryParam::Changed { tracker, trait_ } => {
                    CanonParam::Changed(*tracker, trait_.id())
                }
            })
            .collect();
        canon.sort();
        canon.dedup();
        QueryKey(canon)
    }

    pub fn params(&self) -> &[CanonParam] {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrackedKind {
    Added,
    Removed,
    Changed,
}

/// One tracked parameter resolved to its world-local bitflag.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TrackedBit {
    pub kind: TrackedKind,
    pub tracker: u32,
    pub bit: u32,
}

/// A pre-computed execution strategy for one canonical query.
///
/// Bitflags are resolved at build time; traits named by the query are
/// registered in the world before the plan is built, so every referenced bit
/// exists. Words beyond `and_mask.len()` are unconstrained -- a later stride
/// growth never invalidates a cached plan.
#[derive(Debug)]
pub(crate) struct QueryPlan {
    and_mask: Vec<u32>,
    and_value: Vec<u32>,
    /// One mask-per-word vector per `Any` group.
    or_groups: Vec<Vec<u32>>,
    pub tracked: Vec<TrackedBit>,
    static_false: bool,
}

impl QueryPlan {
    /// Build a plan from a canonical key. `bit_of` resolves a global trait id
    /// to its bitflag in the owning world; `excluded_bit` is folded in as an
    /// implicit `Not`.
    pub fn build(key: &QueryKey, bit_of: impl Fn(u32) -> u32, excluded_bit: u32) -> QueryPlan {
        let mut and_bits: Vec<(u32, bool)> = vec![(excluded_bit, false)];
        let mut group_bits: Vec<Vec<u32>> = Vec::new();
        let mut tracked = Vec::new();
        let mut static_false = false;

        for param in key.params() {
            match param {
                CanonParam::All(id) => and_bits.push((bit_of(*id), true)),
                CanonParam::Not(id) => and_bits.push((bit_of(*id), false)),
                CanonParam::Any(ids) => {
                    if ids.is_empty() {
                        static_false = true;
                    } else {
                        group_bits.push(ids.iter().map(|id| bit_of(*id)).collect());
                    }
                }
                CanonParam::Added(tracker, id) => tracked.push(TrackedBit {
                    kind: TrackedKind::Added,
                    tracker: *tracker,
                    bit: bit_of(*id),
                }),
                CanonParam::Removed(tracker, id) => tracked.push(TrackedBit {
                    kind: TrackedKind::Removed,
                    tracker: *tracker,
                    bit: bit_of(*id),
                }),
                CanonParam::Changed(tracker, id) => tracked.push(TrackedBit {
                    kind: TrackedKind::Changed,
                    tracker: *tracker,
                    bit: bit_of(*id),
                }),
            }
        }

        let max_bit = and_bits
            .iter()
            .map(|(bit, _)| *bit)
            .chain(group_bits.iter().flatten().copied())
            .max()
            .unwrap_or(0);
        let words = (max_bit / WORD_BITS) as usize + 1;

        let mut and_mask = vec![0u32; words];
        let mut and_value = vec![0u32; words];
        for (bit, required) in and_bits {
            let word = (bit / WORD_BITS) as usize;
            let mask = 1 << (bit % WORD_BITS);
            and_mask[word] |= mask;
            if required {
                and_value[word] |= mask;
            }
        }

        let or_groups = group_bits
            .into_iter()
            .map(|bits| {
                let mut group = vec![0u32; words];
                for bit in bits {
                    group[(bit / WORD_BITS) as usize] |= 1 << (bit % WORD_BITS);
                }
                group
            })
            .collect();

        QueryPlan {
            and_mask,
            and_value,
            or_groups,
            tracked,
            static_false,
        }
    }

    /// Whether the static predicate matches `row` of `masks`.
    pub fn matches_static(&self, masks: &MaskLayer, row: usize) -> bool {
        if self.static_false {
            return false;
        }
        for (word_index, (mask, value)) in
            self.and_mask.iter().zip(self.and_value.iter()).enumerate()
        {
            if masks.word(row, word_index) & mask != *value {
                return false;
            }
        }
        'groups: for group in &self.or_groups {
            for (word_index, mask) in group.iter().enumerate() {
                if masks.word(row, word_index) & mask != 0 {
                    continue 'groups;
                }
            }
            return false;
        }
        true
    }

    /// Whether every tracked condition holds for `row`.
    pub fn matches_tracked(
        &self,
        presence: &MaskLayer,
        trackers: &HashMap<u32, TrackingMasks>,
        row: usize,
    ) -> bool {
        self.tracked.iter().all(|t| {
            let Some(masks) = trackers.get(&t.tracker) else {
                return false;
            };
            match t.kind {
                TrackedKind::Added => {
                    presence.get(row, t.bit) && !masks.snapshot.get(row, t.bit)
                }
                TrackedKind::Removed => {
                    !presence.get(row, t.bit) && masks.snapshot.get(row, t.bit)
                }
                TrackedKind::Changed => {
                    presence.get(row, t.bit) && masks.changed.get(row, t.bit)
                }
            }
        })
    }

    pub fn has_tracked(&self) -> bool {
        !self.tracked.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Cached state
// ---------------------------------------------------------------------------

/// Callback invoked on query membership deltas. Receives the world so that
/// subscribers may issue further mutations; those are buffered and flushed
/// after the current notification pass.
pub type QueryCallback = Box<dyn FnMut(&mut World, Entity, QueryEvent)>;

/// The cached state of one canonical query.
pub(crate) struct QueryState {
    pub plan: QueryPlan,
    /// Maintained set of live entities matching the static predicate.
    /// Ordered, so result snapshots are reproducible.
    pub result: BTreeSet<Entity>,
    /// Subscriber slots in registration order. `None` marks a slot whose
    /// callback is checked out for invocation or already unsubscribed.
    pub subscribers: Vec<(u64, Option<QueryCallback>)>,
}

impl QueryState {
    pub fn new(plan: QueryPlan) -> Self {
        Self {
            plan,
            result: BTreeSet::new(),
            subscribers: Vec::new(),
        }
    }
}

impl std::fmt::Debug for QueryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryState")
            .field("result_len", &self.result.len())
            .field("subscriber_count", &self.subscribers.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
