//! Score-ordered member set.
//!
//! A sorted set keeps unique string members, each carrying an `f64`
//! score. Iteration order is `(score, member)`: score ties fall back
//! to byte-wise member comparison, which is what the wire protocol
//! promises for rank queries.
//!
//! Two indexes back every set: a `BTreeMap` keyed on
//! `(OrderedFloat<f64>, String)` that owns the ordering, and a
//! member→score `HashMap` for constant-time score lookups. Keeping
//! both in sync is cheaper and less error-prone than maintaining a
//! skip list by hand.

use std::collections::{BTreeMap, HashMap};

use ordered_float::OrderedFloat;
use rand::seq::IteratorRandom;

/// Behavior switches for ZADD-style insertion.
///
/// The caller validates combinations up front: NX cannot be combined
/// with XX or with GT/LT, and GT excludes LT.
#[derive(Debug, Clone, Default)]
pub struct ZAddFlags {
    /// Insert missing members only; never touch an existing score.
    pub nx: bool,
    /// Update existing members only; never insert.
    pub xx: bool,
    /// Apply an update only when it raises the score.
    pub gt: bool,
    /// Apply an update only when it lowers the score.
    pub lt: bool,
    /// Count updates as well as inserts in the client-facing total.
    pub ch: bool,
}

/// What one insertion attempt did to the set.
#[derive(Debug, Clone, Copy)]
pub struct AddResult {
    /// A member that wasn't present before is now in the set.
    pub added: bool,
    /// A present member's score moved.
    pub updated: bool,
}

impl AddResult {
    /// The flags (or an equal score) suppressed the operation.
    pub const UNCHANGED: Self = Self {
        added: false,
        updated: false,
    };
}

/// One endpoint of a score range. `exclusive` corresponds to the `(`
/// prefix in the wire syntax.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBound {
    pub value: f64,
    pub exclusive: bool,
}

impl ScoreBound {
    pub fn inclusive(value: f64) -> Self {
        Self {
            value,
            exclusive: false,
        }
    }

    pub fn exclusive(value: f64) -> Self {
        Self {
            value,
            exclusive: true,
        }
    }

    fn admits_lower(&self, score: f64) -> bool {
        if self.exclusive {
            score > self.value
        } else {
            score >= self.value
        }
    }

    fn admits_upper(&self, score: f64) -> bool {
        if self.exclusive {
            score < self.value
        } else {
            score <= self.value
        }
    }
}

/// A min/max score window for ZCOUNT / ZRANGEBYSCORE / ZREMRANGEBYSCORE.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreRange {
    pub min: ScoreBound,
    pub max: ScoreBound,
}

impl ScoreRange {
    pub fn contains(&self, score: f64) -> bool {
        self.min.admits_lower(score) && self.max.admits_upper(score)
    }
}

/// One endpoint of a lexicographic range (`-`, `+`, `[member`, `(member`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LexBound {
    NegInfinity,
    PosInfinity,
    Inclusive(String),
    Exclusive(String),
}

/// A lexicographic window for ZLEXCOUNT / ZREMRANGEBYLEX. Only
/// meaningful when all members share a score, per Redis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexRange {
    pub min: LexBound,
    pub max: LexBound,
}

impl LexRange {
    pub fn contains(&self, member: &str) -> bool {
        let lower_ok = match &self.min {
            LexBound::NegInfinity => true,
            LexBound::PosInfinity => false,
            LexBound::Inclusive(m) => member >= m.as_str(),
            LexBound::Exclusive(m) => member > m.as_str(),
        };
        let upper_ok = match &self.max {
            LexBound::NegInfinity => false,
            LexBound::PosInfinity => true,
            LexBound::Inclusive(m) => member <= m.as_str(),
            LexBound::Exclusive(m) => member < m.as_str(),
        };
        lower_ok && upper_ok
    }
}

/// Decides whether an update from `current` to `next` may go through
/// under the given flags. Equal scores are always a no-op.
fn update_permitted(flags: &ZAddFlags, current: OrderedFloat<f64>, next: OrderedFloat<f64>) -> bool {
    if flags.nx || next == current {
        return false;
    }
    if flags.gt {
        return next > current;
    }
    if flags.lt {
        return next < current;
    }
    true
}

/// A set of unique string members ordered by `(score, member)`.
/// Rank 0 is the lowest-scoring member.
#[derive(Debug, Clone, Default)]
pub struct SortedSet {
    /// The `(score, member)` ordering; values are unit.
    ordered: BTreeMap<(OrderedFloat<f64>, String), ()>,
    /// member → score lookup index.
    index: HashMap<String, OrderedFloat<f64>>,
}

impl SortedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconditional insert-or-update.
    pub fn add(&mut self, member: String, score: f64) -> AddResult {
        self.add_with_flags(member, score, &ZAddFlags::default())
    }

    /// Insert-or-update with ZADD flag semantics.
    pub fn add_with_flags(&mut self, member: String, score: f64, flags: &ZAddFlags) -> AddResult {
        let next = OrderedFloat(score);
        match self.index.get(&member).copied() {
            Some(current) => {
                if !update_permitted(flags, current, next) {
                    return AddResult::UNCHANGED;
                }
                self.reposition(member, current, next);
                AddResult {
                    added: false,
                    updated: true,
                }
            }
            None if flags.xx => AddResult::UNCHANGED,
            None => {
                self.place(member, next);
                AddResult {
                    added: true,
                    updated: false,
                }
            }
        }
    }

    /// Increments a member's score by `delta`, creating it at `delta`
    /// when absent. NX/XX gate creation/update; GT/LT gate the result.
    /// Returns the new score, or `None` when the flags suppressed the
    /// operation.
    pub fn incr(&mut self, member: &str, delta: f64, flags: &ZAddFlags) -> Option<f64> {
        match self.index.get(member).copied() {
            Some(current) => {
                if flags.nx {
                    return None;
                }
                let next = OrderedFloat(current.0 + delta);
                if (flags.gt && next <= current) || (flags.lt && next >= current) {
                    return None;
                }
                self.reposition(member.to_owned(), current, next);
                Some(next.0)
            }
            None => {
                if flags.xx {
                    return None;
                }
                self.place(member.to_owned(), OrderedFloat(delta));
                Some(delta)
            }
        }
    }

    /// Puts a member the index doesn't know about into both structures.
    fn place(&mut self, member: String, score: OrderedFloat<f64>) {
        self.index.insert(member.clone(), score);
        self.ordered.insert((score, member), ());
    }

    /// Moves an existing member from its old ordering position to the
    /// new one and refreshes the index.
    fn reposition(&mut self, member: String, old: OrderedFloat<f64>, new: OrderedFloat<f64>) {
        self.ordered.remove(&(old, member.clone()));
        self.index.insert(member.clone(), new);
        self.ordered.insert((new, member), ());
    }

    /// Drops a member. Returns `true` if it was present.
    pub fn remove(&mut self, member: &str) -> bool {
        match self.index.remove(member) {
            Some(score) => {
                self.ordered.remove(&(score, member.to_owned()));
                true
            }
            None => false,
        }
    }

    /// The member's score, when present.
    pub fn score(&self, member: &str) -> Option<f64> {
        self.index.get(member).map(|s| s.0)
    }

    /// Membership test.
    pub fn contains(&self, member: &str) -> bool {
        self.index.contains_key(member)
    }

    /// The member's 0-based position in score order, when present.
    ///
    /// Walks the ordering from the front, so this is O(n). Fine for
    /// the set sizes we expect; rank-annotated tree nodes would bring
    /// it down to O(log n) if it ever shows up in profiles.
    pub fn rank(&self, member: &str) -> Option<usize> {
        let score = *self.index.get(member)?;
        self.ordered
            .keys()
            .position(|(s, m)| *s == score && m.as_str() == member)
    }

    /// Members between two ranks, inclusive, with negative indices
    /// counting back from the end.
    pub fn range_by_rank(&self, start: i64, stop: i64) -> Vec<(&str, f64)> {
        let (lo, hi) = super::normalize_range(start, stop, self.ordered.len() as i64);
        if lo > hi {
            return Vec::new();
        }
        self.ordered
            .keys()
            .take(hi as usize + 1)
            .skip(lo as usize)
            .map(|(score, member)| (member.as_str(), score.0))
            .collect()
    }

    /// Returns members whose scores fall within the range, in order.
    pub fn range_by_score(&self, range: &ScoreRange) -> Vec<(&str, f64)> {
        self.ordered
            .keys()
            .filter(|(score, _)| range.contains(score.0))
            .map(|(score, member)| (member.as_str(), score.0))
            .collect()
    }

    /// Counts members whose scores fall within the range.
    pub fn count_by_score(&self, range: &ScoreRange) -> usize {
        self.ordered
            .keys()
            .filter(|(score, _)| range.contains(score.0))
            .count()
    }

    /// Counts members whose names fall within the lex range.
    pub fn count_by_lex(&self, range: &LexRange) -> usize {
        self.ordered
            .keys()
            .filter(|(_, member)| range.contains(member))
            .count()
    }

    /// Removes and returns up to `count` members with the lowest scores.
    pub fn pop_min(&mut self, count: usize) -> Vec<(String, f64)> {
        let victims: Vec<(OrderedFloat<f64>, String)> =
            self.ordered.keys().take(count).cloned().collect();
        self.remove_entries(victims)
    }

    /// Removes and returns up to `count` members with the highest scores.
    /// Results are ordered highest-first, matching ZPOPMAX.
    pub fn pop_max(&mut self, count: usize) -> Vec<(String, f64)> {
        let victims: Vec<(OrderedFloat<f64>, String)> =
            self.ordered.keys().rev().take(count).cloned().collect();
        self.remove_entries(victims)
    }

    fn remove_entries(&mut self, victims: Vec<(OrderedFloat<f64>, String)>) -> Vec<(String, f64)> {
        victims
            .into_iter()
            .map(|(score, member)| {
                self.ordered.remove(&(score, member.clone()));
                self.index.remove(&member);
                (member, score.0)
            })
            .collect()
    }

    /// Removes members in a rank range (negative indices allowed).
    /// Returns the number removed.
    pub fn remove_range_by_rank(&mut self, start: i64, stop: i64) -> usize {
        let victims: Vec<String> = self
            .range_by_rank(start, stop)
            .into_iter()
            .map(|(m, _)| m.to_owned())
            .collect();
        for member in &victims {
            self.remove(member);
        }
        victims.len()
    }

    /// Removes members whose scores fall within the range. Returns the
    /// number removed.
    pub fn remove_range_by_score(&mut self, range: &ScoreRange) -> usize {
        let victims: Vec<String> = self
            .range_by_score(range)
            .into_iter()
            .map(|(m, _)| m.to_owned())
            .collect();
        for member in &victims {
            self.remove(member);
        }
        victims.len()
    }

    /// Removes members whose names fall within the lex range. Returns
    /// the number removed.
    pub fn remove_range_by_lex(&mut self, range: &LexRange) -> usize {
        let victims: Vec<String> = self
            .ordered
            .keys()
            .filter(|(_, member)| range.contains(member))
            .map(|(_, member)| member.clone())
            .collect();
        for member in &victims {
            self.remove(member);
        }
        victims.len()
    }

    /// Returns up to `count` distinct members chosen uniformly at random.
    pub fn random_members(&self, count: usize) -> Vec<(&str, f64)> {
        let mut rng = rand::rng();
        self.ordered
            .keys()
            .choose_multiple(&mut rng, count)
            .into_iter()
            .map(|(score, member)| (member.as_str(), score.0))
            .collect()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the set holds no members.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Iterates `(member, score)` pairs in score order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.ordered
            .keys()
            .map(|(score, member)| (member.as_str(), score.0))
    }

    /// Rough heap cost of this set, for the memory tracker. Folds the
    /// per-member estimate over the index; exactness doesn't matter
    /// here, only that growth is monotone in content size.
    pub fn memory_usage(&self) -> usize {
        self.index
            .keys()
            .fold(Self::BASE_OVERHEAD, |total, member| {
                total + Self::estimated_member_cost(member)
            })
    }

    /// Fixed cost of the two empty index structures.
    pub const BASE_OVERHEAD: usize = 72;

    /// Rough cost of one member: the name is stored twice (once per
    /// index), each index charges node overhead for the entry, and the
    /// score is one word.
    pub fn estimated_member_cost(member: &str) -> usize {
        const ORDERED_NODE: usize = 64;
        const INDEX_NODE: usize = 56;
        member.len() * 2 + ORDERED_NODE + INDEX_NODE + 8
    }
}
