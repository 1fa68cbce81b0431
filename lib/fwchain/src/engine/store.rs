// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The rule store: the ordered rule array and its published
//! snapshots.
//!
//! Rules are immutable once published and shared between consecutive
//! snapshots by `Arc`. A snapshot is replaced wholesale — built
//! copy-on-write by the administrative path, then swapped in behind
//! an [`ArcSwap`] — so the packet path loads a complete, sorted view
//! with no lock and no torn state. A retired snapshot frees itself
//! (rules, counters and all) when the last reader's reference drops;
//! that reference counting is the engine's quiescence mechanism.

use crate::api::CounterSnap;
use crate::api::DEFAULT_RULE_NUM;
use arc_swap::ArcSwap;
use itertools::Itertools;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;

/// Per-rule hit accounting. Atomics, so the packet path updates and
/// the control plane clears without any lock or snapshot rebuild.
#[derive(Debug, Default)]
pub struct RuleCounters {
    pkts: AtomicU64,
    bytes: AtomicU64,
    last_match: AtomicU64,
    logged: AtomicU64,
}

impl RuleCounters {
    /// Record one matched packet of `bytes` length at `now` (seconds
    /// since epoch; the caller owns the clock).
    pub fn record_match(&self, bytes: u64, now: u64) {
        self.pkts.fetch_add(1, Relaxed);
        self.bytes.fetch_add(bytes, Relaxed);
        self.last_match.store(now, Relaxed);
    }

    /// Record that a match was logged.
    pub fn record_log(&self) {
        self.logged.fetch_add(1, Relaxed);
    }

    /// Reset counters; with `log_only` just the log counter.
    pub fn clear(&self, log_only: bool) {
        self.logged.store(0, Relaxed);
        if !log_only {
            self.pkts.store(0, Relaxed);
            self.bytes.store(0, Relaxed);
            self.last_match.store(0, Relaxed);
        }
    }

    pub fn snap(&self) -> CounterSnap {
        CounterSnap {
            pkts: self.pkts.load(Relaxed),
            bytes: self.bytes.load(Relaxed),
            last_match: self.last_match.load(Relaxed),
            logged: self.logged.load(Relaxed),
        }
    }
}

/// A committed rule. Immutable; a rule-set change that would alter a
/// rule (a set move, say) replaces it with a new `FwRule` sharing
/// the same counters.
#[derive(Debug)]
pub struct FwRule {
    pub num: u32,
    /// Commit stamp: strictly increasing across the chain's
    /// lifetime, the tie-breaker among equal rule numbers.
    pub id: u64,
    pub set: u8,
    /// Byte offset of the terminal action opcode within `insns`.
    pub action_offset: usize,
    /// The rewritten opcode stream; object references hold kidx
    /// values.
    pub insns: Box<[u8]>,
    /// Number of object-reference opcodes in `insns`, each holding
    /// one refcount on a named object.
    pub object_refs: u16,
    counters: Arc<RuleCounters>,
}

impl FwRule {
    pub fn new(
        num: u32,
        id: u64,
        set: u8,
        action_offset: usize,
        insns: Box<[u8]>,
        object_refs: u16,
    ) -> Self {
        Self {
            num,
            id,
            set,
            action_offset,
            insns,
            object_refs,
            counters: Arc::new(RuleCounters::default()),
        }
    }

    pub fn is_default(&self) -> bool {
        self.num == DEFAULT_RULE_NUM
    }

    pub fn counters(&self) -> &RuleCounters {
        &self.counters
    }

    /// The same rule relabeled into another set. Counters are
    /// shared: it is still the same rule to an observer.
    pub fn with_set(&self, set: u8) -> Self {
        Self {
            num: self.num,
            id: self.id,
            set,
            action_offset: self.action_offset,
            insns: self.insns.clone(),
            object_refs: self.object_refs,
            counters: Arc::clone(&self.counters),
        }
    }
}

/// One immutable, fully-sorted version of the rule set: the unit of
/// atomic publication to the packet path.
#[derive(Debug)]
pub struct RuleSnapshot {
    /// Generation, strictly increasing across publishes.
    pub r#gen: u64,
    /// Bit n set means rules in set n are administratively disabled;
    /// the packet path skips them.
    pub disabled_sets: u32,
    rules: Vec<Arc<FwRule>>,
    skipto: Option<Box<[u32]>>,
}

impl RuleSnapshot {
    /// Assemble a snapshot from already-sorted rules. The generation
    /// is assigned at publish.
    pub fn from_rules(
        rules: Vec<Arc<FwRule>>,
        with_skipto: bool,
        disabled_sets: u32,
    ) -> Self {
        let skipto = with_skipto.then(|| build_skipto(&rules));
        Self { r#gen: 0, disabled_sets, rules, skipto }
    }

    pub fn rules(&self) -> &[Arc<FwRule>] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn has_skipto(&self) -> bool {
        self.skipto.is_some()
    }

    pub fn set_enabled(&self, set: u8) -> bool {
        self.disabled_sets & (1 << set) == 0
    }

    /// First rule carrying exactly this number.
    pub fn lookup(&self, num: u32) -> Option<&Arc<FwRule>> {
        let idx = self.rules.partition_point(|r| r.num < num);
        self.rules.get(idx).filter(|r| r.num == num)
    }

    /// Position of the first rule numbered `>= num`: O(1) through
    /// the cache when present, a binary search otherwise. This is
    /// the skipto jump target resolution.
    pub fn skip_to(&self, num: u32) -> usize {
        match &self.skipto {
            Some(cache) => cache[num as usize] as usize,
            None => self.rules.partition_point(|r| r.num < num),
        }
    }

    /// The published-snapshot invariants. A violation here means the
    /// administrative path built a corrupt rule array; continuing
    /// would hand the packet path garbage.
    fn assert_well_formed(&self) {
        let default_rules =
            self.rules.iter().filter(|r| r.is_default()).count();
        assert_eq!(default_rules, 1, "exactly one default rule");
        assert!(
            self.rules.last().map(|r| r.is_default()).unwrap_or(false),
            "default rule must sort last",
        );
        assert!(
            self.rules
                .windows(2)
                .all(|w| (w[0].num, w[0].id) < (w[1].num, w[1].id)),
            "rules must be sorted by (num, id)",
        );
    }
}

/// `cache[n]` is the position of the first rule numbered `>= n`.
fn build_skipto(rules: &[Arc<FwRule>]) -> Box<[u32]> {
    let mut cache = vec![0u32; DEFAULT_RULE_NUM as usize + 1];
    let mut pos = 0usize;
    for (n, slot) in cache.iter_mut().enumerate() {
        while pos < rules.len() && (rules[pos].num as usize) < n {
            pos += 1;
        }
        *slot = pos as u32;
    }
    cache.into_boxed_slice()
}

/// Where a rule numbered `num` would be inserted: after every rule
/// with the same or a lower number.
pub fn find_insertion_point(rules: &[Arc<FwRule>], num: u32) -> usize {
    rules.partition_point(|r| r.num <= num)
}

/// Merge `current` with sorted `insertions`, dropping rules matched
/// by `deletions`. Pure: `current` is untouched; the result is the
/// candidate for the next publish. Returns the new rule vector and
/// the rules that fell out (the caller releases their object
/// references). The default rule never matches `deletions`.
pub fn build_next_rules(
    current: &RuleSnapshot,
    insertions: Vec<Arc<FwRule>>,
    mut deletions: impl FnMut(&FwRule) -> bool,
) -> (Vec<Arc<FwRule>>, Vec<Arc<FwRule>>) {
    debug_assert!(
        insertions.windows(2).all(|w| (w[0].num, w[0].id) <= (w[1].num, w[1].id))
    );

    let mut kept = Vec::with_capacity(current.len() + insertions.len());
    let mut removed = Vec::new();
    for rule in current.rules() {
        if !rule.is_default() && deletions(rule) {
            removed.push(Arc::clone(rule));
        } else {
            kept.push(Arc::clone(rule));
        }
    }

    let rules = kept
        .into_iter()
        .merge_by(insertions, |a, b| (a.num, a.id) <= (b.num, b.id))
        .collect();
    (rules, removed)
}

/// The live-snapshot holder: lock-free loads for the packet path,
/// a publish lock that only assigns the generation and swaps the
/// pointer.
#[derive(Debug)]
pub struct RuleStore {
    live: ArcSwap<RuleSnapshot>,
    r#gen: Mutex<u64>,
}

impl RuleStore {
    pub fn new(mut initial: RuleSnapshot) -> Self {
        initial.assert_well_formed();
        initial.r#gen = 1;
        Self {
            live: ArcSwap::from_pointee(initial),
            r#gen: Mutex::new(1),
        }
    }

    /// The packet path's entry point: no lock, always a complete
    /// snapshot.
    pub fn live(&self) -> Arc<RuleSnapshot> {
        self.live.load_full()
    }

    /// Publish a candidate snapshot. Cannot fail: by the time a
    /// candidate reaches here, every fallible step is behind us.
    pub fn publish(&self, mut snap: RuleSnapshot) -> u64 {
        snap.assert_well_formed();
        let mut r#gen = self.r#gen.lock().unwrap();
        *r#gen += 1;
        snap.r#gen = *r#gen;
        self.live.store(Arc::new(snap));
        *r#gen
    }
}
