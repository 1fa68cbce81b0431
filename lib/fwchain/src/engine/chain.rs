// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The rule chain: the administrative surface over one rule set.
//!
//! A [`FwChain`] owns everything: the live snapshot, both
//! named-object tables, the locks, and the collaborator hooks. It is
//! constructed once and shared; there are no hidden statics.
//!
//! Two lock tiers back the contract in the crate docs. The admin
//! `RwLock` serializes control-plane writers and may be held across
//! blocking work; the publish lock inside [`RuleStore`] is held only
//! to stamp a generation and swap the snapshot pointer. The packet
//! path takes neither: [`FwChain::live`] is a lock-free load, and
//! rule counters are atomics.

use crate::api::AUTOSTEP_DEFAULT;
use crate::api::AUTOSTEP_MAX;
use crate::api::AUTOSTEP_MIN;
use crate::api::ClearCountersResp;
use crate::api::DEFAULT_RULE_NUM;
use crate::api::DeleteRulesResp;
use crate::api::DumpResp;
use crate::api::FwError;
use crate::api::MAX_SETS;
use crate::api::ObjType;
use crate::api::ObjectRecord;
use crate::api::RESERVED_SET;
use crate::api::RuleSelector;
use crate::api::SelectorFlags;
use crate::api::SetCmd;
use crate::api::SubmitRulesReq;
use crate::api::SubmitRulesResp;
use crate::engine::export;
use crate::engine::objhash;
use crate::engine::objhash::ObjHash;
use crate::engine::opcode;
use crate::engine::opcode::OpcodeClassifier;
use crate::engine::opcode::StdClassifier;
use crate::engine::opcode::op;
use crate::engine::provider::DynStateOps;
use crate::engine::provider::NoDynState;
use crate::engine::provider::NullFactory;
use crate::engine::provider::ObjectFactory;
use crate::engine::rewrite;
use crate::engine::rewrite::Candidate;
use crate::engine::store;
use crate::engine::store::FwRule;
use crate::engine::store::RuleSnapshot;
use crate::engine::store::RuleStore;
use slog::Logger;
use slog::info;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;

/// Hard ceiling on the rule count; a batch that would push past it
/// is refused outright.
pub const MAX_RULES: usize = 1 << 20;

/// What the default rule does to a packet nothing else matched.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DefaultAction {
    Accept,
    Deny,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// kidx capacity of the table-object instance.
    pub table_capacity: u32,
    /// kidx capacity of the generic-object instance.
    pub object_capacity: u32,
    /// Auto-number spacing; clamped to the supported range.
    pub autostep: u32,
    /// Build the skipto cache on every publish.
    pub skipto_cache: bool,
    pub default_action: DefaultAction,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            table_capacity: 4096,
            object_capacity: 4096,
            autostep: AUTOSTEP_DEFAULT,
            skipto_cache: true,
            default_action: DefaultAction::Deny,
        }
    }
}

/// Everything guarded by the admin lock.
pub(crate) struct ChainState {
    /// Address/port table objects: their own kidx space.
    tables: ObjHash,
    /// Everything else (counters, external actions): a second,
    /// independent kidx space.
    objects: ObjHash,
    pub(crate) autostep: u32,
    pub(crate) next_rule_id: u64,
    pub(crate) disabled_sets: u32,
}

impl ChainState {
    pub(crate) fn new(table_capacity: u32, object_capacity: u32) -> Self {
        Self {
            tables: ObjHash::new(table_capacity),
            objects: ObjHash::new(object_capacity),
            autostep: AUTOSTEP_DEFAULT,
            // The default rule is id 1.
            next_rule_id: 2,
            disabled_sets: 0,
        }
    }

    pub(crate) fn objhash(&self, ty: ObjType) -> &ObjHash {
        if ty == ObjType::TABLE { &self.tables } else { &self.objects }
    }

    pub(crate) fn objhash_mut(&mut self, ty: ObjType) -> &mut ObjHash {
        if ty == ObjType::TABLE {
            &mut self.tables
        } else {
            &mut self.objects
        }
    }

    /// Every named object across both instances, sorted by kidx
    /// within each.
    pub(crate) fn object_records(&self) -> Vec<ObjectRecord> {
        let mut records = self.tables.records();
        records.extend(self.objects.records());
        records
    }
}

pub struct FwChain {
    state: RwLock<ChainState>,
    store: RuleStore,
    skipto_enabled: AtomicBool,
    classifier: Box<dyn OpcodeClassifier>,
    factory: Box<dyn ObjectFactory>,
    dyn_state: Box<dyn DynStateOps>,
    log: Logger,
}

impl FwChain {
    pub fn new(cfg: Config, log: Logger) -> Self {
        let action = match cfg.default_action {
            DefaultAction::Accept => op::ACCEPT,
            DefaultAction::Deny => op::DENY,
        };
        let insns = opcode::build::insn(action, 0).into_boxed_slice();
        let default_rule = Arc::new(FwRule::new(
            DEFAULT_RULE_NUM,
            1,
            RESERVED_SET,
            0,
            insns,
            0,
        ));
        let snap = RuleSnapshot::from_rules(
            vec![default_rule],
            cfg.skipto_cache,
            0,
        );

        let mut state =
            ChainState::new(cfg.table_capacity, cfg.object_capacity);
        state.autostep =
            cfg.autostep.clamp(AUTOSTEP_MIN, AUTOSTEP_MAX);

        Self {
            state: RwLock::new(state),
            store: RuleStore::new(snap),
            skipto_enabled: AtomicBool::new(cfg.skipto_cache),
            classifier: Box::new(StdClassifier),
            factory: Box::new(NullFactory),
            dyn_state: Box::new(NoDynState),
            log,
        }
    }

    pub fn with_classifier(
        mut self,
        classifier: impl OpcodeClassifier + 'static,
    ) -> Self {
        self.classifier = Box::new(classifier);
        self
    }

    pub fn with_factory(
        mut self,
        factory: impl ObjectFactory + 'static,
    ) -> Self {
        self.factory = Box::new(factory);
        self
    }

    pub fn with_dyn_state(
        mut self,
        dyn_state: impl DynStateOps + 'static,
    ) -> Self {
        self.dyn_state = Box::new(dyn_state);
        self
    }

    /// The packet path's view. Lock-free; the returned snapshot is
    /// complete, sorted, and stays whole for as long as the caller
    /// holds it, however many publishes happen meanwhile.
    pub fn live(&self) -> Arc<RuleSnapshot> {
        self.store.live()
    }

    /// Validate, resolve, and commit a batch of rules atomically.
    ///
    /// Either every rule in the batch becomes visible in one publish,
    /// or none do and no refcount moved. Returns the final rule
    /// numbers in batch order.
    pub fn submit_rules(
        &self,
        req: &SubmitRulesReq,
    ) -> Result<SubmitRulesResp, FwError> {
        if req.rules.is_empty() {
            return Err(FwError::EmptyBatch);
        }
        for name in &req.names {
            if !objhash::valid_name(&name.name) {
                return Err(FwError::BadName(name.name.clone()));
            }
        }

        // Structural validation of the whole batch before any shared
        // state is touched.
        let mut cands = Vec::with_capacity(req.rules.len());
        let mut last_explicit = 0u32;
        for raw in &req.rules {
            if raw.num != 0 {
                if raw.num >= DEFAULT_RULE_NUM {
                    return Err(FwError::BadRuleNumber(raw.num));
                }
                if raw.num < last_explicit {
                    return Err(FwError::UnsortedBatch);
                }
                last_explicit = raw.num;
            }
            if raw.set >= MAX_SETS || raw.set == RESERVED_SET {
                return Err(FwError::BadSet(raw.set));
            }
            let action_offset = raw.action_offset as usize;
            let sites = opcode::validate(
                &raw.insns,
                action_offset,
                self.classifier.as_ref(),
            )?;
            cands.push(Candidate {
                num: raw.num,
                set: raw.set,
                action_offset,
                insns: raw.insns.clone(),
                sites,
                kidxs: Vec::new(),
            });
        }

        let total = self.store.live().len() + cands.len();
        if total > MAX_RULES {
            return Err(FwError::TooManyRules(total));
        }

        // Resolve object references for all rules, all-or-nothing.
        rewrite::rewrite_batch(
            &self.state,
            &mut cands,
            &req.names,
            self.classifier.as_ref(),
            self.factory.as_ref(),
            &self.log,
        )?;

        // Commit. Nothing can fail from here on.
        let mut st = self.state.write().unwrap();
        let live = self.store.live();
        let mut base = live
            .rules()
            .iter()
            .rev()
            .find(|r| !r.is_default())
            .map(|r| r.num)
            .unwrap_or(0);
        let step = st.autostep;

        let mut assigned = Vec::with_capacity(cands.len());
        let mut insertions = Vec::with_capacity(cands.len());
        for mut cand in cands {
            if cand.num == 0 {
                cand.num = base
                    .saturating_add(step)
                    .min(DEFAULT_RULE_NUM - 1);
            }
            base = base.max(cand.num);
            assigned.push(cand.num);

            let id = st.next_rule_id;
            st.next_rule_id += 1;
            let object_refs = cand.sites.len() as u16;
            insertions.push(Arc::new(FwRule::new(
                cand.num,
                id,
                cand.set,
                cand.action_offset,
                cand.insns.into_boxed_slice(),
                object_refs,
            )));
        }
        // Auto-numbered entries can land below an earlier explicit
        // number; the merge wants its input sorted.
        insertions.sort_by_key(|r| (r.num, r.id));

        let (rules, removed) =
            store::build_next_rules(&live, insertions, |_| false);
        debug_assert!(removed.is_empty());
        let snap = RuleSnapshot::from_rules(
            rules,
            self.skipto_enabled.load(Relaxed),
            st.disabled_sets,
        );
        let r#gen = self.store.publish(snap);
        info!(self.log, "rules added";
            "count" => assigned.len(), "gen" => r#gen);
        Ok(SubmitRulesResp { assigned })
    }

    /// Delete every static rule the selector matches, or with
    /// `DYNAMIC_ONLY` expire matching connection state and touch no
    /// static rule. The default rule never matches; a broad flush
    /// spares the reserved set unless forced.
    pub fn delete_rules(
        &self,
        sel: &RuleSelector,
    ) -> Result<DeleteRulesResp, FwError> {
        Self::check_selector(sel, false)?;

        if sel.flags.contains(SelectorFlags::DYNAMIC_ONLY) {
            let count = self.dyn_state.expire(sel);
            return Ok(DeleteRulesResp { count });
        }

        let mut st = self.state.write().unwrap();
        let live = self.store.live();
        let spare_reserved = sel.is_broad()
            && !sel.flags.contains(SelectorFlags::FORCE);
        let (rules, removed) =
            store::build_next_rules(&live, vec![], |r| {
                if spare_reserved && r.set == RESERVED_SET {
                    return false;
                }
                sel.covers(r.num, r.set)
            });
        if removed.is_empty() {
            // Deleting one specific rule that isn't there is an
            // error; an empty range or set match is just a zero.
            if let Some((lo, hi)) = sel.range {
                if lo == hi {
                    return Err(FwError::RuleNotFound(lo));
                }
            }
            return Ok(DeleteRulesResp { count: 0 });
        }

        for rule in &removed {
            rewrite::release_rule_refs(
                &mut st,
                rule,
                self.classifier.as_ref(),
                self.factory.as_ref(),
                &self.log,
            );
        }
        let snap = RuleSnapshot::from_rules(
            rules,
            self.skipto_enabled.load(Relaxed),
            st.disabled_sets,
        );
        let r#gen = self.store.publish(snap);
        info!(self.log, "rules deleted";
            "count" => removed.len(), "gen" => r#gen);
        Ok(DeleteRulesResp { count: removed.len() as u32 })
    }

    /// Relabel or exchange two sets — rules and their objects in one
    /// atomic publish. On any conflict nothing mutates.
    pub fn move_or_swap_set(
        &self,
        from: u8,
        to: u8,
        cmd: SetCmd,
    ) -> Result<(), FwError> {
        for set in [from, to] {
            if set >= MAX_SETS || set == RESERVED_SET {
                return Err(FwError::BadSet(set));
            }
        }
        if from == to {
            return Ok(());
        }

        let mut st = self.state.write().unwrap();
        let live = self.store.live();
        match cmd {
            SetCmd::Move => {
                // Test both instances before mutating either.
                st.tables.test_sets(from, to)?;
                st.objects.test_sets(from, to)?;
                st.tables.move_sets(from, to).expect("conflicts tested");
                st.objects
                    .move_sets(from, to)
                    .expect("conflicts tested");
            }
            SetCmd::Swap => {
                st.tables.swap_sets(from, to);
                st.objects.swap_sets(from, to);
            }
        }

        let rules = live
            .rules()
            .iter()
            .map(|r| {
                if r.set == from {
                    Arc::new(r.with_set(to))
                } else if cmd == SetCmd::Swap && r.set == to {
                    Arc::new(r.with_set(from))
                } else {
                    Arc::clone(r)
                }
            })
            .collect();
        let snap = RuleSnapshot::from_rules(
            rules,
            self.skipto_enabled.load(Relaxed),
            st.disabled_sets,
        );
        let r#gen = self.store.publish(snap);
        info!(self.log, "sets changed";
            "cmd" => ?cmd, "from" => from, "to" => to, "gen" => r#gen);
        Ok(())
    }

    /// Reset counters on matching rules in place. No snapshot is
    /// rebuilt and no lock taken: counters are atomics and the live
    /// rules are reachable lock-free.
    pub fn clear_counters(
        &self,
        sel: &RuleSelector,
        log_only: bool,
    ) -> Result<ClearCountersResp, FwError> {
        Self::check_selector(sel, true)?;

        let live = self.store.live();
        let mut count = 0;
        for rule in live.rules() {
            if sel.covers(rule.num, rule.set) {
                rule.counters().clear(log_only);
                count += 1;
            }
        }
        if count == 0 {
            if let Some((lo, hi)) = sel.range {
                if lo == hi {
                    return Err(FwError::RuleNotFound(lo));
                }
            }
        }
        info!(self.log, "counters cleared";
            "count" => count, "log_only" => log_only);
        Ok(ClearCountersResp { count })
    }

    /// Atomically publish a new per-set disable mask. The reserved
    /// set stays enabled no matter what the mask says.
    pub fn set_disabled_sets(&self, mask: u32) {
        let mask = mask & !(1u32 << RESERVED_SET);
        let mut st = self.state.write().unwrap();
        if st.disabled_sets == mask {
            return;
        }
        st.disabled_sets = mask;
        let rules = self.store.live().rules().to_vec();
        let snap = RuleSnapshot::from_rules(
            rules,
            self.skipto_enabled.load(Relaxed),
            mask,
        );
        let r#gen = self.store.publish(snap);
        info!(self.log, "disabled sets changed";
            "mask" => format!("{mask:#010x}"), "gen" => r#gen);
    }

    /// Turn the skipto cache on or off. Idempotent: repeating the
    /// current state publishes nothing.
    pub fn enable_skipto_cache(&self, enabled: bool) {
        let st = self.state.write().unwrap();
        if self.skipto_enabled.swap(enabled, Relaxed) == enabled {
            return;
        }
        let rules = self.store.live().rules().to_vec();
        let snap =
            RuleSnapshot::from_rules(rules, enabled, st.disabled_sets);
        let r#gen = self.store.publish(snap);
        info!(self.log, "skipto cache toggled";
            "enabled" => enabled, "gen" => r#gen);
    }

    /// Adjust the auto-number spacing; returns the clamped value in
    /// effect.
    pub fn set_autonumber_step(&self, step: u32) -> u32 {
        let step = step.clamp(AUTOSTEP_MIN, AUTOSTEP_MAX);
        self.state.write().unwrap().autostep = step;
        step
    }

    /// Create a named object ahead of any rule referencing it. The
    /// object is pinned: it survives a reference count of zero until
    /// [`delete_object`].
    ///
    /// [`delete_object`]: Self::delete_object
    pub fn create_object(
        &self,
        ty: ObjType,
        set: u8,
        name: &str,
    ) -> Result<u32, FwError> {
        if set >= MAX_SETS || set == RESERVED_SET {
            return Err(FwError::BadSet(set));
        }
        if !objhash::valid_name(name) {
            return Err(FwError::BadName(name.to_string()));
        }
        let exists = {
            let st = self.state.read().unwrap();
            st.objhash(ty).lookup_name_type(set, ty, name).is_some()
        };
        if exists {
            return Err(FwError::ObjectExists {
                ty,
                name: name.to_string(),
                set,
            });
        }

        // Resource first, lock dropped: creation may block.
        self.factory.create(ty, set, name)?;

        let mut st = self.state.write().unwrap();
        if st.objhash(ty).lookup_name_type(set, ty, name).is_some() {
            // Lost a race; the idempotent create did no harm and the
            // winner keeps the resource.
            return Err(FwError::ObjectExists {
                ty,
                name: name.to_string(),
                set,
            });
        }
        let kidx = match st.objhash_mut(ty).create(set, ty, name) {
            Ok(kidx) => kidx,
            Err(e) => {
                self.factory.destroy(ty, set, name);
                return Err(e);
            }
        };
        st.objhash_mut(ty).pin(kidx);
        info!(self.log, "object created";
            "type" => %ty, "name" => name, "kidx" => kidx);
        Ok(kidx)
    }

    /// Drop the administrative pin on an object. Fails while any
    /// rule still references it; destroys it once nothing does.
    pub fn delete_object(
        &self,
        ty: ObjType,
        set: u8,
        name: &str,
    ) -> Result<(), FwError> {
        let mut st = self.state.write().unwrap();
        let Some((kidx, refcount)) = st
            .objhash(ty)
            .lookup_name_type(set, ty, name)
            .map(|o| (o.kidx, o.refcount()))
        else {
            return Err(FwError::ObjectNotFound {
                ty,
                name: name.to_string(),
                set,
            });
        };
        if refcount > 0 {
            return Err(FwError::ObjectBusy {
                ty,
                name: name.to_string(),
            });
        }
        if let Some(obj) =
            st.objhash_mut(ty).unpin_and_maybe_remove(kidx)
        {
            self.factory.destroy(ty, obj.set, &obj.name);
            info!(self.log, "object deleted";
                "type" => %ty, "name" => %obj.name);
        }
        Ok(())
    }

    /// A point-in-time view of one named object.
    pub fn object_record(
        &self,
        ty: ObjType,
        set: u8,
        name: &str,
    ) -> Option<ObjectRecord> {
        self.state
            .read()
            .unwrap()
            .objhash(ty)
            .lookup_name_type(set, ty, name)
            .map(|o| o.record())
    }

    /// Export matching rules (and optionally the object tables) from
    /// one consistent view. See [`export`].
    pub fn dump(
        &self,
        sel: &RuleSelector,
        include_counters: bool,
        include_objects: bool,
    ) -> DumpResp {
        export::dump(self, sel, include_counters, include_objects)
    }

    pub(crate) fn state(&self) -> &RwLock<ChainState> {
        &self.state
    }

    pub(crate) fn store(&self) -> &RuleStore {
        &self.store
    }

    fn check_selector(
        sel: &RuleSelector,
        allow_default: bool,
    ) -> Result<(), FwError> {
        if let Some(set) = sel.set {
            if set >= MAX_SETS {
                return Err(FwError::BadSet(set));
            }
        }
        if let Some((lo, hi)) = sel.range {
            if lo > hi {
                return Err(FwError::BadRuleNumber(lo));
            }
            let max = if allow_default {
                DEFAULT_RULE_NUM
            } else {
                DEFAULT_RULE_NUM - 1
            };
            if hi > max {
                return Err(FwError::BadRuleNumber(hi));
            }
        }
        Ok(())
    }
}
