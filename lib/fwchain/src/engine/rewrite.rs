// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Wiring candidate rules to named objects.
//!
//! A submitted rule names its objects through a logical index into
//! the batch's name table. Before the rule can be committed, every
//! such reference must be resolved to a live object — finding it,
//! creating it, or failing — and the opcode patched with the
//! object's kidx. The contract is rejected-or-fully-applied: on any
//! failure, every refcount bumped and every object created on behalf
//! of the batch is undone, in reverse order, before the error is
//! returned. Other administrative callers never observe a
//! half-rewritten batch.

use crate::api::FwError;
use crate::api::ObjName;
use crate::api::ObjType;
use crate::engine::chain::ChainState;
use crate::engine::opcode;
use crate::engine::opcode::OpcodeClassifier;
use crate::engine::opcode::RefSite;
use crate::engine::provider::ObjectFactory;
use crate::engine::store::FwRule;
use slog::Logger;
use slog::debug;
use std::sync::RwLock;

/// A rule in flight: validated structure, references not yet
/// resolved. `kidxs` runs parallel to `sites` and fills in as
/// resolution proceeds.
#[derive(Debug)]
pub(crate) struct Candidate {
    pub num: u32,
    pub set: u8,
    pub action_offset: usize,
    pub insns: Vec<u8>,
    pub sites: Vec<RefSite>,
    pub kidxs: Vec<Option<u32>>,
}

/// An unresolved reference carried between the resolve and create
/// passes.
struct Pending {
    cand: usize,
    site: usize,
    ty: ObjType,
    set: u8,
    name: String,
}

/// Resolve and patch every object reference in the batch, or undo
/// everything and return the first error.
///
/// The write guard is taken per pass, not across the whole call: the
/// factory may block in `create`, so the lock is dropped around it
/// and the name re-checked on retake (a concurrent writer may have
/// created the same object first — if so, its object wins and ours
/// is never inserted).
pub(crate) fn rewrite_batch(
    state: &RwLock<ChainState>,
    cands: &mut [Candidate],
    names: &[ObjName],
    classifier: &dyn OpcodeClassifier,
    factory: &dyn ObjectFactory,
    log: &Logger,
) -> Result<(), FwError> {
    // Every (ty, kidx) this batch has referenced so far, in order.
    let mut done: Vec<(ObjType, u32)> = Vec::new();
    let mut pending: Vec<Pending> = Vec::new();

    // Resolve pass: reference what already exists, queue what
    // doesn't. A reference to an existing object of the wrong type
    // fails the whole batch here.
    {
        let mut guard = state.write().unwrap();
        for (ci, cand) in cands.iter_mut().enumerate() {
            cand.kidxs = vec![None; cand.sites.len()];
            for (si, site) in cand.sites.iter().enumerate() {
                let name = match name_for(names, site) {
                    Ok(name) => name,
                    Err(e) => {
                        unwind(&mut guard, &done, factory, log);
                        return Err(e);
                    }
                };

                let oh = guard.objhash(site.ty);
                if let Some(kidx) = oh
                    .lookup_name_type(cand.set, site.ty, name)
                    .map(|o| o.kidx)
                {
                    guard.objhash_mut(site.ty).ref_object(kidx);
                    done.push((site.ty, kidx));
                    cand.kidxs[si] = Some(kidx);
                } else if let Some(have) =
                    oh.lookup_name(cand.set, name).map(|o| o.ty)
                {
                    let err = FwError::TypeMismatch {
                        name: name.to_string(),
                        want: site.ty,
                        have,
                    };
                    unwind(&mut guard, &done, factory, log);
                    return Err(err);
                } else {
                    pending.push(Pending {
                        cand: ci,
                        site: si,
                        ty: site.ty,
                        set: cand.set,
                        name: name.to_string(),
                    });
                }
            }
        }
    }

    // Create pass, lock dropped across each factory call.
    for p in &pending {
        if let Err(e) = factory.create(p.ty, p.set, &p.name) {
            let mut guard = state.write().unwrap();
            unwind(&mut guard, &done, factory, log);
            return Err(e);
        }

        let mut guard = state.write().unwrap();
        let raced = guard
            .objhash(p.ty)
            .lookup_name_type(p.set, p.ty, &p.name)
            .map(|o| o.kidx);
        let kidx = match raced {
            // Someone beat us to it while the lock was down; their
            // object wins and the factory's idempotent create did no
            // harm.
            Some(kidx) => kidx,
            None => {
                match guard.objhash_mut(p.ty).create(p.set, p.ty, &p.name)
                {
                    Ok(kidx) => kidx,
                    Err(e) => {
                        unwind(&mut guard, &done, factory, log);
                        factory.destroy(p.ty, p.set, &p.name);
                        return Err(e);
                    }
                }
            }
        };
        guard.objhash_mut(p.ty).ref_object(kidx);
        done.push((p.ty, kidx));
        cands[p.cand].kidxs[p.site] = Some(kidx);
    }

    // Patch pass: every site has a kidx now.
    for cand in cands.iter_mut() {
        for (site, kidx) in cand.sites.iter().zip(&cand.kidxs) {
            let kidx = kidx.expect("every site resolved");
            classifier.rewrite(&mut cand.insns, site.insn_off, kidx);
        }
    }
    Ok(())
}

/// Drop one reference for every object-reference opcode in a rule
/// leaving the rule set, reaping objects that hit zero.
pub(crate) fn release_rule_refs(
    state: &mut ChainState,
    rule: &FwRule,
    classifier: &dyn OpcodeClassifier,
    factory: &dyn ObjectFactory,
    log: &Logger,
) {
    for insn in opcode::iter(&rule.insns) {
        let insn = insn.expect("published rule stream is valid");
        let Some(info) = classifier.object_ref(&insn) else {
            continue;
        };
        let kidx =
            insn.ref_field().expect("published ref opcode has a field");
        if let Some(obj) =
            state.objhash_mut(info.ty).unref_and_maybe_remove(kidx)
        {
            debug!(log, "object destroyed";
                "type" => %obj.ty, "name" => %obj.name, "kidx" => obj.kidx);
            factory.destroy(info.ty, obj.set, &obj.name);
        }
    }
}

/// Undo reference bumps in reverse order, destroying any object that
/// this batch alone kept alive.
fn unwind(
    state: &mut ChainState,
    done: &[(ObjType, u32)],
    factory: &dyn ObjectFactory,
    log: &Logger,
) {
    for (ty, kidx) in done.iter().rev() {
        if let Some(obj) =
            state.objhash_mut(*ty).unref_and_maybe_remove(*kidx)
        {
            debug!(log, "unwound object";
                "type" => %obj.ty, "name" => %obj.name, "kidx" => obj.kidx);
            factory.destroy(*ty, obj.set, &obj.name);
        }
    }
}

fn name_for<'a>(
    names: &'a [ObjName],
    site: &RefSite,
) -> Result<&'a str, FwError> {
    names
        .iter()
        .find(|n| n.idx == site.logical && n.ty == site.ty)
        .map(|n| n.name.as_str())
        .ok_or_else(|| {
            FwError::BadName(format!(
                "no name-table entry for {} index {}",
                site.ty, site.logical,
            ))
        })
}
