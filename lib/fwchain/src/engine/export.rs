// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Read-only export of the rule set and object tables.
//!
//! A dump reflects exactly one snapshot: rules come out in the order
//! the packet path sees them, and the object tables are read in the
//! same critical section, so concurrent rule changes can land before
//! or after a dump but never inside one.

use crate::api::DumpResp;
use crate::api::RuleRecord;
use crate::api::RuleSelector;
use crate::engine::chain::FwChain;

pub(crate) fn dump(
    chain: &FwChain,
    sel: &RuleSelector,
    include_counters: bool,
    include_objects: bool,
) -> DumpResp {
    // The admin guard comes first, then the snapshot load. A writer
    // publishes while holding the write guard, so the pair below is
    // one consistent view.
    let st = chain.state().read().unwrap();
    let snap = chain.store().live();

    let rules = snap
        .rules()
        .iter()
        .filter(|r| sel.covers(r.num, r.set))
        .map(|r| RuleRecord {
            num: r.num,
            id: r.id,
            set: r.set,
            action_offset: r.action_offset as u32,
            insns: r.insns.to_vec(),
            counters: include_counters.then(|| r.counters().snap()),
        })
        .collect();

    let objects =
        if include_objects { st.object_records() } else { Vec::new() };

    DumpResp {
        r#gen: snap.r#gen,
        disabled_sets: snap.disabled_sets,
        rules,
        objects,
    }
}
