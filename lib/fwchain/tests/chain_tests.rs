// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! End-to-end scenarios against a whole chain: rule lifecycle,
//! shared objects, set surgery, export round-trips, and concurrent
//! readers.

use fwchain::api::DEFAULT_RULE_NUM;
use fwchain::api::FwError;
use fwchain::api::ObjName;
use fwchain::api::ObjType;
use fwchain::api::RawRule;
use fwchain::api::RuleSelector;
use fwchain::api::SelectorFlags;
use fwchain::api::SetCmd;
use fwchain::api::SubmitRulesReq;
use fwchain::engine::Config;
use fwchain::engine::FwChain;
use fwchain::engine::opcode::build;
use fwchain::engine::opcode::op;
use fwchain::engine::provider::DynStateOps;
use slog::Logger;
use slog::o;
use std::sync::Arc;
use std::sync::Mutex;

fn chain() -> FwChain {
    FwChain::new(Config::default(), Logger::root(slog::Discard, o!()))
}

fn accept_rule(num: u32, set: u8) -> RawRule {
    RawRule {
        num,
        set,
        action_offset: 0,
        insns: build::insn(op::ACCEPT, 0),
    }
}

/// A rule matching against one named table, then accepting.
fn table_rule(num: u32, set: u8, logical: u32) -> RawRule {
    RawRule {
        num,
        set,
        action_offset: 8,
        insns: build::stream(&[
            build::insn_ref(op::TABLE_SRC, logical),
            build::insn(op::ACCEPT, 0),
        ]),
    }
}

fn table_names(entries: &[(u32, &str)]) -> Vec<ObjName> {
    entries
        .iter()
        .map(|(idx, name)| ObjName {
            idx: *idx,
            ty: ObjType::TABLE,
            name: name.to_string(),
        })
        .collect()
}

fn submit(rules: Vec<RawRule>) -> SubmitRulesReq {
    SubmitRulesReq { rules, names: Vec::new() }
}

fn live_nums(chain: &FwChain) -> Vec<u32> {
    chain.live().rules().iter().map(|r| r.num).collect()
}

#[test]
fn autonumber_then_delete_one() {
    let chain = chain();
    assert_eq!(live_nums(&chain), vec![DEFAULT_RULE_NUM]);

    // Two auto-numbered submissions land at 100 and 200.
    let resp = chain.submit_rules(&submit(vec![accept_rule(0, 0)])).unwrap();
    assert_eq!(resp.assigned, vec![100]);
    let resp = chain.submit_rules(&submit(vec![accept_rule(0, 0)])).unwrap();
    assert_eq!(resp.assigned, vec![200]);
    assert_eq!(live_nums(&chain), vec![100, 200, DEFAULT_RULE_NUM]);

    let resp = chain.delete_rules(&RuleSelector::range(100, 100)).unwrap();
    assert_eq!(resp.count, 1);
    assert_eq!(live_nums(&chain), vec![200, DEFAULT_RULE_NUM]);
}

#[test]
fn snapshot_stays_sorted_through_churn() {
    let chain = chain();
    chain
        .submit_rules(&submit(vec![
            accept_rule(500, 1),
            accept_rule(500, 2),
            accept_rule(900, 0),
        ]))
        .unwrap();
    chain.submit_rules(&submit(vec![accept_rule(250, 0)])).unwrap();
    chain.delete_rules(&RuleSelector::range(500, 500)).unwrap();
    chain.submit_rules(&submit(vec![accept_rule(0, 0)])).unwrap();

    let live = chain.live();
    let keys: Vec<(u32, u64)> =
        live.rules().iter().map(|r| (r.num, r.id)).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);

    // Exactly one default rule, always last.
    let defaults: Vec<usize> = live
        .rules()
        .iter()
        .enumerate()
        .filter(|(_, r)| r.num == DEFAULT_RULE_NUM)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(defaults, vec![live.len() - 1]);
}

#[test]
fn shared_object_refcount_lifecycle() {
    let chain = chain();
    let names = table_names(&[(1, "blocklist")]);

    // First import creates the table.
    chain
        .submit_rules(&SubmitRulesReq {
            rules: vec![table_rule(100, 0, 1)],
            names: names.clone(),
        })
        .unwrap();
    let rec = chain.object_record(ObjType::TABLE, 0, "blocklist").unwrap();
    assert_eq!(rec.refcount, 1);
    let kidx = rec.kidx;

    // Second import finds it and bumps the count.
    chain
        .submit_rules(&SubmitRulesReq {
            rules: vec![table_rule(200, 0, 1)],
            names,
        })
        .unwrap();
    let rec = chain.object_record(ObjType::TABLE, 0, "blocklist").unwrap();
    assert_eq!(rec.refcount, 2);
    assert_eq!(rec.kidx, kidx, "the same object is shared");

    // Deleting one rule leaves the object; deleting the last
    // destroys it.
    chain.delete_rules(&RuleSelector::range(100, 100)).unwrap();
    let rec = chain.object_record(ObjType::TABLE, 0, "blocklist").unwrap();
    assert_eq!(rec.refcount, 1);

    chain.delete_rules(&RuleSelector::range(200, 200)).unwrap();
    assert!(chain.object_record(ObjType::TABLE, 0, "blocklist").is_none());
}

#[test]
fn submit_is_all_or_nothing() {
    let chain = chain();
    // "clash" exists as a counter; the batch's second rule wants an
    // ext-action of the same name, which must fail the whole batch.
    chain.create_object(ObjType::COUNTER, 0, "clash").unwrap();

    let req = SubmitRulesReq {
        rules: vec![
            table_rule(100, 0, 1),
            RawRule {
                num: 200,
                set: 0,
                action_offset: 0,
                insns: build::insn_ref(op::EXT_ACT, 2),
            },
        ],
        names: vec![
            ObjName {
                idx: 1,
                ty: ObjType::TABLE,
                name: "fresh".to_string(),
            },
            ObjName {
                idx: 2,
                ty: ObjType::EXT_ACTION,
                name: "clash".to_string(),
            },
        ],
    };
    let err = chain.submit_rules(&req).unwrap_err();
    assert!(matches!(err, FwError::TypeMismatch { .. }));

    // No rule landed, no object appeared, no refcount moved.
    assert_eq!(live_nums(&chain), vec![DEFAULT_RULE_NUM]);
    assert!(chain.object_record(ObjType::TABLE, 0, "fresh").is_none());
    let rec = chain.object_record(ObjType::COUNTER, 0, "clash").unwrap();
    assert_eq!(rec.refcount, 0);
    assert_eq!(rec.use_count, 1);
}

#[test]
fn move_set_conflict_mutates_nothing() {
    let chain = chain();
    chain
        .submit_rules(&SubmitRulesReq {
            rules: vec![table_rule(100, 1, 1)],
            names: table_names(&[(1, "blocklist")]),
        })
        .unwrap();
    chain
        .submit_rules(&SubmitRulesReq {
            rules: vec![table_rule(200, 2, 1)],
            names: table_names(&[(1, "blocklist")]),
        })
        .unwrap();

    let err = chain.move_or_swap_set(1, 2, SetCmd::Move).unwrap_err();
    assert!(matches!(err, FwError::SetConflict { .. }));

    // Both sets' rules and objects are exactly as they were.
    let live = chain.live();
    assert_eq!(live.rules()[0].set, 1);
    assert_eq!(live.rules()[1].set, 2);
    assert!(chain.object_record(ObjType::TABLE, 1, "blocklist").is_some());
    assert!(chain.object_record(ObjType::TABLE, 2, "blocklist").is_some());
}

#[test]
fn move_and_swap_sets_carry_objects() {
    let chain = chain();
    chain
        .submit_rules(&SubmitRulesReq {
            rules: vec![table_rule(100, 1, 1)],
            names: table_names(&[(1, "alpha")]),
        })
        .unwrap();
    chain
        .submit_rules(&SubmitRulesReq {
            rules: vec![table_rule(200, 2, 1)],
            names: table_names(&[(1, "beta")]),
        })
        .unwrap();

    chain.move_or_swap_set(1, 3, SetCmd::Move).unwrap();
    assert_eq!(chain.live().rules()[0].set, 3);
    assert!(chain.object_record(ObjType::TABLE, 3, "alpha").is_some());
    assert!(chain.object_record(ObjType::TABLE, 1, "alpha").is_none());

    chain.move_or_swap_set(2, 3, SetCmd::Swap).unwrap();
    let live = chain.live();
    assert_eq!(live.rules()[0].set, 2, "rule 100 followed its set");
    assert_eq!(live.rules()[1].set, 3, "rule 200 swapped the other way");
    assert!(chain.object_record(ObjType::TABLE, 2, "alpha").is_some());
    assert!(chain.object_record(ObjType::TABLE, 3, "beta").is_some());

    // Identity is preserved across the swap: same ids, same counters.
    let ids: Vec<u64> = live.rules().iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![2, 3, 1]);
}

#[test]
fn flush_deletes_everything_but_the_default() {
    let chain = chain();
    chain
        .submit_rules(&submit(vec![
            accept_rule(100, 0),
            accept_rule(200, 5),
            accept_rule(300, 30),
        ]))
        .unwrap();

    let resp = chain.delete_rules(&RuleSelector::all()).unwrap();
    assert_eq!(resp.count, 3);
    assert_eq!(live_nums(&chain), vec![DEFAULT_RULE_NUM]);

    // Flushing an already-flushed chain is a quiet no-op.
    let resp = chain.delete_rules(&RuleSelector::all()).unwrap();
    assert_eq!(resp.count, 0);
}

#[test]
fn flush_destroys_orphaned_objects() {
    let chain = chain();
    chain
        .submit_rules(&SubmitRulesReq {
            rules: vec![table_rule(100, 0, 1), table_rule(200, 0, 1)],
            names: table_names(&[(1, "blocklist")]),
        })
        .unwrap();
    // A pinned object must survive the flush even at refcount zero.
    chain.create_object(ObjType::TABLE, 0, "pinned").unwrap();

    chain.delete_rules(&RuleSelector::all()).unwrap();
    assert!(chain.object_record(ObjType::TABLE, 0, "blocklist").is_none());
    assert!(chain.object_record(ObjType::TABLE, 0, "pinned").is_some());
}

#[test]
fn dynamic_only_delete_touches_no_static_rule() {
    struct RecordingDynState {
        seen: Mutex<Vec<RuleSelector>>,
    }

    impl DynStateOps for RecordingDynState {
        fn expire(&self, sel: &RuleSelector) -> u32 {
            self.seen.lock().unwrap().push(sel.clone());
            7
        }
    }

    let dyn_state =
        Arc::new(RecordingDynState { seen: Mutex::new(Vec::new()) });
    let chain = FwChain::new(
        Config::default(),
        Logger::root(slog::Discard, o!()),
    )
    .with_dyn_state(ArcDyn(Arc::clone(&dyn_state)));
    chain.submit_rules(&submit(vec![accept_rule(100, 0)])).unwrap();

    let mut sel = RuleSelector::range(1, 1000);
    sel.flags |= SelectorFlags::DYNAMIC_ONLY;
    let resp = chain.delete_rules(&sel).unwrap();
    assert_eq!(resp.count, 7);
    assert_eq!(dyn_state.seen.lock().unwrap().len(), 1);
    assert_eq!(live_nums(&chain), vec![100, DEFAULT_RULE_NUM]);

    struct ArcDyn(Arc<RecordingDynState>);
    impl DynStateOps for ArcDyn {
        fn expire(&self, sel: &RuleSelector) -> u32 {
            self.0.expire(sel)
        }
    }
}

#[test]
fn clear_counters_by_selector() {
    let chain = chain();
    chain
        .submit_rules(&submit(vec![accept_rule(100, 0), accept_rule(200, 0)]))
        .unwrap();

    let live = chain.live();
    for rule in live.rules() {
        rule.counters().record_match(1000, 42);
    }

    let resp = chain
        .clear_counters(&RuleSelector::range(100, 100), false)
        .unwrap();
    assert_eq!(resp.count, 1);

    let dump = chain.dump(&RuleSelector::all(), true, false);
    let by_num = |num: u32| {
        dump.rules
            .iter()
            .find(|r| r.num == num)
            .unwrap()
            .counters
            .unwrap()
    };
    assert_eq!(by_num(100).pkts, 0);
    assert_eq!(by_num(200).pkts, 1);
    assert_eq!(by_num(DEFAULT_RULE_NUM).pkts, 1);
}

#[test]
fn skipto_cache_toggles_idempotently() {
    let chain = chain();
    chain
        .submit_rules(&submit(vec![accept_rule(100, 0), accept_rule(300, 0)]))
        .unwrap();

    assert!(chain.live().has_skipto());
    let r#gen = chain.live().r#gen;

    // Enabling the enabled cache publishes nothing.
    chain.enable_skipto_cache(true);
    assert_eq!(chain.live().r#gen, r#gen);

    chain.enable_skipto_cache(false);
    let disabled = chain.live();
    assert!(!disabled.has_skipto());
    assert_eq!(disabled.r#gen, r#gen + 1);

    chain.enable_skipto_cache(true);
    let enabled = chain.live();
    assert!(enabled.has_skipto());

    // Cache agrees with the search-based fallback everywhere.
    for n in [0, 1, 100, 101, 299, 300, 301, DEFAULT_RULE_NUM] {
        assert_eq!(enabled.skip_to(n), disabled.skip_to(n));
    }
    assert_eq!(enabled.skip_to(101), 1);
    assert_eq!(enabled.skip_to(DEFAULT_RULE_NUM), 2);
}

#[test]
fn export_reimport_round_trip() {
    let first = chain();
    first
        .submit_rules(&SubmitRulesReq {
            rules: vec![
                table_rule(100, 0, 1),
                table_rule(200, 0, 2),
                RawRule {
                    num: 300,
                    set: 0,
                    action_offset: 4,
                    insns: build::stream(&[
                        build::insn_ref(op::COUNT, 3),
                        build::insn(op::DENY, 0),
                    ]),
                },
            ],
            names: vec![
                ObjName {
                    idx: 1,
                    ty: ObjType::TABLE,
                    name: "blocklist".to_string(),
                },
                ObjName {
                    idx: 2,
                    ty: ObjType::TABLE,
                    name: "allowlist".to_string(),
                },
                ObjName {
                    idx: 3,
                    ty: ObjType::COUNTER,
                    name: "drops".to_string(),
                },
            ],
        })
        .unwrap();

    let exported = first.dump(&RuleSelector::all(), false, true);

    // Re-import into a fresh chain, using the exported objects as
    // the name table (logical index = kidx, so the embedded
    // references resolve by name to the same objects).
    let reimport = SubmitRulesReq {
        rules: exported
            .rules
            .iter()
            .filter(|r| r.num != DEFAULT_RULE_NUM)
            .map(|r| RawRule {
                num: r.num,
                set: r.set,
                action_offset: r.action_offset,
                insns: r.insns.clone(),
            })
            .collect(),
        names: exported
            .objects
            .iter()
            .map(|o| o.as_obj_name())
            .collect(),
    };
    let second = chain();
    second.submit_rules(&reimport).unwrap();
    let re_exported = second.dump(&RuleSelector::all(), false, true);

    // Byte-identical opcode streams, identical object references.
    for (a, b) in exported.rules.iter().zip(re_exported.rules.iter()) {
        assert_eq!(a.num, b.num);
        assert_eq!(a.set, b.set);
        assert_eq!(a.action_offset, b.action_offset);
        assert_eq!(a.insns, b.insns, "rule {} changed shape", a.num);
    }
    let key = |o: &fwchain::api::ObjectRecord| {
        (o.kidx, o.ty, o.set, o.name.clone(), o.refcount)
    };
    assert_eq!(
        exported.objects.iter().map(key).collect::<Vec<_>>(),
        re_exported.objects.iter().map(key).collect::<Vec<_>>(),
    );
}

#[test]
fn disabled_sets_publish_atomically() {
    let chain = chain();
    chain
        .submit_rules(&submit(vec![accept_rule(100, 1), accept_rule(200, 2)]))
        .unwrap();

    chain.set_disabled_sets(0b0010);
    let live = chain.live();
    assert!(!live.set_enabled(1));
    assert!(live.set_enabled(2));

    // Same mask again publishes nothing.
    let r#gen = live.r#gen;
    chain.set_disabled_sets(0b0010);
    assert_eq!(chain.live().r#gen, r#gen);
}

#[test]
fn concurrent_readers_never_see_a_torn_snapshot() {
    let chain = Arc::new(chain());

    std::thread::scope(|scope| {
        let reader_chain = Arc::clone(&chain);
        let reader = scope.spawn(move || {
            for _ in 0..2_000 {
                let live = reader_chain.live();
                let rules = live.rules();
                // Complete and sorted, with the default rule last,
                // no matter where the writer is.
                assert!(!rules.is_empty());
                assert_eq!(
                    rules.last().unwrap().num,
                    DEFAULT_RULE_NUM
                );
                assert!(
                    rules
                        .windows(2)
                        .all(|w| (w[0].num, w[0].id) < (w[1].num, w[1].id))
                );
                if live.has_skipto() {
                    assert_eq!(live.skip_to(0), 0);
                }
            }
        });

        for round in 0..50u32 {
            chain
                .submit_rules(&submit(vec![
                    accept_rule(0, 0),
                    accept_rule(0, 0),
                ]))
                .unwrap();
            if round % 5 == 0 {
                chain
                    .delete_rules(&RuleSelector::range(1, 60_000))
                    .unwrap();
            }
            chain.enable_skipto_cache(round % 2 == 0);
        }

        reader.join().unwrap();
    });
}

#[test]
fn held_snapshot_survives_later_changes() {
    let chain = chain();
    chain.submit_rules(&submit(vec![accept_rule(100, 0)])).unwrap();

    let held = chain.live();
    chain.delete_rules(&RuleSelector::all()).unwrap();
    chain.submit_rules(&submit(vec![accept_rule(900, 0)])).unwrap();

    // The retired snapshot is still whole for its holder.
    assert_eq!(
        held.rules().iter().map(|r| r.num).collect::<Vec<_>>(),
        vec![100, DEFAULT_RULE_NUM],
    );
    assert_eq!(
        live_nums(&chain),
        vec![900, DEFAULT_RULE_NUM],
    );
}
