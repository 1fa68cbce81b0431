// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Print command responses in a human-friendly manner.
//!
//! This is mostly just a place to hang printing routines so that they
//! can be used by both admin tooling and integration tests.

use crate::DumpResp;
use crate::ObjectRecord;
use crate::RuleRecord;
use std::io::Write;
use tabwriter::TabWriter;

/// Print a [`DumpResp`] to stdout.
pub fn print_dump(resp: &DumpResp) -> std::io::Result<()> {
    print_dump_into(&mut std::io::stdout(), resp)
}

/// Print a [`DumpResp`] into a given writer.
pub fn print_dump_into(
    writer: &mut impl Write,
    resp: &DumpResp,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "Rule set generation {}", resp.r#gen)?;
    if resp.disabled_sets != 0 {
        writeln!(t, "Disabled sets: {:#010x}", resp.disabled_sets)?;
    }
    write_hr(&mut t)?;
    writeln!(t, "NUM\tID\tSET\tPKTS\tBYTES\tINSNS")?;
    for rule in &resp.rules {
        print_rule(&mut t, rule)?;
    }
    t.flush()?;

    if !resp.objects.is_empty() {
        writeln!(t, "\nNamed Objects")?;
        write_hr(&mut t)?;
        writeln!(t, "KIDX\tTYPE\tSET\tNAME\tREFS\tPINS")?;
        for obj in &resp.objects {
            print_object(&mut t, obj)?;
        }
        t.flush()?;
    }

    writeln!(t)?;
    t.flush()
}

fn print_rule(
    t: &mut impl Write,
    rule: &RuleRecord,
) -> std::io::Result<()> {
    let (pkts, bytes) = match rule.counters {
        Some(c) => (c.pkts.to_string(), c.bytes.to_string()),
        None => ("-".to_string(), "-".to_string()),
    };

    writeln!(
        t,
        "{}\t{}\t{}\t{}\t{}\t{}B",
        rule.num,
        rule.id,
        rule.set,
        pkts,
        bytes,
        rule.insns.len(),
    )
}

fn print_object(
    t: &mut impl Write,
    obj: &ObjectRecord,
) -> std::io::Result<()> {
    writeln!(
        t,
        "{}\t{}\t{}\t{}\t{}\t{}",
        obj.kidx, obj.ty, obj.set, obj.name, obj.refcount, obj.use_count,
    )
}

fn write_hr(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{}", "=".repeat(60))
}
