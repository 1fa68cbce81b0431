// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Administrative API types for the fwchain rule engine.
//!
//! Everything a control channel needs to talk to the engine lives
//! here: rule and object records, selectors, the command
//! request/response pairs, and the error type. The engine crate
//! re-exports this module so callers on either side of a management
//! boundary compile against the same definitions.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

pub mod cmd;
pub mod print;

pub use cmd::*;

/// The overall version of the API. Anytime a type in this crate is
/// added, removed, or modified, this number should increment, so
/// that a control channel and engine compiled against different
/// revisions refuse to talk rather than misparse each other.
pub const API_VERSION: u64 = 3;

/// The reserved maximum rule number. Exactly one rule carries this
/// number in any published rule set; it always matches last and can
/// never be deleted.
pub const DEFAULT_RULE_NUM: u32 = 65_535;

/// Number of rule/object sets (namespaces).
pub const MAX_SETS: u8 = 32;

/// The protected set. The default rule lives here; user rules may
/// not, and set move/swap operations may not name it.
pub const RESERVED_SET: u8 = MAX_SETS - 1;

/// Default spacing between auto-assigned rule numbers.
pub const AUTOSTEP_DEFAULT: u32 = 100;

/// Bounds the configurable auto-number step.
pub const AUTOSTEP_MIN: u32 = 1;
pub const AUTOSTEP_MAX: u32 = 1_000;

/// Named-object type tag.
///
/// The engine core treats the tag as opaque beyond equality; the
/// constants below cover the standard opcode set.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub struct ObjType(pub u16);

impl ObjType {
    /// An address/port lookup table.
    pub const TABLE: Self = Self(1);
    /// A shared named counter.
    pub const COUNTER: Self = Self(2);
    /// An external-action handle.
    pub const EXT_ACTION: Self = Self(3);
}

impl Display for ObjType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::TABLE => write!(f, "table"),
            Self::COUNTER => write!(f, "counter"),
            Self::EXT_ACTION => write!(f, "ext-action"),
            Self(other) => write!(f, "type-{other}"),
        }
    }
}

/// Whether a set operation relabels one set or exchanges two.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum SetCmd {
    Move,
    Swap,
}

bitflags::bitflags! {
    /// Modifiers for rule selectors.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct SelectorFlags: u8 {
        /// Select every static rule (a "flush").
        const MATCH_ALL = 0b0000_0001;
        /// Touch no static rule; expire matching dynamic state only.
        const DYNAMIC_ONLY = 0b0000_0010;
        /// A flush may reach into the reserved set.
        const FORCE = 0b0000_0100;
    }
}

// Selectors cross the management boundary as raw bits; unknown bits
// from a newer peer are dropped rather than rejected.
impl Serialize for SelectorFlags {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.bits())
    }
}

impl<'de> Deserialize<'de> for SelectorFlags {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Self, D::Error> {
        let bits = u8::deserialize(deserializer)?;
        Ok(Self::from_bits_truncate(bits))
    }
}

/// Selects a subset of the rule set for delete, counter, and dump
/// operations.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct RuleSelector {
    /// Inclusive rule-number range.
    pub range: Option<(u32, u32)>,
    /// Restrict to a single set.
    pub set: Option<u8>,
    pub flags: SelectorFlags,
}

impl RuleSelector {
    pub fn all() -> Self {
        Self { flags: SelectorFlags::MATCH_ALL, ..Default::default() }
    }

    pub fn range(lo: u32, hi: u32) -> Self {
        Self { range: Some((lo, hi)), ..Default::default() }
    }

    pub fn set(set: u8) -> Self {
        Self { set: Some(set), ..Default::default() }
    }

    /// Does a rule with this number and set fall under the selector?
    ///
    /// This is the raw filter; the engine layers the default-rule and
    /// reserved-set exemptions on top.
    pub fn covers(&self, num: u32, set: u8) -> bool {
        if let Some((lo, hi)) = self.range {
            if num < lo || num > hi {
                return false;
            }
        }
        if let Some(s) = self.set {
            if set != s {
                return false;
            }
        }
        if self.range.is_none() && self.set.is_none() {
            return self.flags.contains(SelectorFlags::MATCH_ALL);
        }
        true
    }

    /// A selector with neither a range nor a set restriction.
    pub fn is_broad(&self) -> bool {
        self.range.is_none() && self.set.is_none()
    }
}

/// One entry of the name table accompanying a rule batch. Reference
/// opcodes embed `idx`; the engine resolves `name` and patches the
/// opcode with the object's kidx.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ObjName {
    pub idx: u32,
    pub ty: ObjType,
    pub name: String,
}

/// A candidate rule as submitted by the control channel: parsed and
/// length-checked by the transport, not yet validated by the engine.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RawRule {
    /// Requested rule number; 0 asks the engine to auto-number.
    pub num: u32,
    pub set: u8,
    /// Byte offset of the terminal action opcode within `insns`.
    pub action_offset: u32,
    /// The opcode stream: match opcodes, then action opcodes.
    pub insns: Vec<u8>,
}

/// Counter values captured at dump time.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CounterSnap {
    pub pkts: u64,
    pub bytes: u64,
    /// Seconds-since-epoch of the most recent match, 0 if never.
    pub last_match: u64,
    pub logged: u64,
}

/// One exported rule. `insns` is the published stream, object
/// references already rewritten to kidx values.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RuleRecord {
    pub num: u32,
    pub id: u64,
    pub set: u8,
    pub action_offset: u32,
    pub insns: Vec<u8>,
    pub counters: Option<CounterSnap>,
}

/// One exported named object.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ObjectRecord {
    pub kidx: u32,
    pub ty: ObjType,
    pub set: u8,
    pub name: String,
    pub refcount: u32,
    pub use_count: u32,
}

impl ObjectRecord {
    /// View this object as a name-table entry keyed by its kidx,
    /// suitable for re-importing the rules that reference it.
    pub fn as_obj_name(&self) -> ObjName {
        ObjName { idx: self.kidx, ty: self.ty, name: self.name.clone() }
    }
}

/// An element of the export stream.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Record {
    Rule(RuleRecord),
    Object(ObjectRecord),
}

impl Record {
    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}
