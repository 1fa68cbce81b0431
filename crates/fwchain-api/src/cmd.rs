// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Command request/response types and the engine error.

use super::ObjName;
use super::ObjType;
use super::ObjectRecord;
use super::RawRule;
use super::RuleRecord;
use core::fmt::Debug;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// The coarse class of an [`FwError`], matching the engine's
/// atomicity contract: every class is rejected-or-undone at request
/// granularity.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ErrorKind {
    /// Malformed request, rejected before any shared state changed.
    Validation,
    /// Object reference could not be satisfied; partial resolution
    /// was unwound.
    Resolution,
    /// A hard resource limit; existing state untouched.
    Capacity,
    /// The operation would collide with existing state; nothing
    /// mutated.
    Conflict,
    NotFound,
}

/// Errors returned to administrative callers.
///
/// Internal invariant violations (a kidx missing that a refcount
/// implies, refcount underflow, a malformed published snapshot) are
/// not represented here: the engine panics on those rather than
/// continuing with a corrupt object graph.
#[derive(Clone, Debug, Deserialize, Error, Eq, PartialEq, Serialize)]
pub enum FwError {
    #[error("rule buffer size {size} is not a positive multiple of 4")]
    BadRuleSize { size: usize },

    #[error("action offset {offset} invalid for a {size}-byte stream")]
    BadActionOffset { offset: u32, size: usize },

    #[error("opcode {op} invalid at offset {offset}")]
    BadOpcode { op: u8, offset: usize },

    #[error("rule number {0} out of range")]
    BadRuleNumber(u32),

    #[error("set {0} out of range or reserved")]
    BadSet(u8),

    #[error("rule batch not sorted by rule number")]
    UnsortedBatch,

    #[error("empty rule batch")]
    EmptyBatch,

    #[error("bad object name {0:?}")]
    BadName(String),

    #[error("object {name:?} is a {have}, not a {want}")]
    TypeMismatch { name: String, want: ObjType, have: ObjType },

    #[error("creating {ty} {name:?}: {reason}")]
    CreateFailed { ty: ObjType, name: String, reason: String },

    #[error("object index space exhausted")]
    IndexExhausted,

    #[error("rule set full ({0} rules)")]
    TooManyRules(usize),

    #[error("{ty} {name:?} already exists in set {set}")]
    ObjectExists { ty: ObjType, name: String, set: u8 },

    #[error("{ty} {name:?} would collide in set {set}")]
    SetConflict { ty: ObjType, name: String, set: u8 },

    #[error("{ty} {name:?} is in use")]
    ObjectBusy { ty: ObjType, name: String },

    #[error("no rule numbered {0}")]
    RuleNotFound(u32),

    #[error("no {ty} named {name:?} in set {set}")]
    ObjectNotFound { ty: ObjType, name: String, set: u8 },
}

impl FwError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRuleSize { .. }
            | Self::BadActionOffset { .. }
            | Self::BadOpcode { .. }
            | Self::BadRuleNumber(_)
            | Self::BadSet(_)
            | Self::UnsortedBatch
            | Self::EmptyBatch
            | Self::BadName(_) => ErrorKind::Validation,

            Self::TypeMismatch { .. } | Self::CreateFailed { .. } => {
                ErrorKind::Resolution
            }

            Self::IndexExhausted | Self::TooManyRules(_) => {
                ErrorKind::Capacity
            }

            Self::ObjectExists { .. }
            | Self::SetConflict { .. }
            | Self::ObjectBusy { .. } => ErrorKind::Conflict,

            Self::RuleNotFound(_) | Self::ObjectNotFound { .. } => {
                ErrorKind::NotFound
            }
        }
    }
}

/// A marker trait indicating a success response type that may be
/// passed across a management boundary.
pub trait CmdOk: Debug + Serialize {}

impl CmdOk for () {}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SubmitRulesReq {
    /// Candidate rules, sorted ascending by explicit rule number
    /// (auto-numbered entries do not constrain the order).
    pub rules: Vec<RawRule>,
    /// Names for every logical object index embedded in `rules`.
    pub names: Vec<ObjName>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SubmitRulesResp {
    /// Final rule numbers, one per submitted rule, in batch order.
    pub assigned: Vec<u32>,
}

impl CmdOk for SubmitRulesResp {}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DeleteRulesResp {
    pub count: u32,
}

impl CmdOk for DeleteRulesResp {}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ClearCountersResp {
    pub count: u32,
}

impl CmdOk for ClearCountersResp {}

/// The response to a dump request: one internally consistent view of
/// the rule set and (optionally) the object tables, in exactly the
/// order the packet path observes.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DumpResp {
    /// Generation of the snapshot the rules were read from.
    pub r#gen: u64,
    pub disabled_sets: u32,
    pub rules: Vec<RuleRecord>,
    pub objects: Vec<ObjectRecord>,
}

impl CmdOk for DumpResp {}

impl DumpResp {
    /// Flatten into the export record stream: rules in snapshot
    /// order, then objects.
    pub fn into_records(self) -> impl Iterator<Item = super::Record> {
        self.rules
            .into_iter()
            .map(super::Record::Rule)
            .chain(self.objects.into_iter().map(super::Record::Object))
    }
}
