// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The control-plane core of the fwchain packet-filter rule engine.
//!
//! This crate stores an ordered, versioned set of filtering rules and
//! their auxiliary named objects, applies administrative mutations
//! atomically, and hands the packet path a lock-free, internally
//! consistent snapshot for rule lookup. Packet matching itself, the
//! management wire format, and privilege checks all live with the
//! caller; see [`engine::opcode`] for the collaborator traits.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

pub mod api;
pub mod engine;
