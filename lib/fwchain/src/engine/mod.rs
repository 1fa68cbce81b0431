// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The rule engine.
//!
//! Modules are layered leaves-first: [`bitidx`] hands out object
//! indices, [`objhash`] keeps the named-object tables, [`store`] owns
//! the rule array and its published snapshots, [`rewrite`] wires rule
//! opcode streams to objects, and [`chain`] ties the pieces together
//! behind the administrative surface. [`export`] serializes a
//! consistent view for read-only queries.

pub mod bitidx;
pub mod chain;
pub mod export;
pub mod objhash;
pub mod opcode;
pub mod provider;
pub mod rewrite;
pub mod store;

pub use chain::Config;
pub use chain::DefaultAction;
pub use chain::FwChain;
pub use store::FwRule;
pub use store::RuleSnapshot;
