// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Providers let the rule engine drive collaborators it does not
//! implement itself: the backing resources behind named objects and
//! the dynamic (per-connection) state store. Each trait ships a
//! do-nothing implementation so the engine can run self-contained in
//! tests and in deployments that have no such collaborator.

use crate::api::FwError;
use crate::api::ObjType;
use crate::api::RuleSelector;

/// Creates and destroys the resources named objects stand for (the
/// table storage behind a `TABLE` object, the handler registration
/// behind an `EXT_ACTION`, ...). The engine does all table
/// bookkeeping itself; the factory only manages the resource.
///
/// `create` must be idempotent for an identical `(ty, set, name)`:
/// the engine drops its lock across the call, so two concurrent
/// imports may both ask for the same object before the engine picks
/// a winner.
pub trait ObjectFactory: Send + Sync {
    fn create(&self, ty: ObjType, set: u8, name: &str)
    -> Result<(), FwError>;

    fn destroy(&self, ty: ObjType, set: u8, name: &str);
}

/// A factory for deployments where object resources need no setup.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullFactory;

impl ObjectFactory for NullFactory {
    fn create(
        &self,
        _ty: ObjType,
        _set: u8,
        _name: &str,
    ) -> Result<(), FwError> {
        Ok(())
    }

    fn destroy(&self, _ty: ObjType, _set: u8, _name: &str) {}
}

/// The per-connection state store. Only "delete rules, dynamic state
/// only" reaches through this; the rule engine itself tracks no
/// connection state.
pub trait DynStateOps: Send + Sync {
    /// Expire state matching the selector; returns the count expired.
    fn expire(&self, sel: &RuleSelector) -> u32;
}

/// For deployments without a dynamic-state store.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoDynState;

impl DynStateOps for NoDynState {
    fn expire(&self, _sel: &RuleSelector) -> u32 {
        0
    }
}
