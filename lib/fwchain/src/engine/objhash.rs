// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Named-object tables.
//!
//! An [`ObjHash`] owns every named object of one category (lookup
//! tables in one instance, generic service objects in another) and
//! indexes it two ways: by name within a set, for control-plane
//! resolution, and by kidx, for opcode dereference. The table owns
//! the objects outright; rules hold nothing but the kidx, so removal
//! is "take it out of both maps", never a pointer unlink.
//!
//! All methods assume the caller holds the administrative lock; the
//! table itself has no interior locking.

use super::bitidx::IndexBitmap;
use crate::api::FwError;
use crate::api::ObjType;
use crate::api::ObjectRecord;
use crate::api::RESERVED_SET;
use std::collections::HashMap;

/// Object names are short printable tokens: 1..=63 bytes of graphic
/// ASCII.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() < 64
        && name.bytes().all(|b| b.is_ascii_graphic())
}

#[derive(Clone, Debug)]
pub struct NamedObject {
    pub name: String,
    pub kidx: u32,
    pub set: u8,
    pub ty: ObjType,
    refcount: u32,
    use_count: u32,
}

impl NamedObject {
    /// Number of rule references holding this object live.
    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    /// Number of administrative pins. A pinned object survives a
    /// refcount of zero and blocks set moves.
    pub fn use_count(&self) -> u32 {
        self.use_count
    }

    pub fn record(&self) -> ObjectRecord {
        ObjectRecord {
            kidx: self.kidx,
            ty: self.ty,
            set: self.set,
            name: self.name.clone(),
            refcount: self.refcount,
            use_count: self.use_count,
        }
    }
}

/// One named-object instance: the owning kidx map, the name index,
/// and the index allocator. Instances have independent kidx spaces.
#[derive(Debug)]
pub struct ObjHash {
    objects: HashMap<u32, NamedObject>,
    // Name buckets are shared across sets and types; they stay short
    // because name reuse across sets is rare in practice.
    by_name: HashMap<String, Vec<u32>>,
    bitmap: IndexBitmap,
}

impl ObjHash {
    pub fn new(capacity: u32) -> Self {
        Self {
            objects: HashMap::new(),
            by_name: HashMap::new(),
            bitmap: IndexBitmap::new(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn capacity(&self) -> u32 {
        self.bitmap.capacity()
    }

    /// Extend the kidx space. Admin lock held, as everywhere here.
    pub fn grow(&mut self, new_capacity: u32) {
        self.bitmap.grow(new_capacity);
    }

    /// Find any object with this name in this set, regardless of
    /// type. Used to distinguish "absent" from "present as another
    /// type" during opcode rewrite.
    pub fn lookup_name(&self, set: u8, name: &str) -> Option<&NamedObject> {
        self.bucket(name).find(|o| o.set == set)
    }

    pub fn lookup_name_type(
        &self,
        set: u8,
        ty: ObjType,
        name: &str,
    ) -> Option<&NamedObject> {
        self.bucket(name).find(|o| o.set == set && o.ty == ty)
    }

    pub fn lookup_kidx(&self, kidx: u32) -> Option<&NamedObject> {
        self.objects.get(&kidx)
    }

    /// Allocate a kidx and insert a fresh object under it. The new
    /// object starts with no references and no pins.
    pub fn create(
        &mut self,
        set: u8,
        ty: ObjType,
        name: &str,
    ) -> Result<u32, FwError> {
        if self.lookup_name_type(set, ty, name).is_some() {
            return Err(FwError::ObjectExists {
                ty,
                name: name.to_string(),
                set,
            });
        }
        let kidx =
            self.bitmap.alloc().map_err(|_| FwError::IndexExhausted)?;
        let obj = NamedObject {
            name: name.to_string(),
            kidx,
            set,
            ty,
            refcount: 0,
            use_count: 0,
        };
        self.by_name.entry(obj.name.clone()).or_default().push(kidx);
        self.objects.insert(kidx, obj);
        Ok(kidx)
    }

    /// Remove the object under `kidx` and free the index. Calling
    /// this for a kidx that is not present, or for an object still
    /// referenced or pinned, is an invariant violation.
    pub fn remove(&mut self, kidx: u32) -> NamedObject {
        let obj = self
            .objects
            .remove(&kidx)
            .unwrap_or_else(|| panic!("remove of unknown kidx {kidx}"));
        assert_eq!(obj.refcount, 0, "removing referenced {}", obj.name);
        assert_eq!(obj.use_count, 0, "removing pinned {}", obj.name);

        let bucket = self
            .by_name
            .get_mut(&obj.name)
            .unwrap_or_else(|| panic!("no name bucket for {}", obj.name));
        bucket.retain(|k| *k != kidx);
        if bucket.is_empty() {
            self.by_name.remove(&obj.name);
        }
        self.bitmap
            .free(kidx)
            .unwrap_or_else(|e| panic!("kidx free: {e:?}"));
        obj
    }

    pub fn ref_object(&mut self, kidx: u32) {
        let obj = self.obj_mut(kidx);
        obj.refcount = obj.refcount.checked_add(1).expect("refcount wrap");
    }

    /// Drop one rule reference. If that was the last reference and
    /// the object carries no administrative pin, the object is
    /// removed and returned so the caller can tear down its backing
    /// resource.
    pub fn unref_and_maybe_remove(&mut self, kidx: u32) -> Option<NamedObject> {
        let obj = self.obj_mut(kidx);
        assert!(obj.refcount > 0, "unref of unreferenced {}", obj.name);
        obj.refcount -= 1;
        if obj.refcount == 0 && obj.use_count == 0 {
            Some(self.remove(kidx))
        } else {
            None
        }
    }

    pub fn pin(&mut self, kidx: u32) {
        let obj = self.obj_mut(kidx);
        obj.use_count = obj.use_count.checked_add(1).expect("pin wrap");
    }

    /// Drop one administrative pin, reaping the object if nothing
    /// else holds it.
    pub fn unpin_and_maybe_remove(&mut self, kidx: u32) -> Option<NamedObject> {
        let obj = self.obj_mut(kidx);
        assert!(obj.use_count > 0, "unpin of unpinned {}", obj.name);
        obj.use_count -= 1;
        if obj.refcount == 0 && obj.use_count == 0 {
            Some(self.remove(kidx))
        } else {
            None
        }
    }

    /// Visit every object present when iteration starts. The
    /// callback gets the table back and may remove the object it is
    /// visiting (or any other); objects removed mid-iteration are
    /// simply not visited again.
    pub fn for_each(&mut self, mut f: impl FnMut(&mut Self, u32)) {
        let mut kidxs: Vec<u32> = self.objects.keys().copied().collect();
        kidxs.sort_unstable();
        for kidx in kidxs {
            if self.objects.contains_key(&kidx) {
                f(self, kidx);
            }
        }
    }

    pub fn for_each_of_type(
        &mut self,
        ty: ObjType,
        mut f: impl FnMut(&mut Self, u32),
    ) {
        self.for_each(|oh, kidx| {
            if oh.objects[&kidx].ty == ty {
                f(oh, kidx);
            }
        });
    }

    /// Exchange the contents of two sets.
    ///
    /// A swap cannot create a name collision (uniqueness is per set
    /// and the two sets trade wholesale), so unlike [`move_sets`]
    /// there is nothing to test first.
    ///
    /// [`move_sets`]: Self::move_sets
    pub fn swap_sets(&mut self, a: u8, b: u8) {
        debug_assert!(a != RESERVED_SET && b != RESERVED_SET);
        for obj in self.objects.values_mut() {
            if obj.set == a {
                obj.set = b;
            } else if obj.set == b {
                obj.set = a;
            }
        }
    }

    /// Relabel every object in set `a` as set `b`, failing without
    /// mutation if the move would collide or touch a pinned object.
    pub fn move_sets(&mut self, a: u8, b: u8) -> Result<(), FwError> {
        self.test_sets(a, b)?;
        for obj in self.objects.values_mut() {
            if obj.set == a {
                obj.set = b;
            }
        }
        Ok(())
    }

    /// Would `move_sets(a, b)` succeed? Never mutates.
    pub fn test_sets(&self, a: u8, b: u8) -> Result<(), FwError> {
        debug_assert!(a != RESERVED_SET && b != RESERVED_SET);
        for obj in self.objects.values() {
            if obj.set != a {
                continue;
            }
            // A pin is a live reference outside the mover's scope.
            if obj.use_count > 0 {
                return Err(FwError::ObjectBusy {
                    ty: obj.ty,
                    name: obj.name.clone(),
                });
            }
            if self.lookup_name_type(b, obj.ty, &obj.name).is_some() {
                return Err(FwError::SetConflict {
                    ty: obj.ty,
                    name: obj.name.clone(),
                    set: b,
                });
            }
        }
        Ok(())
    }

    /// All objects, sorted by kidx for stable export order.
    pub fn records(&self) -> Vec<ObjectRecord> {
        let mut records: Vec<ObjectRecord> =
            self.objects.values().map(NamedObject::record).collect();
        records.sort_unstable_by_key(|r| r.kidx);
        records
    }

    fn bucket<'a>(
        &'a self,
        name: &str,
    ) -> impl Iterator<Item = &'a NamedObject> {
        self.by_name
            .get(name)
            .map(|b| b.as_slice())
            .unwrap_or_default()
            .iter()
            .map(|kidx| &self.objects[kidx])
    }

    fn obj_mut(&mut self, kidx: u32) -> &mut NamedObject {
        self.objects
            .get_mut(&kidx)
            .unwrap_or_else(|| panic!("unknown kidx {kidx}"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn table(oh: &mut ObjHash, set: u8, name: &str) -> u32 {
        oh.create(set, ObjType::TABLE, name).unwrap()
    }

    #[test]
    fn lookup_both_ways() {
        let mut oh = ObjHash::new(64);
        let kidx = table(&mut oh, 0, "blocklist");

        let by_name =
            oh.lookup_name_type(0, ObjType::TABLE, "blocklist").unwrap();
        assert_eq!(by_name.kidx, kidx);
        let by_kidx = oh.lookup_kidx(kidx).unwrap();
        assert_eq!(by_kidx.name, "blocklist");

        // Unknown kidx is None, not a panic: absence is only fatal
        // when a refcount implies presence.
        assert!(oh.lookup_kidx(kidx + 1).is_none());
        assert!(oh.lookup_name(1, "blocklist").is_none());
    }

    #[test]
    fn duplicate_name_same_set_and_type() {
        let mut oh = ObjHash::new(64);
        table(&mut oh, 0, "blocklist");
        assert_eq!(
            oh.create(0, ObjType::TABLE, "blocklist"),
            Err(FwError::ObjectExists {
                ty: ObjType::TABLE,
                name: "blocklist".to_string(),
                set: 0,
            })
        );

        // Same name is fine in another set, or as another type.
        table(&mut oh, 1, "blocklist");
        oh.create(0, ObjType::COUNTER, "blocklist").unwrap();
    }

    #[test]
    fn kidx_space_grows_under_pressure() {
        let mut oh = ObjHash::new(3);
        table(&mut oh, 0, "a");
        table(&mut oh, 0, "b");
        assert_eq!(
            oh.create(0, ObjType::TABLE, "c"),
            Err(FwError::IndexExhausted)
        );

        oh.grow(8);
        assert_eq!(oh.capacity(), 8);
        let kidx = table(&mut oh, 0, "c");
        assert_eq!(kidx, 3);
    }

    #[test]
    fn refcount_reaps_at_zero() {
        let mut oh = ObjHash::new(64);
        let kidx = table(&mut oh, 0, "blocklist");
        oh.ref_object(kidx);
        oh.ref_object(kidx);

        assert!(oh.unref_and_maybe_remove(kidx).is_none());
        let reaped = oh.unref_and_maybe_remove(kidx).unwrap();
        assert_eq!(reaped.name, "blocklist");
        assert!(oh.lookup_kidx(kidx).is_none());

        // The kidx went back to the allocator.
        assert_eq!(table(&mut oh, 0, "other"), kidx);
    }

    #[test]
    fn pin_outlives_references() {
        let mut oh = ObjHash::new(64);
        let kidx = table(&mut oh, 0, "blocklist");
        oh.pin(kidx);
        oh.ref_object(kidx);

        assert!(oh.unref_and_maybe_remove(kidx).is_none());
        assert!(oh.lookup_kidx(kidx).is_some());
        assert!(oh.unpin_and_maybe_remove(kidx).is_some());
    }

    #[test]
    fn for_each_tolerates_removal() {
        let mut oh = ObjHash::new(64);
        for name in ["a", "b", "c", "d"] {
            table(&mut oh, 0, name);
        }

        let mut visited = Vec::new();
        oh.for_each(|oh, kidx| {
            visited.push(oh.lookup_kidx(kidx).unwrap().name.clone());
            oh.remove(kidx);
        });
        visited.sort();
        assert_eq!(visited, ["a", "b", "c", "d"]);
        assert_eq!(oh.len(), 0);
    }

    #[test]
    fn for_each_of_type_filters() {
        let mut oh = ObjHash::new(64);
        table(&mut oh, 0, "a");
        oh.create(0, ObjType::COUNTER, "b").unwrap();
        table(&mut oh, 1, "c");

        let mut seen = Vec::new();
        oh.for_each_of_type(ObjType::TABLE, |oh, kidx| {
            seen.push(oh.lookup_kidx(kidx).unwrap().name.clone());
        });
        seen.sort();
        assert_eq!(seen, ["a", "c"]);
    }

    #[test]
    fn swap_and_move_sets() {
        let mut oh = ObjHash::new(64);
        let a = table(&mut oh, 1, "alpha");
        let b = table(&mut oh, 2, "beta");

        oh.swap_sets(1, 2);
        assert_eq!(oh.lookup_kidx(a).unwrap().set, 2);
        assert_eq!(oh.lookup_kidx(b).unwrap().set, 1);

        oh.move_sets(1, 3).unwrap();
        assert_eq!(oh.lookup_kidx(b).unwrap().set, 3);
        assert!(oh.lookup_name(1, "beta").is_none());
    }

    #[test]
    fn move_conflict_leaves_state_alone() {
        let mut oh = ObjHash::new(64);
        let a = table(&mut oh, 1, "blocklist");
        let b = table(&mut oh, 2, "blocklist");

        let err = oh.move_sets(1, 2).unwrap_err();
        assert!(matches!(err, FwError::SetConflict { .. }));
        assert_eq!(oh.lookup_kidx(a).unwrap().set, 1);
        assert_eq!(oh.lookup_kidx(b).unwrap().set, 2);
    }

    #[test]
    fn move_blocked_by_pin() {
        let mut oh = ObjHash::new(64);
        let kidx = table(&mut oh, 1, "pinned");
        oh.pin(kidx);
        assert!(matches!(
            oh.move_sets(1, 2),
            Err(FwError::ObjectBusy { .. })
        ));
        assert_eq!(oh.lookup_kidx(kidx).unwrap().set, 1);
    }
}
