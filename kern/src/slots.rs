// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Arena + index, the representation Design Notes §9 calls for in place of
//! the source's intrusive back-pointers: a fixed-size array is the arena,
//! a `(index, generation)` pair is the stable handle, and there are no
//! back-pointers from an entry to its owner.
//!
//! This one generic arena backs all three registries (`CgroupEngine`,
//! `PidNsRegistry`, `IpcNsRegistry`); each wraps its raw `(usize, u16)`
//! pairs in its own `abi` handle type so a `CgroupHandle` can't be
//! confused with a `PidNsHandle` at the type level.

use abi::Error;

/// A fixed-capacity arena of `T`, indexed by slot with a generation counter
/// per slot so stale handles (from a deleted-and-reused slot) are detected
/// rather than silently aliased.
pub struct Slots<T, const N: usize> {
    items: [Option<T>; N],
    generation: [u16; N],
}

impl<T, const N: usize> Slots<T, N> {
    pub fn new() -> Self {
        Slots {
            items: core::array::from_fn(|_| None),
            generation: [0; N],
        }
    }

    /// Finds a free slot and installs `item` into it, returning the slot's
    /// current `(index, generation)`. Fails with `Error::Capacity` if the
    /// table is full; this is the only failure mode `create` operations
    /// have per §4.1/§4.2/§4.3.
    pub fn insert(&mut self, item: T) -> Result<(usize, u16), Error> {
        let index = self
            .items
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(Error::Capacity)?;
        self.items[index] = Some(item);
        Ok((index, self.generation[index]))
    }

    /// Removes the item at `index`, bumping its generation so any handle
    /// naming the old occupant is rejected by `get`/`get_mut` even if the
    /// slot is later reused.
    pub fn remove(&mut self, index: usize) -> Option<T> {
        let item = self.items[index].take();
        if item.is_some() {
            self.generation[index] = self.generation[index].wrapping_add(1);
        }
        item
    }

    pub fn get(&self, index: usize, generation: u16) -> Option<&T> {
        if self.generation[index] != generation {
            return None;
        }
        self.items[index].as_ref()
    }

    pub fn get_mut(&mut self, index: usize, generation: u16) -> Option<&mut T> {
        if self.generation[index] != generation {
            return None;
        }
        self.items[index].as_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|item| (i, item)))
    }

    /// Like [`iter`](Self::iter), but also yields each occupied slot's
    /// current generation, for callers building a stable handle to hand
    /// back out (introspection accessors; see `SPEC_FULL.md`).
    pub fn iter_with_generation(&self) -> impl Iterator<Item = (usize, u16, &T)> {
        self.items.iter().enumerate().filter_map(|(i, slot)| {
            slot.as_ref().map(|item| (i, self.generation[i], item))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> {
        self.items
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_mut().map(|item| (i, item)))
    }
}

impl<T, const N: usize> Default for Slots<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
