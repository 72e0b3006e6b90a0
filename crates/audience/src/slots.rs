// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fixed-capacity entry storage behind striped locks.
//!
//! The table holds `2^C` cells, each either empty or owned by one user
//! entry. Cells are distributed over [`STRIPE_COUNT`] stripes by the low
//! bits of the slot index; one `parking_lot::Mutex` per stripe is the only
//! way to read or mutate the cells it owns, so lock memory stays bounded
//! independently of the capacity.
//!
//! Two distinct slots can share a stripe. Re-locking a stripe the current
//! operation already holds would deadlock, so every acquisition goes
//! through a [`LockSet`], which reuses and pin-counts the guards it holds.
//! The locking discipline for two-slot operations is left slot before
//! right slot.

use std::hash::{BuildHasher, Hash};

use parking_lot::{Mutex, MutexGuard};

use crate::UserMeta;

/// Number of stripe locks shared by all slots.
pub(crate) const STRIPE_COUNT: u32 = 1024;

const STRIPE_MASK: u32 = STRIPE_COUNT - 1;
const STRIPE_BITS: u32 = STRIPE_COUNT.trailing_zeros();

/// Maximum linear-probe distance past the home slot.
pub(crate) const MAX_STRIDE: u32 = 20;

/// One user entry occupying a cell.
///
/// The `id` of an occupied cell never changes while the cell is occupied;
/// reusing a slot for another user always empties the cell first.
#[derive(Debug)]
pub(crate) struct Entry<I> {
    pub(crate) id: I,
    pub(crate) username: Option<String>,
    pub(crate) meta: Option<UserMeta>,
    /// True iff the cache holds a loader-backed follow list for this entry.
    pub(crate) fresh: bool,
}

impl<I> Entry<I> {
    /// Entry installed after a successful load, before its list is merged.
    pub(crate) fn loaded(id: I) -> Self {
        Self {
            id,
            username: None,
            meta: None,
            fresh: true,
        }
    }

    /// Entry installed for a followed user discovered during a merge.
    pub(crate) fn merged(id: I, username: String) -> Self {
        Self {
            id,
            username: Some(username),
            meta: None,
            fresh: false,
        }
    }

    /// Entry installed for a user first seen through a status report.
    pub(crate) fn reported(id: I, meta: UserMeta) -> Self {
        Self {
            id,
            username: None,
            meta: Some(meta),
            fresh: false,
        }
    }

    /// An entry is online only if it has reported an online status; a
    /// status-less entry counts as offline and its slot is reclaimable.
    pub(crate) fn is_online(&self) -> bool {
        self.meta.is_some_and(|meta| meta.online)
    }
}

type Cells<I> = Vec<Option<Entry<I>>>;

/// One stripe of cells behind its lock.
///
/// Aligned to the cache line so neighboring stripe locks do not bounce.
#[repr(align(64))]
struct Stripe<I> {
    cells: Mutex<Cells<I>>,
}

pub(crate) const fn stripe_of(slot: u32) -> u32 {
    slot & STRIPE_MASK
}

pub(crate) const fn cell_of(slot: u32) -> usize {
    (slot >> STRIPE_BITS) as usize
}

/// Fixed open-addressed array of user entries.
pub(crate) struct SlotTable<I, H> {
    stripes: Box<[Stripe<I>]>,
    mask: u32,
    hash_builder: H,
}

impl<I, H> SlotTable<I, H> {
    /// Creates a table of `2^log_capacity` empty cells.
    ///
    /// # Panics
    ///
    /// Panics if `log_capacity > 31`; slot indices must fit in the 32-bit
    /// halves of an edge key.
    pub(crate) fn new(log_capacity: u32, hash_builder: H) -> Self {
        assert!(log_capacity <= 31, "log_capacity must be at most 31");
        let capacity = 1_u32 << log_capacity;
        let stripes = (0..STRIPE_COUNT)
            .map(|stripe| {
                let cells = (capacity >> STRIPE_BITS) + u32::from(stripe < (capacity & STRIPE_MASK));
                Stripe {
                    cells: Mutex::new(std::iter::repeat_with(|| None).take(cells as usize).collect()),
                }
            })
            .collect();
        Self {
            stripes,
            mask: capacity - 1,
            hash_builder,
        }
    }

    pub(crate) const fn capacity(&self) -> u32 {
        self.mask.wrapping_add(1)
    }

    /// Starts an empty lock set over this table's stripes.
    pub(crate) fn lock_set(&self) -> LockSet<'_, I> {
        LockSet {
            stripes: &self.stripes,
            held: Vec::new(),
            pinned: Vec::new(),
        }
    }

    /// Candidate slots probed for a given home, in probe order. The window
    /// never revisits a slot, so it is capped at the table capacity.
    pub(crate) fn probe_window(&self, home: u32) -> impl Iterator<Item = u32> {
        let mask = self.mask;
        let length = (MAX_STRIDE + 1).min(self.capacity());
        (0..length).map(move |step| (home + step) & mask)
    }
}

impl<I, H> SlotTable<I, H>
where
    I: Eq + Hash,
    H: BuildHasher,
{
    /// Home slot of a user id.
    #[expect(clippy::cast_possible_truncation, reason = "the hash is masked to the slot range")]
    pub(crate) fn home_of(&self, id: &I) -> u32 {
        (self.hash_builder.hash_one(id) & u64::from(self.mask)) as u32
    }
}

impl<I, H> std::fmt::Debug for SlotTable<I, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotTable")
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}

/// Stripe guards held by one logical operation.
///
/// Every pin names a slot; a stripe stays locked for as long as at least
/// one of its slots is pinned, and is released with the last one (or when
/// the set is dropped). Probe acquisitions on unpinned stripes are
/// released as soon as the inspection closure returns. Acquiring a slot
/// whose stripe is already held reuses the existing guard, which makes
/// multi-slot operations safe when slots alias in the stripe space.
///
/// The pinned-slot list also answers [`is_pinned`](Self::is_pinned): a
/// slot the in-flight operation depends on must never be reclaimed by a
/// nested resolution.
pub(crate) struct LockSet<'t, I> {
    stripes: &'t [Stripe<I>],
    held: Vec<Held<'t, I>>,
    pinned: Vec<u32>,
}

struct Held<'t, I> {
    stripe: u32,
    guard: MutexGuard<'t, Cells<I>>,
}

impl<'t, I> LockSet<'t, I> {
    fn position(&self, stripe: u32) -> Option<usize> {
        self.held.iter().position(|held| held.stripe == stripe)
    }

    /// Returns `true` if this set currently holds a pin on `slot`.
    pub(crate) fn is_pinned(&self, slot: u32) -> bool {
        self.pinned.contains(&slot)
    }

    /// Inspects the slot under its stripe lock. `decide` returning `Some`
    /// pins the slot and hands the result back; `None` releases it.
    pub(crate) fn claim_if<R>(&mut self, slot: u32, decide: impl FnOnce(&Option<Entry<I>>) -> Option<R>) -> Option<R> {
        let stripe = stripe_of(slot);
        let cell = cell_of(slot);
        if let Some(index) = self.position(stripe) {
            let chosen = decide(&self.held[index].guard[cell]);
            if chosen.is_some() {
                self.pinned.push(slot);
            }
            chosen
        } else {
            let guard = self.stripes[stripe as usize].cells.lock();
            let chosen = decide(&guard[cell]);
            if chosen.is_some() {
                self.held.push(Held { stripe, guard });
                self.pinned.push(slot);
            }
            chosen
        }
    }

    /// Pins the slot unconditionally.
    pub(crate) fn claim(&mut self, slot: u32) {
        self.claim_if(slot, |_| Some(()));
    }

    /// Releases one pin on `slot`; the stripe lock is dropped once no
    /// pinned slot maps to it anymore.
    pub(crate) fn release(&mut self, slot: u32) {
        let index = self.pinned.iter().position(|&pinned| pinned == slot).expect("released slot must be pinned");
        self.pinned.swap_remove(index);

        let stripe = stripe_of(slot);
        if !self.pinned.iter().any(|&pinned| stripe_of(pinned) == stripe) {
            let held = self.position(stripe).expect("pinned slot's stripe must be held");
            self.held.swap_remove(held);
        }
    }

    /// Runs `body` with the slot locked, releasing afterwards unless the
    /// stripe was already pinned by this set.
    pub(crate) fn with_cell<R>(&mut self, slot: u32, body: impl FnOnce(&mut Option<Entry<I>>) -> R) -> R {
        let stripe = stripe_of(slot);
        let cell = cell_of(slot);
        if let Some(index) = self.position(stripe) {
            body(&mut self.held[index].guard[cell])
        } else {
            let mut guard = self.stripes[stripe as usize].cells.lock();
            body(&mut guard[cell])
        }
    }

    /// Cell of a slot whose stripe is pinned in this set.
    pub(crate) fn entry(&mut self, slot: u32) -> &mut Option<Entry<I>> {
        let index = self.position(stripe_of(slot)).expect("slot must be claimed before access");
        &mut self.held[index].guard[cell_of(slot)]
    }
}

impl<I> std::fmt::Debug for LockSet<'_, I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockSet").field("held", &self.held.len()).finish()
    }
}
