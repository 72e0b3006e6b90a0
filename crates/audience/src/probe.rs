// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Slot resolution: bounded probing and the reclamation policy.
//!
//! Resolving an id runs up to three cascading passes over the probe window
//! `[home, home + MAX_STRIDE]`:
//!
//! 1. **Lossless**: an empty cell or an exact match claims the slot with
//!    no collateral damage.
//! 2. **Evict-offline**: an occupied cell whose entry is offline (status
//!    absent or offline) is emptied and reused. Both edge directions of the
//!    victim are severed so nothing stale points at the recycled slot.
//! 3. **Overwrite**: the home cell is taken over even from an online
//!    stranger. Only the victim's outgoing edges are severed; incoming
//!    edges are left behind as a deliberate saturation concession.
//!
//! A slot the caller's lock set has already pinned is never an eviction
//! or overwrite victim: the in-flight operation depends on it, and
//! reclaiming it mid-operation would hand its index to an unrelated user.
//! When that rule leaves no claimable cell, resolution fails and the
//! caller drops the update.
//!
//! Candidate locks are acquired and released probe-by-probe; only the
//! winning slot's stripe stays pinned in the caller's lock set.

use std::hash::{BuildHasher, Hash};

use tracing::trace;

use crate::pairs::PairSet;
use crate::slots::{LockSet, SlotTable};

/// Outcome of resolving a user id to a slot.
///
/// The slot's stripe is pinned in the lock set on return; callers release
/// it (or drop the whole set) on every exit path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Resolution {
    /// The cell is empty and the caller is expected to populate it.
    New(u32),
    /// The cell already holds the resolved user.
    Existing(u32),
}

/// Slot location and claiming policy over one table and its edge sets.
pub(crate) struct Resolver<'a, I, H> {
    table: &'a SlotTable<I, H>,
    follows: &'a PairSet,
    followers: &'a PairSet,
}

impl<'a, I, H> Resolver<'a, I, H>
where
    I: Eq + Hash,
    H: BuildHasher,
{
    pub(crate) fn new(table: &'a SlotTable<I, H>, follows: &'a PairSet, followers: &'a PairSet) -> Self {
        Self {
            table,
            follows,
            followers,
        }
    }

    /// Locates or claims the slot for `id`, pinning it in `locks`.
    ///
    /// Returns `None` when every cell in the window is either an online
    /// stranger or a slot this operation has already pinned; the caller
    /// is expected to drop the update. With no pins in `locks`, resolution
    /// always succeeds.
    pub(crate) fn resolve(&self, locks: &mut LockSet<'_, I>, id: &I) -> Option<Resolution> {
        let home = self.table.home_of(id);

        // Lossless pass.
        for slot in self.table.probe_window(home) {
            if let Some(found) = locks.claim_if(slot, |cell| match cell {
                None => Some(Resolution::New(slot)),
                Some(entry) if entry.id == *id => Some(Resolution::Existing(slot)),
                Some(_) => None,
            }) {
                return Some(found);
            }
        }

        // Evict-offline pass. Empty and matching cells are still honored:
        // the window was unlocked between passes and may have changed.
        enum Claim {
            Settled(Resolution),
            Evict,
        }
        for slot in self.table.probe_window(home) {
            let protected = locks.is_pinned(slot);
            if let Some(claim) = locks.claim_if(slot, |cell| match cell {
                None => Some(Claim::Settled(Resolution::New(slot))),
                Some(entry) if entry.id == *id => Some(Claim::Settled(Resolution::Existing(slot))),
                Some(entry) if !entry.is_online() && !protected => Some(Claim::Evict),
                Some(_) => None,
            }) {
                match claim {
                    Claim::Settled(found) => return Some(found),
                    Claim::Evict => {
                        self.reclaim(locks, slot);
                        return Some(Resolution::New(slot));
                    }
                }
            }
        }

        // Overwrite pass: the window is saturated with online strangers.
        let protected = locks.is_pinned(home);
        locks.claim(home);
        enum HomeState {
            Empty,
            Match,
            Taken,
        }
        let state = match locks.entry(home) {
            None => HomeState::Empty,
            Some(entry) if entry.id == *id => HomeState::Match,
            Some(_) => HomeState::Taken,
        };
        match state {
            HomeState::Empty => Some(Resolution::New(home)),
            HomeState::Match => Some(Resolution::Existing(home)),
            HomeState::Taken if protected => {
                locks.release(home);
                None
            }
            HomeState::Taken => {
                trace!(slot = home, "overwriting home slot at saturation");
                self.sever_outgoing(locks, home);
                *locks.entry(home) = None;
                Some(Resolution::New(home))
            }
        }
    }

    /// Empties an offline cell. Both edge directions are severed so no
    /// stale follower list points at the slot once it is reused.
    fn reclaim(&self, locks: &mut LockSet<'_, I>, slot: u32) {
        trace!(slot, "reclaiming offline entry");
        self.sever_outgoing(locks, slot);

        let watchers: Vec<u32> = self.followers.read(slot).collect();
        for left in watchers {
            locks.with_cell(left, |cell| {
                if let Some(entry) = cell {
                    entry.fresh = false;
                }
                self.follows.remove(left, slot);
                self.followers.remove(slot, left);
            });
        }
        *locks.entry(slot) = None;
    }

    /// Severs every edge where `slot` is the source, marking each target
    /// non-fresh. The caller holds `slot`.
    fn sever_outgoing(&self, locks: &mut LockSet<'_, I>, slot: u32) {
        let targets: Vec<u32> = self.follows.read(slot).collect();
        for right in targets {
            locks.with_cell(right, |cell| {
                if let Some(entry) = cell {
                    entry.fresh = false;
                }
                self.follows.remove(slot, right);
                self.followers.remove(right, slot);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UserMeta;
    use crate::slots::Entry;
    use crate::testing::IdentityState;

    struct Fixture {
        table: SlotTable<u32, IdentityState>,
        follows: PairSet,
        followers: PairSet,
    }

    impl Fixture {
        fn new(log_capacity: u32) -> Self {
            Self {
                table: SlotTable::new(log_capacity, IdentityState),
                follows: PairSet::new(),
                followers: PairSet::new(),
            }
        }

        fn resolver(&self) -> Resolver<'_, u32, IdentityState> {
            Resolver::new(&self.table, &self.follows, &self.followers)
        }

        fn install(&self, slot: u32, entry: Entry<u32>) {
            let mut locks = self.table.lock_set();
            locks.claim(slot);
            *locks.entry(slot) = Some(entry);
            locks.release(slot);
        }

        fn link(&self, left: u32, right: u32) {
            self.follows.add(left, right);
            self.followers.add(right, left);
        }

        fn fresh_flag(&self, slot: u32) -> Option<bool> {
            let mut locks = self.table.lock_set();
            locks.with_cell(slot, |cell| cell.as_ref().map(|entry| entry.fresh))
        }
    }

    const ONLINE: UserMeta = UserMeta { online: true };

    #[test]
    fn test_empty_window_claims_first_slot() {
        let fixture = Fixture::new(4);
        let mut locks = fixture.table.lock_set();
        assert_eq!(fixture.resolver().resolve(&mut locks, &3), Some(Resolution::New(3)));
    }

    #[test]
    fn test_match_is_found_past_strangers() {
        let fixture = Fixture::new(4);
        fixture.install(3, Entry::reported(99, ONLINE));
        fixture.install(4, Entry::reported(3, ONLINE));

        let mut locks = fixture.table.lock_set();
        assert_eq!(fixture.resolver().resolve(&mut locks, &3), Some(Resolution::Existing(4)));
    }

    #[test]
    fn test_occupied_home_probes_forward() {
        let fixture = Fixture::new(4);
        fixture.install(3, Entry::reported(99, ONLINE));

        let mut locks = fixture.table.lock_set();
        assert_eq!(fixture.resolver().resolve(&mut locks, &3), Some(Resolution::New(4)));
    }

    #[test]
    fn test_offline_entry_is_reclaimed_in_window_order() {
        let fixture = Fixture::new(2);
        fixture.install(0, Entry::reported(0, ONLINE));
        fixture.install(1, Entry::loaded(1));
        fixture.install(2, Entry::reported(2, ONLINE));
        fixture.install(3, Entry::reported(3, ONLINE));

        // Slot 1 is loader-backed but status-less, so it is the victim.
        let mut locks = fixture.table.lock_set();
        assert_eq!(fixture.resolver().resolve(&mut locks, &4), Some(Resolution::New(1)));
        assert!(locks.entry(1).is_none());
    }

    #[test]
    fn test_reclaim_severs_both_directions() {
        let fixture = Fixture::new(2);
        let mut watcher = Entry::reported(0, ONLINE);
        watcher.fresh = true;
        fixture.install(0, watcher);
        fixture.install(1, Entry::loaded(1));
        fixture.install(2, Entry::reported(2, ONLINE));
        fixture.install(3, Entry::reported(3, ONLINE));

        // 0 follows 1, and 1 follows 2.
        fixture.link(0, 1);
        fixture.link(1, 2);

        let mut locks = fixture.table.lock_set();
        assert_eq!(fixture.resolver().resolve(&mut locks, &4), Some(Resolution::New(1)));
        drop(locks);

        assert!(!fixture.follows.has(0, 1), "incoming edge must be severed");
        assert!(!fixture.followers.has(1, 0));
        assert!(!fixture.follows.has(1, 2), "outgoing edge must be severed");
        assert!(!fixture.followers.has(2, 1));
        assert_eq!(fixture.fresh_flag(0), Some(false), "watcher loses freshness");
        assert_eq!(fixture.fresh_flag(2), Some(false));
    }

    #[test]
    fn test_saturated_window_overwrites_home() {
        let fixture = Fixture::new(2);
        for slot in 0..4 {
            fixture.install(slot, Entry::reported(slot, ONLINE));
        }
        fixture.link(2, 3);
        fixture.link(1, 2);

        let mut locks = fixture.table.lock_set();
        assert_eq!(fixture.resolver().resolve(&mut locks, &6), Some(Resolution::New(2)));
        drop(locks);

        assert!(!fixture.follows.has(2, 3), "outgoing edge of the victim is severed");
        assert!(fixture.follows.has(1, 2), "incoming edge of the victim survives");
    }

    #[test]
    fn test_pinned_slot_is_never_an_eviction_victim() {
        let fixture = Fixture::new(2);
        fixture.install(0, Entry::loaded(0));
        fixture.install(1, Entry::reported(1, ONLINE));
        fixture.install(2, Entry::reported(2, ONLINE));
        fixture.install(3, Entry::reported(3, ONLINE));

        // Slot 0 is offline but pinned by the operation itself; with the
        // rest of the window online, nothing is claimable for id 4.
        let mut locks = fixture.table.lock_set();
        locks.claim(0);
        assert_eq!(fixture.resolver().resolve(&mut locks, &4), None);
        assert!(locks.entry(0).is_some(), "the pinned entry must survive");
        assert!(locks.is_pinned(0));
        locks.release(0);
    }

    #[test]
    fn test_eviction_skips_pinned_slots_for_other_victims() {
        let fixture = Fixture::new(2);
        fixture.install(0, Entry::loaded(0));
        fixture.install(1, Entry::loaded(1));
        fixture.install(2, Entry::reported(2, ONLINE));
        fixture.install(3, Entry::reported(3, ONLINE));

        // Both 0 and 1 are offline, but 0 is pinned: 1 is the victim.
        let mut locks = fixture.table.lock_set();
        locks.claim(0);
        assert_eq!(fixture.resolver().resolve(&mut locks, &4), Some(Resolution::New(1)));
        assert!(locks.entry(0).is_some());
        locks.release(1);
        locks.release(0);
    }

    #[test]
    fn test_resolution_is_stable_for_known_id() {
        let fixture = Fixture::new(2);
        let resolver = fixture.resolver();

        let mut locks = fixture.table.lock_set();
        let Some(Resolution::New(slot)) = resolver.resolve(&mut locks, &9) else {
            panic!("first resolution must claim a new slot");
        };
        *locks.entry(slot) = Some(Entry::reported(9, ONLINE));
        drop(locks);

        let mut locks = fixture.table.lock_set();
        assert_eq!(resolver.resolve(&mut locks, &9), Some(Resolution::Existing(slot)));
    }
}
