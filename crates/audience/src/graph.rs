// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The public cache type: [`FollowGraph`] and its builder.

use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;

use futures::TryStreamExt;
use hashbrown::DefaultHashBuilder;
use tracing::{debug, trace};

use crate::pairs::PairSet;
use crate::probe::{Resolution, Resolver};
use crate::slots::{Entry, LockSet, SlotTable};
use crate::source::{FollowRecord, FollowSource, UserInfo, UserMeta};

/// Bounded, concurrent, in-memory projection of the follow graph of
/// currently-online users.
///
/// The graph answers two questions: "whom does this user follow, and who
/// among them is online?" ([`followed`](Self::followed)) and "which
/// watching users should be notified when this user's status changes?"
/// ([`tell`](Self::tell)). The authoritative follow lists come from a
/// [`FollowSource`]; the cache keeps a best-effort projection in a fixed
/// open-addressed slot table and degrades by dropping updates, never by
/// fabricating them.
///
/// # Examples
///
/// ```
/// use std::convert::Infallible;
/// use audience::{FollowGraph, FollowRecord, UserMeta};
/// use futures::stream;
/// # futures::executor::block_on(async {
///
/// let graph = FollowGraph::builder(|_id: &String| {
///     stream::iter(vec![Ok::<_, Infallible>(FollowRecord::new(
///         "bob".to_string(),
///         "Bob",
///     ))])
/// })
/// .log_capacity(8)
/// .build();
///
/// let follows = graph.followed(&"alice".to_string()).await?;
/// assert_eq!(follows.len(), 1);
/// assert_eq!(follows[0].username, "Bob");
/// assert!(follows[0].meta.is_none());
///
/// // Alice is now watching Bob.
/// let notify = graph.tell(&"bob".to_string(), UserMeta { online: true });
/// assert_eq!(notify, vec!["alice".to_string()]);
/// # Ok::<(), Infallible>(())
/// # });
/// ```
pub struct FollowGraph<I, S, H = DefaultHashBuilder> {
    source: S,
    table: SlotTable<I, H>,
    follows: PairSet,
    followers: PairSet,
}

impl<I, S, H> std::fmt::Debug for FollowGraph<I, S, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FollowGraph")
            .field("capacity", &self.table.capacity())
            .field("follows", &self.follows)
            .field("followers", &self.followers)
            .finish_non_exhaustive()
    }
}

impl<I, S> FollowGraph<I, S>
where
    S: FollowSource<I>,
{
    /// Creates a new builder for configuring a `FollowGraph`.
    #[must_use]
    pub fn builder(source: S) -> FollowGraphBuilder<I, S, DefaultHashBuilder> {
        FollowGraphBuilder::new(source)
    }

    /// Creates a graph with `2^log_capacity` slots and default hashing.
    ///
    /// # Panics
    ///
    /// Panics if `log_capacity > 31`.
    #[must_use]
    pub fn new(source: S, log_capacity: u32) -> Self {
        Self::builder(source).log_capacity(log_capacity).build()
    }
}

impl<I, S, H> FollowGraph<I, S, H>
where
    I: Clone + Eq + Hash,
    S: FollowSource<I>,
    H: BuildHasher,
{
    /// Number of slots in the table.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.table.capacity()
    }

    fn resolver(&self) -> Resolver<'_, I, H> {
        Resolver::new(&self.table, &self.follows, &self.followers)
    }

    /// Returns the users `id` follows, with their last known status.
    ///
    /// When the cache already holds a loader-backed list for `id`, the
    /// result is built synchronously from the cached projection (entries
    /// whose username is not yet known are skipped). Otherwise the
    /// [`FollowSource`] is consulted: all locks are released before the
    /// load, its stream is drained to completion, and only then is the
    /// slot re-resolved (it may have moved in the meantime) and the
    /// loaded records merged in. Under saturation, a loaded record that
    /// cannot claim a slot is dropped from the projection and the result.
    ///
    /// # Errors
    ///
    /// A loader failure is returned verbatim; no cache state is mutated in
    /// that case.
    pub async fn followed(&self, id: &I) -> Result<Vec<UserInfo<I>>, S::Error> {
        {
            let mut locks = self.table.lock_set();
            if let Some(Resolution::Existing(slot)) = self.resolver().resolve(&mut locks, id) {
                let fresh = locks.entry(slot).as_ref().is_some_and(|entry| entry.fresh);
                if fresh {
                    return Ok(self.snapshot(&mut locks, slot));
                }
            }
        }

        let records: Vec<FollowRecord<I>> = self.source.load(id).try_collect().await?;
        debug!(count = records.len(), "merging loaded follow list");

        let mut locks = self.table.lock_set();
        let resolution = self
            .resolver()
            .resolve(&mut locks, id)
            .expect("resolution with no pinned slots always lands");
        let left = match resolution {
            Resolution::New(slot) => {
                *locks.entry(slot) = Some(Entry::loaded(id.clone()));
                slot
            }
            Resolution::Existing(slot) => {
                locks.entry(slot).as_mut().expect("existing slot holds an entry").fresh = true;
                slot
            }
        };
        Ok(self.merge(&mut locks, left, records))
    }

    /// Records that `a` follows `b`.
    ///
    /// A no-op unless both users already occupy slots: edges are only
    /// useful when both endpoints are tracked, and tracking a stranger
    /// would consume a scarce slot with no benefit.
    pub fn follow(&self, a: &I, b: &I) {
        self.toggle(true, a, b);
    }

    /// Records that `a` no longer follows `b`.
    ///
    /// A no-op unless both users already occupy slots; removing an absent
    /// edge is also a no-op.
    pub fn unfollow(&self, a: &I, b: &I) {
        self.toggle(false, a, b);
    }

    /// Updates the status of `id` and returns the ids of the users whose
    /// cached follow lists contain it, i.e. the ones to notify.
    ///
    /// A user seen here for the first time is installed with the given
    /// status and an empty watcher list: nobody can be subscribed to a
    /// user whose slot was just claimed.
    pub fn tell(&self, id: &I, meta: UserMeta) -> Vec<I> {
        let mut locks = self.table.lock_set();
        let resolution = self
            .resolver()
            .resolve(&mut locks, id)
            .expect("resolution with no pinned slots always lands");
        match resolution {
            Resolution::Existing(slot) => {
                locks.entry(slot).as_mut().expect("existing slot holds an entry").meta = Some(meta);
                self.watchers(&mut locks, slot)
            }
            Resolution::New(slot) => {
                *locks.entry(slot) = Some(Entry::reported(id.clone(), meta));
                Vec::new()
            }
        }
    }

    /// Adds or removes the follow edge between two already-tracked users.
    /// The left slot is resolved (and locked) before the right one; a
    /// right-hand resolution that would need to reclaim a pinned slot
    /// fails instead, keeping the no-op path free of side effects on the
    /// caller's own entry.
    fn toggle(&self, on: bool, a: &I, b: &I) {
        let mut locks = self.table.lock_set();
        let Some(Resolution::Existing(left)) = self.resolver().resolve(&mut locks, a) else {
            return;
        };
        let Some(Resolution::Existing(right)) = self.resolver().resolve(&mut locks, b) else {
            return;
        };
        self.follows.toggle(on, left, right);
        self.followers.toggle(on, right, left);
    }

    /// Builds the projection of a fresh left slot from its outgoing edges.
    fn snapshot(&self, locks: &mut LockSet<'_, I>, left: u32) -> Vec<UserInfo<I>> {
        let targets: Vec<u32> = self.follows.read(left).collect();
        let mut result = Vec::with_capacity(targets.len());
        for right in targets {
            let info = locks.with_cell(right, |cell| {
                cell.as_ref().and_then(|entry| {
                    let username = entry.username.clone()?;
                    Some(UserInfo {
                        id: entry.id.clone(),
                        username,
                        meta: entry.meta,
                    })
                })
            });
            if let Some(info) = info {
                result.push(info);
            }
        }
        result
    }

    /// Merges loaded records into the table while the left slot is held.
    ///
    /// Each record's slot is resolved under the same lock set (left before
    /// right) and released again before the next record. A record that
    /// cannot claim any slot, because its window is saturated and its home
    /// is pinned by this very operation, is dropped from both the table
    /// and the result.
    fn merge(&self, locks: &mut LockSet<'_, I>, left: u32, records: Vec<FollowRecord<I>>) -> Vec<UserInfo<I>> {
        let mut result = Vec::with_capacity(records.len());
        for FollowRecord { id, username } in records {
            let Some(resolution) = self.resolver().resolve(locks, &id) else {
                trace!("dropping follow record with no claimable slot");
                continue;
            };
            let (right, meta) = match resolution {
                Resolution::New(slot) => {
                    *locks.entry(slot) = Some(Entry::merged(id.clone(), username.clone()));
                    (slot, None)
                }
                Resolution::Existing(slot) => {
                    let entry = locks.entry(slot).as_mut().expect("existing slot holds an entry");
                    entry.username = Some(username.clone());
                    (slot, entry.meta)
                }
            };
            self.follows.add(left, right);
            self.followers.add(right, left);
            locks.release(right);
            result.push(UserInfo { id, username, meta });
        }
        result
    }

    /// Users whose cached follow lists contain `slot`.
    ///
    /// An edge counts only when present in both directions; slot reuse can
    /// leave the two sets briefly asymmetric, and a one-sided edge must
    /// never produce a notification.
    fn watchers(&self, locks: &mut LockSet<'_, I>, slot: u32) -> Vec<I> {
        let candidates: Vec<u32> = self.followers.read(slot).collect();
        let mut result = Vec::with_capacity(candidates.len());
        for left in candidates {
            if !self.follows.has(left, slot) {
                continue;
            }
            let id = locks.with_cell(left, |cell| cell.as_ref().map(|entry| entry.id.clone()));
            if let Some(id) = id {
                result.push(id);
            }
        }
        result
    }
}

/// Builder for configuring a [`FollowGraph`].
///
/// # Examples
///
/// ```
/// use std::convert::Infallible;
/// use audience::{FollowGraph, FollowRecord};
/// use futures::stream;
///
/// let graph = FollowGraph::builder(|_id: &u64| {
///     stream::iter(Vec::<Result<FollowRecord<u64>, Infallible>>::new())
/// })
/// .log_capacity(12)
/// .build();
/// assert_eq!(graph.capacity(), 4096);
/// ```
pub struct FollowGraphBuilder<I, S, H> {
    source: S,
    log_capacity: u32,
    hash_builder: H,
    _marker: PhantomData<I>,
}

impl<I, S, H> std::fmt::Debug for FollowGraphBuilder<I, S, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FollowGraphBuilder")
            .field("log_capacity", &self.log_capacity)
            .finish_non_exhaustive()
    }
}

impl<I, S> FollowGraphBuilder<I, S, DefaultHashBuilder> {
    /// Creates a new builder with default settings.
    ///
    /// Defaults: `log_capacity = 16` (65 536 slots), the standard hasher.
    #[must_use]
    pub fn new(source: S) -> Self {
        Self {
            source,
            log_capacity: 16,
            hash_builder: DefaultHashBuilder::default(),
            _marker: PhantomData,
        }
    }
}

impl<I, S, H> FollowGraphBuilder<I, S, H> {
    /// Sets the slot count to `2^log_capacity`.
    #[must_use]
    pub const fn log_capacity(mut self, log_capacity: u32) -> Self {
        self.log_capacity = log_capacity;
        self
    }

    /// Replaces the hasher used to map user ids to home slots.
    #[must_use]
    pub fn hash_builder<H2: BuildHasher>(self, hash_builder: H2) -> FollowGraphBuilder<I, S, H2> {
        FollowGraphBuilder {
            source: self.source,
            log_capacity: self.log_capacity,
            hash_builder,
            _marker: PhantomData,
        }
    }

    /// Builds the graph with the configured settings.
    ///
    /// # Panics
    ///
    /// Panics if `log_capacity > 31`; slot indices must fit in the 32-bit
    /// halves of an edge key.
    #[must_use]
    pub fn build(self) -> FollowGraph<I, S, H>
    where
        S: FollowSource<I>,
    {
        FollowGraph {
            source: self.source,
            table: SlotTable::new(self.log_capacity, self.hash_builder),
            follows: PairSet::new(),
            followers: PairSet::new(),
        }
    }
}
