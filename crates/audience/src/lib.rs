// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A bounded, concurrent, in-memory cache of the follow graph of
//! currently-online users.
//!
//! For any user with an active session, [`FollowGraph`] remembers whom
//! that user follows, answers "who among them is currently online (and
//! with what status)", and, conversely, "which watching users
//! should be notified when this user's status changes". The authoritative
//! follow lists live elsewhere and are fetched on demand through a
//! [`FollowSource`]; the cache maintains a best-effort projection suitable
//! for push notifications.
//!
//! # Architecture
//!
//! 1. **Fixed slot table.** User entries live in `2^C` open-addressed
//!    slots with bounded linear probing (at most 20 positions past the
//!    hash home). Nothing in the table ever grows.
//! 2. **Striped locking.** 1024 mutexes are shared by all slots
//!    (`slot & 0x3FF` selects the stripe), so lock memory is independent
//!    of capacity. Multi-slot operations route every acquisition through a
//!    pin-counted guard set that tolerates two slots sharing a stripe, and
//!    always take the left (following) slot before the right (followed)
//!    one.
//! 3. **Bit-packed edge sets.** Follow edges reference slot indices, never
//!    user ids, packed as `left << 32 | right` into two lock-free ordered
//!    sets: the follow list and its transpose. A prefix range scan yields
//!    one slot's neighbors without touching any slot lock.
//! 4. **Graceful saturation.** When a probe window fills up, offline
//!    entries are reclaimed first; as a last resort the home slot is
//!    overwritten. Slots the in-flight operation itself has pinned are
//!    never reclaimed; an update that cannot claim a slot is dropped.
//!    Updates can be lost under pressure, but the cache never fabricates
//!    a notification for a reclaimed-and-reused slot.
//!
//! Only [`FollowGraph::followed`] suspends, and never while holding a slot
//! lock: the loader runs between two independent resolutions, and the slot
//! is not claimed until the load has completed successfully, so a failed
//! or cancelled load leaves the table untouched.
//!
//! # Example
//!
//! ```
//! use std::convert::Infallible;
//! use audience::{FollowGraph, FollowRecord, UserMeta};
//! use futures::stream;
//! # futures::executor::block_on(async {
//!
//! // The source is normally a database query; any closure returning a
//! // stream of records will do.
//! let graph = FollowGraph::builder(|_id: &String| {
//!     stream::iter(vec![
//!         Ok::<_, Infallible>(FollowRecord::new("bob".to_string(), "Bob")),
//!         Ok(FollowRecord::new("carol".to_string(), "Carol")),
//!     ])
//! })
//! .log_capacity(10)
//! .build();
//!
//! // Load alice's follow list into the cache.
//! let follows = graph.followed(&"alice".to_string()).await?;
//! assert_eq!(follows.len(), 2);
//!
//! // Bob comes online: alice is watching and should be notified.
//! let notify = graph.tell(&"bob".to_string(), UserMeta { online: true });
//! assert_eq!(notify, vec!["alice".to_string()]);
//!
//! // Alice stops following bob; no more notifications.
//! graph.unfollow(&"alice".to_string(), &"bob".to_string());
//! assert!(graph.tell(&"bob".to_string(), UserMeta { online: false }).is_empty());
//! # Ok::<(), Infallible>(())
//! # });
//! ```

mod graph;
mod pairs;
mod probe;
mod slots;
mod source;

pub use graph::{FollowGraph, FollowGraphBuilder};
pub use source::{FollowRecord, FollowSource, UserInfo, UserMeta};

// Re-export the default hasher type for convenience; it appears in the
// `FollowGraph` signature.
pub use hashbrown::DefaultHashBuilder;

#[cfg(test)]
mod testing;
