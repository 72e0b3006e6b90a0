// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Boundary types and the follow-list loader contract.

use futures::Stream;

/// Presence status reported for a user.
///
/// Kept deliberately small; an entry that has never received a status, or
/// whose last status was offline, may have its slot reclaimed under
/// capacity pressure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UserMeta {
    /// Whether the user currently has an active session.
    pub online: bool,
}

impl UserMeta {
    /// Creates a status record.
    #[must_use]
    pub const fn new(online: bool) -> Self {
        Self { online }
    }
}

/// One followed user as reported by the backing store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FollowRecord<I> {
    /// Stable identifier of the followed user.
    pub id: I,
    /// Display name of the followed user.
    pub username: String,
}

impl<I> FollowRecord<I> {
    /// Creates a record for one followed user.
    pub fn new(id: I, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
        }
    }
}

/// A followed user as currently projected by the cache.
///
/// `meta` is `None` when the user has never reported a status since its
/// entry was created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserInfo<I> {
    /// Stable identifier of the followed user.
    pub id: I,
    /// Display name of the followed user.
    pub username: String,
    /// Last known presence status, if any.
    pub meta: Option<UserMeta>,
}

/// Asynchronous provider of a user's authoritative follow list.
///
/// The cache calls [`load`](Self::load) whenever it has no loader-backed
/// projection for a user and fully drains the returned stream before
/// touching any cache state, so a failed load leaves the cache unchanged
/// and the error reaches the caller of
/// [`FollowGraph::followed`](crate::FollowGraph::followed) as-is.
///
/// A blanket implementation covers plain closures, which is the convenient
/// form for call sites and tests:
///
/// ```
/// use std::convert::Infallible;
/// use audience::{FollowRecord, FollowSource};
/// use futures::stream;
///
/// let source = |id: &String| {
///     stream::iter(vec![Ok::<_, Infallible>(FollowRecord::new(
///         format!("friend-of-{id}"),
///         "Friend",
///     ))])
/// };
/// let _follows = source.load(&"alice".to_string());
/// ```
pub trait FollowSource<I> {
    /// Error produced when the backing store cannot deliver the list.
    type Error;

    /// Stream of followed-user records for one load.
    type Follows: Stream<Item = Result<FollowRecord<I>, Self::Error>> + Send;

    /// Starts loading the follow list of `id`.
    fn load(&self, id: &I) -> Self::Follows;
}

impl<I, F, S, E> FollowSource<I> for F
where
    F: Fn(&I) -> S,
    S: Stream<Item = Result<FollowRecord<I>, E>> + Send,
{
    type Error = E;
    type Follows = S;

    fn load(&self, id: &I) -> S {
        self(id)
    }
}
