// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of vellum.
//
// vellum is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// vellum is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with vellum.  If not,
// see <http://www.gnu.org/licenses/>.

//! # reactions
//!
//! The like/dislike state machine.
//!
//! Per (user, target) the state is one of nothing / liked / disliked, and the two toggle
//! operations walk it: a first reaction inserts a row, toggling the same reaction again
//! soft-deletes it ("unlike"), and toggling the opposite one mutates the row's kind in place.
//! At most one *active* reaction per (user, target), ever.
//!
//! Counter maintenance is by exact delta: each transition implies a precise adjustment to the
//! target's like/dislike counters, applied through the store's atomic increment/decrement. Two
//! racing toggles on the *same* (user, target) can still interleave between the row read & write;
//! rather than recount from the reaction table on every toggle (two extra reads per request, and
//! itself racy), a [ReconcileCounters] task is queued after each transition to recount off the
//! hot path & square the counters with the reaction table.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tracing::{debug, error, info};

use crate::{
    background::{self, Task},
    entities::{BlogId, Reaction, ReactionId, ReactionKind, TargetKind, UserId},
    popularity,
    storage::{self, Backend as StorageBackend, BlogUpdate, CounterField},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Blog {id} not found"))]
    UnknownTarget { id: BlogId },
    #[snafu(display("Failed to check that blog {id} exists: {source}"))]
    TargetLookup { id: BlogId, source: storage::Error },
    #[snafu(display("Failed to look up the existing reaction: {source}"))]
    ReactionLookup { source: storage::Error },
    #[snafu(display("Failed to write the reaction: {source}"))]
    ReactionWrite { source: storage::Error },
    #[snafu(display("Failed to adjust the {field} counter: {source}"))]
    Counter {
        field: &'static str,
        source: storage::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// A user's reaction state with respect to one target.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionState {
    None,
    Liked,
    Disliked,
}

impl From<Option<ReactionKind>> for ReactionState {
    fn from(value: Option<ReactionKind>) -> Self {
        match value {
            None => ReactionState::None,
            Some(ReactionKind::Like) => ReactionState::Liked,
            Some(ReactionKind::Dislike) => ReactionState::Disliked,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          the toggle                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The reaction toggle of vellum.
///
/// `tasks` is the handle used to queue [ReconcileCounters] after each transition; it's best
/// effort -- a full queue drops the reconciliation, not the request.
pub struct ReactionToggle {
    storage: Arc<dyn StorageBackend + Send + Sync>,
    tasks: Option<background::Queue>,
}

impl ReactionToggle {
    pub fn new(
        storage: Arc<dyn StorageBackend + Send + Sync>,
        tasks: Option<background::Queue>,
    ) -> ReactionToggle {
        ReactionToggle { storage, tasks }
    }

    /// Toggle `user`'s like of `target`; return the state the pair landed in.
    pub async fn toggle_like(&self, user: &UserId, target: &BlogId) -> Result<ReactionState> {
        self.toggle(user, target, ReactionKind::Like).await
    }

    /// Toggle `user`'s dislike of `target`; return the state the pair landed in.
    pub async fn toggle_dislike(&self, user: &UserId, target: &BlogId) -> Result<ReactionState> {
        self.toggle(user, target, ReactionKind::Dislike).await
    }

    async fn toggle(
        &self,
        user: &UserId,
        target: &BlogId,
        desired: ReactionKind,
    ) -> Result<ReactionState> {
        // Both operations check the target; an earlier rendition of this service only checked on
        // the dislike path, which made for a baffling asymmetry in the API.
        self.storage
            .blog_by_id(target)
            .await
            .context(TargetLookupSnafu { id: *target })?
            .context(UnknownTargetSnafu { id: *target })?;

        // "No active reaction" is the normal starting state, not a failure.
        let existing = self
            .storage
            .active_reaction(user, target)
            .await
            .context(ReactionLookupSnafu)?;

        let now = Utc::now();
        let (state, like_delta, dislike_delta) = match existing {
            None => {
                self.storage
                    .put_reaction(&Reaction {
                        id: ReactionId::new(),
                        user_id: *user,
                        target_id: *target,
                        target_kind: TargetKind::Blog,
                        kind: desired,
                        is_deleted: false,
                        created_at: now,
                        updated_at: now,
                    })
                    .await
                    .context(ReactionWriteSnafu)?;
                match desired {
                    ReactionKind::Like => (ReactionState::Liked, 1, 0),
                    ReactionKind::Dislike => (ReactionState::Disliked, 0, 1),
                }
            }
            Some(reaction) if reaction.kind == desired => {
                // Toggling the reaction the user already has removes it.
                self.storage
                    .soft_delete_reaction(user, target)
                    .await
                    .context(ReactionWriteSnafu)?;
                match desired {
                    ReactionKind::Like => (ReactionState::None, -1, 0),
                    ReactionKind::Dislike => (ReactionState::None, 0, -1),
                }
            }
            Some(reaction) => {
                // Flipping like ↔ dislike mutates the same row.
                self.storage
                    .put_reaction(&Reaction {
                        kind: desired,
                        updated_at: now,
                        ..reaction
                    })
                    .await
                    .context(ReactionWriteSnafu)?;
                match desired {
                    ReactionKind::Like => (ReactionState::Liked, 1, -1),
                    ReactionKind::Dislike => (ReactionState::Disliked, -1, 1),
                }
            }
        };

        self.apply_delta(target, CounterField::Likes, like_delta)
            .await?;
        self.apply_delta(target, CounterField::Dislikes, dislike_delta)
            .await?;

        // The derived score; failure here doesn't undo the transition.
        if let Err(err) = self.refresh_popularity(target).await {
            error!("failed to refresh popularity for blog {}: {}", target, err);
        }

        // Queue a recount to catch any drift from interleaved toggles on this pair.
        if let Some(tasks) = &self.tasks {
            if let Err(err) = tasks.send(ReconcileCounters { blog_id: *target }) {
                debug!("dropped counter reconciliation for {}: {}", target, err);
            }
        }

        debug!("user {} now {:?} on blog {}", user, state, target);
        Ok(state)
    }

    async fn apply_delta(&self, target: &BlogId, field: CounterField, delta: i64) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        self.storage
            .adjust_counter(target, field, delta)
            .await
            .context(CounterSnafu {
                field: field.as_str(),
            })
    }

    async fn refresh_popularity(&self, blog: &BlogId) -> std::result::Result<(), storage::Error> {
        let counts = self.storage.counts(blog).await?;
        self.storage
            .update_blog(
                blog,
                &BlogUpdate {
                    popularity: Some(popularity::score(&counts)),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    counter reconciliation                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Background task squaring a blog's like/dislike counters with the reaction table.
///
/// The counters are authoritative for *reads*; the reaction table is authoritative for *truth*.
/// This recounts the active reactions, applies a compensating delta for any drift & refreshes
/// popularity. Idempotent, so dropping or re-running one is harmless.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ReconcileCounters {
    pub blog_id: BlogId,
}

#[async_trait]
impl Task for ReconcileCounters {
    async fn exec(self: Box<Self>, context: background::Context) -> background::Result<()> {
        let storage = &context.storage;
        let likes = storage
            .count_reactions(&self.blog_id, ReactionKind::Like)
            .await
            .map_err(background::Error::new)?;
        let dislikes = storage
            .count_reactions(&self.blog_id, ReactionKind::Dislike)
            .await
            .map_err(background::Error::new)?;
        let counts = storage
            .counts(&self.blog_id)
            .await
            .map_err(background::Error::new)?;

        let like_drift = likes as i64 - counts.likes as i64;
        let dislike_drift = dislikes as i64 - counts.dislikes as i64;
        if like_drift != 0 {
            info!("blog {}: like counter drifted by {}", self.blog_id, -like_drift);
            storage
                .adjust_counter(&self.blog_id, CounterField::Likes, like_drift)
                .await
                .map_err(background::Error::new)?;
        }
        if dislike_drift != 0 {
            info!(
                "blog {}: dislike counter drifted by {}",
                self.blog_id, -dislike_drift
            );
            storage
                .adjust_counter(&self.blog_id, CounterField::Dislikes, dislike_drift)
                .await
                .map_err(background::Error::new)?;
        }

        if like_drift != 0 || dislike_drift != 0 {
            let counts = storage
                .counts(&self.blog_id)
                .await
                .map_err(background::Error::new)?;
            storage
                .update_blog(
                    &self.blog_id,
                    &BlogUpdate {
                        popularity: Some(popularity::score(&counts)),
                        ..Default::default()
                    },
                )
                .await
                .map_err(background::Error::new)?;
        }
        Ok(())
    }

    fn timeout(&self) -> Option<std::time::Duration> {
        Some(std::time::Duration::from_secs(5))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{mk_blog, MemoryStore};

    fn toggle(store: &Arc<MemoryStore>) -> ReactionToggle {
        ReactionToggle::new(store.clone(), None)
    }

    #[tokio::test]
    async fn unknown_target_is_refused_by_both_operations() {
        let store = Arc::new(MemoryStore::new());
        let t = toggle(&store);
        let user = UserId::new();
        let bogus = BlogId::new();
        assert!(matches!(
            t.toggle_like(&user, &bogus).await,
            Err(Error::UnknownTarget { .. })
        ));
        assert!(matches!(
            t.toggle_dislike(&user, &bogus).await,
            Err(Error::UnknownTarget { .. })
        ));
    }

    #[tokio::test]
    async fn like_then_unlike_restores_everything() {
        let store = Arc::new(MemoryStore::new());
        let blog = mk_blog(&store).await;
        let original_popularity = store.blog_by_id(&blog.id).await.unwrap().unwrap().popularity;
        let t = toggle(&store);
        let user = UserId::new();

        assert_eq!(
            ReactionState::Liked,
            t.toggle_like(&user, &blog.id).await.unwrap()
        );
        let after_like = store.blog_by_id(&blog.id).await.unwrap().unwrap();
        assert_eq!(1, after_like.counts.likes);
        assert!(after_like.popularity > original_popularity);

        assert_eq!(
            ReactionState::None,
            t.toggle_like(&user, &blog.id).await.unwrap()
        );
        let after_unlike = store.blog_by_id(&blog.id).await.unwrap().unwrap();
        assert_eq!(0, after_unlike.counts.likes);
        assert_eq!(original_popularity, after_unlike.popularity);
    }

    #[tokio::test]
    async fn flipping_mutates_in_place() {
        let store = Arc::new(MemoryStore::new());
        let blog = mk_blog(&store).await;
        let t = toggle(&store);
        let user = UserId::new();

        assert_eq!(
            ReactionState::Disliked,
            t.toggle_dislike(&user, &blog.id).await.unwrap()
        );
        let first = store
            .active_reaction(&user, &blog.id)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            ReactionState::Liked,
            t.toggle_like(&user, &blog.id).await.unwrap()
        );
        let second = store
            .active_reaction(&user, &blog.id)
            .await
            .unwrap()
            .unwrap();
        // Same row, new kind.
        assert_eq!(first.id, second.id);
        assert_eq!(ReactionKind::Like, second.kind);

        let counts = store.counts_for(&blog.id).await;
        assert_eq!((1, 0), (counts.likes, counts.dislikes));
    }

    #[tokio::test]
    async fn arbitrary_sequences_track_the_transition_table() {
        let store = Arc::new(MemoryStore::new());
        let blog = mk_blog(&store).await;
        let t = toggle(&store);
        let user = UserId::new();

        use ReactionKind::*;
        use ReactionState::*;
        let script = [
            (Like, Liked),
            (Like, None),
            (Dislike, Disliked),
            (Dislike, None),
            (Like, Liked),
            (Dislike, Disliked),
            (Like, Liked),
            (Like, None),
        ];
        for (op, expected) in script {
            let got = match op {
                Like => t.toggle_like(&user, &blog.id).await.unwrap(),
                Dislike => t.toggle_dislike(&user, &blog.id).await.unwrap(),
            };
            assert_eq!(expected, got);
            // Never more than one active reaction per (user, target).
            assert!(store.active_reaction_count(&user, &blog.id).await <= 1);
            // Counters track the state exactly.
            let counts = store.counts_for(&blog.id).await;
            match got {
                Liked => assert_eq!((1, 0), (counts.likes, counts.dislikes)),
                Disliked => assert_eq!((0, 1), (counts.likes, counts.dislikes)),
                None => assert_eq!((0, 0), (counts.likes, counts.dislikes)),
            }
        }
    }

    #[tokio::test]
    async fn two_users_count_independently() {
        let store = Arc::new(MemoryStore::new());
        let blog = mk_blog(&store).await;
        let t = toggle(&store);
        let (u0, u1) = (UserId::new(), UserId::new());

        t.toggle_like(&u0, &blog.id).await.unwrap();
        t.toggle_dislike(&u1, &blog.id).await.unwrap();
        let counts = store.counts_for(&blog.id).await;
        assert_eq!((1, 1), (counts.likes, counts.dislikes));
    }

    #[tokio::test]
    async fn reconciliation_corrects_drift() {
        let store = Arc::new(MemoryStore::new());
        let blog = mk_blog(&store).await;
        let t = toggle(&store);
        let user = UserId::new();
        t.toggle_like(&user, &blog.id).await.unwrap();

        // Inject drift as a racing toggle would have left it.
        store
            .adjust_counter(&blog.id, CounterField::Likes, 2)
            .await
            .unwrap();
        assert_eq!(3, store.counts_for(&blog.id).await.likes);

        Box::new(ReconcileCounters { blog_id: blog.id })
            .exec(background::Context {
                storage: store.clone(),
            })
            .await
            .unwrap();
        let after = store.blog_by_id(&blog.id).await.unwrap().unwrap();
        assert_eq!(1, after.counts.likes);
        assert_eq!(popularity::score(&after.counts), after.popularity);
    }
}
