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

//! # views
//!
//! The fraud-aware view-counting pipeline.
//!
//! A "view" only becomes a counted view after running a gauntlet: identity precondition, bot
//! filter, recency dedup, IP-velocity window, account IP-rotation window. Only then do we touch
//! the counter store & the audit trail. The gauntlet's verdicts are *values* ([ViewOutcome]), not
//! errors: a deduped or bot-flagged view is a perfectly successful request that simply moved no
//! counter, and a rate-limited view needs to be distinguishable from a server fault all the way
//! out to the HTTP status code. [Error] is reserved for bad input & for the durable store
//! actually failing.

use std::{net::IpAddr, sync::Arc, time::Duration};

use chrono::Utc;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};
use tracing::{debug, error, warn};

use crate::{
    entities::{BlogId, UserId, ViewId, ViewRecord},
    popularity,
    storage::{self, Backend as StorageBackend, BlogUpdate, CounterField},
    window::Windows,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("A view must carry a viewer id or an IP address"))]
    MissingIdentity { backtrace: Backtrace },
    #[snafu(display("Failed to check for a recent view: {source}"))]
    Dedup { source: storage::Error },
    #[snafu(display("The {limit} window check failed: {source}"))]
    Window {
        limit: RateLimitKind,
        source: storage::Error,
    },
    #[snafu(display("Failed to increment the view count: {source}"))]
    Count { source: storage::Error },
    #[snafu(display("Failed to append the view record: {source}"))]
    Record { source: storage::Error },
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       policy & outcomes                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Which fraud window rejected the view.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitKind {
    /// Too many distinct blogs from one IP in a short window
    IpVelocity,
    /// Too many distinct IPs presented by one account in a longer window
    IpRotation,
}

impl std::fmt::Display for RateLimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateLimitKind::IpVelocity => write!(f, "IP-velocity"),
            RateLimitKind::IpRotation => write!(f, "IP-rotation"),
        }
    }
}

/// The result of feeding one view event through the pipeline.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ViewOutcome {
    /// The view was counted & recorded.
    Counted,
    /// This viewer/IP already viewed this blog within the dedup window; idempotent success.
    AlreadyCounted,
    /// The user agent looks like automation; silently not counted.
    Ignored,
    /// One of the fraud windows tripped.
    RateLimited(RateLimitKind),
}

/// Thresholds for the fraud heuristics.
///
/// These are tuning parameters, not contract; they're carried in configuration & the tests build
/// their own. The defaults are the values the service has run with in production.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct FraudPolicy {
    /// A (viewer, blog) or (IP, blog) pair counts at most once per this window.
    #[serde(rename = "dedup-window")]
    pub dedup_window: Duration,
    /// Width of the IP-velocity window.
    #[serde(rename = "velocity-window")]
    pub velocity_window: Duration,
    /// Maximum distinct blogs one IP may touch within the velocity window.
    #[serde(rename = "velocity-limit")]
    pub velocity_limit: u64,
    /// Width of the IP-rotation window.
    #[serde(rename = "rotation-window")]
    pub rotation_window: Duration,
    /// Maximum distinct IPs one account may present within the rotation window.
    #[serde(rename = "rotation-limit")]
    pub rotation_limit: u64,
}

impl Default for FraudPolicy {
    fn default() -> Self {
        FraudPolicy {
            dedup_window: Duration::from_secs(24 * 60 * 60),
            velocity_window: Duration::from_secs(5 * 60),
            velocity_limit: 10,
            rotation_window: Duration::from_secs(60 * 60),
            rotation_limit: 5,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          bot filter                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

lazy_static! {
    // Substring match against the lowercased User-Agent. Crude, but these catch the bulk of
    // automated traffic; anything fancier belongs in an edge WAF, not here.
    static ref BOT_SIGNATURES: Vec<&'static str> = vec![
        "bot",
        "spider",
        "crawl",
        "slurp",
        "curl",
        "wget",
        "python-requests",
        "httpclient",
        "feedfetcher",
        "mediapartners-google",
    ];
}

fn is_bot(user_agent: &str) -> bool {
    let ua = user_agent.to_lowercase();
    BOT_SIGNATURES.iter().any(|sig| ua.contains(sig))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         the tracker                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The view-counting pipeline of vellum.
pub struct ViewTracker {
    storage: Arc<dyn StorageBackend + Send + Sync>,
    windows: Windows,
    policy: FraudPolicy,
}

impl ViewTracker {
    pub fn new(
        storage: Arc<dyn StorageBackend + Send + Sync>,
        windows: Windows,
        policy: FraudPolicy,
    ) -> ViewTracker {
        ViewTracker {
            storage,
            windows,
            policy,
        }
    }

    /// Feed one view event through the pipeline; see [ViewOutcome] for the possible verdicts.
    ///
    /// Each step short-circuits. The commit step increments the view counter atomically, appends
    /// the audit record, then refreshes the blog's popularity from freshly-read counts; a failed
    /// popularity refresh is logged & swallowed (the view has already been counted, which is the
    /// part that matters).
    pub async fn record_view(
        &self,
        blog: &BlogId,
        viewer: Option<&UserId>,
        ip: Option<IpAddr>,
        user_agent: &str,
    ) -> Result<ViewOutcome> {
        // 1. For a view to be attributable at all, we need *some* identity.
        if viewer.is_none() && ip.is_none() {
            return MissingIdentitySnafu.fail();
        }

        // 2. Automation doesn't get counted, but doesn't get an error either.
        if is_bot(user_agent) {
            debug!("bot filtered on blog {}: {:?}", blog, user_agent);
            return Ok(ViewOutcome::Ignored);
        }

        // 3. Recency dedup, against the durable view records.
        let since = Utc::now()
            - chrono::Duration::from_std(self.policy.dedup_window).unwrap(/* config-bounded */);
        if self
            .storage
            .viewed_since(blog, viewer, ip.as_ref(), &since)
            .await
            .context(DedupSnafu)?
        {
            debug!("duplicate view of blog {} within the dedup window", blog);
            return Ok(ViewOutcome::AlreadyCounted);
        }

        // 4. IP velocity: one address hammering many blogs.
        if let Some(ip) = ip.as_ref() {
            let n = self
                .windows
                .distinct_blogs_for_ip(ip, blog, self.policy.velocity_window)
                .await
                .context(WindowSnafu {
                    limit: RateLimitKind::IpVelocity,
                })?;
            if n > self.policy.velocity_limit {
                warn!("IP-velocity limit tripped for {}: {} blogs in window", ip, n);
                return Ok(ViewOutcome::RateLimited(RateLimitKind::IpVelocity));
            }
        }

        // 5. IP rotation: one account arriving from many addresses.
        if let (Some(viewer), Some(ip)) = (viewer, ip.as_ref()) {
            let n = self
                .windows
                .distinct_ips_for_viewer(viewer, ip, self.policy.rotation_window)
                .await
                .context(WindowSnafu {
                    limit: RateLimitKind::IpRotation,
                })?;
            if n > self.policy.rotation_limit {
                warn!(
                    "IP-rotation limit tripped for {}: {} addresses in window",
                    viewer, n
                );
                return Ok(ViewOutcome::RateLimited(RateLimitKind::IpRotation));
            }
        }

        // 6. Commit.
        self.storage
            .adjust_counter(blog, CounterField::Views, 1)
            .await
            .context(CountSnafu)?;
        self.storage
            .append_view(&ViewRecord {
                id: ViewId::new(),
                blog_id: *blog,
                viewer_id: viewer.copied(),
                ip,
                user_agent: user_agent.to_owned(),
                viewed_at: Utc::now(),
            })
            .await
            .context(RecordSnafu)?;

        if let Err(err) = self.refresh_popularity(blog).await {
            error!("failed to refresh popularity for blog {}: {}", blog, err);
        }

        Ok(ViewOutcome::Counted)
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

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        entities::EngagementCounts,
        testing::{mk_blog, FailingCache, MemoryCache, MemoryStore},
    };

    fn quick_policy() -> FraudPolicy {
        // Windows small enough that a test can sleep past them.
        FraudPolicy {
            dedup_window: Duration::from_millis(200),
            velocity_window: Duration::from_millis(200),
            velocity_limit: 10,
            rotation_window: Duration::from_millis(200),
            rotation_limit: 5,
        }
    }

    fn tracker(
        store: Arc<MemoryStore>,
        cache: Arc<dyn crate::cache::Backend + Send + Sync>,
        policy: FraudPolicy,
    ) -> ViewTracker {
        ViewTracker::new(store.clone(), Windows::new(cache, store), policy)
    }

    const UA: &str = "Mozilla/5.0 (X11; Linux x86_64)";

    #[tokio::test]
    async fn missing_identity_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let t = tracker(store, Arc::new(MemoryCache::new()), FraudPolicy::default());
        assert!(matches!(
            t.record_view(&BlogId::new(), None, None, UA).await,
            Err(Error::MissingIdentity { .. })
        ));
    }

    #[tokio::test]
    async fn bots_are_silently_ignored() {
        let store = Arc::new(MemoryStore::new());
        let blog = mk_blog(&store).await;
        let t = tracker(
            store.clone(),
            Arc::new(MemoryCache::new()),
            FraudPolicy::default(),
        );
        for ua in ["Googlebot/2.1", "curl/8.5.0", "My-HttpClient/1.0"] {
            assert_eq!(
                ViewOutcome::Ignored,
                t.record_view(&blog.id, None, Some("10.1.0.1".parse().unwrap()), ua)
                    .await
                    .unwrap()
            );
        }
        assert_eq!(EngagementCounts::default(), store.counts_for(&blog.id).await);
    }

    #[tokio::test]
    async fn double_view_counts_once() {
        let store = Arc::new(MemoryStore::new());
        let blog = mk_blog(&store).await;
        let t = tracker(
            store.clone(),
            Arc::new(MemoryCache::new()),
            FraudPolicy::default(),
        );
        let ip = Some("10.1.0.2".parse().unwrap());
        assert_eq!(
            ViewOutcome::Counted,
            t.record_view(&blog.id, None, ip, UA).await.unwrap()
        );
        assert_eq!(
            ViewOutcome::AlreadyCounted,
            t.record_view(&blog.id, None, ip, UA).await.unwrap()
        );
        assert_eq!(1, store.counts_for(&blog.id).await.views);
        // ...and the derived score moved.
        assert!(store.blog_by_id(&blog.id).await.unwrap().unwrap().popularity > 0.0);
    }

    #[tokio::test]
    async fn viewer_identity_dedups_across_addresses() {
        let store = Arc::new(MemoryStore::new());
        let blog = mk_blog(&store).await;
        let t = tracker(
            store.clone(),
            Arc::new(MemoryCache::new()),
            FraudPolicy::default(),
        );
        let viewer = UserId::new();
        assert_eq!(
            ViewOutcome::Counted,
            t.record_view(&blog.id, Some(&viewer), Some("10.1.0.3".parse().unwrap()), UA)
                .await
                .unwrap()
        );
        // Same account, different address: still a duplicate.
        assert_eq!(
            ViewOutcome::AlreadyCounted,
            t.record_view(&blog.id, Some(&viewer), Some("10.1.0.4".parse().unwrap()), UA)
                .await
                .unwrap()
        );
        assert_eq!(1, store.counts_for(&blog.id).await.views);
    }

    async fn velocity_scenario(cache: Arc<dyn crate::cache::Backend + Send + Sync>) {
        let store = Arc::new(MemoryStore::new());
        let t = tracker(store.clone(), cache, quick_policy());
        let ip = Some("10.2.0.1".parse().unwrap());

        let mut blogs = Vec::new();
        for _ in 0..11 {
            blogs.push(mk_blog(&store).await);
        }
        for blog in blogs.iter().take(10) {
            assert_eq!(
                ViewOutcome::Counted,
                t.record_view(&blog.id, None, ip, UA).await.unwrap()
            );
        }
        // The 11th distinct blog inside the window trips the limit...
        assert_eq!(
            ViewOutcome::RateLimited(RateLimitKind::IpVelocity),
            t.record_view(&blogs[10].id, None, ip, UA).await.unwrap()
        );
        assert_eq!(0, store.counts_for(&blogs[10].id).await.views);

        // ...but the same event clears once the window has slid past.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(
            ViewOutcome::Counted,
            t.record_view(&blogs[10].id, None, ip, UA).await.unwrap()
        );
    }

    #[tokio::test]
    async fn eleventh_blog_from_one_ip_is_rejected() {
        velocity_scenario(Arc::new(MemoryCache::new())).await;
    }

    #[tokio::test]
    async fn velocity_verdicts_survive_cache_outage() {
        // The degradation property: a dead cache tier must produce the *same* accept/reject
        // sequence, just off the durable records.
        velocity_scenario(Arc::new(FailingCache)).await;
    }

    async fn rotation_scenario(cache: Arc<dyn crate::cache::Backend + Send + Sync>) {
        let store = Arc::new(MemoryStore::new());
        let t = tracker(store.clone(), cache, quick_policy());
        let viewer = UserId::new();

        // Six addresses; to keep the dedup check out of the way, each view is of a fresh blog.
        for i in 0..5 {
            let blog = mk_blog(&store).await;
            let ip = format!("10.3.0.{}", i + 1).parse().unwrap();
            assert_eq!(
                ViewOutcome::Counted,
                t.record_view(&blog.id, Some(&viewer), Some(ip), UA).await.unwrap()
            );
        }
        let blog = mk_blog(&store).await;
        assert_eq!(
            ViewOutcome::RateLimited(RateLimitKind::IpRotation),
            t.record_view(&blog.id, Some(&viewer), Some("10.3.0.6".parse().unwrap()), UA)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn sixth_address_for_one_account_is_rejected() {
        rotation_scenario(Arc::new(MemoryCache::new())).await;
    }

    #[tokio::test]
    async fn rotation_verdicts_survive_cache_outage() {
        rotation_scenario(Arc::new(FailingCache)).await;
    }
}
