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

//! # window
//!
//! Sliding-window counters for the fraud heuristics.
//!
//! There is exactly one policy here, with two mechanisms: the primary mechanism is a TTL-expiring
//! set in the cache tier (`SADD` + `SCARD`, cheap & approximately sliding); when the cache tier is
//! unavailable we fall back to a timestamp-range scan over the durable view records. Both count
//! *distinct members observed in the window, including the event being admitted*, so a caller gets
//! the same verdict for the same history whichever mechanism answered. Keeping the two paths
//! behind one type is the point -- early drafts of this sort of thing tend to duplicate the
//! threshold logic at both call sites and let the two copies drift.

use std::{net::IpAddr, sync::Arc, time::Duration};

use chrono::Utc;
use tracing::warn;

use crate::{
    cache,
    entities::{BlogId, UserId},
    storage,
};

type Result<T> = std::result::Result<T, storage::Error>;

fn ip_window_key(ip: &IpAddr) -> String {
    format!("views:window:ip:{}", ip)
}

fn viewer_window_key(viewer: &UserId) -> String {
    format!("views:window:viewer:{}", viewer)
}

/// The sliding-window membership counters backing the velocity & rotation checks.
///
/// Cache errors never escape this type; they downgrade the query to the durable fallback. A
/// durable-store error, on the other hand, is a real failure & propagates.
pub struct Windows {
    cache: Arc<dyn cache::Backend + Send + Sync>,
    storage: Arc<dyn storage::Backend + Send + Sync>,
}

impl Windows {
    pub fn new(
        cache: Arc<dyn cache::Backend + Send + Sync>,
        storage: Arc<dyn storage::Backend + Send + Sync>,
    ) -> Windows {
        Windows { cache, storage }
    }

    /// Record that `ip` touched `blog` & return the number of distinct blogs this IP has touched
    /// within `window` (including this one).
    pub async fn distinct_blogs_for_ip(
        &self,
        ip: &IpAddr,
        blog: &BlogId,
        window: Duration,
    ) -> Result<u64> {
        match self
            .observe(&ip_window_key(ip), &blog.to_string(), window)
            .await
        {
            Ok(n) => Ok(n),
            Err(err) => {
                warn!("IP-velocity window degraded to storage: {}", err);
                let since = Utc::now() - chrono::Duration::from_std(window).unwrap(/* config-bounded */);
                let mut blogs = self.storage.blogs_viewed_by_ip_since(ip, &since).await?;
                blogs.insert(*blog);
                Ok(blogs.len() as u64)
            }
        }
    }

    /// Record that `viewer` arrived from `ip` & return the number of distinct IPs this account
    /// has presented within `window` (including this one).
    pub async fn distinct_ips_for_viewer(
        &self,
        viewer: &UserId,
        ip: &IpAddr,
        window: Duration,
    ) -> Result<u64> {
        match self
            .observe(&viewer_window_key(viewer), &ip.to_string(), window)
            .await
        {
            Ok(n) => Ok(n),
            Err(err) => {
                warn!("IP-rotation window degraded to storage: {}", err);
                let since = Utc::now() - chrono::Duration::from_std(window).unwrap(/* config-bounded */);
                let mut ips = self.storage.ips_seen_for_viewer_since(viewer, &since).await?;
                ips.insert(*ip);
                Ok(ips.len() as u64)
            }
        }
    }

    async fn observe(
        &self,
        key: &str,
        member: &str,
        window: Duration,
    ) -> std::result::Result<u64, cache::Error> {
        self.cache.add_to_set(key, member, window).await?;
        self.cache.set_cardinality(key).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{FailingCache, MemoryCache, MemoryStore};

    #[tokio::test]
    async fn counts_distinct_members() {
        let store = Arc::new(MemoryStore::new());
        let windows = Windows::new(Arc::new(MemoryCache::new()), store);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let window = Duration::from_secs(60);

        let b0 = BlogId::new();
        let b1 = BlogId::new();
        assert_eq!(1, windows.distinct_blogs_for_ip(&ip, &b0, window).await.unwrap());
        assert_eq!(2, windows.distinct_blogs_for_ip(&ip, &b1, window).await.unwrap());
        // Re-observing a member doesn't grow the window
        assert_eq!(2, windows.distinct_blogs_for_ip(&ip, &b0, window).await.unwrap());
    }

    #[tokio::test]
    async fn cache_failure_degrades_to_storage() {
        let store = Arc::new(MemoryStore::new());
        let windows = Windows::new(Arc::new(FailingCache), store.clone());
        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        let viewer = UserId::new();
        let window = Duration::from_secs(60);

        // With no recorded views, the event being admitted is the only member.
        let blog = BlogId::new();
        assert_eq!(1, windows.distinct_blogs_for_ip(&ip, &blog, window).await.unwrap());

        // Seed two durable view records from distinct IPs & re-ask from a third.
        store.record_view_from(&viewer, "10.0.0.3".parse().unwrap(), &blog).await;
        store.record_view_from(&viewer, "10.0.0.4".parse().unwrap(), &blog).await;
        assert_eq!(
            3,
            windows.distinct_ips_for_viewer(&viewer, &ip, window).await.unwrap()
        );
        // The admitted IP doesn't double-count if it's already on record.
        store.record_view_from(&viewer, ip, &blog).await;
        assert_eq!(
            3,
            windows.distinct_ips_for_viewer(&viewer, &ip, window).await.unwrap()
        );
    }
}
