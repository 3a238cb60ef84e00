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

//! # blog_cache
//!
//! The cache-aside layer for blog reads, and the invalidation that keeps it coherent.
//!
//! Two payload shapes live here: a single [Blog] keyed by slug (detail) & a [BlogPage] keyed by a
//! canonical encoding of the list query (list pages get a shorter TTL; aggregate views go stale
//! faster than anyone cares about). Any blog mutation invalidates the whole list namespace plus
//! the touched detail entries -- including the *previous* slug when a title edit re-minted it.
//!
//! Everything here returns [Option] or `()`: a cache error is logged, counted & then treated as a
//! miss or a no-op. Callers can't tell a dead cache from a cold one, which is the point.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    cache,
    counter_add,
    entities::{Blog, Slug},
    metrics::{self, Instruments, Sort},
    storage::{SortBy, SortOrder},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           cache keys                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

const LIST_KEY_PATTERN: &str = "blogs:list:*";

// Deletes are batched; a namespace scan can return a lot of keys & we'd rather make a few
// round-trips than one unbounded one.
const INVALIDATION_BATCH: usize = 200;

fn detail_key(slug: &Slug) -> String {
    format!("blog:slug:{}", slug)
}

/// The parameters that identify one cached list page.
///
/// The cache key must be *canonical*: two requests for the same page have to hash to the same
/// string, so the date bounds are rendered in a fixed format & absent bounds render as empty.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ListQuery {
    pub page: u32,
    pub page_size: u32,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
}

fn canonical_date(dt: &Option<DateTime<Utc>>) -> String {
    dt.map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

fn list_key(q: &ListQuery) -> String {
    format!(
        "blogs:list:p={}:s={}:sb={}:so={}:df={}:dt={}",
        q.page,
        q.page_size,
        q.sort_by.as_str(),
        q.sort_order.as_str(),
        canonical_date(&q.date_from),
        canonical_date(&q.date_to)
    )
}

/// The cached payload for list endpoints: one page plus the pre-pagination total.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BlogPage {
    pub blogs: Vec<Blog>,
    pub total: u64,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          the layer                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// TTLs for the two payload shapes.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct CacheTtls {
    /// Detail entries (a single blog, by slug)
    pub detail: Duration,
    /// List pages; expected to be shorter than `detail`
    pub list: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        CacheTtls {
            detail: Duration::from_secs(60 * 60),
            list: Duration::from_secs(30 * 60),
        }
    }
}

inventory::submit! { metrics::Registration::new("cache.detail.hits", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("cache.detail.misses", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("cache.list.hits", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("cache.list.misses", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("cache.degraded", Sort::IntegralCounter) }

/// The blog-facing view of the cache tier.
pub struct BlogCache {
    cache: Arc<dyn cache::Backend + Send + Sync>,
    ttls: CacheTtls,
    instruments: Arc<Instruments>,
}

impl BlogCache {
    pub fn new(
        cache: Arc<dyn cache::Backend + Send + Sync>,
        ttls: CacheTtls,
        instruments: Arc<Instruments>,
    ) -> BlogCache {
        BlogCache {
            cache,
            ttls,
            instruments,
        }
    }

    /// The cached detail entry for `slug`, if any.
    pub async fn detail(&self, slug: &Slug) -> Option<Blog> {
        let hit = self
            .fetch::<Blog>(&detail_key(slug))
            .await
            // A cached draft should be impossible (see `put_detail`), but re-check on the way
            // out: serving a draft by slug is the one mistake this layer must never make.
            .filter(|blog| blog.status.is_publicly_visible() && !blog.is_deleted);
        match hit {
            Some(_) => counter_add!(self.instruments, "cache.detail.hits", 1, &[]),
            None => counter_add!(self.instruments, "cache.detail.misses", 1, &[]),
        }
        hit
    }

    /// Populate the detail entry for `blog`. Drafts & deleted blogs are never cached.
    pub async fn put_detail(&self, blog: &Blog) {
        if !blog.status.is_publicly_visible() || blog.is_deleted {
            return;
        }
        self.store(&detail_key(&blog.slug), blog, self.ttls.detail)
            .await;
    }

    /// Drop the detail entry for `slug`.
    pub async fn invalidate_detail(&self, slug: &Slug) {
        if let Err(err) = self.cache.delete(&detail_key(slug)).await {
            self.degraded("detail invalidation", &err);
        }
    }

    /// The cached list page for `q`, if any.
    pub async fn page(&self, q: &ListQuery) -> Option<BlogPage> {
        let hit = self.fetch::<BlogPage>(&list_key(q)).await;
        match hit {
            Some(_) => counter_add!(self.instruments, "cache.list.hits", 1, &[]),
            None => counter_add!(self.instruments, "cache.list.misses", 1, &[]),
        }
        hit
    }

    /// Populate the list page for `q`.
    pub async fn put_page(&self, q: &ListQuery, page: &BlogPage) {
        self.store(&list_key(q), page, self.ttls.list).await;
    }

    /// Drop every cached list page.
    ///
    /// Implemented as a pattern scan over the list namespace with batched deletes.
    pub async fn invalidate_lists(&self) {
        let keys = match self.cache.scan_keys(LIST_KEY_PATTERN).await {
            Ok(keys) => keys,
            Err(err) => {
                self.degraded("list scan", &err);
                return;
            }
        };
        debug!("invalidating {} cached list pages", keys.len());
        for batch in keys.chunks(INVALIDATION_BATCH) {
            if let Err(err) = self.cache.delete_many(batch).await {
                self.degraded("list invalidation", &err);
                return;
            }
        }
    }

    async fn fetch<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.cache.get(key).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(value) => Some(value),
                Err(err) => {
                    // A payload we can't parse (rolled-back deploy, corrupted entry) is just a
                    // miss; it'll be overwritten on the repopulate.
                    warn!("discarding undecodable cache entry at {}: {}", key, err);
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                self.degraded("read", &err);
                None
            }
        }
    }

    async fn store<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("failed to serialize cache entry for {}: {}", key, err);
                return;
            }
        };
        if let Err(err) = self.cache.set(key, &bytes, ttl).await {
            self.degraded("write", &err);
        }
    }

    fn degraded(&self, op: &str, err: &cache::Error) {
        counter_add!(self.instruments, "cache.degraded", 1, &[]);
        warn!("cache degraded during {}: {}", op, err);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        entities::BlogStatus,
        testing::{mk_raw_blog, FailingCache, MemoryCache},
    };

    fn layer(cache: Arc<dyn cache::Backend + Send + Sync>) -> BlogCache {
        BlogCache::new(cache, CacheTtls::default(), Arc::new(Instruments::new("vellum")))
    }

    fn query(page: u32) -> ListQuery {
        ListQuery {
            page,
            page_size: 10,
            sort_by: SortBy::CreatedAt,
            sort_order: SortOrder::Desc,
            date_from: None,
            date_to: None,
        }
    }

    #[tokio::test]
    async fn detail_round_trips() {
        let layer = layer(Arc::new(MemoryCache::new()));
        let blog = mk_raw_blog(BlogStatus::Published);
        assert!(layer.detail(&blog.slug).await.is_none());
        layer.put_detail(&blog).await;
        assert_eq!(blog.id, layer.detail(&blog.slug).await.unwrap().id);
    }

    #[tokio::test]
    async fn drafts_are_never_cached() {
        let layer = layer(Arc::new(MemoryCache::new()));
        let blog = mk_raw_blog(BlogStatus::Draft);
        layer.put_detail(&blog).await;
        assert!(layer.detail(&blog.slug).await.is_none());
    }

    #[tokio::test]
    async fn invalidation_covers_a_slug_change() {
        let layer = layer(Arc::new(MemoryCache::new()));
        let mut blog = mk_raw_blog(BlogStatus::Published);
        let old_slug = blog.slug.clone();
        layer.put_detail(&blog).await;

        // A title edit re-mints the slug; both entries must be handled.
        blog.slug = Slug::mint("A Better Title");
        layer.invalidate_detail(&old_slug).await;
        layer.put_detail(&blog).await;

        assert!(layer.detail(&old_slug).await.is_none());
        assert!(layer.detail(&blog.slug).await.is_some());
    }

    #[tokio::test]
    async fn list_invalidation_spares_unrelated_keys() {
        let cache = Arc::new(MemoryCache::new());
        let layer = layer(cache.clone());
        let blog = mk_raw_blog(BlogStatus::Published);
        layer.put_detail(&blog).await;
        for page in 1..=5 {
            layer
                .put_page(&query(page), &BlogPage { blogs: vec![], total: 0 })
                .await;
        }

        layer.invalidate_lists().await;
        for page in 1..=5 {
            assert!(layer.page(&query(page)).await.is_none());
        }
        assert!(layer.detail(&blog.slug).await.is_some());
    }

    #[tokio::test]
    async fn a_dead_cache_is_just_a_cold_one() {
        let layer = layer(Arc::new(FailingCache));
        let blog = mk_raw_blog(BlogStatus::Published);
        layer.put_detail(&blog).await;
        assert!(layer.detail(&blog.slug).await.is_none());
        layer
            .put_page(&query(1), &BlogPage { blogs: vec![], total: 0 })
            .await;
        assert!(layer.page(&query(1)).await.is_none());
        layer.invalidate_lists().await;
        layer.invalidate_detail(&blog.slug).await;
    }
}
