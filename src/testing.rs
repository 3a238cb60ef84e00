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

//! # testing
//!
//! In-memory implementations of the storage & cache backends, for tests only.
//!
//! [MemoryStore] keeps the same invariants the production backend does (soft deletes, merged
//! counters clamped at zero, upsert-keyed reactions); [MemoryCache] honours TTLs against the real
//! clock so the sliding-window tests can watch windows actually slide; [FailingCache] errors on
//! every call & exists to prove the degradation story.

use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    cache,
    entities::{
        Blog, BlogId, BlogStatus, EngagementCounts, Reaction, ReactionKind, Slug, UserId, ViewId,
        ViewRecord,
    },
    popularity,
    storage::{self, Backend as _, BlogUpdate, CounterField, FilterOptions},
};

type StorResult<T> = std::result::Result<T, storage::Error>;

type CacheResult<T> = std::result::Result<T, cache::Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         blog factories                                         //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A published blog aggregate, not yet persisted anywhere.
pub fn mk_raw_blog(status: BlogStatus) -> Blog {
    let now = Utc::now();
    let counts = EngagementCounts::default();
    Blog {
        id: BlogId::new(),
        slug: Slug::mint("An Essay On Testing"),
        author_id: UserId::new(),
        title: "An Essay On Testing".to_owned(),
        content: "Lorem ipsum dolor sit amet.".to_owned(),
        status,
        tags: HashSet::new(),
        featured_image_id: None,
        popularity: popularity::score(&counts),
        counts,
        is_deleted: false,
        created_at: now,
        updated_at: now,
        published_at: status.is_publicly_visible().then_some(now),
    }
}

/// A published blog, persisted in `store`.
pub async fn mk_blog(store: &MemoryStore) -> Blog {
    let blog = mk_raw_blog(BlogStatus::Published);
    store.create_blog(&blog).await.unwrap();
    blog
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          MemoryStore                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Default)]
struct RawCounts {
    views: i64,
    likes: i64,
    dislikes: i64,
    comments: i64,
}

impl RawCounts {
    fn clamped(&self) -> EngagementCounts {
        EngagementCounts {
            views: self.views.max(0) as u64,
            likes: self.likes.max(0) as u64,
            dislikes: self.dislikes.max(0) as u64,
            comments: self.comments.max(0) as u64,
        }
    }
}

#[derive(Default)]
struct StoreState {
    blogs: HashMap<BlogId, Blog>,
    counters: HashMap<BlogId, RawCounts>,
    views: Vec<ViewRecord>,
    reactions: Vec<Reaction>,
}

pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore {
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Current (clamped) counters for `blog`; a convenience for assertions.
    pub async fn counts_for(&self, blog: &BlogId) -> EngagementCounts {
        self.state
            .lock()
            .unwrap()
            .counters
            .get(blog)
            .copied()
            .unwrap_or_default()
            .clamped()
    }

    /// Number of *active* reaction rows for (user, target); the invariant says this never
    /// exceeds one.
    pub async fn active_reaction_count(&self, user: &UserId, target: &BlogId) -> usize {
        self.state
            .lock()
            .unwrap()
            .reactions
            .iter()
            .filter(|r| !r.is_deleted && r.user_id == *user && r.target_id == *target)
            .count()
    }

    /// Plant a durable view record, bypassing the tracker.
    pub async fn record_view_from(&self, viewer: &UserId, ip: IpAddr, blog: &BlogId) {
        self.state.lock().unwrap().views.push(ViewRecord {
            id: ViewId::new(),
            blog_id: *blog,
            viewer_id: Some(*viewer),
            ip: Some(ip),
            user_agent: "test".to_owned(),
            viewed_at: Utc::now(),
        });
    }

    fn merged(state: &StoreState, blog: &Blog) -> Blog {
        let mut blog = blog.clone();
        blog.counts = state
            .counters
            .get(&blog.id)
            .copied()
            .unwrap_or_default()
            .clamped();
        blog
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

#[async_trait]
impl storage::Backend for MemoryStore {
    async fn create_blog(&self, blog: &Blog) -> StorResult<()> {
        let mut state = self.state.lock().unwrap();
        state.blogs.insert(blog.id, blog.clone());
        state.counters.entry(blog.id).or_default();
        Ok(())
    }

    async fn blog_by_id(&self, id: &BlogId) -> StorResult<Option<Blog>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .blogs
            .get(id)
            .filter(|b| !b.is_deleted)
            .map(|b| Self::merged(&state, b)))
    }

    async fn blog_by_slug(&self, slug: &Slug) -> StorResult<Option<Blog>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .blogs
            .values()
            .find(|b| !b.is_deleted && b.slug == *slug)
            .map(|b| Self::merged(&state, b)))
    }

    async fn blogs(&self, filter: &FilterOptions) -> StorResult<(Vec<Blog>, u64)> {
        let merged: Vec<Blog> = {
            let state = self.state.lock().unwrap();
            state
                .blogs
                .values()
                .map(|b| Self::merged(&state, b))
                .collect()
        };
        Ok(storage::paginate(merged, filter))
    }

    async fn update_blog(&self, id: &BlogId, update: &BlogUpdate) -> StorResult<bool> {
        let mut state = self.state.lock().unwrap();
        let Some(blog) = state.blogs.get_mut(id).filter(|b| !b.is_deleted) else {
            return Ok(false);
        };
        if let Some(title) = &update.title {
            blog.title = title.clone();
        }
        if let Some(slug) = &update.slug {
            blog.slug = slug.clone();
        }
        if let Some(content) = &update.content {
            blog.content = content.clone();
        }
        if let Some(status) = update.status {
            blog.status = status;
        }
        if let Some(image) = update.featured_image_id {
            blog.featured_image_id = Some(image);
        }
        if let Some(published_at) = update.published_at {
            blog.published_at = Some(published_at);
        }
        if let Some(popularity) = update.popularity {
            blog.popularity = popularity;
        }
        blog.updated_at = Utc::now();
        Ok(true)
    }

    async fn soft_delete_blog(&self, id: &BlogId) -> StorResult<bool> {
        let mut state = self.state.lock().unwrap();
        match state.blogs.get_mut(id).filter(|b| !b.is_deleted) {
            Some(blog) => {
                blog.is_deleted = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn adjust_counter(&self, id: &BlogId, field: CounterField, delta: i64) -> StorResult<()> {
        let mut state = self.state.lock().unwrap();
        let counts = state.counters.entry(*id).or_default();
        match field {
            CounterField::Views => counts.views += delta,
            CounterField::Likes => counts.likes += delta,
            CounterField::Dislikes => counts.dislikes += delta,
            CounterField::Comments => counts.comments += delta,
        }
        Ok(())
    }

    async fn counts(&self, id: &BlogId) -> StorResult<EngagementCounts> {
        Ok(self.counts_for(id).await)
    }

    async fn append_view(&self, view: &ViewRecord) -> StorResult<()> {
        self.state.lock().unwrap().views.push(view.clone());
        Ok(())
    }

    async fn viewed_since(
        &self,
        blog: &BlogId,
        viewer: Option<&UserId>,
        ip: Option<&IpAddr>,
        since: &DateTime<Utc>,
    ) -> StorResult<bool> {
        Ok(self.state.lock().unwrap().views.iter().any(|v| {
            v.blog_id == *blog
                && v.viewed_at >= *since
                && (viewer.map_or(false, |viewer| v.viewer_id == Some(*viewer))
                    || ip.map_or(false, |ip| v.ip == Some(*ip)))
        }))
    }

    async fn blogs_viewed_by_ip_since(
        &self,
        ip: &IpAddr,
        since: &DateTime<Utc>,
    ) -> StorResult<HashSet<BlogId>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .views
            .iter()
            .filter(|v| v.ip == Some(*ip) && v.viewed_at >= *since)
            .map(|v| v.blog_id)
            .collect())
    }

    async fn ips_seen_for_viewer_since(
        &self,
        viewer: &UserId,
        since: &DateTime<Utc>,
    ) -> StorResult<HashSet<IpAddr>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .views
            .iter()
            .filter(|v| v.viewer_id == Some(*viewer) && v.viewed_at >= *since)
            .filter_map(|v| v.ip)
            .collect())
    }

    async fn active_reaction(
        &self,
        user: &UserId,
        target: &BlogId,
    ) -> StorResult<Option<Reaction>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .reactions
            .iter()
            .find(|r| !r.is_deleted && r.user_id == *user && r.target_id == *target)
            .cloned())
    }

    async fn put_reaction(&self, reaction: &Reaction) -> StorResult<()> {
        let mut state = self.state.lock().unwrap();
        match state
            .reactions
            .iter_mut()
            .find(|r| r.user_id == reaction.user_id && r.target_id == reaction.target_id)
        {
            // Upsert keyed on (user, target): one row per pair, revived if soft-deleted.
            Some(row) => *row = reaction.clone(),
            None => state.reactions.push(reaction.clone()),
        }
        Ok(())
    }

    async fn soft_delete_reaction(&self, user: &UserId, target: &BlogId) -> StorResult<bool> {
        let mut state = self.state.lock().unwrap();
        match state
            .reactions
            .iter_mut()
            .find(|r| !r.is_deleted && r.user_id == *user && r.target_id == *target)
        {
            Some(row) => {
                row.is_deleted = true;
                row.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn count_reactions(&self, target: &BlogId, kind: ReactionKind) -> StorResult<u64> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .reactions
            .iter()
            .filter(|r| !r.is_deleted && r.target_id == *target && r.kind == kind)
            .count() as u64)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          MemoryCache                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, (Instant, Vec<u8>)>,
    sets: HashMap<String, (Instant, HashSet<String>)>,
}

/// TTL-honouring in-memory cache; the expiry granularity matches the Redis behaviour it stands in
/// for (the TTL applies to the whole set, refreshed on every add).
pub struct MemoryCache {
    state: Mutex<CacheState>,
}

impl MemoryCache {
    pub fn new() -> MemoryCache {
        MemoryCache {
            state: Mutex::new(CacheState::default()),
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        MemoryCache::new()
    }
}

#[async_trait]
impl cache::Backend for MemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut state = self.state.lock().unwrap();
        match state.entries.get(key) {
            Some((expires, _)) if *expires <= Instant::now() => {
                state.entries.remove(key);
                Ok(None)
            }
            Some((_, bytes)) => Ok(Some(bytes.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        self.state
            .lock()
            .unwrap()
            .entries
            .insert(key.to_owned(), (Instant::now() + ttl, value.to_vec()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.state.lock().unwrap().entries.remove(key);
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> CacheResult<()> {
        let mut state = self.state.lock().unwrap();
        for key in keys {
            state.entries.remove(key);
        }
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        // Only the trailing-star form is used in this crate; that's all we emulate.
        let prefix = pattern.strip_suffix('*').unwrap_or(pattern);
        Ok(self
            .state
            .lock()
            .unwrap()
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn add_to_set(&self, key: &str, member: &str, ttl: Duration) -> CacheResult<()> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let entry = state
            .sets
            .entry(key.to_owned())
            .or_insert_with(|| (now + ttl, HashSet::new()));
        if entry.0 <= now {
            entry.1.clear();
        }
        entry.0 = now + ttl;
        entry.1.insert(member.to_owned());
        Ok(())
    }

    async fn set_cardinality(&self, key: &str) -> CacheResult<u64> {
        let mut state = self.state.lock().unwrap();
        match state.sets.get(key) {
            Some((expires, _)) if *expires <= Instant::now() => {
                state.sets.remove(key);
                Ok(0)
            }
            Some((_, members)) => Ok(members.len() as u64),
            None => Ok(0),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          FailingCache                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

fn down() -> cache::Error {
    cache::Error::new(std::io::Error::new(
        std::io::ErrorKind::ConnectionRefused,
        "cache tier is down",
    ))
}

/// A cache backend whose every operation fails; the degradation scenarios run against this.
pub struct FailingCache;

#[async_trait]
impl cache::Backend for FailingCache {
    async fn get(&self, _key: &str) -> CacheResult<Option<Vec<u8>>> {
        Err(down())
    }
    async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> CacheResult<()> {
        Err(down())
    }
    async fn delete(&self, _key: &str) -> CacheResult<()> {
        Err(down())
    }
    async fn delete_many(&self, _keys: &[String]) -> CacheResult<()> {
        Err(down())
    }
    async fn scan_keys(&self, _pattern: &str) -> CacheResult<Vec<String>> {
        Err(down())
    }
    async fn add_to_set(&self, _key: &str, _member: &str, _ttl: Duration) -> CacheResult<()> {
        Err(down())
    }
    async fn set_cardinality(&self, _key: &str) -> CacheResult<u64> {
        Err(down())
    }
}
