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

//! # storage
//!
//! Abstractions for the vellum durable storage layer.
//!
//! Absence is not failure down here: lookups return [Option] (an unknown blog, a user with no
//! active reaction), and conditional mutations return `bool` (did the row exist?). [Error] is
//! reserved for the store actually failing, which aborts the operation in progress (the cache
//! tier is where we absorb trouble, not here).

use std::{collections::HashSet, net::IpAddr};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::{
    Blog, BlogId, BlogStatus, EngagementCounts, MediaId, Reaction, ReactionKind, Slug, UserId,
    ViewRecord,
};

#[derive(Debug)]
pub struct Error {
    source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error {
            source: Box::new(err),
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      filtering & sorting                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Sort keys accepted by [Backend::blogs].
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    CreatedAt,
    ViewCount,
    LikeCount,
    Popularity,
}

impl SortBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortBy::CreatedAt => "created_at",
            SortBy::ViewCount => "view_count",
            SortBy::LikeCount => "like_count",
            SortBy::Popularity => "popularity",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

/// Options for filtered, paginated blog reads.
///
/// The count/like bounds apply to the *merged* aggregate (counters live in their own table), so
/// backends are expected to merge before filtering.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FilterOptions {
    pub page: u32,
    pub page_size: u32,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub min_views: Option<u64>,
    pub max_views: Option<u64>,
    pub min_likes: Option<u64>,
    pub max_likes: Option<u64>,
    pub author: Option<UserId>,
    pub tags: Vec<String>,
    /// None means any status; the public read paths set this to published + archived.
    pub statuses: Option<Vec<BlogStatus>>,
}

impl Default for FilterOptions {
    fn default() -> Self {
        FilterOptions {
            page: 1,
            page_size: 10,
            sort_by: SortBy::default(),
            sort_order: SortOrder::default(),
            date_from: None,
            date_to: None,
            min_views: None,
            max_views: None,
            min_likes: None,
            max_likes: None,
            author: None,
            tags: Vec::new(),
            statuses: None,
        }
    }
}

impl FilterOptions {
    /// Clamp page & page size to sane values (page 0 reads as page 1).
    pub fn normalized(mut self) -> FilterOptions {
        if self.page < 1 {
            self.page = 1;
        }
        if self.page_size < 1 {
            self.page_size = 10;
        }
        self
    }
}

/// Apply a [FilterOptions] to a set of merged blog aggregates: filter, sort, paginate.
///
/// CQL can't ORDER BY arbitrary columns & half the filters apply to counters merged from a
/// different table, so backends fetch a candidate set & finish the job application-side; this is
/// that job, shared so every backend paginates identically.
pub fn paginate(blogs: Vec<Blog>, filter: &FilterOptions) -> (Vec<Blog>, u64) {
    let filter = filter.clone().normalized();
    let mut matched: Vec<Blog> = blogs
        .into_iter()
        .filter(|b| !b.is_deleted)
        .filter(|b| filter.author.map_or(true, |a| b.author_id == a))
        .filter(|b| filter.tags.is_empty() || filter.tags.iter().any(|t| b.tags.contains(t)))
        .filter(|b| filter.date_from.map_or(true, |from| b.created_at >= from))
        .filter(|b| filter.date_to.map_or(true, |to| b.created_at <= to))
        .filter(|b| {
            filter
                .statuses
                .as_ref()
                .map_or(true, |statuses| statuses.contains(&b.status))
        })
        .filter(|b| filter.min_views.map_or(true, |n| b.counts.views >= n))
        .filter(|b| filter.max_views.map_or(true, |n| b.counts.views <= n))
        .filter(|b| filter.min_likes.map_or(true, |n| b.counts.likes >= n))
        .filter(|b| filter.max_likes.map_or(true, |n| b.counts.likes <= n))
        .collect();

    matched.sort_by(|a, b| {
        let ord = match filter.sort_by {
            SortBy::CreatedAt => a.created_at.cmp(&b.created_at),
            SortBy::ViewCount => a.counts.views.cmp(&b.counts.views),
            SortBy::LikeCount => a.counts.likes.cmp(&b.counts.likes),
            SortBy::Popularity => a
                .popularity
                .partial_cmp(&b.popularity)
                .unwrap_or(std::cmp::Ordering::Equal),
        };
        match filter.sort_order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        }
    });

    let total = matched.len() as u64;
    let skip = (filter.page as usize - 1) * filter.page_size as usize;
    let page = matched
        .into_iter()
        .skip(skip)
        .take(filter.page_size as usize)
        .collect();
    (page, total)
}

/// The engagement counters a backend can adjust atomically.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CounterField {
    Views,
    Likes,
    Dislikes,
    Comments,
}

impl CounterField {
    pub fn as_str(&self) -> &'static str {
        match self {
            CounterField::Views => "views",
            CounterField::Likes => "likes",
            CounterField::Dislikes => "dislikes",
            CounterField::Comments => "comments",
        }
    }
}

/// A partial update of a blog row. `None` fields are left untouched.
#[derive(Clone, Debug, Default)]
pub struct BlogUpdate {
    pub title: Option<String>,
    pub slug: Option<Slug>,
    pub content: Option<String>,
    pub status: Option<BlogStatus>,
    pub featured_image_id: Option<MediaId>,
    pub published_at: Option<DateTime<Utc>>,
    pub popularity: Option<f64>,
}

impl BlogUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.slug.is_none()
            && self.content.is_none()
            && self.status.is_none()
            && self.featured_image_id.is_none()
            && self.published_at.is_none()
            && self.popularity.is_none()
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          the Backend                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[async_trait]
pub trait Backend {
    /// Persist a freshly-minted [Blog] (row + zeroed counters).
    async fn create_blog(&self, blog: &Blog) -> Result<()>;
    /// Retrieve a blog (merged with its counters) by id; None if unknown or soft-deleted.
    async fn blog_by_id(&self, id: &BlogId) -> Result<Option<Blog>>;
    /// Retrieve a blog (merged with its counters) by slug; None if unknown or soft-deleted.
    async fn blog_by_slug(&self, slug: &Slug) -> Result<Option<Blog>>;
    /// Filtered, sorted, paginated read. Returns the requested page along with the total number
    /// of blogs matching the filter (pre-pagination).
    async fn blogs(&self, filter: &FilterOptions) -> Result<(Vec<Blog>, u64)>;
    /// Apply a partial update; return false if the blog doesn't exist (or is soft-deleted).
    async fn update_blog(&self, id: &BlogId, update: &BlogUpdate) -> Result<bool>;
    /// Soft-delete; return false if the blog doesn't exist (or was already deleted).
    async fn soft_delete_blog(&self, id: &BlogId) -> Result<bool>;

    /// Atomically adjust one of a blog's engagement counters. This is the *only* way counters
    /// move; read-modify-write would lose updates under concurrent traffic.
    async fn adjust_counter(&self, id: &BlogId, field: CounterField, delta: i64) -> Result<()>;
    /// Read a blog's current counters. A blog with no counter row reads as all-zero.
    async fn counts(&self, id: &BlogId) -> Result<EngagementCounts>;

    /// Append a [ViewRecord]; view records are never updated or deleted.
    async fn append_view(&self, view: &ViewRecord) -> Result<()>;
    /// Has this viewer (by id, if known) or this IP viewed this blog since `since`?
    async fn viewed_since(
        &self,
        blog: &BlogId,
        viewer: Option<&UserId>,
        ip: Option<&IpAddr>,
        since: &DateTime<Utc>,
    ) -> Result<bool>;
    /// The distinct blogs `ip` has viewed since `since`. This is the durable fallback for the
    /// IP-velocity window; it must approximate the same sliding set the cache tier keeps.
    async fn blogs_viewed_by_ip_since(
        &self,
        ip: &IpAddr,
        since: &DateTime<Utc>,
    ) -> Result<HashSet<BlogId>>;
    /// The distinct IPs `viewer` has presented since `since`; durable fallback for the
    /// IP-rotation window.
    async fn ips_seen_for_viewer_since(
        &self,
        viewer: &UserId,
        since: &DateTime<Utc>,
    ) -> Result<HashSet<IpAddr>>;

    /// The active (non-deleted) reaction `user` has on `target`, if any. None is the normal
    /// starting state, not an error.
    async fn active_reaction(&self, user: &UserId, target: &BlogId) -> Result<Option<Reaction>>;
    /// Insert a new reaction, or mutate the existing (user, target) row in place -- upsert
    /// semantics keyed on (user, target), preserving the one-active-reaction invariant.
    async fn put_reaction(&self, reaction: &Reaction) -> Result<()>;
    /// Soft-delete the active reaction on (user, target); return false if there wasn't one.
    async fn soft_delete_reaction(&self, user: &UserId, target: &BlogId) -> Result<bool>;
    /// Count active reactions of `kind` on `target`.
    async fn count_reactions(&self, target: &BlogId, kind: ReactionKind) -> Result<u64>;
}
