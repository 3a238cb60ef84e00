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

//! # Blog API
//!
//! CRUD, listing & the cache-aside read paths for blogs.
//!
//! The read paths (detail by slug, list pages) go through [BlogCache] first & repopulate it on a
//! miss; every successful mutation invalidates the list namespace plus the touched detail
//! entries. A title edit re-mints the slug, so the *previous* slug's detail entry gets
//! invalidated along with the new one -- miss that & the old URL serves a ghost until the TTL
//! saves you.

use std::{collections::HashSet, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::{header::CONTENT_TYPE, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::{prelude::*, Backtrace};
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer};
use tracing::{debug, error, info};

use crate::{
    blog_cache::{BlogPage, ListQuery},
    counter_add,
    entities::{Blog, BlogId, BlogStatus, EngagementCounts, MediaId, Slug, UserId},
    http::{is_admin, user_from_headers, ErrorResponseBody},
    metrics::{self, Sort},
    popularity,
    storage::{self, Backend as _, BlogUpdate, FilterOptions, SortBy, SortOrder},
    vellum::Vellum,
};

/// Blog API module error type
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("A blog title may not be empty"))]
    EmptyTitle { backtrace: Backtrace },
    #[snafu(display("Blog content may not be empty"))]
    EmptyContent { backtrace: Backtrace },
    #[snafu(display("{text} is not a valid blog slug"))]
    BadSlug {
        text: String,
        source: crate::entities::Error,
    },
    #[snafu(display("{text} is not a valid blog id"))]
    BadBlogId { text: String, source: uuid::Error },
    #[snafu(display("No blog at slug {slug}"))]
    NoSuchSlug { slug: Slug },
    #[snafu(display("Blog {id} not found"))]
    NoSuchBlog { id: BlogId },
    #[snafu(display("This request requires an authenticated caller"))]
    Unauthenticated { backtrace: Backtrace },
    #[snafu(display("Only the author may modify this blog"))]
    NotTheAuthor { backtrace: Backtrace },
    #[snafu(display("Failed to create blog: {source}"))]
    Create { source: storage::Error },
    #[snafu(display("Failed to fetch blog: {source}"))]
    Fetch { source: storage::Error },
    #[snafu(display("Failed to list blogs: {source}"))]
    List { source: storage::Error },
    #[snafu(display("Failed to update blog: {source}"))]
    Update { source: storage::Error },
    #[snafu(display("Failed to delete blog: {source}"))]
    Delete { source: storage::Error },
}

impl Error {
    pub fn as_status_and_msg(&self) -> (StatusCode, String) {
        match self {
            ////////////////////////////////////////////////////////////////////////////////////////
            // Broken requests-- tell the caller how to fix it
            ////////////////////////////////////////////////////////////////////////////////////////
            Error::EmptyTitle { .. } => {
                (StatusCode::BAD_REQUEST, "Title may not be empty".to_string())
            }
            Error::EmptyContent { .. } => (
                StatusCode::BAD_REQUEST,
                "Content may not be empty".to_string(),
            ),
            Error::BadSlug { text, .. } => (
                StatusCode::BAD_REQUEST,
                format!("{} is not a valid slug", text),
            ),
            Error::BadBlogId { text, .. } => (
                StatusCode::BAD_REQUEST,
                format!("{} is not a valid blog id", text),
            ),
            ////////////////////////////////////////////////////////////////////////////////////////
            // Absence & authorization
            ////////////////////////////////////////////////////////////////////////////////////////
            // Don't leak whether a draft lives at this slug.
            Error::NoSuchSlug { .. } => (StatusCode::NOT_FOUND, "Blog not found".to_string()),
            Error::NoSuchBlog { .. } => (StatusCode::NOT_FOUND, "Blog not found".to_string()),
            Error::Unauthenticated { .. } => {
                (StatusCode::UNAUTHORIZED, "Unauthorized".to_string())
            }
            Error::NotTheAuthor { .. } => (
                StatusCode::FORBIDDEN,
                "Only the author may modify this blog".to_string(),
            ),
            ////////////////////////////////////////////////////////////////////////////////////////
            // Internal failure-- own up to it:
            ////////////////////////////////////////////////////////////////////////////////////////
            Error::Create { source } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to create blog: {source}"),
            ),
            Error::Fetch { source } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to fetch blog: {source}"),
            ),
            Error::List { source } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to list blogs: {source}"),
            ),
            Error::Update { source } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to update blog: {source}"),
            ),
            Error::Delete { source } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to delete blog: {source}"),
            ),
        }
    }
}

// Not sure about this approach-- the implementation of this trait is awfully prolix. OTOH, it
// does make the implementation of handlers much easier...
impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let (code, msg) = self.as_status_and_msg();
        (code, Json(ErrorResponseBody { error: msg })).into_response()
    }
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                        `POST /blogs`                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("blogs.creates.successful", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("blogs.creates.failures", Sort::IntegralCounter) }

#[derive(Clone, Debug, Deserialize)]
struct CreateReq {
    title: String,
    content: String,
    status: Option<BlogStatus>,
    tags: Option<HashSet<String>>,
    #[serde(rename = "featured-image-id")]
    featured_image_id: Option<MediaId>,
}

async fn create1(state: &Vellum, headers: &HeaderMap, req: CreateReq) -> Result<Blog> {
    let author = user_from_headers(headers).context(UnauthenticatedSnafu)?;
    ensure!(!req.title.trim().is_empty(), EmptyTitleSnafu);
    ensure!(!req.content.trim().is_empty(), EmptyContentSnafu);

    let status = req.status.unwrap_or(BlogStatus::Draft);
    let now = Utc::now();
    let counts = EngagementCounts::default();
    let blog = Blog {
        id: BlogId::new(),
        slug: Slug::mint(&req.title),
        author_id: author,
        title: req.title,
        content: req.content,
        status,
        tags: req.tags.unwrap_or_default(),
        featured_image_id: req.featured_image_id,
        popularity: popularity::score(&counts),
        counts,
        is_deleted: false,
        created_at: now,
        updated_at: now,
        published_at: (status == BlogStatus::Published).then_some(now),
    };
    state.storage.create_blog(&blog).await.context(CreateSnafu)?;

    // A new blog changes what every list page should show.
    state.blog_cache.invalidate_lists().await;
    Ok(blog)
}

/// Create a new blog
///
/// The authenticated caller becomes the author. The slug is minted from the title (with a UUID
/// suffix, so it's unique without a storage round-trip); blogs start as drafts unless the request
/// says otherwise.
async fn create(
    State(state): State<Arc<Vellum>>,
    headers: HeaderMap,
    Json(req): Json<CreateReq>,
) -> axum::response::Response {
    match create1(&state, &headers, req).await {
        Ok(blog) => {
            info!("created blog {} at slug {}", blog.id, blog.slug);
            counter_add!(state.instruments, "blogs.creates.successful", 1, &[]);
            (StatusCode::CREATED, Json(blog)).into_response()
        }
        Err(err @ (Error::EmptyTitle { .. } | Error::EmptyContent { .. })) => {
            info!("rejected blog creation: {}", err);
            counter_add!(state.instruments, "blogs.creates.failures", 1, &[]);
            err.into_response()
        }
        Err(err) => {
            error!("{:#?}", err);
            counter_add!(state.instruments, "blogs.creates.failures", 1, &[]);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                               `GET /blogs` & `GET /blogs/popular`                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("blogs.reads.list", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("blogs.reads.list.failures", Sort::IntegralCounter) }

#[derive(Clone, Debug, Default, Deserialize)]
struct ListParams {
    page: Option<u32>,
    #[serde(rename = "page-size")]
    page_size: Option<u32>,
    #[serde(rename = "sort-by")]
    sort_by: Option<SortBy>,
    #[serde(rename = "sort-order")]
    sort_order: Option<SortOrder>,
    #[serde(rename = "date-from")]
    date_from: Option<DateTime<Utc>>,
    #[serde(rename = "date-to")]
    date_to: Option<DateTime<Utc>>,
}

impl ListParams {
    // Canonicalize *before* building the cache key; page 0 & page 1 are the same request & had
    // better be the same key.
    fn into_query(self) -> ListQuery {
        ListQuery {
            page: self.page.unwrap_or(1).max(1),
            page_size: self.page_size.unwrap_or(10).clamp(1, 100),
            sort_by: self.sort_by.unwrap_or_default(),
            sort_order: self.sort_order.unwrap_or_default(),
            date_from: self.date_from,
            date_to: self.date_to,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ListRsp {
    pub blogs: Vec<Blog>,
    pub total: u64,
    pub page: u32,
    #[serde(rename = "total-pages")]
    pub total_pages: u32,
}

fn mk_list_rsp(page: BlogPage, q: &ListQuery) -> ListRsp {
    ListRsp {
        total_pages: page.total.div_ceil(q.page_size as u64) as u32,
        total: page.total,
        page: q.page,
        blogs: page.blogs,
    }
}

async fn list1(state: &Vellum, q: ListQuery) -> Result<ListRsp> {
    if let Some(cached) = state.blog_cache.page(&q).await {
        debug!("list page {} served from cache", q.page);
        return Ok(mk_list_rsp(cached, &q));
    }

    // Only published & archived blogs are served by the public list endpoints.
    let filter = FilterOptions {
        page: q.page,
        page_size: q.page_size,
        sort_by: q.sort_by,
        sort_order: q.sort_order,
        date_from: q.date_from,
        date_to: q.date_to,
        statuses: Some(vec![BlogStatus::Published, BlogStatus::Archived]),
        ..Default::default()
    };
    let (blogs, total) = state.storage.blogs(&filter).await.context(ListSnafu)?;
    let page = BlogPage { blogs, total };
    state.blog_cache.put_page(&q, &page).await;
    Ok(mk_list_rsp(page, &q))
}

/// List blogs: newest first by default, paginated, optionally bounded by creation date.
async fn list(
    State(state): State<Arc<Vellum>>,
    Query(params): Query<ListParams>,
) -> axum::response::Response {
    match list1(&state, params.into_query()).await {
        Ok(rsp) => {
            counter_add!(state.instruments, "blogs.reads.list", 1, &[]);
            (StatusCode::OK, Json(rsp)).into_response()
        }
        Err(err) => {
            error!("{:#?}", err);
            counter_add!(state.instruments, "blogs.reads.list.failures", 1, &[]);
            err.into_response()
        }
    }
}

/// The "popular" listing is just the list endpoint pinned to popularity-descending; it flows
/// through the same list cache (the sort is part of the key).
async fn popular(
    State(state): State<Arc<Vellum>>,
    Query(params): Query<ListParams>,
) -> axum::response::Response {
    let q = ListQuery {
        sort_by: SortBy::Popularity,
        sort_order: SortOrder::Desc,
        ..params.into_query()
    };
    match list1(&state, q).await {
        Ok(rsp) => {
            counter_add!(state.instruments, "blogs.reads.list", 1, &[]);
            (StatusCode::OK, Json(rsp)).into_response()
        }
        Err(err) => {
            error!("{:#?}", err);
            counter_add!(state.instruments, "blogs.reads.list.failures", 1, &[]);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      `GET /blogs/{slug}`                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("blogs.reads.detail", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("blogs.reads.detail.failures", Sort::IntegralCounter) }

async fn detail1(state: &Vellum, slug: &Slug) -> Result<Blog> {
    if let Some(blog) = state.blog_cache.detail(slug).await {
        debug!("blog detail {} served from cache", slug);
        return Ok(blog);
    }

    let blog = state
        .storage
        .blog_by_slug(slug)
        .await
        .context(FetchSnafu)?
        .filter(|blog| blog.status.is_publicly_visible())
        .context(NoSuchSlugSnafu { slug: slug.clone() })?;

    state.blog_cache.put_detail(&blog).await;
    Ok(blog)
}

/// Fetch one blog by slug, cache-aside.
async fn detail(
    State(state): State<Arc<Vellum>>,
    Path(key): Path<String>,
) -> axum::response::Response {
    fn parse_slug(key: &str) -> Result<Slug> {
        Slug::new(key).context(BadSlugSnafu { text: key })
    }

    let result = match parse_slug(&key) {
        Ok(slug) => detail1(&state, &slug).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(blog) => {
            counter_add!(state.instruments, "blogs.reads.detail", 1, &[]);
            (StatusCode::OK, Json(blog)).into_response()
        }
        Err(err @ Error::NoSuchSlug { .. }) => {
            counter_add!(state.instruments, "blogs.reads.detail.failures", 1, &[]);
            err.into_response()
        }
        Err(err) => {
            error!("{:#?}", err);
            counter_add!(state.instruments, "blogs.reads.detail.failures", 1, &[]);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                     `PATCH /blogs/{id}`                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("blogs.updates.successful", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("blogs.updates.failures", Sort::IntegralCounter) }

#[derive(Clone, Debug, Deserialize)]
struct UpdateReq {
    title: Option<String>,
    content: Option<String>,
    status: Option<BlogStatus>,
    #[serde(rename = "featured-image-id")]
    featured_image_id: Option<MediaId>,
}

async fn update1(state: &Vellum, headers: &HeaderMap, id: &BlogId, req: UpdateReq) -> Result<Blog> {
    let caller = user_from_headers(headers).context(UnauthenticatedSnafu)?;
    let blog = state
        .storage
        .blog_by_id(id)
        .await
        .context(FetchSnafu)?
        .context(NoSuchBlogSnafu { id: *id })?;
    ensure!(blog.author_id == caller, NotTheAuthorSnafu);

    let old_slug = blog.slug.clone();
    let mut update = BlogUpdate::default();
    if let Some(title) = req.title {
        ensure!(!title.trim().is_empty(), EmptyTitleSnafu);
        // A title edit re-mints the slug.
        update.slug = Some(Slug::mint(&title));
        update.title = Some(title);
    }
    if let Some(content) = req.content {
        ensure!(!content.trim().is_empty(), EmptyContentSnafu);
        update.content = Some(content);
    }
    if let Some(status) = req.status {
        update.status = Some(status);
        // The first transition to published stamps the timestamp; later unpublish/republish
        // cycles keep the original.
        if status == BlogStatus::Published && blog.published_at.is_none() {
            update.published_at = Some(Utc::now());
        }
    }
    update.featured_image_id = req.featured_image_id;

    if !update.is_empty() {
        ensure!(
            state
                .storage
                .update_blog(id, &update)
                .await
                .context(UpdateSnafu)?,
            NoSuchBlogSnafu { id: *id }
        );
    }

    let updated = state
        .storage
        .blog_by_id(id)
        .await
        .context(FetchSnafu)?
        .context(NoSuchBlogSnafu { id: *id })?;

    // Invalidate: every list page, the current slug's detail entry &, if the slug moved, the
    // previous slug's entry too.
    state.blog_cache.invalidate_lists().await;
    state.blog_cache.invalidate_detail(&updated.slug).await;
    if updated.slug != old_slug {
        state.blog_cache.invalidate_detail(&old_slug).await;
    }

    Ok(updated)
}

/// Update a blog (author only): title, content, status and/or featured image.
async fn update(
    State(state): State<Arc<Vellum>>,
    headers: HeaderMap,
    Path(key): Path<String>,
    Json(req): Json<UpdateReq>,
) -> axum::response::Response {
    let id = match BlogId::from_raw_string(&key).context(BadBlogIdSnafu { text: key }) {
        Ok(id) => id,
        Err(err) => {
            counter_add!(state.instruments, "blogs.updates.failures", 1, &[]);
            return err.into_response();
        }
    };
    match update1(&state, &headers, &id, req).await {
        Ok(blog) => {
            info!("updated blog {}; slug now {}", blog.id, blog.slug);
            counter_add!(state.instruments, "blogs.updates.successful", 1, &[]);
            (StatusCode::OK, Json(blog)).into_response()
        }
        Err(err @ (Error::NoSuchBlog { .. } | Error::NotTheAuthor { .. })) => {
            info!("refused update of blog {}: {}", id, err);
            counter_add!(state.instruments, "blogs.updates.failures", 1, &[]);
            err.into_response()
        }
        Err(err) => {
            error!("{:#?}", err);
            counter_add!(state.instruments, "blogs.updates.failures", 1, &[]);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    `DELETE /blogs/{id}`                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("blogs.deletes.successful", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("blogs.deletes.failures", Sort::IntegralCounter) }

async fn delete1(state: &Vellum, headers: &HeaderMap, id: &BlogId) -> Result<()> {
    let caller = user_from_headers(headers).context(UnauthenticatedSnafu)?;
    let blog = state
        .storage
        .blog_by_id(id)
        .await
        .context(FetchSnafu)?
        .context(NoSuchBlogSnafu { id: *id })?;
    // The author or an administrator; nobody else.
    ensure!(
        is_admin(headers) || blog.author_id == caller,
        NotTheAuthorSnafu
    );

    ensure!(
        state
            .storage
            .soft_delete_blog(id)
            .await
            .context(DeleteSnafu)?,
        NoSuchBlogSnafu { id: *id }
    );

    state.blog_cache.invalidate_lists().await;
    state.blog_cache.invalidate_detail(&blog.slug).await;
    Ok(())
}

/// Soft-delete a blog (author or admin).
async fn delete_blog(
    State(state): State<Arc<Vellum>>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> axum::response::Response {
    let id = match BlogId::from_raw_string(&key).context(BadBlogIdSnafu { text: key }) {
        Ok(id) => id,
        Err(err) => {
            counter_add!(state.instruments, "blogs.deletes.failures", 1, &[]);
            return err.into_response();
        }
    };
    match delete1(&state, &headers, &id).await {
        Ok(()) => {
            info!("deleted blog {}", id);
            counter_add!(state.instruments, "blogs.deletes.successful", 1, &[]);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => {
            error!("{:#?}", err);
            counter_add!(state.instruments, "blogs.deletes.failures", 1, &[]);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Public API                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Return a router for the Blog API
///
/// The returned [Router] will presumably be merged with other routers.
pub fn make_router(state: Arc<Vellum>) -> Router<Arc<Vellum>> {
    Router::new()
        .route("/blogs", get(list).post(create))
        .route("/blogs/popular", get(popular))
        // One route, three verbs: GET takes a slug, PATCH & DELETE take an id. axum won't accept
        // two different capture names on one path, so the handlers parse `key` themselves.
        .route(
            "/blogs/{key}",
            get(detail).patch(update).delete(delete_blog),
        )
        // All responses are JSON; add the appropriate Content-Type header (but leave the existing
        // Content-Type header should a handler set it specially).
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        blog_cache::{BlogCache, CacheTtls},
        metrics::Instruments,
        reactions::ReactionToggle,
        storage::Backend as _,
        testing::{MemoryCache, MemoryStore},
        views::{FraudPolicy, ViewTracker},
        window::Windows,
    };
    use axum::http::HeaderValue;

    fn mk_state() -> (Arc<MemoryStore>, Vellum) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let instruments = Arc::new(Instruments::new("vellum"));
        let state = Vellum {
            storage: store.clone(),
            blog_cache: BlogCache::new(cache.clone(), CacheTtls::default(), instruments.clone()),
            views: ViewTracker::new(
                store.clone(),
                Windows::new(cache, store.clone()),
                FraudPolicy::default(),
            ),
            reactions: ReactionToggle::new(store.clone(), None),
            registry: prometheus::Registry::new(),
            instruments,
        };
        (store, state)
    }

    fn headers_for(user: &UserId) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            crate::http::USER_HEADER,
            HeaderValue::from_str(&user.to_string()).unwrap(),
        );
        headers
    }

    fn mk_req(title: &str) -> CreateReq {
        CreateReq {
            title: title.to_owned(),
            content: "Some plausible prose.".to_owned(),
            status: Some(BlogStatus::Published),
            tags: None,
            featured_image_id: None,
        }
    }

    #[tokio::test]
    async fn creation_validates_and_publishes() {
        let (_store, state) = mk_state();
        let author = UserId::new();
        let headers = headers_for(&author);

        assert!(matches!(
            create1(&state, &headers, mk_req("")).await,
            Err(Error::EmptyTitle { .. })
        ));
        assert!(matches!(
            create1(&state, &HeaderMap::new(), mk_req("Anonymous?")).await,
            Err(Error::Unauthenticated { .. })
        ));

        let blog = create1(&state, &headers, mk_req("My First Post")).await.unwrap();
        assert_eq!(author, blog.author_id);
        assert!(blog.published_at.is_some());
        assert!(blog.slug.starts_with("my-first-post-"));
    }

    #[tokio::test]
    async fn detail_is_cache_aside() {
        let (store, state) = mk_state();
        let headers = headers_for(&UserId::new());
        let blog = create1(&state, &headers, mk_req("Cached?")).await.unwrap();

        // First read populates the cache...
        assert_eq!(blog.id, detail1(&state, &blog.slug).await.unwrap().id);
        // ...as witnessed by the durable copy vanishing out from under us.
        store.soft_delete_blog(&blog.id).await.unwrap();
        assert_eq!(blog.id, detail1(&state, &blog.slug).await.unwrap().id);
    }

    #[tokio::test]
    async fn drafts_are_not_served_by_slug() {
        let (_store, state) = mk_state();
        let headers = headers_for(&UserId::new());
        let mut req = mk_req("Still Cooking");
        req.status = Some(BlogStatus::Draft);
        let blog = create1(&state, &headers, req).await.unwrap();
        assert!(matches!(
            detail1(&state, &blog.slug).await,
            Err(Error::NoSuchSlug { .. })
        ));
    }

    #[tokio::test]
    async fn a_title_edit_retires_the_old_slug() {
        let (_store, state) = mk_state();
        let author = UserId::new();
        let headers = headers_for(&author);
        let blog = create1(&state, &headers, mk_req("Old Title")).await.unwrap();
        let old_slug = blog.slug.clone();
        detail1(&state, &old_slug).await.unwrap(); // warm the detail cache

        let updated = update1(
            &state,
            &headers,
            &blog.id,
            UpdateReq {
                title: Some("New Title".to_owned()),
                content: None,
                status: None,
                featured_image_id: None,
            },
        )
        .await
        .unwrap();
        assert_ne!(old_slug, updated.slug);

        // The old slug is gone (from the cache *and* storage)...
        assert!(matches!(
            detail1(&state, &old_slug).await,
            Err(Error::NoSuchSlug { .. })
        ));
        // ...and the new one serves.
        assert_eq!(blog.id, detail1(&state, &updated.slug).await.unwrap().id);
    }

    #[tokio::test]
    async fn update_is_author_only() {
        let (_store, state) = mk_state();
        let author = UserId::new();
        let blog = create1(&state, &headers_for(&author), mk_req("Mine")).await.unwrap();
        let result = update1(
            &state,
            &headers_for(&UserId::new()),
            &blog.id,
            UpdateReq {
                title: None,
                content: Some("Defaced!".to_owned()),
                status: None,
                featured_image_id: None,
            },
        )
        .await;
        assert!(matches!(result, Err(Error::NotTheAuthor { .. })));
    }

    #[tokio::test]
    async fn delete_respects_the_admin_override() {
        let (_store, state) = mk_state();
        let author = UserId::new();
        let blog = create1(&state, &headers_for(&author), mk_req("Doomed")).await.unwrap();

        let stranger = headers_for(&UserId::new());
        assert!(matches!(
            delete1(&state, &stranger, &blog.id).await,
            Err(Error::NotTheAuthor { .. })
        ));

        let mut admin = headers_for(&UserId::new());
        admin.insert(crate::http::ADMIN_HEADER, HeaderValue::from_static("true"));
        delete1(&state, &admin, &blog.id).await.unwrap();
        assert!(matches!(
            delete1(&state, &admin, &blog.id).await,
            Err(Error::NoSuchBlog { .. })
        ));
    }

    #[tokio::test]
    async fn mutation_invalidates_list_pages() {
        let (_store, state) = mk_state();
        let headers = headers_for(&UserId::new());
        create1(&state, &headers, mk_req("First")).await.unwrap();

        let q = ListParams::default().into_query();
        assert_eq!(1, list1(&state, q.clone()).await.unwrap().total);

        // The second create must punch out the cached page.
        create1(&state, &headers, mk_req("Second")).await.unwrap();
        assert_eq!(2, list1(&state, q).await.unwrap().total);
    }

    #[tokio::test]
    async fn popular_sorts_by_the_derived_score() {
        let (store, state) = mk_state();
        let headers = headers_for(&UserId::new());
        let dull = create1(&state, &headers, mk_req("Dull")).await.unwrap();
        let hot = create1(&state, &headers, mk_req("Hot")).await.unwrap();
        state
            .reactions
            .toggle_like(&UserId::new(), &hot.id)
            .await
            .unwrap();
        let _ = (dull, store);

        let q = ListQuery {
            sort_by: SortBy::Popularity,
            sort_order: SortOrder::Desc,
            ..ListParams::default().into_query()
        };
        let rsp = list1(&state, q).await.unwrap();
        assert_eq!("Hot", rsp.blogs[0].title);
    }
}
