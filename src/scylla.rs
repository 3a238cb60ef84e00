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

//! # scylla
//!
//! [Storage] implementation for ScyllaDB.
//!
//! [Storage]: crate::storage
//!
//! Two points of interest. First, the engagement counters live in a dedicated counter table
//! (`blog_counters`); CQL counter columns give us the atomic increment/decrement the concurrency
//! story demands, at the price of keeping them out of the `blogs` table & merging on read.
//! Second, the view-record window scans (`ALLOW FILTERING` over `blog_views`) back the fraud
//! heuristics when the cache tier is down; they're filtered scans, which is fine at blog scale &
//! keeps the fallback path free of extra infrastructure.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use enum_map::{Enum, EnumMap};
use futures::stream;
use itertools::Itertools;
use scylla::{
    frame::value::Counter, prepared_statement::PreparedStatement, transport::errors::QueryError,
    DeserializeRow, SessionBuilder,
};
use secrecy::{ExposeSecret, SecretString};
use snafu::{Backtrace, IntoError, ResultExt, Snafu};
use tap::Pipe;

use crate::{
    entities::{
        Blog, BlogId, BlogStatus, EngagementCounts, MediaId, Reaction, ReactionKind, Slug, UserId,
        ViewRecord,
    },
    storage::{self, BlogUpdate, CounterField, FilterOptions},
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("A query was expected to produce at most one row & did not."))]
    AtMostOneRow { backtrace: Backtrace },
    #[snafu(display(
        "The number of prepared statements isn't consistent; this is a bug & should be reported!"
    ))]
    BadPreparedStatementCount { backtrace: Backtrace },
    #[snafu(display("Failed to deserialize a Blog: {source}"))]
    BlogDe {
        source: scylla::deserialize::DeserializationError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to deserialize a counter row: {source}"))]
    CounterDe {
        source: scylla::deserialize::DeserializationError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to create the vellum schema: {source}"))]
    CreateSchema {
        source: scylla::transport::errors::QueryError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to convert to a RowsResult: {source}"))]
    IntoRowsResult {
        source: scylla::transport::query_result::IntoRowsResultError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to set keyspace: {source}"))]
    Keyspace {
        source: scylla::transport::errors::QueryError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to create a ScyllaDB session: {source}"))]
    NewSession {
        source: scylla::transport::errors::NewSessionError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to prepare statement: {stmt}: {source}"))]
    Prepare {
        stmt: String,
        source: scylla::transport::errors::QueryError,
        backtrace: Backtrace,
    },
    #[snafu(display("ScyllaDB query failed: {source}"))]
    Query {
        source: QueryError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to deserialize a Reaction: {source}"))]
    ReactionDe {
        source: scylla::deserialize::DeserializationError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to type a RowResult: {source}"))]
    TypedRows {
        source: scylla::transport::query_result::RowsError,
        backtrace: Backtrace,
    },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                  vellum ScyllaDB session type                                  //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The set of prepared statements used by vellum
///
/// I began this implementation by simply giving each prepared statement a field in the [Session]
/// struct, but this quickly became unwieldy. This enum is intended to be used as both a mnemonic
/// tag identifying prepared statements and as the key type in a mapping from said tags to the
/// actual [PreparedStatement]s.
///
/// The [Enum] interface below may be unfamiliar to the reader; that is defined in the [enum_map]
/// crate & will require us to provide a slice of [PreparedStatement] of length exactly equal to
/// the number of variants in this enumeration.
#[derive(Clone, Debug, Enum, Eq, PartialEq)]
enum PreparedStatements {
    InsertBlog,
    SelectBlogById,
    SelectBlogBySlug,
    SelectBlogs,
    UpdateBlog,
    SoftDeleteBlog,
    IncViews,
    IncLikes,
    IncDislikes,
    IncComments,
    SelectCounters,
    SelectAllCounters,
    InsertView,
    ViewedSinceByIp,
    ViewedSinceByViewer,
    BlogsViewedByIp,
    IpsSeenForViewer,
    SelectReaction,
    UpsertReaction,
    SoftDeleteReaction,
    CountReactions,
}

// DDL run at startup; every statement is idempotent, so racing instances are harmless.
const SCHEMA: &[&str] = &[
    "create keyspace if not exists vellum with replication = \
     {'class': 'NetworkTopologyStrategy', 'replication_factor': 1}",
    "create table if not exists vellum.blogs (id uuid primary key, slug text, author_id uuid, \
     title text, content text, status text, tags set<text>, featured_image_id uuid, \
     popularity double, is_deleted boolean, created_at timestamp, updated_at timestamp, \
     published_at timestamp)",
    "create table if not exists vellum.blog_counters (blog_id uuid primary key, views counter, \
     likes counter, dislikes counter, comments counter)",
    "create table if not exists vellum.blog_views (blog_id uuid, viewed_at timestamp, id uuid, \
     viewer_id uuid, ip inet, user_agent text, primary key (blog_id, viewed_at, id))",
    "create table if not exists vellum.reactions (user_id uuid, target_id uuid, id uuid, \
     target_kind text, kind text, is_deleted boolean, created_at timestamp, \
     updated_at timestamp, primary key ((user_id, target_id)))",
];

const SELECT_BLOG_COLUMNS: &str = "id,slug,author_id,title,content,status,tags,\
                                   featured_image_id,popularity,is_deleted,created_at,\
                                   updated_at,published_at";

/// `vellum`-specific ScyllaDB Session type
///
/// Instantiate this via [Session::new] with connection info & credentials if need be; when
/// dropped the ScyllaDB session will be terminated.
pub struct Session {
    session: ::scylla::Session,
    /// An [EnumMap] is a map whose keys are enum values where all values are guaranteed to be
    /// represented. As a result, the index operator is guaranteed to succeed-- no need to unwrap
    /// [Option]s or [Result]s or some such.
    prepared_statements: EnumMap<PreparedStatements, PreparedStatement>,
}

impl Session {
    /// Prepare a statement
    async fn prepare(scylla: &::scylla::Session, stmt: &str) -> Result<PreparedStatement> {
        scylla.prepare(stmt).await.context(PrepareSnafu {
            stmt: stmt.to_owned(),
        })
    }

    /// [Session] constructor
    ///
    /// Construct with a collection of ScyllaDB hosts. `credentials`, if non-None, should be a
    /// pair of strings consisting of the username & password. Creates the vellum keyspace &
    /// tables if they don't already exist.
    pub async fn new(
        hosts: impl IntoIterator<Item = impl AsRef<str>>,
        credentials: &Option<(SecretString, SecretString)>,
    ) -> Result<Session> {
        let mut builder = SessionBuilder::new().known_nodes(hosts);
        if let Some((user, pass)) = credentials {
            builder = builder.user(user.expose_secret(), pass.expose_secret())
        }
        let scylla = builder.build().await.context(NewSessionSnafu)?;

        for stmt in SCHEMA {
            scylla
                .query_unpaged(*stmt, ())
                .await
                .context(CreateSchemaSnafu)?;
        }
        scylla
            .use_keyspace("vellum", false)
            .await
            .context(KeyspaceSnafu)?;

        use futures::stream::StreamExt;
        let prepared_statements = stream::iter(vec![
            // Ho-kay: here's the deal. We list here all the prepared statements we want to use,
            // in the same order as [PreparedStatements].
            format!("insert into blogs ({}) values (?,?,?,?,?,?,?,?,?,?,?,?,?)", SELECT_BLOG_COLUMNS),
            format!("select {} from blogs where id=?", SELECT_BLOG_COLUMNS),
            format!("select {} from blogs where slug=? allow filtering", SELECT_BLOG_COLUMNS),
            format!("select {} from blogs", SELECT_BLOG_COLUMNS),
            "update blogs set slug=?,title=?,content=?,status=?,featured_image_id=?,popularity=?,published_at=?,updated_at=? where id=?".to_owned(),
            "update blogs set is_deleted=true,updated_at=? where id=?".to_owned(), // SoftDeleteBlog
            "update blog_counters set views=views+? where blog_id=?".to_owned(),
            "update blog_counters set likes=likes+? where blog_id=?".to_owned(),
            "update blog_counters set dislikes=dislikes+? where blog_id=?".to_owned(),
            "update blog_counters set comments=comments+? where blog_id=?".to_owned(),
            "select views,likes,dislikes,comments from blog_counters where blog_id=?".to_owned(),
            "select blog_id,views,likes,dislikes,comments from blog_counters".to_owned(),
            "insert into blog_views (id,blog_id,viewer_id,ip,user_agent,viewed_at) values (?,?,?,?,?,?)".to_owned(),
            "select id from blog_views where blog_id=? and viewed_at>=? and ip=? limit 1 allow filtering".to_owned(),
            "select id from blog_views where blog_id=? and viewed_at>=? and viewer_id=? limit 1 allow filtering".to_owned(),
            "select blog_id from blog_views where ip=? and viewed_at>=? allow filtering".to_owned(),
            "select ip from blog_views where viewer_id=? and viewed_at>=? allow filtering".to_owned(),
            "select id,user_id,target_id,target_kind,kind,is_deleted,created_at,updated_at from reactions where user_id=? and target_id=?".to_owned(),
            "insert into reactions (id,user_id,target_id,target_kind,kind,is_deleted,created_at,updated_at) values (?,?,?,?,?,?,?,?)".to_owned(),
            "update reactions set is_deleted=true,updated_at=? where user_id=? and target_id=?".to_owned(),
            "select count(*) from reactions where target_id=? and kind=? and is_deleted=false allow filtering".to_owned(),
        ])
            // Then (see what I did there?), we actually prepare them with the Scylla database to
            // get futures yielding `Result<PreparedStatement>`...
            .then(|s| {
                let scylla = &scylla;
                async move { Self::prepare(scylla, &s).await }
            })
            // which we collect into a single `Future`...
            .collect::<Vec<_>>()
            // and then resolve to a `Vec<Result<PreparedStatement>>`...
            .await
            // and then move into an iterator...
            .into_iter()
            // and, finally, collect into a `Result<Vec<PreparedStatement>>`:
            .collect::<Result<Vec<PreparedStatement>>>()?;
        // Now: in order to create an `EnumMap`, we need a slice of `PreparedStatement` of
        // *precisely the right length*, and in the right order. We can't test for the latter, but
        // we can for the former: this will fail if we don't have a prepared statement
        // corresponding to each element of `PreparedStatements`.
        let prepared_statements: [PreparedStatement; 21] = prepared_statements
            .try_into()
            .map_err(|_| BadPreparedStatementCountSnafu.build())?;

        Ok(Session {
            session: scylla,
            prepared_statements: EnumMap::from_array(prepared_statements),
        })
    }
}

use storage::Error as StorError;

// Use these if you don't want to add any context to a failed query... should probably wrap this
// up in a macro, but I'm not sure this is the way I want to go, just yet.
impl std::convert::From<scylla::transport::errors::QueryError> for StorError {
    fn from(value: scylla::transport::errors::QueryError) -> Self {
        StorError::new(value)
    }
}

impl std::convert::From<scylla::transport::query_result::IntoRowsResultError> for StorError {
    fn from(value: scylla::transport::query_result::IntoRowsResultError) -> Self {
        StorError::new(value)
    }
}

impl std::convert::From<scylla::transport::query_result::RowsError> for StorError {
    fn from(value: scylla::transport::query_result::RowsError) -> Self {
        StorError::new(value)
    }
}

impl std::convert::From<scylla::transport::query_result::MaybeFirstRowError> for StorError {
    fn from(value: scylla::transport::query_result::MaybeFirstRowError) -> Self {
        StorError::new(value)
    }
}

impl std::convert::From<scylla::transport::query_result::FirstRowError> for StorError {
    fn from(value: scylla::transport::query_result::FirstRowError) -> Self {
        StorError::new(value)
    }
}

impl std::convert::From<scylla::deserialize::DeserializationError> for StorError {
    fn from(value: scylla::deserialize::DeserializationError) -> Self {
        StorError::new(value)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         row shapes                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One row of the `blogs` table; merged with its counters to produce a [Blog].
// Nb. an empty CQL collection reads back as null, hence `Option` for `tags`.
#[derive(DeserializeRow)]
struct BlogRow {
    id: BlogId,
    slug: Slug,
    author_id: UserId,
    title: String,
    content: String,
    status: BlogStatus,
    tags: Option<HashSet<String>>,
    featured_image_id: Option<MediaId>,
    popularity: f64,
    is_deleted: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
}

impl BlogRow {
    fn into_blog(self, counts: EngagementCounts) -> Blog {
        Blog {
            id: self.id,
            slug: self.slug,
            author_id: self.author_id,
            title: self.title,
            content: self.content,
            status: self.status,
            tags: self.tags.unwrap_or_default(),
            featured_image_id: self.featured_image_id,
            counts,
            popularity: self.popularity,
            is_deleted: self.is_deleted,
            created_at: self.created_at,
            updated_at: self.updated_at,
            published_at: self.published_at,
        }
    }
}

// A blog with no counter row (or with unset counter columns) reads as all-zero; counters that
// have gone negative (which the reconciler will shortly correct) clamp to zero rather than
// panicking the read path.
fn mk_counts(
    views: Option<Counter>,
    likes: Option<Counter>,
    dislikes: Option<Counter>,
    comments: Option<Counter>,
) -> EngagementCounts {
    fn clamp(c: Option<Counter>) -> u64 {
        c.map(|c| c.0.max(0) as u64).unwrap_or(0)
    }
    EngagementCounts {
        views: clamp(views),
        likes: clamp(likes),
        dislikes: clamp(dislikes),
        comments: clamp(comments),
    }
}

type CounterRow = (Option<Counter>, Option<Counter>, Option<Counter>, Option<Counter>);

impl Session {
    async fn counter_row(&self, id: &BlogId) -> StdResult<EngagementCounts, StorError> {
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::SelectCounters],
                (id,),
            )
            .await?
            .into_rows_result()?
            .maybe_first_row::<CounterRow>()?
            .map(|(views, likes, dislikes, comments)| mk_counts(views, likes, dislikes, comments))
            .unwrap_or_default()
            .pipe(Ok)
    }

    async fn blog_row_to_blog(&self, row: BlogRow) -> StdResult<Blog, StorError> {
        let counts = self.counter_row(&row.id).await?;
        Ok(row.into_blog(counts))
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      the storage Backend                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[async_trait]
impl storage::Backend for Session {
    async fn create_blog(&self, blog: &Blog) -> StdResult<(), StorError> {
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::InsertBlog],
                (
                    &blog.id,
                    &blog.slug,
                    &blog.author_id,
                    &blog.title,
                    &blog.content,
                    &blog.status,
                    &blog.tags,
                    &blog.featured_image_id,
                    blog.popularity,
                    blog.is_deleted,
                    &blog.created_at,
                    &blog.updated_at,
                    &blog.published_at,
                ),
            )
            .await?;
        Ok(())
    }

    async fn blog_by_id(&self, id: &BlogId) -> StdResult<Option<Blog>, StorError> {
        let row = self
            .session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::SelectBlogById],
                (id,),
            )
            .await?
            .into_rows_result()?
            .maybe_first_row::<BlogRow>()?;
        match row {
            Some(row) if !row.is_deleted => Ok(Some(self.blog_row_to_blog(row).await?)),
            _ => Ok(None),
        }
    }

    async fn blog_by_slug(&self, slug: &Slug) -> StdResult<Option<Blog>, StorError> {
        let row = self
            .session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::SelectBlogBySlug],
                (slug,),
            )
            .await?
            .into_rows_result()?
            .rows::<BlogRow>()?
            .at_most_one()
            .map_err(|_| StorError::new(AtMostOneRowSnafu.build()))?
            .transpose()
            .map_err(|err| StorError::new(BlogDeSnafu {}.into_error(err)))?;
        match row {
            Some(row) if !row.is_deleted => Ok(Some(self.blog_row_to_blog(row).await?)),
            _ => Ok(None),
        }
    }

    async fn blogs(&self, filter: &FilterOptions) -> StdResult<(Vec<Blog>, u64), StorError> {
        // Use `execute_paged`?
        let rows = self
            .session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::SelectBlogs],
                (),
            )
            .await?
            .into_rows_result()?
            .rows::<BlogRow>()?
            .collect::<StdResult<Vec<BlogRow>, _>>()?;

        // One scan of the counter table beats a point-read per blog.
        let counters = self
            .session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::SelectAllCounters],
                (),
            )
            .await?
            .into_rows_result()?
            .rows::<(BlogId, Option<Counter>, Option<Counter>, Option<Counter>, Option<Counter>)>()?
            .map(|row| {
                row.map(|(id, views, likes, dislikes, comments)| {
                    (id, mk_counts(views, likes, dislikes, comments))
                })
            })
            .collect::<StdResult<HashMap<BlogId, EngagementCounts>, _>>()?;

        let merged = rows
            .into_iter()
            .map(|row| {
                let counts = counters.get(&row.id).copied().unwrap_or_default();
                row.into_blog(counts)
            })
            .collect::<Vec<Blog>>();

        Ok(storage::paginate(merged, filter))
    }

    async fn update_blog(&self, id: &BlogId, update: &BlogUpdate) -> StdResult<bool, StorError> {
        // CQL has no "update only the fields I name, only if the row exists" in one statement
        // (short of LWT contortions), so: read, merge, write the mutable columns back. Losing a
        // popularity write in the window is tolerable-- it's derived state & the next refresh
        // re-derives it.
        let current = match self.blog_by_id(id).await? {
            Some(blog) => blog,
            None => return Ok(false),
        };
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::UpdateBlog],
                (
                    update.slug.as_ref().unwrap_or(&current.slug),
                    update.title.as_ref().unwrap_or(&current.title),
                    update.content.as_ref().unwrap_or(&current.content),
                    update.status.unwrap_or(current.status),
                    update.featured_image_id.or(current.featured_image_id),
                    update.popularity.unwrap_or(current.popularity),
                    update.published_at.or(current.published_at),
                    Utc::now(),
                    id,
                ),
            )
            .await?;
        Ok(true)
    }

    async fn soft_delete_blog(&self, id: &BlogId) -> StdResult<bool, StorError> {
        if self.blog_by_id(id).await?.is_none() {
            return Ok(false);
        }
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::SoftDeleteBlog],
                (Utc::now(), id),
            )
            .await?;
        Ok(true)
    }

    async fn adjust_counter(
        &self,
        id: &BlogId,
        field: CounterField,
        delta: i64,
    ) -> StdResult<(), StorError> {
        let stmt = match field {
            CounterField::Views => PreparedStatements::IncViews,
            CounterField::Likes => PreparedStatements::IncLikes,
            CounterField::Dislikes => PreparedStatements::IncDislikes,
            CounterField::Comments => PreparedStatements::IncComments,
        };
        self.session
            .execute_unpaged(&self.prepared_statements[stmt], (Counter(delta), id))
            .await?;
        Ok(())
    }

    async fn counts(&self, id: &BlogId) -> StdResult<EngagementCounts, StorError> {
        self.counter_row(id).await
    }

    async fn append_view(&self, view: &ViewRecord) -> StdResult<(), StorError> {
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::InsertView],
                (
                    &view.id,
                    &view.blog_id,
                    &view.viewer_id,
                    &view.ip,
                    &view.user_agent,
                    &view.viewed_at,
                ),
            )
            .await?;
        Ok(())
    }

    async fn viewed_since(
        &self,
        blog: &BlogId,
        viewer: Option<&UserId>,
        ip: Option<&IpAddr>,
        since: &DateTime<Utc>,
    ) -> StdResult<bool, StorError> {
        if let Some(viewer) = viewer {
            let seen = self
                .session
                .execute_unpaged(
                    &self.prepared_statements[PreparedStatements::ViewedSinceByViewer],
                    (blog, since, viewer),
                )
                .await?
                .into_rows_result()?
                .rows::<(crate::entities::ViewId,)>()?
                .next()
                .is_some();
            if seen {
                return Ok(true);
            }
        }
        if let Some(ip) = ip {
            let seen = self
                .session
                .execute_unpaged(
                    &self.prepared_statements[PreparedStatements::ViewedSinceByIp],
                    (blog, since, ip),
                )
                .await?
                .into_rows_result()?
                .rows::<(crate::entities::ViewId,)>()?
                .next()
                .is_some();
            if seen {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn blogs_viewed_by_ip_since(
        &self,
        ip: &IpAddr,
        since: &DateTime<Utc>,
    ) -> StdResult<HashSet<BlogId>, StorError> {
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::BlogsViewedByIp],
                (ip, since),
            )
            .await?
            .into_rows_result()?
            .rows::<(BlogId,)>()?
            .map(|row| row.map(|(id,)| id))
            .collect::<StdResult<HashSet<BlogId>, _>>()?
            .pipe(Ok)
    }

    async fn ips_seen_for_viewer_since(
        &self,
        viewer: &UserId,
        since: &DateTime<Utc>,
    ) -> StdResult<HashSet<IpAddr>, StorError> {
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::IpsSeenForViewer],
                (viewer, since),
            )
            .await?
            .into_rows_result()?
            .rows::<(Option<IpAddr>,)>()?
            .filter_map_ok(|(ip,)| ip)
            .collect::<StdResult<HashSet<IpAddr>, _>>()?
            .pipe(Ok)
    }

    async fn active_reaction(
        &self,
        user: &UserId,
        target: &BlogId,
    ) -> StdResult<Option<Reaction>, StorError> {
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::SelectReaction],
                (user, target),
            )
            .await?
            .into_rows_result()?
            .maybe_first_row::<Reaction>()?
            .filter(|reaction| !reaction.is_deleted)
            .pipe(Ok)
    }

    async fn put_reaction(&self, reaction: &Reaction) -> StdResult<(), StorError> {
        // The partition key is (user_id, target_id), so this insert *is* the upsert: a fresh
        // reaction creates the row, a flip or revival overwrites it in place. One physical row
        // per pair makes the one-active-reaction invariant structural.
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::UpsertReaction],
                (
                    &reaction.id,
                    &reaction.user_id,
                    &reaction.target_id,
                    &reaction.target_kind,
                    &reaction.kind,
                    reaction.is_deleted,
                    &reaction.created_at,
                    &reaction.updated_at,
                ),
            )
            .await?;
        Ok(())
    }

    async fn soft_delete_reaction(
        &self,
        user: &UserId,
        target: &BlogId,
    ) -> StdResult<bool, StorError> {
        if self.active_reaction(user, target).await?.is_none() {
            return Ok(false);
        }
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::SoftDeleteReaction],
                (Utc::now(), user, target),
            )
            .await?;
        Ok(true)
    }

    async fn count_reactions(
        &self,
        target: &BlogId,
        kind: ReactionKind,
    ) -> StdResult<u64, StorError> {
        self.session
            .execute_unpaged(
                &self.prepared_statements[PreparedStatements::CountReactions],
                (target, kind),
            )
            .await?
            .into_rows_result()?
            .first_row::<(i64,)>()?
            .0
            .max(0)
            .pipe(|n| Ok(n as u64))
    }
}
