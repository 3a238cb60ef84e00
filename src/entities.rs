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

//! # vellum models
//!
//! ## Introduction
//!
//! I hate these sort of "catch-all" modules named "models" or "entities", but these types are truly
//! foundational: the blog aggregate (the thing whose counters the whole engagement pipeline exists
//! to keep honest), reactions, and the append-only view records that double as our fraud-detection
//! audit trail.

use std::{collections::HashSet, fmt::Display, net::IpAddr, ops::Deref, str::FromStr};

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use scylla::{
    deserialize::{DeserializationError, DeserializeValue, FrameSlice, TypeCheckError},
    frame::response::result::ColumnType,
    serialize::{
        value::SerializeValue,
        writers::{CellWriter, WrittenCellProof},
        SerializationError,
    },
    DeserializeRow,
};
use serde::{Deserialize, Deserializer, Serialize};
use snafu::{prelude::*, Backtrace};
use uuid::Uuid;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{text} is not a valid blog slug"))]
    BadSlug { text: String, backtrace: Backtrace },
    #[snafu(display("{text} is not a recognized blog status"))]
    BadStatus { text: String, backtrace: Backtrace },
    #[snafu(display("{text} is not a recognized reaction kind"))]
    BadReactionKind { text: String, backtrace: Backtrace },
    #[snafu(display("{text} is not a recognized reaction target kind"))]
    BadTargetKind { text: String, backtrace: Backtrace },
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

fn mk_de_err(err: impl std::error::Error + Send + Sync + 'static) -> DeserializationError {
    DeserializationError::new(err)
}

fn mk_serde_de_err<'de, D: serde::Deserializer<'de>>(err: impl std::error::Error) -> D::Error {
    <D::Error as serde::de::Error>::custom(format!("{:?}", err))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Identifiers                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// identifier!
///
/// Use this to declare a type intended to be used as an opaque identifier for some other sort of
/// entity. In a NoSQL world we can't count on an auto-increment column to hand us identifiers, so
/// everything gets a UUID; I just can't bring myself to use the *same* type to identify blogs,
/// users and reactions all at once.
///
/// The macro defines a newtype struct wrapping [Uuid] implementing [Display], [DeserializeValue]
/// and [SerializeValue] (the derive macros, regrettably, don't work with newtype structs).
macro_rules! define_id {
    ($type_name:ident) => {
        #[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
        #[serde(transparent)]
        pub struct $type_name(Uuid);
        impl $type_name {
            pub fn new() -> $type_name {
                $type_name(Uuid::new_v4())
            }
            pub fn from_raw_string(s: &str) -> StdResult<$type_name, uuid::Error> {
                Ok($type_name(Uuid::parse_str(s)?))
            }
        }
        impl Default for $type_name {
            fn default() -> Self {
                Self::new()
            }
        }
        impl Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0.as_hyphenated())
            }
        }
        impl From<Uuid> for $type_name {
            fn from(value: Uuid) -> Self {
                $type_name(value)
            }
        }
        impl<'frame, 'metadata> DeserializeValue<'frame, 'metadata> for $type_name {
            fn type_check(typ: &ColumnType<'_>) -> StdResult<(), TypeCheckError> {
                Uuid::type_check(typ)
            }
            fn deserialize(
                typ: &'metadata ColumnType<'metadata>,
                v: Option<FrameSlice<'frame>>,
            ) -> StdResult<Self, DeserializationError> {
                Ok(Self(<Uuid as DeserializeValue>::deserialize(typ, v)?))
            }
        }
        impl SerializeValue for $type_name {
            fn serialize<'b>(
                &self,
                typ: &ColumnType<'_>,
                writer: CellWriter<'b>,
            ) -> StdResult<WrittenCellProof<'b>, SerializationError> {
                SerializeValue::serialize(&self.0, typ, writer)
            }
        }
    };
}

define_id!(BlogId);
define_id!(UserId);
define_id!(ReactionId);
define_id!(ViewId);
define_id!(MediaId);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              Slug                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

// Slugs are lowercase ASCII words joined by single hyphens; they appear in URLs, so be strict.
const MAX_SLUG_LENGTH: usize = 128;

lazy_static! {
    static ref SLUG: Regex = Regex::new("^[a-z0-9]+(-[a-z0-9]+)*$").unwrap(/* known good */);
}

fn check_slug(s: &str) -> bool {
    !s.is_empty() && s.len() <= MAX_SLUG_LENGTH && SLUG.is_match(s)
}

/// A refined type representing a blog slug
///
/// Slugs are unique but *mutable*: editing a blog's title mints a fresh slug (see [Slug::mint]),
/// which is why the detail-cache invalidation path has to deal with the previous slug as well.
// Boy... writing refined types in Rust involves a *lot* of boilerplate.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Slug(String);

impl Slug {
    /// Construct a [Slug] from a `&str`, validating as we go. To *move* a [String] into a [Slug]
    /// use [TryFrom::try_from()].
    pub fn new(text: &str) -> Result<Slug> {
        check_slug(text).then_some(Slug(text.to_owned())).ok_or(
            BadSlugSnafu {
                text: text.to_owned(),
            }
            .build(),
        )
    }
    /// Mint a fresh slug from a blog title.
    ///
    /// Lowercase the title, map runs of non-alphanumeric characters to single hyphens, and append
    /// a UUID so the result is unique without a round-trip to storage. Titles that contribute no
    /// usable characters at all still produce a valid (purely UUID) slug.
    pub fn mint(title: &str) -> Slug {
        let stem: String = title
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        let stem = stem
            .split('-')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("-");
        let suffix = Uuid::new_v4().as_simple().to_string();
        if stem.is_empty() {
            Slug(suffix)
        } else {
            // Truncation keeps us under MAX_SLUG_LENGTH even for absurd titles.
            let stem = &stem[..stem.len().min(MAX_SLUG_LENGTH - suffix.len() - 1)];
            Slug(format!("{}-{}", stem.trim_end_matches('-'), suffix))
        }
    }
}

impl AsRef<str> for Slug {
    fn as_ref(&self) -> &str {
        self.deref()
    }
}

impl Deref for Slug {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// Implement `Deserialize` by hand to fail if the serialized value isn't a legit `Slug`
impl<'de> Deserialize<'de> for Slug {
    fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        Slug::try_from(s).map_err(mk_serde_de_err::<'de, D>)
    }
}

impl<'frame, 'metadata> DeserializeValue<'frame, 'metadata> for Slug {
    fn type_check(typ: &ColumnType<'_>) -> StdResult<(), TypeCheckError> {
        String::type_check(typ)
    }
    fn deserialize(
        typ: &'metadata ColumnType<'metadata>,
        v: Option<FrameSlice<'frame>>,
    ) -> StdResult<Self, DeserializationError> {
        Slug::try_from(<String as DeserializeValue>::deserialize(typ, v)?).map_err(mk_de_err)
    }
}

impl Display for Slug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Slug {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Slug::new(s)
    }
}

impl SerializeValue for Slug {
    fn serialize<'b>(
        &self,
        typ: &ColumnType<'_>,
        writer: CellWriter<'b>,
    ) -> StdResult<WrittenCellProof<'b>, SerializationError> {
        SerializeValue::serialize(&self.0, typ, writer)
    }
}

impl TryFrom<String> for Slug {
    type Error = Error;

    fn try_from(text: String) -> std::result::Result<Self, Self::Error> {
        if check_slug(&text) {
            Ok(Slug(text))
        } else {
            BadSlugSnafu { text }.fail()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      textual enumerations                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Declare a small closed enumeration stored as text in ScyllaDB & as a lowercase string in JSON.
///
/// Same motivation as [define_id!]: the value-level trait impls are pure boilerplate, and I had
/// three of these to write.
macro_rules! define_text_enum {
    ($type_name:ident, $err:ident, { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $type_name {
            $($variant),+
        }
        impl $type_name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($type_name::$variant => $text),+
                }
            }
        }
        impl Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }
        impl FromStr for $type_name {
            type Err = Error;
            fn from_str(s: &str) -> StdResult<Self, Self::Err> {
                match s {
                    $($text => Ok($type_name::$variant),)+
                    _ => $err { text: s.to_owned() }.fail(),
                }
            }
        }
        impl<'frame, 'metadata> DeserializeValue<'frame, 'metadata> for $type_name {
            fn type_check(typ: &ColumnType<'_>) -> StdResult<(), TypeCheckError> {
                String::type_check(typ)
            }
            fn deserialize(
                typ: &'metadata ColumnType<'metadata>,
                v: Option<FrameSlice<'frame>>,
            ) -> StdResult<Self, DeserializationError> {
                <String as DeserializeValue>::deserialize(typ, v)?
                    .parse::<$type_name>()
                    .map_err(mk_de_err)
            }
        }
        impl SerializeValue for $type_name {
            fn serialize<'b>(
                &self,
                typ: &ColumnType<'_>,
                writer: CellWriter<'b>,
            ) -> StdResult<WrittenCellProof<'b>, SerializationError> {
                SerializeValue::serialize(&self.as_str().to_owned(), typ, writer)
            }
        }
    };
}

define_text_enum!(BlogStatus, BadStatusSnafu, {
    Draft => "draft",
    Published => "published",
    Archived => "archived",
});

define_text_enum!(ReactionKind, BadReactionKindSnafu, {
    Like => "like",
    Dislike => "dislike",
});

define_text_enum!(TargetKind, BadTargetKindSnafu, {
    Blog => "blog",
    Comment => "comment",
});

impl BlogStatus {
    /// Drafts are never cached nor served by slug; published & archived blogs are.
    pub fn is_publicly_visible(&self) -> bool {
        matches!(self, BlogStatus::Published | BlogStatus::Archived)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       the Blog aggregate                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Per-blog engagement counters.
///
/// These live in a dedicated counter table in storage & are merged into [Blog] on read. They are
/// only ever mutated through the storage backend's atomic increment/decrement; `popularity` is
/// *derived* from them & never trustworthy as a source.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct EngagementCounts {
    pub views: u64,
    pub likes: u64,
    pub dislikes: u64,
    pub comments: u64,
}

/// The blog aggregate
///
/// This is the merged view the rest of the crate (and the cache tier) works with: the blog row
/// proper plus its [EngagementCounts].
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Blog {
    pub id: BlogId,
    pub slug: Slug,
    pub author_id: UserId,
    pub title: String,
    pub content: String,
    pub status: BlogStatus,
    pub tags: HashSet<String>,
    pub featured_image_id: Option<MediaId>,
    pub counts: EngagementCounts,
    pub popularity: f64,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Reaction                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A user's like or dislike of a target
///
/// The invariant the whole toggle state machine leans on: at most one *active* (non-deleted)
/// reaction per (user, target). First reaction inserts a row; flipping like ↔ dislike mutates
/// `kind` in place on the same row; removing a reaction soft-deletes it.
#[derive(Clone, Debug, Deserialize, DeserializeRow, Eq, PartialEq, Serialize)]
pub struct Reaction {
    pub id: ReactionId,
    pub user_id: UserId,
    pub target_id: BlogId,
    pub target_kind: TargetKind,
    pub kind: ReactionKind,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           ViewRecord                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One recorded view of a blog: append-only; never updated or deleted.
///
/// Doubles as the durable fallback for the fraud heuristics when the cache tier is down, and as an
/// audit trail. `viewer_id` is [None] for anonymous viewers, `ip` is [None] when the edge couldn't
/// attribute an address -- explicit Options, not sentinel empty strings. At least one of the two
/// is always present (the tracker refuses the view otherwise).
#[derive(Clone, Debug, Deserialize, DeserializeRow, Serialize)]
pub struct ViewRecord {
    pub id: ViewId,
    pub blog_id: BlogId,
    pub viewer_id: Option<UserId>,
    pub ip: Option<IpAddr>,
    pub user_agent: String,
    pub viewed_at: DateTime<Utc>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn slug_validation() {
        assert!(Slug::new("hello-world").is_ok());
        assert!(Slug::new("a").is_ok());
        assert!(Slug::new("").is_err());
        assert!(Slug::new("Hello").is_err());
        assert!(Slug::new("two--hyphens").is_err());
        assert!(Slug::new("-leading").is_err());
    }

    #[test]
    fn slug_minting() {
        let slug = Slug::mint("Hello, World!");
        assert!(slug.starts_with("hello-world-"));
        assert!(check_slug(&slug));
        // Distinct mints from the same title must differ
        assert_ne!(Slug::mint("Hello, World!"), Slug::mint("Hello, World!"));
        // A title with no usable characters still yields a valid slug
        assert!(check_slug(&Slug::mint("!!!")));
        // A preposterously long title gets truncated, not rejected
        assert!(Slug::mint(&"word ".repeat(100)).len() <= MAX_SLUG_LENGTH);
    }

    #[test]
    fn status_round_trips() {
        for status in [
            BlogStatus::Draft,
            BlogStatus::Published,
            BlogStatus::Archived,
        ] {
            assert_eq!(status, status.as_str().parse::<BlogStatus>().unwrap());
        }
        assert!("deleted".parse::<BlogStatus>().is_err());
        assert!(!BlogStatus::Draft.is_publicly_visible());
        assert!(BlogStatus::Archived.is_publicly_visible());
    }
}
