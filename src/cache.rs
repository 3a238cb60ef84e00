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

//! # cache
//!
//! Abstraction over vellum's volatile cache tier: a TTL-bounded key/value store plus TTL-bounded
//! sets (the sliding-window approximation used by the fraud heuristics).
//!
//! Every operation here is fallible and every caller is expected to *absorb* the failure: cache
//! content is rebuildable from durable state at any time, so an unavailable cache degrades
//! latency, never correctness. Nothing above the [blog_cache](crate::blog_cache) /
//! [window](crate::window) layers should ever see one of these errors.

use std::time::Duration;

use async_trait::async_trait;

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

#[async_trait]
pub trait Backend {
    /// Fetch the payload at `key`; None on a miss (a miss is not an error).
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Store `value` at `key`, expiring after `ttl`.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;
    /// Drop `key`; dropping an absent key is fine.
    async fn delete(&self, key: &str) -> Result<()>;
    /// Drop a batch of keys in one round-trip.
    async fn delete_many(&self, keys: &[String]) -> Result<()>;
    /// All keys matching `pattern` (glob-style, e.g. `blogs:list:*`).
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>>;
    /// Add `member` to the set at `key` & refresh the set's TTL to `ttl`.
    async fn add_to_set(&self, key: &str, member: &str, ttl: Duration) -> Result<()>;
    /// The cardinality of the set at `key`; 0 for an absent (or expired) set.
    async fn set_cardinality(&self, key: &str) -> Result<u64>;
}
