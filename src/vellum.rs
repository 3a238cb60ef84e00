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

use std::sync::Arc;

use crate::{
    blog_cache::BlogCache, metrics::Instruments, reactions::ReactionToggle,
    storage::Backend as StorageBackend, views::ViewTracker,
};

/// Application state available to all handlers
pub struct Vellum {
    pub storage: Arc<dyn StorageBackend + Send + Sync>,
    pub blog_cache: BlogCache,
    pub views: ViewTracker,
    pub reactions: ReactionToggle,
    pub registry: prometheus::Registry,
    pub instruments: Arc<Instruments>,
}
