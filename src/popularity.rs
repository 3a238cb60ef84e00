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

//! # popularity
//!
//! The popularity score: a single float derived from a blog's engagement counters, used as the
//! sort key for the "popular" listing. Pure function; no I/O, no clock. It must be recomputed
//! whenever any counter changes & is never authoritative (anyone can rebuild it from the counts).

use crate::entities::EngagementCounts;

// The weights are tuning parameters, not contract; the contract is monotonicity (see the tests).
// Views go through log1p so that a burst of traffic can't drown out reader sentiment.
const VIEW_WEIGHT: f64 = 1.5;
const LIKE_WEIGHT: f64 = 2.0;
const DISLIKE_WEIGHT: f64 = 1.0;
const COMMENT_WEIGHT: f64 = 1.5;

/// Score a blog's engagement.
///
/// Non-decreasing in views, likes & comments; non-increasing in dislikes; finite for any input
/// (all-zero counts score 0.0).
pub fn score(counts: &EngagementCounts) -> f64 {
    VIEW_WEIGHT * (1.0 + counts.views as f64).ln() + LIKE_WEIGHT * counts.likes as f64
        - DISLIKE_WEIGHT * counts.dislikes as f64
        + COMMENT_WEIGHT * counts.comments as f64
}

#[cfg(test)]
mod test {
    use super::*;

    fn counts(views: u64, likes: u64, dislikes: u64, comments: u64) -> EngagementCounts {
        EngagementCounts {
            views,
            likes,
            dislikes,
            comments,
        }
    }

    #[test]
    fn zero_is_zero() {
        let s = score(&EngagementCounts::default());
        assert!(s.is_finite());
        assert_eq!(s, 0.0);
    }

    #[test]
    fn sentiment_orders_equal_traffic() {
        // Same views & comments; better like/dislike ratio must score strictly higher.
        assert!(score(&counts(10, 3, 1, 2)) > score(&counts(10, 1, 3, 2)));
    }

    #[test]
    fn monotone_in_each_counter() {
        let base = counts(100, 10, 4, 7);
        assert!(score(&counts(101, 10, 4, 7)) >= score(&base));
        assert!(score(&counts(100, 11, 4, 7)) >= score(&base));
        assert!(score(&counts(100, 10, 5, 7)) <= score(&base));
        assert!(score(&counts(100, 10, 4, 8)) >= score(&base));
    }

    #[test]
    fn finite_at_scale() {
        assert!(score(&counts(u64::MAX, u64::MAX, 0, u64::MAX)).is_finite());
    }
}
