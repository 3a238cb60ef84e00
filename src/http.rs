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

//! # http
//!
//! Odds & ends shared by vellum's HTTP-facing modules.
//!
//! Authentication is not vellum's problem: requests arrive through a gateway that has already
//! authenticated the caller & stamped the request with the caller's identity. The helpers here
//! read those headers; an absent header just means an anonymous caller.

use std::net::IpAddr;

use axum::{http::HeaderMap, Json};
use serde::{Deserialize, Serialize};

use crate::entities::UserId;

/// Header carrying the authenticated user's id, stamped by the gateway.
pub const USER_HEADER: &str = "x-vellum-user";

/// Header carrying the gateway's admin determination (`true`/`false`).
pub const ADMIN_HEADER: &str = "x-vellum-admin";

/// The client address as seen at the edge.
pub const FORWARDED_FOR: &str = "x-forwarded-for";

/// A serializable struct for use in HTTP error responses
///
/// This may be a violation of the YAGNI! principle, but I'd like to return a JSON body for
/// errors. I can't see a way to enforce the rule that all axum handlers do this, but I can at
/// least set up a standard representation of an error response.
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponseBody {
    pub error: String,
}

impl axum::response::IntoResponse for ErrorResponseBody {
    fn into_response(self) -> axum::response::Response {
        Json(self).into_response()
    }
}

/// The authenticated caller, if the gateway identified one.
pub fn user_from_headers(headers: &HeaderMap) -> Option<UserId> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| UserId::from_raw_string(s).ok())
}

/// Did the gateway flag the caller as an administrator?
pub fn is_admin(headers: &HeaderMap) -> bool {
    headers
        .get(ADMIN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// The client IP as reported by the edge; the first entry of X-Forwarded-For.
///
/// The fallback to the socket address happens at the handler (it has the [ConnectInfo]
/// extension; we don't).
///
/// [ConnectInfo]: axum::extract::ConnectInfo
pub fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get(FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
}

#[cfg(test)]
mod test {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn forwarded_for_takes_the_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            FORWARDED_FOR,
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(Some("203.0.113.7".parse().unwrap()), forwarded_for(&headers));
    }

    #[test]
    fn garbage_identity_reads_as_anonymous() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_HEADER, HeaderValue::from_static("not-a-uuid"));
        assert!(user_from_headers(&headers).is_none());
        assert!(!is_admin(&headers));
    }
}
