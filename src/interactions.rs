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

//! # Interaction API
//!
//! The engagement surface: `POST /blogs/{id}/view`, `/like` & `/dislike`.
//!
//! The wire contract worth calling out: a deduped or bot-filtered view is a *success* (the caller
//! did nothing wrong; we just didn't move a counter), while a rate-limited view is a 429 -- the
//! one outcome a client should treat differently from "ok". Reaction toggles report the state
//! the (user, target) pair landed in, so clients can paint the button without a second request.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{ConnectInfo, Path, State},
    http::{
        header::{CONTENT_TYPE, USER_AGENT},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer};
use tracing::{error, info};

use crate::{
    counter_add,
    entities::BlogId,
    http::{forwarded_for, user_from_headers, ErrorResponseBody},
    metrics::{self, Sort},
    reactions::{self, ReactionState},
    vellum::Vellum,
    views::{self, RateLimitKind, ViewOutcome},
};

/// Interaction API module error type
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{text} is not a valid blog id"))]
    BadBlogId { text: String, source: uuid::Error },
    #[snafu(display("This request requires an authenticated caller"))]
    Unauthenticated,
    #[snafu(display("View tracking failed: {source}"))]
    View { source: views::Error },
    #[snafu(display("Reaction toggle failed: {source}"))]
    Reaction { source: reactions::Error },
}

impl Error {
    pub fn as_status_and_msg(&self) -> (StatusCode, String) {
        match self {
            Error::BadBlogId { text, .. } => (
                StatusCode::BAD_REQUEST,
                format!("{} is not a valid blog id", text),
            ),
            Error::Unauthenticated => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            // A view without any identity at all is the caller's problem; everything else down
            // the view pipeline is ours.
            Error::View { source } => match source {
                views::Error::MissingIdentity { .. } => (
                    StatusCode::BAD_REQUEST,
                    "A view must carry a viewer id or an IP address".to_string(),
                ),
                err => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("View tracking failed: {err}"),
                ),
            },
            Error::Reaction { source } => match source {
                reactions::Error::UnknownTarget { .. } => {
                    (StatusCode::NOT_FOUND, "Blog not found".to_string())
                }
                err => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Reaction toggle failed: {err}"),
                ),
            },
        }
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let (code, msg) = self.as_status_and_msg();
        (code, Json(ErrorResponseBody { error: msg })).into_response()
    }
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    `POST /blogs/{id}/view`                                     //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("views.counted", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("views.duplicates", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("views.ignored", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("views.rate-limited", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("views.failures", Sort::IntegralCounter) }

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ViewRsp {
    pub outcome: &'static str,
}

#[derive(Clone, Debug, Serialize)]
pub struct RateLimitedRsp {
    pub error: String,
    pub limit: RateLimitKind,
}

/// Record a view of a blog.
///
/// Anonymous viewers are welcome; the viewer id (if the gateway supplied one) and the client IP
/// (X-Forwarded-For, falling back to the socket address) identify the view for dedup & fraud
/// purposes. Deduped & bot-filtered views are 200s; tripping a fraud window is a 429.
async fn view(
    State(state): State<Arc<Vellum>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> axum::response::Response {
    async fn view1(
        state: &Vellum,
        addr: &SocketAddr,
        headers: &HeaderMap,
        key: &str,
    ) -> Result<ViewOutcome> {
        let id = BlogId::from_raw_string(key).context(BadBlogIdSnafu { text: key })?;
        let viewer = user_from_headers(headers);
        let ip = forwarded_for(headers).or(Some(addr.ip()));
        let user_agent = headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        state
            .views
            .record_view(&id, viewer.as_ref(), ip, user_agent)
            .await
            .context(ViewSnafu)
    }

    match view1(&state, &addr, &headers, &key).await {
        Ok(ViewOutcome::Counted) => {
            counter_add!(state.instruments, "views.counted", 1, &[]);
            (StatusCode::OK, Json(ViewRsp { outcome: "counted" })).into_response()
        }
        Ok(ViewOutcome::AlreadyCounted) => {
            counter_add!(state.instruments, "views.duplicates", 1, &[]);
            (StatusCode::OK, Json(ViewRsp { outcome: "duplicate" })).into_response()
        }
        Ok(ViewOutcome::Ignored) => {
            counter_add!(state.instruments, "views.ignored", 1, &[]);
            (StatusCode::OK, Json(ViewRsp { outcome: "ignored" })).into_response()
        }
        Ok(ViewOutcome::RateLimited(kind)) => {
            info!("rate-limited a view of blog {}: {}", key, kind);
            counter_add!(
                state.instruments,
                "views.rate-limited",
                1,
                &[KeyValue::new("limit", kind.to_string())]
            );
            (
                StatusCode::TOO_MANY_REQUESTS,
                Json(RateLimitedRsp {
                    error: format!("{} limit exceeded; try again later", kind),
                    limit: kind,
                }),
            )
                .into_response()
        }
        Err(err) => {
            error!("{:#?}", err);
            counter_add!(state.instruments, "views.failures", 1, &[]);
            err.into_response()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                             `POST /blogs/{id}/like` & `/dislike`                               //
////////////////////////////////////////////////////////////////////////////////////////////////////

inventory::submit! { metrics::Registration::new("reactions.toggles.successful", Sort::IntegralCounter) }
inventory::submit! { metrics::Registration::new("reactions.toggles.failures", Sort::IntegralCounter) }

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ReactionRsp {
    pub state: ReactionState,
}

#[derive(Clone, Copy, Debug)]
enum ToggleOp {
    Like,
    Dislike,
}

impl ToggleOp {
    fn as_str(&self) -> &'static str {
        match self {
            ToggleOp::Like => "like",
            ToggleOp::Dislike => "dislike",
        }
    }
}

async fn toggle1(
    state: &Vellum,
    headers: &HeaderMap,
    key: &str,
    op: ToggleOp,
) -> Result<ReactionState> {
    let id = BlogId::from_raw_string(key).context(BadBlogIdSnafu { text: key })?;
    let user = user_from_headers(headers).ok_or(Error::Unauthenticated)?;
    match op {
        ToggleOp::Like => state.reactions.toggle_like(&user, &id).await,
        ToggleOp::Dislike => state.reactions.toggle_dislike(&user, &id).await,
    }
    .context(ReactionSnafu)
}

async fn toggle(
    state: Arc<Vellum>,
    headers: HeaderMap,
    key: String,
    op: ToggleOp,
) -> axum::response::Response {
    match toggle1(&state, &headers, &key, op).await {
        Ok(new_state) => {
            info!("{} toggle on blog {} landed on {:?}", op.as_str(), key, new_state);
            counter_add!(
                state.instruments,
                "reactions.toggles.successful",
                1,
                &[KeyValue::new("op", op.as_str())]
            );
            (StatusCode::OK, Json(ReactionRsp { state: new_state })).into_response()
        }
        Err(err @ (Error::Unauthenticated | Error::BadBlogId { .. })) => {
            counter_add!(
                state.instruments,
                "reactions.toggles.failures",
                1,
                &[KeyValue::new("op", op.as_str())]
            );
            err.into_response()
        }
        Err(err) => {
            error!("{:#?}", err);
            counter_add!(
                state.instruments,
                "reactions.toggles.failures",
                1,
                &[KeyValue::new("op", op.as_str())]
            );
            err.into_response()
        }
    }
}

/// Toggle the caller's like of a blog.
async fn like(
    State(state): State<Arc<Vellum>>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> axum::response::Response {
    toggle(state, headers, key, ToggleOp::Like).await
}

/// Toggle the caller's dislike of a blog.
async fn dislike(
    State(state): State<Arc<Vellum>>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> axum::response::Response {
    toggle(state, headers, key, ToggleOp::Dislike).await
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Public API                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Return a router for the Interaction API
///
/// The returned [Router] will presumably be merged with other routers.
pub fn make_router(state: Arc<Vellum>) -> Router<Arc<Vellum>> {
    Router::new()
        .route("/blogs/{key}/view", post(view))
        .route("/blogs/{key}/like", post(like))
        .route("/blogs/{key}/dislike", post(dislike))
        .layer(SetResponseHeaderLayer::if_not_present(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
