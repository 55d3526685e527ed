//! Allocation artifact endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use rackalloc_id::AllocationIndex;
use serde::Serialize;
use tracing::info;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::error::AllocatorError;
use crate::state::AppState;
use crate::status::PostMortem;

pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/allocations/{index}/post-mortem", post(create_post_mortem))
}

#[derive(Debug, Serialize)]
pub struct PostMortemResponse {
    pub location: String,
    pub pack: PostMortem,
}

/// Captures a post-mortem pack of an allocation and stores it.
///
/// The pack is captured under the engine lock; writing it is not.
async fn create_post_mortem(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(index): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let index: AllocationIndex = index.parse().map_err(|_| {
        ApiError::bad_request(format!("invalid allocation index {index:?}"))
            .with_request_id(ctx.request_id.clone())
    })?;

    let artifacts = state.collaborators().artifacts.clone();
    let pack = state
        .with_engine(|engine, _| {
            PostMortem::capture(engine, index, |host| artifacts.serial_log_location(host))
        })
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;

    let location = artifacts.store_post_mortem(&pack).await.map_err(|e| {
        ApiError::from(AllocatorError::Collaborator(format!(
            "storing post-mortem of allocation {index}: {e:#}"
        )))
        .with_request_id(ctx.request_id.clone())
    })?;

    info!(
        request_id = %ctx.request_id,
        allocation = %index,
        location = %location,
        "post-mortem pack stored"
    );

    Ok((StatusCode::CREATED, Json(PostMortemResponse { location, pack })))
}
