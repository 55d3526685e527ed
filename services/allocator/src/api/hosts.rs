//! Host endpoints.
//!
//! Provisioning collaborators report host progress here. These are internal
//! APIs, not part of the client command surface.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use rackalloc_id::HostId;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::error::AllocatorError;
use crate::hosts::HostState;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/hosts/{host_id}/events", post(report_event))
        .route("/v1/hosts/{host_id}/serial-log", get(serial_log))
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// A provisioning callback.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case", deny_unknown_fields)]
pub enum HostEvent {
    /// The host booted into the provisioning agent and is ready for work.
    CheckedIn,
    /// The provisioning agent accepted the image label.
    LabelProvided,
    /// The host finished booting its image.
    InaugurationDone,
    ProvisioningFailed {
        #[serde(default)]
        reason: Option<String>,
    },
    /// The host is out of service.
    Destroyed,
}

impl HostEvent {
    fn name(&self) -> &'static str {
        match self {
            HostEvent::CheckedIn => "checked_in",
            HostEvent::LabelProvided => "label_provided",
            HostEvent::InaugurationDone => "inauguration_done",
            HostEvent::ProvisioningFailed { .. } => "provisioning_failed",
            HostEvent::Destroyed => "destroyed",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HostEventResponse {
    pub host: HostId,
    pub state: HostState,
}

#[derive(Debug, Serialize)]
pub struct SerialLogResponse {
    pub host: HostId,
    pub location: String,
    pub log: String,
}

// =============================================================================
// Handlers
// =============================================================================

fn parse_host_id(raw: &str, request_id: &str) -> Result<HostId, ApiError> {
    HostId::parse(raw).map_err(|e| {
        ApiError::bad_request(format!("invalid host id {raw:?}: {e}")).with_request_id(request_id)
    })
}

async fn report_event(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(host_id): Path<String>,
    Json(event): Json<HostEvent>,
) -> Result<impl IntoResponse, ApiError> {
    let host_id = parse_host_id(&host_id, &ctx.request_id)?;
    let event_name = event.name();

    let result = state
        .with_engine(|engine, now| {
            let host = engine.host_index(&host_id)?;
            match event {
                HostEvent::CheckedIn => engine.checked_in(host, now),
                HostEvent::LabelProvided => engine.label_provided(host, now),
                HostEvent::InaugurationDone => engine.inauguration_done(host, now),
                HostEvent::ProvisioningFailed { reason } => engine.provisioning_failed(
                    host,
                    reason.as_deref().unwrap_or("provisioning failed"),
                    now,
                ),
                HostEvent::Destroyed => engine.destroy(host, now),
            }?;
            engine
                .hosts()
                .get(host)
                .map(|machine| machine.state())
        })
        .await;

    match result {
        Ok(host_state) => {
            info!(
                request_id = %ctx.request_id,
                host = %host_id,
                event = event_name,
                state = %host_state,
                "host event applied"
            );
            Ok(Json(HostEventResponse {
                host: host_id,
                state: host_state,
            }))
        }
        Err(e) => Err(ApiError::from(e).with_request_id(ctx.request_id)),
    }
}

async fn serial_log(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(host_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let host_id = parse_host_id(&host_id, &ctx.request_id)?;

    state
        .with_engine(|engine, _| engine.host_index(&host_id))
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;

    let artifacts = &state.collaborators().artifacts;
    let log = artifacts
        .serial_log(&host_id)
        .await
        .map_err(|e| {
            ApiError::from(AllocatorError::Collaborator(format!(
                "reading serial log of {host_id}: {e:#}"
            )))
            .with_request_id(ctx.request_id.clone())
        })?
        .ok_or_else(|| {
            ApiError::from(AllocatorError::not_found(format!(
                "no serial log captured for {host_id}"
            )))
            .with_request_id(ctx.request_id.clone())
        })?;

    Ok((
        StatusCode::OK,
        Json(SerialLogResponse {
            location: artifacts.serial_log_location(&host_id),
            host: host_id,
            log,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let event: HostEvent = serde_json::from_str(r#"{"event": "checked_in"}"#).unwrap();
        assert!(matches!(event, HostEvent::CheckedIn));

        let event: HostEvent =
            serde_json::from_str(r#"{"event": "provisioning_failed", "reason": "disk"}"#)
                .unwrap();
        assert!(
            matches!(event, HostEvent::ProvisioningFailed { reason: Some(ref r) } if r == "disk")
        );

        let event: HostEvent =
            serde_json::from_str(r#"{"event": "provisioning_failed"}"#).unwrap();
        assert!(matches!(event, HostEvent::ProvisioningFailed { reason: None }));

        assert!(serde_json::from_str::<HostEvent>(r#"{"event": "exploded"}"#).is_err());
    }
}
