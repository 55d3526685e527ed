//! The command endpoint.
//!
//! `POST /v1/commands` takes a `{cmd, arguments}` envelope and answers with
//! the command's result document, or an exception envelope.

use axum::{
    body::Bytes, extract::State, response::IntoResponse, routing::post, Json, Router,
};
use tracing::{info, warn};

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::commands::{self, Command, CommandRequest};
use crate::error::AllocatorError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/commands", post(run_command))
}

async fn run_command(
    State(state): State<AppState>,
    ctx: RequestContext,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let request: CommandRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("malformed command: {e}")))
        .map_err(|e| e.with_request_id(ctx.request_id.clone()))?;

    let cmd = request.cmd.clone();
    let result = match Command::parse(request) {
        Ok(command) => commands::execute(&state, command).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(value) => {
            info!(request_id = %ctx.request_id, cmd = %cmd, "command handled");
            Ok(Json(value))
        }
        Err(e) => {
            log_failure(&ctx, &cmd, &e);
            Err(ApiError::from(e).with_request_id(ctx.request_id))
        }
    }
}

fn log_failure(ctx: &RequestContext, cmd: &str, err: &AllocatorError) {
    match err {
        AllocatorError::Collaborator(_) => {
            warn!(request_id = %ctx.request_id, cmd = %cmd, error = %err, "command failed")
        }
        _ => info!(
            request_id = %ctx.request_id,
            cmd = %cmd,
            exception = err.kind(),
            error = %err,
            "command rejected"
        ),
    }
}
