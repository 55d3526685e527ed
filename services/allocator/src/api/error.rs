use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::AllocatorError;

/// The failure envelope every endpoint answers with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionBody {
    pub exception_type: String,
    pub exception_string: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: Box<ExceptionBody>,
}

impl ApiError {
    fn new(status: StatusCode, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            body: Box::new(ExceptionBody {
                exception_type: kind.into(),
                exception_string: message.into(),
                request_id: None,
            }),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "InvalidArguments", message)
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.body.request_id = Some(request_id.into());
        self
    }
}

impl From<AllocatorError> for ApiError {
    fn from(err: AllocatorError) -> Self {
        let status = match &err {
            AllocatorError::NotFound(_) => StatusCode::NOT_FOUND,
            AllocatorError::InsufficientCapacity(_) => StatusCode::CONFLICT,
            AllocatorError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            AllocatorError::InvalidTransition { .. } => StatusCode::CONFLICT,
            AllocatorError::ProtocolMismatch(_) => StatusCode::BAD_REQUEST,
            AllocatorError::ProvisioningFailure { .. } => StatusCode::CONFLICT,
            AllocatorError::InvalidArguments(_) => StatusCode::BAD_REQUEST,
            AllocatorError::Collaborator(_) => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, err.kind(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
