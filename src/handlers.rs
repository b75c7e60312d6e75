//! HTTP surface of the execution stack.
//!
//! Three endpoints wire the stack to the outside world: submit a snippet,
//! poll a request, and answer a kernel's input prompt. The handlers
//! validate ids, parse JSON, and delegate; they hold no state themselves.
//! Authentication is the host server's middleware concern.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use crate::models::{ExecutionPoll, RequestMetadata};
use crate::stack::ExecutionStack;
use crate::Error;

/// Build the API router over an execution stack.
pub fn router(stack: Arc<ExecutionStack>) -> Router {
    Router::new()
        .route("/api/kernels/{kernel_id}/execute", post(execute))
        .route(
            "/api/kernels/{kernel_id}/requests/{request_id}",
            get(poll_request),
        )
        .route("/api/kernels/{kernel_id}/input", post(send_input))
        .with_state(stack)
}

#[derive(Deserialize)]
struct ExecuteBody {
    code: Option<String>,
    #[serde(default)]
    metadata: RequestMetadata,
}

#[derive(Deserialize)]
struct InputBody {
    input: String,
}

/// Whether `id` matches the UUID shape of kernel and request identifiers:
/// five hex groups separated by hyphens.
fn is_uuid_shaped(id: &str) -> bool {
    let groups: Vec<&str> = id.split('-').collect();
    groups.len() == 5
        && groups
            .iter()
            .all(|group| !group.is_empty() && group.chars().all(|c| c.is_ascii_hexdigit()))
}

fn reason(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "reason": message.into() }))).into_response()
}

/// Execute a code snippet within the kernel.
async fn execute(
    State(stack): State<Arc<ExecutionStack>>,
    Path(kernel_id): Path<String>,
    Json(body): Json<ExecuteBody>,
) -> Response {
    if !is_uuid_shaped(&kernel_id) || !stack.has_kernel(&kernel_id) {
        let message = format!("Unknown kernel with id: {kernel_id}");
        error!("{message}");
        return reason(StatusCode::NOT_FOUND, message);
    }
    let Some(code) = body.code else {
        let message = if body.metadata.document_id.is_some() && body.metadata.cell_id.is_some() {
            "Executing a cell by document reference is not supported; provide `code`."
        } else {
            "Either `code` or both `document_id` and `cell_id` must be provided."
        };
        return reason(StatusCode::BAD_REQUEST, message);
    };

    match stack.put(&kernel_id, &code, body.metadata).await {
        Ok(request_id) => (
            StatusCode::ACCEPTED,
            [(
                header::LOCATION,
                format!("/api/kernels/{kernel_id}/requests/{request_id}"),
            )],
        )
            .into_response(),
        Err(err) => {
            error!(%kernel_id, error = %err, "failed to schedule execution request");
            reason(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

/// Poll an execution request for its result, pending input, or progress.
async fn poll_request(
    State(stack): State<Arc<ExecutionStack>>,
    Path((kernel_id, request_id)): Path<(String, String)>,
) -> Response {
    if !is_uuid_shaped(&kernel_id) || !is_uuid_shaped(&request_id) {
        return reason(
            StatusCode::NOT_FOUND,
            format!("Execution request {request_id} for kernel {kernel_id} does not exist"),
        );
    }
    match stack.get(&kernel_id, &request_id) {
        Ok(ExecutionPoll::Pending) => (StatusCode::ACCEPTED, Json(Value::Null)).into_response(),
        Ok(ExecutionPoll::InputRequired(description)) => (
            StatusCode::MULTIPLE_CHOICES,
            [(header::LOCATION, format!("/api/kernels/{kernel_id}/input"))],
            Json(description),
        )
            .into_response(),
        Ok(ExecutionPoll::Done(outcome)) => (StatusCode::OK, Json(outcome)).into_response(),
        Ok(ExecutionPoll::Failed { error }) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": error })),
        )
            .into_response(),
        Err(err @ Error::UnknownRequest { .. }) => reason(StatusCode::NOT_FOUND, err.to_string()),
        Err(err) => {
            error!(%kernel_id, %request_id, error = %err, "failed to poll execution request");
            reason(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

/// Answer the pending input prompt of a kernel.
async fn send_input(
    State(stack): State<Arc<ExecutionStack>>,
    Path(kernel_id): Path<String>,
    Json(body): Json<InputBody>,
) -> Response {
    if !is_uuid_shaped(&kernel_id) {
        return reason(
            StatusCode::NOT_FOUND,
            format!("Unknown kernel with id: {kernel_id}"),
        );
    }
    match stack.send_input(&kernel_id, &body.input).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(err @ Error::UnknownKernel(_)) => reason(StatusCode::NOT_FOUND, err.to_string()),
        Err(err) => {
            error!(%kernel_id, error = %err, "failed to send input to kernel");
            reason(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}
