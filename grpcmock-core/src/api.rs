//! Configuration HTTP surface: proto uploads, mock registration, and call
//! history, backed by the shared registries.

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::history::History;
use crate::mocks::MockConfig;
use crate::server::AppState;

/// Proto uploads can carry whole descriptor trees.
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct BulkUploadRequest {
    files: Vec<ProtoUpload>,
}

#[derive(Debug, Deserialize)]
struct ProtoUpload {
    filename: String,
    content: String,
}

pub fn config_router(state: AppState) -> Router {
    Router::new()
        .route("/protos/register/json", post(register_protos_json))
        .route("/protos/register/file", post(register_protos_file))
        .route("/protos/ingest/json", post(ingest_protos_json))
        .route("/protos/ingest/file", post(ingest_protos_file))
        .route("/protos/ingest/compile", post(compile_ingested))
        .route("/mocks", post(register_mock))
        .route("/history", get(list_history))
        .route("/history/clear", post(clear_history))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Ingest and compile multiple `.proto` files from one JSON payload.
async fn register_protos_json(
    State(state): State<AppState>,
    Json(request): Json<BulkUploadRequest>,
) -> (StatusCode, Json<Value>) {
    if let Err(resp) = ingest_bulk(&state, &request) {
        return resp;
    }
    match state.descriptors.compile_and_register() {
        Ok(()) => (StatusCode::CREATED, Json(Value::Null)),
        Err(e) => error_response(
            StatusCode::BAD_REQUEST,
            format!("failed to compile files: {e}"),
        ),
    }
}

/// Ingest multiple `.proto` sources without compiling.
async fn ingest_protos_json(
    State(state): State<AppState>,
    Json(request): Json<BulkUploadRequest>,
) -> (StatusCode, Json<Value>) {
    if let Err(resp) = ingest_bulk(&state, &request) {
        return resp;
    }
    (StatusCode::CREATED, Json(Value::Null))
}

fn ingest_bulk(
    state: &AppState,
    request: &BulkUploadRequest,
) -> Result<(), (StatusCode, Json<Value>)> {
    if request.files.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "no proto files provided",
        ));
    }
    for file in &request.files {
        if file.filename.is_empty() || file.content.is_empty() {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "filename and content required for all files",
            ));
        }
    }
    for file in &request.files {
        state.descriptors.ingest(&file.filename, &file.content);
    }
    Ok(())
}

/// Ingest and compile `.proto` files from a multipart upload.
async fn register_protos_file(
    State(state): State<AppState>,
    multipart: Multipart,
) -> (StatusCode, Json<Value>) {
    if let Err(resp) = ingest_multipart(&state, multipart).await {
        return resp;
    }
    match state.descriptors.compile_and_register() {
        Ok(()) => (StatusCode::CREATED, Json(Value::Null)),
        Err(e) => error_response(
            StatusCode::BAD_REQUEST,
            format!("failed to compile files: {e}"),
        ),
    }
}

async fn ingest_protos_file(
    State(state): State<AppState>,
    multipart: Multipart,
) -> (StatusCode, Json<Value>) {
    if let Err(resp) = ingest_multipart(&state, multipart).await {
        return resp;
    }
    (StatusCode::ACCEPTED, Json(Value::Null))
}

/// Pull every part out of the form. The part's `filename` parameter is kept
/// verbatim (subdirectories included) so relative imports between uploaded
/// files keep resolving.
async fn ingest_multipart(
    state: &AppState,
    mut multipart: Multipart,
) -> Result<(), (StatusCode, Json<Value>)> {
    let mut uploaded = 0usize;
    loop {
        let field = multipart.next_field().await.map_err(|e| {
            error_response(
                StatusCode::BAD_REQUEST,
                format!("error parsing multipart form: {e}"),
            )
        })?;
        let Some(field) = field else { break };
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let content = field.text().await.map_err(|e| {
            error_response(StatusCode::BAD_REQUEST, format!("error reading file: {e}"))
        })?;
        state.descriptors.ingest(&filename, &content);
        uploaded += 1;
    }
    if uploaded == 0 {
        return Err(error_response(StatusCode::BAD_REQUEST, "no files uploaded"));
    }
    Ok(())
}

/// Compile and register all previously ingested sources.
async fn compile_ingested(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.descriptors.compile_and_register() {
        Ok(()) => (StatusCode::OK, Json(Value::Null)),
        Err(e) => error_response(
            StatusCode::BAD_REQUEST,
            format!("failed to compile files: {e}"),
        ),
    }
}

/// Register a mock configuration.
async fn register_mock(
    State(state): State<AppState>,
    Json(config): Json<MockConfig>,
) -> (StatusCode, Json<Value>) {
    if config.service.is_empty() || config.method.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "service and method are required");
    }
    // An explicit responseType must name a registered message; a silently
    // dropped override would change the reply shape without warning.
    if !config.response_type.is_empty()
        && state
            .descriptors
            .message_descriptor(&config.response_type)
            .is_none()
    {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!(
                "responseType {:?} is not a registered message",
                config.response_type
            ),
        );
    }
    tracing::info!(method = %config.method_path(), "mock registered");
    state.mocks.register(config);
    (StatusCode::CREATED, Json(Value::Null))
}

async fn list_history(State(state): State<AppState>) -> Json<Vec<History>> {
    Json(state.history.list())
}

async fn clear_history(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    state.history.clear();
    (StatusCode::OK, Json(json!({"message": "history cleared"})))
}

fn error_response(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (status, Json(json!({"error": message.into()})))
}
