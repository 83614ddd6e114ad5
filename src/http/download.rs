//! Token-gated file download.
//!
//! GET /download?token=...&sessionId=...&path=... streams one file out of a
//! session's project root as an attachment.

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use crate::daemon::AppState;
use crate::files::ProjectFiles;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadParams {
    pub token: String,
    pub session_id: String,
    pub path: String,
}

/// Download one project file.
pub async fn download(
    State(state): State<AppState>,
    Query(params): Query<DownloadParams>,
) -> Response {
    match state.auth.verify(&params.token).await {
        Ok(true) => {}
        _ => return (StatusCode::UNAUTHORIZED, "invalid token").into_response(),
    }

    let Some(session) = state.registry.get(&params.session_id).await else {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    };
    let snapshot = session.snapshot().await;

    let files = match ProjectFiles::new(&snapshot.project_path) {
        Ok(f) => f,
        Err(_) => return (StatusCode::NOT_FOUND, "project root missing").into_response(),
    };
    let resolved = match files.resolve_download(&params.path) {
        Ok(p) => p,
        Err(e) => return (StatusCode::FORBIDDEN, e.to_string()).into_response(),
    };

    let file = match tokio::fs::File::open(&resolved).await {
        Ok(f) => f,
        Err(_) => return (StatusCode::NOT_FOUND, "unreadable file").into_response(),
    };
    let name = resolved
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", name.replace('"', "_")),
        )
        .body(Body::from_stream(ReaderStream::new(file)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
