//! Static asset handler for the bundled single-page front-end.
//!
//! Hashed assets get a long-lived immutable cache; the index document is
//! never cached so clients pick up new asset hashes. Unknown extensionless
//! paths fall back to the index (client-side routing).

use std::path::{Component, Path, PathBuf};

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::daemon::AppState;

static RE_HASHED_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.[0-9a-fA-F]{8,}\.").unwrap());

/// Fallback handler serving GET/HEAD under the configured asset root.
pub async fn serve_asset(State(state): State<AppState>, method: Method, uri: Uri) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let Some(root) = state.config.asset_root.clone() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let request_path = uri.path().trim_start_matches('/');
    let Some(relative) = sanitize(request_path) else {
        return StatusCode::FORBIDDEN.into_response();
    };

    let mut target = if relative.as_os_str().is_empty() {
        root.join("index.html")
    } else {
        root.join(&relative)
    };

    if !target.is_file() {
        // SPA fallback: extensionless routes resolve to the index document.
        if relative.extension().is_none() {
            target = root.join("index.html");
            if !target.is_file() {
                return StatusCode::NOT_FOUND.into_response();
            }
        } else {
            return StatusCode::NOT_FOUND.into_response();
        }
    }

    let bytes = match tokio::fs::read(&target).await {
        Ok(b) => b,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };

    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let cache = if name == "index.html" {
        "no-cache"
    } else if RE_HASHED_NAME.is_match(&name) {
        "public, max-age=31536000, immutable"
    } else {
        "public, max-age=3600"
    };

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type(&target))
        .header(header::CACHE_CONTROL, cache)
        .header(header::CONTENT_LENGTH, bytes.len());

    if method == Method::HEAD {
        builder = builder.status(StatusCode::OK);
        return builder.body(Body::empty()).unwrap_or_else(|_| {
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        });
    }

    builder
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Reject traversal: only plain path components survive.
fn sanitize(raw: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(out)
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("js") => "text/javascript",
        Some("css") => "text/css",
        Some("json") | Some("map") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        Some("woff2") => "font/woff2",
        Some("wasm") => "application/wasm",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}
