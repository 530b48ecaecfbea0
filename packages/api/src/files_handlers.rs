// ABOUTME: HTTP handlers for reading files back out of a project's sandbox
// ABOUTME: Paged base64 listings with optional gzip, full text downloads and manifest diffs

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use dappbox_sandbox::{Manifest, SandboxServices, SyncPage};
use flate2::{write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{ApiError, ApiResult};
use crate::extract::{ApiJson, ApiPath, ApiQuery};
use crate::sandbox_handlers::files_body;

#[derive(Debug, Deserialize)]
pub struct FilesQuery {
    pub path: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct FileEntryResponse {
    pub path: String,
    pub encoding: &'static str,
    pub size: u64,
    pub content: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesPageResponse {
    pub entries: Vec<FileEntryResponse>,
    pub cursor: Option<String>,
    pub has_more: bool,
    pub total: usize,
    pub returned: usize,
}

impl From<SyncPage> for FilesPageResponse {
    fn from(page: SyncPage) -> Self {
        let entries: Vec<FileEntryResponse> = page
            .entries
            .into_iter()
            .map(|entry| FileEntryResponse {
                path: entry.path,
                encoding: entry.encoding,
                size: entry.size_bytes,
                content: entry.content,
            })
            .collect();
        Self {
            returned: entries.len(),
            entries,
            cursor: page.cursor,
            has_more: page.has_more,
            total: page.total,
        }
    }
}

fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            value
                .split(',')
                .any(|coding| coding.split(';').next().map(str::trim) == Some("gzip"))
        })
        .unwrap_or(false)
}

fn gzip(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    encoder.finish()
}

/// JSON response, gzip-compressed when the client accepts it and the body is large
fn json_response(headers: &HeaderMap, body: Vec<u8>, threshold: usize) -> Response {
    let json_type = [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))];
    let vary = (header::VARY, HeaderValue::from_static("accept-encoding"));

    if body.len() > threshold && accepts_gzip(headers) {
        match gzip(&body) {
            Ok(compressed) => {
                debug!("Compressed file page {} -> {} bytes", body.len(), compressed.len());
                return (
                    json_type,
                    [
                        (header::CONTENT_ENCODING, HeaderValue::from_static("gzip")),
                        vary,
                    ],
                    compressed,
                )
                    .into_response();
            }
            Err(e) => warn!("Gzip failed, sending uncompressed: {}", e),
        }
    }

    (json_type, [vary], body).into_response()
}

/// One page of the sandbox's file tree, base64 encoded
pub async fn list_files(
    State(services): State<Arc<SandboxServices>>,
    ApiPath(project_id): ApiPath<String>,
    ApiQuery(query): ApiQuery<FilesQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let page = services
        .sync
        .download_paged(
            &project_id,
            query.path.as_deref(),
            query.cursor.as_deref(),
            query.limit,
        )
        .await?;

    let body = serde_json::to_vec(&FilesPageResponse::from(page))
        .map_err(|e| ApiError::Internal(format!("Failed to encode file page: {}", e)))?;
    let threshold = services.registry.settings().gzip_threshold_bytes;
    Ok(json_response(&headers, body, threshold))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DownloadRequest {
    pub path: Option<String>,
}

/// Every text file under `path`, keyed by client path
pub async fn download_files(
    State(services): State<Arc<SandboxServices>>,
    ApiPath(project_id): ApiPath<String>,
    ApiJson(request): ApiJson<DownloadRequest>,
) -> ApiResult<Json<Value>> {
    let files = services
        .sync
        .download(&project_id, request.path.as_deref())
        .await?;
    Ok(Json(files_body(files)))
}

#[derive(Debug, Deserialize)]
pub struct ChangesRequest {
    pub path: Option<String>,
    #[serde(default)]
    pub previous: Manifest,
}

/// Paths added, changed or deleted since the caller's manifest
pub async fn file_changes(
    State(services): State<Arc<SandboxServices>>,
    ApiPath(project_id): ApiPath<String>,
    ApiJson(request): ApiJson<ChangesRequest>,
) -> ApiResult<Json<Value>> {
    let changes = services
        .sync
        .changes(&project_id, request.path.as_deref(), &request.previous)
        .await?;

    serde_json::to_value(&changes)
        .map(Json)
        .map_err(|e| ApiError::Internal(format!("Failed to encode changes: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_gzip() {
        let mut headers = HeaderMap::new();
        assert!(!accepts_gzip(&headers));

        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("br, gzip;q=0.8"));
        assert!(accepts_gzip(&headers));

        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzipx, br"));
        assert!(!accepts_gzip(&headers));
    }

    #[test]
    fn test_small_bodies_are_not_compressed() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));

        let response = json_response(&headers, b"{}".to_vec(), 1024);
        assert!(response.headers().get(header::CONTENT_ENCODING).is_none());

        let response = json_response(&headers, vec![b' '; 2048], 1024);
        assert_eq!(
            response.headers().get(header::CONTENT_ENCODING).unwrap(),
            "gzip"
        );
        assert_eq!(response.headers().get(header::VARY).unwrap(), "accept-encoding");
    }
}
