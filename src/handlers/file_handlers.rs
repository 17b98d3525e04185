//! HTTP handlers for uploads, record lookups and public links.
//! Storage and expiry concerns are delegated to the services in `AppState`.

use crate::{
    clock::Clock,
    errors::AppError,
    models::file_record::FileRecord,
    services::{object_client::with_timeout, upload_service::IncomingFile},
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

const NOT_FOUND_MESSAGE: &str = "File not found or expired";
const UPLOAD_FIELD: &str = "file";

/// A record as returned to clients, with its derived expiry.
#[derive(Debug, Serialize)]
pub struct FileView {
    #[serde(flatten)]
    pub record: FileRecord,
    pub expires_at: DateTime<Utc>,
}

impl FileView {
    fn new(record: FileRecord, state: &AppState) -> Self {
        let expires_at = record.expires_at(state.retention);
        Self { record, expires_at }
    }
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub message: &'static str,
    pub file: FileView,
}

/// `POST /api/files/upload`: multipart form with a `file` field.
pub async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut incoming = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::new(err.status(), err.body_text()))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let original_name = field.file_name().unwrap_or("upload").to_string();
        let mime_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let body = field
            .bytes()
            .await
            .map_err(|err| AppError::new(err.status(), err.body_text()))?;

        incoming = Some(IncomingFile {
            original_name,
            mime_type,
            body,
        });
        break;
    }

    let Some(file) = incoming else {
        return Err(AppError::bad_request("No file uploaded"));
    };

    let record = state.uploads.upload(file).await?;
    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            message: "File uploaded successfully",
            file: FileView::new(record, &state),
        }),
    ))
}

/// `GET /api/files/{id}`: expired and unknown ids are both 404.
pub async fn get_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FileView>, AppError> {
    let id = Uuid::parse_str(&id).map_err(|_| AppError::not_found(NOT_FOUND_MESSAGE))?;
    let record = state
        .registrar
        .get_record(id)
        .await?
        .ok_or_else(|| AppError::not_found(NOT_FOUND_MESSAGE))?;
    Ok(Json(FileView::new(record, &state)))
}

/// `GET /objects/{*key}`: the public link. Served only while the record is
/// live, even if the object itself has not been swept yet.
pub async fn download_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    let record = state
        .registrar
        .find_by_key(&key)
        .await?
        .ok_or_else(|| AppError::not_found(NOT_FOUND_MESSAGE))?;
    let limit = state.reconciler.config().store_timeout;
    let object = with_timeout(limit, state.objects.get(&key)).await?;

    let mut response = Response::new(Body::from_stream(object.stream));
    *response.status_mut() = StatusCode::OK;
    let remaining = record
        .expires_at(state.retention)
        .signed_duration_since(state.clock.now())
        .num_seconds()
        .max(0);
    set_object_headers(response.headers_mut(), &record, object.size_bytes, remaining);

    Ok(response)
}

fn set_object_headers(headers: &mut HeaderMap, record: &FileRecord, length: u64, max_age: i64) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&record.mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));

    let filename: String = record
        .original_name
        .chars()
        .filter(|c| (c.is_ascii_graphic() && *c != '"' && *c != '\\') || *c == ' ')
        .collect();
    if let Ok(value) = HeaderValue::from_str(&format!("inline; filename=\"{filename}\"")) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    if let Ok(value) = HeaderValue::from_str(&format!("public, max-age={max_age}")) {
        headers.insert(header::CACHE_CONTROL, value);
    }

    let last_modified = record
        .created_at
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();
    if let Ok(value) = HeaderValue::from_str(&last_modified) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
