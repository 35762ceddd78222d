use crate::error::ApiError;
use crate::routes::AppState;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use bytes::Bytes;
use optiq_core::models::{Image, ImageListResponse, ImageResponse, ImageStatus, UploadResponse};
use optiq_core::object_store::object_key;
use optiq_core::processor;
use optiq_queue::{ResizeConfig, Task};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Upload size cap. Larger payloads are rejected before any downstream work.
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

const ALLOWED_EXTENSIONS: [&str; 3] = [".jpg", ".jpeg", ".png"];

/// How many leading bytes the MIME sniff examines.
const SNIFF_LEN: usize = 512;

#[derive(Debug, Default, Deserialize)]
pub struct UploadParams {
    max_width: Option<String>,
    max_height: Option<String>,
    quality: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    limit: Option<String>,
    page: Option<String>,
}

/// `POST /api/images` — validate, store the original, record metadata and
/// queue the optimization task.
#[instrument(skip(state, multipart))]
pub async fn upload_image(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let (filename, data) = read_image_field(&mut multipart).await?;

    if data.len() > MAX_UPLOAD_BYTES {
        warn!(filename = %filename, size = data.len(), "File too large");
        return Err(ApiError::bad_request("File too large, max 10MiB"));
    }

    if !has_allowed_extension(&filename) {
        warn!(filename = %filename, "Unsupported file extension");
        return Err(ApiError::bad_request(
            "Unsupported file format, only JPG and PNG are supported",
        ));
    }

    match sniff_mime(&data) {
        Some("image/jpeg") | Some("image/png") => {}
        _ => {
            warn!(filename = %filename, "Unsupported MIME type");
            return Err(ApiError::bad_request(
                "Unsupported MIME type, only image/jpeg and image/png are supported",
            ));
        }
    }

    let info = processor::validate(&data)
        .map_err(|e| ApiError::BadRequest(format!("Invalid image: {e}")))?;

    let id = Uuid::new_v4();
    let key = object_key(id, &filename);

    info!(image_id = %id, filename = %filename, "Accepted new image upload");

    state
        .store
        .put(&key, data.clone(), info.format.content_type())
        .await
        .map_err(|e| {
            error!(error = %e, key = %key, "Failed to upload image to storage");
            ApiError::Internal("Failed to upload image to storage".to_string())
        })?;

    let image = Image::new(
        id,
        &filename,
        info.size,
        info.width as i32,
        info.height as i32,
        info.format.as_str(),
        &key,
    );

    if let Err(e) = state.repo.create(&image).await {
        error!(error = %e, image_id = %id, "Failed to save image metadata");
        // Best-effort cleanup so the store does not accumulate orphans for
        // rows that never existed.
        if let Err(cleanup) = state.store.delete(&key).await {
            error!(error = %cleanup, key = %key, "Failed to clean up object after DB error");
        }
        return Err(ApiError::Internal("Failed to save image metadata".to_string()));
    }

    let task = Task::resize_image(id, &key, &filename, resize_config(&params));
    if let Err(e) = state.queue.publish(&task).await {
        // The row exists and the original is stored; the task is lost until a
        // reconciliation pass. Accept the upload anyway.
        error!(error = %e, image_id = %id, "Failed to queue image for processing");
    }

    metrics::counter!("api.images.uploaded").increment(1);

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadResponse {
            id,
            status: ImageStatus::Pending,
        }),
    ))
}

/// `GET /api/images/{id}` — record plus presigned URLs and reduction.
#[instrument(skip(state))]
pub async fn get_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ImageResponse>, ApiError> {
    let id = parse_id(&id)?;
    let image = state.repo.get_by_id(id).await?;

    let original_url = match state.store.presign_get(&image.original_path).await {
        Ok(url) => Some(url),
        Err(e) => {
            error!(error = %e, image_id = %id, "Failed to presign original URL");
            None
        }
    };

    let optimized_url = match (&image.status, &image.optimized_path) {
        (ImageStatus::Completed, Some(path)) => match state.store.presign_get(path).await {
            Ok(url) => Some(url),
            Err(e) => {
                error!(error = %e, image_id = %id, "Failed to presign optimized URL");
                None
            }
        },
        _ => None,
    };

    Ok(Json(ImageResponse::from_image(
        image,
        original_url,
        optimized_url,
    )))
}

/// `GET /api/images` — newest-first page of records.
#[instrument(skip(state))]
pub async fn list_images(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<ImageListResponse>, ApiError> {
    let limit = clamp_limit(parse_or(params.limit.as_deref(), 10));
    let page = parse_or(params.page.as_deref(), 1).max(1);
    let offset = (page - 1) * limit;

    let (images, total) = state.repo.list(limit, offset).await.map_err(|e| {
        error!(error = %e, "Failed to list images");
        ApiError::Internal("Failed to list images".to_string())
    })?;

    Ok(Json(ImageListResponse { images, total }))
}

/// `DELETE /api/images/{id}` — best-effort object removal, then the row.
#[instrument(skip(state))]
pub async fn delete_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_id(&id)?;
    let image = state.repo.get_by_id(id).await?;

    if let Err(e) = state.store.delete(&image.original_path).await {
        error!(error = %e, image_id = %id, "Failed to delete original from storage");
    }

    if let Some(optimized_path) = &image.optimized_path {
        if optimized_path != &image.original_path {
            if let Err(e) = state.store.delete(optimized_path).await {
                error!(error = %e, image_id = %id, "Failed to delete optimized variant from storage");
            }
        }
    }

    state.repo.delete(id).await?;

    metrics::counter!("api.images.deleted").increment(1);
    info!(image_id = %id, "Image deleted");

    Ok(Json(json!({ "status": "success" })))
}

async fn read_image_field(multipart: &mut Multipart) -> Result<(String, Bytes), ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::bad_request("Failed to get image from request"))?
    {
        if field.name() != Some("image") {
            continue;
        }

        let filename = field.file_name().unwrap_or("upload").to_string();
        let data = field
            .bytes()
            .await
            .map_err(|_| ApiError::bad_request("Failed to read image from request"))?;

        return Ok((filename, data));
    }

    Err(ApiError::bad_request("Failed to get image from request"))
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::InvalidId)
}

fn has_allowed_extension(filename: &str) -> bool {
    let lower = filename.to_ascii_lowercase();
    ALLOWED_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Sniff the content type from the leading bytes, the way browsers (and the
/// upload contract) do. Only the two accepted types are recognized.
fn sniff_mime(data: &[u8]) -> Option<&'static str> {
    let head = &data[..data.len().min(SNIFF_LEN)];
    if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if head.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        Some("image/png")
    } else {
        None
    }
}

fn parse_or(raw: Option<&str>, default: i64) -> i64 {
    raw.and_then(|s| s.parse::<i64>().ok()).unwrap_or(default)
}

fn clamp_limit(limit: i64) -> i64 {
    limit.clamp(1, 100)
}

fn resize_config(params: &UploadParams) -> ResizeConfig {
    let mut config = ResizeConfig::default();

    if let Some(width) = parse_override(params.max_width.as_deref()) {
        config.max_width = width as f64;
    }
    if let Some(height) = parse_override(params.max_height.as_deref()) {
        config.max_height = height as f64;
    }
    if let Some(quality) = parse_override(params.quality.as_deref()) {
        config.quality = quality as f64;
    }

    config
}

/// Query parameter overrides apply only when parseable and positive.
fn parse_override(raw: Option<&str>) -> Option<u32> {
    raw.and_then(|s| s.parse::<u32>().ok()).filter(|v| *v > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_check_accepts_jpeg_and_png() {
        assert!(has_allowed_extension("photo.jpg"));
        assert!(has_allowed_extension("photo.JPEG"));
        assert!(has_allowed_extension("photo.png"));
        assert!(!has_allowed_extension("photo.gif"));
        assert!(!has_allowed_extension("photo"));
    }

    #[test]
    fn sniff_detects_jpeg_and_png_magic() {
        assert_eq!(sniff_mime(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00]), Some("image/jpeg"));
        assert_eq!(
            sniff_mime(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0x00]),
            Some("image/png")
        );
    }

    #[test]
    fn sniff_rejects_gif_renamed_to_png() {
        // A GIF payload keeps its magic bytes no matter what the filename says.
        assert_eq!(sniff_mime(b"GIF89a...."), None);
        assert_eq!(sniff_mime(b""), None);
    }

    #[test]
    fn limit_is_clamped_to_valid_range() {
        assert_eq!(clamp_limit(0), 1);
        assert_eq!(clamp_limit(-3), 1);
        assert_eq!(clamp_limit(101), 100);
        assert_eq!(clamp_limit(10), 10);
    }

    #[test]
    fn list_params_fall_back_to_defaults() {
        assert_eq!(parse_or(None, 10), 10);
        assert_eq!(parse_or(Some("not-a-number"), 10), 10);
        assert_eq!(parse_or(Some("25"), 10), 25);
    }

    #[test]
    fn query_overrides_require_positive_integers() {
        assert_eq!(parse_override(Some("800")), Some(800));
        assert_eq!(parse_override(Some("0")), None);
        assert_eq!(parse_override(Some("-1")), None);
        assert_eq!(parse_override(Some("wide")), None);
        assert_eq!(parse_override(None), None);
    }

    #[test]
    fn resize_config_applies_overrides() {
        let params = UploadParams {
            max_width: Some("800".into()),
            max_height: Some("junk".into()),
            quality: Some("70".into()),
        };

        let config = resize_config(&params);
        assert_eq!(config.max_width, 800.0);
        assert_eq!(config.max_height, 1200.0);
        assert_eq!(config.quality, 70.0);
        assert!(config.optimize_storage);
    }

    #[test]
    fn invalid_uuid_is_rejected() {
        assert!(parse_id("not-a-uuid").is_err());
        assert!(parse_id("550e8400-e29b-41d4-a716-446655440000").is_ok());
    }
}
