use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle of an image record.
///
/// `Pending` is the unique initial state; only the worker advances a record to
/// `Processing`. `Completed` and `Failed` are terminal. Re-entering
/// `Processing` after a redelivered task is legal: the transition is a plain
/// update, never a conditional insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "image_status", rename_all = "lowercase")]
pub enum ImageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ImageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ImageStatus::Completed | ImageStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Pending => "pending",
            ImageStatus::Processing => "processing",
            ImageStatus::Completed => "completed",
            ImageStatus::Failed => "failed",
        }
    }
}

/// An image record as stored in the `images` table.
///
/// The optimized fields stay null until the record reaches `Completed`;
/// `optimized_path == original_path` marks the no-gain fallback where
/// re-encoding bought nothing and the variant references the original object.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Image {
    pub id: Uuid,
    pub original_name: String,
    pub original_size: i64,
    pub original_width: i32,
    pub original_height: i32,
    pub original_format: String,
    pub original_path: String,
    pub optimized_path: Option<String>,
    pub optimized_size: Option<i64>,
    pub optimized_width: Option<i32>,
    pub optimized_height: Option<i32>,
    pub status: ImageStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Image {
    /// Build a fresh pending record for a validated upload.
    pub fn new(
        id: Uuid,
        original_name: impl Into<String>,
        original_size: i64,
        original_width: i32,
        original_height: i32,
        original_format: impl Into<String>,
        original_path: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            original_name: original_name.into(),
            original_size,
            original_width,
            original_height,
            original_format: original_format.into(),
            original_path: original_path.into(),
            optimized_path: None,
            optimized_size: None,
            optimized_width: None,
            optimized_height: None,
            status: ImageStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Size reduction achieved by optimization, as a percentage. Zero until
    /// the record is completed with a positive optimized size.
    pub fn reduction(&self) -> f64 {
        match (self.status, self.optimized_size) {
            (ImageStatus::Completed, Some(optimized)) if optimized > 0 && self.original_size > 0 => {
                (1.0 - optimized as f64 / self.original_size as f64) * 100.0
            }
            _ => 0.0,
        }
    }
}

/// Response body for `POST /api/images`.
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub id: Uuid,
    pub status: ImageStatus,
}

/// Response body for `GET /api/images/{id}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ImageResponse {
    pub id: Uuid,
    pub original_name: String,
    pub status: ImageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimized_url: Option<String>,
    pub original_size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimized_size: Option<i64>,
    pub reduction: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ImageResponse {
    pub fn from_image(
        image: Image,
        original_url: Option<String>,
        optimized_url: Option<String>,
    ) -> Self {
        let reduction = image.reduction();
        Self {
            id: image.id,
            original_name: image.original_name,
            status: image.status,
            original_url,
            optimized_url,
            original_size: image.original_size,
            optimized_size: image.optimized_size,
            reduction,
            created_at: image.created_at,
            updated_at: image.updated_at,
            error: image.error,
        }
    }
}

/// Response body for `GET /api/images`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ImageListResponse {
    pub images: Vec<Image>,
    pub total: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed_image(original_size: i64, optimized_size: i64) -> Image {
        let mut img = Image::new(
            Uuid::new_v4(),
            "photo.jpg",
            original_size,
            2048,
            1536,
            "jpeg",
            "id/photo.jpg",
        );
        img.status = ImageStatus::Completed;
        img.optimized_path = Some("id/optimized.jpg".into());
        img.optimized_size = Some(optimized_size);
        img.optimized_width = Some(1200);
        img.optimized_height = Some(900);
        img
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ImageStatus::Pending).unwrap(),
            "\"pending\""
        );
        assert_eq!(
            serde_json::to_string(&ImageStatus::Failed).unwrap(),
            "\"failed\""
        );
    }

    #[test]
    fn terminal_states() {
        assert!(!ImageStatus::Pending.is_terminal());
        assert!(!ImageStatus::Processing.is_terminal());
        assert!(ImageStatus::Completed.is_terminal());
        assert!(ImageStatus::Failed.is_terminal());
    }

    #[test]
    fn reduction_for_completed_image() {
        let img = completed_image(1000, 250);
        assert!((img.reduction() - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn reduction_zero_while_pending() {
        let img = Image::new(
            Uuid::new_v4(),
            "photo.jpg",
            1000,
            800,
            600,
            "jpeg",
            "id/photo.jpg",
        );
        assert_eq!(img.reduction(), 0.0);
    }

    #[test]
    fn reduction_zero_for_no_gain_fallback() {
        // Fallback keeps the original size, so the reduction reads as 0%.
        let img = completed_image(15 * 1024, 15 * 1024);
        assert_eq!(img.reduction(), 0.0);
    }

    #[test]
    fn new_image_starts_pending() {
        let img = Image::new(
            Uuid::new_v4(),
            "a b.png",
            10,
            1,
            1,
            "png",
            "id/a_b.png",
        );
        assert_eq!(img.status, ImageStatus::Pending);
        assert!(img.optimized_path.is_none());
        assert!(img.error.is_none());
        assert_eq!(img.created_at, img.updated_at);
    }
}
