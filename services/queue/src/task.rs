use optiq_core::processor::ProcessConfig;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire envelope for queued work.
///
/// The payload is a tagged union keyed by the `type` field, so a task of an
/// unrecognized type fails to decode instead of reaching a handler; the
/// consumer drops such messages as permanently unprocessable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    #[serde(flatten)]
    pub payload: TaskPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TaskPayload {
    #[serde(rename = "resize_image")]
    ResizeImage(ResizeData),
}

/// Payload of a `resize_image` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizeData {
    pub image_id: Uuid,
    pub original_path: String,
    pub filename: String,
    #[serde(default)]
    pub config: ResizeConfig,
}

/// Processing parameters as they travel on the wire.
///
/// JSON numbers decode as floating point, so the numeric fields stay `f64`
/// here; [`ResizeConfig::effective`] coerces them to integers and validates
/// ranges before they reach the processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizeConfig {
    #[serde(default = "default_max_width")]
    pub max_width: f64,
    #[serde(default = "default_max_height")]
    pub max_height: f64,
    #[serde(default = "default_quality")]
    pub quality: f64,
    #[serde(default = "default_optimize_storage")]
    pub optimize_storage: bool,
}

fn default_max_width() -> f64 {
    1200.0
}

fn default_max_height() -> f64 {
    1200.0
}

fn default_quality() -> f64 {
    85.0
}

fn default_optimize_storage() -> bool {
    true
}

impl Default for ResizeConfig {
    fn default() -> Self {
        Self {
            max_width: default_max_width(),
            max_height: default_max_height(),
            quality: default_quality(),
            optimize_storage: default_optimize_storage(),
        }
    }
}

impl ResizeConfig {
    /// Coerce the loose wire values into validated processor parameters.
    /// Non-positive dimensions and out-of-range qualities fall back to the
    /// defaults.
    pub fn effective(&self) -> ProcessConfig {
        let defaults = ProcessConfig::default();

        let max_width = if self.max_width > 0.0 {
            self.max_width as u32
        } else {
            defaults.max_width
        };

        let max_height = if self.max_height > 0.0 {
            self.max_height as u32
        } else {
            defaults.max_height
        };

        let quality = if self.quality >= 1.0 && self.quality <= 100.0 {
            self.quality as u8
        } else {
            defaults.quality
        };

        ProcessConfig {
            max_width,
            max_height,
            quality,
            optimize_storage: self.optimize_storage,
        }
    }
}

impl Task {
    /// Build a resize task for a freshly uploaded image. The envelope id is
    /// the image id, which keeps broker logs and DB rows correlated.
    pub fn resize_image(
        image_id: Uuid,
        original_path: impl Into<String>,
        filename: impl Into<String>,
        config: ResizeConfig,
    ) -> Self {
        Self {
            id: image_id,
            payload: TaskPayload::ResizeImage(ResizeData {
                image_id,
                original_path: original_path.into(),
                filename: filename.into(),
                config,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_wire_format_with_float_numerics() {
        let json = r#"{
            "id": "550e8400-e29b-41d4-a716-446655440000",
            "type": "resize_image",
            "data": {
                "image_id": "550e8400-e29b-41d4-a716-446655440000",
                "original_path": "550e8400-e29b-41d4-a716-446655440000/photo.jpg",
                "filename": "photo.jpg",
                "config": {
                    "max_width": 800.0,
                    "max_height": 600.0,
                    "quality": 70.0,
                    "optimize_storage": false
                }
            }
        }"#;

        let task: Task = serde_json::from_str(json).unwrap();
        let TaskPayload::ResizeImage(data) = task.payload;
        assert_eq!(data.filename, "photo.jpg");

        let effective = data.config.effective();
        assert_eq!(effective.max_width, 800);
        assert_eq!(effective.max_height, 600);
        assert_eq!(effective.quality, 70);
        assert!(!effective.optimize_storage);
    }

    #[test]
    fn missing_config_fields_take_defaults() {
        let json = r#"{
            "id": "550e8400-e29b-41d4-a716-446655440000",
            "type": "resize_image",
            "data": {
                "image_id": "550e8400-e29b-41d4-a716-446655440000",
                "original_path": "550e8400-e29b-41d4-a716-446655440000/photo.jpg",
                "filename": "photo.jpg"
            }
        }"#;

        let task: Task = serde_json::from_str(json).unwrap();
        let TaskPayload::ResizeImage(data) = task.payload;
        let effective = data.config.effective();
        assert_eq!(effective, ProcessConfig::default());
    }

    #[test]
    fn unknown_type_fails_to_decode() {
        let json = r#"{
            "id": "550e8400-e29b-41d4-a716-446655440000",
            "type": "rotate_image",
            "data": {}
        }"#;

        assert!(serde_json::from_str::<Task>(json).is_err());
    }

    #[test]
    fn out_of_range_values_fall_back_to_defaults() {
        let config = ResizeConfig {
            max_width: -5.0,
            max_height: 0.0,
            quality: 150.0,
            optimize_storage: true,
        };

        let effective = config.effective();
        assert_eq!(effective.max_width, 1200);
        assert_eq!(effective.max_height, 1200);
        assert_eq!(effective.quality, 85);
    }

    #[test]
    fn serializes_with_type_tag() {
        let task = Task::resize_image(
            Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap(),
            "550e8400-e29b-41d4-a716-446655440000/photo.jpg",
            "photo.jpg",
            ResizeConfig::default(),
        );

        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["type"], "resize_image");
        assert_eq!(value["data"]["filename"], "photo.jpg");
        assert_eq!(value["data"]["config"]["max_width"], 1200.0);
    }
}
