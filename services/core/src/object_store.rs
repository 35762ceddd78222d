use crate::config::MinioConfig;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Errors surfaced by the object store client.
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object store error: {0}")]
    Transport(String),
}

/// Flat key/bytes store over S3-compatible storage (MinIO in deployments).
#[derive(Clone)]
pub struct ObjectStore {
    client: S3Client,
    bucket: String,
    url_expiry: Duration,
}

impl ObjectStore {
    /// Build a client against the configured endpoint and make sure the
    /// bucket exists (created if missing, idempotent).
    pub async fn connect(config: &MinioConfig) -> Result<Self, ObjectStoreError> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.location.clone()))
            .load()
            .await;

        let s3_config = S3ConfigBuilder::from(&aws_config)
            .endpoint_url(config.endpoint_url())
            // Path-style addressing is required for MinIO
            .force_path_style(true)
            .credentials_provider(Credentials::new(
                config.access_key.clone(),
                config.secret_key.clone(),
                None,
                None,
                "static",
            ))
            .build();

        let store = Self {
            client: S3Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
            url_expiry: Duration::from_secs(config.url_expiry),
        };

        store.ensure_bucket(&config.location).await?;

        info!(
            endpoint = %config.endpoint,
            bucket = %config.bucket,
            "Object store client initialized"
        );

        Ok(store)
    }

    async fn ensure_bucket(&self, location: &str) -> Result<(), ObjectStoreError> {
        let exists = match self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
        {
            Ok(_) => true,
            Err(e) if e.as_service_error().map(|s| s.is_not_found()).unwrap_or(false) => false,
            Err(e) => return Err(transport(e)),
        };

        if !exists {
            let mut create = self.client.create_bucket().bucket(&self.bucket);
            // us-east-1 is the implied default and must not be sent as a
            // location constraint.
            if location != "us-east-1" {
                create = create.create_bucket_configuration(
                    CreateBucketConfiguration::builder()
                        .location_constraint(BucketLocationConstraint::from(location))
                        .build(),
                );
            }

            match create.send().await {
                Ok(_) => info!(bucket = %self.bucket, location = %location, "Bucket created"),
                // Another process may have created it between the check and
                // the create; both outcomes leave the bucket usable.
                Err(e)
                    if e.as_service_error()
                        .map(|s| {
                            s.is_bucket_already_owned_by_you() || s.is_bucket_already_exists()
                        })
                        .unwrap_or(false) =>
                {
                    info!(bucket = %self.bucket, "Bucket already exists");
                }
                Err(e) => return Err(transport(e)),
            }
        }

        Ok(())
    }

    /// Upload bytes at `key`, overwriting any previous object.
    #[instrument(skip(self, data), fields(key = %key, size = data.len()))]
    pub async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .send()
            .await
            .map_err(transport)?;

        debug!(key = %key, "Object uploaded");
        Ok(())
    }

    /// Fetch the full object at `key` into memory. Objects are bounded by the
    /// upload size cap, so buffering is acceptable.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error()
                    .map(|s| s.is_no_such_key())
                    .unwrap_or(false)
                {
                    ObjectStoreError::NotFound(key.to_string())
                } else {
                    transport(e)
                }
            })?;

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| ObjectStoreError::Transport(e.to_string()))?;

        Ok(body.into_bytes().to_vec())
    }

    /// Delete the object at `key`. Deleting a missing key is not an error.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(transport)?;

        debug!(key = %key, "Object deleted");
        Ok(())
    }

    /// Time-bounded presigned GET URL for `key`.
    pub async fn presign_get(&self, key: &str) -> Result<String, ObjectStoreError> {
        let presigning = PresigningConfig::expires_in(self.url_expiry)
            .map_err(|e| ObjectStoreError::Transport(e.to_string()))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(transport)?;

        Ok(presigned.uri().to_string())
    }
}

fn transport<E: std::fmt::Display>(err: E) -> ObjectStoreError {
    ObjectStoreError::Transport(err.to_string())
}

/// Deterministic key for an uploaded original: `{id}/{sanitized_basename}{ext}`.
pub fn object_key(id: Uuid, filename: &str) -> String {
    let path = Path::new(filename);
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let base = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{}/{}{}", id, sanitize_filename(&base), ext)
}

/// Key for the optimized variant of an image: `{id}/optimized{ext}`.
pub fn optimized_key(id: Uuid, ext: &str) -> String {
    format!("{}/optimized{}", id, ext)
}

/// Replace spaces with underscores and strip everything outside
/// `[A-Za-z0-9._-]`.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .filter_map(|c| match c {
            ' ' => Some('_'),
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => Some(c),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_safe_characters() {
        assert_eq!(sanitize_filename("photo-1_final.v2"), "photo-1_final.v2");
    }

    #[test]
    fn sanitize_replaces_spaces() {
        assert_eq!(sanitize_filename("my holiday photo"), "my_holiday_photo");
    }

    #[test]
    fn sanitize_strips_special_characters() {
        assert_eq!(sanitize_filename("weird*name?!"), "weirdname");
        assert_eq!(sanitize_filename("path/trav../ersal"), "pathtrav..ersal");
    }

    #[test]
    fn object_key_is_deterministic() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let a = object_key(id, "my photo.jpg");
        let b = object_key(id, "my photo.jpg");
        assert_eq!(a, b);
        assert_eq!(
            a,
            "550e8400-e29b-41d4-a716-446655440000/my_photo.jpg"
        );
    }

    #[test]
    fn object_key_preserves_extension() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert!(object_key(id, "img.png").ends_with(".png"));
        assert!(object_key(id, "archive.tar.png").ends_with(".png"));
    }

    #[test]
    fn optimized_key_format() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(
            optimized_key(id, ".jpg"),
            "550e8400-e29b-41d4-a716-446655440000/optimized.jpg"
        );
    }
}
