//! Shared core for the optiq image optimization service.
//!
//! Holds everything both binaries need: environment configuration, the image
//! record model and its status machine, the PostgreSQL metadata repository,
//! the S3/MinIO object store client, and the image processor that decodes,
//! resamples and re-encodes uploads.

pub mod config;
pub mod models;
pub mod object_store;
pub mod processor;
pub mod repository;

pub use config::Config;
pub use models::{Image, ImageListResponse, ImageResponse, ImageStatus, UploadResponse};
pub use object_store::{object_key, optimized_key, ObjectStore, ObjectStoreError};
pub use processor::{
    validate, ImageFormat, ImageInfo, ImageProcessor, ProcessConfig, ProcessingResult,
    ProcessorError,
};
pub use repository::{ImageRepository, RepositoryError};
