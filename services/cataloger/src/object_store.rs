use crate::config::S3Config;
use crate::locator::ImageLocator;
use crate::outcome::DeleteOutcome;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("failed to upload {key}: {message}")]
    Upload { key: String, message: String },

    #[error("failed to delete {key}: {message}")]
    Delete { key: String, message: String },

    #[error("failed to sign a read URL for {key}: {message}")]
    Presign { key: String, message: String },
}

/// Binary image storage
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store a new upload under `<owner>/<random id>.<extension>`
    async fn upload_image(
        &self,
        owner: &str,
        extension: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<ImageLocator, ObjectStoreError>;

    async fn delete(&self, image: &ImageLocator) -> Result<DeleteOutcome, ObjectStoreError>;

    /// Temporary URL that lets an external service read the image
    async fn presigned_read_url(
        &self,
        image: &ImageLocator,
        expires_in: Duration,
    ) -> Result<String, ObjectStoreError>;
}

/// S3-compatible object store
pub struct S3ObjectStore {
    client: S3Client,
    upload_bucket: String,
    public_base_url: String,
}

impl S3ObjectStore {
    pub async fn new(config: &S3Config) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.upload_bucket,
            region = %config.region,
            "S3 object store initialized"
        );

        Ok(Self {
            client,
            upload_bucket: config.upload_bucket.clone(),
            public_base_url: config.public_base_url.clone(),
        })
    }

    async fn exists(&self, image: &ImageLocator) -> Result<bool, ObjectStoreError> {
        match self
            .client
            .head_object()
            .bucket(image.container())
            .key(image.blob_name())
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(ObjectStoreError::Delete {
                        key: image.blob_name().to_string(),
                        message: e.to_string(),
                    })
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, bytes), fields(size_bytes = bytes.len()))]
    async fn upload_image(
        &self,
        owner: &str,
        extension: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<ImageLocator, ObjectStoreError> {
        let key = object_key(owner, Uuid::new_v4(), extension).ok_or_else(|| {
            ObjectStoreError::Upload {
                key: format!("{owner}/*.{extension}"),
                message: "owner or extension is not a valid key segment".to_string(),
            }
        })?;

        self.client
            .put_object()
            .bucket(&self.upload_bucket)
            .key(&key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .metadata("owner", owner)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Upload {
                key: key.clone(),
                message: e.to_string(),
            })?;

        debug!(key = %key, "Image uploaded");
        Ok(ImageLocator::from_parts(
            &self.public_base_url,
            &self.upload_bucket,
            &key,
        ))
    }

    /// S3 deletes succeed for missing keys, so absence is detected up front
    #[instrument(skip(self, image), fields(image = %image))]
    async fn delete(&self, image: &ImageLocator) -> Result<DeleteOutcome, ObjectStoreError> {
        if !self.exists(image).await? {
            return Ok(DeleteOutcome::NotFound);
        }

        self.client
            .delete_object()
            .bucket(image.container())
            .key(image.blob_name())
            .send()
            .await
            .map_err(|e| ObjectStoreError::Delete {
                key: image.blob_name().to_string(),
                message: e.to_string(),
            })?;

        debug!("Image deleted");
        Ok(DeleteOutcome::Deleted)
    }

    async fn presigned_read_url(
        &self,
        image: &ImageLocator,
        expires_in: Duration,
    ) -> Result<String, ObjectStoreError> {
        let presign_error = |message: String| ObjectStoreError::Presign {
            key: image.blob_name().to_string(),
            message,
        };

        let presigning =
            PresigningConfig::expires_in(expires_in).map_err(|e| presign_error(e.to_string()))?;

        let request = self
            .client
            .get_object()
            .bucket(image.container())
            .key(image.blob_name())
            .presigned(presigning)
            .await
            .map_err(|e| presign_error(e.to_string()))?;

        Ok(request.uri().to_string())
    }
}

/// Key of a new upload, or `None` when a component cannot be used verbatim.
///
/// The owner is never rewritten: it is read back from the key as the
/// record's `user_id` and must match the caller's identity exactly.
pub(crate) fn object_key(owner: &str, id: Uuid, extension: &str) -> Option<String> {
    let extension = extension.to_ascii_lowercase();
    if !is_key_segment(owner) || !is_key_segment(&extension) {
        return None;
    }
    Some(format!("{owner}/{id}.{extension}"))
}

/// Whether `component` can be used as one object key segment as is
pub fn is_key_segment(component: &str) -> bool {
    !component.is_empty()
        && component
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// File extension for an accepted image content type
pub fn extension_for(content_type: &str) -> Option<&'static str> {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    match essence.to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        _ => None,
    }
}
