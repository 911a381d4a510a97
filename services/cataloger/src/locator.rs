use reqwest::Url;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LocatorError {
    #[error("not a valid URL: {0}")]
    InvalidUrl(String),

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("locator has no container segment")]
    MissingContainer,

    #[error("locator has no object name")]
    MissingBlobName,

    #[error("path segment {0:?} is not valid percent-encoded UTF-8")]
    InvalidEncoding(String),
}

/// Object-store locator of an uploaded image.
///
/// Shape: `https://<host>/<container>/<blob name>`. The first path segment is
/// the container (S3 bucket) and the remainder is the object key. When the
/// key has a directory part, its first segment is the uploading user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLocator {
    url: String,
    container: String,
    blob_name: String,
}

impl ImageLocator {
    pub fn parse(raw: &str) -> Result<Self, LocatorError> {
        let raw = raw.trim();
        let url = Url::parse(raw).map_err(|e| LocatorError::InvalidUrl(e.to_string()))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(LocatorError::UnsupportedScheme(url.scheme().to_string()));
        }

        // Object keys are the decoded path, not its URL form
        let mut segments = url
            .path_segments()
            .ok_or(LocatorError::MissingContainer)?
            .filter(|s| !s.is_empty())
            .map(decode_segment);

        let container = segments.next().ok_or(LocatorError::MissingContainer)??;
        let blob_name = segments.collect::<Result<Vec<_>, _>>()?.join("/");
        if blob_name.is_empty() {
            return Err(LocatorError::MissingBlobName);
        }

        Ok(Self {
            url: raw.to_string(),
            container,
            blob_name,
        })
    }

    /// Build the locator of an object this service wrote itself
    pub fn from_parts(base_url: &str, container: &str, blob_name: &str) -> Self {
        Self {
            url: format!(
                "{}/{}/{}",
                base_url.trim_end_matches('/'),
                container,
                blob_name
            ),
            container: container.to_string(),
            blob_name: blob_name.to_string(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn blob_name(&self) -> &str {
        &self.blob_name
    }

    /// Uploading user, taken from the first directory of the object key.
    /// Legacy objects stored at the container root have no owner.
    pub fn owner(&self) -> Option<&str> {
        self.blob_name
            .split_once('/')
            .map(|(owner, _)| owner)
            .filter(|owner| !owner.is_empty())
    }

    /// Lowercased file extension of the object key
    pub fn extension(&self) -> Option<String> {
        let file_name = self.blob_name.rsplit('/').next()?;
        file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
    }

    /// Catalog record id for this image. Derived from the locator so every
    /// delivery of the same upload event targets the same record.
    pub fn record_id(&self) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_URL, self.url.as_bytes())
    }
}

fn decode_segment(segment: &str) -> Result<String, LocatorError> {
    urlencoding::decode(segment)
        .map(|decoded| decoded.into_owned())
        .map_err(|_| LocatorError::InvalidEncoding(segment.to_string()))
}

impl std::fmt::Display for ImageLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.url)
    }
}
