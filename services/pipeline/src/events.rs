//! Wire shapes of the events carried by the ComicVault topics.
//!
//! Fields that consumers must validate are optional here so a malformed
//! event still deserializes and can be reported precisely.

use serde::{Deserialize, Serialize};

/// Published once an image has been written to the object store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUploaded {
    pub data: ImageUploadedData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUploadedData {
    /// Object-store locator of the uploaded image
    #[serde(default)]
    pub url: Option<String>,
}

impl ImageUploaded {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            data: ImageUploadedData {
                url: Some(url.into()),
            },
        }
    }
}

/// Published when a user asks for a catalogued comic to be removed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteRequested {
    #[serde(default)]
    pub comic_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_url: Option<String>,
    /// User that asked for the deletion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl DeleteRequested {
    pub fn new(comic_id: impl Into<String>) -> Self {
        Self {
            comic_id: Some(comic_id.into()),
            blob_url: None,
            user_id: None,
        }
    }

    pub fn requested_by(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_uploaded_wire_shape() {
        let event = ImageUploaded::new("https://store/uploads/user42/abc.jpg");
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(
            json,
            serde_json::json!({ "data": { "url": "https://store/uploads/user42/abc.jpg" } })
        );
    }

    #[test]
    fn test_delete_requested_omits_absent_fields() {
        let event = DeleteRequested::new("7f7c0a4e-0000-0000-0000-000000000000");
        let json = serde_json::to_string(&event).unwrap();

        assert!(json.contains("comic_id"));
        assert!(!json.contains("blob_url"));
        assert!(!json.contains("user_id"));
    }

    #[test]
    fn test_delete_requested_tolerates_missing_id() {
        let event: DeleteRequested = serde_json::from_str(r#"{"blob_url": null}"#).unwrap();
        assert_eq!(event.comic_id, None);
        assert_eq!(event.blob_url, None);
    }
}
