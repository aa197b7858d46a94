//! Uploader-info (accounts) API client.
//!
//! The reporter asks this service who uploaded a given skylink. Zero records
//! means the upload was anonymous.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

/// Errors raised by the accounts client.
#[derive(Error, Debug)]
pub enum AccountsError {
    #[error("accounts request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("GET request to '{url}' returned status {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
}

/// A single upload of a skylink, with whatever uploader information the
/// accounts service has on file.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadInfo {
    #[serde(default)]
    pub skylink: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub uploader_info: UploaderInfo,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploaderInfo {
    /// Subject identifying the uploader; groups uploads per user.
    #[serde(default)]
    pub sub: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub stripe_id: String,
}

/// Seam for the uploader-info lookups so tests can substitute a mock.
#[async_trait]
pub trait UploadInfoApi: Send + Sync {
    /// Returns the uploads known for the given skylink, possibly none.
    async fn upload_info(&self, skylink: &str) -> Result<Vec<UploadInfo>, AccountsError>;
}

/// HTTP client for the accounts API.
pub struct AccountsClient {
    base_url: String,
    client: reqwest::Client,
}

impl AccountsClient {
    pub fn new(base_url: String, client: reqwest::Client) -> Self {
        Self { base_url, client }
    }
}

#[async_trait]
impl UploadInfoApi for AccountsClient {
    async fn upload_info(&self, skylink: &str) -> Result<Vec<UploadInfo>, AccountsError> {
        let url = format!("{}/uploadinfo/{}", self.base_url, skylink);
        let res = self.client.get(&url).send().await?;
        if !res.status().is_success() {
            return Err(AccountsError::Status {
                url,
                status: res.status(),
            });
        }
        Ok(res.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_info_deserializes() {
        let raw = r#"[{
            "skylink": "AADhDhfUZizFdo6f6DG03JTiNQmgxTt96UnjJfcvnViJCC",
            "ip": "81.196.117.164",
            "createdAt": "2022-06-27T09:29:55Z",
            "uploaderInfo": {
                "sub": "user_1_sub",
                "email": "user.one@gmail.com",
                "stripeId": "stripe_id_user_1"
            }
        }]"#;
        let infos: Vec<UploadInfo> = serde_json::from_str(raw).unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].ip, "81.196.117.164");
        assert_eq!(infos[0].uploader_info.sub, "user_1_sub");
        assert_eq!(infos[0].uploader_info.stripe_id, "stripe_id_user_1");
        assert!(infos[0].created_at.is_some());
    }

    #[test]
    fn test_upload_info_tolerates_missing_fields() {
        let infos: Vec<UploadInfo> = serde_json::from_str(r#"[{"skylink": "AAA"}]"#).unwrap();
        assert_eq!(infos[0].ip, "");
        assert!(infos[0].created_at.is_none());
        assert_eq!(infos[0].uploader_info.sub, "");
    }
}
