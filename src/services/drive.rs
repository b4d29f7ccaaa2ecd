//! src/services/drive.rs
//!
//! DriveClient: Google Drive v3 listing and downloads, authenticated as a
//! service account. The access token is obtained with a signed JWT-bearer
//! grant and reused until shortly before it expires.

use crate::{
    errors::{TransferError, TransferResult},
    models::file_record::FileRecord,
    services::source::{Downloader, SourceLister},
};
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const DRIVE_FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive.readonly";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const LIST_FIELDS: &str = "nextPageToken, files(id, name)";
/// Newest first; the orchestrator reverses the page to deliver oldest first.
const LIST_ORDER: &str = "modifiedTime desc";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

/// The fields of a service-account key file the client needs.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading service account key `{}`", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing service account key `{}`", path.display()))
    }
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<FileRecord>,
    next_page_token: Option<String>,
}

struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

pub struct DriveClient {
    http: reqwest::Client,
    key: ServiceAccountKey,
    files_url: String,
    timeout: Duration,
    token: Mutex<Option<CachedToken>>,
}

impl DriveClient {
    /// Build a client whose every request is bounded by `timeout`.
    pub fn new(key: ServiceAccountKey, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            http,
            key,
            files_url: DRIVE_FILES_URL.to_string(),
            timeout,
            token: Mutex::new(None),
        })
    }

    /// Point the client at a different files endpoint.
    pub fn with_files_url(mut self, url: impl Into<String>) -> Self {
        self.files_url = url.into();
        self
    }

    /// Current access token, exchanging a fresh assertion when needed.
    async fn access_token(&self) -> TransferResult<String> {
        let mut cached = self.token.lock().await;
        let now = Utc::now();
        if let Some(token) = cached.as_ref() {
            if token.expires_at > now {
                return Ok(token.value.clone());
            }
        }

        let assertion = self.sign_assertion(now)?;
        let response = self
            .http
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|err| self.request_error("token exchange", err))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TransferError::Auth {
                host: self.key.token_uri.clone(),
                reason: format!("token exchange returned {status}: {body}"),
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|err| self.request_error("token exchange", err))?;
        debug!(expires_in = token.expires_in, "obtained drive access token");

        let lifetime = (token.expires_in - TOKEN_REFRESH_MARGIN_SECS).max(0);
        let value = token.access_token;
        *cached = Some(CachedToken {
            value: value.clone(),
            expires_at: now + ChronoDuration::seconds(lifetime),
        });
        Ok(value)
    }

    fn sign_assertion(&self, now: DateTime<Utc>) -> TransferResult<String> {
        let claims = Claims {
            iss: &self.key.client_email,
            scope: DRIVE_SCOPE,
            aud: &self.key.token_uri,
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
        };
        let auth_error = |reason: String| TransferError::Auth {
            host: self.key.token_uri.clone(),
            reason,
        };

        let key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|err| auth_error(format!("invalid service account key: {err}")))?;
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|err| auth_error(format!("signing assertion: {err}")))
    }

    fn request_error(&self, operation: &'static str, err: reqwest::Error) -> TransferError {
        if err.is_timeout() {
            TransferError::Timeout {
                operation,
                elapsed: self.timeout,
            }
        } else {
            TransferError::Source(format!("{operation}: {err}"))
        }
    }
}

#[async_trait]
impl SourceLister for DriveClient {
    async fn list_since(
        &self,
        watermark: DateTime<Utc>,
        page_size: usize,
    ) -> TransferResult<Vec<FileRecord>> {
        let token = self.access_token().await?;
        let query = format!(
            "modifiedTime > '{}'",
            watermark.format("%Y-%m-%dT%H:%M:%S")
        );
        let page_size = page_size.to_string();

        let response = self
            .http
            .get(&self.files_url)
            .bearer_auth(token)
            .query(&[
                ("pageSize", page_size.as_str()),
                ("fields", LIST_FIELDS),
                ("orderBy", LIST_ORDER),
                ("q", query.as_str()),
            ])
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| self.request_error("list", err))?;

        let listing: FileList = response
            .json()
            .await
            .map_err(|err| self.request_error("list", err))?;

        if listing.next_page_token.is_some() {
            warn!(
                returned = listing.files.len(),
                "more files match than one page holds; the rest wait for a later run"
            );
        }
        info!(count = listing.files.len(), %watermark, "listed candidate files");
        Ok(listing.files)
    }
}

#[async_trait]
impl Downloader for DriveClient {
    async fn download(&self, file: &FileRecord) -> TransferResult<Bytes> {
        let token = self.access_token().await?;
        let url = format!("{}/{}", self.files_url, file.id);

        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(&[("alt", "media")])
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| self.request_error("download", err))?;

        let body = response
            .bytes()
            .await
            .map_err(|err| self.request_error("download", err))?;
        debug!(file = %file.name, bytes = body.len(), "downloaded");
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use httpmock::prelude::*;
    use serde_json::json;

    const TEST_KEY: &str = include_str!("../../testdata/test-rsa.pem");

    fn client_for(server: &MockServer) -> DriveClient {
        let key = ServiceAccountKey {
            client_email: "relay@example.iam.gserviceaccount.com".into(),
            private_key: TEST_KEY.into(),
            token_uri: server.url("/token"),
        };
        DriveClient::new(key, Duration::from_secs(5))
            .unwrap()
            .with_files_url(server.url("/drive/v3/files"))
    }

    fn token_mock(server: &MockServer) -> httpmock::Mock<'_> {
        server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(200)
                .json_body(json!({ "access_token": "tok-1", "expires_in": 3600 }));
        })
    }

    #[tokio::test]
    async fn lists_files_modified_after_watermark() {
        let server = MockServer::start_async().await;
        let token = token_mock(&server);
        let list = server.mock(|when, then| {
            when.method(GET)
                .path("/drive/v3/files")
                .header("authorization", "Bearer tok-1")
                .query_param("pageSize", "12")
                .query_param("orderBy", "modifiedTime desc")
                .query_param("q", "modifiedTime > '2021-12-08T18:00:00'");
            then.status(200).json_body(json!({
                "files": [
                    { "id": "f2", "name": "b.csv" },
                    { "id": "f1", "name": "a.csv" }
                ]
            }));
        });

        let watermark = Utc.with_ymd_and_hms(2021, 12, 8, 18, 0, 0).unwrap();
        let files = client_for(&server).list_since(watermark, 12).await.unwrap();

        assert_eq!(
            files,
            vec![FileRecord::new("f2", "b.csv"), FileRecord::new("f1", "a.csv")]
        );
        token.assert();
        list.assert();
    }

    #[tokio::test]
    async fn reuses_token_across_requests() {
        let server = MockServer::start_async().await;
        let token = token_mock(&server);
        let download = server.mock(|when, then| {
            when.method(GET)
                .path("/drive/v3/files/f1")
                .query_param("alt", "media")
                .header("authorization", "Bearer tok-1");
            then.status(200).body("sample_barcode\nA\n");
        });

        let client = client_for(&server);
        let file = FileRecord::new("f1", "a.csv");
        let first = client.download(&file).await.unwrap();
        let second = client.download(&file).await.unwrap();

        assert_eq!(&first[..], b"sample_barcode\nA\n");
        assert_eq!(first, second);
        token.assert_calls(1);
        download.assert_calls(2);
    }

    #[tokio::test]
    async fn empty_listing_has_no_files() {
        let server = MockServer::start_async().await;
        token_mock(&server);
        server.mock(|when, then| {
            when.method(GET).path("/drive/v3/files");
            then.status(200).json_body(json!({}));
        });

        let files = client_for(&server)
            .list_since(Utc::now(), 12)
            .await
            .unwrap();
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn failed_download_is_source_error() {
        let server = MockServer::start_async().await;
        token_mock(&server);
        server.mock(|when, then| {
            when.method(GET).path("/drive/v3/files/gone");
            then.status(404);
        });

        let err = client_for(&server)
            .download(&FileRecord::new("gone", "gone.csv"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Source(_)));
    }

    #[tokio::test]
    async fn rejected_token_exchange_is_auth_error() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(401).body("invalid_grant");
        });

        let err = client_for(&server)
            .list_since(Utc::now(), 12)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Auth { reason, .. } if reason.contains("invalid_grant")));
    }

    #[tokio::test]
    async fn malformed_private_key_is_auth_error() {
        let server = MockServer::start_async().await;
        let key = ServiceAccountKey {
            client_email: "relay@example.iam.gserviceaccount.com".into(),
            private_key: "not a pem".into(),
            token_uri: server.url("/token"),
        };
        let client = DriveClient::new(key, Duration::from_secs(5)).unwrap();

        let err = client.list_since(Utc::now(), 1).await.unwrap_err();
        assert!(matches!(err, TransferError::Auth { .. }));
    }

    #[test]
    fn key_file_defaults_token_uri() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.json");
        std::fs::write(
            &path,
            json!({ "client_email": "a@b.c", "private_key": "pem" }).to_string(),
        )
        .unwrap();

        let key = ServiceAccountKey::from_file(&path).unwrap();
        assert_eq!(key.token_uri, DEFAULT_TOKEN_URI);
        assert!(!format!("{key:?}").contains("pem"));
    }
}
