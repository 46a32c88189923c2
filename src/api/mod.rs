//! Authorization endpoint client
//!
//! Talks to the signing service that vouches for uploads. The service never
//! sees file bytes; it only issues pre-signed provider requests and tracks
//! upload records so interrupted transfers can resume.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::signer::{PartId, SignedOperation};

/// Errors from the authorization endpoint
#[derive(Error, Debug)]
pub enum ApiError {
    /// A previous call has not completed yet. Calls are strictly serialized;
    /// overlapping requests fail fast instead of queueing.
    #[error("An authorization request is already in flight")]
    RequestInProgress,

    /// The service refused the file (406). Fatal for this file.
    #[error("Upload not accepted: {details}")]
    NotAcceptable { details: String },

    #[error("Authorization endpoint returned {status}")]
    Status { status: u16 },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed response: {0}")]
    Decode(String),

    #[error("Request aborted")]
    Aborted,

    #[error("No upload record; create must succeed first")]
    NoUploadRecord,
}

/// Identity of the file being negotiated, sent with every request
#[derive(Debug, Clone, Serialize)]
pub struct FileParams {
    pub file_name: String,
    pub file_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

/// Response to a provider residency check
#[derive(Debug, Clone, Deserialize)]
pub struct Residence {
    pub residence: String,
}

/// Response to upload creation. The signed operation fields sit at the top
/// level of the JSON document alongside the record id.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateResponse {
    pub upload_id: String,
    pub residence: String,
    #[serde(flatten)]
    pub operation: SignedOperation,
}

/// Body of a status update (PUT). All fields absent signals completion.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumable_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
}

/// Client for one file's negotiation with the signing service
pub struct AuthorizationClient {
    http: reqwest::Client,
    endpoint: String,
    file: FileParams,
    upload_id: parking_lot::Mutex<Option<String>>,
    in_flight: Arc<AtomicBool>,
}

/// Releases the single-flight slot when a request finishes (or panics)
struct FlightGuard(Arc<AtomicBool>);

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl AuthorizationClient {
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>, file: FileParams) -> Self {
        Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            file,
            upload_id: parking_lot::Mutex::new(None),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Record id assigned by the service once create has succeeded
    pub fn upload_id(&self) -> Option<String> {
        self.upload_id.lock().clone()
    }

    pub fn file(&self) -> &FileParams {
        &self.file
    }

    /// Ask which provider this file would land on, without creating a record
    pub async fn check_provider(
        http: &reqwest::Client,
        endpoint: &str,
        file: &FileParams,
    ) -> Result<String, ApiError> {
        let url = format!("{}/new", endpoint.trim_end_matches('/'));
        let response = http
            .get(&url)
            .query(&file)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        let residence: Residence = Self::read_json(response).await?;
        Ok(residence.residence)
    }

    /// Create (or look up) the upload record. Returns either the opening
    /// signed operation or, for an interrupted upload, resume state.
    #[tracing::instrument(name = "api.create", skip_all, fields(file_name = %self.file.file_name))]
    pub async fn create(
        &self,
        file_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<CreateResponse, ApiError> {
        let _guard = self.acquire_flight()?;

        let mut file = self.file.clone();
        if file_id.is_some() {
            file.file_id = file_id;
        }

        let request = self.http.post(&self.endpoint).json(&file);
        let response = self.send(request, cancel).await?;
        let created: CreateResponse = Self::read_json(response).await?;
        *self.upload_id.lock() = Some(created.upload_id.clone());
        tracing::debug!(upload_id = %created.upload_id, residence = %created.residence, "Upload record ready");
        Ok(created)
    }

    /// Request the signature for one part (or the finish request)
    #[tracing::instrument(name = "api.edit", skip(self, cancel), fields(part = %part))]
    pub async fn edit(
        &self,
        part: &PartId,
        file_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<SignedOperation, ApiError> {
        let _guard = self.acquire_flight()?;
        let upload_id = self.require_upload_id()?;

        let mut query: Vec<(&str, String)> = vec![("part", part.to_string())];
        if let Some(id) = file_id {
            query.push(("file_id", id.to_string()));
        }

        let url = format!("{}/{}/edit", self.endpoint, upload_id);
        let request = self.http.get(&url).query(&query);
        let response = self.send(request, cancel).await?;
        Self::read_json(response).await
    }

    /// Report progress to the service. With all params absent this marks the
    /// upload complete and the service responds with no further operation.
    #[tracing::instrument(name = "api.update", skip(self, cancel))]
    pub async fn update(
        &self,
        params: &UpdateParams,
        cancel: &CancellationToken,
    ) -> Result<Option<SignedOperation>, ApiError> {
        let _guard = self.acquire_flight()?;
        let upload_id = self.require_upload_id()?;

        let url = format!("{}/{}", self.endpoint, upload_id);
        let request = self.http.put(&url).json(params);
        let response = self.send(request, cancel).await?;

        let completion =
            params.resumable_id.is_none() && params.part.is_none() && params.file_id.is_none();
        if completion {
            let status = response.status();
            if !status.is_success() {
                return Err(Self::status_error(response).await);
            }
            return Ok(None);
        }
        Ok(Some(Self::read_json(response).await?))
    }

    /// Tear down the upload record. Best effort; errors are reported but the
    /// record may already be gone.
    #[tracing::instrument(name = "api.destroy", skip(self))]
    pub async fn destroy(&self) -> Result<(), ApiError> {
        let _guard = self.acquire_flight()?;
        let upload_id = self.require_upload_id()?;

        let url = format!("{}/{}", self.endpoint, upload_id);
        let response = self
            .http
            .delete(&url)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        let status = response.status();
        if status.is_success() || status.as_u16() == 404 {
            *self.upload_id.lock() = None;
            Ok(())
        } else {
            Err(Self::status_error(response).await)
        }
    }

    fn acquire_flight(&self) -> Result<FlightGuard, ApiError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(ApiError::RequestInProgress);
        }
        Ok(FlightGuard(self.in_flight.clone()))
    }

    fn require_upload_id(&self) -> Result<String, ApiError> {
        self.upload_id.lock().clone().ok_or(ApiError::NoUploadRecord)
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, ApiError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ApiError::Aborted),
            result = request.send() => result.map_err(|e| {
                if cancel.is_cancelled() {
                    ApiError::Aborted
                } else {
                    ApiError::Network(e.to_string())
                }
            }),
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let status = response.status();
        if !status.is_success() {
            return Err(Self::status_error(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn status_error(response: reqwest::Response) -> ApiError {
        let status = response.status().as_u16();
        if status == 406 {
            let details = response.text().await.unwrap_or_default();
            ApiError::NotAcceptable { details }
        } else {
            ApiError::Status { status }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::OperationKind;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn file() -> FileParams {
        FileParams {
            file_name: "video.mkv".into(),
            file_size: 21 * 1024 * 1024,
            file_id: None,
            file_path: None,
            parameters: None,
        }
    }

    fn client(server: &MockServer) -> AuthorizationClient {
        AuthorizationClient::new(
            reqwest::Client::new(),
            format!("{}/uploads", server.uri()),
            file(),
        )
    }

    #[tokio::test]
    async fn test_check_provider() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/uploads/new"))
            .and(query_param("file_name", "video.mkv"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "residence": "AmazonS3"
            })))
            .mount(&server)
            .await;

        let residence = AuthorizationClient::check_provider(
            &reqwest::Client::new(),
            &format!("{}/uploads", server.uri()),
            &file(),
        )
        .await
        .unwrap();
        assert_eq!(residence, "AmazonS3");
    }

    #[tokio::test]
    async fn test_create_stores_upload_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/uploads"))
            .and(body_partial_json(json!({"file_id": "abc123"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "upload_id": "42",
                "residence": "AmazonS3",
                "type": "chunked_upload",
                "signature": {
                    "verb": "POST",
                    "url": "https://bucket.example/key?uploads",
                    "headers": {}
                }
            })))
            .mount(&server)
            .await;

        let client = client(&server);
        let created = client
            .create(Some("abc123".into()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(created.upload_id, "42");
        assert_eq!(created.operation.kind, OperationKind::ChunkedUpload);
        assert_eq!(client.upload_id().as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_create_resume_returns_part_state() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/uploads"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "upload_id": "42",
                "residence": "AmazonS3",
                "type": "parts",
                "signature": {
                    "verb": "GET",
                    "url": "https://bucket.example/key?uploadId=xyz",
                    "headers": {}
                },
                "part_list": ["etag1", "etag2"]
            })))
            .mount(&server)
            .await;

        let created = client(&server)
            .create(None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(created.operation.kind, OperationKind::Parts);
        assert_eq!(created.operation.part_list, vec!["etag1", "etag2"]);
    }

    #[tokio::test]
    async fn test_edit_requires_record() {
        let server = MockServer::start().await;
        let result = client(&server)
            .edit(&PartId::Number(2), None, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ApiError::NoUploadRecord)));
    }

    #[tokio::test]
    async fn test_update_completion_returns_none() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/uploads"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "upload_id": "42",
                "residence": "OpenStackSwift",
                "type": "chunked_upload",
                "signature": {"verb": "PUT", "url": "https://x/y", "headers": {}}
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/uploads/42"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = client(&server);
        client.create(None, &CancellationToken::new()).await.unwrap();
        let next = client
            .update(&UpdateParams::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_not_acceptable_carries_details() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/uploads"))
            .respond_with(ResponseTemplate::new(406).set_body_string("file type rejected"))
            .mount(&server)
            .await;

        let result = client(&server).create(None, &CancellationToken::new()).await;
        match result {
            Err(ApiError::NotAcceptable { details }) => assert_eq!(details, "file type rejected"),
            other => panic!("expected NotAcceptable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_single_flight() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/uploads"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(std::time::Duration::from_millis(200))
                    .set_body_json(json!({
                        "upload_id": "42",
                        "residence": "AmazonS3",
                        "type": "direct_upload",
                        "signature": {"verb": "PUT", "url": "https://x/y", "headers": {}}
                    })),
            )
            .mount(&server)
            .await;

        let client = Arc::new(client(&server));
        let slow = {
            let client = client.clone();
            tokio::spawn(async move { client.create(None, &CancellationToken::new()).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let overlapping = client.create(None, &CancellationToken::new()).await;
        assert!(matches!(overlapping, Err(ApiError::RequestInProgress)));

        slow.await.unwrap().unwrap();
        assert_eq!(client.upload_id().as_deref(), Some("42"));
    }
}
