//! Provider request signing
//!
//! One strategy per storage provider. Every strategy turns an abstract
//! upload/part descriptor into the exact verb, URL, headers and signature
//! the provider requires for a time-limited, credential-free request.
//!
//! Signing is pure: no network I/O, no shared state, deterministic for a
//! given descriptor and `SignContext`. The only networked member is
//! `destroy`, which is best-effort by contract.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::chunk::ProviderLimits;

pub mod amazon_s3;
pub mod azure_blob;
pub mod google_cloud;
pub mod openstack_swift;

pub use amazon_s3::AmazonS3;
pub use azure_blob::MicrosoftAzure;
pub use google_cloud::GoogleCloudStorage;
pub use openstack_swift::OpenStackSwift;

/// Signing errors. Malformed input is a contract violation, not a runtime
/// condition: strategies never retry or swallow.
#[derive(Error, Debug)]
pub enum SignError {
    #[error("Missing credential: {0}")]
    MissingCredential(String),

    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Operation not supported by {provider}: {operation}")]
    Unsupported {
        provider: &'static str,
        operation: &'static str,
    },
}

/// A pre-authorized, time-expiring HTTP request. Never persisted; the
/// validity window is enforced by the provider, not the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedRequest {
    pub verb: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// What the signed request authorizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    DirectUpload,
    ChunkedUpload,
    Parts,
    PartUpload,
    Finish,
}

/// A signed operation plus the bookkeeping the client needs to drive it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedOperation {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignedRequest>,
    /// Completed part identifiers the application server has recorded
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub part_list: Vec<String>,
    /// Part cursor for providers that track resume position as a number
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_part: Option<u32>,
    /// Provider-side segment path, needed for static-large-object manifests
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl SignedOperation {
    pub fn new(kind: OperationKind, signature: SignedRequest) -> Self {
        Self {
            kind,
            signature: Some(signature),
            part_list: Vec::new(),
            current_part: None,
            path: None,
        }
    }

    pub fn unsigned(kind: OperationKind) -> Self {
        Self {
            kind,
            signature: None,
            part_list: Vec::new(),
            current_part: None,
            path: None,
        }
    }
}

/// Object visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permissions {
    #[default]
    Private,
    Public,
}

/// Caller-supplied options applied to the signed object
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectOptions {
    #[serde(default)]
    pub permissions: Permissions,
    /// Custom headers merged under provider defaults
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Injected clock for deterministic signatures: the same descriptor and
/// context always produce the same signature.
#[derive(Debug, Clone, Copy)]
pub struct SignContext {
    pub now: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

/// Default validity window for signed URLs
pub const DEFAULT_TTL_SECS: i64 = 300;

impl SignContext {
    pub fn new() -> Self {
        Self::with_ttl(Duration::seconds(DEFAULT_TTL_SECS))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            now,
            expires: now + ttl,
        }
    }

    pub fn at(now: DateTime<Utc>, expires: DateTime<Utc>) -> Self {
        Self { now, expires }
    }

    pub fn expires_epoch(&self) -> i64 {
        self.expires.timestamp()
    }
}

impl Default for SignContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Descriptor for signing a whole-object operation (`new_upload`, `get_object`)
#[derive(Debug, Clone)]
pub struct UploadSigning {
    pub bucket_name: String,
    pub object_key: String,
    pub object_options: ObjectOptions,
    pub file_size: u64,
    /// Content id of the full file (or first chunk), provider encoding
    pub file_id: Option<String>,
}

/// Descriptor for signing a part upload or the finishing commit
#[derive(Debug, Clone)]
pub struct PartSigning {
    pub bucket_name: String,
    pub object_key: String,
    pub object_options: ObjectOptions,
    pub resumable_id: String,
    pub part: PartId,
    pub file_size: u64,
    pub file_id: Option<String>,
}

/// Descriptor for signing a provider part listing
#[derive(Debug, Clone)]
pub struct PartListSigning {
    pub bucket_name: String,
    pub object_key: String,
    pub object_options: ObjectOptions,
    pub file_size: u64,
    pub resumable_id: String,
}

/// A part number, or the literal finishing commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartId {
    Number(u32),
    Finish,
}

impl std::fmt::Display for PartId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartId::Number(n) => write!(f, "{n}"),
            PartId::Finish => write!(f, "finish"),
        }
    }
}

/// Server-held record of an upload, referenced by `destroy`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRecord {
    pub upload_id: String,
    pub file_size: u64,
    pub bucket_name: String,
    pub object_key: String,
    pub resumable: bool,
    pub resumable_id: Option<String>,
    #[serde(default)]
    pub part_list: Vec<String>,
    pub provider_name: String,
    pub provider_location: String,
}

/// One provider strategy. `sign`-family methods are pure; `destroy` is the
/// only member allowed to touch the network and it never surfaces failure.
#[async_trait]
pub trait Signer: Send + Sync {
    fn name(&self) -> &'static str;

    fn location(&self) -> String;

    fn limits(&self) -> ProviderLimits;

    /// Signed, time-limited URL for reading a private object
    fn get_object(&self, request: &UploadSigning, ctx: &SignContext) -> Result<String, SignError>;

    /// Signed request creating a new upload, direct or chunked
    fn new_upload(
        &self,
        request: &UploadSigning,
        ctx: &SignContext,
    ) -> Result<SignedOperation, SignError>;

    /// Signed request (or cursor) recovering the parts a provider has received
    fn get_parts(
        &self,
        request: &PartListSigning,
        ctx: &SignContext,
    ) -> Result<SignedOperation, SignError>;

    /// Signed request for one part upload or the finishing commit
    fn set_part(
        &self,
        request: &PartSigning,
        ctx: &SignContext,
    ) -> Result<SignedOperation, SignError>;

    /// Best-effort deletion of a completed-or-partial object, including any
    /// in-progress multipart session or stray segment objects. Failures are
    /// logged and ignored; server-side garbage collection is the backstop.
    async fn destroy(&self, record: &UploadRecord, http: &reqwest::Client) -> bool;
}

/// Explicit provider registry, passed by value to whatever selects
/// residences. No module-level state.
#[derive(Default, Clone)]
pub struct SignerRegistry {
    map: BTreeMap<String, Arc<dyn Signer>>,
    order: Vec<String>,
}

impl SignerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, signer: Arc<dyn Signer>) {
        let name = signer.name().to_string();
        if !self.map.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.map.insert(name, signer);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Signer>> {
        self.map.get(name).cloned()
    }

    /// First registered residence, used when the application has no
    /// selection callback of its own
    pub fn default_residence(&self) -> Option<Arc<dyn Signer>> {
        self.order.first().and_then(|n| self.get(n))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

// Matches CGI.escape for the characters that appear in signatures and keys
// (space never occurs in base64/hex output).
const QUERY_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'*');

pub(crate) fn query_escape(s: &str) -> String {
    utf8_percent_encode(s, QUERY_ESCAPE).to_string()
}

/// Join ordered query parameters, `key` alone when the value is empty
pub(crate) fn join_params(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| {
            if v.is_empty() {
                k.clone()
            } else {
                format!("{k}={v}")
            }
        })
        .collect::<Vec<_>>()
        .join("&")
}

pub(crate) fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; 20] {
    let mut mac =
        Hmac::<sha1::Sha1>::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac =
        Hmac::<sha2::Sha256>::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// RFC 1123 date stamp used by provider canonical strings
pub(crate) fn httpdate(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_escape_matches_cgi_escape() {
        assert_eq!(query_escape("vjbyPxybdZaNmGa+yT272YEAiv4="), "vjbyPxybdZaNmGa%2ByT272YEAiv4%3D");
        assert_eq!(query_escape("a/b"), "a%2Fb");
        assert_eq!(query_escape("safe-chars_.*"), "safe-chars_.*");
    }

    #[test]
    fn test_join_params_empty_value_is_flag() {
        let params = vec![
            ("uploads".to_string(), String::new()),
            ("uploadId".to_string(), "abc".to_string()),
        ];
        assert_eq!(join_params(&params), "uploads&uploadId=abc");
    }

    #[test]
    fn test_part_id_display() {
        assert_eq!(PartId::Number(7).to_string(), "7");
        assert_eq!(PartId::Finish.to_string(), "finish");
    }

    #[test]
    fn test_operation_kind_wire_names() {
        let json = serde_json::to_string(&OperationKind::ChunkedUpload).unwrap();
        assert_eq!(json, "\"chunked_upload\"");
        let kind: OperationKind = serde_json::from_str("\"direct_upload\"").unwrap();
        assert_eq!(kind, OperationKind::DirectUpload);
    }

    #[test]
    fn test_registry_default_residence_is_first_registered() {
        // Uses a tiny fake signer; the real strategies have their own tests
        struct Fake(&'static str);

        #[async_trait]
        impl Signer for Fake {
            fn name(&self) -> &'static str {
                self.0
            }
            fn location(&self) -> String {
                "nowhere".into()
            }
            fn limits(&self) -> ProviderLimits {
                ProviderLimits::amazon_s3()
            }
            fn get_object(&self, _: &UploadSigning, _: &SignContext) -> Result<String, SignError> {
                Ok(String::new())
            }
            fn new_upload(
                &self,
                _: &UploadSigning,
                _: &SignContext,
            ) -> Result<SignedOperation, SignError> {
                Err(SignError::Unsupported {
                    provider: self.0,
                    operation: "new_upload",
                })
            }
            fn get_parts(
                &self,
                _: &PartListSigning,
                _: &SignContext,
            ) -> Result<SignedOperation, SignError> {
                Err(SignError::Unsupported {
                    provider: self.0,
                    operation: "get_parts",
                })
            }
            fn set_part(
                &self,
                _: &PartSigning,
                _: &SignContext,
            ) -> Result<SignedOperation, SignError> {
                Err(SignError::Unsupported {
                    provider: self.0,
                    operation: "set_part",
                })
            }
            async fn destroy(&self, _: &UploadRecord, _: &reqwest::Client) -> bool {
                true
            }
        }

        let mut registry = SignerRegistry::new();
        registry.register(Arc::new(Fake("B")));
        registry.register(Arc::new(Fake("A")));

        assert_eq!(registry.default_residence().unwrap().name(), "B");
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["B", "A"]);
    }
}
