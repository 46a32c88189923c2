//! Google Cloud Storage signing strategy
//!
//! Interoperable API v1: HMAC-SHA1 with a shared secret, `x-goog-*` headers
//! folded into the canonical string for mutating verbs, query authorization
//! via `GoogleAccessId` / `Expires` / `Signature` on the virtual-host URL.
//! Only direct uploads are signed; the interoperable API has no CORS-safe
//! resumable flow.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::BTreeMap;

use super::{
    hmac_sha1, httpdate, query_escape, OperationKind, PartListSigning, PartSigning, Permissions,
    SignContext, SignError, SignedOperation, SignedRequest, Signer, UploadRecord, UploadSigning,
};
use crate::chunk::ProviderLimits;

pub struct GoogleCloudStorage {
    access_id: String,
    secret_key: String,
    location: String,
}

impl GoogleCloudStorage {
    pub fn new(
        access_id: &str,
        secret_key: &str,
        location: Option<&str>,
    ) -> Result<Self, SignError> {
        if access_id.is_empty() {
            return Err(SignError::MissingCredential("Google Access ID".into()));
        }
        if secret_key.is_empty() {
            return Err(SignError::MissingCredential("Google Secret Key".into()));
        }

        Ok(Self {
            access_id: access_id.to_string(),
            secret_key: secret_key.to_string(),
            // US or Europe; fixed at bucket creation time
            location: location.unwrap_or("na").to_string(),
        })
    }

    fn sign_request(
        &self,
        verb: &str,
        bucket: &str,
        key: &str,
        mut headers: BTreeMap<String, String>,
        content_md5: Option<&str>,
        ctx: &SignContext,
    ) -> SignedRequest {
        let expires = ctx.expires_epoch();
        let path = format!("/{key}");

        let mut canonical = format!(
            "{verb}\n{md5}\n{ctype}\n{expires}\n",
            md5 = content_md5.unwrap_or(""),
            ctype = headers.get("Content-Type").map(String::as_str).unwrap_or(""),
        );
        if verb != "GET" {
            headers.insert("x-goog-date".to_string(), httpdate(ctx.now));
            for (k, v) in &headers {
                if k.starts_with("x-goog-") {
                    canonical.push_str(&format!("{k}:{v}\n"));
                }
            }
        }
        canonical.push_str(&format!("/{bucket}{path}"));

        let signature = STANDARD.encode(hmac_sha1(
            self.secret_key.as_bytes(),
            canonical.as_bytes(),
        ));

        let url = format!(
            "https://{bucket}.storage.googleapis.com{path}?GoogleAccessId={id}&Expires={expires}&Signature={sig}",
            id = self.access_id,
            sig = query_escape(&signature),
        );
        headers.insert(
            "Authorization".to_string(),
            format!("GOOG1 {}:{}", self.access_id, signature),
        );

        SignedRequest {
            verb: verb.to_string(),
            url,
            headers,
        }
    }
}

#[async_trait]
impl Signer for GoogleCloudStorage {
    fn name(&self) -> &'static str {
        "GoogleCloudStorage"
    }

    fn location(&self) -> String {
        self.location.clone()
    }

    fn limits(&self) -> ProviderLimits {
        ProviderLimits::google_cloud()
    }

    fn get_object(&self, request: &UploadSigning, ctx: &SignContext) -> Result<String, SignError> {
        let signed = self.sign_request(
            "GET",
            &request.bucket_name,
            &request.object_key,
            request.object_options.headers.clone(),
            None,
            ctx,
        );
        Ok(signed.url)
    }

    fn new_upload(
        &self,
        request: &UploadSigning,
        ctx: &SignContext,
    ) -> Result<SignedOperation, SignError> {
        let mut headers = request.object_options.headers.clone();
        headers.insert("x-goog-api-version".to_string(), "2".to_string());
        headers
            .entry("x-goog-acl".to_string())
            .or_insert_with(|| match request.object_options.permissions {
                Permissions::Public => "public-read".to_string(),
                Permissions::Private => "private".to_string(),
            });
        if let Some(file_id) = &request.file_id {
            headers
                .entry("Content-Md5".to_string())
                .or_insert_with(|| file_id.clone());
        }
        headers
            .entry("Content-Type".to_string())
            .or_insert_with(|| "binary/octet-stream".to_string());

        let signed = self.sign_request(
            "PUT",
            &request.bucket_name,
            &request.object_key,
            headers,
            request.file_id.as_deref(),
            ctx,
        );
        Ok(SignedOperation::new(OperationKind::DirectUpload, signed))
    }

    fn get_parts(
        &self,
        _request: &PartListSigning,
        _ctx: &SignContext,
    ) -> Result<SignedOperation, SignError> {
        Err(SignError::Unsupported {
            provider: "GoogleCloudStorage",
            operation: "get_parts",
        })
    }

    fn set_part(
        &self,
        _request: &PartSigning,
        _ctx: &SignContext,
    ) -> Result<SignedOperation, SignError> {
        Err(SignError::Unsupported {
            provider: "GoogleCloudStorage",
            operation: "set_part",
        })
    }

    async fn destroy(&self, record: &UploadRecord, http: &reqwest::Client) -> bool {
        let ctx = SignContext::new();
        let signed = self.sign_request(
            "DELETE",
            &record.bucket_name,
            &record.object_key,
            BTreeMap::new(),
            None,
            &ctx,
        );
        match http.delete(&signed.url).send().await {
            Ok(resp) => resp.status().is_success() || resp.status().as_u16() == 404,
            Err(e) => {
                tracing::warn!(upload_id = %record.upload_id, error = %e, "Object delete failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn gcs() -> GoogleCloudStorage {
        GoogleCloudStorage::new("GOOGTEST", "secret", None).unwrap()
    }

    fn fixed_ctx() -> SignContext {
        let now = chrono::Utc.timestamp_opt(1141889000, 0).unwrap();
        let expires = chrono::Utc.timestamp_opt(1141889120, 0).unwrap();
        SignContext::at(now, expires)
    }

    fn upload(file_id: Option<&str>) -> UploadSigning {
        UploadSigning {
            bucket_name: "bucket".into(),
            object_key: "object.bin".into(),
            object_options: Default::default(),
            file_size: 1024,
            file_id: file_id.map(String::from),
        }
    }

    #[test]
    fn test_always_direct_upload() {
        let op = gcs().new_upload(&upload(Some("md5==")), &fixed_ctx()).unwrap();
        assert_eq!(op.kind, OperationKind::DirectUpload);
        let sig = op.signature.unwrap();
        assert_eq!(sig.verb, "PUT");
        assert!(sig
            .url
            .starts_with("https://bucket.storage.googleapis.com/object.bin?GoogleAccessId=GOOGTEST&Expires=1141889120&Signature="));
    }

    #[test]
    fn test_goog_headers_and_authorization() {
        let op = gcs().new_upload(&upload(None), &fixed_ctx()).unwrap();
        let sig = op.signature.unwrap();
        assert_eq!(sig.headers.get("x-goog-api-version").unwrap(), "2");
        assert_eq!(sig.headers.get("x-goog-acl").unwrap(), "private");
        assert_eq!(
            sig.headers.get("x-goog-date").unwrap(),
            &httpdate(fixed_ctx().now)
        );
        assert!(sig.headers.get("Authorization").unwrap().starts_with("GOOG1 GOOGTEST:"));
    }

    #[test]
    fn test_get_object_omits_goog_date() {
        let url = gcs().get_object(&upload(None), &fixed_ctx()).unwrap();
        assert!(url.contains("GoogleAccessId=GOOGTEST"));
    }

    #[test]
    fn test_signing_is_deterministic() {
        let ctx = fixed_ctx();
        let a = gcs().new_upload(&upload(Some("x")), &ctx).unwrap();
        let b = gcs().new_upload(&upload(Some("x")), &ctx).unwrap();
        assert_eq!(a.signature, b.signature);
    }

    #[test]
    fn test_resumable_operations_unsupported() {
        let result = gcs().get_parts(
            &PartListSigning {
                bucket_name: "bucket".into(),
                object_key: "object".into(),
                object_options: Default::default(),
                file_size: 1,
                resumable_id: "1".into(),
            },
            &fixed_ctx(),
        );
        assert!(matches!(result, Err(SignError::Unsupported { .. })));
    }
}
