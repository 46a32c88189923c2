//! Amazon S3 signing strategy
//!
//! Query-string authorization: HMAC-SHA1 over the S3 canonical string, the
//! base64 signature carried in `AWSAccessKeyId` / `Expires` / `Signature`
//! parameters. Also covers S3-compatible stores that honor the same scheme.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::BTreeMap;

use super::{
    hmac_sha1, join_params, query_escape, OperationKind, PartId, PartListSigning, PartSigning,
    Permissions, SignContext, SignError, SignedOperation, SignedRequest, Signer, UploadRecord,
    UploadSigning,
};
use crate::chunk::ProviderLimits;

pub struct AmazonS3 {
    access_id: String,
    secret_key: String,
    location: String,
    /// Scheme and host the signed URLs point at
    endpoint: String,
}

impl AmazonS3 {
    pub fn new(
        access_id: &str,
        secret_key: &str,
        location: Option<&str>,
    ) -> Result<Self, SignError> {
        if access_id.is_empty() {
            return Err(SignError::MissingCredential("Amazon Access ID".into()));
        }
        if secret_key.is_empty() {
            return Err(SignError::MissingCredential("Amazon Secret Key".into()));
        }

        let location = location.unwrap_or("us-east-1").to_string();
        let endpoint = if location == "us-east-1" {
            "https://s3.amazonaws.com".to_string()
        } else {
            format!("https://s3-{location}.amazonaws.com")
        };

        Ok(Self {
            access_id: access_id.to_string(),
            secret_key: secret_key.to_string(),
            location,
            endpoint,
        })
    }

    /// Point the strategy at an S3-compatible store instead of AWS.
    /// `endpoint` carries scheme and host, e.g. `https://minio.internal:9000`.
    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.trim_end_matches('/').to_string();
        self
    }

    /// Sign one request against the classic S3 canonical string:
    /// `VERB\nContent-MD5\nContent-Type\nExpires\n{x-amz-* sorted}\n/bucket/key?params`
    fn sign_request(
        &self,
        verb: &str,
        bucket: &str,
        key: &str,
        headers: BTreeMap<String, String>,
        params: &[(String, String)],
        content_md5: Option<&str>,
        ctx: &SignContext,
    ) -> SignedRequest {
        let expires = ctx.expires_epoch();
        let path = format!("/{bucket}/{key}");
        let query = join_params(params);

        let mut canonical = format!(
            "{verb}\n{md5}\n{ctype}\n{expires}\n",
            md5 = content_md5.unwrap_or(""),
            ctype = headers.get("Content-Type").map(String::as_str).unwrap_or(""),
        );
        // BTreeMap iteration keeps the amz headers sorted
        for (k, v) in &headers {
            if k.starts_with("x-amz-") {
                canonical.push_str(&format!("{k}:{v}\n"));
            }
        }
        canonical.push_str(&path);
        if !query.is_empty() {
            canonical.push('?');
            canonical.push_str(&query);
        }

        let signature = query_escape(&STANDARD.encode(hmac_sha1(
            self.secret_key.as_bytes(),
            canonical.as_bytes(),
        )));

        let joiner = if query.is_empty() {
            "?".to_string()
        } else {
            format!("?{query}&")
        };

        SignedRequest {
            verb: verb.to_string(),
            url: format!(
                "{endpoint}{path}{joiner}AWSAccessKeyId={id}&Expires={expires}&Signature={signature}",
                endpoint = self.endpoint,
                id = self.access_id,
            ),
            headers,
        }
    }

    fn acl_headers(options: &super::ObjectOptions) -> BTreeMap<String, String> {
        let mut headers = options.headers.clone();
        headers
            .entry("x-amz-acl".to_string())
            .or_insert_with(|| match options.permissions {
                Permissions::Public => "public-read".to_string(),
                Permissions::Private => "private".to_string(),
            });
        headers
    }
}

#[async_trait]
impl Signer for AmazonS3 {
    fn name(&self) -> &'static str {
        "AmazonS3"
    }

    fn location(&self) -> String {
        self.location.clone()
    }

    fn limits(&self) -> ProviderLimits {
        ProviderLimits::amazon_s3()
    }

    fn get_object(&self, request: &UploadSigning, ctx: &SignContext) -> Result<String, SignError> {
        let signed = self.sign_request(
            "GET",
            &request.bucket_name,
            &request.object_key,
            request.object_options.headers.clone(),
            &[],
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
        let mut headers = Self::acl_headers(&request.object_options);
        let limits = self.limits();

        if request.file_size > limits.direct_limit {
            // Multipart initiate; the content id does not apply here
            let params = vec![("uploads".to_string(), String::new())];
            let signed = self.sign_request(
                "POST",
                &request.bucket_name,
                &request.object_key,
                headers,
                &params,
                None,
                ctx,
            );
            Ok(SignedOperation::new(OperationKind::ChunkedUpload, signed))
        } else {
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
                &[],
                request.file_id.as_deref(),
                ctx,
            );
            Ok(SignedOperation::new(OperationKind::DirectUpload, signed))
        }
    }

    fn get_parts(
        &self,
        request: &PartListSigning,
        ctx: &SignContext,
    ) -> Result<SignedOperation, SignError> {
        let params = vec![("uploadId".to_string(), request.resumable_id.clone())];
        let signed = self.sign_request(
            "GET",
            &request.bucket_name,
            &request.object_key,
            request.object_options.headers.clone(),
            &params,
            None,
            ctx,
        );
        Ok(SignedOperation::new(OperationKind::Parts, signed))
    }

    fn set_part(
        &self,
        request: &PartSigning,
        ctx: &SignContext,
    ) -> Result<SignedOperation, SignError> {
        let mut headers = request.object_options.headers.clone();

        match request.part {
            PartId::Finish => {
                headers
                    .entry("Content-Type".to_string())
                    .or_insert_with(|| "application/xml; charset=UTF-8".to_string());
                let params = vec![("uploadId".to_string(), request.resumable_id.clone())];
                let signed = self.sign_request(
                    "POST",
                    &request.bucket_name,
                    &request.object_key,
                    headers,
                    &params,
                    None,
                    ctx,
                );
                Ok(SignedOperation::new(OperationKind::Finish, signed))
            }
            PartId::Number(n) => {
                if let Some(file_id) = &request.file_id {
                    headers
                        .entry("Content-Md5".to_string())
                        .or_insert_with(|| file_id.clone());
                }
                headers
                    .entry("Content-Type".to_string())
                    .or_insert_with(|| "binary/octet-stream".to_string());
                let params = vec![
                    ("partNumber".to_string(), n.to_string()),
                    ("uploadId".to_string(), request.resumable_id.clone()),
                ];
                let signed = self.sign_request(
                    "PUT",
                    &request.bucket_name,
                    &request.object_key,
                    headers,
                    &params,
                    request.file_id.as_deref(),
                    ctx,
                );
                Ok(SignedOperation::new(OperationKind::PartUpload, signed))
            }
        }
    }

    async fn destroy(&self, record: &UploadRecord, http: &reqwest::Client) -> bool {
        let ctx = SignContext::new();

        // Abort the multipart session first so the provider releases parts
        if record.resumable {
            if let Some(resumable_id) = &record.resumable_id {
                let params = vec![("uploadId".to_string(), resumable_id.clone())];
                let abort = self.sign_request(
                    "DELETE",
                    &record.bucket_name,
                    &record.object_key,
                    BTreeMap::new(),
                    &params,
                    None,
                    &ctx,
                );
                if let Err(e) = http.delete(&abort.url).send().await {
                    tracing::warn!(
                        upload_id = %record.upload_id,
                        error = %e,
                        "Multipart abort failed, continuing with object delete"
                    );
                }
            }
        }

        let delete = self.sign_request(
            "DELETE",
            &record.bucket_name,
            &record.object_key,
            BTreeMap::new(),
            &[],
            None,
            &ctx,
        );
        match http.delete(&delete.url).send().await {
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
    use crate::chunk::MIB;
    use chrono::TimeZone;

    fn s3() -> AmazonS3 {
        AmazonS3::new(
            "44CF9590006BF252F707",
            "OtxrzxIsfpFjA7SwPzILwy8Bw21TLhquhboDYROV",
            None,
        )
        .unwrap()
    }

    fn fixed_ctx() -> SignContext {
        // The reference expiry from the S3 developer guide signing example
        let expires = chrono::Utc.timestamp_opt(1141889120, 0).unwrap();
        SignContext::at(expires, expires)
    }

    fn upload(file_size: u64, file_id: Option<&str>) -> UploadSigning {
        UploadSigning {
            bucket_name: "quotes".into(),
            object_key: "nelson".into(),
            object_options: Default::default(),
            file_size,
            file_id: file_id.map(String::from),
        }
    }

    #[test]
    fn test_reference_get_object_signature() {
        let url = s3().get_object(&upload(100, None), &fixed_ctx()).unwrap();
        assert_eq!(
            url,
            "https://s3.amazonaws.com/quotes/nelson?AWSAccessKeyId=44CF9590006BF252F707&Expires=1141889120&Signature=vjbyPxybdZaNmGa%2ByT272YEAiv4%3D"
        );
    }

    #[test]
    fn test_signing_is_deterministic() {
        let ctx = fixed_ctx();
        let a = s3().new_upload(&upload(1024, Some("abc==")), &ctx).unwrap();
        let b = s3().new_upload(&upload(1024, Some("abc==")), &ctx).unwrap();
        assert_eq!(a.signature, b.signature);
    }

    #[test]
    fn test_small_file_signs_direct_put() {
        let op = s3()
            .new_upload(&upload(5 * MIB, Some("md5base64==")), &fixed_ctx())
            .unwrap();
        assert_eq!(op.kind, OperationKind::DirectUpload);
        let sig = op.signature.unwrap();
        assert_eq!(sig.verb, "PUT");
        assert_eq!(sig.headers.get("Content-Md5").unwrap(), "md5base64==");
        assert_eq!(sig.headers.get("Content-Type").unwrap(), "binary/octet-stream");
        assert_eq!(sig.headers.get("x-amz-acl").unwrap(), "private");
    }

    #[test]
    fn test_large_file_signs_multipart_initiate() {
        let op = s3()
            .new_upload(&upload(6 * MIB, Some("ignored")), &fixed_ctx())
            .unwrap();
        assert_eq!(op.kind, OperationKind::ChunkedUpload);
        let sig = op.signature.unwrap();
        assert_eq!(sig.verb, "POST");
        assert!(sig.url.contains("/quotes/nelson?uploads&AWSAccessKeyId="));
        assert!(!sig.headers.contains_key("Content-Md5"));
    }

    #[tokio::test]
    async fn test_destroy_aborts_session_then_deletes_object() {
        use wiremock::matchers::{method, path, query_param};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        // The multipart abort carries the transaction id, the object delete
        // does not; both must arrive exactly once
        Mock::given(method("DELETE"))
            .and(path("/quotes/nelson"))
            .and(query_param("uploadId", "tx-9"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/quotes/nelson"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let record = UploadRecord {
            upload_id: "42".into(),
            file_size: 20 * MIB,
            bucket_name: "quotes".into(),
            object_key: "nelson".into(),
            resumable: true,
            resumable_id: Some("tx-9".into()),
            part_list: vec![],
            provider_name: "AmazonS3".into(),
            provider_location: "us-east-1".into(),
        };
        let signer = s3().with_endpoint(&server.uri());
        assert!(signer.destroy(&record, &reqwest::Client::new()).await);
    }

    #[test]
    fn test_public_permission_sets_acl() {
        let mut req = upload(100, None);
        req.object_options.permissions = Permissions::Public;
        let op = s3().new_upload(&req, &fixed_ctx()).unwrap();
        let sig = op.signature.unwrap();
        assert_eq!(sig.headers.get("x-amz-acl").unwrap(), "public-read");
    }

    #[test]
    fn test_part_upload_parameters() {
        let op = s3()
            .set_part(
                &PartSigning {
                    bucket_name: "quotes".into(),
                    object_key: "nelson".into(),
                    object_options: Default::default(),
                    resumable_id: "UPLOAD123".into(),
                    part: PartId::Number(3),
                    file_size: 20 * MIB,
                    file_id: Some("partmd5==".into()),
                },
                &fixed_ctx(),
            )
            .unwrap();
        assert_eq!(op.kind, OperationKind::PartUpload);
        let sig = op.signature.unwrap();
        assert_eq!(sig.verb, "PUT");
        assert!(sig.url.contains("partNumber=3&uploadId=UPLOAD123&AWSAccessKeyId="));
    }

    #[test]
    fn test_finish_signs_commit_post() {
        let op = s3()
            .set_part(
                &PartSigning {
                    bucket_name: "quotes".into(),
                    object_key: "nelson".into(),
                    object_options: Default::default(),
                    resumable_id: "UPLOAD123".into(),
                    part: PartId::Finish,
                    file_size: 20 * MIB,
                    file_id: None,
                },
                &fixed_ctx(),
            )
            .unwrap();
        assert_eq!(op.kind, OperationKind::Finish);
        let sig = op.signature.unwrap();
        assert_eq!(sig.verb, "POST");
        assert_eq!(
            sig.headers.get("Content-Type").unwrap(),
            "application/xml; charset=UTF-8"
        );
        assert!(sig.url.contains("uploadId=UPLOAD123"));
    }

    #[test]
    fn test_get_parts_signs_listing() {
        let op = s3()
            .get_parts(
                &PartListSigning {
                    bucket_name: "quotes".into(),
                    object_key: "nelson".into(),
                    object_options: Default::default(),
                    file_size: 20 * MIB,
                    resumable_id: "UPLOAD123".into(),
                },
                &fixed_ctx(),
            )
            .unwrap();
        assert_eq!(op.kind, OperationKind::Parts);
        let sig = op.signature.unwrap();
        assert_eq!(sig.verb, "GET");
        assert!(sig.url.contains("uploadId=UPLOAD123"));
    }

    #[test]
    fn test_regional_endpoint() {
        let s3 = AmazonS3::new("id", "secret", Some("ap-southeast-1")).unwrap();
        let url = s3.get_object(&upload(1, None), &fixed_ctx()).unwrap();
        assert!(url.starts_with("https://s3-ap-southeast-1.amazonaws.com/"));
    }

    #[test]
    fn test_missing_credentials_rejected() {
        assert!(matches!(
            AmazonS3::new("", "secret", None),
            Err(SignError::MissingCredential(_))
        ));
    }
}
