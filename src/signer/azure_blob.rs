//! Microsoft Azure blob signing strategy
//!
//! Shared-access signatures (service SAS, version 2015-04-05) scoped to a
//! single blob. Block uploads append `comp=block&blockid=`, the commit
//! appends `comp=blocklist`. Block ids are the base64 of the zero-padded
//! 6-digit part number.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};

use super::{
    hmac_sha256, query_escape, OperationKind, PartId, PartListSigning, PartSigning, SignContext,
    SignError, SignedOperation, SignedRequest, Signer, UploadRecord, UploadSigning,
};
use crate::chunk::ProviderLimits;

/// SAS version this strategy emits
const SAS_VERSION: &str = "2015-04-05";

pub struct MicrosoftAzure {
    account_name: String,
    access_key: Vec<u8>,
    blob_host: String,
}

impl MicrosoftAzure {
    pub fn new(
        account_name: &str,
        access_key: &str,
        blob_host: Option<&str>,
    ) -> Result<Self, SignError> {
        if account_name.is_empty() {
            return Err(SignError::MissingCredential("Azure Account Name".into()));
        }
        if access_key.is_empty() {
            return Err(SignError::MissingCredential("Azure Access Key".into()));
        }
        let access_key = STANDARD
            .decode(access_key)
            .map_err(|_| SignError::InvalidCredential("Azure Access Key is not base64".into()))?;

        let blob_host = blob_host
            .map(String::from)
            .unwrap_or_else(|| format!("https://{account_name}.blob.core.windows.net"));

        Ok(Self {
            account_name: account_name.to_string(),
            access_key,
            blob_host,
        })
    }

    /// Base64 block id for a part, zero-padded to 6 digits
    pub fn block_id(part_number: u32) -> String {
        STANDARD.encode(format!("{part_number:06}"))
    }

    /// Service SAS over a single blob resource
    fn signed_url(&self, permission: &str, bucket: &str, key: &str, ctx: &SignContext) -> String {
        let expiry = ctx.expires.format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let canonical_resource = format!("/blob/{}/{bucket}/{key}", self.account_name);

        // signedpermissions, signedstart, signedexpiry, canonicalizedresource,
        // signedidentifier, signedIP, signedProtocol, signedversion, then the
        // five response header overrides, all newline separated.
        let string_to_sign = format!(
            "{permission}\n\n{expiry}\n{canonical_resource}\n\n\n\n{SAS_VERSION}\n\n\n\n\n"
        );

        let signature = STANDARD.encode(hmac_sha256(&self.access_key, string_to_sign.as_bytes()));

        format!(
            "{host}/{bucket}/{key}?sv={SAS_VERSION}&sr=b&sp={permission}&se={se}&sig={sig}",
            host = self.blob_host,
            se = query_escape(&expiry),
            sig = query_escape(&signature),
        )
    }
}

#[async_trait]
impl Signer for MicrosoftAzure {
    fn name(&self) -> &'static str {
        "MicrosoftAzure"
    }

    fn location(&self) -> String {
        self.blob_host.clone()
    }

    fn limits(&self) -> ProviderLimits {
        ProviderLimits::azure_blob()
    }

    fn get_object(&self, request: &UploadSigning, ctx: &SignContext) -> Result<String, SignError> {
        Ok(self.signed_url("r", &request.bucket_name, &request.object_key, ctx))
    }

    fn new_upload(
        &self,
        request: &UploadSigning,
        ctx: &SignContext,
    ) -> Result<SignedOperation, SignError> {
        let mut headers = request.object_options.headers.clone();
        headers.insert("x-ms-blob-type".to_string(), "BlockBlob".to_string());

        let limits = self.limits();
        if request.file_size > limits.direct_limit {
            // Chunked: the first block is written through the block API, so
            // the create signature already carries `comp=block`.
            let url = format!(
                "{}&comp=block&blockid={}",
                self.signed_url("w", &request.bucket_name, &request.object_key, ctx),
                query_escape(&Self::block_id(1)),
            );
            let mut op = SignedOperation::new(
                OperationKind::ChunkedUpload,
                SignedRequest {
                    verb: "PUT".to_string(),
                    url,
                    headers,
                },
            );
            op.current_part = Some(1);
            Ok(op)
        } else {
            if let Some(file_id) = &request.file_id {
                headers
                    .entry("Content-Md5".to_string())
                    .or_insert_with(|| file_id.clone());
            }
            let url = self.signed_url("w", &request.bucket_name, &request.object_key, ctx);
            Ok(SignedOperation::new(
                OperationKind::DirectUpload,
                SignedRequest {
                    verb: "PUT".to_string(),
                    url,
                    headers,
                },
            ))
        }
    }

    fn get_parts(
        &self,
        request: &PartListSigning,
        _ctx: &SignContext,
    ) -> Result<SignedOperation, SignError> {
        // No provider round-trip needed: the recorded resumable id is the
        // block cursor.
        let mut op = SignedOperation::unsigned(OperationKind::Parts);
        op.current_part = request.resumable_id.parse().ok();
        Ok(op)
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
                let url = format!(
                    "{}&comp=blocklist",
                    self.signed_url("w", &request.bucket_name, &request.object_key, ctx),
                );
                Ok(SignedOperation::new(
                    OperationKind::Finish,
                    SignedRequest {
                        verb: "PUT".to_string(),
                        url,
                        headers,
                    },
                ))
            }
            PartId::Number(n) => {
                headers.insert("x-ms-blob-type".to_string(), "BlockBlob".to_string());
                if let Some(file_id) = &request.file_id {
                    headers
                        .entry("Content-Md5".to_string())
                        .or_insert_with(|| file_id.clone());
                }
                let url = format!(
                    "{}&comp=block&blockid={}",
                    self.signed_url("w", &request.bucket_name, &request.object_key, ctx),
                    query_escape(&Self::block_id(n)),
                );
                Ok(SignedOperation::new(
                    OperationKind::PartUpload,
                    SignedRequest {
                        verb: "PUT".to_string(),
                        url,
                        headers,
                    },
                ))
            }
        }
    }

    async fn destroy(&self, record: &UploadRecord, http: &reqwest::Client) -> bool {
        let ctx = SignContext::new();
        let url = self.signed_url("d", &record.bucket_name, &record.object_key, &ctx);
        match http.delete(&url).send().await {
            Ok(resp) => resp.status().is_success() || resp.status().as_u16() == 404,
            Err(e) => {
                tracing::warn!(upload_id = %record.upload_id, error = %e, "Blob delete failed");
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

    fn azure() -> MicrosoftAzure {
        // base64 of "0123456789abcdef"
        MicrosoftAzure::new("testaccount", "MDEyMzQ1Njc4OWFiY2RlZg==", None).unwrap()
    }

    fn fixed_ctx() -> SignContext {
        let now = chrono::Utc.timestamp_opt(1400000000, 0).unwrap();
        let expires = chrono::Utc.timestamp_opt(1400000300, 0).unwrap();
        SignContext::at(now, expires)
    }

    fn upload(file_size: u64) -> UploadSigning {
        UploadSigning {
            bucket_name: "container".into(),
            object_key: "blob.bin".into(),
            object_options: Default::default(),
            file_size,
            file_id: Some("md5base64==".into()),
        }
    }

    #[test]
    fn test_block_id_is_padded_base64() {
        assert_eq!(MicrosoftAzure::block_id(1), STANDARD.encode("000001"));
        assert_eq!(MicrosoftAzure::block_id(99999), STANDARD.encode("099999"));
    }

    #[test]
    fn test_key_must_be_base64() {
        assert!(matches!(
            MicrosoftAzure::new("acct", "not base64!!!", None),
            Err(SignError::InvalidCredential(_))
        ));
    }

    #[test]
    fn test_direct_upload_below_threshold() {
        let op = azure().new_upload(&upload(MIB), &fixed_ctx()).unwrap();
        assert_eq!(op.kind, OperationKind::DirectUpload);
        let sig = op.signature.unwrap();
        assert_eq!(sig.headers.get("x-ms-blob-type").unwrap(), "BlockBlob");
        assert_eq!(sig.headers.get("Content-Md5").unwrap(), "md5base64==");
        assert!(sig.url.starts_with(
            "https://testaccount.blob.core.windows.net/container/blob.bin?sv=2015-04-05&sr=b&sp=w&se=2014-05-13T16%3A58%3A20Z&sig="
        ));
    }

    #[test]
    fn test_chunked_create_carries_first_block() {
        let op = azure().new_upload(&upload(10 * MIB), &fixed_ctx()).unwrap();
        assert_eq!(op.kind, OperationKind::ChunkedUpload);
        assert_eq!(op.current_part, Some(1));
        let sig = op.signature.unwrap();
        assert!(sig.url.contains("&comp=block&blockid="));
    }

    #[test]
    fn test_part_and_commit_urls() {
        let part = azure()
            .set_part(
                &PartSigning {
                    bucket_name: "container".into(),
                    object_key: "blob.bin".into(),
                    object_options: Default::default(),
                    resumable_id: "2".into(),
                    part: PartId::Number(2),
                    file_size: 10 * MIB,
                    file_id: None,
                },
                &fixed_ctx(),
            )
            .unwrap();
        let sig = part.signature.unwrap();
        assert!(sig
            .url
            .contains(&format!("comp=block&blockid={}", query_escape(&MicrosoftAzure::block_id(2)))));

        let finish = azure()
            .set_part(
                &PartSigning {
                    bucket_name: "container".into(),
                    object_key: "blob.bin".into(),
                    object_options: Default::default(),
                    resumable_id: "2".into(),
                    part: PartId::Finish,
                    file_size: 10 * MIB,
                    file_id: None,
                },
                &fixed_ctx(),
            )
            .unwrap();
        assert_eq!(finish.kind, OperationKind::Finish);
        let sig = finish.signature.unwrap();
        assert!(sig.url.ends_with("&comp=blocklist"));
        assert_eq!(
            sig.headers.get("Content-Type").unwrap(),
            "application/xml; charset=UTF-8"
        );
    }

    #[test]
    fn test_get_parts_returns_cursor() {
        let op = azure()
            .get_parts(
                &PartListSigning {
                    bucket_name: "container".into(),
                    object_key: "blob.bin".into(),
                    object_options: Default::default(),
                    file_size: 10 * MIB,
                    resumable_id: "4".into(),
                },
                &fixed_ctx(),
            )
            .unwrap();
        assert_eq!(op.kind, OperationKind::Parts);
        assert_eq!(op.current_part, Some(4));
        assert!(op.signature.is_none());
    }
}
