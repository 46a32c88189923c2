//! OpenStack Swift / Rackspace Cloud Files signing strategy
//!
//! Temp URLs: HMAC-SHA1 hex digest of `VERB\nExpires\n/v1/account/container/object`
//! keyed by the account temp URL key, carried as `temp_url_sig` /
//! `temp_url_expires` query parameters. Large objects are uploaded as
//! `{key}/pNNN` segment objects and committed either as a dynamic large
//! object (`X-Object-Manifest` header) or a static large object
//! (`?multipart-manifest=put` JSON manifest).

use async_trait::async_trait;
use std::collections::BTreeMap;

use super::{
    hmac_sha1, query_escape, OperationKind, PartId, PartListSigning, PartSigning, SignContext,
    SignError, SignedOperation, SignedRequest, Signer, UploadRecord, UploadSigning,
};
use crate::chunk::{part_count, ProviderLimits};

/// How the finishing commit assembles the segments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LargeObjectMode {
    /// `X-Object-Manifest` header referencing the segment prefix
    #[default]
    Dynamic,
    /// Static large object JSON manifest
    Static,
}

pub struct OpenStackSwift {
    name: &'static str,
    host: String,
    /// The `/v1/{account}` storage account component
    storage_url: String,
    temp_url_key: String,
    mode: LargeObjectMode,
}

impl OpenStackSwift {
    pub fn new(
        host: &str,
        storage_url: &str,
        temp_url_key: &str,
        mode: LargeObjectMode,
    ) -> Result<Self, SignError> {
        if storage_url.is_empty() {
            return Err(SignError::MissingCredential("Swift Storage URL".into()));
        }
        if temp_url_key.is_empty() {
            return Err(SignError::MissingCredential("Swift Temp URL Key".into()));
        }
        Ok(Self {
            name: "OpenStackSwift",
            host: host.to_string(),
            storage_url: storage_url.to_string(),
            temp_url_key: temp_url_key.to_string(),
            mode,
        })
    }

    /// Rackspace Cloud Files preset: same temp URL scheme, region keyed
    /// storage endpoints.
    pub fn rackspace(
        location: &str,
        storage_url: &str,
        temp_url_key: &str,
    ) -> Result<Self, SignError> {
        let host = match location {
            "dfw" | "dallas" => "storage101.dfw1.clouddrive.com",
            "ord" | "chicago" => "storage101.ord1.clouddrive.com",
            other => other,
        };
        let mut swift = Self::new(host, storage_url, temp_url_key, LargeObjectMode::Dynamic)?;
        swift.name = "RackspaceCloudFiles";
        Ok(swift)
    }

    /// Segment suffix `/pNNN`, zero padded to the digit count of the nominal
    /// part total so segment names sort in upload order.
    fn part_suffix(&self, file_size: u64, part_number: u32) -> String {
        let limits = self.limits();
        let width = part_count(file_size, limits.default_chunk_size)
            .to_string()
            .len();
        format!("/p{part_number:0width$}")
    }

    /// Sign a temp URL. `object` must already be escaped (segment suffixes
    /// are appended raw).
    fn sign_request(
        &self,
        verb: &str,
        container: &str,
        object: &str,
        headers: BTreeMap<String, String>,
        extra_query: &str,
        ctx: &SignContext,
    ) -> SignedRequest {
        let expires = ctx.expires_epoch();
        let path = format!(
            "/v1/{}/{}/{object}",
            self.storage_url,
            query_escape(container),
        );

        let canonical = format!("{verb}\n{expires}\n{path}");
        let signature = hex::encode(hmac_sha1(
            self.temp_url_key.as_bytes(),
            canonical.as_bytes(),
        ));

        SignedRequest {
            verb: verb.to_string(),
            url: format!(
                "https://{host}{path}?temp_url_sig={signature}&temp_url_expires={expires}{extra_query}",
                host = self.host,
            ),
            headers,
        }
    }
}

#[async_trait]
impl Signer for OpenStackSwift {
    fn name(&self) -> &'static str {
        self.name
    }

    fn location(&self) -> String {
        self.host.clone()
    }

    fn limits(&self) -> ProviderLimits {
        ProviderLimits::openstack_swift()
    }

    fn get_object(&self, request: &UploadSigning, ctx: &SignContext) -> Result<String, SignError> {
        let signed = self.sign_request(
            "GET",
            &request.bucket_name,
            &query_escape(&request.object_key),
            request.object_options.headers.clone(),
            "",
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
        if let Some(file_id) = &request.file_id {
            // Swift checks the hex md5 against the ETag on write
            headers
                .entry("ETag".to_string())
                .or_insert_with(|| file_id.clone());
        }
        headers
            .entry("Content-Type".to_string())
            .or_insert_with(|| "binary/octet-stream".to_string());

        let limits = self.limits();
        if request.file_size > limits.direct_limit {
            let object = format!(
                "{}{}",
                query_escape(&request.object_key),
                self.part_suffix(request.file_size, 1),
            );
            let signed = self.sign_request("PUT", &request.bucket_name, &object, headers, "", ctx);
            let mut op = SignedOperation::new(OperationKind::ChunkedUpload, signed);
            op.current_part = Some(1);
            op.path = Some(format!("{}/{object}", query_escape(&request.bucket_name)));
            Ok(op)
        } else {
            let signed = self.sign_request(
                "PUT",
                &request.bucket_name,
                &query_escape(&request.object_key),
                headers,
                "",
                ctx,
            );
            Ok(SignedOperation::new(OperationKind::DirectUpload, signed))
        }
    }

    fn get_parts(
        &self,
        request: &PartListSigning,
        _ctx: &SignContext,
    ) -> Result<SignedOperation, SignError> {
        // Segments are independent PUTs; the resumable id is the part cursor
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
            PartId::Finish => match self.mode {
                LargeObjectMode::Dynamic => {
                    headers.insert(
                        "X-Object-Manifest".to_string(),
                        format!("{}/{}/p", request.bucket_name, request.object_key),
                    );
                    let signed = self.sign_request(
                        "PUT",
                        &request.bucket_name,
                        &query_escape(&request.object_key),
                        headers,
                        "",
                        ctx,
                    );
                    Ok(SignedOperation::new(OperationKind::Finish, signed))
                }
                LargeObjectMode::Static => {
                    if let Some(file_id) = &request.file_id {
                        headers
                            .entry("ETag".to_string())
                            .or_insert_with(|| file_id.clone());
                    }
                    headers.insert("Content-Type".to_string(), "application/json".to_string());
                    let signed = self.sign_request(
                        "PUT",
                        &request.bucket_name,
                        &query_escape(&request.object_key),
                        headers,
                        "&multipart-manifest=put",
                        ctx,
                    );
                    Ok(SignedOperation::new(OperationKind::Finish, signed))
                }
            },
            PartId::Number(n) => {
                if let Some(file_id) = &request.file_id {
                    headers
                        .entry("ETag".to_string())
                        .or_insert_with(|| file_id.clone());
                }
                headers.insert("Content-Type".to_string(), "binary/octet-stream".to_string());
                let object = format!(
                    "{}{}",
                    query_escape(&request.object_key),
                    self.part_suffix(request.file_size, n),
                );
                let signed =
                    self.sign_request("PUT", &request.bucket_name, &object, headers, "", ctx);
                let mut op = SignedOperation::new(OperationKind::PartUpload, signed);
                op.path = Some(format!("{}/{object}", query_escape(&request.bucket_name)));
                Ok(op)
            }
        }
    }

    async fn destroy(&self, record: &UploadRecord, http: &reqwest::Client) -> bool {
        let ctx = SignContext::new();
        let mut ok = true;

        if record.resumable {
            // No multipart abort in Swift: delete every segment object the
            // upload could have created so far.
            let segments = part_count(record.file_size, self.limits().default_chunk_size)
                .min(self.limits().max_parts) as u32;
            for part in 1..=segments {
                let object = format!(
                    "{}{}",
                    query_escape(&record.object_key),
                    self.part_suffix(record.file_size, part),
                );
                let signed = self.sign_request(
                    "DELETE",
                    &record.bucket_name,
                    &object,
                    BTreeMap::new(),
                    "",
                    &ctx,
                );
                match http.delete(&signed.url).send().await {
                    Ok(resp) if resp.status().is_success() || resp.status().as_u16() == 404 => {}
                    Ok(resp) => {
                        tracing::warn!(
                            upload_id = %record.upload_id,
                            part,
                            status = resp.status().as_u16(),
                            "Segment delete failed"
                        );
                        ok = false;
                    }
                    Err(e) => {
                        tracing::warn!(upload_id = %record.upload_id, part, error = %e, "Segment delete failed");
                        ok = false;
                    }
                }
            }
        }

        // The manifest object when resumable, the object itself otherwise
        let signed = self.sign_request(
            "DELETE",
            &record.bucket_name,
            &query_escape(&record.object_key),
            BTreeMap::new(),
            "",
            &ctx,
        );
        match http.delete(&signed.url).send().await {
            Ok(resp) => ok && (resp.status().is_success() || resp.status().as_u16() == 404),
            Err(e) => {
                tracing::warn!(upload_id = %record.upload_id, error = %e, "Object delete failed");
                false
            }
        }
    }
}
