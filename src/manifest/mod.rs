//! Provider completion manifests
//!
//! The structures that list completed parts and commit a multipart upload,
//! plus the parsers for the provider XML the client reads back (multipart
//! initiation and part listings).

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Malformed provider XML: {0}")]
    Xml(#[from] quick_xml::DeError),

    #[error("Missing field in provider response: {0}")]
    MissingField(&'static str),
}

/// Providers quote ETags in their XML; the quotes must not survive reuse
pub fn strip_etag_quotes(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}

pub mod s3 {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct InitiateResult {
        #[serde(rename = "UploadId")]
        upload_id: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    struct ListPartsResult {
        #[serde(rename = "NextPartNumberMarker", default)]
        next_part_number_marker: u32,
        #[serde(rename = "Part", default)]
        parts: Vec<ListedPart>,
    }

    #[derive(Debug, Deserialize)]
    struct ListedPart {
        #[serde(rename = "ETag")]
        etag: String,
    }

    /// Session id from an `InitiateMultipartUploadResult` document
    pub fn parse_upload_id(body: &str) -> Result<String, ManifestError> {
        let parsed: InitiateResult = quick_xml::de::from_str(body)?;
        parsed
            .upload_id
            .ok_or(ManifestError::MissingField("UploadId"))
    }

    /// Part cursor and quote-stripped ETags from a `ListParts` document
    pub fn parse_list_parts(body: &str) -> Result<(u32, Vec<String>), ManifestError> {
        let parsed: ListPartsResult = quick_xml::de::from_str(body)?;
        let etags = parsed
            .parts
            .iter()
            .map(|p| strip_etag_quotes(&p.etag))
            .collect();
        Ok((parsed.next_part_number_marker, etags))
    }

    /// `CompleteMultipartUpload` document from the ordered part ETags
    pub fn complete_multipart_xml(etags: &[String]) -> String {
        let mut xml = String::from("<CompleteMultipartUpload>");
        for (i, etag) in etags.iter().enumerate() {
            xml.push_str(&format!(
                "<Part><PartNumber>{}</PartNumber><ETag>\"{}\"</ETag></Part>",
                i + 1,
                etag
            ));
        }
        xml.push_str("</CompleteMultipartUpload>");
        xml
    }
}

pub mod azure {
    use crate::signer::MicrosoftAzure;

    /// `BlockList` commit document for blocks `1..=count`
    pub fn block_list_xml(count: u32) -> String {
        let mut xml =
            String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>");
        for part in 1..=count {
            xml.push_str(&format!(
                "<Latest>{}</Latest>",
                MicrosoftAzure::block_id(part)
            ));
        }
        xml.push_str("</BlockList>");
        xml
    }
}

pub mod swift {
    use super::*;

    /// One static-large-object segment
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SegmentEntry {
        pub path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub etag: Option<String>,
        pub size_bytes: u64,
    }

    /// Static large object manifest, ordered by part number
    pub fn slo_manifest(segments: &[SegmentEntry]) -> String {
        // Serialization of a Vec of plain structs cannot fail
        serde_json::to_string(segments).unwrap_or_default()
    }
}
