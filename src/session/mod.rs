//! Upload orchestration
//!
//! Drives one file from negotiation to completion: hash, authorize, stream,
//! report, finish. The session owns the state machine; the authorization
//! client, hasher and transport are collaborators it sequences.
//!
//! Two chunk protocols cover every provider. An initiated session (S3-style)
//! opens a provider-side multipart transaction and commits it with a
//! manifest of part receipts. A segmented put (Swift, Azure) uploads each
//! part as its own addressable object and stitches them together at the end.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiError, AuthorizationClient, UpdateParams};
use crate::chunk::{self, ProviderLimits};
use crate::hash::{ContentId, HashError, HashService};
use crate::manifest;
use crate::signer::{OperationKind, PartId, SignedOperation, SignedRequest};
use crate::transport::{BodySource, ProgressFn, Transport, TransportError};

/// Lifecycle of an upload session.
///
/// `Started` covers negotiation before any provider byte moves; `Uploading`
/// begins with the first provider request. They are distinct so a pause
/// during negotiation can discard the half-built strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Started,
    Uploading,
    Paused,
    Completed,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Aborted)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Pending => "pending",
            SessionState::Started => "started",
            SessionState::Uploading => "uploading",
            SessionState::Paused => "paused",
            SessionState::Completed => "completed",
            SessionState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Wire encoding of a part's content id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentIdFormat {
    Base64,
    Hex,
}

impl ContentIdFormat {
    fn encode(&self, id: &ContentId) -> String {
        match self {
            ContentIdFormat::Base64 => id.to_base64(),
            ContentIdFormat::Hex => id.to_hex(),
        }
    }
}

/// How parts reach the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkProtocol {
    /// Provider-side multipart transaction, committed with part receipts
    InitiatedSession,
    /// Each part is its own object, stitched by a manifest or block list
    SegmentedPut,
}

/// Completion document a chunked upload ends with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    S3CompleteXml,
    AzureBlockList,
    /// Dynamic or static, decided by the finishing signature
    SwiftManifest,
}

/// Everything the session needs to know about a provider
#[derive(Debug, Clone, Copy)]
pub struct ProviderProfile {
    pub limits: ProviderLimits,
    pub protocol: ChunkProtocol,
    pub content_id_format: ContentIdFormat,
    pub manifest: Option<ManifestKind>,
}

impl ProviderProfile {
    pub fn amazon_s3() -> Self {
        Self {
            limits: ProviderLimits::amazon_s3(),
            protocol: ChunkProtocol::InitiatedSession,
            content_id_format: ContentIdFormat::Base64,
            manifest: Some(ManifestKind::S3CompleteXml),
        }
    }

    pub fn google_cloud() -> Self {
        Self {
            limits: ProviderLimits::google_cloud(),
            protocol: ChunkProtocol::InitiatedSession,
            content_id_format: ContentIdFormat::Base64,
            manifest: None,
        }
    }

    pub fn azure_blob() -> Self {
        Self {
            limits: ProviderLimits::azure_blob(),
            protocol: ChunkProtocol::SegmentedPut,
            content_id_format: ContentIdFormat::Base64,
            manifest: Some(ManifestKind::AzureBlockList),
        }
    }

    pub fn openstack_swift() -> Self {
        Self {
            limits: ProviderLimits::openstack_swift(),
            protocol: ChunkProtocol::SegmentedPut,
            content_id_format: ContentIdFormat::Hex,
            manifest: Some(ManifestKind::SwiftManifest),
        }
    }
}

/// Maps a residence name from the authorization service to its profile
#[derive(Clone)]
pub struct ProfileRegistry {
    map: std::collections::BTreeMap<String, ProviderProfile>,
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        let mut map = std::collections::BTreeMap::new();
        map.insert("AmazonS3".to_string(), ProviderProfile::amazon_s3());
        map.insert(
            "GoogleCloudStorage".to_string(),
            ProviderProfile::google_cloud(),
        );
        map.insert("MicrosoftAzure".to_string(), ProviderProfile::azure_blob());
        map.insert(
            "OpenStackSwift".to_string(),
            ProviderProfile::openstack_swift(),
        );
        map.insert(
            "RackspaceCloudFiles".to_string(),
            ProviderProfile::openstack_swift(),
        );
        Self { map }
    }
}

impl ProfileRegistry {
    pub fn get(&self, residence: &str) -> Option<ProviderProfile> {
        self.map.get(residence).copied()
    }

    pub fn insert(&mut self, residence: impl Into<String>, profile: ProviderProfile) {
        self.map.insert(residence.into(), profile);
    }
}

/// The file a session uploads
#[derive(Debug, Clone)]
pub struct UploadDescriptor {
    pub file_name: String,
    pub file_size: u64,
    /// Remote sub-path under the bucket, when the application wants one
    pub file_path: Option<String>,
    /// Local source
    pub source: PathBuf,
}

/// Session failures surfaced to the caller. Transient conditions are not
/// errors; they leave the session paused with a reason instead.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The file can never be uploaded to this residence
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The authorization service refused the request
    #[error("Not authorized: {0}")]
    Authorization(String),

    /// The service or provider answered outside the protocol
    #[error("Protocol violation: {0}")]
    Protocol(String),
}

/// One confirmed (or at least hashed) part
#[derive(Debug, Clone)]
struct PartRecord {
    part_number: u32,
    content_id: ContentId,
    /// Provider receipt for initiated sessions, hex digest for segments
    etag: String,
    /// Provider-side segment path when the protocol reports one
    path: Option<String>,
}

#[derive(Debug, Clone)]
struct ChunkedState {
    chunk_size: u64,
    resumable_id: Option<String>,
    parts: Vec<PartRecord>,
}

impl ChunkedState {
    fn record(&mut self, part: PartRecord) {
        self.parts.retain(|p| p.part_number != part.part_number);
        self.parts.push(part);
        self.parts.sort_by_key(|p| p.part_number);
    }

    fn get(&self, part_number: u32) -> Option<&PartRecord> {
        self.parts.iter().find(|p| p.part_number == part_number)
    }

    /// Highest contiguously completed part; uploads are sequential
    fn last_part(&self) -> u32 {
        self.parts.last().map(|p| p.part_number).unwrap_or(0)
    }

    /// Whether this state is enough to continue without renegotiating.
    /// An initiated session needs the provider transaction id; a segmented
    /// put only needs its part records.
    fn resumable(&self, protocol: ChunkProtocol) -> bool {
        match protocol {
            ChunkProtocol::InitiatedSession => self.resumable_id.is_some(),
            ChunkProtocol::SegmentedPut => true,
        }
    }
}

#[derive(Debug, Clone)]
enum Strategy {
    /// `finalising` is set once the provider has the last byte; a resume
    /// then only has to retry the completion report.
    Direct { finalising: bool },
    Chunked(ChunkedState),
}

struct Cell {
    state: SessionState,
    reason: Option<String>,
    error: bool,
    pausing: bool,
    strategy: Option<Strategy>,
    cancel: CancellationToken,
}

/// Control flow inside one attempt: either the attempt stops at some state
/// (pause, abort, transient failure already recorded) or it fails for good.
enum Step {
    Halted(SessionState),
    Fatal(SessionError),
}

type Attempt<T> = Result<T, Step>;

/// One file's journey to one provider
pub struct UploadSession {
    api: AuthorizationClient,
    transport: Arc<dyn Transport>,
    hasher: Arc<dyn HashService>,
    profile: ProviderProfile,
    descriptor: UploadDescriptor,
    cell: parking_lot::Mutex<Cell>,
    progress: Arc<AtomicU64>,
    on_progress: Option<ProgressFn>,
}

impl UploadSession {
    pub fn new(
        api: AuthorizationClient,
        transport: Arc<dyn Transport>,
        hasher: Arc<dyn HashService>,
        profile: ProviderProfile,
        descriptor: UploadDescriptor,
    ) -> Self {
        Self {
            api,
            transport,
            hasher,
            profile,
            descriptor,
            cell: parking_lot::Mutex::new(Cell {
                state: SessionState::Pending,
                reason: None,
                error: false,
                pausing: false,
                strategy: None,
                cancel: CancellationToken::new(),
            }),
            progress: Arc::new(AtomicU64::new(0)),
            on_progress: None,
        }
    }

    /// Register a byte-level progress observer
    pub fn with_progress(mut self, observer: ProgressFn) -> Self {
        self.on_progress = Some(observer);
        self
    }

    pub fn state(&self) -> SessionState {
        self.cell.lock().state
    }

    /// Failure reason from the last pause, if any
    pub fn reason(&self) -> Option<String> {
        self.cell.lock().reason.clone()
    }

    /// Whether the last pause was a failure rather than a user request
    pub fn is_error(&self) -> bool {
        self.cell.lock().error
    }

    pub fn progress_bytes(&self) -> u64 {
        self.progress.load(Ordering::Relaxed)
    }

    pub fn upload_id(&self) -> Option<String> {
        self.api.upload_id()
    }

    pub fn descriptor(&self) -> &UploadDescriptor {
        &self.descriptor
    }

    /// Start or resume the upload. Runs until the file completes, the
    /// session pauses (user request or transient failure) or a fatal error
    /// ends it. Safe to call again after any pause.
    #[tracing::instrument(name = "session.start", skip(self), fields(file = %self.descriptor.file_name))]
    pub async fn start(&self) -> Result<SessionState, SessionError> {
        let cancel = {
            let mut cell = self.cell.lock();
            match cell.state {
                SessionState::Pending | SessionState::Paused => {}
                other => return Ok(other),
            }
            cell.state = SessionState::Started;
            cell.reason = None;
            cell.error = false;
            cell.pausing = false;
            cell.cancel = CancellationToken::new();
            cell.cancel.clone()
        };

        match self.attempt(&cancel).await {
            Ok(state) => Ok(state),
            Err(Step::Halted(state)) => Ok(state),
            Err(Step::Fatal(err)) => Err(err),
        }
    }

    /// Pause the upload. During negotiation the strategy is discarded so the
    /// next start renegotiates from scratch; during transfer the resume
    /// state is kept. Idempotent.
    pub fn pause(&self, reason: Option<&str>) {
        let mut cell = self.cell.lock();
        match cell.state {
            SessionState::Uploading => {
                cell.pausing = true;
                cell.state = SessionState::Paused;
                cell.reason = reason.map(str::to_string);
                // A half-sent direct transfer has no resumable offset
                if matches!(cell.strategy, Some(Strategy::Direct { finalising: false })) {
                    cell.strategy = None;
                    self.progress.store(0, Ordering::Relaxed);
                }
                cell.cancel.cancel();
            }
            SessionState::Pending | SessionState::Started => {
                cell.pausing = true;
                cell.state = SessionState::Paused;
                cell.reason = reason.map(str::to_string);
                cell.strategy = None;
                cell.cancel.cancel();
            }
            _ => {}
        }
    }

    /// Abort the upload and tear down the server-side record. Terminal.
    /// Record destruction is best effort; the service garbage-collects
    /// whatever slips through.
    #[tracing::instrument(name = "session.abort", skip(self, reason))]
    pub async fn abort(&self, reason: Option<&str>) {
        let old_state = {
            let mut cell = self.cell.lock();
            if cell.state.is_terminal() {
                return;
            }
            let old = cell.state;
            cell.state = SessionState::Aborted;
            cell.reason = reason.map(str::to_string);
            cell.cancel.cancel();
            old
        };

        let transferring =
            matches!(old_state, SessionState::Uploading | SessionState::Paused);
        if transferring && self.api.upload_id().is_some() {
            // The cancelled request may still hold the single-flight slot
            for _ in 0..20 {
                match self.api.destroy().await {
                    Ok(()) => return,
                    Err(ApiError::RequestInProgress) => {
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "Could not destroy upload record");
                        return;
                    }
                }
            }
            tracing::warn!("Gave up destroying upload record");
        }
    }

    async fn attempt(&self, cancel: &CancellationToken) -> Attempt<SessionState> {
        // A strategy that survived a pause picks up from its own records;
        // the service already holds the upload, so no new create call.
        let stored = self.cell.lock().strategy.clone();
        match stored {
            Some(Strategy::Direct { finalising: true }) => {
                self.enter_uploading(Strategy::Direct { finalising: true });
                self.set_progress(self.descriptor.file_size);
                return self.complete(cancel).await;
            }
            Some(Strategy::Chunked(mut state)) if state.resumable(self.profile.protocol) => {
                return self.resume_from_records(&mut state, cancel).await;
            }
            _ => {}
        }

        let file_size = self.descriptor.file_size;
        let limits = self.profile.limits;

        let chunk_size = match chunk::plan_chunk_size(file_size, &limits) {
            Ok(size) => size,
            Err(err) => {
                let mut cell = self.cell.lock();
                cell.state = SessionState::Aborted;
                cell.error = true;
                cell.reason = Some(err.to_string());
                return Err(Step::Fatal(SessionError::Validation(err.to_string())));
            }
        };

        let first_range = if file_size <= limits.direct_limit {
            0..file_size
        } else {
            0..chunk_size.min(file_size)
        };
        let first_id = self.hash(first_range.clone(), cancel).await?;
        let file_id = self.profile.content_id_format.encode(&first_id);

        let created = self
            .api
            .create(Some(file_id.clone()), cancel)
            .await
            .map_err(|e| self.api_fail(e))?;

        match created.operation.kind {
            OperationKind::DirectUpload => {
                self.run_direct(created.operation, first_id, cancel).await
            }
            OperationKind::ChunkedUpload => {
                let mut chunked = ChunkedState {
                    chunk_size,
                    resumable_id: None,
                    parts: Vec::new(),
                };
                match self.profile.protocol {
                    ChunkProtocol::InitiatedSession => {
                        self.run_initiated(created.operation, first_id, &mut chunked, cancel)
                            .await
                    }
                    ChunkProtocol::SegmentedPut => {
                        self.run_segmented(
                            Some((created.operation, first_id)),
                            1,
                            &mut chunked,
                            cancel,
                        )
                        .await
                    }
                }
            }
            OperationKind::Parts => self.resume(created.operation, chunk_size, cancel).await,
            other => Err(Step::Fatal(SessionError::Protocol(format!(
                "unexpected opening operation {other:?}"
            )))),
        }
    }

    /// Single-request upload of the whole file
    async fn run_direct(
        &self,
        operation: SignedOperation,
        content_id: ContentId,
        cancel: &CancellationToken,
    ) -> Attempt<SessionState> {
        self.enter_uploading(Strategy::Direct { finalising: false });

        let mut signature = self.require_signature(&operation)?;
        let body = BodySource::FileRange {
            path: self.descriptor.source.clone(),
            range: 0..self.descriptor.file_size,
        };

        let mut renewed = false;
        loop {
            let result = self
                .transport
                .execute(&signature, body.clone(), Some(self.progress_fn(0)), cancel)
                .await;
            match result {
                Ok(_) => break,
                Err(TransportError::SignatureExpired) if !renewed => {
                    renewed = true;
                    let file_id = self.profile.content_id_format.encode(&content_id);
                    let fresh = self
                        .api
                        .create(Some(file_id), cancel)
                        .await
                        .map_err(|e| self.api_fail(e))?;
                    signature = self.require_signature(&fresh.operation)?;
                }
                Err(err) => return Err(self.transport_fail(err)),
            }
        }

        {
            let mut cell = self.cell.lock();
            if !cell.state.is_terminal() {
                cell.strategy = Some(Strategy::Direct { finalising: true });
            }
        }
        self.set_progress(self.descriptor.file_size);
        self.complete(cancel).await
    }

    /// S3-style multipart: initiate, stream parts into the transaction,
    /// commit with the accumulated part receipts.
    async fn run_initiated(
        &self,
        operation: SignedOperation,
        first_id: ContentId,
        chunked: &mut ChunkedState,
        cancel: &CancellationToken,
    ) -> Attempt<SessionState> {
        self.enter_uploading(Strategy::Chunked(chunked.clone()));

        let initiate = self.require_signature(&operation)?;
        let response = self
            .transport
            .execute(&initiate, BodySource::Empty, None, cancel)
            .await
            .map_err(|e| self.transport_fail(e))?;
        let body = String::from_utf8_lossy(&response.body).to_string();
        let resumable_id = manifest::s3::parse_upload_id(&body)
            .map_err(|e| Step::Fatal(SessionError::Protocol(e.to_string())))?;
        chunked.resumable_id = Some(resumable_id.clone());
        self.store_strategy(chunked);

        // Registering the transaction id yields the first part's signature
        let file_id = self.profile.content_id_format.encode(&first_id);
        let first_op = self
            .api
            .update(
                &UpdateParams {
                    resumable_id: Some(resumable_id),
                    part: Some("1".to_string()),
                    file_id: Some(file_id),
                },
                cancel,
            )
            .await
            .map_err(|e| self.api_fail(e))?
            .ok_or_else(|| {
                Step::Fatal(SessionError::Protocol(
                    "service dropped the part signature".to_string(),
                ))
            })?;

        self.drive_initiated_parts(1, Some((first_op, first_id)), chunked, cancel)
            .await
    }

    /// Upload parts `from..=count` of an initiated session, then commit
    async fn drive_initiated_parts(
        &self,
        from: u32,
        mut pending: Option<(SignedOperation, ContentId)>,
        chunked: &mut ChunkedState,
        cancel: &CancellationToken,
    ) -> Attempt<SessionState> {
        let file_size = self.descriptor.file_size;
        let count = chunk::part_count(file_size, chunked.chunk_size) as u32;

        for part_number in from..=count {
            let range = chunk::part_range(part_number, chunked.chunk_size, file_size);
            let (operation, content_id) = match pending.take() {
                Some(ready) => ready,
                None => {
                    let content_id = match chunked.get(part_number) {
                        Some(record) => record.content_id.clone(),
                        None => self.hash(range.clone(), cancel).await?,
                    };
                    let encoded = self.profile.content_id_format.encode(&content_id);
                    let operation = self
                        .api
                        .edit(&PartId::Number(part_number), Some(&encoded), cancel)
                        .await
                        .map_err(|e| self.api_fail(e))?;
                    (operation, content_id)
                }
            };

            let signature = self.require_signature(&operation)?;
            let response = self
                .execute_part(&signature, range.clone(), part_number, chunked, cancel)
                .await?;

            let etag = response
                .headers
                .get("etag")
                .map(|raw| manifest::strip_etag_quotes(raw))
                .unwrap_or_else(|| content_id.to_hex());
            chunked.record(PartRecord {
                part_number,
                content_id,
                etag,
                path: None,
            });
            self.store_strategy(chunked);
            self.set_progress(range.end);
        }

        self.finish_initiated(chunked, cancel).await
    }

    async fn finish_initiated(
        &self,
        chunked: &mut ChunkedState,
        cancel: &CancellationToken,
    ) -> Attempt<SessionState> {
        let finish = self
            .api
            .edit(&PartId::Finish, None, cancel)
            .await
            .map_err(|e| self.api_fail(e))?;
        let signature = self.require_signature(&finish)?;

        let etags: Vec<String> = chunked.parts.iter().map(|p| p.etag.clone()).collect();
        let body = manifest::s3::complete_multipart_xml(&etags);

        self.transport
            .execute(
                &signature,
                BodySource::Bytes(body.into()),
                None,
                cancel,
            )
            .await
            .map_err(|e| self.transport_fail(e))?;

        self.complete(cancel).await
    }

    /// Swift/Azure: each part is its own object. When `pending` is set the
    /// signature for part `from` is already in hand; otherwise each part's
    /// signature is requested through `update`.
    async fn run_segmented(
        &self,
        mut pending: Option<(SignedOperation, ContentId)>,
        from: u32,
        chunked: &mut ChunkedState,
        cancel: &CancellationToken,
    ) -> Attempt<SessionState> {
        self.enter_uploading(Strategy::Chunked(chunked.clone()));

        let file_size = self.descriptor.file_size;
        let count = chunk::part_count(file_size, chunked.chunk_size) as u32;

        for part_number in from..=count {
            let range = chunk::part_range(part_number, chunked.chunk_size, file_size);
            let (operation, content_id) = match pending.take() {
                Some(ready) => ready,
                None => {
                    let content_id = match chunked.get(part_number) {
                        Some(record) => record.content_id.clone(),
                        None => self.hash(range.clone(), cancel).await?,
                    };
                    let encoded = self.profile.content_id_format.encode(&content_id);
                    let operation = self
                        .api
                        .update(
                            &UpdateParams {
                                resumable_id: Some(part_number.to_string()),
                                part: Some(part_number.to_string()),
                                file_id: Some(encoded),
                            },
                            cancel,
                        )
                        .await
                        .map_err(|e| self.api_fail(e))?
                        .ok_or_else(|| {
                            Step::Fatal(SessionError::Protocol(
                                "service dropped the part signature".to_string(),
                            ))
                        })?;
                    (operation, content_id)
                }
            };

            let path = operation.path.clone();
            let signature = self.require_signature(&operation)?;
            self.execute_part(&signature, range.clone(), part_number, chunked, cancel)
                .await?;

            let etag = content_id.to_hex();
            chunked.record(PartRecord {
                part_number,
                content_id,
                etag,
                path,
            });
            self.store_strategy(chunked);
            self.set_progress(range.end);
        }

        self.finish_segmented(chunked, cancel).await
    }

    async fn finish_segmented(
        &self,
        chunked: &mut ChunkedState,
        cancel: &CancellationToken,
    ) -> Attempt<SessionState> {
        let finish = self
            .api
            .edit(&PartId::Finish, None, cancel)
            .await
            .map_err(|e| self.api_fail(e))?;
        let signature = self.require_signature(&finish)?;

        let body = match self.profile.manifest {
            Some(ManifestKind::AzureBlockList) => {
                let count =
                    chunk::part_count(self.descriptor.file_size, chunked.chunk_size) as u32;
                BodySource::Bytes(manifest::azure::block_list_xml(count).into())
            }
            Some(ManifestKind::SwiftManifest) => {
                // A dynamic manifest is an empty put whose headers point at
                // the segment prefix; a static one lists every segment.
                if signature.headers.contains_key("X-Object-Manifest") {
                    BodySource::Empty
                } else {
                    let entries = self.slo_entries(chunked, cancel).await?;
                    BodySource::Bytes(manifest::swift::slo_manifest(&entries).into())
                }
            }
            Some(ManifestKind::S3CompleteXml) | None => {
                return Err(Step::Fatal(SessionError::Protocol(
                    "segmented upload has no segment manifest".to_string(),
                )))
            }
        };

        self.transport
            .execute(&signature, body, None, cancel)
            .await
            .map_err(|e| self.transport_fail(e))?;

        self.complete(cancel).await
    }

    /// Build static-manifest entries for every part. Parts uploaded by an
    /// earlier process have no local record; those ranges are re-hashed and
    /// their segment paths derived from a recorded sibling.
    async fn slo_entries(
        &self,
        chunked: &mut ChunkedState,
        cancel: &CancellationToken,
    ) -> Attempt<Vec<manifest::swift::SegmentEntry>> {
        let file_size = self.descriptor.file_size;
        let count = chunk::part_count(file_size, chunked.chunk_size) as u32;
        let sample = chunked
            .parts
            .iter()
            .find_map(|p| p.path.as_ref().map(|path| (p.part_number, path.clone())));

        let mut entries = Vec::with_capacity(count as usize);
        for part_number in 1..=count {
            let range = chunk::part_range(part_number, chunked.chunk_size, file_size);
            let (etag, path) = match chunked.get(part_number) {
                Some(record) => (record.etag.clone(), record.path.clone()),
                None => {
                    let content_id = self.hash(range.clone(), cancel).await?;
                    (content_id.to_hex(), None)
                }
            };
            let path = match path {
                Some(path) => path,
                None => sample
                    .as_ref()
                    .and_then(|(_, sample)| derive_segment_path(sample, part_number))
                    .ok_or_else(|| {
                        Step::Fatal(SessionError::Protocol(format!(
                            "no segment path known for part {part_number}"
                        )))
                    })?,
            };
            entries.push(manifest::swift::SegmentEntry {
                path,
                etag: Some(etag),
                size_bytes: range.end - range.start,
            });
        }
        Ok(entries)
    }

    /// Continue a chunked upload from the part records kept across a pause.
    /// Part signatures are renewed one at a time through `edit`/`update`.
    async fn resume_from_records(
        &self,
        chunked: &mut ChunkedState,
        cancel: &CancellationToken,
    ) -> Attempt<SessionState> {
        let last = chunked.last_part();
        self.enter_uploading(Strategy::Chunked(chunked.clone()));
        if last > 0 {
            let done = chunk::part_range(last, chunked.chunk_size, self.descriptor.file_size);
            self.set_progress(done.end);
        }

        match self.profile.protocol {
            ChunkProtocol::InitiatedSession => {
                self.drive_initiated_parts(last + 1, None, chunked, cancel)
                    .await
            }
            ChunkProtocol::SegmentedPut => {
                self.run_segmented(None, last + 1, chunked, cancel).await
            }
        }
    }

    /// Pick up an interrupted upload from the service's resume state
    async fn resume(
        &self,
        operation: SignedOperation,
        chunk_size: u64,
        cancel: &CancellationToken,
    ) -> Attempt<SessionState> {
        let mut chunked = match self.cell.lock().strategy.clone() {
            Some(Strategy::Chunked(state)) => state,
            _ => ChunkedState {
                chunk_size,
                resumable_id: None,
                parts: Vec::new(),
            },
        };

        match self.profile.protocol {
            ChunkProtocol::InitiatedSession => {
                self.enter_uploading(Strategy::Chunked(chunked.clone()));

                // The signed listing is the provider's truth about which
                // parts actually arrived
                let listing = self.require_signature(&operation)?;
                let response = self
                    .transport
                    .execute(&listing, BodySource::Empty, None, cancel)
                    .await
                    .map_err(|e| self.transport_fail(e))?;
                let body = String::from_utf8_lossy(&response.body).to_string();
                let (last_received, etags) = manifest::s3::parse_list_parts(&body)
                    .map_err(|e| Step::Fatal(SessionError::Protocol(e.to_string())))?;

                for (index, etag) in etags.into_iter().enumerate() {
                    let part_number = index as u32 + 1;
                    let range =
                        chunk::part_range(part_number, chunked.chunk_size, self.descriptor.file_size);
                    if chunked.get(part_number).is_none() {
                        // Receipt without a local record; the digest is only
                        // needed if this part is ever retried
                        let content_id = self.hash(range, cancel).await?;
                        chunked.record(PartRecord {
                            part_number,
                            content_id,
                            etag,
                            path: None,
                        });
                    }
                }
                self.set_progress(
                    (last_received as u64 * chunked.chunk_size).min(self.descriptor.file_size),
                );
                self.store_strategy(&chunked);

                self.drive_initiated_parts(last_received + 1, None, &mut chunked, cancel)
                    .await
            }
            ChunkProtocol::SegmentedPut => {
                // The cursor names the first part the provider has not
                // confirmed; it is re-uploaded whole
                let current = operation.current_part.unwrap_or(1);
                self.enter_uploading(Strategy::Chunked(chunked.clone()));
                if current > 1 {
                    let done =
                        chunk::part_range(current - 1, chunked.chunk_size, self.descriptor.file_size);
                    self.set_progress(done.end);
                }

                let range = chunk::part_range(current, chunked.chunk_size, self.descriptor.file_size);
                let content_id = match chunked.get(current) {
                    Some(record) => record.content_id.clone(),
                    None => self.hash(range, cancel).await?,
                };
                let encoded = self.profile.content_id_format.encode(&content_id);
                let op = self
                    .api
                    .update(
                        &UpdateParams {
                            resumable_id: Some(current.to_string()),
                            part: Some(current.to_string()),
                            file_id: Some(encoded),
                        },
                        cancel,
                    )
                    .await
                    .map_err(|e| self.api_fail(e))?
                    .ok_or_else(|| {
                        Step::Fatal(SessionError::Protocol(
                            "service dropped the part signature".to_string(),
                        ))
                    })?;

                self.run_segmented(Some((op, content_id)), current, &mut chunked, cancel)
                    .await
            }
        }
    }

    /// Execute one part upload, renewing an expired signature once without
    /// re-hashing the part.
    async fn execute_part(
        &self,
        signature: &SignedRequest,
        range: std::ops::Range<u64>,
        part_number: u32,
        chunked: &ChunkedState,
        cancel: &CancellationToken,
    ) -> Attempt<crate::transport::TransportResponse> {
        let body = BodySource::FileRange {
            path: self.descriptor.source.clone(),
            range: range.clone(),
        };
        let progress = self.progress_fn(range.start);

        match self
            .transport
            .execute(signature, body.clone(), Some(progress.clone()), cancel)
            .await
        {
            Ok(response) => Ok(response),
            Err(TransportError::SignatureExpired) => {
                tracing::info!(part = part_number, "Renewing expired part signature");
                let fresh = self
                    .renew_part_signature(part_number, chunked, cancel)
                    .await?;
                self.transport
                    .execute(&fresh, body, Some(progress), cancel)
                    .await
                    .map_err(|e| self.transport_fail(e))
            }
            Err(err) => Err(self.transport_fail(err)),
        }
    }

    async fn renew_part_signature(
        &self,
        part_number: u32,
        chunked: &ChunkedState,
        cancel: &CancellationToken,
    ) -> Attempt<SignedRequest> {
        let encoded = chunked
            .get(part_number)
            .map(|record| self.profile.content_id_format.encode(&record.content_id));
        let operation = match self.profile.protocol {
            ChunkProtocol::InitiatedSession => self
                .api
                .edit(&PartId::Number(part_number), encoded.as_deref(), cancel)
                .await
                .map_err(|e| self.api_fail(e))?,
            ChunkProtocol::SegmentedPut => self
                .api
                .update(
                    &UpdateParams {
                        resumable_id: Some(part_number.to_string()),
                        part: Some(part_number.to_string()),
                        file_id: encoded,
                    },
                    cancel,
                )
                .await
                .map_err(|e| self.api_fail(e))?
                .ok_or_else(|| {
                    Step::Fatal(SessionError::Protocol(
                        "service dropped the part signature".to_string(),
                    ))
                })?,
        };
        self.require_signature(&operation)
    }

    /// Tell the service the provider has everything
    async fn complete(&self, cancel: &CancellationToken) -> Attempt<SessionState> {
        let follow_up = self
            .api
            .update(&UpdateParams::default(), cancel)
            .await
            .map_err(|e| self.api_fail(e))?;
        if follow_up.is_some() {
            return Err(Step::Fatal(SessionError::Protocol(
                "service answered completion with another operation".to_string(),
            )));
        }

        let mut cell = self.cell.lock();
        cell.state = SessionState::Completed;
        cell.strategy = None;
        drop(cell);
        self.set_progress(self.descriptor.file_size);
        tracing::info!(file = %self.descriptor.file_name, "Upload completed");
        Ok(SessionState::Completed)
    }

    async fn hash(
        &self,
        range: std::ops::Range<u64>,
        cancel: &CancellationToken,
    ) -> Attempt<ContentId> {
        self.hasher
            .hash_range(&self.descriptor.source, range, cancel)
            .await
            .map_err(|err| match err {
                HashError::Cancelled => Step::Halted(self.state()),
                HashError::IoError(e) => {
                    let reason = format!("cannot read source file: {e}");
                    self.mark_failed(&reason);
                    Step::Fatal(SessionError::Validation(reason))
                }
                HashError::InvalidRange { .. } => {
                    Step::Fatal(SessionError::Protocol(err.to_string()))
                }
            })
    }

    fn enter_uploading(&self, strategy: Strategy) {
        let mut cell = self.cell.lock();
        if cell.state == SessionState::Started {
            cell.state = SessionState::Uploading;
        }
        cell.strategy = Some(strategy);
    }

    fn store_strategy(&self, chunked: &ChunkedState) {
        let mut cell = self.cell.lock();
        if !cell.state.is_terminal() {
            cell.strategy = Some(Strategy::Chunked(chunked.clone()));
        }
    }

    fn require_signature(&self, operation: &SignedOperation) -> Attempt<SignedRequest> {
        operation.signature.clone().ok_or_else(|| {
            Step::Fatal(SessionError::Protocol(format!(
                "operation {:?} arrived without a signature",
                operation.kind
            )))
        })
    }

    /// A failure pauses the session unless the user already asked for the
    /// pause, in which case it is not an error at all.
    fn mark_failed(&self, reason: &str) {
        let mut cell = self.cell.lock();
        if cell.pausing || cell.state.is_terminal() {
            return;
        }
        cell.state = SessionState::Paused;
        cell.error = true;
        cell.reason = Some(reason.to_string());
        if matches!(cell.strategy, Some(Strategy::Direct { finalising: false })) {
            cell.strategy = None;
            self.progress.store(0, Ordering::Relaxed);
        }
    }

    fn api_fail(&self, err: ApiError) -> Step {
        match err {
            ApiError::Aborted => Step::Halted(self.state()),
            ApiError::Network(_) => {
                self.mark_failed(&err.to_string());
                Step::Halted(self.state())
            }
            ApiError::Status { status } if (500..=599).contains(&status) => {
                self.mark_failed(&err.to_string());
                Step::Halted(self.state())
            }
            ApiError::NotAcceptable { .. } | ApiError::Status { .. } => {
                let reason = err.to_string();
                self.mark_failed(&reason);
                Step::Fatal(SessionError::Authorization(reason))
            }
            ApiError::Decode(_) | ApiError::RequestInProgress | ApiError::NoUploadRecord => {
                Step::Fatal(SessionError::Protocol(err.to_string()))
            }
        }
    }

    fn transport_fail(&self, err: TransportError) -> Step {
        match err {
            TransportError::Aborted => Step::Halted(self.state()),
            TransportError::SignatureExpired => {
                // Renewal already failed once; treat as transient
                self.mark_failed("signed URL expired twice");
                Step::Halted(self.state())
            }
            other => {
                self.mark_failed(&other.to_string());
                Step::Halted(self.state())
            }
        }
    }

    fn progress_fn(&self, base: u64) -> ProgressFn {
        let total = self.progress.clone();
        let observer = self.on_progress.clone();
        Arc::new(move |sent| {
            let value = base + sent;
            total.store(value, Ordering::Relaxed);
            if let Some(cb) = &observer {
                cb(value);
            }
        })
    }

    fn set_progress(&self, value: u64) {
        self.progress.store(value, Ordering::Relaxed);
        if let Some(cb) = &self.on_progress {
            cb(value);
        }
    }
}

/// Rewrite the numeric suffix of a sibling segment path for another part,
/// keeping the zero padding width.
fn derive_segment_path(sample: &str, part_number: u32) -> Option<String> {
    let digits = sample
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .count();
    if digits == 0 {
        return None;
    }
    let prefix = &sample[..sample.len() - digits];
    Some(format!("{prefix}{part_number:0digits$}"))
}
