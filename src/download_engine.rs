//! Download engine (C8): the per-file state machine that locates holders of
//! a `file_id`, fetches its segment containers, verifies each one, and
//! reassembles the original file.
//!
//! Grounded in `upload_engine.rs`'s shape (same field layout, same
//! register-then-submit-to-the-task-controller lifecycle, same
//! peer-ranking/semaphore-bounded dispatch loop) but driven in reverse:
//! where the upload engine splits and encrypts, this engine decrypts and
//! reconstructs; where it sends, this one fetches.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use libp2p::PeerId;
use rand::{thread_rng, Rng};
use tokio::sync::{broadcast, Mutex, RwLock, Semaphore};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::container::{types, Container};
use crate::crypto::{cipher, ecdsa, script, shamir};
use crate::dispatcher::PubSubDispatcher;
use crate::error::{MeshError, MeshResult};
use crate::hashcodec::{self, compact_unmarshal};
use crate::keys::OwnerKey;
use crate::model::{
    DownloadFileMeta, DownloadFileRecord, DownloadFileStatus, DownloadSegmentRecord, SegmentStatus,
    SliceTable,
};
use crate::network::SegmentFetchRequest;
use crate::network_actor::NetworkHandle;
use crate::pubsub::{self, SearchRequest};
use crate::quorum::PeerRegistry;
use crate::store::Store;
use crate::task_controller::{TaskController, TaskPriority};

/// How long the locate step waits between would-be retries of the search
/// window; the total wait is this times `task_controller.retry_times`
/// (§4.8: "wait up to max_retries × retry_interval").
const SEARCH_RETRY_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// `s1`. If absent, `new_download` tries to recover it from a local
    /// `UploadFileRecord` for the same `file_id` (downloading one's own
    /// upload never requires an externally-supplied share).
    pub first_key_share: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct DownloadEvent {
    pub task_id: String,
    pub status: DownloadFileStatus,
    pub message: Option<String>,
}

#[derive(Clone)]
pub struct DownloadEngine {
    store: Arc<Store>,
    config: Arc<Config>,
    controller: Arc<TaskController>,
    network: NetworkHandle,
    dispatcher: Arc<PubSubDispatcher>,
    peers: PeerRegistry,
    owner: Arc<OwnerKey>,
    host_id: String,
    events: broadcast::Sender<DownloadEvent>,
    /// Holder peer ids learned per task from search responses. Not
    /// persisted: lost on restart, at which point `ensure_holders` simply
    /// re-runs the locate step.
    holders: Arc<RwLock<HashMap<String, Vec<PeerId>>>>,
    /// Serializes the assembly step across every task on this node so a
    /// file is written to `download_root` at most once (P8).
    assembly_lock: Arc<Mutex<()>>,
}

impl DownloadEngine {
    pub fn new(
        store: Arc<Store>,
        config: Arc<Config>,
        controller: Arc<TaskController>,
        network: NetworkHandle,
        dispatcher: Arc<PubSubDispatcher>,
        peers: PeerRegistry,
        owner: Arc<OwnerKey>,
    ) -> Self {
        let host_id = hex::encode(ecdsa::pubkey_hash(owner.pair.public_key()));
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            config,
            controller,
            network,
            dispatcher,
            peers,
            owner,
            host_id,
            events,
            holders: Arc::new(RwLock::new(HashMap::new())),
            assembly_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    fn emit(&self, task_id: &str, status: DownloadFileStatus, message: Option<String>) {
        let _ = self.events.send(DownloadEvent {
            task_id: task_id.to_string(),
            status,
            message,
        });
    }

    /// Register a download and return its `task_id`. Resumes an existing
    /// task for `file_id` if one is already tracked.
    pub fn new_download(&self, file_id: &str, opts: DownloadOptions) -> MeshResult<String> {
        if let Some(existing) = self.store.kv.find_download_file_by_file_id(file_id)? {
            return Ok(existing.task_id);
        }

        let first_key_share = match opts.first_key_share {
            Some(share) => share,
            None => self
                .store
                .kv
                .list_upload_files()?
                .into_iter()
                .find(|f| f.file_id == file_id)
                .map(|f| f.first_key_share)
                .ok_or_else(|| {
                    MeshError::Config(
                        "no first_key_share supplied and no local upload of this file found"
                            .to_string(),
                    )
                })?,
        };

        let task_id = generate_task_id(&self.owner);
        let record = DownloadFileRecord {
            task_id: task_id.clone(),
            file_id: file_id.to_string(),
            status: DownloadFileStatus::Pending,
            file_meta: None,
            slice_table: Vec::new(),
            first_key_share,
            third_key_share: Vec::new(),
            pubkey_hash: [0u8; 20],
            started_at: 0,
            error_message: None,
        };
        self.store.kv.upsert_download_file(&record)?;
        Ok(task_id)
    }

    pub async fn start(&self, task_id: &str) -> MeshResult<()> {
        let engine = self.clone();
        let task_id_owned = task_id.to_string();
        let handler: crate::task_controller::TaskHandler = Arc::new(move || {
            let engine = engine.clone();
            let task_id = task_id_owned.clone();
            Box::pin(async move { engine.run_download(&task_id).await })
        });
        self.controller
            .submit(task_id, TaskPriority::Normal, handler)
            .await
    }

    pub async fn pause(&self, task_id: &str) -> MeshResult<()> {
        self.set_status(task_id, DownloadFileStatus::Paused).await
    }

    pub async fn resume(&self, task_id: &str) -> MeshResult<()> {
        self.set_status(task_id, DownloadFileStatus::Downloading).await?;
        self.start(task_id).await
    }

    pub async fn cancel(&self, task_id: &str) -> MeshResult<()> {
        let _ = self.controller.cancel(task_id).await;
        self.set_status(task_id, DownloadFileStatus::Cancelled).await
    }

    pub fn query(&self, task_id: &str) -> MeshResult<Option<DownloadFileRecord>> {
        self.store.kv.get_download_file(task_id)
    }

    async fn set_status(&self, task_id: &str, status: DownloadFileStatus) -> MeshResult<()> {
        let mut patch = self
            .store
            .kv
            .get_download_file(task_id)?
            .ok_or_else(|| MeshError::NotFound(format!("download task {task_id} not found")))?;
        patch.status = status;
        self.store.kv.update_download_file(&patch)?;
        self.emit(task_id, status, None);
        Ok(())
    }

    async fn run_download(&self, task_id: &str) -> MeshResult<()> {
        let record = self
            .store
            .kv
            .get_download_file(task_id)?
            .ok_or_else(|| MeshError::NotFound(format!("download task {task_id} not found")))?;
        if record.status == DownloadFileStatus::Paused || record.status == DownloadFileStatus::Cancelled
        {
            return Ok(());
        }

        if record.file_meta.is_none() {
            self.locate(task_id).await?;
        }
        self.ensure_holders(task_id).await?;
        if record.slice_table.is_empty() {
            self.bootstrap_slice_table(task_id).await?;
        }
        self.dispatch(task_id).await
    }

    /// Publish a search request on C9 and aggregate responses for up to
    /// `retry_times * SEARCH_RETRY_INTERVAL` (§4.8).
    async fn locate(&self, task_id: &str) -> MeshResult<()> {
        let mut record = self
            .store
            .kv
            .get_download_file(task_id)?
            .ok_or_else(|| MeshError::NotFound(format!("download task {task_id} not found")))?;
        record.status = DownloadFileStatus::Downloading;
        record.started_at = now_secs();
        self.store.kv.upsert_download_file(&record)?;
        self.emit(task_id, DownloadFileStatus::Downloading, Some("locating holders".to_string()));

        let responses = self.search(&record.file_id).await?;
        let Some(first) = responses.first() else {
            record.status = DownloadFileStatus::Failed;
            record.error_message = Some("no holders responded to search".to_string());
            self.store.kv.upsert_download_file(&record)?;
            return Err(MeshError::NotFound(format!(
                "no holders found for file {}",
                record.file_id
            )));
        };

        record.file_meta = Some(DownloadFileMeta {
            name: first.name.clone(),
            extension: first.extension.clone(),
            size: first.size,
            content_type: first.content_type.clone(),
            upload_time: first.upload_time,
        });
        self.store.kv.upsert_download_file(&record)?;
        self.remember_holders(task_id, &responses).await;
        Ok(())
    }

    async fn search(&self, file_id: &str) -> MeshResult<Vec<pubsub::SearchResponse>> {
        let mut rx = self.dispatcher.subscribe_search_responses();
        let request = SearchRequest {
            file_id: file_id.to_string(),
            addr_info: self.network.local_peer_id().to_bytes(),
        };
        let payload = hashcodec::compact_marshal(&request)?;
        self.network.publish(&pubsub::search_request_topic(), payload).await?;

        let max_retries = self.config.task_controller.retry_times.max(1) as u32;
        let deadline = Instant::now() + SEARCH_RETRY_INTERVAL * max_retries;
        let mut responses = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(resp)) if resp.file_id == file_id => responses.push(resp),
                Ok(Ok(_)) => continue,
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => break,
                Err(_) => break,
            }
        }
        Ok(responses)
    }

    async fn remember_holders(&self, task_id: &str, responses: &[pubsub::SearchResponse]) {
        let mut peers: Vec<PeerId> = responses
            .iter()
            .filter_map(|r| PeerId::from_str(&r.holder_peer_id).ok())
            .collect();
        peers.sort();
        peers.dedup();
        self.holders.write().await.insert(task_id.to_string(), peers);
    }

    /// Re-runs the locate step if no holders are known for this task, e.g.
    /// after a process restart wiped the in-memory cache.
    async fn ensure_holders(&self, task_id: &str) -> MeshResult<()> {
        let known = self
            .holders
            .read()
            .await
            .get(task_id)
            .map(|p| !p.is_empty())
            .unwrap_or(false);
        if known {
            return Ok(());
        }
        let record = self
            .store
            .kv
            .get_download_file(task_id)?
            .ok_or_else(|| MeshError::NotFound(format!("download task {task_id} not found")))?;
        let responses = self.search(&record.file_id).await?;
        if responses.is_empty() {
            return Err(MeshError::NotFound(format!(
                "no holders found for file {}",
                record.file_id
            )));
        }
        self.remember_holders(task_id, &responses).await;
        Ok(())
    }

    async fn ranked_holders(&self, task_id: &str) -> Vec<PeerId> {
        let candidates = self
            .holders
            .read()
            .await
            .get(task_id)
            .cloned()
            .unwrap_or_default();
        self.peers.rank(&candidates).await
    }

    fn fetch_storage_path(&self, file_id: &str, segment_id: &str) -> PathBuf {
        self.config
            .slices_dir(&self.host_id)
            .join("downloads")
            .join(file_id)
            .join(segment_id)
    }

    /// Fetch segment index 0 from a known holder to learn the file's
    /// `slice_table`, then register the remaining `DownloadSegmentRecord`s.
    async fn bootstrap_slice_table(&self, task_id: &str) -> MeshResult<()> {
        let mut record = self
            .store
            .kv
            .get_download_file(task_id)?
            .ok_or_else(|| MeshError::NotFound(format!("download task {task_id} not found")))?;
        let segment_id = segment_id_for(&record.file_id, 0);

        let container = self
            .fetch_and_verify(&record.file_id, &segment_id, task_id)
            .await?;
        let slice_table_bytes = container
            .get(types::SLICETABLE)
            .ok_or_else(|| MeshError::Corrupt("bootstrap container missing SLICETABLE".to_string()))?;
        let slice_table: SliceTable = compact_unmarshal(slice_table_bytes)?;
        let encryption_key_bytes = container
            .get(types::ENCRYPTIONKEY)
            .ok_or_else(|| MeshError::Corrupt("bootstrap container missing ENCRYPTIONKEY".to_string()))?;

        let p2pk_script = container
            .get(types::P2PKSCRIPT)
            .ok_or_else(|| MeshError::Corrupt("bootstrap container missing P2PKSCRIPT".to_string()))?;
        let pubkey = script::pubkey_from_p2pk(p2pk_script)?;
        record.pubkey_hash = ecdsa::pubkey_hash(&pubkey);
        record.slice_table = slice_table.clone();
        record.third_key_share = encryption_key_bytes.to_vec();
        self.store.kv.upsert_download_file(&record)?;

        let mut segment_records = Vec::with_capacity(slice_table.len());
        for (index, entry) in slice_table.iter().enumerate() {
            let segment_id = segment_id_for(&record.file_id, index);
            if index == 0 {
                segment_records.push(DownloadSegmentRecord {
                    segment_id: segment_id.clone(),
                    task_id: task_id.to_string(),
                    segment_index: index as u32,
                    size: container
                        .get(types::SEGMENTCONTENT)
                        .map(|d| d.len() as u64)
                        .unwrap_or(0),
                    crc32: hashcodec::crc32_ieee(container.get(types::SEGMENTCONTENT).unwrap_or(&[])),
                    is_rs_code: entry.is_rs_code,
                    status: SegmentStatus::Completed,
                    storage_path: self
                        .fetch_storage_path(&record.file_id, &segment_id)
                        .to_string_lossy()
                        .to_string(),
                    encryption_key: Vec::new(),
                    segment_node: Default::default(),
                    attempts: 0,
                });
            } else {
                segment_records.push(DownloadSegmentRecord {
                    segment_id,
                    task_id: task_id.to_string(),
                    segment_index: index as u32,
                    size: 0,
                    crc32: 0,
                    is_rs_code: entry.is_rs_code,
                    status: SegmentStatus::Pending,
                    storage_path: String::new(),
                    encryption_key: Vec::new(),
                    segment_node: Default::default(),
                    attempts: 0,
                });
            }
        }
        self.store
            .kv
            .put_download_task_transaction(&record, &segment_records)?;
        Ok(())
    }

    async fn dispatch(&self, task_id: &str) -> MeshResult<()> {
        let record = self
            .store
            .kv
            .get_download_file(task_id)?
            .ok_or_else(|| MeshError::NotFound(format!("download task {task_id} not found")))?;
        if record.status == DownloadFileStatus::Paused
            || record.status == DownloadFileStatus::Cancelled
        {
            return Ok(());
        }

        let pending: Vec<_> = self
            .store
            .kv
            .find_download_segments_by_task_id(task_id)?
            .into_iter()
            .filter(|s| s.status != SegmentStatus::Completed)
            .collect();

        if pending.is_empty() {
            return self.finalize(task_id).await;
        }

        let semaphore = Arc::new(Semaphore::new(
            self.config.task_controller.max_concurrent_downloads,
        ));
        let mut handles = Vec::new();
        for segment in pending {
            let permit = semaphore.clone().acquire_owned().await.unwrap();
            let engine = self.clone();
            let task_id = task_id.to_string();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                engine.fetch_one_segment(&task_id, segment).await
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        self.finalize(task_id).await
    }

    async fn fetch_one_segment(&self, task_id: &str, mut segment: DownloadSegmentRecord) {
        let record = match self.store.kv.get_download_file(task_id) {
            Ok(Some(r)) => r,
            _ => return,
        };

        let ranked = self.ranked_holders(task_id).await;
        let excluded: Vec<PeerId> = segment
            .segment_node
            .iter()
            .filter(|(_, ok)| !**ok)
            .filter_map(|(p, _)| PeerId::from_str(p).ok())
            .collect();
        let candidates: Vec<PeerId> = ranked.into_iter().filter(|p| !excluded.contains(p)).collect();
        if candidates.is_empty() {
            segment.attempts += 1;
            self.fail_or_pending(&mut segment);
            let _ = self.store.kv.upsert_download_segment(&segment);
            return;
        }

        for peer in candidates {
            let started = Instant::now();
            let request = SegmentFetchRequest {
                file_id: record.file_id.clone(),
                segment_id: segment.segment_id.clone(),
            };
            match self.network.fetch_segment(peer, request).await {
                Ok(crate::network::SegmentFetchResponse::Found { container_bytes }) => {
                    match self
                        .persist_and_verify(&record, &segment, container_bytes)
                        .await
                    {
                        Ok((crc32, size)) => {
                            self.peers.record_success(peer, started.elapsed()).await;
                            segment.segment_node.insert(peer.to_string(), true);
                            segment.status = SegmentStatus::Completed;
                            segment.crc32 = crc32;
                            segment.size = size;
                            segment.storage_path = self
                                .fetch_storage_path(&record.file_id, &segment.segment_id)
                                .to_string_lossy()
                                .to_string();
                            let _ = self.store.kv.upsert_download_segment(&segment);
                            return;
                        }
                        Err(e) => {
                            warn!(segment_id = %segment.segment_id, peer = %peer, error = %e, "fetched segment failed verification");
                            self.peers.record_failure(peer).await;
                            segment.segment_node.insert(peer.to_string(), false);
                        }
                    }
                }
                Ok(crate::network::SegmentFetchResponse::NotFound) => {
                    debug!(segment_id = %segment.segment_id, peer = %peer, "peer no longer holds segment");
                    self.peers.record_failure(peer).await;
                    segment.segment_node.insert(peer.to_string(), false);
                }
                Err(e) => {
                    debug!(segment_id = %segment.segment_id, peer = %peer, error = %e, "segment fetch failed");
                    self.peers.record_failure(peer).await;
                    segment.segment_node.insert(peer.to_string(), false);
                }
            }
        }

        segment.attempts += 1;
        self.fail_or_pending(&mut segment);
        let _ = self.store.kv.upsert_download_segment(&segment);
    }

    fn fail_or_pending(&self, segment: &mut DownloadSegmentRecord) {
        if segment.attempts as usize >= self.config.task_controller.retry_times {
            segment.status = SegmentStatus::Failed;
        } else {
            segment.status = SegmentStatus::Pending;
        }
    }

    /// Persist a fetched container to disk and verify it end to end:
    /// field match against `file_id`/`segment_id`, CRC32, slice-table hash,
    /// and the embedded script/signature.
    async fn persist_and_verify(
        &self,
        record: &DownloadFileRecord,
        segment: &DownloadSegmentRecord,
        container_bytes: Vec<u8>,
    ) -> MeshResult<(u32, u64)> {
        let path = self.fetch_storage_path(&record.file_id, &segment.segment_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, &container_bytes)?;
        std::fs::rename(&tmp_path, &path)?;

        let container = Container::open(&path)?;
        self.fetch_and_verify_container(&container, record, segment)
    }

    /// Shared verification body for both the bootstrap fetch and the
    /// steady-state per-segment fetch loop.
    fn fetch_and_verify_container(
        &self,
        container: &Container,
        record: &DownloadFileRecord,
        segment: &DownloadSegmentRecord,
    ) -> MeshResult<(u32, u64)> {
        let get = |t: &str| -> MeshResult<Vec<u8>> {
            container
                .get(t)
                .map(|d| d.to_vec())
                .ok_or_else(|| MeshError::Corrupt(format!("container missing {t}")))
        };
        let file_id_bytes = get(types::FILEID)?;
        let segment_id_bytes = get(types::SEGMENTID)?;
        if String::from_utf8_lossy(&file_id_bytes) != record.file_id {
            return Err(MeshError::Corrupt("fetched FILEID does not match task".to_string()));
        }
        if String::from_utf8_lossy(&segment_id_bytes) != segment.segment_id {
            return Err(MeshError::Corrupt(
                "fetched SEGMENTID does not match task".to_string(),
            ));
        }

        let index_bytes = get(types::SEGMENTINDEX)?;
        let index = u32_from_be(&index_bytes)?;
        let crc32_bytes = get(types::CRC32CHECKSUM)?;
        let crc32 = u32_from_be(&crc32_bytes)?;
        let content = get(types::SEGMENTCONTENT)?;
        if hashcodec::crc32_ieee(&content) != crc32 {
            return Err(MeshError::Corrupt("fetched segment fails CRC check".to_string()));
        }
        if !record.slice_table.is_empty() {
            let expected = record
                .slice_table
                .get(index as usize)
                .ok_or_else(|| MeshError::Corrupt("segment index out of range of slice table".to_string()))?;
            if hashcodec::sha256(&content) != expected.hash {
                return Err(MeshError::Corrupt(
                    "fetched segment content does not match slice table hash".to_string(),
                ));
            }
        }

        let p2pkh_script = get(types::P2PKHSCRIPT)?;
        let p2pk_script = get(types::P2PKSCRIPT)?;
        let pubkey = script::pubkey_from_p2pk(&p2pk_script)?;
        let pubkey_hash = ecdsa::pubkey_hash(&pubkey);
        script::verify_p2pkh_owner(&p2pkh_script, &pubkey_hash)?;

        let slice_table_bytes = get(types::SLICETABLE)?;
        let slice_table: SliceTable = compact_unmarshal(&slice_table_bytes)?;
        let is_rs_code = slice_table
            .get(index as usize)
            .map(|e| e.is_rs_code)
            .unwrap_or(segment.is_rs_code);

        let mut signed_fields = Vec::new();
        signed_fields.extend_from_slice(file_id_bytes.as_slice());
        signed_fields.extend_from_slice(&slice_table_bytes);
        signed_fields.extend_from_slice(&index.to_be_bytes());
        signed_fields.extend_from_slice(&segment_id_bytes);
        signed_fields.push(is_rs_code as u8);
        signed_fields.extend_from_slice(&content);
        let digest = hashcodec::sha256(&signed_fields);
        let signature_bytes = get(types::SIGNATURE)?;
        let signature = ecdsa::parse_signature(&signature_bytes)?;
        ecdsa::verify(&pubkey, &digest, &signature)?;

        Ok((crc32, content.len() as u64))
    }

    async fn fetch_and_verify(
        &self,
        file_id: &str,
        segment_id: &str,
        task_id: &str,
    ) -> MeshResult<Container> {
        let record = self
            .store
            .kv
            .get_download_file(task_id)?
            .ok_or_else(|| MeshError::NotFound(format!("download task {task_id} not found")))?;
        let segment = DownloadSegmentRecord {
            segment_id: segment_id.to_string(),
            task_id: task_id.to_string(),
            segment_index: 0,
            size: 0,
            crc32: 0,
            is_rs_code: false,
            status: SegmentStatus::Pending,
            storage_path: String::new(),
            encryption_key: Vec::new(),
            segment_node: Default::default(),
            attempts: 0,
        };

        for peer in self.ranked_holders(task_id).await {
            let request = SegmentFetchRequest {
                file_id: file_id.to_string(),
                segment_id: segment_id.to_string(),
            };
            match self.network.fetch_segment(peer, request).await {
                Ok(crate::network::SegmentFetchResponse::Found { container_bytes }) => {
                    let path = self.fetch_storage_path(file_id, segment_id);
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    let tmp_path = path.with_extension("tmp");
                    std::fs::write(&tmp_path, &container_bytes)?;
                    std::fs::rename(&tmp_path, &path)?;
                    let container = Container::open(&path)?;
                    if self
                        .fetch_and_verify_container(&container, &record, &segment)
                        .is_ok()
                    {
                        self.peers.record_success(peer, Duration::from_millis(0)).await;
                        return Ok(container);
                    }
                    let _ = std::fs::remove_file(&path);
                }
                Ok(crate::network::SegmentFetchResponse::NotFound) => continue,
                Err(_) => continue,
            }
        }
        Err(MeshError::NotFound(format!(
            "no holder returned a valid copy of segment {segment_id}"
        )))
    }

    /// Reassembles the file once enough segments are `Completed` to satisfy
    /// the RS threshold (or, with no parity, once every segment is in).
    /// Guarded by `assembly_lock` so a task is written at most once (P8).
    async fn finalize(&self, task_id: &str) -> MeshResult<()> {
        let _guard = self.assembly_lock.lock().await;

        let mut record = self
            .store
            .kv
            .get_download_file(task_id)?
            .ok_or_else(|| MeshError::NotFound(format!("download task {task_id} not found")))?;
        if record.status == DownloadFileStatus::Completed {
            return Ok(());
        }
        if record.slice_table.is_empty() {
            return Ok(());
        }

        let segments = self.store.kv.find_download_segments_by_task_id(task_id)?;
        let data_shards = record.slice_table.iter().filter(|e| !e.is_rs_code).count();
        let parity_shards = record.slice_table.len() - data_shards;
        let completed: Vec<_> = segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Completed)
            .collect();

        let ready = if parity_shards > 0 {
            completed.len() >= data_shards
        } else {
            completed.len() == record.slice_table.len()
        };
        if !ready {
            self.emit(
                task_id,
                record.status,
                Some(format!("{}/{} segments placed", completed.len(), record.slice_table.len())),
            );
            return Ok(());
        }

        let aes_key = self.derive_segment_key(&record)?;
        let mut shards: Vec<Option<Vec<u8>>> = vec![None; record.slice_table.len()];
        for seg in &completed {
            let segment_id = segment_id_for(&record.file_id, seg.segment_index as usize);
            let path = self.fetch_storage_path(&record.file_id, &segment_id);
            let container = Container::open(&path)?;
            let ciphertext = container
                .get(types::SEGMENTCONTENT)
                .ok_or_else(|| MeshError::Corrupt("container missing SEGMENTCONTENT".to_string()))?;
            let plaintext = cipher::decrypt(&aes_key, segment_id.as_bytes(), ciphertext)?;
            shards[seg.segment_index as usize] = Some(plaintext);
        }

        if parity_shards > 0 {
            let codec = crate::crypto::reed_solomon::RsCodec::new(data_shards, parity_shards)?;
            codec.reconstruct(&mut shards)?;
        }

        let Some(file_meta) = record.file_meta.clone() else {
            return Err(MeshError::Corrupt("finalize called before file_meta was known".to_string()));
        };
        let mut assembled = Vec::with_capacity(file_meta.size as usize);
        for shard in shards.into_iter().take(data_shards) {
            let shard = shard.ok_or_else(|| {
                MeshError::InsufficientShards("missing data shard after reconstruction".to_string())
            })?;
            assembled.extend_from_slice(&shard);
        }
        assembled.truncate(file_meta.size as usize);

        let file_name = if file_meta.extension.is_empty() {
            file_meta.name.clone()
        } else {
            format!("{}.{}", file_meta.name, file_meta.extension)
        };
        let dest = self.config.download_root().join(&file_name);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_dest = dest.with_extension("part");
        std::fs::write(&tmp_dest, &assembled)?;
        std::fs::rename(&tmp_dest, &dest)?;

        record.status = DownloadFileStatus::Completed;
        self.store.kv.upsert_download_file(&record)?;
        info!(task_id, path = %dest.display(), "download assembled");
        self.emit(task_id, DownloadFileStatus::Completed, None);
        Ok(())
    }

    /// Recover `s2` (the shard AES key) from `first_key_share` (s1) and
    /// `third_key_share` (s3), neither of which is ever transmitted
    /// together with the other over the wire (§4.2).
    fn derive_segment_key(&self, record: &DownloadFileRecord) -> MeshResult<cipher::SegmentKey> {
        if record.first_key_share.is_empty() || record.third_key_share.is_empty() {
            return Err(MeshError::Crypto(
                "missing key shares required to derive the segment encryption key".to_string(),
            ));
        }
        let s1 = shamir::Share::from_bytes(&record.first_key_share)?;
        let s3 = shamir::Share::from_bytes(&record.third_key_share)?;
        shamir::interpolate_share(&[s1, s3], 2)
    }
}

fn segment_id_for(file_id: &str, index: usize) -> String {
    let input = format!("{file_id}-{index}");
    hex::encode(hashcodec::sha256(input.as_bytes()))
}

fn u32_from_be(bytes: &[u8]) -> MeshResult<u32> {
    bytes
        .try_into()
        .map(u32::from_be_bytes)
        .map_err(|_| MeshError::Corrupt("expected a 4-byte big-endian integer".to_string()))
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

static TASK_SEQ: AtomicU64 = AtomicU64::new(0);

fn generate_task_id(owner: &OwnerKey) -> String {
    let pubkey = owner.pair.marshal_public_key();
    let x_hex = hex::encode(&pubkey[1..]);
    let seq = TASK_SEQ.fetch_add(1, AtomicOrdering::Relaxed);
    let random6: u32 = thread_rng().gen_range(0..1_000_000);
    format!("dl-{}-{}-{:06}-{}", x_hex, now_secs(), random6, seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_id_is_deterministic_per_file_and_index() {
        let a = segment_id_for("file-abc", 0);
        let b = segment_id_for("file-abc", 0);
        let c = segment_id_for("file-abc", 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn download_task_ids_are_prefixed_and_unique() {
        let owner = crate::keys::OwnerKey::generate();
        let a = generate_task_id(&owner);
        let b = generate_task_id(&owner);
        assert!(a.starts_with("dl-"));
        assert_ne!(a, b);
    }

    #[test]
    fn derive_segment_key_recovers_the_shard_key_used_at_upload_time() {
        let secret = hashcodec::sha256(b"owner-priv || file-sha256");
        let shares = shamir::split(&secret, &mut rand::thread_rng()).unwrap();
        let expected_key = shares[1].y; // s2, used directly as the AES key

        let record = DownloadFileRecord {
            task_id: "t".to_string(),
            file_id: "f".to_string(),
            status: DownloadFileStatus::Downloading,
            file_meta: None,
            slice_table: Vec::new(),
            first_key_share: shares[0].to_bytes().to_vec(),
            third_key_share: shares[2].to_bytes().to_vec(),
            pubkey_hash: [0u8; 20],
            started_at: 0,
            error_message: None,
        };

        let config = Arc::new(Config::default());
        let store = Arc::new(Store::open(&tempfile::tempdir().unwrap().path().join("db")).unwrap());
        let owner = Arc::new(crate::keys::OwnerKey::generate());
        let controller = Arc::new(TaskController::start(
            config.task_controller.clone(),
            crate::metrics::TaskMetrics::new(),
        ));
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (network, dispatcher) = rt.block_on(async {
            let mut cfg = (*config).clone();
            cfg.network.default_port = 0;
            let cfg = Arc::new(cfg);
            let network = NetworkHandle::new(&cfg).await.unwrap();
            let dispatcher = Arc::new(PubSubDispatcher::new(
                store.clone(),
                cfg.clone(),
                network.clone(),
                "host".to_string(),
            ));
            (network, dispatcher)
        });
        let engine = DownloadEngine::new(
            store,
            config,
            controller,
            network,
            dispatcher,
            PeerRegistry::new(),
            owner,
        );
        let key = engine.derive_segment_key(&record).unwrap();
        assert_eq!(key, expected_key);
    }
}
