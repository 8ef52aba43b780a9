//! Upload engine (C7): the per-file state machine that turns a local path
//! into N encrypted, RS-coded segment containers and hands each to a peer.
//!
//! Grounded in the reference node's `file_storage.rs`/`concurrent_chunks.rs`
//! pair (read-the-file-once, chunk, dispatch-with-retry-and-semaphore) but
//! driven by the crate's own container/crypto/store primitives instead of
//! the reference node's chunk format. Task execution is delegated to the
//! task controller (C6); this module only defines the handler and the
//! dispatch bookkeeping the handler runs.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::{thread_rng, Rng};
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, info, warn};

use crate::config::{Config, StorageMode};
use crate::container::{types, Container};
use crate::crypto::{cipher, ecdsa, script, shamir};
use crate::distribution::{DistributionPlanner, SegmentDistributionItem};
use crate::error::{MeshError, MeshResult};
use crate::hashcodec::{self, compact_marshal};
use crate::keys::OwnerKey;
use crate::model::{SliceEntry, SliceTable, UploadFileRecord, UploadFileStatus, UploadSegmentRecord, SegmentStatus};
use crate::network::{SegmentSendRequest, SegmentSendResponse};
use crate::network_actor::NetworkHandle;
use crate::quorum::PeerRegistry;
use crate::store::Store;
use crate::task_controller::{TaskController, TaskPriority};

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub storage_mode: StorageMode,
    pub data_shards: Option<usize>,
    pub parity_shards: Option<usize>,
    pub shard_size: Option<usize>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            storage_mode: StorageMode::RsSize,
            data_shards: None,
            parity_shards: None,
            shard_size: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadEvent {
    pub task_id: String,
    pub status: UploadFileStatus,
    pub message: Option<String>,
}

#[derive(Clone)]
pub struct UploadEngine {
    store: Arc<Store>,
    config: Arc<Config>,
    controller: Arc<TaskController>,
    network: NetworkHandle,
    planner: DistributionPlanner,
    peers: PeerRegistry,
    owner: Arc<OwnerKey>,
    host_id: String,
    events: broadcast::Sender<UploadEvent>,
}

impl UploadEngine {
    pub fn new(
        store: Arc<Store>,
        config: Arc<Config>,
        controller: Arc<TaskController>,
        network: NetworkHandle,
        planner: DistributionPlanner,
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
            planner,
            peers,
            owner,
            host_id,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.events.subscribe()
    }

    fn emit(&self, task_id: &str, status: UploadFileStatus, message: Option<String>) {
        let _ = self.events.send(UploadEvent {
            task_id: task_id.to_string(),
            status,
            message,
        });
    }

    /// Register a new upload and return its `task_id`. Does not start
    /// encoding or dispatch; call `start` to enter `Preparing`.
    pub fn new_upload(&self, path: &Path) -> MeshResult<String> {
        let metadata = std::fs::metadata(path)?;
        let size = metadata.len();
        if (size as usize) < self.config.storage.min_upload_size
            || (size as usize) > self.config.storage.max_upload_size
        {
            return Err(MeshError::Config(format!(
                "file size {size} outside allowed range [{}, {}]",
                self.config.storage.min_upload_size, self.config.storage.max_upload_size
            )));
        }

        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("file")
            .to_string();
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_string();

        let task_id = generate_task_id(&self.owner);
        let pubkey_hash = ecdsa::pubkey_hash(self.owner.pair.public_key());

        let record = UploadFileRecord {
            task_id: task_id.clone(),
            file_id: String::new(),
            path: path.to_string_lossy().to_string(),
            name,
            extension,
            size,
            content_type: "application/octet-stream".to_string(),
            sha256: [0u8; 32],
            upload_time: now_secs(),
            started_at: 0,
            finished_at: 0,
            status: UploadFileStatus::Pending,
            owner_priv: self.owner.pair.marshal_private_key().to_vec(),
            pubkey_hash,
            slice_table: Vec::new(),
            first_key_share: Vec::new(),
            error_message: None,
        };
        self.store.kv.upsert_upload_file(&record)?;
        Ok(task_id)
    }

    /// Transition `Pending -> Preparing -> Uploading` and submit the work to
    /// the task controller.
    pub async fn start(&self, task_id: &str, opts: UploadOptions) -> MeshResult<()> {
        let engine = self.clone();
        let task_id_owned = task_id.to_string();
        let handler: crate::task_controller::TaskHandler = Arc::new(move || {
            let engine = engine.clone();
            let task_id = task_id_owned.clone();
            let opts = opts.clone();
            Box::pin(async move { engine.run_upload(&task_id, opts).await })
        });
        self.controller
            .submit(task_id, TaskPriority::Normal, handler)
            .await
    }

    pub async fn pause(&self, task_id: &str) -> MeshResult<()> {
        self.set_status(task_id, UploadFileStatus::Paused).await
    }

    /// Resume a paused or partially-dispatched upload: re-plans every
    /// segment not already `Completed`.
    pub async fn resume(&self, task_id: &str) -> MeshResult<()> {
        self.set_status(task_id, UploadFileStatus::Uploading).await?;
        let engine = self.clone();
        let task_id_owned = task_id.to_string();
        let handler: crate::task_controller::TaskHandler = Arc::new(move || {
            let engine = engine.clone();
            let task_id = task_id_owned.clone();
            Box::pin(async move { engine.dispatch(&task_id).await })
        });
        self.controller
            .submit(&format!("{task_id}-resume-{}", now_secs()), TaskPriority::High, handler)
            .await
    }

    pub async fn cancel(&self, task_id: &str) -> MeshResult<()> {
        let _ = self.controller.cancel(task_id).await;
        self.set_status(task_id, UploadFileStatus::Cancelled).await
    }

    pub fn query(&self, task_id: &str) -> MeshResult<Option<UploadFileRecord>> {
        self.store.kv.get_upload_file(task_id)
    }

    /// All upload records, newest first; callers filter/paginate client-side.
    pub fn list(&self) -> MeshResult<Vec<UploadFileRecord>> {
        self.store.kv.list_upload_files()
    }

    /// Owner-initiated flip of the `shared` flag on every node holding a
    /// segment of this file (§4.9, S6). Publishes a signed `SetSharedRequest`
    /// on C9; holders verify the signature against the P2PKH/P2PK scripts
    /// embedded in the container they already hold before acting.
    pub async fn set_shared(&self, task_id: &str, enable_sharing: bool) -> MeshResult<()> {
        let record = self
            .store
            .kv
            .get_upload_file(task_id)?
            .ok_or_else(|| MeshError::NotFound(format!("upload task {task_id} not found")))?;

        let mut signed_fields = Vec::new();
        signed_fields.extend_from_slice(record.file_id.as_bytes());
        signed_fields.extend_from_slice(&record.pubkey_hash);
        signed_fields.push(enable_sharing as u8);
        let digest = hashcodec::sha256(&signed_fields);
        let signature = self.owner.pair.sign(&digest)?;

        let request = crate::pubsub::SetSharedRequest {
            file_id: record.file_id,
            pubkey_hash: record.pubkey_hash,
            addr_info: self.network.local_peer_id().to_bytes(),
            enable_sharing,
            signature: signature.serialize_compact().to_vec(),
        };
        let payload = compact_marshal(&request)?;
        self.network
            .publish(&crate::pubsub::set_shared_topic(), payload)
            .await
    }

    async fn set_status(&self, task_id: &str, status: UploadFileStatus) -> MeshResult<()> {
        let mut patch = self
            .store
            .kv
            .get_upload_file(task_id)?
            .ok_or_else(|| MeshError::NotFound(format!("upload task {task_id} not found")))?;
        patch.status = status;
        self.store.kv.update_upload_file(&patch)?;
        self.emit(task_id, status, None);
        Ok(())
    }

    async fn run_upload(&self, task_id: &str, opts: UploadOptions) -> MeshResult<()> {
        let record = self
            .store
            .kv
            .get_upload_file(task_id)?
            .ok_or_else(|| MeshError::NotFound(format!("upload task {task_id} not found")))?;

        if record.slice_table.is_empty() {
            self.prepare(task_id, &opts).await?;
        }
        self.dispatch(task_id).await
    }

    async fn prepare(&self, task_id: &str, opts: &UploadOptions) -> MeshResult<()> {
        let mut record = self
            .store
            .kv
            .get_upload_file(task_id)?
            .ok_or_else(|| MeshError::NotFound(format!("upload task {task_id} not found")))?;
        record.status = UploadFileStatus::Uploading;
        record.started_at = now_secs();
        self.store.kv.upsert_upload_file(&record)?;
        self.emit(task_id, UploadFileStatus::Uploading, Some("preparing".to_string()));

        // 1. read and hash the file
        let data = std::fs::read(&record.path)?;
        let content_sha256 = hashcodec::sha256(&data);

        // 2. derive file_id
        let file_id = hex::encode(hashcodec::sha256(
            &[
                self.owner.pair.marshal_public_key().as_slice(),
                &content_sha256,
            ]
            .concat(),
        ));

        // 3. choose shape
        let (data_shards, parity_shards) =
            choose_shape(data.len(), opts, &self.config.storage)?;

        // 4. split (+ RS-encode when parity_shards > 0)
        let shards = if parity_shards > 0 {
            let codec = crate::crypto::reed_solomon::RsCodec::new(data_shards, parity_shards)?;
            let mut shards = codec.split(&data);
            codec.encode(&mut shards)?;
            shards
        } else {
            manual_split(&data, data_shards)
        };
        let total_shards = shards.len();

        // 7. master secret + Shamir split (done before per-shard loop since
        // every segment shares the same s2/s3 values, §9 decision (a)).
        let master_secret = hashcodec::sha256(
            &[self.owner.pair.marshal_private_key().as_slice(), &content_sha256].concat(),
        );
        let [s1, s2, s3] = shamir::split(&master_secret, &mut thread_rng())?;

        let p2pkh_script = script::build_p2pkh(&record.pubkey_hash);
        let p2pk_script = script::build_p2pk(&self.owner.pair.marshal_public_key());

        // 5+6: per-shard encrypt + slice table
        let mut slice_table: SliceTable = Vec::with_capacity(total_shards);
        let mut ciphertexts: Vec<Vec<u8>> = Vec::with_capacity(total_shards);
        for (index, shard) in shards.iter().enumerate() {
            let is_rs_code = index >= data_shards;
            let segment_id = segment_id_for(&file_id, index);
            let ciphertext = cipher::encrypt(&s2.y, segment_id.as_bytes(), shard)?;
            let hash = hashcodec::sha256(&ciphertext);
            slice_table.push(SliceEntry { hash, is_rs_code });
            ciphertexts.push(ciphertext);
        }
        let slice_table_bytes = compact_marshal(&slice_table)?;

        // 8. build one container per segment, insert one segment record each
        let mut segment_records = Vec::with_capacity(total_shards);
        for (index, ciphertext) in ciphertexts.into_iter().enumerate() {
            let is_rs_code = index >= data_shards;
            let segment_id = segment_id_for(&file_id, index);
            let crc32 = hashcodec::crc32_ieee(&ciphertext);

            let mut signed_fields = Vec::new();
            signed_fields.extend_from_slice(file_id.as_bytes());
            signed_fields.extend_from_slice(&slice_table_bytes);
            signed_fields.extend_from_slice(&(index as u32).to_be_bytes());
            signed_fields.extend_from_slice(segment_id.as_bytes());
            signed_fields.push(is_rs_code as u8);
            signed_fields.extend_from_slice(&ciphertext);
            let digest = hashcodec::sha256(&signed_fields);
            let signature = self.owner.pair.sign(&digest)?;

            let path = self.segment_path(&file_id, &segment_id);
            Container::write_new(
                &path,
                &[
                    (types::FILEID, file_id.as_bytes()),
                    (types::P2PKHSCRIPT, &p2pkh_script),
                    (types::P2PKSCRIPT, &p2pk_script),
                    (types::SLICETABLE, &slice_table_bytes),
                    (types::SEGMENTINDEX, &(index as u32).to_be_bytes()),
                    (types::SEGMENTID, segment_id.as_bytes()),
                    (types::CRC32CHECKSUM, &crc32.to_be_bytes()),
                    (types::SEGMENTCONTENT, &ciphertext),
                    (types::ENCRYPTIONKEY, &s3.to_bytes()),
                    (types::SIGNATURE, &signature.serialize_compact()),
                    (types::SHARED, &[0u8]),
                    (types::VERSION, &1u32.to_be_bytes()),
                ],
            )?;

            segment_records.push(UploadSegmentRecord {
                segment_id,
                task_id: task_id.to_string(),
                segment_index: index as u32,
                size: ciphertext.len() as u64,
                crc32,
                is_rs_code,
                status: SegmentStatus::Pending,
                storage_path: path.to_string_lossy().to_string(),
                encryption_key: s2.y.to_vec(),
                segment_node: Default::default(),
                attempts: 0,
            });
        }

        // 9. insert file + N segment records transactionally
        record.file_id = file_id;
        record.sha256 = content_sha256;
        record.slice_table = slice_table;
        record.first_key_share = s1.to_bytes().to_vec();
        self.store
            .kv
            .put_upload_task_transaction(&record, &segment_records)?;
        Ok(())
    }

    fn segment_path(&self, file_id: &str, segment_id: &str) -> PathBuf {
        self.config
            .slices_dir(&self.host_id)
            .join(file_id)
            .join(segment_id)
    }

    async fn dispatch(&self, task_id: &str) -> MeshResult<()> {
        let record = self
            .store
            .kv
            .get_upload_file(task_id)?
            .ok_or_else(|| MeshError::NotFound(format!("upload task {task_id} not found")))?;
        if record.status == UploadFileStatus::Paused || record.status == UploadFileStatus::Cancelled
        {
            return Ok(());
        }

        let pending: Vec<_> = self
            .store
            .kv
            .find_upload_segments_by_task_id(task_id)?
            .into_iter()
            .filter(|s| s.status != SegmentStatus::Completed)
            .collect();
        if pending.is_empty() {
            return self.finalize(task_id).await;
        }

        let connected = self.network.get_connected_peers().await?;
        if connected.is_empty() {
            warn!(task_id, "no connected peers; leaving segments pending");
            return Ok(());
        }
        let ranked = self.peers.rank(&connected).await;

        // Plan: round-robin ranked peers across pending segments, preferring
        // two distinct holders per segment when enough candidates exist.
        let mut assignments: std::collections::HashMap<libp2p::PeerId, Vec<String>> =
            std::collections::HashMap::new();
        for (i, segment) in pending.iter().enumerate() {
            let holders_wanted = if ranked.len() >= 2 { 2 } else { 1 };
            for slot in 0..holders_wanted {
                let peer = ranked[(i + slot) % ranked.len()];
                assignments.entry(peer).or_default().push(segment.segment_id.clone());
            }
        }
        for (peer, segment_ids) in assignments {
            self.planner
                .add_distribution(SegmentDistributionItem { peer, segment_ids });
        }

        let semaphore = Arc::new(Semaphore::new(self.config.task_controller.max_concurrent_uploads));
        let mut handles = Vec::new();
        while let Some(item) = self.planner.pop_next() {
            for segment_id in item.segment_ids {
                let permit = semaphore.clone().acquire_owned().await.unwrap();
                let engine = self.clone();
                let task_id = task_id.to_string();
                let peer = item.peer;
                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    engine.send_one_segment(&task_id, &segment_id, peer).await
                }));
            }
        }
        for handle in handles {
            let _ = handle.await;
        }

        self.finalize(task_id).await
    }

    async fn send_one_segment(&self, task_id: &str, segment_id: &str, peer: libp2p::PeerId) {
        let Some(mut segment) = self.store.kv.get_upload_segment(segment_id).unwrap_or(None) else {
            return;
        };
        if segment.status == SegmentStatus::Completed {
            return;
        }

        let container_bytes = match std::fs::read(&segment.storage_path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(segment_id, error = %e, "failed to read local container");
                return;
            }
        };

        let Some(file) = self.store.kv.get_upload_file(task_id).ok().flatten() else {
            return;
        };

        let started = std::time::Instant::now();
        let request = SegmentSendRequest {
            file_id: file.file_id,
            segment_id: segment_id.to_string(),
            container_bytes,
            name: file.name,
            extension: file.extension,
            size: file.size,
            content_type: file.content_type,
            sha256: file.sha256,
            upload_time: file.upload_time,
        };

        match self.network.send_segment(peer, request).await {
            Ok(SegmentSendResponse { accepted: true, .. }) => {
                self.peers.record_success(peer, started.elapsed()).await;
                segment.segment_node.insert(peer.to_string(), true);
                segment.status = SegmentStatus::Completed;
                let _ = self.store.kv.upsert_upload_segment(&segment);
            }
            Ok(SegmentSendResponse { accepted: false, message }) => {
                self.peers.record_failure(peer).await;
                segment.segment_node.insert(peer.to_string(), false);
                segment.attempts += 1;
                debug!(segment_id, message, "peer declined segment");
                self.fail_or_pending(&mut segment);
                let _ = self.store.kv.upsert_upload_segment(&segment);
            }
            Err(e) => {
                self.peers.record_failure(peer).await;
                segment.segment_node.insert(peer.to_string(), false);
                segment.attempts += 1;
                debug!(segment_id, error = %e, "segment send failed");
                self.fail_or_pending(&mut segment);
                let _ = self.store.kv.upsert_upload_segment(&segment);
            }
        }
    }

    fn fail_or_pending(&self, segment: &mut UploadSegmentRecord) {
        if segment.attempts as usize >= self.config.task_controller.retry_times {
            segment.status = SegmentStatus::Failed;
        } else {
            segment.status = SegmentStatus::Pending;
        }
    }

    /// File completes once every data shard has at least one confirming
    /// holder (§4.7, §9 decision (b)).
    async fn finalize(&self, task_id: &str) -> MeshResult<()> {
        let mut record = self
            .store
            .kv
            .get_upload_file(task_id)?
            .ok_or_else(|| MeshError::NotFound(format!("upload task {task_id} not found")))?;
        let segments = self.store.kv.find_upload_segments_by_task_id(task_id)?;
        let data_total = segments.iter().filter(|s| !s.is_rs_code).count();
        let data_completed = segments
            .iter()
            .filter(|s| !s.is_rs_code && s.status == SegmentStatus::Completed)
            .count();

        if data_total > 0 && data_completed == data_total {
            record.status = UploadFileStatus::Completed;
            record.finished_at = now_secs();
            self.store.kv.upsert_upload_file(&record)?;
            self.emit(task_id, UploadFileStatus::Completed, None);
        } else {
            self.emit(
                task_id,
                record.status,
                Some(format!("{data_completed}/{data_total} data shards placed")),
            );
        }
        Ok(())
    }
}

fn clamp_shard_size(requested: usize, storage: &crate::config::StorageConfig) -> MeshResult<usize> {
    let shard_size = requested.max(1);
    if shard_size < storage.min_slice_size || shard_size > storage.max_slice_size {
        return Err(MeshError::Config(format!(
            "shard_size {shard_size} outside allowed range [{}, {}]",
            storage.min_slice_size, storage.max_slice_size
        )));
    }
    Ok(shard_size)
}

fn choose_shape(
    size: usize,
    opts: &UploadOptions,
    storage: &crate::config::StorageConfig,
) -> MeshResult<(usize, usize)> {
    match opts.storage_mode {
        StorageMode::FileMode => Ok((1, 0)),
        StorageMode::SliceMode => {
            let shard_size = clamp_shard_size(opts.shard_size.unwrap_or(storage.shard_size), storage)?;
            let data_shards = size.div_ceil(shard_size).max(1);
            Ok((data_shards, 0))
        }
        StorageMode::RsSize => {
            let data_shards = opts.data_shards.unwrap_or(storage.data_shards).max(1);
            let parity_shards = opts.parity_shards.unwrap_or(storage.parity_shards).max(1);
            if parity_shards > data_shards / 2 {
                return Err(MeshError::Config(
                    "parity_shards must be <= data_shards/2".to_string(),
                ));
            }
            Ok((data_shards, parity_shards))
        }
        StorageMode::RsProportion => {
            let shard_size = clamp_shard_size(opts.shard_size.unwrap_or(storage.shard_size), storage)?;
            let total_shards = size.div_ceil(shard_size).max(2);
            let data_shards =
                ((total_shards as f64) / (1.0 + storage.parity_ratio)).floor().max(1.0) as usize;
            let data_shards = data_shards.min(total_shards - 1).max(1);
            let parity_shards = total_shards - data_shards;
            Ok((data_shards, parity_shards.max(1)))
        }
    }
}

/// Chunk `data` into `data_shards` equal-length, zero-padded pieces without
/// involving `RsCodec` (which refuses `parity_shards == 0`); used by
/// `FileMode`/`SliceMode`.
fn manual_split(data: &[u8], data_shards: usize) -> Vec<Vec<u8>> {
    let shard_len = data.len().div_ceil(data_shards.max(1)).max(1);
    let mut shards = vec![vec![0u8; shard_len]; data_shards];
    for (i, shard) in shards.iter_mut().enumerate() {
        let start = i * shard_len;
        if start >= data.len() {
            continue;
        }
        let end = (start + shard_len).min(data.len());
        shard[..end - start].copy_from_slice(&data[start..end]);
    }
    shards
}

fn segment_id_for(file_id: &str, index: usize) -> String {
    let input = format!("{file_id}-{index}");
    hex::encode(hashcodec::sha256(input.as_bytes()))
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
    format!("{}-{}-{:06}-{}", x_hex, now_secs(), random6, seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;

    fn storage_config() -> StorageConfig {
        Config::default().storage
    }

    #[test]
    fn file_mode_uses_a_single_shard_with_no_parity() {
        let opts = UploadOptions {
            storage_mode: StorageMode::FileMode,
            ..Default::default()
        };
        let (data, parity) = choose_shape(1024, &opts, &storage_config()).unwrap();
        assert_eq!(data, 1);
        assert_eq!(parity, 0);
    }

    #[test]
    fn rs_proportion_derives_shard_counts_from_size() {
        let opts = UploadOptions {
            storage_mode: StorageMode::RsProportion,
            shard_size: Some(1024),
            ..Default::default()
        };
        let (data, parity) = choose_shape(10_000, &opts, &storage_config()).unwrap();
        assert!(data >= 1);
        assert!(parity >= 1);
        assert_eq!(data + parity >= (10_000usize).div_ceil(1024), true);
    }

    #[test]
    fn manual_split_zero_pads_last_shard() {
        let data = vec![1u8, 2, 3, 4, 5];
        let shards = manual_split(&data, 2);
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].len(), shards[1].len());
    }

    #[test]
    fn segment_id_is_deterministic_per_file_and_index() {
        let a = segment_id_for("file-abc", 0);
        let b = segment_id_for("file-abc", 0);
        let c = segment_id_for("file-abc", 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
