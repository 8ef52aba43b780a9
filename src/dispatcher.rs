//! Shared-file pub/sub dispatcher (C9): the `EngineHandle` implementation
//! that answers inbound gossipsub messages and segment send/fetch requests
//! on behalf of a node acting as a holder for files it doesn't own.
//!
//! Grounded in the network actor's `EngineHandle` seam (§9): rather than
//! the upload/download engines each implementing the trait and fighting
//! over which one answers a given topic, a single dispatcher owns all
//! holder-side state (`SqlStore`) and the two engines only ever originate
//! requests, never answer them.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use libp2p::PeerId;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::Config;
use crate::container::{types, Container};
use crate::crypto::{ecdsa, script};
use crate::error::MeshResult;
use crate::hashcodec;
use crate::model::FileSegmentStorage;
use crate::network::{SegmentFetchRequest, SegmentFetchResponse, SegmentSendRequest, SegmentSendResponse};
use crate::network_actor::EngineHandle;
use crate::pubsub::{self, SearchRequest, SearchResponse, SetSharedRequest};
use crate::store::Store;

/// Answers pub/sub control messages and segment send/fetch requests for
/// segments this node holds on behalf of remote owners.
pub struct PubSubDispatcher {
    store: Arc<Store>,
    config: Arc<Config>,
    network: crate::network_actor::NetworkHandle,
    host_id: String,
    search_responses: broadcast::Sender<SearchResponse>,
}

impl PubSubDispatcher {
    pub fn new(
        store: Arc<Store>,
        config: Arc<Config>,
        network: crate::network_actor::NetworkHandle,
        host_id: String,
    ) -> Self {
        let (search_responses, _) = broadcast::channel(256);
        Self {
            store,
            config,
            network,
            host_id,
            search_responses,
        }
    }

    /// Subscribed by the download engine's locate step to collect
    /// `SearchResponse`s published by holders.
    pub fn subscribe_search_responses(&self) -> broadcast::Receiver<SearchResponse> {
        self.search_responses.subscribe()
    }

    fn segment_storage_path(&self, file_id: &str, segment_id: &str) -> PathBuf {
        self.config
            .slices_dir(&self.host_id)
            .join(file_id)
            .join(segment_id)
    }

    async fn handle_set_shared(&self, req: SetSharedRequest) {
        let rows = match self.store.sql.find_by_file(&req.file_id) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(file_id = %req.file_id, error = %e, "set-shared: lookup failed");
                return;
            }
        };
        let Some(sample) = rows.first() else {
            debug!(file_id = %req.file_id, "set-shared: no segments held for this file");
            return;
        };

        if let Err(e) = script::verify_p2pkh_owner(&sample.p2pkh_script, &req.pubkey_hash) {
            warn!(file_id = %req.file_id, error = %e, "set-shared: signer does not own the file, ignoring");
            return;
        }
        let Ok(pubkey) = script::pubkey_from_p2pk(&sample.p2pk_script) else {
            warn!(file_id = %req.file_id, "set-shared: stored P2PK script is malformed, ignoring");
            return;
        };
        let mut signed_fields = Vec::new();
        signed_fields.extend_from_slice(req.file_id.as_bytes());
        signed_fields.extend_from_slice(&req.pubkey_hash);
        signed_fields.push(req.enable_sharing as u8);
        let digest = hashcodec::sha256(&signed_fields);
        let Ok(signature) = ecdsa::parse_signature(&req.signature) else {
            warn!(file_id = %req.file_id, "set-shared: malformed signature, ignoring");
            return;
        };
        if ecdsa::verify(&pubkey, &digest, &signature).is_err() {
            warn!(file_id = %req.file_id, "set-shared: signature verification failed, ignoring");
            return;
        }

        for mut row in rows {
            row.shared = req.enable_sharing;
            if let Err(e) = self.flip_shared_on_disk(&row) {
                warn!(segment_id = %row.segment_id, error = %e, "set-shared: failed to update container");
                continue;
            }
            if let Err(e) = self.store.sql.put(&row) {
                warn!(segment_id = %row.segment_id, error = %e, "set-shared: failed to persist row");
            }
        }
    }

    fn flip_shared_on_disk(&self, row: &FileSegmentStorage) -> MeshResult<()> {
        let mut container = Container::open(&PathBuf::from(&row.storage_path))?;
        container.write_sub_segment(types::SHARED, &[row.shared as u8])
    }

    async fn handle_search_request(&self, req: SearchRequest) {
        let shared = match self.store.sql.find_shared_by_file(&req.file_id) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(file_id = %req.file_id, error = %e, "search: lookup failed");
                return;
            }
        };
        let Some(row) = shared.first() else {
            return;
        };

        let response = SearchResponse {
            file_id: row.file_id.clone(),
            name: row.name.clone(),
            extension: row.extension.clone(),
            size: row.size,
            content_type: row.content_type.clone(),
            upload_time: row.upload_time,
            holder_peer_id: self.network.local_peer_id().to_string(),
        };
        match hashcodec::compact_marshal(&response) {
            Ok(bytes) => {
                if let Err(e) = self.network.publish(&pubsub::search_response_topic(), bytes).await {
                    warn!(file_id = %req.file_id, error = %e, "search: failed to publish response");
                }
            }
            Err(e) => warn!(file_id = %req.file_id, error = %e, "search: failed to marshal response"),
        }
    }
}

#[async_trait]
impl EngineHandle for PubSubDispatcher {
    async fn on_pubsub_message(&self, topic: &str, payload: Vec<u8>, _source: Option<PeerId>) {
        if topic == pubsub::set_shared_topic() {
            match hashcodec::compact_unmarshal::<SetSharedRequest>(&payload) {
                Ok(req) => self.handle_set_shared(req).await,
                Err(e) => warn!(topic, error = %e, "failed to decode set-shared request"),
            }
        } else if topic == pubsub::search_request_topic() {
            match hashcodec::compact_unmarshal::<SearchRequest>(&payload) {
                Ok(req) => self.handle_search_request(req).await,
                Err(e) => warn!(topic, error = %e, "failed to decode search request"),
            }
        } else if topic == pubsub::search_response_topic() {
            match hashcodec::compact_unmarshal::<SearchResponse>(&payload) {
                Ok(resp) => {
                    let _ = self.search_responses.send(resp);
                }
                Err(e) => warn!(topic, error = %e, "failed to decode search response"),
            }
        } else {
            debug!(topic, "unrecognized pub/sub topic, ignoring");
        }
    }

    async fn on_segment_send(&self, _from: PeerId, request: SegmentSendRequest) -> SegmentSendResponse {
        let path = self.segment_storage_path(&request.file_id, &request.segment_id);
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return SegmentSendResponse {
                    accepted: false,
                    message: format!("failed to create storage directory: {e}"),
                };
            }
        }
        let tmp_path = path.with_extension("tmp");
        if let Err(e) = std::fs::write(&tmp_path, &request.container_bytes) {
            return SegmentSendResponse {
                accepted: false,
                message: format!("failed to persist container: {e}"),
            };
        }
        if let Err(e) = std::fs::rename(&tmp_path, &path) {
            return SegmentSendResponse {
                accepted: false,
                message: format!("failed to finalize container: {e}"),
            };
        }

        let container = match Container::open(&path) {
            Ok(c) => c,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return SegmentSendResponse {
                    accepted: false,
                    message: format!("received container failed to open: {e}"),
                };
            }
        };

        let record = match build_storage_record(&request, &container, path.to_string_lossy().to_string()) {
            Ok(r) => r,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return SegmentSendResponse {
                    accepted: false,
                    message: format!("container missing or corrupt sub-segment: {e}"),
                };
            }
        };

        match self.store.sql.put(&record) {
            Ok(()) => SegmentSendResponse {
                accepted: true,
                message: "stored".to_string(),
            },
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                SegmentSendResponse {
                    accepted: false,
                    message: format!("failed to persist segment row: {e}"),
                }
            }
        }
    }

    async fn on_segment_fetch(&self, _from: PeerId, request: SegmentFetchRequest) -> SegmentFetchResponse {
        let row = match self.store.sql.get(&request.segment_id) {
            Ok(Some(row)) => row,
            Ok(None) => return SegmentFetchResponse::NotFound,
            Err(e) => {
                warn!(segment_id = %request.segment_id, error = %e, "fetch: lookup failed");
                return SegmentFetchResponse::NotFound;
            }
        };
        if row.file_id != request.file_id || !row.shared {
            return SegmentFetchResponse::NotFound;
        }
        match std::fs::read(&row.storage_path) {
            Ok(container_bytes) => SegmentFetchResponse::Found { container_bytes },
            Err(e) => {
                warn!(segment_id = %request.segment_id, error = %e, "fetch: container missing on disk");
                SegmentFetchResponse::NotFound
            }
        }
    }
}

/// Build the holder's `FileSegmentStorage` row from the freshly-persisted
/// container plus the metadata the uploader attached to the request.
fn build_storage_record(
    request: &SegmentSendRequest,
    container: &Container,
    storage_path: String,
) -> MeshResult<FileSegmentStorage> {
    use crate::error::MeshError;

    let get = |t: &str| -> MeshResult<Vec<u8>> {
        container
            .get(t)
            .map(|d| d.to_vec())
            .ok_or_else(|| MeshError::Corrupt(format!("container missing {t}")))
    };

    let p2pkh_script = get(types::P2PKHSCRIPT)?;
    let p2pk_script = get(types::P2PKSCRIPT)?;
    let slice_table = get(types::SLICETABLE)?;
    let segment_index_bytes = get(types::SEGMENTINDEX)?;
    let crc32_bytes = get(types::CRC32CHECKSUM)?;
    let segment_content = get(types::SEGMENTCONTENT)?;
    let encryption_key = get(types::ENCRYPTIONKEY)?;
    let signature = get(types::SIGNATURE)?;
    let shared_bytes = get(types::SHARED)?;
    let version_bytes = get(types::VERSION)?;
    let file_id_bytes = get(types::FILEID)?;
    let segment_id_bytes = get(types::SEGMENTID)?;

    if String::from_utf8_lossy(&file_id_bytes) != request.file_id {
        return Err(MeshError::Corrupt(
            "container FILEID does not match send request".to_string(),
        ));
    }
    if String::from_utf8_lossy(&segment_id_bytes) != request.segment_id {
        return Err(MeshError::Corrupt(
            "container SEGMENTID does not match send request".to_string(),
        ));
    }
    if hashcodec::crc32_ieee(&segment_content) != crc32_from_be(&crc32_bytes)? {
        return Err(MeshError::Corrupt("segment content fails CRC check".to_string()));
    }

    Ok(FileSegmentStorage {
        segment_id: request.segment_id.clone(),
        file_id: request.file_id.clone(),
        name: request.name.clone(),
        extension: request.extension.clone(),
        size: request.size,
        content_type: request.content_type.clone(),
        sha256: request.sha256,
        upload_time: request.upload_time,
        p2pkh_script,
        p2pk_script,
        slice_table,
        segment_index: u32_from_be(&segment_index_bytes)?,
        crc32: crc32_from_be(&crc32_bytes)?,
        segment_content,
        encryption_key,
        signature,
        shared: shared_bytes.first().copied().unwrap_or(0) != 0,
        version: u32_from_be(&version_bytes)?,
        storage_path,
    })
}

fn u32_from_be(bytes: &[u8]) -> MeshResult<u32> {
    bytes
        .try_into()
        .map(u32::from_be_bytes)
        .map_err(|_| crate::error::MeshError::Corrupt("expected a 4-byte big-endian integer".to_string()))
}

fn crc32_from_be(bytes: &[u8]) -> MeshResult<u32> {
    u32_from_be(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::crypto::ecdsa::KeyPair;
    use rand::thread_rng;
    use tempfile::tempdir;

    fn build_test_container(dir: &std::path::Path, file_id: &str, segment_id: &str) -> (PathBuf, Vec<u8>) {
        let key = KeyPair::generate(&mut thread_rng());
        let pubkey_hash = ecdsa::pubkey_hash(key.public_key());
        let p2pkh = script::build_p2pkh(&pubkey_hash);
        let p2pk = script::build_p2pk(&key.marshal_public_key());
        let slice_table = vec![1u8, 2, 3];
        let content = b"segment ciphertext".to_vec();
        let crc32 = hashcodec::crc32_ieee(&content);

        let path = dir.join(file_id).join(segment_id);
        Container::write_new(
            &path,
            &[
                (types::FILEID, file_id.as_bytes()),
                (types::P2PKHSCRIPT, &p2pkh),
                (types::P2PKSCRIPT, &p2pk),
                (types::SLICETABLE, &slice_table),
                (types::SEGMENTINDEX, &0u32.to_be_bytes()),
                (types::SEGMENTID, segment_id.as_bytes()),
                (types::CRC32CHECKSUM, &crc32.to_be_bytes()),
                (types::SEGMENTCONTENT, &content),
                (types::ENCRYPTIONKEY, &[9u8; 33]),
                (types::SIGNATURE, &[8u8; 64]),
                (types::SHARED, &[0u8]),
                (types::VERSION, &1u32.to_be_bytes()),
            ],
        )
        .unwrap();
        (path, content)
    }

    #[test]
    fn build_storage_record_extracts_every_subsegment() {
        let dir = tempdir().unwrap();
        let (path, content) = build_test_container(dir.path(), "file-1", "seg-1");
        let container = Container::open(&path).unwrap();
        let request = SegmentSendRequest {
            file_id: "file-1".to_string(),
            segment_id: "seg-1".to_string(),
            container_bytes: std::fs::read(&path).unwrap(),
            name: "report.pdf".to_string(),
            extension: "pdf".to_string(),
            size: 1024,
            content_type: "application/pdf".to_string(),
            sha256: [3u8; 32],
            upload_time: 1_700_000_000,
        };
        let record =
            build_storage_record(&request, &container, path.to_string_lossy().to_string()).unwrap();
        assert_eq!(record.segment_content, content);
        assert_eq!(record.name, "report.pdf");
        assert!(!record.shared);
    }

    #[test]
    fn build_storage_record_rejects_file_id_mismatch() {
        let dir = tempdir().unwrap();
        let (path, _content) = build_test_container(dir.path(), "file-1", "seg-1");
        let container = Container::open(&path).unwrap();
        let request = SegmentSendRequest {
            file_id: "different-file".to_string(),
            segment_id: "seg-1".to_string(),
            container_bytes: std::fs::read(&path).unwrap(),
            name: "report.pdf".to_string(),
            extension: "pdf".to_string(),
            size: 1024,
            content_type: "application/pdf".to_string(),
            sha256: [3u8; 32],
            upload_time: 1_700_000_000,
        };
        assert!(build_storage_record(&request, &container, path.to_string_lossy().to_string()).is_err());
    }

    #[tokio::test]
    async fn set_shared_ignores_request_with_bad_signature() {
        let dir = tempdir().unwrap();
        let (path, _content) = build_test_container(dir.path(), "file-1", "seg-1");
        let db_dir = dir.path().join("db");
        let store = Arc::new(Store::open(&db_dir).unwrap());
        let container = Container::open(&path).unwrap();
        let request = SegmentSendRequest {
            file_id: "file-1".to_string(),
            segment_id: "seg-1".to_string(),
            container_bytes: std::fs::read(&path).unwrap(),
            name: "report.pdf".to_string(),
            extension: "pdf".to_string(),
            size: 1024,
            content_type: "application/pdf".to_string(),
            sha256: [3u8; 32],
            upload_time: 1_700_000_000,
        };
        let record =
            build_storage_record(&request, &container, path.to_string_lossy().to_string()).unwrap();
        store.sql.put(&record).unwrap();

        let mut config = Config::default();
        config.network.default_port = 0; // let the OS assign a free port
        let config = Arc::new(config);
        let network = crate::network_actor::NetworkHandle::new(&config).await.unwrap();
        let dispatcher = PubSubDispatcher::new(store.clone(), config, network, "host-1".to_string());

        let bad_request = SetSharedRequest {
            file_id: "file-1".to_string(),
            pubkey_hash: [0u8; 20],
            addr_info: vec![],
            enable_sharing: true,
            signature: vec![0u8; 64],
        };
        dispatcher.handle_set_shared(bad_request).await;

        let row = store.sql.get("seg-1").unwrap().unwrap();
        assert!(!row.shared, "shared flag must not flip on an unverifiable request");
    }
}
