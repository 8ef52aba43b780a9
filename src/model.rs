//! Core data model (§3): the records the metadata store (C4) persists and
//! the engines (C7/C8) mutate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum UploadFileStatus {
    Unspecified = 0,
    Pending = 1,
    Uploading = 2,
    Paused = 3,
    Completed = 4,
    Failed = 5,
    Cancelled = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SegmentStatus {
    Unspecified = 0,
    Pending = 1,
    Uploading = 2,
    Completed = 3,
    Failed = 4,
    Cancelled = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DownloadFileStatus {
    Unspecified = 0,
    Pending = 1,
    Downloading = 2,
    Paused = 3,
    Completed = 4,
    Failed = 5,
    Cancelled = 6,
}

/// One entry of the authoritative `index -> {hash, is_rs_code}` map for a
/// file's stripe. Holds both data shards and parity shards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceEntry {
    pub hash: [u8; 32],
    pub is_rs_code: bool,
}

/// Ordered `index -> SliceEntry` mapping; cardinality = data_shards + parity_shards.
pub type SliceTable = Vec<SliceEntry>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadFileRecord {
    pub task_id: String,
    pub file_id: String,
    pub path: String,
    pub name: String,
    pub extension: String,
    pub size: u64,
    pub content_type: String,
    pub sha256: [u8; 32],
    pub upload_time: i64,
    pub started_at: i64,
    pub finished_at: i64,
    pub status: UploadFileStatus,
    pub owner_priv: Vec<u8>,
    pub pubkey_hash: [u8; 20],
    pub slice_table: SliceTable,
    pub first_key_share: Vec<u8>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSegmentRecord {
    pub segment_id: String,
    pub task_id: String,
    pub segment_index: u32,
    pub size: u64,
    pub crc32: u32,
    pub is_rs_code: bool,
    pub status: SegmentStatus,
    pub storage_path: String,
    pub encryption_key: Vec<u8>,
    /// `true` = peer confirmed receipt; absent key = never attempted.
    pub segment_node: HashMap<String, bool>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadFileMeta {
    pub name: String,
    pub extension: String,
    pub size: u64,
    pub content_type: String,
    pub upload_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadFileRecord {
    pub task_id: String,
    pub file_id: String,
    pub status: DownloadFileStatus,
    pub file_meta: Option<DownloadFileMeta>,
    pub slice_table: SliceTable,
    /// `s1`, supplied by the caller (or recovered from a local
    /// `UploadFileRecord` when this node is downloading its own file).
    pub first_key_share: Vec<u8>,
    /// `s3`, learned from the `ENCRYPTIONKEY` sub-segment of the first
    /// container fetched; identical across every segment of a file, so one
    /// copy here is enough to derive `s2` (the shard AES key) via
    /// `shamir::interpolate_share` once both shares are known.
    pub third_key_share: Vec<u8>,
    pub pubkey_hash: [u8; 20],
    pub started_at: i64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSegmentRecord {
    pub segment_id: String,
    pub task_id: String,
    pub segment_index: u32,
    pub size: u64,
    pub crc32: u32,
    pub is_rs_code: bool,
    pub status: SegmentStatus,
    pub storage_path: String,
    pub encryption_key: Vec<u8>,
    /// `false` entries record peers to exclude on future retries.
    pub segment_node: HashMap<String, bool>,
    pub attempts: u32,
}

/// A segment this node holds on behalf of another owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSegmentStorage {
    pub segment_id: String,
    pub file_id: String,
    pub name: String,
    pub extension: String,
    pub size: u64,
    pub content_type: String,
    pub sha256: [u8; 32],
    pub upload_time: i64,
    pub p2pkh_script: Vec<u8>,
    pub p2pk_script: Vec<u8>,
    pub slice_table: Vec<u8>,
    pub segment_index: u32,
    pub crc32: u32,
    pub segment_content: Vec<u8>,
    pub encryption_key: Vec<u8>,
    pub signature: Vec<u8>,
    pub shared: bool,
    pub version: u32,
    /// On-disk path of the container this row indexes (§3: "the container
    /// files in the slice directory are owned by C3; the metadata store
    /// holds only the path"). Needed here, unlike the upload/download
    /// segment records, so the set-shared handler can mutate the `SHARED`
    /// sub-segment of a container it did not author.
    pub storage_path: String,
}

/// Summary of a task's segments, produced by `task_summary`.
#[derive(Debug, Clone, Default)]
pub struct TaskSummary {
    pub total_segments: usize,
    pub completed_indices: Vec<u32>,
    pub data_segment_count: usize,
}
