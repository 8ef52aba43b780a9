//! Key-value half of the metadata store (C4): all `*FileRecord` and
//! `*SegmentRecord` types, keyed by primary id, with secondary indexes on
//! `task_id`, `status`, `segment_index`, `crc32`, and `file_id`.
//!
//! Backed by `sled` (as the reference node's DHT storage layer already
//! uses it) with `bincode`-encoded values. Secondary indexes are realized
//! as `<index-value>\0<primary-key>` keys in dedicated trees, scanned by
//! prefix — the same trick the reference node's `persistent_dht.rs` uses
//! for its expiry/metadata scans. An LRU cache sits in front of primary-key
//! lookups and is invalidated on every write through the same code path.

use crate::error::MeshResult;
use crate::hashcodec::{compact_marshal, compact_unmarshal};
use crate::model::{
    DownloadFileRecord, DownloadFileStatus, DownloadSegmentRecord, SegmentStatus,
    UploadFileRecord, UploadFileStatus, UploadSegmentRecord,
};
use lru::LruCache;
use sled::Transactional;
use std::num::NonZeroUsize;
use std::sync::Mutex;

const SEP: u8 = 0;

pub struct KvStore {
    upload_files: sled::Tree,
    upload_segments: sled::Tree,
    download_files: sled::Tree,
    download_segments: sled::Tree,

    idx_upload_seg_by_task: sled::Tree,
    idx_upload_seg_by_status: sled::Tree,
    idx_download_seg_by_task: sled::Tree,
    idx_download_seg_by_status: sled::Tree,
    idx_download_file_by_file_id: sled::Tree,

    cache: Mutex<LruCache<String, Vec<u8>>>,
}

fn index_key(index_value: &str, primary_key: &str) -> Vec<u8> {
    let mut key = index_value.as_bytes().to_vec();
    key.push(SEP);
    key.extend_from_slice(primary_key.as_bytes());
    key
}

fn index_prefix(index_value: &str) -> Vec<u8> {
    let mut key = index_value.as_bytes().to_vec();
    key.push(SEP);
    key
}

fn primary_key_from_index_key(raw: &[u8]) -> MeshResult<String> {
    let pos = raw
        .iter()
        .position(|&b| b == SEP)
        .ok_or_else(|| crate::error::MeshError::Store("malformed index key".to_string()))?;
    Ok(String::from_utf8_lossy(&raw[pos + 1..]).to_string())
}

impl KvStore {
    pub fn open(db: &sled::Db) -> MeshResult<Self> {
        Ok(Self {
            upload_files: db.open_tree("upload_files")?,
            upload_segments: db.open_tree("upload_segments")?,
            download_files: db.open_tree("download_files")?,
            download_segments: db.open_tree("download_segments")?,
            idx_upload_seg_by_task: db.open_tree("idx_upload_seg_by_task")?,
            idx_upload_seg_by_status: db.open_tree("idx_upload_seg_by_status")?,
            idx_download_seg_by_task: db.open_tree("idx_download_seg_by_task")?,
            idx_download_seg_by_status: db.open_tree("idx_download_seg_by_status")?,
            idx_download_file_by_file_id: db.open_tree("idx_download_file_by_file_id")?,
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(4096).unwrap())),
        })
    }

    fn cache_key(prefix: &str, id: &str) -> String {
        format!("{}:{}", prefix, id)
    }

    fn invalidate(&self, prefix: &str, id: &str) {
        self.cache.lock().unwrap().pop(&Self::cache_key(prefix, id));
    }

    // ---- upload file records ----

    /// Insert-or-update: a duplicate primary key converts to an update and
    /// logs an info event, never errors (§4.4).
    pub fn upsert_upload_file(&self, rec: &UploadFileRecord) -> MeshResult<()> {
        let existed = self.upload_files.contains_key(rec.task_id.as_bytes())?;
        self.upload_files
            .insert(rec.task_id.as_bytes(), compact_marshal(rec)?)?;
        self.invalidate("upload_file", &rec.task_id);
        if existed {
            tracing::info!(task_id = %rec.task_id, "upload file record updated");
        }
        Ok(())
    }

    /// Partial update (§4.4/§6): `patch.status = Unspecified` means "leave
    /// the stored status alone" — the data model's only declared sentinel —
    /// so the merged record keeps whatever status is already on disk and
    /// takes every other field from `patch`. With no existing record, or
    /// with a concrete `patch.status`, this is equivalent to `upsert`.
    pub fn update_upload_file(&self, patch: &UploadFileRecord) -> MeshResult<()> {
        let merged = match self.get_upload_file(&patch.task_id)? {
            Some(existing) if patch.status == UploadFileStatus::Unspecified => {
                UploadFileRecord {
                    status: existing.status,
                    ..patch.clone()
                }
            }
            _ => patch.clone(),
        };
        self.upsert_upload_file(&merged)
    }

    pub fn get_upload_file(&self, task_id: &str) -> MeshResult<Option<UploadFileRecord>> {
        let key = Self::cache_key("upload_file", task_id);
        if let Some(bytes) = self.cache.lock().unwrap().get(&key) {
            return Ok(Some(compact_unmarshal(bytes)?));
        }
        match self.upload_files.get(task_id.as_bytes())? {
            Some(bytes) => {
                self.cache
                    .lock()
                    .unwrap()
                    .put(key, bytes.as_ref().to_vec());
                Ok(Some(compact_unmarshal(&bytes)?))
            }
            None => Ok(None),
        }
    }

    pub fn delete_upload_file(&self, task_id: &str) -> MeshResult<()> {
        self.upload_files.remove(task_id.as_bytes())?;
        self.invalidate("upload_file", task_id);
        Ok(())
    }

    /// All upload file records, most recently created first. Used by
    /// `UploadEngine::list` (§4.7's `query(filters, pagination)`); filtering
    /// beyond "all of them" is left to the caller.
    pub fn list_upload_files(&self) -> MeshResult<Vec<UploadFileRecord>> {
        let mut records = Vec::new();
        for entry in self.upload_files.iter() {
            let (_, bytes) = entry?;
            records.push(compact_unmarshal(&bytes)?);
        }
        records.sort_by(|a: &UploadFileRecord, b: &UploadFileRecord| b.upload_time.cmp(&a.upload_time));
        Ok(records)
    }

    // ---- upload segment records ----

    pub fn upsert_upload_segment(&self, rec: &UploadSegmentRecord) -> MeshResult<()> {
        let existed = self
            .upload_segments
            .contains_key(rec.segment_id.as_bytes())?;
        self.upload_segments
            .insert(rec.segment_id.as_bytes(), compact_marshal(rec)?)?;
        self.idx_upload_seg_by_task
            .insert(index_key(&rec.task_id, &rec.segment_id), &[])?;
        self.idx_upload_seg_by_status.insert(
            index_key(&status_tag(rec.status as u8), &rec.segment_id),
            &[],
        )?;
        self.invalidate("upload_segment", &rec.segment_id);
        if existed {
            tracing::info!(segment_id = %rec.segment_id, "upload segment record updated");
        }
        Ok(())
    }

    /// Partial update counterpart to [`Self::update_upload_file`] for
    /// segment records.
    pub fn update_upload_segment(&self, patch: &UploadSegmentRecord) -> MeshResult<()> {
        let merged = match self.get_upload_segment(&patch.segment_id)? {
            Some(existing) if patch.status == SegmentStatus::Unspecified => {
                UploadSegmentRecord {
                    status: existing.status,
                    ..patch.clone()
                }
            }
            _ => patch.clone(),
        };
        self.upsert_upload_segment(&merged)
    }

    pub fn get_upload_segment(&self, segment_id: &str) -> MeshResult<Option<UploadSegmentRecord>> {
        let key = Self::cache_key("upload_segment", segment_id);
        if let Some(bytes) = self.cache.lock().unwrap().get(&key) {
            return Ok(Some(compact_unmarshal(bytes)?));
        }
        match self.upload_segments.get(segment_id.as_bytes())? {
            Some(bytes) => {
                self.cache
                    .lock()
                    .unwrap()
                    .put(key, bytes.as_ref().to_vec());
                Ok(Some(compact_unmarshal(&bytes)?))
            }
            None => Ok(None),
        }
    }

    pub fn find_upload_segments_by_task_id(
        &self,
        task_id: &str,
    ) -> MeshResult<Vec<UploadSegmentRecord>> {
        let mut out = Vec::new();
        for kv in self
            .idx_upload_seg_by_task
            .scan_prefix(index_prefix(task_id))
        {
            let (key, _) = kv?;
            let segment_id = primary_key_from_index_key(&key)?;
            if let Some(rec) = self.get_upload_segment(&segment_id)? {
                out.push(rec);
            }
        }
        Ok(out)
    }

    pub fn find_upload_segments_by_task_id_and_status(
        &self,
        task_id: &str,
        status: SegmentStatus,
    ) -> MeshResult<Vec<UploadSegmentRecord>> {
        Ok(self
            .find_upload_segments_by_task_id(task_id)?
            .into_iter()
            .filter(|r| r.status == status)
            .collect())
    }

    pub fn count_upload_segments_by_task_id(&self, task_id: &str) -> MeshResult<usize> {
        Ok(self
            .idx_upload_seg_by_task
            .scan_prefix(index_prefix(task_id))
            .count())
    }

    /// `task_summary(task_id) -> (total_segments, completed_indices, data_segment_count)`.
    pub fn upload_task_summary(&self, task_id: &str) -> MeshResult<crate::model::TaskSummary> {
        let segments = self.find_upload_segments_by_task_id(task_id)?;
        let total_segments = segments.len();
        let data_segment_count = segments.iter().filter(|s| !s.is_rs_code).count();
        let completed_indices = segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Completed)
            .map(|s| s.segment_index)
            .collect();
        Ok(crate::model::TaskSummary {
            total_segments,
            completed_indices,
            data_segment_count,
        })
    }

    // ---- download file records ----

    pub fn upsert_download_file(&self, rec: &DownloadFileRecord) -> MeshResult<()> {
        let existed = self.download_files.contains_key(rec.task_id.as_bytes())?;
        self.download_files
            .insert(rec.task_id.as_bytes(), compact_marshal(rec)?)?;
        self.idx_download_file_by_file_id
            .insert(index_key(&rec.file_id, &rec.task_id), &[])?;
        self.invalidate("download_file", &rec.task_id);
        if existed {
            tracing::info!(task_id = %rec.task_id, "download file record updated");
        }
        Ok(())
    }

    /// Partial update counterpart to [`Self::update_upload_file`] for
    /// download file records.
    pub fn update_download_file(&self, patch: &DownloadFileRecord) -> MeshResult<()> {
        let merged = match self.get_download_file(&patch.task_id)? {
            Some(existing) if patch.status == DownloadFileStatus::Unspecified => {
                DownloadFileRecord {
                    status: existing.status,
                    ..patch.clone()
                }
            }
            _ => patch.clone(),
        };
        self.upsert_download_file(&merged)
    }

    pub fn get_download_file(&self, task_id: &str) -> MeshResult<Option<DownloadFileRecord>> {
        let key = Self::cache_key("download_file", task_id);
        if let Some(bytes) = self.cache.lock().unwrap().get(&key) {
            return Ok(Some(compact_unmarshal(bytes)?));
        }
        match self.download_files.get(task_id.as_bytes())? {
            Some(bytes) => {
                self.cache
                    .lock()
                    .unwrap()
                    .put(key, bytes.as_ref().to_vec());
                Ok(Some(compact_unmarshal(&bytes)?))
            }
            None => Ok(None),
        }
    }

    pub fn find_download_file_by_file_id(
        &self,
        file_id: &str,
    ) -> MeshResult<Option<DownloadFileRecord>> {
        for kv in self
            .idx_download_file_by_file_id
            .scan_prefix(index_prefix(file_id))
        {
            let (key, _) = kv?;
            let task_id = primary_key_from_index_key(&key)?;
            if let Some(rec) = self.get_download_file(&task_id)? {
                return Ok(Some(rec));
            }
        }
        Ok(None)
    }

    // ---- download segment records ----

    pub fn upsert_download_segment(&self, rec: &DownloadSegmentRecord) -> MeshResult<()> {
        let existed = self
            .download_segments
            .contains_key(rec.segment_id.as_bytes())?;
        self.download_segments
            .insert(rec.segment_id.as_bytes(), compact_marshal(rec)?)?;
        self.idx_download_seg_by_task
            .insert(index_key(&rec.task_id, &rec.segment_id), &[])?;
        self.idx_download_seg_by_status.insert(
            index_key(&status_tag(rec.status as u8), &rec.segment_id),
            &[],
        )?;
        self.invalidate("download_segment", &rec.segment_id);
        if existed {
            tracing::info!(segment_id = %rec.segment_id, "download segment record updated");
        }
        Ok(())
    }

    /// Partial update counterpart to [`Self::update_upload_file`] for
    /// download segment records.
    pub fn update_download_segment(&self, patch: &DownloadSegmentRecord) -> MeshResult<()> {
        let merged = match self.get_download_segment(&patch.segment_id)? {
            Some(existing) if patch.status == SegmentStatus::Unspecified => {
                DownloadSegmentRecord {
                    status: existing.status,
                    ..patch.clone()
                }
            }
            _ => patch.clone(),
        };
        self.upsert_download_segment(&merged)
    }

    pub fn get_download_segment(
        &self,
        segment_id: &str,
    ) -> MeshResult<Option<DownloadSegmentRecord>> {
        let key = Self::cache_key("download_segment", segment_id);
        if let Some(bytes) = self.cache.lock().unwrap().get(&key) {
            return Ok(Some(compact_unmarshal(bytes)?));
        }
        match self.download_segments.get(segment_id.as_bytes())? {
            Some(bytes) => {
                self.cache
                    .lock()
                    .unwrap()
                    .put(key, bytes.as_ref().to_vec());
                Ok(Some(compact_unmarshal(&bytes)?))
            }
            None => Ok(None),
        }
    }

    pub fn find_download_segments_by_task_id(
        &self,
        task_id: &str,
    ) -> MeshResult<Vec<DownloadSegmentRecord>> {
        let mut out = Vec::new();
        for kv in self
            .idx_download_seg_by_task
            .scan_prefix(index_prefix(task_id))
        {
            let (key, _) = kv?;
            let segment_id = primary_key_from_index_key(&key)?;
            if let Some(rec) = self.get_download_segment(&segment_id)? {
                out.push(rec);
            }
        }
        Ok(out)
    }

    pub fn find_download_segments_by_task_id_and_status(
        &self,
        task_id: &str,
        status: SegmentStatus,
    ) -> MeshResult<Vec<DownloadSegmentRecord>> {
        Ok(self
            .find_download_segments_by_task_id(task_id)?
            .into_iter()
            .filter(|r| r.status == status)
            .collect())
    }

    /// Atomically write a download file record and its N segment records,
    /// the download-side counterpart to `put_upload_task_transaction`. The
    /// primary file/segment rows commit together under a single sled
    /// transaction; the secondary-index batches (`idx_download_seg_by_task`,
    /// `idx_download_seg_by_status`, `idx_download_file_by_file_id`) are
    /// applied right after as separate, non-transactional writes, so a
    /// crash between the two leaves primary rows with stale or missing
    /// index entries until the next write for that key repairs them.
    pub fn put_download_task_transaction(
        &self,
        file: &DownloadFileRecord,
        segments: &[DownloadSegmentRecord],
    ) -> MeshResult<()> {
        let mut file_batch = sled::Batch::default();
        file_batch.insert(file.task_id.as_bytes(), compact_marshal(file)?);

        let mut seg_batch = sled::Batch::default();
        let mut by_task_batch = sled::Batch::default();
        let mut by_status_batch = sled::Batch::default();
        for seg in segments {
            seg_batch.insert(seg.segment_id.as_bytes(), compact_marshal(seg)?);
            by_task_batch.insert(index_key(&seg.task_id, &seg.segment_id), &[][..]);
            by_status_batch.insert(
                index_key(&status_tag(seg.status as u8), &seg.segment_id),
                &[][..],
            );
        }

        (&self.download_files, &self.download_segments)
            .transaction(|(files, segs)| {
                files.apply_batch(&file_batch)?;
                segs.apply_batch(&seg_batch)?;
                Ok::<(), sled::transaction::ConflictableTransactionError<()>>(())
            })
            .map_err(|e| crate::error::MeshError::Store(e.to_string()))?;
        self.idx_download_seg_by_task.apply_batch(by_task_batch)?;
        self.idx_download_seg_by_status
            .apply_batch(by_status_batch)?;
        self.idx_download_file_by_file_id
            .insert(index_key(&file.file_id, &file.task_id), &[])?;

        self.invalidate("download_file", &file.task_id);
        for seg in segments {
            self.invalidate("download_segment", &seg.segment_id);
        }
        Ok(())
    }

    /// Atomically write a file record and its N segment records. Both
    /// engines rely on this for task creation and for read-modify-write
    /// transitions; a failure rolls back the primary `upload_files`/
    /// `upload_segments` batch. As with the download counterpart, the
    /// `idx_upload_seg_by_task`/`idx_upload_seg_by_status` batches are
    /// applied after that transaction commits, not inside it — an error or
    /// crash in between can leave a committed record without matching index
    /// rows until the next write for that segment catches it back up.
    pub fn put_upload_task_transaction(
        &self,
        file: &UploadFileRecord,
        segments: &[UploadSegmentRecord],
    ) -> MeshResult<()> {
        let mut file_batch = sled::Batch::default();
        file_batch.insert(file.task_id.as_bytes(), compact_marshal(file)?);

        let mut seg_batch = sled::Batch::default();
        let mut by_task_batch = sled::Batch::default();
        let mut by_status_batch = sled::Batch::default();
        for seg in segments {
            seg_batch.insert(seg.segment_id.as_bytes(), compact_marshal(seg)?);
            by_task_batch.insert(index_key(&seg.task_id, &seg.segment_id), &[][..]);
            by_status_batch.insert(
                index_key(&status_tag(seg.status as u8), &seg.segment_id),
                &[][..],
            );
        }

        (&self.upload_files, &self.upload_segments)
            .transaction(|(files, segs)| {
                files.apply_batch(&file_batch)?;
                segs.apply_batch(&seg_batch)?;
                Ok::<(), sled::transaction::ConflictableTransactionError<()>>(())
            })
            .map_err(|e| crate::error::MeshError::Store(e.to_string()))?;
        self.idx_upload_seg_by_task.apply_batch(by_task_batch)?;
        self.idx_upload_seg_by_status.apply_batch(by_status_batch)?;

        self.invalidate("upload_file", &file.task_id);
        for seg in segments {
            self.invalidate("upload_segment", &seg.segment_id);
        }
        Ok(())
    }
}

fn status_tag(status: u8) -> String {
    format!("status-{}", status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UploadFileStatus;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn open_store() -> (tempfile::TempDir, KvStore) {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let store = KvStore::open(&db).unwrap();
        (dir, store)
    }

    fn sample_upload_file(task_id: &str) -> UploadFileRecord {
        UploadFileRecord {
            task_id: task_id.to_string(),
            file_id: "file-1".to_string(),
            path: "/tmp/report.pdf".to_string(),
            name: "report.pdf".to_string(),
            extension: "pdf".to_string(),
            size: 1024,
            content_type: "application/pdf".to_string(),
            sha256: [1u8; 32],
            upload_time: 1_700_000_000,
            started_at: 1_700_000_000,
            finished_at: 0,
            status: UploadFileStatus::Uploading,
            owner_priv: vec![],
            pubkey_hash: [2u8; 20],
            slice_table: vec![],
            first_key_share: vec![3u8; 33],
            error_message: None,
        }
    }

    fn sample_upload_segment(segment_id: &str, task_id: &str) -> UploadSegmentRecord {
        UploadSegmentRecord {
            segment_id: segment_id.to_string(),
            task_id: task_id.to_string(),
            segment_index: 0,
            size: 512,
            crc32: 0xDEADBEEF,
            is_rs_code: false,
            status: SegmentStatus::Uploading,
            storage_path: "/tmp/seg-0".to_string(),
            encryption_key: vec![4u8; 32],
            segment_node: HashMap::new(),
            attempts: 0,
        }
    }

    #[test]
    fn update_upload_file_with_unspecified_status_is_a_no_op() {
        let (_dir, store) = open_store();
        let original = sample_upload_file("task-1");
        store.upsert_upload_file(&original).unwrap();

        let mut patch = original.clone();
        patch.status = UploadFileStatus::Unspecified;
        store.update_upload_file(&patch).unwrap();

        let reloaded = store.get_upload_file("task-1").unwrap().unwrap();
        assert_eq!(reloaded.status, original.status);
        assert_eq!(reloaded.name, original.name);
        assert_eq!(reloaded.size, original.size);
    }

    #[test]
    fn update_upload_file_with_concrete_status_applies_it() {
        let (_dir, store) = open_store();
        store.upsert_upload_file(&sample_upload_file("task-2")).unwrap();

        let mut patch = sample_upload_file("task-2");
        patch.status = UploadFileStatus::Completed;
        store.update_upload_file(&patch).unwrap();

        let reloaded = store.get_upload_file("task-2").unwrap().unwrap();
        assert_eq!(reloaded.status, UploadFileStatus::Completed);
    }

    #[test]
    fn update_upload_segment_with_unspecified_status_is_a_no_op() {
        let (_dir, store) = open_store();
        let original = sample_upload_segment("seg-1", "task-1");
        store.upsert_upload_segment(&original).unwrap();

        let mut patch = original.clone();
        patch.status = SegmentStatus::Unspecified;
        patch.attempts = 1;
        store.update_upload_segment(&patch).unwrap();

        let reloaded = store.get_upload_segment("seg-1").unwrap().unwrap();
        assert_eq!(reloaded.status, original.status);
        assert_eq!(reloaded.attempts, 1);
    }
}
