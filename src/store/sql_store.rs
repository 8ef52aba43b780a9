//! Relational half of the metadata store (C4): holds each `FileSegmentStorage`
//! row a node persists on behalf of remote owners once it accepts a segment
//! over the `segment_send` protocol.
//!
//! Grounded in the reference node's `DatabaseManager` (`database.rs`):
//! rusqlite with `CREATE TABLE IF NOT EXISTS` + explicit indexes run once at
//! open time, `params!` for bound queries, `OptionalExtension` for
//! zero-or-one lookups. The schema itself is new (the reference table stores
//! human-readable aliases; this one stores the segment container's on-disk
//! metadata), but the access pattern is the same.

use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{MeshError, MeshResult};
use crate::model::FileSegmentStorage;

pub struct SqlStore {
    conn: Mutex<Connection>,
}

impl SqlStore {
    pub fn open(path: &Path) -> MeshResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = SqlStore {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> MeshResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS file_segment_storage (
                segment_id TEXT PRIMARY KEY,
                file_id TEXT NOT NULL,
                name TEXT NOT NULL,
                extension TEXT NOT NULL,
                size INTEGER NOT NULL,
                content_type TEXT NOT NULL,
                sha256 BLOB NOT NULL,
                upload_time INTEGER NOT NULL,
                p2pkh_script BLOB NOT NULL,
                p2pk_script BLOB NOT NULL,
                slice_table BLOB NOT NULL,
                segment_index INTEGER NOT NULL,
                crc32 INTEGER NOT NULL,
                segment_content BLOB NOT NULL,
                encryption_key BLOB NOT NULL,
                signature BLOB NOT NULL,
                shared INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 1,
                storage_path TEXT NOT NULL DEFAULT ''
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_fss_file_id ON file_segment_storage(file_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_fss_file_shared ON file_segment_storage(file_id, shared)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_fss_file_script ON file_segment_storage(file_id, p2pkh_script)",
            [],
        )?;
        Ok(())
    }

    pub fn put(&self, record: &FileSegmentStorage) -> MeshResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO file_segment_storage (
                segment_id, file_id, name, extension, size, content_type, sha256,
                upload_time, p2pkh_script, p2pk_script, slice_table, segment_index,
                crc32, segment_content, encryption_key, signature, shared, version,
                storage_path
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
            ON CONFLICT(segment_id) DO UPDATE SET
                name = excluded.name,
                extension = excluded.extension,
                size = excluded.size,
                content_type = excluded.content_type,
                sha256 = excluded.sha256,
                upload_time = excluded.upload_time,
                p2pkh_script = excluded.p2pkh_script,
                p2pk_script = excluded.p2pk_script,
                slice_table = excluded.slice_table,
                segment_index = excluded.segment_index,
                crc32 = excluded.crc32,
                segment_content = excluded.segment_content,
                encryption_key = excluded.encryption_key,
                signature = excluded.signature,
                shared = excluded.shared,
                version = excluded.version,
                storage_path = excluded.storage_path",
            params![
                record.segment_id,
                record.file_id,
                record.name,
                record.extension,
                record.size as i64,
                record.content_type,
                record.sha256.to_vec(),
                record.upload_time,
                record.p2pkh_script,
                record.p2pk_script,
                record.slice_table,
                record.segment_index,
                record.crc32,
                record.segment_content,
                record.encryption_key,
                record.signature,
                record.shared as i64,
                record.version,
                record.storage_path,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, segment_id: &str) -> MeshResult<Option<FileSegmentStorage>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT segment_id, file_id, name, extension, size, content_type, sha256,
                    upload_time, p2pkh_script, p2pk_script, slice_table, segment_index,
                    crc32, segment_content, encryption_key, signature, shared, version,
                    storage_path
             FROM file_segment_storage WHERE segment_id = ?1",
            params![segment_id],
            row_to_record,
        )
        .optional()
        .map_err(MeshError::from)
    }

    pub fn delete(&self, segment_id: &str) -> MeshResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM file_segment_storage WHERE segment_id = ?1",
            params![segment_id],
        )?;
        Ok(())
    }

    /// All segments this node holds for `file_id` signed by `p2pkh_script`,
    /// used to answer set-shared requests after verifying ownership.
    pub fn find_by_file_and_script(
        &self,
        file_id: &str,
        p2pkh_script: &[u8],
    ) -> MeshResult<Vec<FileSegmentStorage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT segment_id, file_id, name, extension, size, content_type, sha256,
                    upload_time, p2pkh_script, p2pk_script, slice_table, segment_index,
                    crc32, segment_content, encryption_key, signature, shared, version,
                    storage_path
             FROM file_segment_storage WHERE file_id = ?1 AND p2pkh_script = ?2",
        )?;
        let rows = stmt
            .query_map(params![file_id, p2pkh_script], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every segment this node holds for `file_id`, regardless of the
    /// `shared` flag or which script signed it — used to locate a sample
    /// row to verify a set-shared request's signer against.
    pub fn find_by_file(&self, file_id: &str) -> MeshResult<Vec<FileSegmentStorage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT segment_id, file_id, name, extension, size, content_type, sha256,
                    upload_time, p2pkh_script, p2pk_script, slice_table, segment_index,
                    crc32, segment_content, encryption_key, signature, shared, version,
                    storage_path
             FROM file_segment_storage WHERE file_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![file_id], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Segments this node holds for `file_id` that are flagged as shared,
    /// used to answer search-request lookups.
    pub fn find_shared_by_file(&self, file_id: &str) -> MeshResult<Vec<FileSegmentStorage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT segment_id, file_id, name, extension, size, content_type, sha256,
                    upload_time, p2pkh_script, p2pk_script, slice_table, segment_index,
                    crc32, segment_content, encryption_key, signature, shared, version,
                    storage_path
             FROM file_segment_storage WHERE file_id = ?1 AND shared = 1",
        )?;
        let rows = stmt
            .query_map(params![file_id], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn set_shared(&self, file_id: &str, shared: bool) -> MeshResult<usize> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "UPDATE file_segment_storage SET shared = ?1 WHERE file_id = ?2",
            params![shared as i64, file_id],
        )?;
        Ok(count)
    }
}

fn row_to_record(row: &Row) -> rusqlite::Result<FileSegmentStorage> {
    let sha256_blob: Vec<u8> = row.get(6)?;
    let mut sha256 = [0u8; 32];
    if sha256_blob.len() == 32 {
        sha256.copy_from_slice(&sha256_blob);
    }
    Ok(FileSegmentStorage {
        segment_id: row.get(0)?,
        file_id: row.get(1)?,
        name: row.get(2)?,
        extension: row.get(3)?,
        size: row.get::<_, i64>(4)? as u64,
        content_type: row.get(5)?,
        sha256,
        upload_time: row.get(7)?,
        p2pkh_script: row.get(8)?,
        p2pk_script: row.get(9)?,
        slice_table: row.get(10)?,
        segment_index: row.get(11)?,
        crc32: row.get(12)?,
        segment_content: row.get(13)?,
        encryption_key: row.get(14)?,
        signature: row.get(15)?,
        shared: row.get::<_, i64>(16)? != 0,
        version: row.get(17)?,
        storage_path: row.get(18)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(segment_id: &str, file_id: &str, shared: bool) -> FileSegmentStorage {
        FileSegmentStorage {
            segment_id: segment_id.to_string(),
            file_id: file_id.to_string(),
            name: "report.pdf".to_string(),
            extension: "pdf".to_string(),
            size: 1024,
            content_type: "application/pdf".to_string(),
            sha256: [7u8; 32],
            upload_time: 1_700_000_000,
            p2pkh_script: vec![0xAA, 0xBB],
            p2pk_script: vec![],
            slice_table: vec![1, 2, 3],
            segment_index: 0,
            crc32: 0xDEADBEEF,
            segment_content: vec![9; 64],
            encryption_key: vec![1; 32],
            signature: vec![2; 64],
            shared,
            version: 1,
            storage_path: format!("/tmp/meshfs-test/{}/{}", file_id, segment_id),
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let store = SqlStore::open(&dir.path().join("meta.sqlite")).unwrap();
        let record = sample("seg-1", "file-1", false);
        store.put(&record).unwrap();

        let fetched = store.get("seg-1").unwrap().unwrap();
        assert_eq!(fetched.file_id, "file-1");
        assert_eq!(fetched.crc32, 0xDEADBEEF);
        assert_eq!(fetched.sha256, [7u8; 32]);
    }

    #[test]
    fn upsert_overwrites_existing_row() {
        let dir = tempdir().unwrap();
        let store = SqlStore::open(&dir.path().join("meta.sqlite")).unwrap();
        store.put(&sample("seg-1", "file-1", false)).unwrap();
        store.put(&sample("seg-1", "file-1", true)).unwrap();

        let fetched = store.get("seg-1").unwrap().unwrap();
        assert!(fetched.shared);
    }

    #[test]
    fn find_by_file_and_script_filters_correctly() {
        let dir = tempdir().unwrap();
        let store = SqlStore::open(&dir.path().join("meta.sqlite")).unwrap();
        store.put(&sample("seg-1", "file-1", false)).unwrap();
        store.put(&sample("seg-2", "file-1", false)).unwrap();

        let found = store
            .find_by_file_and_script("file-1", &[0xAA, 0xBB])
            .unwrap();
        assert_eq!(found.len(), 2);

        let none = store.find_by_file_and_script("file-1", &[0x00]).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn set_shared_updates_all_matching_rows() {
        let dir = tempdir().unwrap();
        let store = SqlStore::open(&dir.path().join("meta.sqlite")).unwrap();
        store.put(&sample("seg-1", "file-1", false)).unwrap();
        store.put(&sample("seg-2", "file-1", false)).unwrap();

        let updated = store.set_shared("file-1", true).unwrap();
        assert_eq!(updated, 2);

        let shared = store.find_shared_by_file("file-1").unwrap();
        assert_eq!(shared.len(), 2);
    }

    #[test]
    fn delete_removes_row() {
        let dir = tempdir().unwrap();
        let store = SqlStore::open(&dir.path().join("meta.sqlite")).unwrap();
        store.put(&sample("seg-1", "file-1", false)).unwrap();
        store.delete("seg-1").unwrap();
        assert!(store.get("seg-1").unwrap().is_none());
    }
}
