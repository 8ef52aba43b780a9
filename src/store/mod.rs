//! Metadata store (C4): a KV half for task/segment bookkeeping local to this
//! node's own uploads and downloads, and a relational half for the segment
//! containers this node holds on behalf of remote owners.

pub mod kv_store;
pub mod sql_store;

pub use kv_store::KvStore;
pub use sql_store::SqlStore;

use std::path::Path;

use crate::error::MeshResult;

/// Both halves of the metadata store, opened together under the node's
/// `database_dir` (see `Config::database_dir`).
pub struct Store {
    pub kv: KvStore,
    pub sql: SqlStore,
}

impl Store {
    pub fn open(database_dir: &Path) -> MeshResult<Self> {
        std::fs::create_dir_all(database_dir)?;
        let db = sled::open(database_dir.join("kv"))?;
        let kv = KvStore::open(&db)?;
        let sql = SqlStore::open(&database_dir.join("meta.sqlite"))?;
        Ok(Store { kv, sql })
    }
}
