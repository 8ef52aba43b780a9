//! Owner identity key load/save (part of C11's node bootstrap), adapted from
//! the reference node's `KeyManager` (`key_manager.rs`): same on-disk shape
//! — a binary secret-key file plus a JSON metadata sidecar under
//! `keys_dir` — but holding the crate's `crypto::ecdsa::KeyPair` (secp256k1
//! signing key) instead of an ECIES encryption key, since every owner
//! action here (container signatures, P2PKH scripts, set-shared requests)
//! is a signature, never an encrypt-to-recipient operation.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use rand::thread_rng;
use serde::{Deserialize, Serialize};

use crate::crypto::ecdsa::KeyPair;
use crate::error::{MeshError, MeshResult};

const DEFAULT_KEY_NAME: &str = "default";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyInfo {
    pub name: String,
    pub created: DateTime<Local>,
    pub public_key_hex: String,
    pub pubkey_hash_hex: String,
}

pub struct OwnerKey {
    pub pair: KeyPair,
    pub info: KeyInfo,
}

impl OwnerKey {
    pub fn generate(name: &str) -> Self {
        let pair = KeyPair::generate(&mut thread_rng());
        let info = KeyInfo {
            name: name.to_string(),
            created: Local::now(),
            public_key_hex: hex::encode(pair.marshal_public_key()),
            pubkey_hash_hex: hex::encode(crate::crypto::ecdsa::pubkey_hash(pair.public_key())),
        };
        Self { pair, info }
    }

    pub fn save(&self, keys_dir: &Path) -> MeshResult<()> {
        fs::create_dir_all(keys_dir)?;
        let key_file = key_path(keys_dir, &self.info.name);
        let info_file = info_path(keys_dir, &self.info.name);
        fs::write(&key_file, self.pair.marshal_private_key())?;
        fs::write(&info_file, serde_json::to_string_pretty(&self.info)?)?;
        tracing::info!(path = %key_file.display(), "owner key saved");
        Ok(())
    }

    pub fn load(keys_dir: &Path, name: &str) -> MeshResult<Self> {
        let key_bytes = fs::read(key_path(keys_dir, name))?;
        let pair = KeyPair::from_secret_bytes(&key_bytes)?;
        let info_json = fs::read_to_string(info_path(keys_dir, name))?;
        let info: KeyInfo = serde_json::from_str(&info_json)
            .map_err(|e| MeshError::Config(format!("invalid key info file: {e}")))?;
        Ok(Self { pair, info })
    }

    /// Load the node's default owner key, generating and persisting one on
    /// first run — the non-interactive path through the reference node's
    /// `setup_key_management_with_mode`.
    pub fn load_or_generate_default(keys_dir: &Path) -> MeshResult<Self> {
        if key_path(keys_dir, DEFAULT_KEY_NAME).exists() {
            Self::load(keys_dir, DEFAULT_KEY_NAME)
        } else {
            let key = Self::generate(DEFAULT_KEY_NAME);
            key.save(keys_dir)?;
            Ok(key)
        }
    }
}

fn key_path(keys_dir: &Path, name: &str) -> PathBuf {
    keys_dir.join(format!("{name}.key"))
}

fn info_path(keys_dir: &Path, name: &str) -> PathBuf {
    keys_dir.join(format!("{name}.info"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generated_key_saves_and_loads_back() {
        let dir = tempdir().unwrap();
        let key = OwnerKey::generate(DEFAULT_KEY_NAME);
        key.save(dir.path()).unwrap();

        let loaded = OwnerKey::load(dir.path(), DEFAULT_KEY_NAME).unwrap();
        assert_eq!(
            key.pair.marshal_public_key(),
            loaded.pair.marshal_public_key()
        );
        assert_eq!(key.info.public_key_hex, loaded.info.public_key_hex);
    }

    #[test]
    fn load_or_generate_default_is_idempotent() {
        let dir = tempdir().unwrap();
        let first = OwnerKey::load_or_generate_default(dir.path()).unwrap();
        let second = OwnerKey::load_or_generate_default(dir.path()).unwrap();
        assert_eq!(
            first.pair.marshal_public_key(),
            second.pair.marshal_public_key()
        );
    }
}
