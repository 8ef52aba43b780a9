//! Hash and codec primitives (C1): SHA-256 content hashing, CRC32 integrity,
//! and the compact binary marshal used by every persisted record.

use crate::error::MeshResult;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;

/// SHA-256 of a byte slice.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 of a reader, streamed in fixed-size chunks so callers don't need
/// to hold the whole file in memory just to hash it.
pub fn sha256_of_reader<R: Read>(mut reader: R) -> MeshResult<[u8; 32]> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

/// IEEE CRC32 of a byte slice. Used only for per-segment integrity, never
/// for authentication.
pub fn crc32_ieee(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Encode a serde-serializable record into the crate's stable compact
/// binary format (field-tagged by `bincode`'s struct layout; any change to
/// a record's field order is a breaking change for both upload and
/// download sides).
pub fn compact_marshal<T: Serialize>(value: &T) -> MeshResult<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Decode a record previously produced by [`compact_marshal`].
pub fn compact_unmarshal<T: DeserializeOwned>(bytes: &[u8]) -> MeshResult<T> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_is_deterministic() {
        assert_eq!(sha256(b"Test data"), sha256(b"Test data"));
        assert_ne!(sha256(b"Test data"), sha256(b"Test Data"));
    }

    #[test]
    fn sha256_of_reader_matches_in_memory() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(1000);
        let direct = sha256(&data);
        let streamed = sha256_of_reader(std::io::Cursor::new(&data)).unwrap();
        assert_eq!(direct, streamed);
    }

    #[test]
    fn crc32_detects_single_bit_flip() {
        let mut data = b"segment content".to_vec();
        let original = crc32_ieee(&data);
        data[3] ^= 0x01;
        assert_ne!(original, crc32_ieee(&data));
    }

    #[test]
    fn compact_marshal_round_trips() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Rec {
            a: u64,
            b: String,
            c: Vec<u8>,
        }
        let rec = Rec {
            a: 42,
            b: "hello".to_string(),
            c: vec![1, 2, 3],
        };
        let bytes = compact_marshal(&rec).unwrap();
        let back: Rec = compact_unmarshal(&bytes).unwrap();
        assert_eq!(rec, back);
    }
}
