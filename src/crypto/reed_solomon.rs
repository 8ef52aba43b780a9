//! Reed-Solomon encode/decode wrapper (part of C2). Systematic RS(k,m):
//! `k` data shards, `m` parity shards. Shards are always equal-length; the
//! last data shard is zero-padded by the caller before `split`.

use crate::error::{MeshError, MeshResult};
use reed_solomon_erasure::galois_8::ReedSolomon;

pub struct RsCodec {
    data_shards: usize,
    parity_shards: usize,
    inner: ReedSolomon,
}

impl RsCodec {
    pub fn new(data_shards: usize, parity_shards: usize) -> MeshResult<Self> {
        if data_shards == 0 || parity_shards == 0 {
            return Err(MeshError::Crypto(
                "data_shards and parity_shards must both be >= 1".to_string(),
            ));
        }
        let inner = ReedSolomon::new(data_shards, parity_shards)?;
        Ok(Self {
            data_shards,
            parity_shards,
            inner,
        })
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Split `data` into `data_shards` equal-length pieces, zero-padding the
    /// final piece, then append `parity_shards` empty pieces ready for
    /// `encode`.
    pub fn split(&self, data: &[u8]) -> Vec<Vec<u8>> {
        let shard_len = (data.len() + self.data_shards - 1) / self.data_shards.max(1);
        let shard_len = shard_len.max(1);
        let mut shards = vec![vec![0u8; shard_len]; self.total_shards()];
        for (i, shard) in shards.iter_mut().enumerate().take(self.data_shards) {
            let start = i * shard_len;
            if start >= data.len() {
                continue;
            }
            let end = (start + shard_len).min(data.len());
            shard[..end - start].copy_from_slice(&data[start..end]);
        }
        shards
    }

    /// Fill the parity shards in place.
    pub fn encode(&self, shards: &mut [Vec<u8>]) -> MeshResult<()> {
        self.inner.encode(shards)?;
        Ok(())
    }

    /// Verify that the parity shards are consistent with the data shards.
    pub fn verify(&self, shards: &[Vec<u8>]) -> MeshResult<bool> {
        Ok(self.inner.verify(shards)?)
    }

    /// Reconstruct missing shards in place. Requires at least `data_shards`
    /// entries to be `Some`; fails with `ErrInsufficientShards` otherwise.
    pub fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> MeshResult<()> {
        let present = shards.iter().filter(|s| s.is_some()).count();
        if present < self.data_shards {
            return Err(MeshError::InsufficientShards(format!(
                "have {} shards, need at least {}",
                present, self.data_shards
            )));
        }
        self.inner.reconstruct(shards)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_with_no_losses() {
        let codec = RsCodec::new(4, 2).unwrap();
        let data = b"the quick brown fox jumps over the lazy dog, repeated many times over".repeat(10);
        let mut shards = codec.split(&data);
        codec.encode(&mut shards).unwrap();

        let mut as_options: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        codec.reconstruct(&mut as_options).unwrap();

        let mut out = Vec::new();
        for shard in as_options.iter().take(codec.data_shards()) {
            out.extend_from_slice(shard.as_ref().unwrap());
        }
        out.truncate(data.len());
        assert_eq!(out, data);
    }

    #[test]
    fn reconstructs_after_losing_parity_worth_of_shards() {
        let codec = RsCodec::new(10, 4).unwrap();
        let data = vec![7u8; 10_000];
        let mut shards = codec.split(&data);
        codec.encode(&mut shards).unwrap();

        let mut as_options: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        for i in [0usize, 3, 7, 11] {
            as_options[i] = None;
        }
        codec.reconstruct(&mut as_options).unwrap();

        let mut out = Vec::new();
        for shard in as_options.iter().take(codec.data_shards()) {
            out.extend_from_slice(shard.as_ref().unwrap());
        }
        out.truncate(data.len());
        assert_eq!(out, data);
    }

    #[test]
    fn fails_with_insufficient_shards() {
        let codec = RsCodec::new(10, 4).unwrap();
        let data = vec![1u8; 1000];
        let mut shards = codec.split(&data);
        codec.encode(&mut shards).unwrap();

        let mut as_options: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        for i in 0..5 {
            as_options[i] = None;
        }
        let err = codec.reconstruct(&mut as_options).unwrap_err();
        assert!(matches!(err, MeshError::InsufficientShards(_)));
    }
}
