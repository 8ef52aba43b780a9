//! AES-GCM segment cipher (part of C2). Each segment is encrypted with its
//! own 256-bit key, stored in `encryption_key`. The nonce is derived
//! deterministically from the segment id so re-encrypting the same segment
//! with the same key always reproduces the same ciphertext (§4.2, S3).

use crate::error::MeshResult;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};

/// 256-bit segment encryption key.
pub type SegmentKey = [u8; 32];

/// First 12 bytes of `SHA-256(segment_id)`, used as the AES-GCM nonce.
fn derive_nonce(segment_id: &[u8]) -> [u8; 12] {
    let digest = crate::hashcodec::sha256(segment_id);
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&digest[..12]);
    nonce
}

pub fn generate_key<R: rand::Rng + ?Sized>(rng: &mut R) -> SegmentKey {
    let mut key = [0u8; 32];
    rng.fill(&mut key);
    key
}

pub fn encrypt(key: &SegmentKey, segment_id: &[u8], plaintext: &[u8]) -> MeshResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = derive_nonce(segment_id);
    let ciphertext = cipher.encrypt(Nonce::from_slice(&nonce), plaintext)?;
    Ok(ciphertext)
}

pub fn decrypt(key: &SegmentKey, segment_id: &[u8], ciphertext: &[u8]) -> MeshResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = derive_nonce(segment_id);
    let plaintext = cipher.decrypt(Nonce::from_slice(&nonce), ciphertext)?;
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;

    #[test]
    fn encrypt_decrypt_round_trips() {
        let key = generate_key(&mut thread_rng());
        let segment_id = b"segment-0";
        let plaintext = b"shard bytes go here";
        let ciphertext = encrypt(&key, segment_id, plaintext).unwrap();
        let decrypted = decrypt(&key, segment_id, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn same_key_and_segment_id_reproduce_ciphertext() {
        let key = generate_key(&mut thread_rng());
        let segment_id = b"segment-0";
        let plaintext = b"deterministic nonce derivation";
        let c1 = encrypt(&key, segment_id, plaintext).unwrap();
        let c2 = encrypt(&key, segment_id, plaintext).unwrap();
        assert_eq!(c1, c2);
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let key = generate_key(&mut thread_rng());
        let other_key = generate_key(&mut thread_rng());
        let segment_id = b"segment-0";
        let ciphertext = encrypt(&key, segment_id, b"payload").unwrap();
        assert!(decrypt(&other_key, segment_id, &ciphertext).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails_to_decrypt() {
        let key = generate_key(&mut thread_rng());
        let segment_id = b"segment-0";
        let mut ciphertext = encrypt(&key, segment_id, b"payload").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xff;
        assert!(decrypt(&key, segment_id, &ciphertext).is_err());
    }
}
