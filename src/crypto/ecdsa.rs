//! ECDSA key handling on secp256k1 (part of C2).
//!
//! `pubkey_hash = RIPEMD-160(SHA-256(uncompressed pubkey))`, matching the
//! Bitcoin-style address convention the script model (§4.2) builds on.

use crate::error::{MeshError, MeshResult};
use ripemd::Ripemd160;
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

/// An owner's signing key. Wraps `secp256k1::SecretKey`; never serialized
/// with `Debug`/`Display` so it can't end up in a log line by accident.
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate<R: rand::Rng + ?Sized>(rng: &mut R) -> Self {
        let secret = SecretKey::new(rng);
        let public = PublicKey::from_secret_key(&Secp256k1::new(), &secret);
        Self { secret, public }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> MeshResult<Self> {
        let secret = SecretKey::from_slice(bytes)?;
        let public = PublicKey::from_secret_key(&Secp256k1::new(), &secret);
        Ok(Self { secret, public })
    }

    /// DER-equivalent marshal: the raw 32-byte scalar, matching the
    /// convention `marshal_private_key`/`unmarshal_private_key` describe.
    pub fn marshal_private_key(&self) -> [u8; 32] {
        self.secret.secret_bytes()
    }

    pub fn unmarshal_private_key(bytes: &[u8]) -> MeshResult<Self> {
        Self::from_secret_bytes(bytes)
    }

    /// Uncompressed public key point (65 bytes, `0x04 || X || Y`).
    pub fn extract_public_key(&self) -> [u8; 65] {
        self.public.serialize_uncompressed()
    }

    /// Compressed public key point (33 bytes).
    pub fn marshal_public_key(&self) -> [u8; 33] {
        self.public.serialize()
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    /// Sign a message digest (the caller is expected to have already hashed
    /// whatever application-level payload is being signed — see
    /// `container.rs`'s signed-fields concatenation).
    pub fn sign(&self, digest: &[u8; 32]) -> MeshResult<Signature> {
        let msg = Message::from_digest(*digest);
        let secp = Secp256k1::new();
        Ok(secp.sign_ecdsa(&msg, &self.secret))
    }
}

/// Verify a signature against a public key and a message digest.
pub fn verify(public_key: &PublicKey, digest: &[u8; 32], signature: &Signature) -> MeshResult<()> {
    let msg = Message::from_digest(*digest);
    let secp = Secp256k1::new();
    secp.verify_ecdsa(&msg, signature, public_key)
        .map_err(|e| MeshError::Signature(e.to_string()))
}

/// `RIPEMD-160(SHA-256(uncompressed-pubkey))`.
pub fn pubkey_hash(public_key: &PublicKey) -> [u8; 20] {
    let uncompressed = public_key.serialize_uncompressed();
    let sha = Sha256::digest(uncompressed);
    let ripemd = Ripemd160::digest(sha);
    ripemd.into()
}

pub fn parse_public_key(bytes: &[u8]) -> MeshResult<PublicKey> {
    PublicKey::from_slice(bytes).map_err(MeshError::from)
}

pub fn parse_signature(bytes: &[u8]) -> MeshResult<Signature> {
    Signature::from_compact(bytes).map_err(MeshError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;

    #[test]
    fn sign_and_verify_round_trips() {
        let key = KeyPair::generate(&mut thread_rng());
        let digest = crate::hashcodec::sha256(b"container fields");
        let sig = key.sign(&digest).unwrap();
        verify(key.public_key(), &digest, &sig).unwrap();
    }

    #[test]
    fn verify_rejects_tampered_digest() {
        let key = KeyPair::generate(&mut thread_rng());
        let digest = crate::hashcodec::sha256(b"container fields");
        let sig = key.sign(&digest).unwrap();
        let mut tampered = digest;
        tampered[0] ^= 0xff;
        assert!(verify(key.public_key(), &tampered, &sig).is_err());
    }

    #[test]
    fn pubkey_hash_is_deterministic_and_20_bytes() {
        let key = KeyPair::generate(&mut thread_rng());
        let h1 = pubkey_hash(key.public_key());
        let h2 = pubkey_hash(key.public_key());
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 20);
    }

    #[test]
    fn marshal_unmarshal_private_key_round_trips() {
        let key = KeyPair::generate(&mut thread_rng());
        let bytes = key.marshal_private_key();
        let restored = KeyPair::unmarshal_private_key(&bytes).unwrap();
        assert_eq!(key.marshal_public_key(), restored.marshal_public_key());
    }
}
