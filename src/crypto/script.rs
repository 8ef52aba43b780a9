//! Minimal stack-machine script model used for container authorization
//! (part of C2). Scripts are opaque blobs produced by a builder and written
//! verbatim into the container's `P2PKHSCRIPT`/`P2PKSCRIPT` sub-segments; a
//! verifier only ever extracts the embedded pubkey/pubkey-hash back out, it
//! never actually executes a stack machine.

use crate::crypto::ecdsa;
use crate::error::{MeshError, MeshResult};
use secp256k1::PublicKey;

const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;

/// `OP_DUP OP_HASH160 <pubkey_hash> OP_EQUALVERIFY OP_CHECKSIG`
pub fn build_p2pkh(pubkey_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(4 + 20);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    script.extend_from_slice(pubkey_hash);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

/// `<pubkey> OP_CHECKSIG`
pub fn build_p2pk(pubkey: &[u8; 33]) -> Vec<u8> {
    let mut script = Vec::with_capacity(33 + 1);
    script.extend_from_slice(pubkey);
    script.push(OP_CHECKSIG);
    script
}

/// Extract the `pubkey_hash` a P2PKH script was built for, for comparison
/// against the expected owner.
pub fn pubkey_hash_from_p2pkh(script: &[u8]) -> MeshResult<[u8; 20]> {
    if script.len() != 4 + 20
        || script[0] != OP_DUP
        || script[1] != OP_HASH160
        || script[22] != OP_EQUALVERIFY
        || script[23] != OP_CHECKSIG
    {
        return Err(MeshError::Script("malformed P2PKH script".to_string()));
    }
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&script[2..22]);
    Ok(hash)
}

/// Extract the pubkey a P2PK script was built for.
pub fn pubkey_from_p2pk(script: &[u8]) -> MeshResult<PublicKey> {
    if script.len() != 33 + 1 || script[33] != OP_CHECKSIG {
        return Err(MeshError::Script("malformed P2PK script".to_string()));
    }
    ecdsa::parse_public_key(&script[..33])
}

/// Verify that a P2PKH script's embedded pubkey_hash matches `expected`.
pub fn verify_p2pkh_owner(script: &[u8], expected: &[u8; 20]) -> MeshResult<()> {
    let actual = pubkey_hash_from_p2pkh(script)?;
    if &actual != expected {
        return Err(MeshError::Script(
            "P2PKH script does not match expected owner".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ecdsa::KeyPair;
    use rand::thread_rng;

    #[test]
    fn p2pkh_round_trips() {
        let key = KeyPair::generate(&mut thread_rng());
        let hash = ecdsa::pubkey_hash(key.public_key());
        let script = build_p2pkh(&hash);
        assert_eq!(pubkey_hash_from_p2pkh(&script).unwrap(), hash);
        verify_p2pkh_owner(&script, &hash).unwrap();
    }

    #[test]
    fn p2pkh_rejects_wrong_owner() {
        let key = KeyPair::generate(&mut thread_rng());
        let hash = ecdsa::pubkey_hash(key.public_key());
        let script = build_p2pkh(&hash);
        let mut other = hash;
        other[0] ^= 0xff;
        assert!(verify_p2pkh_owner(&script, &other).is_err());
    }

    #[test]
    fn p2pk_round_trips() {
        let key = KeyPair::generate(&mut thread_rng());
        let pubkey = key.marshal_public_key();
        let script = build_p2pk(&pubkey);
        let parsed = pubkey_from_p2pk(&script).unwrap();
        assert_eq!(parsed, *key.public_key());
    }

    #[test]
    fn malformed_script_is_rejected() {
        assert!(pubkey_hash_from_p2pkh(&[0u8; 10]).is_err());
    }
}
