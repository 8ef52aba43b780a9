//! Crypto kit (C2): ECDSA key handling, P2PKH/P2PK scripts, the AES-GCM
//! segment cipher, Shamir (2,3) secret sharing, and the Reed-Solomon
//! encoder/decoder.

pub mod cipher;
pub mod ecdsa;
pub mod reed_solomon;
pub mod script;
pub mod shamir;
