//! Shamir (2,3) threshold secret sharing over GF(p), p = order of the
//! secp256k1 curve (part of C2). `split(secret) -> [s1, s2, s3]`; any two of
//! the three shares reconstruct the secret via Lagrange interpolation
//! modulo p. The secret fed in is `SHA-256(private-key ‖ file_content_sha256)`
//! (§4.2), i.e. always exactly 32 bytes, but the implementation makes no
//! assumption beyond "fits in the field".

use crate::error::{MeshError, MeshResult};
use num_bigint::{BigInt, BigUint, Sign};
use num_traits::{One, Zero};
use rand::RngCore;

const ORDER_HEX: &str = "FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFEBAAEDCE6AF48A03BBFD25E8CD0364141";

/// One Shamir share: `(x, f(x) mod p)`. `y` is always 32 bytes, zero-padded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    pub x: u8,
    pub y: [u8; 32],
}

impl Share {
    pub fn to_bytes(&self) -> [u8; 33] {
        let mut out = [0u8; 33];
        out[0] = self.x;
        out[1..].copy_from_slice(&self.y);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> MeshResult<Self> {
        if bytes.len() != 33 {
            return Err(MeshError::Crypto(format!(
                "shamir share must be 33 bytes, got {}",
                bytes.len()
            )));
        }
        let mut y = [0u8; 32];
        y.copy_from_slice(&bytes[1..]);
        Ok(Share { x: bytes[0], y })
    }
}

fn order() -> BigUint {
    BigUint::parse_bytes(ORDER_HEX.as_bytes(), 16).expect("static hex literal is valid")
}

fn to_fixed_be(value: &BigUint) -> [u8; 32] {
    let bytes = value.to_bytes_be();
    let mut out = [0u8; 32];
    let start = 32usize.saturating_sub(bytes.len());
    out[start..].copy_from_slice(&bytes[bytes.len().saturating_sub(32)..]);
    out
}

/// Extended Euclidean modular inverse of `a` modulo `p`.
fn mod_inverse(a: &BigInt, p: &BigInt) -> MeshResult<BigInt> {
    let (mut old_r, mut r) = (a.clone(), p.clone());
    let (mut old_s, mut s) = (BigInt::one(), BigInt::zero());
    while !r.is_zero() {
        let quotient = &old_r / &r;
        let tmp_r = &old_r - &quotient * &r;
        old_r = r;
        r = tmp_r;
        let tmp_s = &old_s - &quotient * &s;
        old_s = s;
        s = tmp_s;
    }
    if old_r != BigInt::one() && old_r != -BigInt::one() {
        return Err(MeshError::Crypto(
            "shamir share x value is not invertible modulo the field order".to_string(),
        ));
    }
    let mut inv = old_s % p;
    if inv.sign() == Sign::Minus {
        inv += p;
    }
    Ok(inv)
}

/// Split `secret` into 3 shares such that any 2 reconstruct it.
pub fn split<R: RngCore>(secret: &[u8], rng: &mut R) -> MeshResult<[Share; 3]> {
    let p = order();
    let secret_int = BigUint::from_bytes_be(secret) % &p;

    // f(x) = secret + a1 * x (mod p), degree 1 so any 2 of 3 points determine it.
    let a1 = {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        BigUint::from_bytes_be(&bytes) % &p
    };

    let mut shares = Vec::with_capacity(3);
    for x in 1u8..=3u8 {
        let x_big = BigUint::from(x as u64);
        let y = (&secret_int + &a1 * &x_big) % &p;
        shares.push(Share {
            x,
            y: to_fixed_be(&y),
        });
    }
    Ok([shares[0].clone(), shares[1].clone(), shares[2].clone()])
}

/// Evaluate the degree-1 polynomial determined by `shares` at an arbitrary
/// `x_target`, via Lagrange interpolation. `reconstruct` is the special case
/// `x_target = 0` (the secret itself); any other `x_target` recovers the
/// share a third party would have received at that x — used to derive the
/// shard encryption key (`x = 2`, i.e. `s2`) from any two of the three
/// shares without first recovering the secret.
fn interpolate(shares: &[Share], x_target: i64) -> MeshResult<[u8; 32]> {
    if shares.len() < 2 {
        return Err(MeshError::Crypto(
            "shamir interpolation requires at least 2 shares".to_string(),
        ));
    }
    let p_uint = order();
    let p = BigInt::from_biguint(Sign::Plus, p_uint);
    let x_target = BigInt::from(x_target);

    let mut acc = BigInt::zero();
    for (i, share_i) in shares.iter().enumerate() {
        let xi = BigInt::from(share_i.x as i64);
        let yi = BigInt::from_biguint(Sign::Plus, BigUint::from_bytes_be(&share_i.y));

        let mut numerator = BigInt::one();
        let mut denominator = BigInt::one();
        for (j, share_j) in shares.iter().enumerate() {
            if i == j {
                continue;
            }
            let xj = BigInt::from(share_j.x as i64);
            numerator *= &x_target - &xj;
            denominator *= &xi - &xj;
        }
        let denom_mod = ((&denominator % &p) + &p) % &p;
        let inv = mod_inverse(&denom_mod, &p)?;
        let term = (&yi * &numerator % &p) * &inv % &p;
        acc = (acc + term) % &p;
    }
    acc = (acc + &p) % &p;
    acc %= &p;
    let (_, bytes) = acc.to_bytes_be();
    let mut out = [0u8; 32];
    let start = 32usize.saturating_sub(bytes.len());
    out[start..].copy_from_slice(&bytes[bytes.len().saturating_sub(32)..]);
    Ok(out)
}

/// Reconstruct the secret from any 2 (or more, redundantly) shares via
/// Lagrange interpolation at x = 0.
pub fn reconstruct(shares: &[Share]) -> MeshResult<[u8; 32]> {
    interpolate(shares, 0)
}

/// Recover the value a share at `x` would hold, from any 2 other shares,
/// without reconstructing the secret first (§4.2/§4.7 step 7: deriving a
/// shard's `encryption_key` from `first_key_share` + the container's
/// `ENCRYPTIONKEY` share).
pub fn interpolate_share(shares: &[Share], x: u8) -> MeshResult<[u8; 32]> {
    interpolate(shares, x as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;

    #[test]
    fn any_two_of_three_shares_recover_the_secret() {
        let secret = crate::hashcodec::sha256(b"owner-priv || file-sha256");
        let shares = split(&secret, &mut thread_rng()).unwrap();

        for (i, j) in [(0, 1), (0, 2), (1, 2)] {
            let recovered = reconstruct(&[shares[i].clone(), shares[j].clone()]).unwrap();
            assert_eq!(recovered, secret, "pair ({}, {}) failed to recover", i, j);
        }
    }

    #[test]
    fn all_three_shares_also_recover_the_secret() {
        let secret = crate::hashcodec::sha256(b"another secret");
        let shares = split(&secret, &mut thread_rng()).unwrap();
        let recovered = reconstruct(&shares).unwrap();
        assert_eq!(recovered, secret);
    }

    #[test]
    fn share_byte_round_trip() {
        let secret = crate::hashcodec::sha256(b"yet another secret");
        let shares = split(&secret, &mut thread_rng()).unwrap();
        for share in &shares {
            let bytes = share.to_bytes();
            let back = Share::from_bytes(&bytes).unwrap();
            assert_eq!(*share, back);
        }
    }

    #[test]
    fn reconstruction_requires_at_least_two_shares() {
        let secret = crate::hashcodec::sha256(b"secret");
        let shares = split(&secret, &mut thread_rng()).unwrap();
        assert!(reconstruct(&shares[..1]).is_err());
    }

    #[test]
    fn interpolate_share_recovers_the_missing_share_from_any_two_others() {
        let secret = crate::hashcodec::sha256(b"file master secret");
        let shares = split(&secret, &mut thread_rng()).unwrap();

        // s2 (x=2) recovered from s1 and s3 (x=1, x=3) alone.
        let recovered_s2 = interpolate_share(&[shares[0].clone(), shares[2].clone()], 2).unwrap();
        assert_eq!(recovered_s2, shares[1].y);

        // s1 (x=1) recovered from s2 and s3.
        let recovered_s1 = interpolate_share(&[shares[1].clone(), shares[2].clone()], 1).unwrap();
        assert_eq!(recovered_s1, shares[0].y);
    }
}
