//! Cross-group discrete-log equality proof between ed25519 and secp256k1.
//!
//! The prover commits to every bit `b_i` of a 252-bit secret `x` on both
//! curves, `C_i = b_i*G + r_i*H`, with blinders chosen so that
//! `sum(2^i * r_i) == 0`. Summing the weighted commitments therefore yields
//! `x*G` on each curve, which is how the verifier recovers both public keys.
//! Each bit carries a two-member ring signature showing that `C_i` opens to
//! either 0 or 1 with the same bit on both curves: the ring shares one
//! challenge chain, and challenges are truncated to 250 bits so they are valid
//! scalars in both groups.
//!
//! Proof layout (all fixed width):
//!
//! ```text
//! X_ed (32) || X_secp (33) || 252 * [ C_ed (32) | C_secp (33) | e0 (32) |
//!                                     z_ed0 (32) | z_secp0 (32) |
//!                                     z_ed1 (32) | z_secp1 (32) ]
//! ```

use bitcoin::hashes::{Hash as _, HashEngine as _, sha256};
use bitcoin::secp256k1::{
    self, PublicKey as SecpPublicKey, Scalar as SecpScalar, Secp256k1, SecretKey,
};
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity as _;
use rand::RngCore as _;
use rand::rngs::OsRng;
use zeroize::Zeroize as _;

use crate::xmr::keys::{PublicKey as Ed25519PublicKey, basepoint};

pub const SECRET_BITS: usize = 252;

const ED_POINT_LEN: usize = 32;
const SECP_POINT_LEN: usize = 33;
const SCALAR_LEN: usize = 32;
const BIT_PROOF_LEN: usize = ED_POINT_LEN + SECP_POINT_LEN + 5 * SCALAR_LEN;
pub const PROOF_LEN: usize = ED_POINT_LEN + SECP_POINT_LEN + SECRET_BITS * BIT_PROOF_LEN;

const CHALLENGE_DOMAIN: &[u8] = b"eth-xmr-swap/dleq/v1";

/// Monero's second generator `H` (used for Pedersen commitments in RingCT).
const ED25519_H: [u8; 32] = [
    0x8b, 0x65, 0x59, 0x70, 0x15, 0x37, 0x99, 0xaf, 0x2a, 0xea, 0xdc, 0x9f, 0xf1, 0xad, 0xd0, 0xea,
    0x6c, 0x72, 0x51, 0xd5, 0x41, 0x54, 0xcf, 0xa9, 0x2c, 0x17, 0x3a, 0x0d, 0xd3, 0x9c, 0x1f, 0x94,
];

/// BIP-341 nothing-up-my-sleeve point.
const SECP256K1_H: [u8; 33] = [
    0x02, 0x50, 0x92, 0x9b, 0x74, 0xc1, 0xa0, 0x49, 0x54, 0xb7, 0x8b, 0x4b, 0x60, 0x35, 0xe9, 0x7a,
    0x5e, 0x07, 0x8a, 0x5a, 0x0f, 0x28, 0xec, 0x96, 0xd5, 0x47, 0xbf, 0xee, 0x9a, 0xce, 0x80, 0x3a,
    0xc0,
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DleqError {
    #[error("proof must be {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("invalid ed25519 point in proof")]
    Ed25519Point,
    #[error("invalid secp256k1 point in proof")]
    Secp256k1Point,
    #[error("invalid scalar in proof")]
    Scalar,
    #[error("ring signature for bit {0} does not verify")]
    Ring(usize),
    #[error("bit commitments do not sum to the {0} public key")]
    Aggregate(&'static str),
    #[error("secp256k1 arithmetic: {0}")]
    Secp256k1(String),
}

impl From<secp256k1::Error> for DleqError {
    fn from(e: secp256k1::Error) -> Self {
        DleqError::Secp256k1(e.to_string())
    }
}

/// The proven secret in little-endian (ed25519) byte order.
pub struct DleqSecret([u8; 32]);

impl DleqSecret {
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Drop for DleqSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proof(Vec<u8>);

impl Proof {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyResult {
    pub ed25519: Ed25519PublicKey,
    pub secp256k1: SecpPublicKey,
}

pub trait DleqProver: Send + Sync {
    fn prove(&self) -> Result<(DleqSecret, Proof), DleqError>;

    fn verify(&self, proof: &Proof) -> Result<VerifyResult, DleqError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CrossGroupDleq;

impl DleqProver for CrossGroupDleq {
    fn prove(&self) -> Result<(DleqSecret, Proof), DleqError> {
        let mut bytes = [0u8; 32];
        loop {
            OsRng.fill_bytes(&mut bytes);
            bytes[31] &= 0x0f;
            if bytes.iter().any(|b| *b != 0) {
                break;
            }
        }
        let secret = DleqSecret(bytes);
        bytes.zeroize();
        let proof = prove_secret(&secret)?;
        Ok((secret, proof))
    }

    fn verify(&self, proof: &Proof) -> Result<VerifyResult, DleqError> {
        verify_proof(proof.as_bytes())
    }
}

struct Generators {
    secp: Secp256k1<secp256k1::All>,
    g_ed: EdwardsPoint,
    h_ed: EdwardsPoint,
    g_secp: SecpPublicKey,
    h_secp: SecpPublicKey,
}

impl Generators {
    fn new() -> Result<Self, DleqError> {
        let secp = Secp256k1::new();
        let h_ed = CompressedEdwardsY(ED25519_H)
            .decompress()
            .ok_or(DleqError::Ed25519Point)?;
        let g_secp = SecpPublicKey::from_secret_key(&secp, &secret_key_from_scalar(SecpScalar::ONE)?);
        let h_secp = SecpPublicKey::from_slice(&SECP256K1_H)?;
        Ok(Self {
            secp,
            g_ed: basepoint(),
            h_ed,
            g_secp,
            h_secp,
        })
    }

    fn secp_mul(&self, point: &SecpPublicKey, scalar: &SecpScalar) -> Result<SecpPublicKey, DleqError> {
        Ok(point.mul_tweak(&self.secp, scalar)?)
    }

    fn secp_sub(&self, a: &SecpPublicKey, b: &SecpPublicKey) -> Result<SecpPublicKey, DleqError> {
        Ok(a.combine(&b.negate(&self.secp))?)
    }

    /// `z*H - e*P` on secp256k1.
    fn secp_ring_point(
        &self,
        z: &SecpScalar,
        e: &SecpScalar,
        p: &SecpPublicKey,
    ) -> Result<SecpPublicKey, DleqError> {
        let zh = self.secp_mul(&self.h_secp, z)?;
        let ep = self.secp_mul(p, e)?;
        self.secp_sub(&zh, &ep)
    }
}

struct Challenge {
    bytes: [u8; 32],
    ed: Scalar,
    secp: SecpScalar,
}

impl Challenge {
    fn from_bytes(bytes: [u8; 32]) -> Result<Self, DleqError> {
        if bytes[0] & !0x03 != 0 {
            return Err(DleqError::Scalar);
        }
        let mut le = bytes;
        le.reverse();
        Ok(Self {
            bytes,
            ed: Scalar::from_bytes_mod_order(le),
            secp: SecpScalar::from_be_bytes(bytes).map_err(|_| DleqError::Scalar)?,
        })
    }
}

struct Transcript<'a> {
    x_ed: &'a [u8; 32],
    x_secp: &'a [u8; 33],
}

impl Transcript<'_> {
    fn challenge(
        &self,
        index: usize,
        c_ed: &[u8; 32],
        c_secp: &[u8; 33],
        r_ed: &EdwardsPoint,
        r_secp: &SecpPublicKey,
    ) -> Result<Challenge, DleqError> {
        let mut engine = sha256::Hash::engine();
        engine.input(CHALLENGE_DOMAIN);
        engine.input(self.x_ed);
        engine.input(self.x_secp);
        engine.input(&(index as u16).to_le_bytes());
        engine.input(c_ed);
        engine.input(c_secp);
        engine.input(r_ed.compress().as_bytes());
        engine.input(&r_secp.serialize());
        let mut bytes = sha256::Hash::from_engine(engine).to_byte_array();
        bytes[0] &= 0x03;
        Challenge::from_bytes(bytes)
    }
}

fn random_ed_scalar() -> Scalar {
    let mut wide = [0u8; 64];
    OsRng.fill_bytes(&mut wide);
    let scalar = Scalar::from_bytes_mod_order_wide(&wide);
    wide.zeroize();
    scalar
}

fn random_secret_key() -> SecretKey {
    let mut bytes = [0u8; 32];
    loop {
        OsRng.fill_bytes(&mut bytes);
        if let Ok(key) = SecretKey::from_slice(&bytes) {
            bytes.zeroize();
            return key;
        }
    }
}

fn secret_key_from_scalar(scalar: SecpScalar) -> Result<SecretKey, DleqError> {
    Ok(SecretKey::from_slice(&scalar.to_be_bytes())?)
}

fn secp_pow2(i: usize) -> Result<SecpScalar, DleqError> {
    let mut bytes = [0u8; 32];
    bytes[31 - i / 8] = 1 << (i % 8);
    SecpScalar::from_be_bytes(bytes).map_err(|_| DleqError::Scalar)
}

/// `k + e*r` on secp256k1.
fn secp_response(k: &SecretKey, e: &SecpScalar, r: &SecretKey) -> Result<SecpScalar, DleqError> {
    let er = r.mul_tweak(e)?;
    Ok(SecpScalar::from(k.add_tweak(&SecpScalar::from(er))?))
}

fn bit(secret: &[u8; 32], i: usize) -> bool {
    (secret[i / 8] >> (i % 8)) & 1 == 1
}

fn prove_secret(secret: &DleqSecret) -> Result<Proof, DleqError> {
    let gens = Generators::new()?;
    let x = secret.to_bytes();

    let x_ed_scalar = Option::<Scalar>::from(Scalar::from_canonical_bytes(x)).ok_or(DleqError::Scalar)?;
    let x_ed = EdwardsPoint::mul_base(&x_ed_scalar).compress().to_bytes();
    let mut x_be = x;
    x_be.reverse();
    let x_secp = SecpPublicKey::from_secret_key(&gens.secp, &SecretKey::from_slice(&x_be)?).serialize();
    x_be.zeroize();

    // Blinders with sum(2^i * r_i) == 0, fixed by choosing r_0 last.
    let mut r_ed = Vec::with_capacity(SECRET_BITS);
    let mut r_secp = Vec::with_capacity(SECRET_BITS);
    r_ed.push(Scalar::ZERO);
    r_secp.push(random_secret_key());
    let mut acc_ed = Scalar::ZERO;
    let mut acc_secp: Option<SecretKey> = None;
    let mut pow_ed = Scalar::ONE;
    for i in 1..SECRET_BITS {
        pow_ed += pow_ed;
        let re = random_ed_scalar();
        acc_ed += pow_ed * re;
        r_ed.push(re);

        let rs = random_secret_key();
        let term = rs.mul_tweak(&secp_pow2(i)?)?;
        acc_secp = Some(match acc_secp {
            None => term,
            Some(acc) => acc.add_tweak(&SecpScalar::from(term))?,
        });
        r_secp.push(rs);
    }
    r_ed[0] = -acc_ed;
    r_secp[0] = acc_secp.ok_or(DleqError::Scalar)?.negate();

    let transcript = Transcript {
        x_ed: &x_ed,
        x_secp: &x_secp,
    };

    let mut out = Vec::with_capacity(PROOF_LEN);
    out.extend_from_slice(&x_ed);
    out.extend_from_slice(&x_secp);

    for i in 0..SECRET_BITS {
        let b = bit(&x, i);
        let (ra, rb) = (&r_ed[i], &r_secp[i]);

        let mut c_ed_point = gens.h_ed * ra;
        let mut c_secp_point = gens.secp_mul(&gens.h_secp, &SecpScalar::from(*rb))?;
        if b {
            c_ed_point += gens.g_ed;
            c_secp_point = c_secp_point.add_exp_tweak(&gens.secp, &SecpScalar::ONE)?;
        }
        let c_ed = c_ed_point.compress().to_bytes();
        let c_secp = c_secp_point.serialize();
        let p1_ed = c_ed_point - gens.g_ed;
        let p1_secp = gens.secp_sub(&c_secp_point, &gens.g_secp)?;

        let k_ed = random_ed_scalar();
        let k_secp = random_secret_key();
        let commit_ed = gens.h_ed * k_ed;
        let commit_secp = gens.secp_mul(&gens.h_secp, &SecpScalar::from(k_secp))?;

        let (e0, z_ed0, z_secp0, z_ed1, z_secp1) = if b {
            // Real opening is member 1; simulate member 0.
            let e0 = transcript.challenge(i, &c_ed, &c_secp, &commit_ed, &commit_secp)?;
            let z_ed0 = random_ed_scalar();
            let z_secp0 = SecpScalar::from(random_secret_key());
            let r0_ed = gens.h_ed * z_ed0 - c_ed_point * e0.ed;
            let r0_secp = gens.secp_ring_point(&z_secp0, &e0.secp, &c_secp_point)?;
            let e1 = transcript.challenge(i, &c_ed, &c_secp, &r0_ed, &r0_secp)?;
            let z_ed1 = k_ed + e1.ed * ra;
            let z_secp1 = secp_response(&k_secp, &e1.secp, rb)?;
            (e0, z_ed0, z_secp0, z_ed1, z_secp1)
        } else {
            // Real opening is member 0; simulate member 1.
            let e1 = transcript.challenge(i, &c_ed, &c_secp, &commit_ed, &commit_secp)?;
            let z_ed1 = random_ed_scalar();
            let z_secp1 = SecpScalar::from(random_secret_key());
            let r1_ed = gens.h_ed * z_ed1 - p1_ed * e1.ed;
            let r1_secp = gens.secp_ring_point(&z_secp1, &e1.secp, &p1_secp)?;
            let e0 = transcript.challenge(i, &c_ed, &c_secp, &r1_ed, &r1_secp)?;
            let z_ed0 = k_ed + e0.ed * ra;
            let z_secp0 = secp_response(&k_secp, &e0.secp, rb)?;
            (e0, z_ed0, z_secp0, z_ed1, z_secp1)
        };

        out.extend_from_slice(&c_ed);
        out.extend_from_slice(&c_secp);
        out.extend_from_slice(&e0.bytes);
        out.extend_from_slice(z_ed0.as_bytes());
        out.extend_from_slice(&z_secp0.to_be_bytes());
        out.extend_from_slice(z_ed1.as_bytes());
        out.extend_from_slice(&z_secp1.to_be_bytes());
    }

    debug_assert_eq!(out.len(), PROOF_LEN);
    Ok(Proof(out))
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let (head, tail) = self.buf.split_at(N);
        self.buf = tail;
        let mut out = [0u8; N];
        out.copy_from_slice(head);
        out
    }

    fn ed_point(&mut self) -> Result<([u8; 32], EdwardsPoint), DleqError> {
        let bytes = self.take::<32>();
        let point = CompressedEdwardsY(bytes)
            .decompress()
            .ok_or(DleqError::Ed25519Point)?;
        Ok((bytes, point))
    }

    fn secp_point(&mut self) -> Result<([u8; 33], SecpPublicKey), DleqError> {
        let bytes = self.take::<33>();
        let point = SecpPublicKey::from_slice(&bytes).map_err(|_| DleqError::Secp256k1Point)?;
        Ok((bytes, point))
    }

    fn ed_scalar(&mut self) -> Result<Scalar, DleqError> {
        Option::<Scalar>::from(Scalar::from_canonical_bytes(self.take::<32>())).ok_or(DleqError::Scalar)
    }

    fn secp_scalar(&mut self) -> Result<SecpScalar, DleqError> {
        SecpScalar::from_be_bytes(self.take::<32>()).map_err(|_| DleqError::Scalar)
    }
}

fn verify_proof(bytes: &[u8]) -> Result<VerifyResult, DleqError> {
    if bytes.len() != PROOF_LEN {
        return Err(DleqError::Length {
            expected: PROOF_LEN,
            actual: bytes.len(),
        });
    }
    let gens = Generators::new()?;
    let mut reader = Reader { buf: bytes };

    let (x_ed, x_ed_point) = reader.ed_point()?;
    let (x_secp, x_secp_point) = reader.secp_point()?;
    let transcript = Transcript {
        x_ed: &x_ed,
        x_secp: &x_secp,
    };

    let mut sum_ed = EdwardsPoint::identity();
    let mut pow_ed = Scalar::ONE;
    let mut weighted_secp = Vec::with_capacity(SECRET_BITS);

    for i in 0..SECRET_BITS {
        let (c_ed, c_ed_point) = reader.ed_point()?;
        let (c_secp, c_secp_point) = reader.secp_point()?;
        let e0 = Challenge::from_bytes(reader.take::<32>())?;
        let z_ed0 = reader.ed_scalar()?;
        let z_secp0 = reader.secp_scalar()?;
        let z_ed1 = reader.ed_scalar()?;
        let z_secp1 = reader.secp_scalar()?;

        let ring = |e: &SecpScalar, z: &SecpScalar, p: &SecpPublicKey| {
            gens.secp_ring_point(z, e, p).map_err(|_| DleqError::Ring(i))
        };

        let r0_ed = gens.h_ed * z_ed0 - c_ed_point * e0.ed;
        let r0_secp = ring(&e0.secp, &z_secp0, &c_secp_point)?;
        let e1 = transcript.challenge(i, &c_ed, &c_secp, &r0_ed, &r0_secp)?;

        let p1_ed = c_ed_point - gens.g_ed;
        let p1_secp = gens
            .secp_sub(&c_secp_point, &gens.g_secp)
            .map_err(|_| DleqError::Ring(i))?;
        let r1_ed = gens.h_ed * z_ed1 - p1_ed * e1.ed;
        let r1_secp = ring(&e1.secp, &z_secp1, &p1_secp)?;
        let e0_check = transcript.challenge(i, &c_ed, &c_secp, &r1_ed, &r1_secp)?;
        if e0_check.bytes != e0.bytes {
            return Err(DleqError::Ring(i));
        }

        sum_ed += c_ed_point * pow_ed;
        pow_ed += pow_ed;
        weighted_secp.push(
            gens.secp_mul(&c_secp_point, &secp_pow2(i)?)
                .map_err(|_| DleqError::Aggregate("secp256k1"))?,
        );
    }

    if sum_ed != x_ed_point {
        return Err(DleqError::Aggregate("ed25519"));
    }
    let refs: Vec<&SecpPublicKey> = weighted_secp.iter().collect();
    let sum_secp =
        SecpPublicKey::combine_keys(&refs).map_err(|_| DleqError::Aggregate("secp256k1"))?;
    if sum_secp != x_secp_point {
        return Err(DleqError::Aggregate("secp256k1"));
    }

    if x_ed_point.is_small_order() {
        return Err(DleqError::Ed25519Point);
    }

    Ok(VerifyResult {
        ed25519: Ed25519PublicKey::from_point(x_ed_point),
        secp256k1: x_secp_point,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_reads_little_endian() {
        let mut secret = [0u8; 32];
        secret[0] = 0b0000_0101;
        secret[1] = 0b0000_0001;
        assert!(bit(&secret, 0));
        assert!(!bit(&secret, 1));
        assert!(bit(&secret, 2));
        assert!(bit(&secret, 8));
    }

    #[test]
    fn challenge_rejects_high_bits() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0x04;
        assert!(Challenge::from_bytes(bytes).is_err());
        bytes[0] = 0x03;
        assert!(Challenge::from_bytes(bytes).is_ok());
    }

    #[test]
    fn proof_recovers_both_public_keys() {
        let (secret, proof) = CrossGroupDleq.prove().unwrap();
        assert_eq!(proof.as_bytes().len(), PROOF_LEN);
        let res = CrossGroupDleq.verify(&proof).unwrap();

        let spend = crate::xmr::keys::PrivateSpendKey::from_bytes(secret.to_bytes()).unwrap();
        assert_eq!(res.ed25519, spend.public());
        let secp_secret = SecretKey::from_slice(&spend.to_contract_secret()).unwrap();
        assert_eq!(
            res.secp256k1,
            SecpPublicKey::from_secret_key(&Secp256k1::signing_only(), &secp_secret)
        );
    }

    #[test]
    fn flipped_byte_fails_verification() {
        let (_, proof) = CrossGroupDleq.prove().unwrap();
        let bytes = proof.into_bytes();
        for at in [0, 40, bytes.len() / 2, bytes.len() - 1] {
            let mut tampered = bytes.clone();
            tampered[at] ^= 0x01;
            assert!(verify_proof(&tampered).is_err(), "byte {at} not covered");
        }
    }

    #[test]
    fn rejects_truncated_proof() {
        let err = verify_proof(&[0u8; 10]).unwrap_err();
        assert_eq!(
            err,
            DleqError::Length {
                expected: PROOF_LEN,
                actual: 10
            }
        );
    }
}
