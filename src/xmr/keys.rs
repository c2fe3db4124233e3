//! Monero key material and the key algebra used to build the joint wallet.
//!
//! Private keys are ed25519 scalars in little-endian encoding. Public keys are
//! compressed Edwards points. The joint key pair of a swap is the sum of both
//! parties' shares; since scalar multiplication distributes over addition,
//! `public(sum(a, b)) == sum(public(a), public(b))`.

use std::fmt;

use curve25519_dalek::constants::ED25519_BASEPOINT_POINT;
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use monero::cryptonote::hash::Hash;
use rand::RngCore as _;
use rand::rngs::OsRng;
use zeroize::Zeroize as _;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("non-canonical scalar encoding")]
    NonCanonicalScalar,
    #[error("invalid compressed point")]
    InvalidPoint,
    #[error("small-order point")]
    SmallOrderPoint,
    #[error("zero scalar")]
    ZeroScalar,
    #[error("monero key: {0}")]
    Monero(String),
}

fn scalar_from_canonical(bytes: [u8; 32]) -> Result<Scalar, KeyError> {
    Option::<Scalar>::from(Scalar::from_canonical_bytes(bytes)).ok_or(KeyError::NonCanonicalScalar)
}

#[derive(Clone)]
pub struct PrivateSpendKey(Scalar);

impl PrivateSpendKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, KeyError> {
        let scalar = scalar_from_canonical(bytes)?;
        if scalar == Scalar::ZERO {
            return Err(KeyError::ZeroScalar);
        }
        Ok(Self(scalar))
    }

    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        Self::from_bytes(decode_hex32(s)?)
    }

    pub(crate) fn from_scalar(scalar: Scalar) -> Self {
        Self(scalar)
    }

    pub fn random() -> Self {
        let mut wide = [0u8; 64];
        OsRng.fill_bytes(&mut wide);
        let scalar = Scalar::from_bytes_mod_order_wide(&wide);
        wide.zeroize();
        Self(scalar)
    }

    /// Decodes the big-endian secret the swap contract emits in its logs.
    pub fn from_contract_secret(secret: [u8; 32]) -> Result<Self, KeyError> {
        let mut le = secret;
        le.reverse();
        Self::from_bytes(le)
    }

    /// Big-endian encoding used when revealing the key on the contract, where
    /// it doubles as a secp256k1 secret.
    pub fn to_contract_secret(&self) -> [u8; 32] {
        let mut be = self.0.to_bytes();
        be.reverse();
        be
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_bytes())
    }

    pub(crate) fn scalar(&self) -> &Scalar {
        &self.0
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(EdwardsPoint::mul_base(&self.0))
    }

    /// Wallet-standard view key: `keccak256(spend)` reduced mod l.
    pub fn view(&self) -> PrivateViewKey {
        let view = Hash::hash_to_scalar(&self.0.to_bytes());
        PrivateViewKey(Scalar::from_bytes_mod_order(view.to_bytes()))
    }

    pub fn key_pair(&self) -> PrivateKeyPair {
        PrivateKeyPair {
            spend: self.clone(),
            view: self.view(),
        }
    }
}

impl Drop for PrivateSpendKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl PartialEq for PrivateSpendKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for PrivateSpendKey {}

impl fmt::Debug for PrivateSpendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PrivateSpendKey").field(&"<redacted>").finish()
    }
}

#[derive(Clone)]
pub struct PrivateViewKey(Scalar);

impl PrivateViewKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, KeyError> {
        scalar_from_canonical(bytes).map(Self)
    }

    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        Self::from_bytes(decode_hex32(s)?)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_bytes())
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(EdwardsPoint::mul_base(&self.0))
    }
}

impl Drop for PrivateViewKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl PartialEq for PrivateViewKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for PrivateViewKey {}

impl fmt::Debug for PrivateViewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PrivateViewKey").field(&"<redacted>").finish()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(EdwardsPoint);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, KeyError> {
        let point = CompressedEdwardsY(bytes)
            .decompress()
            .ok_or(KeyError::InvalidPoint)?;
        if point.is_small_order() {
            return Err(KeyError::SmallOrderPoint);
        }
        Ok(Self(point))
    }

    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s.trim_start_matches("0x"), &mut out)
            .map_err(|_| KeyError::InvalidPoint)?;
        Self::from_bytes(out)
    }

    pub(crate) fn from_point(point: EdwardsPoint) -> Self {
        Self(point)
    }

    pub(crate) fn point(&self) -> &EdwardsPoint {
        &self.0
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.compress().to_bytes()
    }

    pub fn to_monero(&self) -> Result<monero::PublicKey, KeyError> {
        monero::PublicKey::from_slice(&self.to_bytes()).map_err(|e| KeyError::Monero(e.to_string()))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.to_bytes()))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({self})")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateKeyPair {
    pub spend: PrivateSpendKey,
    pub view: PrivateViewKey,
}

impl PrivateKeyPair {
    pub fn public_key_pair(&self) -> PublicKeyPair {
        PublicKeyPair {
            spend: self.spend.public(),
            view: self.view.public(),
        }
    }

    pub fn address(&self, network: monero::Network) -> Result<monero::Address, KeyError> {
        self.public_key_pair().address(network)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKeyPair {
    pub spend: PublicKey,
    pub view: PublicKey,
}

impl PublicKeyPair {
    /// Standard address: network byte, spend key, view key, keccak checksum.
    pub fn address(&self, network: monero::Network) -> Result<monero::Address, KeyError> {
        Ok(monero::Address::standard(
            network,
            self.spend.to_monero()?,
            self.view.to_monero()?,
        ))
    }
}

pub fn sum_private_spend_keys(a: &PrivateSpendKey, b: &PrivateSpendKey) -> PrivateSpendKey {
    PrivateSpendKey(a.0 + b.0)
}

pub fn sum_private_view_keys(a: &PrivateViewKey, b: &PrivateViewKey) -> PrivateViewKey {
    PrivateViewKey(a.0 + b.0)
}

pub fn sum_public_keys(a: &PublicKey, b: &PublicKey) -> PublicKey {
    PublicKey(a.0 + b.0)
}

pub fn sum_public_key_pairs(a: &PublicKeyPair, b: &PublicKeyPair) -> PublicKeyPair {
    PublicKeyPair {
        spend: sum_public_keys(&a.spend, &b.spend),
        view: sum_public_keys(&a.view, &b.view),
    }
}

/// Joint key pair from both parties' private shares.
pub fn sum_private_key_pairs(a: &PrivateKeyPair, b: &PrivateKeyPair) -> PrivateKeyPair {
    PrivateKeyPair {
        spend: sum_private_spend_keys(&a.spend, &b.spend),
        view: sum_private_view_keys(&a.view, &b.view),
    }
}

pub(crate) fn basepoint() -> EdwardsPoint {
    ED25519_BASEPOINT_POINT
}

fn decode_hex32(s: &str) -> Result<[u8; 32], KeyError> {
    let mut out = [0u8; 32];
    hex::decode_to_slice(s.trim_start_matches("0x"), &mut out)
        .map_err(|_| KeyError::NonCanonicalScalar)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_secret_is_byte_reversed() {
        let key = PrivateSpendKey::random();
        let mut be = key.to_contract_secret();
        assert_eq!(PrivateSpendKey::from_contract_secret(be).unwrap(), key);
        be.reverse();
        assert_eq!(be, key.to_bytes());
    }

    #[test]
    fn rejects_non_canonical_scalar() {
        assert_eq!(
            PrivateSpendKey::from_bytes([0xff; 32]).unwrap_err(),
            KeyError::NonCanonicalScalar
        );
        assert_eq!(
            PrivateSpendKey::from_bytes([0; 32]).unwrap_err(),
            KeyError::ZeroScalar
        );
    }

    #[test]
    fn rejects_small_order_point() {
        // Compressed identity.
        let mut identity = [0u8; 32];
        identity[0] = 1;
        assert_eq!(
            PublicKey::from_bytes(identity).unwrap_err(),
            KeyError::SmallOrderPoint
        );
    }

    #[test]
    fn sums_commute() {
        let a = PrivateSpendKey::random().key_pair();
        let b = PrivateSpendKey::random().key_pair();
        assert_eq!(sum_private_key_pairs(&a, &b), sum_private_key_pairs(&b, &a));
        let (pa, pb) = (a.public_key_pair(), b.public_key_pair());
        assert_eq!(sum_public_key_pairs(&pa, &pb), sum_public_key_pairs(&pb, &pa));
    }

    #[test]
    fn public_of_sum_is_sum_of_publics() {
        let a = PrivateSpendKey::random().key_pair();
        let b = PrivateSpendKey::random().key_pair();
        let joint = sum_private_key_pairs(&a, &b);
        let expected = sum_public_key_pairs(&a.public_key_pair(), &b.public_key_pair());
        assert_eq!(joint.public_key_pair(), expected);
        assert_eq!(
            joint.address(monero::Network::Stagenet).unwrap(),
            expected.address(monero::Network::Stagenet).unwrap()
        );
    }

    #[test]
    fn hex_round_trip() {
        let key = PrivateSpendKey::random();
        assert_eq!(PrivateSpendKey::from_hex(&key.to_hex()).unwrap(), key);
        let view = key.view();
        assert_eq!(PrivateViewKey::from_hex(&view.to_hex()).unwrap(), view);
    }
}
