use std::fmt;

use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use sha3::{Digest as _, Keccak256};

use super::Address;

/// `keccak256(x || y)` of a secp256k1 public key, as stored by the swap
/// contract.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Commitment(#[serde(with = "hex")] [u8; 32]);

impl Commitment {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Commitment({self})")
    }
}

fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

pub fn commitment(public_key: &PublicKey) -> Commitment {
    let uncompressed = public_key.serialize_uncompressed();
    Commitment(keccak256(&uncompressed[1..]))
}

/// Commitment of the public key behind a big-endian contract secret.
pub fn commitment_for_secret(secret: &[u8; 32]) -> Result<Commitment, bitcoin::secp256k1::Error> {
    let secp = Secp256k1::signing_only();
    let secret = SecretKey::from_slice(secret)?;
    Ok(commitment(&PublicKey::from_secret_key(&secp, &secret)))
}

/// Ethereum address controlled by `public_key`.
pub fn address_of(public_key: &PublicKey) -> Address {
    let uncompressed = public_key.serialize_uncompressed();
    let digest = keccak256(&uncompressed[1..]);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest[12..]);
    Address::from_bytes(out)
}
