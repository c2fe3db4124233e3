use bitcoin::secp256k1::PublicKey as SecpPublicKey;
use hex::FromHex as _;

use super::error::{ProofError, SwapError};
use crate::dleq::{DleqProver, Proof};
use crate::net::{MessageType, SendKeys};
use crate::eth::secp256k1::{Commitment, commitment};
use crate::xmr::keys::{KeyError, PrivateKeyPair, PrivateSpendKey, PublicKey, PublicKeyPair};

/// Session keys: one secret used as the Monero spend key and as the
/// secp256k1 key behind the contract commitment, with a proof binding the two.
#[derive(Debug, Clone)]
pub struct KeysAndProof {
    pub private_key_pair: PrivateKeyPair,
    pub public_key_pair: PublicKeyPair,
    pub secp256k1_public_key: SecpPublicKey,
    pub dleq_proof: Proof,
}

impl KeysAndProof {
    pub fn commitment(&self) -> Commitment {
        commitment(&self.secp256k1_public_key)
    }

    pub fn spend_key(&self) -> &PrivateSpendKey {
        &self.private_key_pair.spend
    }

    /// Handshake fields common to both roles.
    pub fn to_send_keys(&self) -> SendKeys {
        SendKeys {
            public_spend_key: self.public_key_pair.spend.to_string(),
            secp256k1_public_key: hex::encode(self.secp256k1_public_key.serialize()),
            dleq_proof: hex::encode(self.dleq_proof.as_bytes()),
            ..SendKeys::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifiedKeys {
    pub ed25519_public_key: PublicKey,
    pub secp256k1_public_key: SecpPublicKey,
}

pub fn generate_keys_and_proof(prover: &dyn DleqProver) -> Result<KeysAndProof, SwapError> {
    let (secret, proof) = prover
        .prove()
        .map_err(|e| SwapError::KeyGeneration(e.to_string()))?;

    let spend = PrivateSpendKey::from_bytes(secret.to_bytes())
        .map_err(|e| SwapError::KeyGeneration(format!("secret is not a spend key: {e}")))?;
    let secp_secret = bitcoin::secp256k1::SecretKey::from_slice(&spend.to_contract_secret())
        .map_err(|e| SwapError::KeyGeneration(format!("secret is not a secp256k1 key: {e}")))?;
    let secp256k1_public_key =
        SecpPublicKey::from_secret_key(&bitcoin::secp256k1::Secp256k1::signing_only(), &secp_secret);

    let private_key_pair = spend.key_pair();
    let public_key_pair = private_key_pair.public_key_pair();

    let own = prover
        .verify(&proof)
        .map_err(|e| SwapError::KeyGeneration(format!("own proof does not verify: {e}")))?;
    if own.secp256k1 != secp256k1_public_key || own.ed25519 != public_key_pair.spend {
        return Err(SwapError::KeyGeneration(
            "own proof does not prove the generated keys".to_string(),
        ));
    }

    Ok(KeysAndProof {
        private_key_pair,
        public_key_pair,
        secp256k1_public_key,
        dleq_proof: proof,
    })
}

/// Checks the counterparty's proof and that it proves the keys they declared.
pub fn verify_keys_and_proof(
    prover: &dyn DleqProver,
    proof: &Proof,
    claimed_secp256k1: &SecpPublicKey,
    claimed_ed25519: &PublicKey,
) -> Result<VerifiedKeys, SwapError> {
    let res = prover.verify(proof).map_err(ProofError::from)?;
    if res.secp256k1 != *claimed_secp256k1 {
        return Err(ProofError::Secp256k1Mismatch.into());
    }
    if res.ed25519 != *claimed_ed25519 {
        return Err(ProofError::Ed25519Mismatch.into());
    }
    Ok(VerifiedKeys {
        ed25519_public_key: res.ed25519,
        secp256k1_public_key: res.secp256k1,
    })
}

/// Decodes the key fields of a counterparty's `SendKeys` and verifies its
/// proof against them.
pub fn verify_send_keys(prover: &dyn DleqProver, msg: &SendKeys) -> Result<VerifiedKeys, SwapError> {
    for (field, value) in [
        ("public_spend_key", &msg.public_spend_key),
        ("secp256k1_public_key", &msg.secp256k1_public_key),
        ("dleq_proof", &msg.dleq_proof),
    ] {
        if value.is_empty() {
            return Err(SwapError::MissingField {
                message: MessageType::SendKeys,
                field,
            });
        }
    }

    let spend = decode_public_key(&msg.public_spend_key)?;
    let secp = hex::decode(&msg.secp256k1_public_key)
        .ok()
        .and_then(|raw| SecpPublicKey::from_slice(&raw).ok())
        .ok_or(ProofError::Secp256k1Key)?;
    let proof = hex::decode(&msg.dleq_proof).map_err(|_| ProofError::Encoding)?;
    verify_keys_and_proof(prover, &Proof::from_bytes(proof), &secp, &spend)
}

pub(crate) fn decode_public_key(s: &str) -> Result<PublicKey, ProofError> {
    let bytes = <[u8; 32]>::from_hex(s).map_err(|_| ProofError::Key(KeyError::InvalidPoint))?;
    Ok(PublicKey::from_bytes(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dleq::CrossGroupDleq;
    use crate::swap::error::ErrorKind;

    #[test]
    fn generated_keys_verify_as_sent() {
        let keys = generate_keys_and_proof(&CrossGroupDleq).unwrap();
        let verified = verify_send_keys(&CrossGroupDleq, &keys.to_send_keys()).unwrap();
        assert_eq!(verified.ed25519_public_key, keys.public_key_pair.spend);
        assert_eq!(verified.secp256k1_public_key, keys.secp256k1_public_key);
    }

    #[test]
    fn declared_key_must_match_proof() {
        let keys = generate_keys_and_proof(&CrossGroupDleq).unwrap();
        let other = generate_keys_and_proof(&CrossGroupDleq).unwrap();
        let mut msg = keys.to_send_keys();
        msg.secp256k1_public_key = other.to_send_keys().secp256k1_public_key;
        let err = verify_send_keys(&CrossGroupDleq, &msg).unwrap_err();
        assert!(matches!(
            err,
            SwapError::ProofInvalid(ProofError::Secp256k1Mismatch)
        ));
        assert_eq!(err.kind(), ErrorKind::ProofInvalid);

        msg.dleq_proof.clear();
        assert!(matches!(
            verify_send_keys(&CrossGroupDleq, &msg).unwrap_err(),
            SwapError::MissingField { field: "dleq_proof", .. }
        ));
    }
}
