use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use rand::Rng as _;
use serde::{Deserialize, Serialize};
use sha3::{Digest as _, Sha3_256};

use crate::coins::{EtherAmount, ExchangeRate, MoneroAmount};

pub const OFFER_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Coin {
    Xmr,
    Eth,
}

impl Coin {
    pub fn as_str(self) -> &'static str {
        match self {
            Coin::Xmr => "XMR",
            Coin::Eth => "ETH",
        }
    }
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Coin {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "XMR" => Ok(Coin::Xmr),
            "ETH" => Ok(Coin::Eth),
            other => Err(anyhow!("unknown coin {other}")),
        }
    }
}

#[derive(Serialize)]
struct OfferBody {
    version: u32,
    provides: Coin,
    min_amount: MoneroAmount,
    max_amount: MoneroAmount,
    exchange_rate: ExchangeRate,
    nonce: u64,
}

/// Maker terms. The id is a digest of the terms, so an offer cannot change
/// once advertised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    id: String,
    version: u32,
    provides: Coin,
    min_amount: MoneroAmount,
    max_amount: MoneroAmount,
    exchange_rate: ExchangeRate,
    nonce: u64,
}

impl Offer {
    pub fn new(
        min_amount: MoneroAmount,
        max_amount: MoneroAmount,
        exchange_rate: ExchangeRate,
    ) -> Result<Self> {
        anyhow::ensure!(
            min_amount.as_piconero() > 0,
            "offer min_amount must be > 0"
        );
        anyhow::ensure!(
            min_amount <= max_amount,
            "offer min_amount {min_amount} exceeds max_amount {max_amount}"
        );
        anyhow::ensure!(
            exchange_rate.wei_per_piconero() > 0,
            "offer exchange_rate must be > 0"
        );
        Ok(Self::from_parts(
            OFFER_VERSION,
            Coin::Xmr,
            min_amount,
            max_amount,
            exchange_rate,
            rand::thread_rng().r#gen(),
        ))
    }

    pub(crate) fn from_parts(
        version: u32,
        provides: Coin,
        min_amount: MoneroAmount,
        max_amount: MoneroAmount,
        exchange_rate: ExchangeRate,
        nonce: u64,
    ) -> Self {
        let body = OfferBody {
            version,
            provides,
            min_amount,
            max_amount,
            exchange_rate,
            nonce,
        };
        Self {
            id: digest(&body),
            version,
            provides,
            min_amount,
            max_amount,
            exchange_rate,
            nonce,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn provides(&self) -> Coin {
        self.provides
    }

    pub fn min_amount(&self) -> MoneroAmount {
        self.min_amount
    }

    pub fn max_amount(&self) -> MoneroAmount {
        self.max_amount
    }

    pub fn exchange_rate(&self) -> ExchangeRate {
        self.exchange_rate
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Recomputes the digest, e.g. after deserializing a peer's offer.
    pub fn verify_id(&self) -> Result<()> {
        let expected = Self::from_parts(
            self.version,
            self.provides,
            self.min_amount,
            self.max_amount,
            self.exchange_rate,
            self.nonce,
        );
        anyhow::ensure!(expected.id == self.id, "offer id does not match its terms");
        Ok(())
    }

    pub fn check_amount(&self, amount: MoneroAmount) -> Result<()> {
        anyhow::ensure!(
            amount >= self.min_amount && amount <= self.max_amount,
            "amount {amount} outside offer range {}..={}",
            self.min_amount,
            self.max_amount
        );
        Ok(())
    }

    /// Monero the taker should receive for `eth`, checked against the range.
    pub fn monero_for(&self, eth: EtherAmount) -> Result<MoneroAmount> {
        let amount = self
            .exchange_rate
            .to_monero(eth)
            .ok_or_else(|| anyhow!("cannot convert {eth} at {}", self.exchange_rate))?;
        self.check_amount(amount)?;
        Ok(amount)
    }

    pub fn ether_for(&self, xmr: MoneroAmount) -> Result<EtherAmount> {
        self.check_amount(xmr)?;
        self.exchange_rate
            .to_ether(xmr)
            .ok_or_else(|| anyhow!("cannot convert {xmr} at {}", self.exchange_rate))
    }
}

fn digest(body: &OfferBody) -> String {
    // serde_json keeps struct field order, so the encoding is canonical.
    let encoded = serde_json::to_vec(body).unwrap_or_default();
    hex::encode(Sha3_256::digest(&encoded))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_stable_and_covers_terms() {
        let offer = Offer::new(
            MoneroAmount::from_piconero(1_000),
            MoneroAmount::from_piconero(5_000),
            ExchangeRate::from_wei_per_piconero(10),
        )
        .unwrap();
        offer.verify_id().unwrap();

        let mut tampered = offer.clone();
        tampered.max_amount = MoneroAmount::from_piconero(50_000);
        assert!(tampered.verify_id().is_err());
    }

    #[test]
    fn rejects_inverted_range() {
        assert!(
            Offer::new(
                MoneroAmount::from_piconero(5),
                MoneroAmount::from_piconero(1),
                ExchangeRate::from_wei_per_piconero(1),
            )
            .is_err()
        );
    }

    #[test]
    fn converts_within_range() {
        let offer = Offer::new(
            MoneroAmount::from_piconero(100),
            MoneroAmount::from_piconero(200),
            ExchangeRate::from_wei_per_piconero(3),
        )
        .unwrap();
        assert_eq!(
            offer.monero_for(EtherAmount::from_wei(450)).unwrap(),
            MoneroAmount::from_piconero(150)
        );
        assert!(offer.monero_for(EtherAmount::from_wei(30)).is_err());
        assert_eq!(
            offer.ether_for(MoneroAmount::from_piconero(100)).unwrap(),
            EtherAmount::from_wei(300)
        );
    }
}
