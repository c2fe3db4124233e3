use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const WEI_PER_ETHER: u128 = 1_000_000_000_000_000_000;
pub const PICONERO_PER_XMR: u64 = 1_000_000_000_000;

/// An amount of ether in wei.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EtherAmount(u128);

impl EtherAmount {
    pub const ZERO: Self = Self(0);

    pub const fn from_wei(wei: u128) -> Self {
        Self(wei)
    }

    pub const fn as_wei(self) -> u128 {
        self.0
    }

    pub fn checked_sub(self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }
}

impl fmt::Display for EtherAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ETH", format_decimal(self.0, 18))
    }
}

impl FromStr for EtherAmount {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

// u128 does not survive every JSON consumer, so wei travel as decimal strings.
impl Serialize for EtherAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for EtherAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An amount of monero in piconero.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MoneroAmount(u64);

impl MoneroAmount {
    pub const ZERO: Self = Self(0);

    pub const fn from_piconero(piconero: u64) -> Self {
        Self(piconero)
    }

    pub const fn as_piconero(self) -> u64 {
        self.0
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }
}

impl fmt::Display for MoneroAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} XMR", format_decimal(u128::from(self.0), 12))
    }
}

/// Price of one piconero in wei.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExchangeRate(u64);

impl ExchangeRate {
    pub const fn from_wei_per_piconero(wei: u64) -> Self {
        Self(wei)
    }

    pub const fn wei_per_piconero(self) -> u64 {
        self.0
    }

    /// Wei owed for `amount`, `None` on overflow.
    pub fn to_ether(self, amount: MoneroAmount) -> Option<EtherAmount> {
        u128::from(amount.0)
            .checked_mul(u128::from(self.0))
            .map(EtherAmount)
    }

    /// Piconero bought by `amount`, rounded down. `None` for a zero rate or
    /// a result beyond `u64`.
    pub fn to_monero(self, amount: EtherAmount) -> Option<MoneroAmount> {
        if self.0 == 0 {
            return None;
        }
        let piconero = amount.0 / u128::from(self.0);
        u64::try_from(piconero).ok().map(MoneroAmount)
    }
}

impl fmt::Display for ExchangeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} wei/piconero", self.0)
    }
}

fn format_decimal(value: u128, decimals: u32) -> String {
    let unit = 10u128.pow(decimals);
    let whole = value / unit;
    let frac = value % unit;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{frac:0width$}", width = decimals as usize);
    format!("{whole}.{}", frac.trim_end_matches('0'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_fractional_amounts() {
        assert_eq!(EtherAmount::from_wei(WEI_PER_ETHER).to_string(), "1 ETH");
        assert_eq!(
            EtherAmount::from_wei(WEI_PER_ETHER + WEI_PER_ETHER / 2).to_string(),
            "1.5 ETH"
        );
        assert_eq!(
            MoneroAmount::from_piconero(1_250_000_000).to_string(),
            "0.00125 XMR"
        );
    }

    #[test]
    fn rate_conversions_round_down() {
        let rate = ExchangeRate::from_wei_per_piconero(80_000);
        let xmr = MoneroAmount::from_piconero(PICONERO_PER_XMR);
        let eth = rate.to_ether(xmr).unwrap();
        assert_eq!(eth.as_wei(), 80_000 * u128::from(PICONERO_PER_XMR));
        assert_eq!(rate.to_monero(eth), Some(xmr));
        assert_eq!(
            rate.to_monero(EtherAmount::from_wei(159_999)),
            Some(MoneroAmount::from_piconero(1))
        );
        assert_eq!(
            ExchangeRate::from_wei_per_piconero(0).to_monero(eth),
            None
        );
    }
}
