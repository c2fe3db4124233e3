use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context as _, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::retry::BackoffConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Stagenet,
    Mainnet,
}

impl Environment {
    pub fn monero_network(self) -> monero::Network {
        match self {
            // Development nodes run monerod --regtest, which uses mainnet prefixes.
            Environment::Development | Environment::Mainnet => monero::Network::Mainnet,
            Environment::Stagenet => monero::Network::Stagenet,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Stagenet => "stagenet",
            Environment::Mainnet => "mainnet",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "stagenet" => Ok(Environment::Stagenet),
            "mainnet" => Ok(Environment::Mainnet),
            other => Err(anyhow!(
                "unknown environment {other} (expected development/stagenet/mainnet)"
            )),
        }
    }
}

/// Tunables shared by both protocol roles.
#[derive(Debug, Clone)]
pub struct SwapConfig {
    pub env: Environment,
    /// Directory holding per-swap info files.
    pub basepath: PathBuf,
    /// Length of each contract stage; t0 = deploy + timeout, t1 = t0 + timeout.
    pub swap_timeout: Duration,
    /// How long before t0 the asset-locker refunds if XMR is still unverified.
    pub refund_buffer: Duration,
    /// Slack past a deadline before acting on it.
    pub claim_buffer: Duration,
    pub xmr_confirmations: u64,
    pub confirmation_poll_interval: Duration,
    /// Wallet file holding this party's own monero.
    pub xmr_wallet_file: String,
    /// Sweep claimed XMR from the joint wallet into the primary wallet.
    pub sweep_to_primary: bool,
    pub backoff: BackoffConfig,
}

impl SwapConfig {
    pub fn for_env(env: Environment, basepath: PathBuf) -> Self {
        let (swap_timeout, refund_buffer, claim_buffer, xmr_confirmations) = match env {
            Environment::Development => (
                Duration::from_secs(60),
                Duration::from_secs(5),
                Duration::from_secs(1),
                0,
            ),
            Environment::Stagenet => (
                Duration::from_secs(60 * 60),
                Duration::from_secs(5 * 60),
                Duration::from_secs(60),
                10,
            ),
            Environment::Mainnet => (
                Duration::from_secs(4 * 60 * 60),
                Duration::from_secs(20 * 60),
                Duration::from_secs(5 * 60),
                10,
            ),
        };

        Self {
            env,
            basepath,
            swap_timeout,
            refund_buffer,
            claim_buffer,
            xmr_confirmations,
            confirmation_poll_interval: Duration::from_secs(match env {
                Environment::Development => 1,
                _ => 30,
            }),
            xmr_wallet_file: "swap-wallet".to_string(),
            sweep_to_primary: env != Environment::Development,
            backoff: BackoffConfig::default(),
        }
    }

    /// Defaults for `env`, overridden by `SWAP_*` environment variables.
    pub fn from_env(env: Environment, basepath: PathBuf) -> Result<Self> {
        let mut cfg = Self::for_env(env, basepath);
        if let Some(secs) = read_env_u64("SWAP_TIMEOUT_SECS")? {
            cfg.swap_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = read_env_u64("SWAP_REFUND_BUFFER_SECS")? {
            cfg.refund_buffer = Duration::from_secs(secs);
        }
        if let Some(secs) = read_env_u64("SWAP_CLAIM_BUFFER_SECS")? {
            cfg.claim_buffer = Duration::from_secs(secs);
        }
        if let Some(confs) = read_env_u64("SWAP_XMR_CONFIRMATIONS")? {
            cfg.xmr_confirmations = confs;
        }
        if let Ok(file) = std::env::var("SWAP_XMR_WALLET_FILE") {
            cfg.xmr_wallet_file = file;
        }
        if let Some(retries) = read_env_u64("SWAP_RPC_MAX_RETRIES")? {
            cfg.backoff.max_retries = usize::try_from(retries).context("SWAP_RPC_MAX_RETRIES")?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.swap_timeout.is_zero(), "swap_timeout must be > 0");
        anyhow::ensure!(!self.xmr_wallet_file.is_empty(), "xmr_wallet_file must be set");
        anyhow::ensure!(
            self.refund_buffer < self.swap_timeout,
            "refund_buffer ({:?}) must be shorter than swap_timeout ({:?})",
            self.refund_buffer,
            self.swap_timeout
        );
        anyhow::ensure!(
            self.claim_buffer < self.swap_timeout,
            "claim_buffer ({:?}) must be shorter than swap_timeout ({:?})",
            self.claim_buffer,
            self.swap_timeout
        );
        Ok(())
    }
}

fn read_env_u64(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("parse {key}={value}")),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(anyhow!("read {key}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_for_every_env() {
        for env in [
            Environment::Development,
            Environment::Stagenet,
            Environment::Mainnet,
        ] {
            SwapConfig::for_env(env, PathBuf::from("/tmp/swap"))
                .validate()
                .unwrap();
        }
    }

    #[test]
    fn rejects_buffer_longer_than_timeout() {
        let mut cfg = SwapConfig::for_env(Environment::Development, PathBuf::from("/tmp/swap"));
        cfg.refund_buffer = cfg.swap_timeout;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_environment_names() {
        assert_eq!(
            "Stagenet".parse::<Environment>().unwrap(),
            Environment::Stagenet
        );
        assert_eq!("dev".parse::<Environment>().unwrap(), Environment::Development);
        assert!("regtest".parse::<Environment>().is_err());
    }
}
