//! Per-swap recovery file.
//!
//! Holds what the recovery engine needs after a crash: the session secret,
//! the counterparty's keys, the contract address and, once known, the joint
//! Monero key. Every write
//! is synced to disk before the caller moves on, and callers write before
//! revealing anything on-chain.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

use super::{SwapId, SwapRole};
use crate::config::Environment;
use crate::eth::Address;
use crate::xmr::keys::{PrivateKeyPair, PrivateSpendKey, PrivateViewKey, PublicKey};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateKeyInfo {
    pub private_spend_key: String,
    pub private_view_key: String,
    pub address: String,
    pub environment: Environment,
}

impl PrivateKeyInfo {
    pub fn new(keys: &PrivateKeyPair, env: Environment) -> Result<Self> {
        let address = keys
            .address(env.monero_network())
            .context("derive monero address")?;
        Ok(Self {
            private_spend_key: keys.spend.to_hex(),
            private_view_key: keys.view.to_hex(),
            address: address.to_string(),
            environment: env,
        })
    }

    pub fn key_pair(&self) -> Result<PrivateKeyPair> {
        Ok(PrivateKeyPair {
            spend: PrivateSpendKey::from_hex(&self.private_spend_key)
                .context("parse private_spend_key")?,
            view: PrivateViewKey::from_hex(&self.private_view_key)
                .context("parse private_view_key")?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoFileContents {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap_id: Option<SwapId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<SwapRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counterparty_public_spend_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counterparty_private_view_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_address: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_info: Option<PrivateKeyInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_swap_private_key: Option<PrivateKeyInfo>,
}

#[derive(Debug, Clone)]
pub struct InfoFile {
    path: PathBuf,
}

impl InfoFile {
    pub fn for_swap(basepath: &Path, swap_id: SwapId) -> Self {
        Self {
            path: basepath.join(swap_id.to_string()).join("info.json"),
        }
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing files read as empty.
    pub fn load(&self) -> Result<InfoFileContents> {
        match fs::read(&self.path) {
            Ok(raw) => serde_json::from_slice(&raw)
                .with_context(|| format!("parse info file {}", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(InfoFileContents::default()),
            Err(e) => {
                Err(e).with_context(|| format!("read info file {}", self.path.display()))
            }
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut InfoFileContents)) -> Result<()> {
        let mut contents = self.load()?;
        f(&mut contents);
        self.write(&contents)
    }

    fn write(&self, contents: &InfoFileContents) -> Result<()> {
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)
                .with_context(|| format!("create info dir {}", dir.display()))?;
        }

        let encoded = serde_json::to_vec_pretty(contents).context("encode info file")?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("create {}", tmp.display()))?;
            file.write_all(&encoded)
                .with_context(|| format!("write {}", tmp.display()))?;
            file.sync_all()
                .with_context(|| format!("sync {}", tmp.display()))?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename {} to {}", tmp.display(), self.path.display()))?;
        Ok(())
    }

    pub fn write_keys(
        &self,
        swap_id: SwapId,
        role: SwapRole,
        keys: &PrivateKeyPair,
        env: Environment,
    ) -> Result<()> {
        let info = PrivateKeyInfo::new(keys, env)?;
        self.update(|c| {
            c.swap_id = Some(swap_id);
            c.role = Some(role);
            c.private_key_info = Some(info);
        })
    }

    /// Written before any funds are locked; recovery rebuilds the joint
    /// wallet from these, not from the revealed secret alone.
    pub fn write_counterparty_keys(&self, spend: &PublicKey, view: &PrivateViewKey) -> Result<()> {
        let (spend, view) = (spend.to_string(), view.to_hex());
        self.update(|c| {
            c.counterparty_public_spend_key = Some(spend);
            c.counterparty_private_view_key = Some(view);
        })
    }

    pub fn counterparty_keys(&self) -> Result<Option<(PublicKey, PrivateViewKey)>> {
        let contents = self.load()?;
        let (Some(spend), Some(view)) = (
            contents.counterparty_public_spend_key,
            contents.counterparty_private_view_key,
        ) else {
            return Ok(None);
        };
        Ok(Some((
            PublicKey::from_hex(&spend).context("parse counterparty_public_spend_key")?,
            PrivateViewKey::from_hex(&view).context("parse counterparty_private_view_key")?,
        )))
    }

    pub fn write_contract_address(&self, address: Address) -> Result<()> {
        self.update(|c| c.contract_address = Some(address))
    }

    pub fn write_shared_swap_private_key(&self, keys: &PrivateKeyPair, env: Environment) -> Result<()> {
        let info = PrivateKeyInfo::new(keys, env)?;
        self.update(|c| c.shared_swap_private_key = Some(info))
    }

    /// Secret and contract address needed to build a recovery state.
    pub fn recovery_inputs(&self) -> Result<(PrivateSpendKey, Address)> {
        let contents = self.load()?;
        let keys = contents
            .private_key_info
            .with_context(|| format!("no private key in {}", self.path.display()))?
            .key_pair()?;
        let address = contents
            .contract_address
            .with_context(|| format!("no contract address in {}", self.path.display()))?;
        Ok((keys.spend, address))
    }
}
