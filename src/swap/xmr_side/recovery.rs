//! Currency-locker recovery after a crash: claim the ether while the window
//! is open, or take the monero back if the asset-locker refunded.

use std::sync::Arc;

use tokio::sync::watch;

use super::claim_contract;
use crate::eth::contract::{ContractEventKind, SwapContract, find_secret};
use crate::eth::{Address, TxHash};
use crate::swap::error::{ChainIoExt as _, SwapError};
use crate::swap::info_file::InfoFile;
use crate::swap::session::{
    StoredPeerKeys, SwapDeps, fetch_timeouts, load_peer_keys, open_joint_wallet,
    recovered_joint_keys,
};
use crate::xmr::keys::{PrivateKeyPair, PrivateSpendKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmrRecoveryResult {
    Claimed { tx_hash: TxHash },
    /// The asset-locker refunded; the monero was swept back.
    Recovered { address: monero::Address },
}

pub struct XmrRecoveryState {
    deps: SwapDeps,
    keys: PrivateKeyPair,
    contract: Arc<dyn SwapContract>,
    info: InfoFile,
    peer: Option<StoredPeerKeys>,
}

impl XmrRecoveryState {
    pub fn new(
        deps: SwapDeps,
        secret: PrivateSpendKey,
        contract_address: Address,
    ) -> Result<Self, SwapError> {
        let info = InfoFile::at(
            deps.config
                .basepath
                .join("recovery")
                .join(contract_address.to_string())
                .join("info.json"),
        );
        Self::with_info_file(deps, secret, contract_address, info)
    }

    pub fn from_info_file(deps: SwapDeps, info: InfoFile) -> Result<Self, SwapError> {
        let (secret, contract_address) = info.recovery_inputs().map_err(SwapError::Persistence)?;
        Self::with_info_file(deps, secret, contract_address, info)
    }

    fn with_info_file(
        deps: SwapDeps,
        secret: PrivateSpendKey,
        contract_address: Address,
        info: InfoFile,
    ) -> Result<Self, SwapError> {
        let contract = deps
            .contracts
            .attach(contract_address)
            .chain_io("attach swap contract")?;
        let peer = load_peer_keys(&info)?;
        Ok(Self {
            deps,
            keys: secret.key_pair(),
            contract,
            info,
            peer,
        })
    }

    pub fn contract_address(&self) -> Address {
        self.contract.address()
    }

    pub async fn claim_or_recover(&self) -> Result<XmrRecoveryResult, SwapError> {
        match self.filter_for_refund().await {
            Ok((tx_hash, secret)) => return self.recover(secret, tx_hash).await,
            Err(SwapError::NoLogsFound(_)) => {}
            Err(err) => return Err(err),
        }
        match self.filter_for_claim().await {
            Ok(tx_hash) => {
                tracing::info!(contract = %self.contract.address(), tx_hash = %tx_hash, "claim already on chain");
                return Ok(XmrRecoveryResult::Claimed { tx_hash });
            }
            Err(SwapError::NoLogsFound(_)) => {}
            Err(err) => return Err(err),
        }

        let timeouts = fetch_timeouts(&self.deps, self.contract.as_ref()).await?;
        let (_cancel_tx, mut cancel) = watch::channel(false);
        match claim_contract(
            &self.deps,
            self.contract.as_ref(),
            timeouts,
            &self.keys.spend,
            &mut cancel,
        )
        .await
        {
            Ok(tx_hash) => {
                tracing::info!(contract = %self.contract.address(), tx_hash = %tx_hash, "recovered ether by claim");
                Ok(XmrRecoveryResult::Claimed { tx_hash })
            }
            Err(SwapError::AlreadyCompleted) => {
                let (tx_hash, secret) = self.filter_for_refund().await?;
                self.recover(secret, tx_hash).await
            }
            Err(err) => Err(err),
        }
    }

    /// The refund transaction and the asset-locker secret it revealed.
    pub async fn filter_for_refund(&self) -> Result<(TxHash, [u8; 32]), SwapError> {
        let logs = self
            .contract
            .filter_logs(ContractEventKind::Refunded)
            .await
            .chain_io("filter refund logs")?;
        find_secret(&logs, ContractEventKind::Refunded)
            .ok_or(SwapError::NoLogsFound(ContractEventKind::Refunded))
    }

    /// Our own earlier claim, if any.
    pub async fn filter_for_claim(&self) -> Result<TxHash, SwapError> {
        let logs = self
            .contract
            .filter_logs(ContractEventKind::Claimed)
            .await
            .chain_io("filter claim logs")?;
        let (tx_hash, secret) = find_secret(&logs, ContractEventKind::Claimed)
            .ok_or(SwapError::NoLogsFound(ContractEventKind::Claimed))?;
        if secret != self.keys.spend.to_contract_secret() {
            return Err(SwapError::ProtocolViolation(format!(
                "claim {tx_hash} revealed a secret that is not ours"
            )));
        }
        Ok(tx_hash)
    }

    async fn recover(&self, secret: [u8; 32], tx_hash: TxHash) -> Result<XmrRecoveryResult, SwapError> {
        let joint = recovered_joint_keys(
            self.contract.address(),
            &self.keys,
            secret,
            self.peer.as_ref(),
        )?;
        let address = open_joint_wallet(
            &self.deps,
            &self.info,
            &format!("recovery-{}-reclaim", self.contract.address()),
            &joint,
            true,
        )
        .await?;
        tracing::info!(
            contract = %self.contract.address(),
            refund_tx = %tx_hash,
            address = %address,
            "recovered monero after counterparty refund"
        );
        Ok(XmrRecoveryResult::Recovered { address })
    }
}
