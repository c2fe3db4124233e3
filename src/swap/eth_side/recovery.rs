//! Asset-locker recovery after a crash: claim the monero if the
//! counterparty revealed its secret, otherwise get the ether back.

use std::sync::Arc;

use tokio::sync::watch;

use super::refund_contract;
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
pub enum EthRecoveryResult {
    /// The counterparty claimed; the joint wallet is ours.
    Claimed { address: monero::Address },
    Refunded { tx_hash: TxHash },
}

pub struct EthRecoveryState {
    deps: SwapDeps,
    keys: PrivateKeyPair,
    contract: Arc<dyn SwapContract>,
    info: InfoFile,
    peer: Option<StoredPeerKeys>,
}

impl EthRecoveryState {
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

    /// Recovers the swap recorded in `info`, writing the joint key back to it.
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

    pub async fn claim_or_refund(&self) -> Result<EthRecoveryResult, SwapError> {
        match self.filter_for_claim().await {
            Ok((tx_hash, secret)) => return self.claim(secret, tx_hash).await,
            Err(SwapError::NoLogsFound(_)) => {}
            Err(err) => return Err(err),
        }
        match self.filter_for_refund().await {
            Ok(tx_hash) => {
                tracing::info!(contract = %self.contract.address(), tx_hash = %tx_hash, "refund already on chain");
                return Ok(EthRecoveryResult::Refunded { tx_hash });
            }
            Err(SwapError::NoLogsFound(_)) => {}
            Err(err) => return Err(err),
        }

        let timeouts = fetch_timeouts(&self.deps, self.contract.as_ref()).await?;
        let (_cancel_tx, mut cancel) = watch::channel(false);
        match refund_contract(
            &self.deps,
            self.contract.as_ref(),
            timeouts,
            &self.keys.spend,
            &mut cancel,
        )
        .await
        {
            Ok(tx_hash) => {
                tracing::info!(contract = %self.contract.address(), tx_hash = %tx_hash, "recovered ether by refund");
                Ok(EthRecoveryResult::Refunded { tx_hash })
            }
            Err(SwapError::AlreadyCompleted) => {
                let (tx_hash, secret) = self.filter_for_claim().await?;
                self.claim(secret, tx_hash).await
            }
            Err(err) => Err(err),
        }
    }

    /// The claim transaction and the counterparty secret it revealed.
    pub async fn filter_for_claim(&self) -> Result<(TxHash, [u8; 32]), SwapError> {
        let logs = self
            .contract
            .filter_logs(ContractEventKind::Claimed)
            .await
            .chain_io("filter claim logs")?;
        find_secret(&logs, ContractEventKind::Claimed)
            .ok_or(SwapError::NoLogsFound(ContractEventKind::Claimed))
    }

    /// Our own earlier refund, if any.
    pub async fn filter_for_refund(&self) -> Result<TxHash, SwapError> {
        let logs = self
            .contract
            .filter_logs(ContractEventKind::Refunded)
            .await
            .chain_io("filter refund logs")?;
        let (tx_hash, secret) = find_secret(&logs, ContractEventKind::Refunded)
            .ok_or(SwapError::NoLogsFound(ContractEventKind::Refunded))?;
        if secret != self.keys.spend.to_contract_secret() {
            return Err(SwapError::ProtocolViolation(format!(
                "refund {tx_hash} revealed a secret that is not ours"
            )));
        }
        Ok(tx_hash)
    }

    async fn claim(&self, secret: [u8; 32], tx_hash: TxHash) -> Result<EthRecoveryResult, SwapError> {
        let joint = recovered_joint_keys(
            self.contract.address(),
            &self.keys,
            secret,
            self.peer.as_ref(),
        )?;
        let address = open_joint_wallet(
            &self.deps,
            &self.info,
            &format!("recovery-{}-claim", self.contract.address()),
            &joint,
            self.deps.config.sweep_to_primary,
        )
        .await?;
        tracing::info!(
            contract = %self.contract.address(),
            claim_tx = %tx_hash,
            address = %address,
            "recovered monero from counterparty claim"
        );
        Ok(EthRecoveryResult::Claimed { address })
    }
}
