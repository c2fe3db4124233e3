//! In-process Ethereum and Monero collaborators for development runs and
//! tests. Both parties share one simulated chain and one monero ledger but
//! keep separate accounts and wallet directories.

pub mod chain;
pub mod relay;
pub mod xmr_ledger;

use std::sync::Arc;

use anyhow::{Context as _, Result};
use tokio::sync::mpsc;

use crate::coins::{EtherAmount, MoneroAmount};
use crate::config::SwapConfig;
use crate::dleq::CrossGroupDleq;
use crate::eth::Address;
use crate::net::Message;
use crate::swap::SwapDeps;
use crate::xmr::keys::PrivateSpendKey;

pub use chain::SimulatedChain;
pub use relay::{Faults, Link};
pub use xmr_ledger::SimMonero;

/// Starting funds and configuration for one party.
#[derive(Debug, Clone)]
pub struct PartySetup {
    pub config: SwapConfig,
    pub ether: EtherAmount,
    pub monero: MoneroAmount,
}

pub struct SimParty {
    pub deps: SwapDeps,
    pub eth_account: Address,
    pub xmr_address: monero::Address,
    /// Messages from the counterparty.
    pub inbox: mpsc::UnboundedReceiver<Message>,
    /// Messages to the counterparty; the same link backs `deps.sender`.
    pub outbox: Link,
}

#[derive(Clone)]
pub struct SimWorld {
    pub chain: SimulatedChain,
    pub monero: SimMonero,
}

impl SimWorld {
    pub fn new(network: monero::Network) -> Self {
        Self {
            chain: SimulatedChain::new(),
            monero: SimMonero::new(network),
        }
    }

    /// Funds two parties and connects them with a pair of links.
    pub fn connect(&self, a: PartySetup, b: PartySetup) -> Result<(SimParty, SimParty)> {
        let (to_b, b_inbox) = relay::link();
        let (to_a, a_inbox) = relay::link();
        let a = self.party(a, a_inbox, to_b).context("set up first party")?;
        let b = self.party(b, b_inbox, to_a).context("set up second party")?;
        Ok((a, b))
    }

    fn party(
        &self,
        setup: PartySetup,
        inbox: mpsc::UnboundedReceiver<Message>,
        outbox: Link,
    ) -> Result<SimParty> {
        setup.config.validate()?;

        let eth_account = Address::random();
        self.chain.fund(eth_account, setup.ether)?;

        let wallet = self.monero.client();
        let xmr_address =
            wallet.create_wallet(&setup.config.xmr_wallet_file, &PrivateSpendKey::random().key_pair())?;
        if setup.monero > MoneroAmount::ZERO {
            self.monero.mint(&xmr_address, setup.monero);
        }

        tracing::debug!(
            eth_account = %eth_account,
            xmr_address = %xmr_address,
            ether = %setup.ether,
            monero = %setup.monero,
            "funded simulated party"
        );
        Ok(SimParty {
            deps: SwapDeps {
                config: setup.config,
                contracts: Arc::new(self.chain.account(eth_account)),
                wallet: Arc::new(wallet),
                sender: Arc::new(outbox.clone()),
                dleq: Arc::new(CrossGroupDleq),
                store: None,
            },
            eth_account,
            xmr_address,
            inbox,
            outbox,
        })
    }
}
