mod support {
    pub mod harness;
    pub mod wait;
}

use std::time::Duration;

use anyhow::{Context as _, Result};

use eth_xmr_swap::coins::{EtherAmount, MoneroAmount};
use eth_xmr_swap::net::MessageType;
use eth_xmr_swap::sim::Faults;
use eth_xmr_swap::sim::xmr_ledger::FEE;
use eth_xmr_swap::swap::eth_side::{EthRecoveryResult, EthRecoveryState};
use eth_xmr_swap::swap::xmr_side::{XmrRecoveryResult, XmrRecoveryState};
use eth_xmr_swap::swap::{SwapSession as _, SwapStatus};

use support::harness::{ETH_FUNDING, SwapOptions, XMR_FUNDING, join, shared_key, start_swap};
use support::wait::wait_settled;

const SETTLE: Duration = Duration::from_secs(30);

#[tokio::test(flavor = "multi_thread")]
async fn crashed_currency_locker_recovers_after_refund() -> Result<()> {
    let _ = eth_xmr_swap::logging::init();
    let swap = start_swap(SwapOptions {
        xmr_faults: Faults {
            crash_on: Some(MessageType::NotifyReady),
            ..Faults::default()
        },
        ..SwapOptions::default()
    })
    .await?;

    join(swap.xmr_pump, SETTLE)
        .await?
        .context("currency-locker relay")?;
    assert_eq!(swap.xmr.status(), SwapStatus::XmrLocked);

    // Ready was set, so the asset-locker can only refund after t1.
    let status = wait_settled(swap.eth.as_ref(), SETTLE).await?;
    assert_eq!(status, SwapStatus::Refunded);
    join(swap.eth_pump, SETTLE)
        .await?
        .context("asset-locker relay")?;
    assert_eq!(swap.world.chain.balance_of(swap.eth_party.eth_account), ETH_FUNDING);

    let recovery = XmrRecoveryState::from_info_file(
        swap.xmr_party.deps.clone(),
        swap.xmr.info_file().clone(),
    )?;
    let first = recovery.claim_or_recover().await?;
    let XmrRecoveryResult::Recovered { address } = &first else {
        anyhow::bail!("expected the currency-locker to recover its monero, got {first:?}");
    };
    assert_eq!(swap.world.monero.balance_of(address), MoneroAmount::ZERO);
    let expected = XMR_FUNDING
        .checked_sub(MoneroAmount::from_piconero(2 * FEE.as_piconero()))
        .context("expected monero")?;
    assert_eq!(
        swap.world.monero.balance_of(&swap.xmr_party.xmr_address),
        expected
    );

    // The joint key was written before the wallet was opened.
    let joint = shared_key(swap.xmr.info_file())?;
    assert_eq!(&joint.address(swap.xmr_party.deps.network())?, address);

    // Running again finds the same refund and moves nothing.
    let transactions = swap.world.chain.transaction_count();
    let second = recovery.claim_or_recover().await?;
    assert_eq!(second, first);
    assert_eq!(swap.world.chain.transaction_count(), transactions);
    assert_eq!(
        swap.world.monero.balance_of(&swap.xmr_party.xmr_address),
        expected
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn asset_locker_recovery_refunds_and_is_idempotent() -> Result<()> {
    let _ = eth_xmr_swap::logging::init();
    let swap = start_swap(SwapOptions {
        xmr_faults: Faults {
            drop: vec![MessageType::NotifyEthLocked],
            ..Faults::default()
        },
        ..SwapOptions::default()
    })
    .await?;

    let contract = tokio::time::timeout(SETTLE, async {
        loop {
            if let Some(contract) = swap.eth.contract_address().await {
                return contract;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .context("timeout waiting for deploy")?;
    assert!(swap.world.chain.contract_balance(contract)? > EtherAmount::ZERO);
    // Crash the asset-locker right after it deployed.
    swap.eth.shutdown();

    let recovery = EthRecoveryState::from_info_file(
        swap.eth_party.deps.clone(),
        swap.eth.info_file().clone(),
    )?;
    assert_eq!(recovery.contract_address(), contract);
    let first = recovery.claim_or_refund().await?;
    assert!(matches!(first, EthRecoveryResult::Refunded { .. }));
    assert_eq!(swap.world.chain.contract_balance(contract)?, EtherAmount::ZERO);
    assert_eq!(swap.world.chain.balance_of(swap.eth_party.eth_account), ETH_FUNDING);

    let transactions = swap.world.chain.transaction_count();
    let second = recovery.claim_or_refund().await?;
    assert_eq!(second, first);
    assert_eq!(swap.world.chain.transaction_count(), transactions);
    Ok(())
}
