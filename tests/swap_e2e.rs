mod support {
    pub mod harness;
    pub mod wait;
}

use std::time::Duration;

use anyhow::{Context as _, Result};

use eth_xmr_swap::coins::{EtherAmount, MoneroAmount};
use eth_xmr_swap::eth::contract::unix_now;
use eth_xmr_swap::net::MessageType;
use eth_xmr_swap::sim::Faults;
use eth_xmr_swap::sim::xmr_ledger::FEE;
use eth_xmr_swap::swap::eth_side::{EthRecoveryResult, EthRecoveryState};
use eth_xmr_swap::swap::{ErrorKind, SwapSession as _, SwapStatus};

use support::harness::{
    ETH_AMOUNT, ETH_FUNDING, REFUND_BUFFER, SwapOptions, XMR_AMOUNT, XMR_FUNDING, join, shared_key,
    start_swap,
};
use support::wait::{wait_for, wait_settled};

const SETTLE: Duration = Duration::from_secs(30);

#[tokio::test(flavor = "multi_thread")]
async fn both_parties_follow_the_protocol() -> Result<()> {
    let _ = eth_xmr_swap::logging::init();
    let swap = start_swap(SwapOptions::default()).await?;

    join(swap.xmr_pump, SETTLE)
        .await?
        .context("currency-locker relay")?;
    join(swap.eth_pump, SETTLE)
        .await?
        .context("asset-locker relay")?;
    assert_eq!(swap.xmr.status(), SwapStatus::Success);
    assert_eq!(swap.eth.status(), SwapStatus::Success);

    // The currency-locker got the ether, the asset-locker paid exactly it.
    assert_eq!(swap.world.chain.balance_of(swap.xmr_party.eth_account), ETH_AMOUNT);
    assert_eq!(
        swap.world.chain.balance_of(swap.eth_party.eth_account),
        ETH_FUNDING.checked_sub(ETH_AMOUNT).context("eth balance")?
    );
    let contract = swap.eth.contract_address().await.context("no contract")?;
    assert_eq!(swap.world.chain.contract_balance(contract)?, EtherAmount::ZERO);

    // The asset-locker controls the joint wallet holding the monero.
    let joint = shared_key(swap.eth.info_file())?;
    let joint_address = joint.address(swap.eth_party.deps.network())?;
    assert!(swap.world.monero.balance_of(&joint_address) >= XMR_AMOUNT);

    // Each session read the contract deadlines once and reused them.
    assert_eq!(swap.world.chain.timeout_reads(), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn asset_locker_refunds_when_currency_locker_cannot_lock() -> Result<()> {
    let _ = eth_xmr_swap::logging::init();
    let swap = start_swap(SwapOptions {
        xmr_funding: Some(MoneroAmount::from_piconero(XMR_AMOUNT.as_piconero() / 10)),
        ..SwapOptions::default()
    })
    .await?;

    let err = join(swap.xmr_pump, SETTLE)
        .await?
        .expect_err("currency-locker should fail to lock");
    assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
    assert_eq!(swap.xmr.status(), SwapStatus::Aborted);

    join(swap.eth_pump, SETTLE)
        .await?
        .context("asset-locker relay")?;
    assert_eq!(swap.eth.status(), SwapStatus::Refunded);
    let contract = swap.eth.contract_address().await.context("no contract")?;
    assert_eq!(swap.world.chain.contract_balance(contract)?, EtherAmount::ZERO);
    assert_eq!(swap.world.chain.balance_of(swap.eth_party.eth_account), ETH_FUNDING);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn asset_locker_refunds_before_t0_when_lock_is_never_announced() -> Result<()> {
    let _ = eth_xmr_swap::logging::init();
    let swap = start_swap(SwapOptions {
        xmr_faults: Faults {
            drop: vec![MessageType::NotifyEthLocked],
            ..Faults::default()
        },
        ..SwapOptions::default()
    })
    .await?;

    let status = wait_settled(swap.eth.as_ref(), SETTLE).await?;
    let refunded_at = unix_now();
    assert_eq!(status, SwapStatus::Refunded);
    let contract = swap.eth.contract_address().await.context("no contract")?;
    assert_eq!(swap.world.chain.contract_balance(contract)?, EtherAmount::ZERO);

    // The refund went out inside the buffer before t0, not after it.
    let timeouts = swap.world.chain.timeouts_of(contract)?;
    assert!(
        refunded_at >= timeouts.t0 - REFUND_BUFFER.as_secs(),
        "refunded at {refunded_at}, before t0 - buffer ({})",
        timeouts.t0 - REFUND_BUFFER.as_secs()
    );
    assert!(
        refunded_at < timeouts.t0,
        "refunded at {refunded_at}, not before t0 ({})",
        timeouts.t0
    );

    // The refund notice ends the currency-locker, which never locked anything.
    join(swap.xmr_pump, SETTLE)
        .await?
        .context("currency-locker relay")?;
    assert_eq!(swap.xmr.status(), SwapStatus::Aborted);
    assert_eq!(
        swap.world.monero.balance_of(&swap.xmr_party.xmr_address),
        XMR_FUNDING
    );
    join(swap.eth_pump, SETTLE)
        .await?
        .context("asset-locker relay")?;
    // The watcher fired on the deadlines cached at deploy time. The
    // currency-locker never saw the contract and read nothing.
    assert_eq!(swap.world.chain.timeout_reads(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn currency_locker_reclaims_monero_when_lock_goes_unverified() -> Result<()> {
    let _ = eth_xmr_swap::logging::init();
    let swap = start_swap(SwapOptions {
        eth_faults: Faults {
            drop: vec![MessageType::NotifyXmrLock],
            ..Faults::default()
        },
        ..SwapOptions::default()
    })
    .await?;

    assert_eq!(wait_settled(swap.eth.as_ref(), SETTLE).await?, SwapStatus::Refunded);
    assert_eq!(wait_settled(swap.xmr.as_ref(), SETTLE).await?, SwapStatus::Refunded);

    // Both transfers paid a fee; everything else came back.
    let expected = XMR_FUNDING
        .checked_sub(MoneroAmount::from_piconero(2 * FEE.as_piconero()))
        .context("expected monero")?;
    let monero = swap.world.monero.clone();
    let address = swap.xmr_party.xmr_address.clone();
    let balance = wait_for("reclaimed monero", SETTLE, || {
        let monero = monero.clone();
        let address = address.clone();
        async move {
            let balance = monero.balance_of(&address);
            Ok((balance == expected).then_some(balance))
        }
    })
    .await?;
    assert_eq!(balance, expected);
    assert_eq!(swap.world.chain.balance_of(swap.eth_party.eth_account), ETH_FUNDING);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn currency_locker_claims_after_t0_without_ready() -> Result<()> {
    let _ = eth_xmr_swap::logging::init();
    let swap = start_swap(SwapOptions {
        eth_faults: Faults {
            crash_on: Some(MessageType::NotifyXmrLock),
            ..Faults::default()
        },
        ..SwapOptions::default()
    })
    .await?;

    join(swap.eth_pump, SETTLE)
        .await?
        .context("asset-locker relay")?;
    // The stream closed with the lock unacknowledged; the claim waits for t0.
    join(swap.xmr_pump, SETTLE)
        .await?
        .context("currency-locker relay")?;
    assert_eq!(swap.xmr.status(), SwapStatus::Success);
    assert_eq!(swap.world.chain.balance_of(swap.xmr_party.eth_account), ETH_AMOUNT);

    // The crashed asset-locker recovers the monero from the claim log.
    let recovery = EthRecoveryState::from_info_file(
        swap.eth_party.deps.clone(),
        swap.eth.info_file().clone(),
    )?;
    let first = recovery.claim_or_refund().await?;
    let EthRecoveryResult::Claimed { address } = &first else {
        anyhow::bail!("expected the asset-locker to recover by claiming, got {first:?}");
    };
    assert!(swap.world.monero.balance_of(address) >= XMR_AMOUNT);

    // A second run finds the same claim and sends nothing.
    let transactions = swap.world.chain.transaction_count();
    let second = recovery.claim_or_refund().await?;
    assert_eq!(second, first);
    assert_eq!(swap.world.chain.transaction_count(), transactions);
    assert!(swap.world.monero.balance_of(address) >= XMR_AMOUNT);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn currency_locker_reclaims_when_mining_its_lock_fails() -> Result<()> {
    let _ = eth_xmr_swap::logging::init();
    let swap = start_swap(SwapOptions {
        mining_failures: 1,
        ..SwapOptions::default()
    })
    .await?;

    // The transfer went out before mining failed, so the swap cannot abort.
    let err = join(swap.xmr_pump, SETTLE)
        .await?
        .expect_err("currency-locker should report the mining failure");
    assert_eq!(err.kind(), ErrorKind::ChainIo);
    assert_ne!(swap.xmr.status(), SwapStatus::Aborted);

    assert_eq!(wait_settled(swap.eth.as_ref(), SETTLE).await?, SwapStatus::Refunded);
    assert_eq!(wait_settled(swap.xmr.as_ref(), SETTLE).await?, SwapStatus::Refunded);
    join(swap.eth_pump, SETTLE)
        .await?
        .context("asset-locker relay")?;

    let expected = XMR_FUNDING
        .checked_sub(MoneroAmount::from_piconero(2 * FEE.as_piconero()))
        .context("expected monero")?;
    assert_eq!(
        swap.world.monero.balance_of(&swap.xmr_party.xmr_address),
        expected
    );
    assert_eq!(swap.world.chain.balance_of(swap.eth_party.eth_account), ETH_FUNDING);
    Ok(())
}
