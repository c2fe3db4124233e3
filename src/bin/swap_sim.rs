use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser as _, ValueEnum};
use eth_xmr_swap::coins::{EtherAmount, ExchangeRate, MoneroAmount, WEI_PER_ETHER};
use eth_xmr_swap::config::{Environment, SwapConfig};
use eth_xmr_swap::net::{MessageSender as _, MessageType};
use eth_xmr_swap::sim::{Faults, PartySetup, SimWorld, relay};
use eth_xmr_swap::swap::eth_side::EthSwapSession;
use eth_xmr_swap::swap::offer::Offer;
use eth_xmr_swap::swap::store::SqliteSwapStore;
use eth_xmr_swap::swap::xmr_side::XmrSwapSession;
use eth_xmr_swap::swap::xmr_side::recovery::XmrRecoveryState;
use eth_xmr_swap::swap::{SwapSession, wait_for_terminal};
use serde_json::json;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scenario {
    /// Both parties follow the protocol.
    Success,
    /// The currency-locker cannot fund its lock; the asset-locker refunds before t0.
    RefundBeforeLock,
    /// The currency-locker crashes after the contract is ready; the
    /// asset-locker refunds after t1 and the currency-locker recovers.
    CrashAfterReady,
}

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long)]
    basepath: PathBuf,

    #[arg(long, value_enum, default_value_t = Scenario::Success)]
    scenario: Scenario,

    #[arg(long, default_value_t = 1_000_000_000_000)]
    xmr_piconero: u64,

    #[arg(long, default_value_t = 50_000)]
    wei_per_piconero: u64,

    #[arg(long, default_value_t = 6)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    eth_xmr_swap::logging::init().ok();

    let args = Args::parse();
    let env = Environment::Development;
    let amount = MoneroAmount::from_piconero(args.xmr_piconero);
    let rate = ExchangeRate::from_wei_per_piconero(args.wei_per_piconero);
    let offer = Offer::new(amount, amount, rate).context("create offer")?;
    let ether = rate
        .to_ether(amount)
        .context("exchange rate overflows ether amount")?;

    let eth_cfg = config(env, args.basepath.join("asset-locker"), args.timeout_secs);
    let xmr_cfg = config(env, args.basepath.join("currency-locker"), args.timeout_secs);
    let eth_store = SqliteSwapStore::open(eth_cfg.basepath.join("swaps.sqlite3"))
        .context("open asset-locker store")?;
    let mut xmr_store = SqliteSwapStore::open(xmr_cfg.basepath.join("swaps.sqlite3"))
        .context("open currency-locker store")?;
    xmr_store.insert_offer(&offer).context("store offer")?;

    let (xmr_funding, faults) = match args.scenario {
        Scenario::Success => (amount, Faults::default()),
        Scenario::RefundBeforeLock => (MoneroAmount::ZERO, Faults::default()),
        Scenario::CrashAfterReady => (
            amount,
            Faults {
                crash_on: Some(MessageType::NotifyReady),
                ..Faults::default()
            },
        ),
    };
    // The lock pays a fee on top of the swapped amount.
    let xmr_funding = xmr_funding
        .checked_add(MoneroAmount::from_piconero(args.xmr_piconero / 10))
        .context("monero funding overflow")?;

    let world = SimWorld::new(env.monero_network());
    let (mut eth_party, mut xmr_party) = world.connect(
        PartySetup {
            config: eth_cfg,
            ether: EtherAmount::from_wei(WEI_PER_ETHER).max(ether),
            monero: MoneroAmount::ZERO,
        },
        PartySetup {
            config: xmr_cfg,
            ether: EtherAmount::ZERO,
            monero: xmr_funding,
        },
    )?;
    eth_party.deps.store = Some(Arc::new(Mutex::new(eth_store)));
    xmr_party.deps.store = Some(Arc::new(Mutex::new(xmr_store)));

    let eth = Arc::new(EthSwapSession::new(eth_party.deps.clone(), &offer, ether)?);
    let xmr = Arc::new(XmrSwapSession::new(xmr_party.deps.clone(), &offer, amount)?);
    tracing::info!(
        scenario = ?args.scenario,
        eth_swap = %eth.id(),
        xmr_swap = %xmr.id(),
        ether = %ether,
        monero = %amount,
        "starting simulated swap"
    );

    eth_party
        .outbox
        .send_swap_message(eth.initiate())
        .await
        .context("send opening keys")?;
    let eth_pump = tokio::spawn(relay::pump(
        eth.clone(),
        eth_party.inbox,
        eth_party.outbox,
        Faults::default(),
    ));
    let xmr_pump = tokio::spawn(relay::pump(
        xmr.clone(),
        xmr_party.inbox,
        xmr_party.outbox,
        faults,
    ));

    let eth_result = eth_pump.await.context("join asset-locker")?;
    let xmr_result = xmr_pump.await.context("join currency-locker")?;
    if let Err(err) = &eth_result {
        tracing::warn!(error = %err, "asset-locker ended with error");
    }
    if let Err(err) = &xmr_result {
        tracing::warn!(error = %err, "currency-locker ended with error");
    }

    let eth_status = wait_for_terminal(eth.subscribe_status()).await;
    let recovery = match args.scenario {
        Scenario::CrashAfterReady => {
            let state = XmrRecoveryState::from_info_file(xmr_party.deps.clone(), xmr.info_file().clone())?;
            Some(format!("{:?}", state.claim_or_recover().await?))
        }
        Scenario::Success | Scenario::RefundBeforeLock => None,
    };

    let out = json!({
        "scenario": format!("{:?}", args.scenario),
        "asset_locker": {
            "swap_id": eth.id().to_string(),
            "status": eth_status.as_str(),
            "ether_balance": world.chain.balance_of(eth_party.eth_account).to_string(),
            "monero_balance": world.monero.balance_of(&eth_party.xmr_address).to_string(),
        },
        "currency_locker": {
            "swap_id": xmr.id().to_string(),
            "status": xmr.status().as_str(),
            "ether_balance": world.chain.balance_of(xmr_party.eth_account).to_string(),
            "monero_balance": world.monero.balance_of(&xmr_party.xmr_address).to_string(),
            "recovery": recovery,
        },
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn config(env: Environment, basepath: PathBuf, timeout_secs: u64) -> SwapConfig {
    let mut cfg = SwapConfig::for_env(env, basepath);
    cfg.swap_timeout = Duration::from_secs(timeout_secs);
    cfg.refund_buffer = Duration::from_secs(timeout_secs / 4).max(Duration::from_secs(1));
    cfg.claim_buffer = Duration::from_secs(1);
    cfg.sweep_to_primary = true;
    cfg
}
