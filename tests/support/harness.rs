use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tempfile::TempDir;
use tokio::task::JoinHandle;

use eth_xmr_swap::coins::{EtherAmount, ExchangeRate, MoneroAmount, WEI_PER_ETHER};
use eth_xmr_swap::config::{Environment, SwapConfig};
use eth_xmr_swap::eth::Address;
use eth_xmr_swap::net::MessageSender as _;
use eth_xmr_swap::retry::BackoffConfig;
use eth_xmr_swap::sim::{Faults, PartySetup, SimWorld, relay};
use eth_xmr_swap::swap::eth_side::EthSwapSession;
use eth_xmr_swap::swap::offer::Offer;
use eth_xmr_swap::swap::xmr_side::XmrSwapSession;
use eth_xmr_swap::swap::{SwapDeps, SwapError};
use eth_xmr_swap::xmr::keys::PrivateKeyPair;

pub const XMR_AMOUNT: MoneroAmount = MoneroAmount::from_piconero(1_000_000_000_000);
pub const RATE: ExchangeRate = ExchangeRate::from_wei_per_piconero(50_000);
pub const ETH_AMOUNT: EtherAmount = EtherAmount::from_wei(50_000_000_000_000_000);
pub const ETH_FUNDING: EtherAmount = EtherAmount::from_wei(WEI_PER_ETHER);
pub const XMR_FUNDING: MoneroAmount = MoneroAmount::from_piconero(2_000_000_000_000);
pub const SWAP_TIMEOUT: Duration = Duration::from_secs(4);
pub const REFUND_BUFFER: Duration = Duration::from_secs(1);

/// Short deadlines so that timeout paths finish within seconds.
pub fn test_config(basepath: &Path) -> SwapConfig {
    let mut cfg = SwapConfig::for_env(Environment::Development, basepath.to_path_buf());
    cfg.swap_timeout = SWAP_TIMEOUT;
    cfg.refund_buffer = REFUND_BUFFER;
    cfg.claim_buffer = Duration::from_secs(1);
    cfg.xmr_confirmations = 0;
    cfg.confirmation_poll_interval = Duration::from_millis(100);
    cfg.sweep_to_primary = false;
    cfg.backoff = BackoffConfig {
        attempt_timeout: Duration::from_secs(2),
        max_retries: 2,
        base_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        jitter_ms: 0,
    };
    cfg
}

#[derive(Debug, Clone, Default)]
pub struct SwapOptions {
    /// Defaults to `XMR_FUNDING`.
    pub xmr_funding: Option<MoneroAmount>,
    pub eth_faults: Faults,
    pub xmr_faults: Faults,
    /// Failed `generate_blocks` calls before mining works again.
    pub mining_failures: usize,
}

pub struct Party {
    pub deps: SwapDeps,
    pub eth_account: Address,
    pub xmr_address: monero::Address,
}

pub struct RunningSwap {
    pub world: SimWorld,
    pub eth: Arc<EthSwapSession>,
    pub xmr: Arc<XmrSwapSession>,
    pub eth_party: Party,
    pub xmr_party: Party,
    pub eth_pump: JoinHandle<Result<(), SwapError>>,
    pub xmr_pump: JoinHandle<Result<(), SwapError>>,
    _dir: TempDir,
}

/// Creates both sessions on a fresh simulated world, sends the opening
/// message and starts relaying.
pub async fn start_swap(options: SwapOptions) -> Result<RunningSwap> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let world = SimWorld::new(Environment::Development.monero_network());
    let offer = Offer::new(XMR_AMOUNT, XMR_AMOUNT, RATE).context("create offer")?;

    let (eth_party, xmr_party) = world
        .connect(
            PartySetup {
                config: test_config(&dir.path().join("asset-locker")),
                ether: ETH_FUNDING,
                monero: MoneroAmount::ZERO,
            },
            PartySetup {
                config: test_config(&dir.path().join("currency-locker")),
                ether: EtherAmount::ZERO,
                monero: options.xmr_funding.unwrap_or(XMR_FUNDING),
            },
        )
        .context("connect parties")?;
    world.monero.fail_mining(options.mining_failures);

    let eth = Arc::new(
        EthSwapSession::new(eth_party.deps.clone(), &offer, ETH_AMOUNT)
            .context("create asset-locker session")?,
    );
    let xmr = Arc::new(
        XmrSwapSession::new(xmr_party.deps.clone(), &offer, XMR_AMOUNT)
            .context("create currency-locker session")?,
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
        options.eth_faults,
    ));
    let xmr_pump = tokio::spawn(relay::pump(
        xmr.clone(),
        xmr_party.inbox,
        xmr_party.outbox,
        options.xmr_faults,
    ));

    Ok(RunningSwap {
        world,
        eth,
        xmr,
        eth_party: Party {
            deps: eth_party.deps,
            eth_account: eth_party.eth_account,
            xmr_address: eth_party.xmr_address,
        },
        xmr_party: Party {
            deps: xmr_party.deps,
            eth_account: xmr_party.eth_account,
            xmr_address: xmr_party.xmr_address,
        },
        eth_pump,
        xmr_pump,
        _dir: dir,
    })
}

pub async fn join(pump: JoinHandle<Result<(), SwapError>>, timeout: Duration) -> Result<Result<(), SwapError>> {
    tokio::time::timeout(timeout, pump)
        .await
        .context("timeout waiting for relay")?
        .context("join relay task")
}

/// Joint key pair the session persisted before touching the joint wallet.
pub fn shared_key(info: &eth_xmr_swap::swap::info_file::InfoFile) -> Result<PrivateKeyPair> {
    info.load()
        .context("load info file")?
        .shared_swap_private_key
        .context("no shared swap key in info file")?
        .key_pair()
}
