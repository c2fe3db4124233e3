use anyhow::{Context as _, Result};

use eth_xmr_swap::coins::{EtherAmount, ExchangeRate, MoneroAmount};
use eth_xmr_swap::swap::offer::Offer;
use eth_xmr_swap::swap::store::SqliteSwapStore;
use eth_xmr_swap::swap::{SwapRecord, SwapRole, SwapStatus};

fn sample_swap(swap_id: &str, created_at: u64, status: SwapStatus) -> SwapRecord {
    SwapRecord {
        swap_id: swap_id.to_string(),
        role: SwapRole::AssetLocker,
        offer_id: Some(format!("offer:{swap_id}")),
        eth_amount: EtherAmount::from_wei(50_000_000_000_000_000),
        xmr_amount: MoneroAmount::from_piconero(1_000_000_000_000),
        contract_address: None,
        lock_tx: None,
        xmr_lock_address: None,
        settle_tx: None,
        created_at,
        status,
    }
}

#[test]
fn sqlite_store_insert_get_update_list() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let path = dir.path().join("swap_store.sqlite3");

    let mut store = SqliteSwapStore::open(path).context("open sqlite store")?;

    let a = sample_swap("swap-a", 10, SwapStatus::ExpectingKeys);
    store.insert_swap(&a).context("insert swap-a")?;
    let got = store
        .get_swap("swap-a")
        .context("get swap-a")?
        .context("swap-a missing")?;
    assert_eq!(got, a);

    store
        .update_status("swap-a", SwapStatus::EthLocked)
        .context("update swap-a status")?;
    store
        .set_contract("swap-a", "0xcontract", Some("0xdeploy"))
        .context("set swap-a contract")?;
    store
        .set_xmr_lock("swap-a", "4joint", None)
        .context("set swap-a xmr lock")?;
    let got = store
        .get_swap("swap-a")
        .context("get swap-a after lock")?
        .context("swap-a missing after lock")?;
    assert_eq!(got.status, SwapStatus::EthLocked);
    assert_eq!(got.contract_address.as_deref(), Some("0xcontract"));
    // A lock without a transaction id keeps the deploy transaction.
    assert_eq!(got.lock_tx.as_deref(), Some("0xdeploy"));
    assert_eq!(got.xmr_lock_address.as_deref(), Some("4joint"));

    store
        .set_settlement("swap-a", "0xrefund", SwapStatus::Refunded)
        .context("set swap-a settlement")?;
    let got = store
        .get_swap("swap-a")
        .context("get swap-a after settlement")?
        .context("swap-a missing after settlement")?;
    assert_eq!(got.status, SwapStatus::Refunded);
    assert_eq!(got.settle_tx.as_deref(), Some("0xrefund"));

    let b = sample_swap("swap-b", 20, SwapStatus::XmrLocked);
    store.insert_swap(&b).context("insert swap-b")?;

    let swaps = store.list_swaps().context("list swaps")?;
    assert_eq!(swaps.len(), 2);
    assert_eq!(swaps[0].swap_id, "swap-a");
    assert_eq!(swaps[1].swap_id, "swap-b");

    let ongoing = store.list_ongoing_swaps().context("list ongoing swaps")?;
    assert_eq!(ongoing.len(), 1);
    assert_eq!(ongoing[0].swap_id, "swap-b");

    let err = store
        .update_status("missing", SwapStatus::Aborted)
        .unwrap_err();
    assert!(err.to_string().contains("swap not found"));

    Ok(())
}

#[test]
fn sqlite_store_offer_is_taken_once() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    let mut store =
        SqliteSwapStore::open(dir.path().join("offers.sqlite3")).context("open sqlite store")?;

    let offer = Offer::new(
        MoneroAmount::from_piconero(100_000_000_000),
        MoneroAmount::from_piconero(2_000_000_000_000),
        ExchangeRate::from_wei_per_piconero(50_000),
    )
    .context("create offer")?;
    store.insert_offer(&offer).context("insert offer")?;

    let (stored, taken_by) = store
        .get_offer(offer.id())
        .context("get offer")?
        .context("offer missing")?;
    assert_eq!(stored, offer);
    stored.verify_id().context("stored offer id")?;
    assert_eq!(taken_by, None);

    store
        .take_offer(offer.id(), "swap-a")
        .context("take offer")?;
    let (_, taken_by) = store
        .get_offer(offer.id())
        .context("get offer after take")?
        .context("offer missing after take")?;
    assert_eq!(taken_by.as_deref(), Some("swap-a"));

    let err = store.take_offer(offer.id(), "swap-b").unwrap_err();
    assert!(err.to_string().contains("already taken"));

    Ok(())
}
