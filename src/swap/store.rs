use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use rusqlite::{Connection, OptionalExtension as _, Row, params};

use super::offer::{Coin, Offer};
use super::{SwapRecord, SwapStatus};
use crate::coins::{ExchangeRate, MoneroAmount};

const SWAP_COLUMNS: &str = r#"
  swap_id,
  role,
  offer_id,
  eth_amount,
  xmr_amount,
  contract_address,
  lock_tx,
  xmr_lock_address,
  settle_tx,
  created_at,
  status
"#;

#[derive(Debug)]
pub struct SqliteSwapStore {
    conn: Connection,
    path: PathBuf,
}

impl SqliteSwapStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create swap store dir {}", dir.display()))?;
        }

        let conn =
            Connection::open(&path).with_context(|| format!("open sqlite {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("set sqlite busy_timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .context("configure sqlite pragmas")?;

        migrate(&conn).context("migrate sqlite schema")?;

        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn insert_swap(&mut self, record: &SwapRecord) -> Result<()> {
        self.conn
            .execute(
                r#"
INSERT INTO swaps (
  swap_id,
  role,
  offer_id,
  eth_amount,
  xmr_amount,
  contract_address,
  lock_tx,
  xmr_lock_address,
  settle_tx,
  created_at,
  status
) VALUES (
  ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11
)
"#,
                params![
                    &record.swap_id,
                    record.role.as_str(),
                    &record.offer_id,
                    record.eth_amount.as_wei().to_string(),
                    i64::try_from(record.xmr_amount.as_piconero())
                        .context("xmr_amount out of range")?,
                    &record.contract_address,
                    &record.lock_tx,
                    &record.xmr_lock_address,
                    &record.settle_tx,
                    i64::try_from(record.created_at).context("created_at out of range")?,
                    record.status.as_str(),
                ],
            )
            .with_context(|| format!("insert swap {}", record.swap_id))?;
        Ok(())
    }

    pub fn get_swap(&self, swap_id: &str) -> Result<Option<SwapRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {SWAP_COLUMNS} FROM swaps WHERE swap_id = ?1"),
                params![swap_id],
                swap_from_row,
            )
            .optional()
            .with_context(|| format!("get swap {swap_id}"))
    }

    pub fn update_status(&mut self, swap_id: &str, status: SwapStatus) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE swaps SET status = ?2 WHERE swap_id = ?1",
                params![swap_id, status.as_str()],
            )
            .with_context(|| format!("update swap status {swap_id}"))?;
        anyhow::ensure!(rows == 1, "swap not found: {swap_id}");
        Ok(())
    }

    pub fn set_contract(&mut self, swap_id: &str, address: &str, lock_tx: Option<&str>) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE swaps SET contract_address = ?2, lock_tx = COALESCE(?3, lock_tx) WHERE swap_id = ?1",
                params![swap_id, address, lock_tx],
            )
            .with_context(|| format!("set swap contract {swap_id}"))?;
        anyhow::ensure!(rows == 1, "swap not found: {swap_id}");
        Ok(())
    }

    pub fn set_xmr_lock(&mut self, swap_id: &str, address: &str, lock_tx: Option<&str>) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE swaps SET xmr_lock_address = ?2, lock_tx = COALESCE(?3, lock_tx) WHERE swap_id = ?1",
                params![swap_id, address, lock_tx],
            )
            .with_context(|| format!("set swap xmr lock {swap_id}"))?;
        anyhow::ensure!(rows == 1, "swap not found: {swap_id}");
        Ok(())
    }

    /// Records the claim or refund transaction together with the final status.
    pub fn set_settlement(&mut self, swap_id: &str, settle_tx: &str, status: SwapStatus) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE swaps SET settle_tx = ?2, status = ?3 WHERE swap_id = ?1",
                params![swap_id, settle_tx, status.as_str()],
            )
            .with_context(|| format!("set swap settlement {swap_id}"))?;
        anyhow::ensure!(rows == 1, "swap not found: {swap_id}");
        Ok(())
    }

    pub fn list_swaps(&self) -> Result<Vec<SwapRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {SWAP_COLUMNS} FROM swaps ORDER BY created_at, swap_id"))
            .context("prepare list swaps")?;

        let mut out = Vec::new();
        let rows = stmt
            .query_map([], swap_from_row)
            .context("query list swaps")?;
        for row in rows {
            out.push(row.context("read swap row")?);
        }
        Ok(out)
    }

    /// Swaps that may still hold locked funds.
    pub fn list_ongoing_swaps(&self) -> Result<Vec<SwapRecord>> {
        Ok(self
            .list_swaps()?
            .into_iter()
            .filter(|s| s.status.is_ongoing())
            .collect())
    }

    pub fn insert_offer(&mut self, offer: &Offer) -> Result<()> {
        self.conn
            .execute(
                r#"
INSERT INTO offers (
  offer_id,
  version,
  provides,
  min_amount,
  max_amount,
  exchange_rate,
  nonce
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
"#,
                params![
                    offer.id(),
                    offer.version(),
                    offer.provides().as_str(),
                    i64::try_from(offer.min_amount().as_piconero()).context("min_amount out of range")?,
                    i64::try_from(offer.max_amount().as_piconero()).context("max_amount out of range")?,
                    i64::try_from(offer.exchange_rate().wei_per_piconero())
                        .context("exchange_rate out of range")?,
                    offer.nonce().to_string(),
                ],
            )
            .with_context(|| format!("insert offer {}", offer.id()))?;
        Ok(())
    }

    /// Returns the offer and the swap that consumed it, if any.
    pub fn get_offer(&self, offer_id: &str) -> Result<Option<(Offer, Option<String>)>> {
        self.conn
            .query_row(
                r#"
SELECT
  version,
  provides,
  min_amount,
  max_amount,
  exchange_rate,
  nonce,
  swap_id
FROM offers
WHERE offer_id = ?1
"#,
                params![offer_id],
                |row| {
                    let version: u32 = row.get(0)?;
                    let provides: String = row.get(1)?;
                    let provides = provides
                        .parse::<Coin>()
                        .map_err(|e| conversion_error(1, rusqlite::types::Type::Text, e))?;
                    let min_amount = get_u64(row, 2)?;
                    let max_amount = get_u64(row, 3)?;
                    let exchange_rate = get_u64(row, 4)?;
                    let nonce: String = row.get(5)?;
                    let nonce = nonce
                        .parse::<u64>()
                        .map_err(|e| conversion_error(5, rusqlite::types::Type::Text, e))?;
                    let swap_id: Option<String> = row.get(6)?;
                    let offer = Offer::from_parts(
                        version,
                        provides,
                        MoneroAmount::from_piconero(min_amount),
                        MoneroAmount::from_piconero(max_amount),
                        ExchangeRate::from_wei_per_piconero(exchange_rate),
                        nonce,
                    );
                    Ok((offer, swap_id))
                },
            )
            .optional()
            .with_context(|| format!("get offer {offer_id}"))
    }

    /// Marks an offer consumed by `swap_id`; an offer backs at most one swap.
    pub fn take_offer(&mut self, offer_id: &str, swap_id: &str) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE offers SET swap_id = ?2 WHERE offer_id = ?1 AND swap_id IS NULL",
                params![offer_id, swap_id],
            )
            .with_context(|| format!("take offer {offer_id}"))?;
        anyhow::ensure!(rows == 1, "offer not found or already taken: {offer_id}");
        Ok(())
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS swaps (
  swap_id TEXT PRIMARY KEY,
  role TEXT NOT NULL,
  offer_id TEXT,
  eth_amount TEXT NOT NULL,
  xmr_amount INTEGER NOT NULL,
  contract_address TEXT,
  lock_tx TEXT,
  xmr_lock_address TEXT,
  settle_tx TEXT,
  created_at INTEGER NOT NULL,
  status TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS swaps_status_idx ON swaps(status);

CREATE TABLE IF NOT EXISTS offers (
  offer_id TEXT PRIMARY KEY,
  version INTEGER NOT NULL,
  provides TEXT NOT NULL,
  min_amount INTEGER NOT NULL,
  max_amount INTEGER NOT NULL,
  exchange_rate INTEGER NOT NULL,
  nonce TEXT NOT NULL,
  swap_id TEXT
);
"#,
    )
    .context("create tables")?;
    Ok(())
}

fn conversion_error(
    col: usize,
    ty: rusqlite::types::Type,
    e: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, ty, e.into())
}

fn get_u64(row: &Row<'_>, col: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(col)?;
    u64::try_from(value).map_err(|_| {
        conversion_error(
            col,
            rusqlite::types::Type::Integer,
            format!("negative value {value}"),
        )
    })
}

fn swap_from_row(row: &Row<'_>) -> rusqlite::Result<SwapRecord> {
    let role: String = row.get(1)?;
    let eth_amount: String = row.get(3)?;
    let status: String = row.get(10)?;
    Ok(SwapRecord {
        swap_id: row.get(0)?,
        role: role
            .parse()
            .map_err(|e: anyhow::Error| conversion_error(1, rusqlite::types::Type::Text, e.to_string()))?,
        offer_id: row.get(2)?,
        eth_amount: eth_amount
            .parse()
            .map_err(|e| conversion_error(3, rusqlite::types::Type::Text, e))?,
        xmr_amount: MoneroAmount::from_piconero(get_u64(row, 4)?),
        contract_address: row.get(5)?,
        lock_tx: row.get(6)?,
        xmr_lock_address: row.get(7)?,
        settle_tx: row.get(8)?,
        created_at: get_u64(row, 9)?,
        status: status
            .parse()
            .map_err(|e: anyhow::Error| conversion_error(10, rusqlite::types::Type::Text, e.to_string()))?,
    })
}
