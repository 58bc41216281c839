//! SQLite persistence for the relay: admitted chain nodes plus the relay
//! state counters, written through transactionally after every mutation.

use std::ops::DerefMut;
use std::path::Path;
use std::str::FromStr;

use bitcoin::{BlockHash, TxMerkleNode};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use thiserror::Error;
use tokio::fs;

use spv_relay::{ChainNode, ChainStore, FeeMeter, RelayEvent, RelayState};

/// An error that can occur when using the store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    SQLite(#[from] sqlx::Error),
    #[error("Corrupt store: {0}")]
    Corrupt(String),
}

/// SQLite busy timeout in milliseconds
const SQLITE_BUSY_TIMEOUT: &str = "5000";

/// Single-writer SQLite store in WAL mode.
///
/// One connection keeps writes serialized, matching the relay's
/// single-writer execution model.
#[derive(Debug)]
pub struct RelayStore {
    pool: Pool<Sqlite>,
}

/// Relay bookkeeping persisted alongside the chain nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedState {
    pub state: RelayState,
    pub epoch_queries: u64,
    pub native_pool: u64,
}

impl RelayStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                StoreError::Corrupt(format!("cannot create database directory: {e}"))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("busy_timeout", SQLITE_BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS chain_nodes (
                hash TEXT PRIMARY KEY,
                height INTEGER NOT NULL,
                prev_hash TEXT NOT NULL,
                merkle_root TEXT NOT NULL,
                submitter TEXT NOT NULL
            );"#,
        )
        .execute(conn.deref_mut())
        .await?;
        sqlx::query(
            r#"CREATE INDEX IF NOT EXISTS idx_chain_nodes_height ON chain_nodes (height);"#,
        )
        .execute(conn.deref_mut())
        .await?;
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS relay_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );"#,
        )
        .execute(conn.deref_mut())
        .await?;
        Ok(())
    }

    /// Whether a previous instance already bootstrapped this database.
    pub async fn is_bootstrapped(&self) -> Result<bool, StoreError> {
        Ok(self.get_state_value("genesis_hash").await?.is_some())
    }

    async fn get_state_value(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query("SELECT value FROM relay_state WHERE key = ?")
            .bind(key)
            .fetch_optional(conn.deref_mut())
            .await?;
        Ok(row.map(|row| row.get("value")))
    }

    async fn require_state_value<T: FromStr>(&self, key: &str) -> Result<T, StoreError> {
        let raw = self
            .get_state_value(key)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("missing relay_state key {key}")))?;
        raw.parse()
            .map_err(|_| StoreError::Corrupt(format!("unparseable relay_state key {key}")))
    }

    /// Load the persisted relay state counters.
    pub async fn load_state(&self) -> Result<PersistedState, StoreError> {
        let state = RelayState {
            genesis_height: self.require_state_value("genesis_height").await?,
            genesis_hash: self.require_state_value("genesis_hash").await?,
            period_start_hash: self.require_state_value("period_start_hash").await?,
            highest_height: self.require_state_value("highest_height").await?,
            finalization_parameter: self.require_state_value("finalization_parameter").await?,
            last_finalized_height: self.require_state_value("last_finalized_height").await?,
            paused: self.require_state_value::<u8>("paused").await? != 0,
        };
        Ok(PersistedState {
            state,
            epoch_queries: self.require_state_value("epoch_queries").await?,
            native_pool: self.require_state_value("native_pool").await?,
        })
    }

    /// Rebuild the in-memory chain index from persisted nodes.
    pub async fn load_chain(&self, genesis_hash: BlockHash) -> Result<ChainStore, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(
            "SELECT hash, height, prev_hash, merkle_root, submitter
             FROM chain_nodes ORDER BY height ASC",
        )
        .fetch_all(conn.deref_mut())
        .await?;

        let mut store: Option<ChainStore> = None;
        for row in rows {
            let hash: BlockHash = parse_column(&row, "hash")?;
            let node = ChainNode {
                height: row.get::<i64, _>("height") as u64,
                prev_hash: parse_column(&row, "prev_hash")?,
                merkle_root: parse_column::<TxMerkleNode>(&row, "merkle_root")?,
                submitter: row.get("submitter"),
            };
            match store.as_mut() {
                None => {
                    if hash != genesis_hash {
                        return Err(StoreError::Corrupt(
                            "lowest stored node is not the genesis".into(),
                        ));
                    }
                    store = Some(ChainStore::bootstrap(hash, node));
                }
                Some(store) => store.restore_node(hash, node),
            }
        }
        store.ok_or_else(|| StoreError::Corrupt("no chain nodes in store".into()))
    }

    /// Write through the outcome of one mutating relay call: admitted and
    /// pruned nodes from `events`, plus the state counters, atomically.
    pub async fn apply(
        &self,
        state: &RelayState,
        fees: &FeeMeter,
        chain: &ChainStore,
        events: &[RelayEvent],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for event in events {
            match event {
                RelayEvent::HeaderAdded { hash, height, .. } => {
                    let node = chain.node(hash).ok_or_else(|| {
                        StoreError::Corrupt(format!("admitted node {hash} missing from index"))
                    })?;
                    sqlx::query(
                        "INSERT OR REPLACE INTO chain_nodes
                         (hash, height, prev_hash, merkle_root, submitter)
                         VALUES (?, ?, ?, ?, ?)",
                    )
                    .bind(hash.to_string())
                    .bind(*height as i64)
                    .bind(node.prev_hash.to_string())
                    .bind(node.merkle_root.to_string())
                    .bind(node.submitter.clone())
                    .execute(tx.deref_mut())
                    .await?;
                }
                RelayEvent::SiblingPruned { hash, .. } => {
                    sqlx::query("DELETE FROM chain_nodes WHERE hash = ?")
                        .bind(hash.to_string())
                        .execute(tx.deref_mut())
                        .await?;
                }
                RelayEvent::BlockFinalized { .. } | RelayEvent::RewardPaymentFailed { .. } => {}
            }
        }

        for (key, value) in state_entries(state, fees) {
            sqlx::query("INSERT OR REPLACE INTO relay_state (key, value) VALUES (?, ?)")
                .bind(key)
                .bind(value)
                .execute(tx.deref_mut())
                .await?;
        }

        tx.commit().await.map_err(StoreError::SQLite)
    }

    /// Persist the genesis node created at first bootstrap.
    pub async fn bootstrap(
        &self,
        genesis_hash: BlockHash,
        genesis: &ChainNode,
        state: &RelayState,
        fees: &FeeMeter,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO chain_nodes (hash, height, prev_hash, merkle_root, submitter)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(genesis_hash.to_string())
        .bind(genesis.height as i64)
        .bind(genesis.prev_hash.to_string())
        .bind(genesis.merkle_root.to_string())
        .bind(genesis.submitter.clone())
        .execute(tx.deref_mut())
        .await?;
        for (key, value) in state_entries(state, fees) {
            sqlx::query("INSERT OR REPLACE INTO relay_state (key, value) VALUES (?, ?)")
                .bind(key)
                .bind(value)
                .execute(tx.deref_mut())
                .await?;
        }
        tx.commit().await.map_err(StoreError::SQLite)
    }
}

fn state_entries(state: &RelayState, fees: &FeeMeter) -> Vec<(&'static str, String)> {
    vec![
        ("genesis_height", state.genesis_height.to_string()),
        ("genesis_hash", state.genesis_hash.to_string()),
        ("period_start_hash", state.period_start_hash.to_string()),
        ("highest_height", state.highest_height.to_string()),
        (
            "finalization_parameter",
            state.finalization_parameter.to_string(),
        ),
        (
            "last_finalized_height",
            state.last_finalized_height.to_string(),
        ),
        ("paused", u8::from(state.paused).to_string()),
        ("epoch_queries", fees.epoch_queries().to_string()),
        ("native_pool", fees.native_pool().to_string()),
    ]
}

fn parse_column<T: FromStr>(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<T, StoreError> {
    let raw: String = row.get(column);
    raw.parse()
        .map_err(|_| StoreError::Corrupt(format!("unparseable column {column}: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use spv_relay::FeeParams;

    fn h(n: u8) -> BlockHash {
        BlockHash::from_byte_array([n; 32])
    }

    fn node(height: u64, prev: BlockHash) -> ChainNode {
        ChainNode {
            height,
            prev_hash: prev,
            merkle_root: TxMerkleNode::all_zeros(),
            submitter: "alice".into(),
        }
    }

    fn state(highest: u64) -> RelayState {
        RelayState {
            genesis_height: 100,
            genesis_hash: h(0),
            period_start_hash: h(200),
            highest_height: highest,
            finalization_parameter: 3,
            last_finalized_height: 100,
            paused: false,
        }
    }

    #[tokio::test]
    async fn round_trips_state_and_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let store = RelayStore::open(dir.path().join("relay.db")).await.unwrap();
        assert!(!store.is_bootstrapped().await.unwrap());

        let mut fees = FeeMeter::new(FeeParams::default());
        fees.restore(7, 12_345);
        store
            .bootstrap(h(0), &node(100, h(255)), &state(100), &fees)
            .await
            .unwrap();
        assert!(store.is_bootstrapped().await.unwrap());

        // Admit two headers and prune one sibling, mirroring what the
        // relay reports through its events.
        let mut chain = ChainStore::bootstrap(h(0), node(100, h(255)));
        chain.add_candidate(h(1), 101, node(101, h(0))).unwrap();
        chain.add_candidate(h(2), 101, node(101, h(0))).unwrap();
        let added = vec![
            RelayEvent::HeaderAdded {
                height: 101,
                hash: h(1),
                submitter: "alice".into(),
            },
            RelayEvent::HeaderAdded {
                height: 101,
                hash: h(2),
                submitter: "alice".into(),
            },
        ];
        store
            .apply(&state(101), &fees, &chain, &added)
            .await
            .unwrap();

        // A later finalization prunes the losing sibling.
        chain.remove_candidate(101, &h(2));
        let pruned = vec![RelayEvent::SiblingPruned {
            height: 101,
            hash: h(2),
        }];
        store
            .apply(&state(101), &fees, &chain, &pruned)
            .await
            .unwrap();

        let persisted = store.load_state().await.unwrap();
        assert_eq!(persisted.state, state(101));
        assert_eq!(persisted.epoch_queries, 7);
        assert_eq!(persisted.native_pool, 12_345);

        let restored = store.load_chain(h(0)).await.unwrap();
        assert_eq!(restored.find_height(&h(1)).unwrap(), 101);
        assert!(!restored.contains(&h(2)));
        assert_eq!(restored.candidate_count(101), 1);
    }

    #[tokio::test]
    async fn load_chain_rejects_foreign_genesis() {
        let dir = tempfile::tempdir().unwrap();
        let store = RelayStore::open(dir.path().join("relay.db")).await.unwrap();
        let fees = FeeMeter::new(FeeParams::default());
        store
            .bootstrap(h(9), &node(100, h(255)), &state(100), &fees)
            .await
            .unwrap();
        assert!(matches!(
            store.load_chain(h(0)).await,
            Err(StoreError::Corrupt(_))
        ));
    }
}
