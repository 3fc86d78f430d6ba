// SQLite persistence: indexer cache, verified filter documents, settings.

use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

/// Number of owners whose indexer results are kept in `nft_cache`.
pub const NFT_CACHE_OWNERS: usize = 10;

/// Settings key overriding the configured Helius DAS endpoint.
pub const HELIUS_ENDPOINT_KEY: &str = "helius_rpc_endpoint";

/// A filter document whose hash matched its on-chain pointer when fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFilter {
    pub owner: String,
    pub url: String,
    pub hash: String,
    pub content: String,
    pub verified_at: DateTime<Utc>,
}

/// SQLite-backed local state. Nothing here is authoritative; every row can
/// be rebuilt from the chain and the indexers.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database at `path` and ensure all tables
    /// exist. Pass `":memory:"` for an ephemeral database.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to set database pragmas")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS nft_cache (
                owner      TEXT NOT NULL,
                source     TEXT NOT NULL,
                data       TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                PRIMARY KEY (owner, source)
            );

            CREATE TABLE IF NOT EXISTS filter_cache (
                owner       TEXT PRIMARY KEY,
                url         TEXT NOT NULL,
                hash        TEXT NOT NULL,
                content     TEXT NOT NULL,
                verified_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS settings (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )
        .context("failed to create database schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the database connection.
    ///
    /// Panics if the mutex is poisoned.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    // ------------------------------------------------------------------
    // Indexer cache
    // ------------------------------------------------------------------

    /// Store an indexer response for `owner`, valid for `ttl`. Older owners
    /// beyond [`NFT_CACHE_OWNERS`] are evicted in the same transaction.
    pub fn put_nft_cache(&self, owner: &str, source: &str, data: &str, ttl: Duration) -> Result<()> {
        let expires_at = (Utc::now() + ttl).timestamp_millis();
        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to begin transaction")?;
        tx.execute(
            "INSERT OR REPLACE INTO nft_cache (owner, source, data, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![owner, source, data, expires_at],
        )
        .context("failed to write nft cache")?;
        tx.execute(
            "DELETE FROM nft_cache WHERE owner NOT IN (
                SELECT owner FROM nft_cache
                GROUP BY owner
                ORDER BY MAX(expires_at) DESC
                LIMIT ?1
             )",
            params![NFT_CACHE_OWNERS as i64],
        )
        .context("failed to evict nft cache")?;
        tx.commit().context("failed to commit nft cache")?;
        Ok(())
    }

    /// Cached indexer response for `owner`, or `None` if absent or expired.
    pub fn get_nft_cache(&self, owner: &str, source: &str) -> Result<Option<String>> {
        let now = Utc::now().timestamp_millis();
        let conn = self.conn();
        conn.query_row(
            "SELECT data FROM nft_cache
             WHERE owner = ?1 AND source = ?2 AND expires_at > ?3",
            params![owner, source, now],
            |row| row.get(0),
        )
        .optional()
        .context("failed to read nft cache")
    }

    /// Number of distinct owners currently cached, expired rows included.
    pub fn nft_cache_owner_count(&self) -> Result<usize> {
        let conn = self.conn();
        let count: i64 = conn
            .query_row("SELECT COUNT(DISTINCT owner) FROM nft_cache", [], |row| {
                row.get(0)
            })
            .context("failed to count nft cache owners")?;
        Ok(count as usize)
    }

    // ------------------------------------------------------------------
    // Verified filter documents
    // ------------------------------------------------------------------

    pub fn save_filter(&self, filter: &CachedFilter) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO filter_cache (owner, url, hash, content, verified_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                filter.owner,
                filter.url,
                filter.hash,
                filter.content,
                filter.verified_at.timestamp_millis(),
            ],
        )
        .context("failed to save filter cache")?;
        Ok(())
    }

    pub fn load_filter(&self, owner: &str) -> Result<Option<CachedFilter>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT owner, url, hash, content, verified_at FROM filter_cache WHERE owner = ?1",
                params![owner],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()
            .context("failed to load filter cache")?;

        let Some((owner, url, hash, content, millis)) = row else {
            return Ok(None);
        };
        let verified_at = Utc
            .timestamp_millis_opt(millis)
            .single()
            .with_context(|| format!("invalid verified_at timestamp {millis}"))?;
        Ok(Some(CachedFilter {
            owner,
            url,
            hash,
            content,
            verified_at,
        }))
    }

    pub fn clear_filter(&self, owner: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM filter_cache WHERE owner = ?1", params![owner])
            .context("failed to clear filter cache")?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn();
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .context("failed to read setting")
    }

    /// Uses INSERT OR REPLACE so repeated saves overwrite the previous value.
    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )
        .context("failed to save setting")?;
        Ok(())
    }

    /// Returns `true` if a value was removed.
    pub fn unset_setting(&self, key: &str) -> Result<bool> {
        let conn = self.conn();
        let removed = conn
            .execute("DELETE FROM settings WHERE key = ?1", params![key])
            .context("failed to remove setting")?;
        Ok(removed > 0)
    }

    pub fn list_settings(&self) -> Result<Vec<(String, String)>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT key, value FROM settings ORDER BY key")
            .context("failed to prepare list_settings query")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .context("failed to query settings")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to map settings rows")?;
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
