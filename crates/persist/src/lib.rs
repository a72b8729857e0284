//! Converge persistence: SQLite history of reconciliation passes.
//! Keep code tiny and predictable.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Summary of one finished pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassRecord {
    pub pass_id: String,
    pub owner: String,
    pub revision: String,
    /// Seconds since epoch.
    pub ts: i64,
    /// Failed components.
    pub failed: usize,
    pub summary_json: String,
}

pub trait HistoryStore {
    fn put_pass(&self, rec: &PassRecord) -> Result<()>;
    /// Newest first.
    fn history(&self, owner: &str, limit: Option<usize>) -> Result<Vec<PassRecord>>;
}

fn history_keep() -> usize {
    std::env::var("CONVERGE_HISTORY_KEEP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(20)
}

/// SQLite-backed store. Simple, synchronous; one write per pass.
pub struct SqliteStore {
    db: std::sync::Mutex<rusqlite::Connection>,
    keep: usize,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("CONVERGE_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS pass_history (
                pass_id  TEXT NOT NULL,
                owner    TEXT NOT NULL,
                revision TEXT NOT NULL,
                ts       INTEGER NOT NULL,
                failed   INTEGER NOT NULL,
                summary  BLOB NOT NULL
            )",
            [],
        )
        .context("creating pass_history table")?;
        db.execute("CREATE INDEX IF NOT EXISTS idx_pass_history_owner_ts ON pass_history(owner, ts DESC)", []).ok();
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path, "pass history opened");
        Ok(Self { db: std::sync::Mutex::new(db), keep: history_keep().max(1) })
    }

    /// Rows kept per owner.
    pub fn with_keep(mut self, keep: usize) -> Self {
        self.keep = keep.max(1);
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("sqlite connection lock poisoned"))
    }
}

impl HistoryStore for SqliteStore {
    fn put_pass(&self, rec: &PassRecord) -> Result<()> {
        let started = std::time::Instant::now();
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO pass_history(pass_id, owner, revision, ts, failed, summary) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (&rec.pass_id, &rec.owner, &rec.revision, rec.ts, rec.failed as i64, maybe_compress(&rec.summary_json)),
        )?;
        // Keep the latest `keep` rows per owner
        tx.execute(
            "DELETE FROM pass_history
             WHERE owner = ?1
               AND rowid NOT IN (
                   SELECT rowid FROM pass_history WHERE owner = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2
               )",
            (&rec.owner, self.keep as i64),
        )?;
        tx.commit()?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn history(&self, owner: &str, limit: Option<usize>) -> Result<Vec<PassRecord>> {
        let started = std::time::Instant::now();
        let cap = limit.unwrap_or(self.keep);
        let db = self.lock()?;
        let mut stmt = db.prepare(
            "SELECT pass_id, revision, ts, failed, summary FROM pass_history WHERE owner = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query((owner, cap as i64))?;
        let mut out: Vec<PassRecord> = Vec::new();
        while let Some(row) = rows.next()? {
            let failed: i64 = row.get(3)?;
            let summary: Vec<u8> = row.get(4)?;
            out.push(PassRecord {
                pass_id: row.get(0)?,
                owner: owner.to_string(),
                revision: row.get(1)?,
                ts: row.get(2)?,
                failed: failed.max(0) as usize,
                summary_json: maybe_decompress(&summary),
            });
        }
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".converge");
        let _ = std::fs::create_dir_all(&p);
        p.push("converge.db");
        return p.to_string_lossy().to_string();
    }
    "converge.db".to_string()
}

/// Seconds since epoch.
pub fn now_ts() -> i64 { time::OffsetDateTime::now_utc().unix_timestamp() }

pub fn maybe_compress(s: &str) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("CONVERGE_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        return zstd::encode_all(s.as_bytes(), lvl).unwrap_or_else(|_| s.as_bytes().to_vec());
    }
    s.as_bytes().to_vec()
}

pub fn maybe_decompress(blob: &[u8]) -> String {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return String::from_utf8_lossy(&de).to_string();
        }
    }
    String::from_utf8_lossy(blob).to_string()
}
