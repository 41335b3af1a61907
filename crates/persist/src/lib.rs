//! Skiff persistence: SQLite history of deploy results per (project, target).
//! Synchronous on purpose; one row per recorded deploy.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use skiff_core::DeployResult;
use tracing::debug;

/// One stored deploy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub project: String,
    pub target: String,
    /// Milliseconds since the epoch, taken from the result's finish time.
    pub ts: i64,
    pub dry_run: bool,
    pub result: DeployResult,
}

pub trait ResultStore {
    fn put_result(&self, result: &DeployResult) -> Result<()>;
    /// Newest first.
    fn get_results(&self, project: &str, target: &str, limit: Option<usize>) -> Result<Vec<ResultRecord>>;
}

fn keep_results() -> usize {
    std::env::var("SKIFF_KEEP_RESULTS").ok().and_then(|s| s.parse::<usize>().ok()).filter(|n| *n > 0).unwrap_or(5)
}

pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
    keep: usize,
}

impl SqliteStore {
    /// Open `SKIFF_DB_PATH`, or `~/.skiff/skiff.db`.
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("SKIFF_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS deploy_results (
                project TEXT NOT NULL,
                target  TEXT NOT NULL,
                ts      INTEGER NOT NULL,
                dry_run INTEGER NOT NULL,
                json    BLOB NOT NULL
            )",
            [],
        )
        .context("creating deploy_results table")?;
        db.execute("CREATE INDEX IF NOT EXISTS idx_deploy_results_pt_ts ON deploy_results(project, target, ts DESC)", []).ok();
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path, "result store opened");
        Ok(Self { db: Mutex::new(db), keep: keep_results() })
    }

    /// Override how many results are kept per target.
    pub fn with_keep(mut self, keep: usize) -> Self {
        self.keep = keep.max(1);
        self
    }

    fn conn(&self) -> MutexGuard<'_, rusqlite::Connection> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ResultStore for SqliteStore {
    fn put_result(&self, result: &DeployResult) -> Result<()> {
        let started = std::time::Instant::now();
        let json = serde_json::to_string(result).context("serializing deploy result")?;
        let ts = if result.finished_ms > 0 { result.finished_ms } else { result.started_ms };
        let mut db = self.conn();
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO deploy_results(project, target, ts, dry_run, json) VALUES (?1, ?2, ?3, ?4, ?5)",
            (&result.project, &result.target, ts, result.dry_run, maybe_compress(&json)),
        )?;
        tx.execute(
            "DELETE FROM deploy_results
             WHERE project = ?1 AND target = ?2
               AND rowid NOT IN (
                   SELECT rowid FROM deploy_results WHERE project = ?1 AND target = ?2
                   ORDER BY ts DESC, rowid DESC LIMIT ?3
               )",
            (&result.project, &result.target, self.keep as i64),
        )?;
        tx.commit()?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn get_results(&self, project: &str, target: &str, limit: Option<usize>) -> Result<Vec<ResultRecord>> {
        let started = std::time::Instant::now();
        let cap = limit.unwrap_or(self.keep);
        let db = self.conn();
        let mut stmt = db.prepare(
            "SELECT ts, dry_run, json FROM deploy_results
             WHERE project = ?1 AND target = ?2 ORDER BY ts DESC, rowid DESC LIMIT ?3",
        )?;
        let mut rows = stmt.query((project, target, cap as i64))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let ts: i64 = row.get(0)?;
            let dry_run: bool = row.get(1)?;
            let blob: Vec<u8> = row.get(2)?;
            let result: DeployResult = serde_json::from_str(&maybe_decompress(&blob)).context("decoding stored deploy result")?;
            out.push(ResultRecord { project: project.to_string(), target: target.to_string(), ts, dry_run, result });
        }
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".skiff");
        let _ = std::fs::create_dir_all(&p);
        p.push("skiff.db");
        return p.to_string_lossy().to_string();
    }
    "skiff.db".to_string()
}

fn maybe_compress(json: &str) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("SKIFF_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        return zstd::encode_all(json.as_bytes(), lvl).unwrap_or_else(|_| json.as_bytes().to_vec());
    }
    #[allow(unreachable_code)]
    json.as_bytes().to_vec()
}

fn maybe_decompress(blob: &[u8]) -> String {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return String::from_utf8_lossy(&de).to_string();
        }
    }
    String::from_utf8_lossy(blob).to_string()
}
