//! SQLite backing store shared by every loader process: leases, request
//! timestamps and ingested events live in one database file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use evl_core::{now_millis, Event, LeaseToken, StoreSettings, StoredEvent};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

mod stores;

pub use stores::{SqliteEventStore, SqliteLeaseManager, SqliteThrottle};

pub const DB_FILE: &str = "events.sqlite";

#[derive(Debug, Clone)]
pub struct KernelOptions {
    pub busy_timeout: Duration,
    /// SQLite `cache_size`; negative values are KiB.
    pub cache_pages: i64,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(5000),
            cache_pages: -20000,
        }
    }
}

impl KernelOptions {
    pub fn from_settings(settings: &StoreSettings) -> Self {
        let mut opts = Self::default();
        if let Some(ms) = settings.busy_timeout_ms {
            opts.busy_timeout = Duration::from_millis(ms);
        }
        opts
    }
}

#[derive(Clone)]
pub struct Kernel {
    db_path: PathBuf,
    busy_timeout: Duration,
}

impl Kernel {
    pub fn open(dir: &Path) -> Result<Self> {
        Self::open_with(dir, &KernelOptions::default())
    }

    /// Open (creating if needed) the database under `dir`. Failure here is
    /// fatal for a loader: it cannot run without the shared tables.
    pub fn open_with(dir: &Path, opts: &KernelOptions) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join(DB_FILE);
        let conn = Connection::open(&db_path)?;
        // WAL lets readers proceed while one process holds the write lock
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(opts.busy_timeout)?;
        let _ = conn.pragma_update(None, "cache_size", opts.cache_pages);
        let _ = conn.pragma_update(None, "temp_store", "MEMORY");
        Self::init_schema(&conn)?;
        Ok(Self {
            db_path,
            busy_timeout: opts.busy_timeout,
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- Leases: one row per resource; live while expires_at (ms) is in the future
            CREATE TABLE IF NOT EXISTS leases (
              resource_name TEXT PRIMARY KEY,
              token TEXT NOT NULL,
              acquired_at INTEGER NOT NULL,
              expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_leases_expires ON leases(expires_at);

            -- Last outbound request per source (ms since epoch)
            CREATE TABLE IF NOT EXISTS request_times (
              source_name TEXT PRIMARY KEY,
              last_request_time INTEGER NOT NULL,
              updated_at TEXT NOT NULL
            );

            -- Ingested events; ids are only unique within a source
            CREATE TABLE IF NOT EXISTS events (
              source_name TEXT NOT NULL,
              id INTEGER NOT NULL,
              payload BLOB NOT NULL,
              created_at TEXT NOT NULL,
              PRIMARY KEY (source_name, id)
            );
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Run `f` on the blocking pool so rusqlite never stalls an async executor.
    pub async fn run_blocking<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&Kernel) -> Result<R> + Send + 'static,
    {
        let k = self.clone();
        tokio::task::spawn_blocking(move || f(&k))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    // ---------------- Leases ----------------

    pub fn lease_is_live(&self, resource: &str) -> Result<bool> {
        let conn = self.conn()?;
        Ok(live_lease_exists(&conn, resource, now_millis())?)
    }

    pub fn purge_expired_leases(&self) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM leases WHERE expires_at <= ?",
            params![now_millis() as i64],
        )?;
        Ok(n)
    }

    /// Grant a lease unless a live one exists.
    ///
    /// The fast check and the purge run outside the transaction; the re-check,
    /// stale-row delete and insert run inside one `BEGIN IMMEDIATE`
    /// transaction, which holds the database write lock, so two processes can
    /// never both see "free" and both insert.
    pub fn try_acquire_lease(&self, resource: &str, ttl: Duration) -> Result<Option<LeaseToken>> {
        if self.lease_is_live(resource)? {
            tracing::debug!(target: "evl::lease", resource, "resource is already leased");
            return Ok(None);
        }

        match self.purge_expired_leases() {
            Ok(0) => {}
            Ok(n) => tracing::debug!(target: "evl::lease", purged = n, "cleaned up expired leases"),
            Err(err) => {
                tracing::warn!(target: "evl::lease", error = %err, "failed to clean up expired leases")
            }
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let lease = LeaseToken::grant(resource, ttl);
        if live_lease_exists(&tx, resource, lease.acquired_at_ms)? {
            tracing::debug!(
                target: "evl::lease",
                resource,
                "resource was leased by another process during acquisition"
            );
            return Ok(None);
        }
        tx.execute("DELETE FROM leases WHERE resource_name=?", params![resource])?;
        tx.execute(
            "INSERT INTO leases(resource_name,token,acquired_at,expires_at) VALUES(?,?,?,?)",
            params![
                lease.resource,
                lease.token,
                lease.acquired_at_ms as i64,
                lease.expires_at_ms as i64
            ],
        )?;
        tx.commit()?;
        Ok(Some(lease))
    }

    /// Delete the lease only if it still carries `token`.
    pub fn release_lease(&self, resource: &str, token: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM leases WHERE resource_name=? AND token=?",
            params![resource, token],
        )?;
        Ok(n > 0)
    }

    pub fn force_release_lease(&self, resource: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM leases WHERE resource_name=?", params![resource])?;
        Ok(n > 0)
    }

    /// Expiry (epoch ms) of the live lease on `resource`.
    pub fn lease_expiry(&self, resource: &str) -> Result<Option<u64>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT expires_at FROM leases WHERE resource_name=? AND expires_at > ? LIMIT 1")?;
        let exp: Option<i64> = stmt
            .query_row(params![resource, now_millis() as i64], |row| row.get(0))
            .optional()?;
        Ok(exp.map(|v| v as u64))
    }

    pub fn list_leases(&self) -> Result<Vec<LeaseToken>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT resource_name,token,acquired_at,expires_at FROM leases \
             WHERE expires_at > ? ORDER BY resource_name",
        )?;
        let mut rows = stmt.query(params![now_millis() as i64])?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            out.push(LeaseToken {
                resource: r.get(0)?,
                token: r.get(1)?,
                acquired_at_ms: r.get::<_, i64>(2)? as u64,
                expires_at_ms: r.get::<_, i64>(3)? as u64,
            });
        }
        Ok(out)
    }

    // ---------------- Request times ----------------

    /// Upsert the last request time; never moves the stored value backwards.
    pub fn set_last_request_time(&self, source: &str, at_ms: u64) -> Result<()> {
        let conn = self.conn()?;
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        conn.execute(
            "INSERT INTO request_times(source_name,last_request_time,updated_at) VALUES(?,?,?) \
             ON CONFLICT(source_name) DO UPDATE SET \
               last_request_time=MAX(last_request_time, excluded.last_request_time), \
               updated_at=excluded.updated_at",
            params![source, at_ms as i64, now],
        )?;
        Ok(())
    }

    pub fn last_request_time(&self, source: &str) -> Result<Option<u64>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT last_request_time FROM request_times WHERE source_name=?")?;
        let v: Option<i64> = stmt.query_row([source], |row| row.get(0)).optional()?;
        Ok(v.map(|ms| ms as u64))
    }

    // ---------------- Events ----------------

    /// Insert a batch in one transaction; any failure leaves no trace of it.
    pub fn append_events(&self, events: &[Event]) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        {
            let mut stmt = tx.prepare(
                "INSERT INTO events(source_name,id,payload,created_at) VALUES (?,?,?,?)",
            )?;
            for ev in events {
                stmt.execute(params![ev.source, ev.id, ev.payload, now])?;
            }
        }
        tx.commit()?;
        Ok(events.len())
    }

    pub fn last_event_id(&self, source: &str) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT MAX(id) FROM events WHERE source_name=?")?;
        let id: Option<i64> = stmt.query_row([source], |row| row.get(0))?;
        Ok(id)
    }

    pub fn recent_events(&self, limit: i64) -> Result<Vec<StoredEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT source_name,id,payload,created_at FROM events ORDER BY rowid DESC LIMIT ?",
        )?;
        let mut rows = stmt.query([limit])?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            out.push(StoredEvent {
                source: r.get(0)?,
                id: r.get(1)?,
                payload: r.get(2)?,
                stored_at: r.get(3)?,
            });
        }
        Ok(out)
    }

    pub fn count_events(&self, source: Option<&str>) -> Result<u64> {
        let conn = self.conn()?;
        let n: i64 = match source {
            Some(s) => conn.query_row(
                "SELECT COUNT(*) FROM events WHERE source_name=?",
                [s],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?,
        };
        Ok(n as u64)
    }
}

fn live_lease_exists(conn: &Connection, resource: &str, now_ms: u64) -> rusqlite::Result<bool> {
    let mut stmt =
        conn.prepare("SELECT 1 FROM leases WHERE resource_name=? AND expires_at > ? LIMIT 1")?;
    stmt.exists(params![resource, now_ms as i64])
}
