//! Canvas economy and territory engine.
//!
//! All state lives in one SQLite database. Every mutating operation runs in a
//! single `IMMEDIATE` transaction, so the per-agent pool debit and the
//! per-coordinate pixel write are serialized and commit all-or-nothing. Readers
//! (including the territory pass) work from WAL snapshots and never block writers.

use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub mod admin;
pub mod agents;
pub mod clock;
pub mod color;
pub mod config;
pub mod error;
pub mod factions;
pub mod pixels;
pub mod placement;
pub mod pool;
pub mod stats;


pub use admin::AdminGate;
pub use agents::Agent;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CanvasConfig;
pub use error::{EngineError, ErrorKind, Result};
pub use factions::{default_factions, Faction, FactionSeed};
pub use pixels::{Cleared, Pixel};
pub use pool::{compute_pool, PoolState};

pub use agentcanvas_protocol as protocol;

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Upper bound on how long a writer waits for the database lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn new_id(prefix: &str, now_ms: i64) -> String {
    let c = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{now_ms}-{c}")
}

#[derive(Debug, Clone)]
pub struct Engine {
    db_path: PathBuf,
    clock: Arc<dyn Clock>,
    admin: AdminGate,
}

impl Engine {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            clock: Arc::new(SystemClock),
            admin: AdminGate::default(),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_admin_key(mut self, secret: Option<&str>) -> Self {
        self.admin = AdminGate::new(secret);
        self
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn open(&self) -> Result<Connection> {
        let path = self.db_path.clone();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        // Durable + fast defaults.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        migrate(&conn)?;
        Ok(conn)
    }

    pub fn canvas_config(&self) -> Result<CanvasConfig> {
        let conn = self.open()?;
        CanvasConfig::load(&conn)
    }

    pub fn dimensions(&self) -> Result<protocol::Dimensions> {
        let cfg = self.canvas_config()?;
        Ok(protocol::Dimensions {
            width: cfg.width,
            height: cfg.height,
        })
    }

    /// Admin: override one config key. Returns the effective config afterwards.
    pub fn set_config(
        &self,
        admin_key: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<CanvasConfig> {
        self.admin.check(admin_key)?;
        if !config::keys::ALL.contains(&key) {
            return Err(EngineError::UnknownConfigKey(key.to_string()));
        }
        let conn = self.open()?;
        config::write_value(&conn, key, value)?;
        tracing::info!(key, %value, "config updated");
        CanvasConfig::load(&conn)
    }
}

/// Write transactions take the database lock up front so the read-check-write
/// sequences inside them cannot interleave with another writer.
fn write_tx(conn: &mut Connection) -> Result<Transaction<'_>> {
    Ok(conn.transaction_with_behavior(TransactionBehavior::Immediate)?)
}

fn migrate(conn: &Connection) -> Result<()> {
    let v: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if v < 1 {
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS config (
  key TEXT PRIMARY KEY,
  value_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS factions (
  id TEXT PRIMARY KEY,
  slug TEXT NOT NULL UNIQUE,
  name TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  primary_color TEXT NOT NULL,
  secondary_color TEXT,
  home_x INTEGER NOT NULL DEFAULT 0,
  home_y INTEGER NOT NULL DEFAULT 0,
  home_size INTEGER NOT NULL DEFAULT 0,
  expansion_dx INTEGER NOT NULL DEFAULT 0,
  expansion_dy INTEGER NOT NULL DEFAULT 0,
  behavior TEXT NOT NULL DEFAULT '',
  pixel_count INTEGER NOT NULL DEFAULT 0,
  agent_count INTEGER NOT NULL DEFAULT 0,
  created_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS agents (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL UNIQUE,
  api_key TEXT NOT NULL UNIQUE,
  created_at_ms INTEGER NOT NULL,
  pixel_pool INTEGER NOT NULL CHECK (pixel_pool >= 0),
  max_pool INTEGER NOT NULL CHECK (max_pool > 0),
  last_regen_at_ms INTEGER NOT NULL,
  pixels_placed INTEGER NOT NULL DEFAULT 0,
  last_pixel_at_ms INTEGER,
  faction_id TEXT REFERENCES factions(id),
  CHECK (pixel_pool <= max_pool)
);

CREATE INDEX IF NOT EXISTS idx_agents_faction ON agents(faction_id);

-- Live canvas: one row per coordinate, last write wins.
CREATE TABLE IF NOT EXISTS pixels (
  x INTEGER NOT NULL,
  y INTEGER NOT NULL,
  color NOT NULL,
  agent_id TEXT NOT NULL,
  placed_at_ms INTEGER NOT NULL,
  PRIMARY KEY (x, y)
) WITHOUT ROWID;

-- Append-only placement log. seq orders entries that share a millisecond.
CREATE TABLE IF NOT EXISTS pixel_history (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  x INTEGER NOT NULL,
  y INTEGER NOT NULL,
  color NOT NULL,
  agent_id TEXT NOT NULL,
  placed_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pixel_history_placed_at ON pixel_history(placed_at_ms);

CREATE TABLE IF NOT EXISTS territory (
  faction_id TEXT PRIMARY KEY REFERENCES factions(id),
  pixel_count INTEGER NOT NULL,
  percentage REAL NOT NULL,
  border_json TEXT NOT NULL DEFAULT '[]',
  last_calculated_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS conflict_zones (
  id TEXT PRIMARY KEY,
  x INTEGER NOT NULL,
  y INTEGER NOT NULL,
  faction_a TEXT NOT NULL REFERENCES factions(id),
  faction_b TEXT NOT NULL REFERENCES factions(id),
  intensity INTEGER NOT NULL,
  last_activity_at_ms INTEGER NOT NULL,
  UNIQUE (x, y)
);

CREATE INDEX IF NOT EXISTS idx_conflict_zones_activity ON conflict_zones(last_activity_at_ms);
"#,
        )?;

        conn.pragma_update(None, "user_version", 1_i64)?;
    }

    Ok(())
}
