use crate::error::Result;
use rusqlite::{Connection, OptionalExtension};

pub const DEFAULT_CANVAS_WIDTH: i64 = 500;
pub const DEFAULT_CANVAS_HEIGHT: i64 = 500;
pub const DEFAULT_POOL_START: i64 = 10;
pub const DEFAULT_POOL_MAX: i64 = 10;
pub const DEFAULT_REGEN_INTERVAL_MS: i64 = 5 * 60 * 1000;

pub mod keys {
    pub const CANVAS_WIDTH: &str = "canvas_width";
    pub const CANVAS_HEIGHT: &str = "canvas_height";
    pub const POOL_START: &str = "pool_start";
    pub const POOL_MAX: &str = "pool_max";
    pub const REGEN_INTERVAL_MS: &str = "regen_interval_ms";

    pub const ALL: [&str; 5] = [
        CANVAS_WIDTH,
        CANVAS_HEIGHT,
        POOL_START,
        POOL_MAX,
        REGEN_INTERVAL_MS,
    ];
}

/// Effective canvas and economy settings: rows in the `config` table override
/// the compiled-in defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanvasConfig {
    pub width: i64,
    pub height: i64,
    pub pool_start: i64,
    pub pool_max: i64,
    pub regen_interval_ms: i64,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_CANVAS_WIDTH,
            height: DEFAULT_CANVAS_HEIGHT,
            pool_start: DEFAULT_POOL_START,
            pool_max: DEFAULT_POOL_MAX,
            regen_interval_ms: DEFAULT_REGEN_INTERVAL_MS,
        }
    }
}

impl CanvasConfig {
    pub fn load(conn: &Connection) -> Result<Self> {
        let d = Self::default();
        let pool_max = read_positive(conn, keys::POOL_MAX)?.unwrap_or(d.pool_max);
        let pool_start = read_non_negative(conn, keys::POOL_START)?
            .unwrap_or(d.pool_start)
            .min(pool_max);
        Ok(Self {
            width: read_positive(conn, keys::CANVAS_WIDTH)?.unwrap_or(d.width),
            height: read_positive(conn, keys::CANVAS_HEIGHT)?.unwrap_or(d.height),
            pool_start,
            pool_max,
            regen_interval_ms: read_positive(conn, keys::REGEN_INTERVAL_MS)?
                .unwrap_or(d.regen_interval_ms),
        })
    }

    pub fn in_bounds(&self, x: i64, y: i64) -> bool {
        (0..self.width).contains(&x) && (0..self.height).contains(&y)
    }
}

pub fn read_value(conn: &Connection, key: &str) -> Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value_json FROM config WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()?;
    // A row that no longer parses behaves like a missing row.
    Ok(raw.and_then(|s| serde_json::from_str(&s).ok()))
}

pub fn write_value(conn: &Connection, key: &str, value: &serde_json::Value) -> Result<()> {
    conn.execute(
        "INSERT INTO config (key, value_json) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

fn read_positive(conn: &Connection, key: &str) -> Result<Option<i64>> {
    Ok(read_value(conn, key)?
        .and_then(|v| v.as_i64())
        .filter(|v| *v > 0))
}

fn read_non_negative(conn: &Connection, key: &str) -> Result<Option<i64>> {
    Ok(read_value(conn, key)?
        .and_then(|v| v.as_i64())
        .filter(|v| *v >= 0))
}
