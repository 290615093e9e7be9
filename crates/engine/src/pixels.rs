use crate::color;
use crate::error::Result;
use crate::protocol::{CanvasPixel, Color, HistoryEntry};
use crate::{write_tx, Engine};
use rusqlite::{OptionalExtension, Row};

pub const SINCE_DEFAULT_LIMIT: i64 = 500;
pub const SINCE_MAX_LIMIT: i64 = 1000;
pub const ACTIVITY_DEFAULT_LIMIT: i64 = 20;
pub const ACTIVITY_MAX_LIMIT: i64 = 100;

/// The live occupant of one coordinate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pixel {
    pub x: i64,
    pub y: i64,
    pub color: Color,
    pub agent_id: String,
    pub placed_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cleared {
    pub pixels: usize,
    pub history: usize,
}

fn history_from_row(row: &Row<'_>) -> rusqlite::Result<HistoryEntry> {
    Ok(HistoryEntry {
        x: row.get(0)?,
        y: row.get(1)?,
        color: color::from_sql(row.get_ref(2)?)?,
        agent_id: row.get(3)?,
        placed_at: row.get(4)?,
    })
}

impl Engine {
    /// Full canvas snapshot, one entry per painted coordinate.
    pub fn get_all(&self) -> Result<Vec<CanvasPixel>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT x, y, color FROM pixels ORDER BY y, x")?;
        let rows = stmt.query_map([], |row| {
            Ok(CanvasPixel {
                x: row.get(0)?,
                y: row.get(1)?,
                color: color::from_sql(row.get_ref(2)?)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_pixel(&self, x: i64, y: i64) -> Result<Option<Pixel>> {
        let conn = self.open()?;
        Ok(conn
            .query_row(
                "SELECT x, y, color, agent_id, placed_at_ms FROM pixels WHERE x = ?1 AND y = ?2",
                (x, y),
                |row| {
                    Ok(Pixel {
                        x: row.get(0)?,
                        y: row.get(1)?,
                        color: color::from_sql(row.get_ref(2)?)?,
                        agent_id: row.get(3)?,
                        placed_at: row.get(4)?,
                    })
                },
            )
            .optional()?)
    }

    /// History strictly after `since`, oldest first. Feeds incremental polling.
    pub fn get_since(&self, since: i64, limit: Option<i64>) -> Result<Vec<HistoryEntry>> {
        let limit = limit
            .unwrap_or(SINCE_DEFAULT_LIMIT)
            .clamp(1, SINCE_MAX_LIMIT);
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT x, y, color, agent_id, placed_at_ms FROM pixel_history
             WHERE placed_at_ms > ?1 ORDER BY placed_at_ms ASC, seq ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map((since, limit), history_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Most recent placements, newest first.
    pub fn get_latest_activity(&self, limit: Option<i64>) -> Result<Vec<HistoryEntry>> {
        let limit = limit
            .unwrap_or(ACTIVITY_DEFAULT_LIMIT)
            .clamp(1, ACTIVITY_MAX_LIMIT);
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT x, y, color, agent_id, placed_at_ms FROM pixel_history
             ORDER BY placed_at_ms DESC, seq DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit], history_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Admin: wipe the live canvas and its history. There is no undo.
    pub fn clear(&self, admin_key: &str) -> Result<Cleared> {
        self.admin.check(admin_key)?;
        let mut conn = self.open()?;
        let tx = write_tx(&mut conn)?;
        let pixels = tx.execute("DELETE FROM pixels", [])?;
        let history = tx.execute("DELETE FROM pixel_history", [])?;
        tx.commit()?;
        tracing::warn!(pixels, history, "canvas cleared");
        Ok(Cleared { pixels, history })
    }
}
