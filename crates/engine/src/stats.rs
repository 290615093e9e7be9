use crate::error::Result;
use crate::protocol::{Analytics, LeaderboardEntry, LeaderboardPage, LeaderboardSort, Totals};
use crate::Engine;

pub const LEADERBOARD_MAX_LIMIT: usize = 100;
/// Deepest offset a cursor may address.
pub const MAX_OFFSET: usize = u32::MAX as usize;
const HOUR_MS: i64 = 60 * 60 * 1000;

impl Engine {
    pub fn leaderboard(
        &self,
        limit: usize,
        sort: LeaderboardSort,
        offset: usize,
    ) -> Result<LeaderboardPage> {
        let limit = limit.clamp(1, LEADERBOARD_MAX_LIMIT);
        let offset = offset.min(MAX_OFFSET);
        let order = match sort {
            LeaderboardSort::Pixels => "a.pixels_placed DESC, a.created_at_ms ASC",
            LeaderboardSort::Name => "a.name ASC",
            LeaderboardSort::Newest => "a.created_at_ms DESC, a.id DESC",
            LeaderboardSort::Oldest => "a.created_at_ms ASC, a.id ASC",
        };
        let conn = self.open()?;
        // One extra row tells us whether another page exists.
        let mut stmt = conn.prepare(&format!(
            "SELECT a.id, a.name, a.pixels_placed, f.slug
             FROM agents a LEFT JOIN factions f ON f.id = a.faction_id
             ORDER BY {order} LIMIT ?1 OFFSET ?2"
        ))?;
        let mut items = stmt
            .query_map(((limit + 1) as i64, offset as i64), |row| {
                Ok(LeaderboardEntry {
                    rank: 0,
                    agent_id: row.get(0)?,
                    name: row.get(1)?,
                    pixels: row.get(2)?,
                    faction: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let has_more = items.len() > limit;
        items.truncate(limit);
        for (i, item) in items.iter_mut().enumerate() {
            item.rank = offset.saturating_add(i + 1);
        }
        Ok(LeaderboardPage {
            items,
            next_cursor: has_more
                .then(|| format!("offset:{}", offset.saturating_add(limit).min(MAX_OFFSET))),
            has_more,
        })
    }

    pub fn analytics(&self) -> Result<Analytics> {
        let conn = self.open()?;
        let now = self.now_ms();
        let totals = conn.query_row(
            "SELECT
               (SELECT COUNT(*) FROM agents),
               (SELECT COUNT(*) FROM pixels),
               (SELECT COUNT(*) FROM pixel_history),
               (SELECT COUNT(*) FROM pixel_history WHERE placed_at_ms > ?1),
               (SELECT COUNT(*) FROM agents WHERE faction_id IS NOT NULL)",
            [now - HOUR_MS],
            |row| {
                Ok(Totals {
                    total_agents: row.get(0)?,
                    total_pixels: row.get(1)?,
                    total_placements: row.get(2)?,
                    placements_last_hour: row.get(3)?,
                    factioned_agents: row.get(4)?,
                })
            },
        )?;
        Ok(Analytics {
            totals,
            generated_at: now,
        })
    }
}

/// Parse an `offset:N` cursor. Anything else starts from the top; offsets past
/// `MAX_OFFSET` are pinned there.
pub fn parse_cursor(cursor: Option<&str>) -> usize {
    let Some(n) = cursor.and_then(|c| c.strip_prefix("offset:")) else {
        return 0;
    };
    if n.is_empty() || !n.bytes().all(|b| b.is_ascii_digit()) {
        return 0;
    }
    n.parse::<u32>().map_or(MAX_OFFSET, |n| n as usize)
}
