use crate::config::CanvasConfig;
use crate::error::{EngineError, Result};
use crate::pool::compute_pool;
use crate::protocol::{AgentStatus, FactionRef, JoinedFaction, Registration, StatusPool};
use crate::{new_id, write_tx, Engine};
use rand::RngCore;
use rusqlite::{Connection, OptionalExtension, Row};

pub const NAME_MIN: usize = 3;
pub const NAME_MAX: usize = 32;
const API_KEY_BYTES: usize = 32;

const AGENT_COLUMNS: &str = "id, name, api_key, created_at_ms, pixel_pool, max_pool, \
     last_regen_at_ms, pixels_placed, last_pixel_at_ms, faction_id";

/// A registered painter. Agents are never deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub api_key: String,
    pub created_at: i64,
    pub pixel_pool: i64,
    pub max_pool: i64,
    pub last_regen_at: i64,
    pub pixels_placed: i64,
    pub last_pixel_at: Option<i64>,
    pub faction_id: Option<String>,
}

impl Agent {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            api_key: row.get(2)?,
            created_at: row.get(3)?,
            pixel_pool: row.get(4)?,
            max_pool: row.get(5)?,
            last_regen_at: row.get(6)?,
            pixels_placed: row.get(7)?,
            last_pixel_at: row.get(8)?,
            faction_id: row.get(9)?,
        })
    }
}

/// Length check on the raw name, then strip everything outside
/// `[A-Za-z0-9 _-]`, trim, and check the minimum again.
pub fn sanitize_name(raw: &str) -> Result<String> {
    let len = raw.chars().count();
    if !(NAME_MIN..=NAME_MAX).contains(&len) {
        return Err(EngineError::InvalidName(format!(
            "agent name must be {NAME_MIN}-{NAME_MAX} characters"
        )));
    }
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '-'))
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.chars().count() < NAME_MIN {
        return Err(EngineError::InvalidName(
            "agent name contains too many invalid characters".to_string(),
        ));
    }
    Ok(cleaned.to_string())
}

fn generate_api_key() -> String {
    let mut bytes = [0u8; API_KEY_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub(crate) fn by_api_key(conn: &Connection, api_key: &str) -> Result<Option<Agent>> {
    Ok(conn
        .query_row(
            &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE api_key = ?1"),
            [api_key],
            Agent::from_row,
        )
        .optional()?)
}

pub(crate) fn increment_stats_tx(
    conn: &Connection,
    agent_id: &str,
    delta: i64,
    now: i64,
) -> Result<()> {
    let n = conn.execute(
        "UPDATE agents SET pixels_placed = pixels_placed + ?1, last_pixel_at_ms = ?2 WHERE id = ?3",
        (delta, now, agent_id),
    )?;
    if n == 0 {
        return Err(EngineError::AgentNotFound);
    }
    Ok(())
}

impl Engine {
    #[tracing::instrument(skip(self))]
    pub fn register(&self, name: &str) -> Result<Registration> {
        let name = sanitize_name(name)?;
        let mut conn = self.open()?;
        let cfg = CanvasConfig::load(&conn)?;
        let tx = write_tx(&mut conn)?;

        let taken: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM agents WHERE name = ?1)",
            [&name],
            |row| row.get(0),
        )?;
        if taken {
            return Err(EngineError::NameTaken(name));
        }

        let api_key = loop {
            let candidate = generate_api_key();
            let used: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM agents WHERE api_key = ?1)",
                [&candidate],
                |row| row.get(0),
            )?;
            if !used {
                break candidate;
            }
        };

        let now = self.now_ms();
        let id = new_id("agent", now);
        tx.execute(
            "INSERT INTO agents (id, name, api_key, created_at_ms, pixel_pool, max_pool, last_regen_at_ms, pixels_placed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?4, 0)",
            (&id, &name, &api_key, now, cfg.pool_start, cfg.pool_max),
        )?;
        tx.commit()?;

        tracing::info!(agent_id = %id, name = %name, "agent registered");
        Ok(Registration {
            agent_id: id,
            api_key,
            name,
        })
    }

    pub fn find_by_api_key(&self, api_key: &str) -> Result<Agent> {
        let conn = self.open()?;
        by_api_key(&conn, api_key)?.ok_or(EngineError::AgentNotFound)
    }

    pub fn find_agent(&self, agent_id: &str) -> Result<Agent> {
        let conn = self.open()?;
        conn.query_row(
            &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"),
            [agent_id],
            Agent::from_row,
        )
        .optional()?
        .ok_or(EngineError::AgentNotFound)
    }

    pub fn increment_stats(&self, agent_id: &str, delta: i64) -> Result<()> {
        let mut conn = self.open()?;
        let tx = write_tx(&mut conn)?;
        increment_stats_tx(&tx, agent_id, delta, self.now_ms())?;
        tx.commit()?;
        Ok(())
    }

    #[tracing::instrument(skip(self, api_key))]
    pub fn join_faction(&self, api_key: &str, faction_slug: &str) -> Result<JoinedFaction> {
        let mut conn = self.open()?;
        let tx = write_tx(&mut conn)?;
        let agent = by_api_key(&tx, api_key)?.ok_or(EngineError::InvalidApiKey)?;
        let faction = crate::factions::by_slug(&tx, faction_slug)?
            .ok_or_else(|| EngineError::FactionNotFound(faction_slug.to_string()))?;
        tx.execute(
            "UPDATE agents SET faction_id = ?1 WHERE id = ?2",
            (&faction.id, &agent.id),
        )?;
        tx.commit()?;

        tracing::info!(agent_id = %agent.id, faction = %faction.slug, "agent joined faction");
        Ok(JoinedFaction {
            agent_id: agent.id,
            faction_id: faction.id,
            agent: agent.name,
            faction: faction.name,
        })
    }

    /// Current balance without touching stored state.
    pub fn get_status(&self, api_key: &str) -> Result<AgentStatus> {
        let conn = self.open()?;
        let cfg = CanvasConfig::load(&conn)?;
        let agent = by_api_key(&conn, api_key)?.ok_or(EngineError::InvalidApiKey)?;
        let pool = compute_pool(
            agent.pixel_pool,
            agent.max_pool,
            agent.last_regen_at,
            self.now_ms(),
            cfg.regen_interval_ms,
        );
        let faction = match agent.faction_id.as_deref() {
            Some(id) => crate::factions::by_id(&conn, id)?.map(|f| FactionRef {
                slug: f.slug,
                name: f.name,
            }),
            None => None,
        };
        Ok(AgentStatus {
            name: agent.name,
            pixels_placed: agent.pixels_placed,
            pool: StatusPool {
                remaining: pool.available,
                max: agent.max_pool,
                next_regen_at: pool.next_regen_at(agent.max_pool, cfg.regen_interval_ms),
                regen_rate_ms: cfg.regen_interval_ms,
            },
            faction,
        })
    }
}
