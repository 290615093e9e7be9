use crate::agents::{by_api_key, increment_stats_tx};
use crate::color::{self, validate_color};
use crate::config::CanvasConfig;
use crate::error::{EngineError, Result};
use crate::pool::{compute_pool, PoolState};
use crate::protocol::{Color, Placement, PoolInfo};
use crate::{write_tx, Engine};

impl Engine {
    /// Validate a paint request and apply it: pixel upsert, history append,
    /// pool debit and stats bump, all in one transaction.
    #[tracing::instrument(skip(self, api_key, color), fields(color = %color))]
    pub fn place_pixel(&self, api_key: &str, x: i64, y: i64, color: Color) -> Result<Placement> {
        let mut conn = self.open()?;
        let cfg = CanvasConfig::load(&conn)?;
        if !cfg.in_bounds(x, y) {
            return Err(EngineError::OutOfBounds {
                x,
                y,
                width: cfg.width,
                height: cfg.height,
            });
        }
        validate_color(&color)?;

        let tx = write_tx(&mut conn)?;
        let agent = by_api_key(&tx, api_key)?.ok_or(EngineError::InvalidApiKey)?;

        // Read the clock only once the write lock is held, so placed_at follows commit order.
        let now = self.now_ms();
        let interval = cfg.regen_interval_ms;
        let pool = compute_pool(
            agent.pixel_pool,
            agent.max_pool,
            agent.last_regen_at,
            now,
            interval,
        );
        if pool.available <= 0 {
            let wait_ms = pool.wait_ms(now, interval);
            tracing::debug!(agent_id = %agent.id, wait_ms, "pool exhausted");
            return Err(EngineError::PoolExhausted { wait_ms });
        }

        tx.execute(
            "INSERT INTO pixels (x, y, color, agent_id, placed_at_ms) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(x, y) DO UPDATE SET
               color = excluded.color,
               agent_id = excluded.agent_id,
               placed_at_ms = excluded.placed_at_ms",
            (x, y, color::to_sql(&color), &agent.id, now),
        )?;
        tx.execute(
            "INSERT INTO pixel_history (x, y, color, agent_id, placed_at_ms) VALUES (?1, ?2, ?3, ?4, ?5)",
            (x, y, color::to_sql(&color), &agent.id, now),
        )?;

        let remaining = pool.available - 1;
        let swapped = tx.execute(
            "UPDATE agents SET pixel_pool = ?1, last_regen_at_ms = ?2
             WHERE id = ?3 AND pixel_pool = ?4 AND last_regen_at_ms = ?5",
            (
                remaining,
                pool.new_regen_at,
                &agent.id,
                agent.pixel_pool,
                agent.last_regen_at,
            ),
        )?;
        if swapped != 1 {
            // Another writer moved the pool under us; dropping tx rolls everything back.
            return Err(EngineError::Busy);
        }
        increment_stats_tx(&tx, &agent.id, 1, now)?;
        tx.commit()?;

        tracing::debug!(agent_id = %agent.id, remaining, "pixel placed");
        let after = PoolState {
            available: remaining,
            new_regen_at: pool.new_regen_at,
        };
        Ok(Placement {
            success: true,
            x,
            y,
            color,
            pool: PoolInfo {
                remaining,
                max: agent.max_pool,
                next_regen_at: after.next_regen_at(agent.max_pool, interval),
            },
        })
    }
}
