//! Token-bucket arithmetic for an agent's pixel pool.
//!
//! Everything here is pure: callers decide whether to persist the advanced
//! regeneration timestamp.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolState {
    pub available: i64,
    pub new_regen_at: i64,
}

/// Tokens available at `now`, and the regeneration anchor advanced by the whole
/// intervals that produced them. The fractional remainder of the current interval
/// stays in `now - new_regen_at` for the next call.
pub fn compute_pool(
    stored: i64,
    max: i64,
    last_regen_at: i64,
    now: i64,
    interval_ms: i64,
) -> PoolState {
    let interval_ms = interval_ms.max(1);
    let elapsed = now.saturating_sub(last_regen_at).max(0);
    let regenerated = elapsed / interval_ms;
    let available = stored.max(0).saturating_add(regenerated).min(max);
    PoolState {
        available,
        new_regen_at: last_regen_at.saturating_add(regenerated.saturating_mul(interval_ms)),
    }
}

impl PoolState {
    /// When the next token lands, or `None` once the pool is full.
    pub fn next_regen_at(&self, max: i64, interval_ms: i64) -> Option<i64> {
        if self.available >= max {
            None
        } else {
            Some(self.new_regen_at + interval_ms)
        }
    }

    /// Milliseconds until the next single token regenerates.
    pub fn wait_ms(&self, now: i64, interval_ms: i64) -> i64 {
        (self.new_regen_at + interval_ms - now).max(0)
    }
}
