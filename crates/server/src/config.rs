use agentcanvas_engine::{default_factions, FactionSeed};
use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(name = "agentcanvas-server", about = "Shared pixel canvas for registered agents")]
pub struct ServerConfig {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:39333")]
    pub addr: SocketAddr,

    /// SQLite database path. Defaults to ~/.agentcanvas/agentcanvas.db.
    #[arg(long, env = "AGENTCANVAS_DB")]
    pub db: Option<PathBuf>,

    /// Secret required by admin endpoints. Admin endpoints refuse everything when unset.
    #[arg(long, env = "CANVAS_ADMIN_KEY", hide_env_values = true)]
    pub admin_key: Option<String>,

    /// YAML file with faction definitions. The built-in four are used otherwise.
    #[arg(long)]
    pub factions: Option<PathBuf>,

    /// Seconds between background territory recalculations; 0 disables them.
    #[arg(long, default_value_t = 300)]
    pub territory_interval_secs: u64,

    /// Per-request budget for engine work.
    #[arg(long, default_value_t = 10_000)]
    pub request_timeout_ms: u64,

    #[arg(short, long)]
    pub verbose: bool,
}

impl ServerConfig {
    pub fn db_path(&self) -> PathBuf {
        self.db.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".agentcanvas")
                .join("agentcanvas.db")
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }

    pub fn territory_interval(&self) -> Option<Duration> {
        (self.territory_interval_secs > 0).then(|| Duration::from_secs(self.territory_interval_secs))
    }

    pub fn faction_seeds(&self) -> anyhow::Result<Vec<FactionSeed>> {
        match &self.factions {
            Some(path) => load_faction_seeds(path),
            None => Ok(default_factions()),
        }
    }
}

/// A YAML list of faction definitions:
///
/// ```yaml
/// - slug: reds
///   name: Red Legion
///   color: "#E50000"
///   home: { x: 0, y: 0, size: 50 }
///   expansionDir: { dx: 1, dy: 1 }
/// ```
pub fn load_faction_seeds(path: &Path) -> anyhow::Result<Vec<FactionSeed>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read faction file: {}", path.display()))?;
    parse_faction_seeds(&raw).with_context(|| format!("parse faction file: {}", path.display()))
}

pub fn parse_faction_seeds(raw: &str) -> anyhow::Result<Vec<FactionSeed>> {
    Ok(serde_yaml::from_str(raw)?)
}
