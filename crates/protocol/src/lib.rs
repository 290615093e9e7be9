use serde::{Deserialize, Serialize};

/// A paint color: either an index into [`palette::PALETTE`] or a `#rgb` / `#rrggbb` string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Color {
    Palette(i64),
    Hex(String),
}

impl Color {
    /// Lenient conversion from an arbitrary JSON value. Anything that is not an
    /// integer or a string yields `None`; range and format checks happen later.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_i64().map(Color::Palette),
            serde_json::Value::String(s) => Some(Color::Hex(s.clone())),
            _ => None,
        }
    }

    pub fn as_hex(&self) -> Option<&str> {
        match self {
            Color::Hex(s) => Some(s),
            Color::Palette(_) => None,
        }
    }
}

impl std::fmt::Display for Color {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Color::Palette(i) => write!(f, "{i}"),
            Color::Hex(s) => f.write_str(s),
        }
    }
}

pub mod palette {
    /// Classic 16-color palette, index 0 = white ... 15 = purple.
    pub const PALETTE: [[u8; 3]; 16] = [
        [255, 255, 255],
        [228, 228, 228],
        [136, 136, 136],
        [34, 34, 34],
        [255, 167, 209],
        [229, 0, 0],
        [229, 149, 0],
        [160, 106, 66],
        [229, 217, 0],
        [148, 224, 68],
        [2, 190, 1],
        [0, 211, 221],
        [0, 131, 199],
        [0, 0, 234],
        [207, 110, 228],
        [130, 0, 128],
    ];

    pub const MAX_INDEX: i64 = PALETTE.len() as i64 - 1;

    pub fn hex(index: usize) -> Option<String> {
        PALETTE
            .get(index)
            .map(|[r, g, b]| format!("#{r:02X}{g:02X}{b:02X}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: i64,
    pub height: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coord {
    pub x: i64,
    pub y: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasPixel {
    pub x: i64,
    pub y: i64,
    pub color: Color,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanvasSnapshot {
    pub pixels: Vec<CanvasPixel>,
    pub dimensions: Dimensions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub x: i64,
    pub y: i64,
    pub color: Color,
    pub agent_id: String,
    pub placed_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub agent_id: String,
    pub api_key: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolInfo {
    pub remaining: i64,
    pub max: i64,
    pub next_regen_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub success: bool,
    pub x: i64,
    pub y: i64,
    pub color: Color,
    pub pool: PoolInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPool {
    pub remaining: i64,
    pub max: i64,
    pub next_regen_at: Option<i64>,
    pub regen_rate_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactionRef {
    pub slug: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub name: String,
    pub pixels_placed: i64,
    pub pool: StatusPool,
    pub faction: Option<FactionRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedFaction {
    pub agent_id: String,
    pub faction_id: String,
    pub agent: String,
    pub faction: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomeRegion {
    pub x: i64,
    pub y: i64,
    pub size: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Direction {
    pub dx: i64,
    pub dy: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactionStat {
    pub slug: String,
    pub name: String,
    pub color: String,
    pub pixel_count: i64,
    pub percentage: f64,
    pub agent_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedFaction {
    pub rank: usize,
    pub slug: String,
    pub name: String,
    pub color: String,
    pub pixel_count: i64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactionMember {
    pub id: String,
    pub name: String,
    pub pixels_placed: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerritoryView {
    pub pixel_count: i64,
    pub percentage: f64,
    pub border_pixels: Vec<Coord>,
    pub last_calculated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactionDetail {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_color: Option<String>,
    pub description: String,
    pub behavior: String,
    pub home: HomeRegion,
    pub expansion_dir: Direction,
    pub agents: Vec<FactionMember>,
    pub territory: Option<TerritoryView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerritoryResult {
    pub faction: String,
    pub pixels: i64,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerritoryReport {
    pub recalculated: usize,
    pub total_colored: i64,
    pub calculated_at: i64,
    pub results: Vec<TerritoryResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactionBadge {
    pub name: String,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictZoneView {
    pub x: i64,
    pub y: i64,
    pub intensity: i64,
    pub last_activity_at: i64,
    pub factions: [FactionBadge; 2],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecorded {
    pub created: bool,
    pub conflict_id: String,
    pub intensity: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaderboardSort {
    Pixels,
    Name,
    Newest,
    Oldest,
}

impl Default for LeaderboardSort {
    fn default() -> Self {
        Self::Pixels
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub name: String,
    pub pixels: i64,
    pub agent_id: String,
    pub faction: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardPage {
    pub items: Vec<LeaderboardEntry>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub total_agents: i64,
    pub total_pixels: i64,
    pub total_placements: i64,
    pub placements_last_hour: i64,
    pub factioned_agents: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Analytics {
    pub totals: Totals,
    pub generated_at: i64,
}

/// Body of every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<i64>,
}

pub mod requests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Register {
        pub name: String,
    }

    /// `color` stays raw JSON so a wrong type surfaces as an invalid color
    /// rather than a deserialization failure.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct PlacePixel {
        pub x: i64,
        pub y: i64,
        pub color: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub api_key: Option<String>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct WithApiKey {
        /// May instead travel in the `x-api-key` or `Authorization` header.
        #[serde(default)]
        pub api_key: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct JoinFaction {
        #[serde(default)]
        pub api_key: String,
        pub faction_slug: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Admin {
        pub admin_key: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct RecordConflict {
        pub admin_key: String,
        pub x: i64,
        pub y: i64,
        pub faction_a_slug: String,
        pub faction_b_slug: String,
        #[serde(default)]
        pub intensity: Option<i64>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct SetConfig {
        pub admin_key: String,
        pub key: String,
        pub value: serde_json::Value,
    }
}
