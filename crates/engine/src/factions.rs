use crate::color::{self, color_matches_faction, validate_color};
use crate::config::CanvasConfig;
use crate::error::{EngineError, Result};
use crate::protocol::{
    Color, ConflictRecorded, ConflictZoneView, Coord, Direction, FactionBadge, FactionDetail,
    FactionMember, FactionStat, HomeRegion, RankedFaction, TerritoryReport, TerritoryResult,
    TerritoryView,
};
use crate::{new_id, write_tx, Engine};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// Matching coordinates kept per faction as a territory preview.
pub const BORDER_SAMPLE: usize = 100;
/// Border sample size returned by the single-faction detail view.
pub const DETAIL_BORDER_SAMPLE: usize = 50;
/// Pixels read per slice of the territory scan.
pub const TERRITORY_CHUNK: i64 = 10_000;
pub const CONFLICT_DEFAULT_INTENSITY: i64 = 50;
pub const CONFLICT_STEP: i64 = 10;
pub const CONFLICT_MAX_INTENSITY: i64 = 100;

const FACTION_COLUMNS: &str = "id, slug, name, description, primary_color, secondary_color, \
     home_x, home_y, home_size, expansion_dx, expansion_dy, behavior, pixel_count, agent_count, created_at_ms";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Faction {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub description: String,
    pub primary_color: String,
    pub secondary_color: Option<String>,
    pub home: HomeRegion,
    pub expansion: Direction,
    pub behavior: String,
    pub pixel_count: i64,
    pub agent_count: i64,
    pub created_at: i64,
}

impl Faction {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            slug: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            primary_color: row.get(4)?,
            secondary_color: row.get(5)?,
            home: HomeRegion {
                x: row.get(6)?,
                y: row.get(7)?,
                size: row.get(8)?,
            },
            expansion: Direction {
                dx: row.get(9)?,
                dy: row.get(10)?,
            },
            behavior: row.get(11)?,
            pixel_count: row.get(12)?,
            agent_count: row.get(13)?,
            created_at: row.get(14)?,
        })
    }

    pub fn matches(&self, color: &Color) -> bool {
        color_matches_faction(color, &self.primary_color, self.secondary_color.as_deref())
    }
}

/// Static faction definition, as written in a seed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactionSeed {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub color: String,
    #[serde(default)]
    pub secondary_color: Option<String>,
    pub home: HomeRegion,
    pub expansion_dir: Direction,
    #[serde(default)]
    pub behavior: String,
}

impl FactionSeed {
    fn validate(&self) -> Result<()> {
        validate_color(&Color::Hex(self.color.clone()))?;
        if let Some(c) = &self.secondary_color {
            validate_color(&Color::Hex(c.clone()))?;
        }
        Ok(())
    }
}

/// The four factions a fresh canvas starts with, one per corner.
pub fn default_factions() -> Vec<FactionSeed> {
    let seed = |slug: &str,
                name: &str,
                description: &str,
                color: &str,
                secondary: &str,
                home: (i64, i64),
                dir: (i64, i64),
                behavior: &str| FactionSeed {
        slug: slug.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        color: color.to_string(),
        secondary_color: Some(secondary.to_string()),
        home: HomeRegion {
            x: home.0,
            y: home.1,
            size: 50,
        },
        expansion_dir: Direction {
            dx: dir.0,
            dy: dir.1,
        },
        behavior: behavior.to_string(),
    };
    vec![
        seed(
            "vibe-coders",
            "Vibe Coders",
            "Aesthetic-first, beautiful but fragile.",
            "#FFB6C1",
            "#87CEEB",
            (0, 0),
            (1, 1),
            "aesthetic",
        ),
        seed(
            "devs",
            "Devs",
            "Clean, efficient, type-safe.",
            "#1E1E1E",
            "#007ACC",
            (450, 0),
            (-1, 1),
            "systematic",
        ),
        seed(
            "accels",
            "Accels",
            "Speed above all, aggressive expansion.",
            "#FF6B00",
            "#FF9500",
            (0, 450),
            (1, -1),
            "aggressive",
        ),
        seed(
            "degens",
            "Degens",
            "High-risk, meme-driven, unpredictable.",
            "#BF00FF",
            "#FFD700",
            (450, 450),
            (-1, -1),
            "chaotic",
        ),
    ]
}

pub(crate) fn by_slug(conn: &Connection, slug: &str) -> Result<Option<Faction>> {
    Ok(conn
        .query_row(
            &format!("SELECT {FACTION_COLUMNS} FROM factions WHERE slug = ?1"),
            [slug],
            Faction::from_row,
        )
        .optional()?)
}

pub(crate) fn by_id(conn: &Connection, id: &str) -> Result<Option<Faction>> {
    Ok(conn
        .query_row(
            &format!("SELECT {FACTION_COLUMNS} FROM factions WHERE id = ?1"),
            [id],
            Faction::from_row,
        )
        .optional()?)
}

fn load_factions(conn: &Connection) -> Result<Vec<Faction>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {FACTION_COLUMNS} FROM factions ORDER BY created_at_ms, slug"
    ))?;
    let rows = stmt.query_map([], Faction::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// One decimal place, with an empty canvas counted as one pixel.
pub fn territory_percentage(count: i64, total_colored: i64) -> f64 {
    let total = total_colored.max(1) as f64;
    ((count as f64 / total) * 1000.0).round() / 10.0
}

#[derive(Debug, Default)]
struct Tally {
    count: i64,
    border: Vec<Coord>,
}

impl Engine {
    /// Insert seeds whose slug is not present yet. Existing factions are left
    /// untouched; slugs never change once created.
    pub fn ensure_factions(&self, seeds: &[FactionSeed]) -> Result<usize> {
        for seed in seeds {
            seed.validate()?;
        }
        let mut conn = self.open()?;
        let tx = write_tx(&mut conn)?;
        let now = self.now_ms();
        let mut inserted = 0;
        for seed in seeds {
            inserted += tx.execute(
                "INSERT INTO factions (id, slug, name, description, primary_color, secondary_color,
                   home_x, home_y, home_size, expansion_dx, expansion_dy, behavior, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(slug) DO NOTHING",
                rusqlite::params![
                    new_id("faction", now),
                    seed.slug,
                    seed.name,
                    seed.description,
                    seed.color,
                    seed.secondary_color,
                    seed.home.x,
                    seed.home.y,
                    seed.home.size,
                    seed.expansion_dir.dx,
                    seed.expansion_dir.dy,
                    seed.behavior,
                    now,
                ],
            )?;
        }
        tx.commit()?;
        if inserted > 0 {
            tracing::info!(inserted, "factions seeded");
        }
        Ok(inserted)
    }

    pub fn list_factions(&self) -> Result<Vec<Faction>> {
        let conn = self.open()?;
        load_factions(&conn)
    }

    /// Per-faction territory from the last recalculation, largest first.
    /// Member counts are live.
    pub fn get_faction_stats(&self) -> Result<Vec<FactionStat>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT f.slug, f.name, f.primary_color, COALESCE(t.pixel_count, 0),
                    COALESCE(t.percentage, 0.0),
                    (SELECT COUNT(*) FROM agents a WHERE a.faction_id = f.id)
             FROM factions f LEFT JOIN territory t ON t.faction_id = f.id
             ORDER BY COALESCE(t.pixel_count, 0) DESC, f.slug ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(FactionStat {
                slug: row.get(0)?,
                name: row.get(1)?,
                color: row.get(2)?,
                pixel_count: row.get(3)?,
                percentage: row.get(4)?,
                agent_count: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn faction_leaderboard(&self, limit: Option<usize>) -> Result<Vec<RankedFaction>> {
        let limit = limit.unwrap_or(4).max(1);
        Ok(self
            .get_faction_stats()?
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(i, s)| RankedFaction {
                rank: i + 1,
                slug: s.slug,
                name: s.name,
                color: s.color,
                pixel_count: s.pixel_count,
                percentage: s.percentage,
            })
            .collect())
    }

    pub fn get_faction(&self, slug: &str) -> Result<FactionDetail> {
        let conn = self.open()?;
        let faction =
            by_slug(&conn, slug)?.ok_or_else(|| EngineError::FactionNotFound(slug.to_string()))?;

        let mut stmt = conn.prepare(
            "SELECT id, name, pixels_placed FROM agents WHERE faction_id = ?1
             ORDER BY pixels_placed DESC, name ASC",
        )?;
        let agents = stmt
            .query_map([&faction.id], |row| {
                Ok(FactionMember {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    pixels_placed: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let territory = conn
            .query_row(
                "SELECT pixel_count, percentage, border_json, last_calculated_at_ms
                 FROM territory WHERE faction_id = ?1",
                [&faction.id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;
        let territory = match territory {
            Some((pixel_count, percentage, border_json, last_calculated_at)) => {
                let mut border_pixels: Vec<Coord> = serde_json::from_str(&border_json)?;
                border_pixels.truncate(DETAIL_BORDER_SAMPLE);
                Some(TerritoryView {
                    pixel_count,
                    percentage,
                    border_pixels,
                    last_calculated_at,
                })
            }
            None => None,
        };

        Ok(FactionDetail {
            id: faction.id,
            slug: faction.slug,
            name: faction.name,
            color: faction.primary_color,
            secondary_color: faction.secondary_color,
            description: faction.description,
            behavior: faction.behavior,
            home: faction.home,
            expansion_dir: faction.expansion,
            agents,
            territory,
        })
    }

    /// Admin: rebuild every territory snapshot from the live canvas.
    pub fn recalculate_territory(&self, admin_key: &str) -> Result<TerritoryReport> {
        self.admin.check(admin_key)?;
        self.refresh_territory(&AtomicBool::new(false))
    }

    /// Scan the canvas in slices from one read snapshot, then write all
    /// snapshots in a single short transaction. Setting `cancel` between slices
    /// aborts the pass before anything is written.
    #[tracing::instrument(skip_all)]
    pub fn refresh_territory(&self, cancel: &AtomicBool) -> Result<TerritoryReport> {
        let mut conn = self.open()?;

        let (factions, tallies, total_colored) = {
            let snapshot = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
            // Factions come from the same snapshot as the pixels they are matched against.
            let factions = load_factions(&snapshot)?;
            let mut tallies: Vec<Tally> = factions.iter().map(|_| Tally::default()).collect();
            let mut total_colored = 0i64;
            let mut stmt = snapshot.prepare(
                "SELECT x, y, color FROM pixels WHERE (x, y) > (?1, ?2) ORDER BY x, y LIMIT ?3",
            )?;
            let mut cursor = (i64::MIN, i64::MIN);
            loop {
                if cancel.load(Ordering::Relaxed) {
                    tracing::info!(scanned = total_colored, "territory refresh cancelled");
                    return Err(EngineError::Cancelled);
                }
                let chunk = stmt
                    .query_map((cursor.0, cursor.1, TERRITORY_CHUNK), |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            color::from_sql(row.get_ref(2)?)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                let Some(&(lx, ly, _)) = chunk.last() else {
                    break;
                };
                cursor = (lx, ly);
                for (x, y, color) in &chunk {
                    total_colored += 1;
                    for (faction, tally) in factions.iter().zip(tallies.iter_mut()) {
                        if faction.matches(color) {
                            tally.count += 1;
                            if tally.border.len() < BORDER_SAMPLE {
                                tally.border.push(Coord { x: *x, y: *y });
                            }
                        }
                    }
                }
            }
            (factions, tallies, total_colored)
        };

        let now = self.now_ms();
        let tx = write_tx(&mut conn)?;
        let mut results = Vec::with_capacity(factions.len());
        for (faction, tally) in factions.iter().zip(tallies) {
            let percentage = territory_percentage(tally.count, total_colored);
            tx.execute(
                "INSERT INTO territory (faction_id, pixel_count, percentage, border_json, last_calculated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(faction_id) DO UPDATE SET
                   pixel_count = excluded.pixel_count,
                   percentage = excluded.percentage,
                   border_json = excluded.border_json,
                   last_calculated_at_ms = excluded.last_calculated_at_ms",
                (
                    &faction.id,
                    tally.count,
                    percentage,
                    serde_json::to_string(&tally.border)?,
                    now,
                ),
            )?;
            tx.execute(
                "UPDATE factions SET pixel_count = ?1,
                   agent_count = (SELECT COUNT(*) FROM agents WHERE faction_id = ?2)
                 WHERE id = ?2",
                (tally.count, &faction.id),
            )?;
            results.push(TerritoryResult {
                faction: faction.slug.clone(),
                pixels: tally.count,
                percentage,
            });
        }
        tx.commit()?;

        tracing::info!(
            factions = results.len(),
            total_colored,
            "territory recalculated"
        );
        Ok(TerritoryReport {
            recalculated: results.len(),
            total_colored,
            calculated_at: now,
            results,
        })
    }

    /// Most recently active contested coordinates, newest first.
    pub fn get_conflict_zones(&self, limit: Option<i64>) -> Result<Vec<ConflictZoneView>> {
        let limit = limit.unwrap_or(20).clamp(1, 100);
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT c.x, c.y, c.intensity, c.last_activity_at_ms,
                    a.name, a.primary_color, b.name, b.primary_color
             FROM conflict_zones c
             LEFT JOIN factions a ON a.id = c.faction_a
             LEFT JOIN factions b ON b.id = c.faction_b
             ORDER BY c.last_activity_at_ms DESC, c.id DESC LIMIT ?1",
        )?;
        let badge = |name: Option<String>, color: Option<String>| FactionBadge {
            name: name.unwrap_or_else(|| "Unknown".to_string()),
            color: color.unwrap_or_else(|| "#888".to_string()),
        };
        let rows = stmt.query_map([limit], |row| {
            Ok(ConflictZoneView {
                x: row.get(0)?,
                y: row.get(1)?,
                intensity: row.get(2)?,
                last_activity_at: row.get(3)?,
                factions: [
                    badge(row.get(4)?, row.get(5)?),
                    badge(row.get(6)?, row.get(7)?),
                ],
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Admin: flag `(x, y)` as contested. Repeat reports at the same coordinate
    /// heat the existing zone instead of adding rows.
    pub fn record_conflict(
        &self,
        admin_key: &str,
        x: i64,
        y: i64,
        faction_a: &str,
        faction_b: &str,
        intensity: Option<i64>,
    ) -> Result<ConflictRecorded> {
        self.admin.check(admin_key)?;
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
        let tx = write_tx(&mut conn)?;
        let a = by_slug(&tx, faction_a)?
            .ok_or_else(|| EngineError::FactionNotFound(faction_a.to_string()))?;
        let b = by_slug(&tx, faction_b)?
            .ok_or_else(|| EngineError::FactionNotFound(faction_b.to_string()))?;
        let now = self.now_ms();

        let existing: Option<(String, i64)> = tx
            .query_row(
                "SELECT id, intensity FROM conflict_zones WHERE x = ?1 AND y = ?2",
                (x, y),
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let recorded = match existing {
            Some((id, current)) => {
                let intensity = (current + CONFLICT_STEP).min(CONFLICT_MAX_INTENSITY);
                tx.execute(
                    "UPDATE conflict_zones SET intensity = ?1, last_activity_at_ms = ?2 WHERE id = ?3",
                    (intensity, now, &id),
                )?;
                ConflictRecorded {
                    created: false,
                    conflict_id: id,
                    intensity,
                }
            }
            None => {
                let id = new_id("conflict", now);
                let intensity = intensity
                    .unwrap_or(CONFLICT_DEFAULT_INTENSITY)
                    .clamp(0, CONFLICT_MAX_INTENSITY);
                tx.execute(
                    "INSERT INTO conflict_zones (id, x, y, faction_a, faction_b, intensity, last_activity_at_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    (&id, x, y, &a.id, &b.id, intensity, now),
                )?;
                ConflictRecorded {
                    created: true,
                    conflict_id: id,
                    intensity,
                }
            }
        };
        tx.commit()?;
        tracing::info!(x, y, a = %a.slug, b = %b.slug, intensity = recorded.intensity, "conflict recorded");
        Ok(recorded)
    }
}
