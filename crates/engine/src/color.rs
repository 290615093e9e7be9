use crate::error::{EngineError, Result};
use agentcanvas_protocol::{palette, Color};
use regex::Regex;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use std::sync::OnceLock;

fn hex_pattern() -> &'static Regex {
    static HEX: OnceLock<Regex> = OnceLock::new();
    HEX.get_or_init(|| Regex::new(r"^#([0-9a-fA-F]{3}|[0-9a-fA-F]{6})$").expect("static regex"))
}

pub fn validate_color(color: &Color) -> Result<()> {
    let ok = match color {
        Color::Palette(i) => (0..=palette::MAX_INDEX).contains(i),
        Color::Hex(s) => hex_pattern().is_match(s),
    };
    if ok {
        Ok(())
    } else {
        Err(EngineError::InvalidColor)
    }
}

/// Territory attribution. Palette colors are neutral; a hex color belongs to a
/// faction when it equals either faction color or shares its first four
/// characters (`#` plus three nibbles), compared case-insensitively.
pub fn color_matches_faction(color: &Color, primary: &str, secondary: Option<&str>) -> bool {
    let Some(c) = color.as_hex() else {
        return false;
    };
    let c = c.to_lowercase();
    let matches = |faction_color: &str| {
        let f = faction_color.to_lowercase();
        let prefix: String = f.chars().take(4).collect();
        c == f || c.starts_with(&prefix)
    };
    matches(primary) || secondary.is_some_and(matches)
}

/// Palette colors persist as INTEGER, hex colors as TEXT.
pub(crate) fn to_sql(color: &Color) -> ToSqlOutput<'_> {
    match color {
        Color::Palette(i) => ToSqlOutput::Owned(Value::Integer(*i)),
        Color::Hex(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
    }
}

pub(crate) fn from_sql(value: ValueRef<'_>) -> rusqlite::Result<Color> {
    match value {
        ValueRef::Integer(i) => Ok(Color::Palette(i)),
        ValueRef::Text(t) => Ok(Color::Hex(String::from_utf8_lossy(t).into_owned())),
        other => Err(rusqlite::Error::InvalidColumnType(
            0,
            "color".to_string(),
            other.data_type(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Color {
        Color::Hex(s.to_string())
    }

    #[test]
    fn palette_range() {
        assert!(validate_color(&Color::Palette(0)).is_ok());
        assert!(validate_color(&Color::Palette(15)).is_ok());
        assert!(matches!(
            validate_color(&Color::Palette(16)),
            Err(EngineError::InvalidColor)
        ));
        assert!(matches!(
            validate_color(&Color::Palette(-1)),
            Err(EngineError::InvalidColor)
        ));
    }

    #[test]
    fn hex_forms() {
        assert!(validate_color(&hex("#fff")).is_ok());
        assert!(validate_color(&hex("#A1b2C3")).is_ok());
        for bad in ["#ZZZZZZ", "ff0000", "#ff00", "#ff00000", ""] {
            assert!(validate_color(&hex(bad)).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn exact_and_prefix_match() {
        assert!(color_matches_faction(&hex("#FF6B00"), "#FF6B00", None));
        assert!(color_matches_faction(&hex("#ff6b00"), "#FF6B00", None));
        // Same leading "#ff6" as the primary.
        assert!(color_matches_faction(&hex("#FF6000"), "#FF6B00", None));
        assert!(!color_matches_faction(&hex("#FF5B00"), "#FF6B00", None));
        assert!(color_matches_faction(&hex("#FF95AA"), "#FF6B00", Some("#FF9500")));
    }

    #[test]
    fn palette_pixels_are_neutral() {
        assert!(!color_matches_faction(&Color::Palette(5), "#E50000", None));
    }

    #[test]
    fn short_hex_is_prefix_compared() {
        // "#fff" is its own four-character prefix.
        assert!(color_matches_faction(&hex("#FFFFFF"), "#fff", None));
        assert!(color_matches_faction(&hex("#fff"), "#FFF000", None));
    }
}
