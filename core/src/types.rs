use std::fmt;

use alloy_primitives::Address;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::*;

// ── Tiles ───────────────────────────────────────────────────

/// Tile codes as stored in the land grid. `START` is the single
/// starting-position marker placed at generation time; it is rendered
/// as `"X"` wherever the grid is serialised.
pub mod tile {
    pub const DEPLETED: u8 = 0;
    pub const COMMON: u8 = 1;
    pub const UNCOMMON: u8 = 2;
    pub const RARE: u8 = 3;
    pub const START: u8 = u8::MAX;
}

pub fn tile_points(t: u8) -> u32 {
    match t {
        tile::COMMON => POINTS_COMMON,
        tile::UNCOMMON => POINTS_UNCOMMON,
        tile::RARE => POINTS_RARE,
        tile::START => POINTS_START,
        _ => 0,
    }
}

/// A land-grid cell as it appears on the wire and on disk: a plain
/// integer, except the starting marker which serialises as `"X"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileCode(pub u8);

impl Serialize for TileCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.0 == tile::START {
            serializer.serialize_str("X")
        } else {
            serializer.serialize_u8(self.0)
        }
    }
}

impl<'de> Deserialize<'de> for TileCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TileVisitor;

        impl<'de> de::Visitor<'de> for TileVisitor {
            type Value = TileCode;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a tile number or \"X\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<TileCode, E> {
                u8::try_from(v)
                    .map(TileCode)
                    .map_err(|_| E::custom("tile out of range"))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<TileCode, E> {
                u8::try_from(v)
                    .map(TileCode)
                    .map_err(|_| E::custom("tile out of range"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<TileCode, E> {
                if v == "X" {
                    Ok(TileCode(tile::START))
                } else {
                    Err(E::custom("unknown tile marker"))
                }
            }
        }

        deserializer.deserialize_any(TileVisitor)
    }
}

// ── Coordinates ─────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub x: u32,
    pub y: u32,
}

/// Torus wrap: normalise any integer coordinate into `[0, size)`.
pub fn wrap(c: i64, size: u32) -> u32 {
    let s = size as i64;
    (((c % s) + s) % s) as u32
}

// ── Directions ──────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    North,
    South,
    East,
    West,
    Northeast,
    Northwest,
    Southeast,
    Southwest,
}

impl Direction {
    /// Case-insensitive, whitespace-trimmed parse.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "north" => Some(Self::North),
            "south" => Some(Self::South),
            "east" => Some(Self::East),
            "west" => Some(Self::West),
            "northeast" => Some(Self::Northeast),
            "northwest" => Some(Self::Northwest),
            "southeast" => Some(Self::Southeast),
            "southwest" => Some(Self::Southwest),
            _ => None,
        }
    }

    /// Grid delta `(dx, dy)`; north is `y - 1`.
    pub fn delta(self) -> (i64, i64) {
        match self {
            Self::North => (0, -1),
            Self::South => (0, 1),
            Self::East => (1, 0),
            Self::West => (-1, 0),
            Self::Northeast => (1, -1),
            Self::Northwest => (-1, -1),
            Self::Southeast => (1, 1),
            Self::Southwest => (-1, 1),
        }
    }
}

// ── Map ─────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartingPosition {
    pub x: u32,
    pub y: u32,
    pub original_land_type: u8,
}

/// `size × size` tile grid, indexed `land[y][x]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GameMap {
    pub size: u32,
    pub land: Vec<Vec<u8>>,
    pub starting_position: StartingPosition,
}

impl GameMap {
    pub fn tile(&self, x: u32, y: u32) -> u8 {
        self.land[y as usize][x as usize]
    }

    pub fn set_tile(&mut self, x: u32, y: u32, t: u8) {
        self.land[y as usize][x as usize] = t;
    }
}

// ── Players ─────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    pub position: Position,
    pub score: u32,
    pub moves_remaining: u8,
    pub mines_remaining: u8,
}

/// One player's row in a scores/shutdown snapshot. `tile` is the tile
/// currently under the player.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSummary {
    pub address: Address,
    pub position: Position,
    pub tile: TileCode,
    pub score: u32,
    pub moves_remaining: u8,
    pub mines_remaining: u8,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub game_id: u64,
    pub players: Vec<PlayerSummary>,
    pub all_finished: bool,
}

// ── Rule errors ─────────────────────────────────────────────

/// Game-rule violations surfaced to players. The display strings are
/// the exact messages returned by the API.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleError {
    InvalidDirection,
    NoMovesRemaining,
    NoMinesRemaining,
    TileDepleted,
    TimerExpired,
    UnknownPlayer,
}

impl fmt::Display for RuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::InvalidDirection => "Invalid direction!",
            Self::NoMovesRemaining => "No moves remaining!",
            Self::NoMinesRemaining => "No mines remaining!",
            Self::TileDepleted => "This tile is already depleted!",
            Self::TimerExpired => "Time expired! Game over.",
            Self::UnknownPlayer => "Player record not found",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for RuleError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_normalises_into_range() {
        for c in -25i64..=25 {
            for s in 1u32..=7 {
                let w = wrap(c, s);
                assert!(w < s, "wrap({c}, {s}) = {w}");
            }
        }
        assert_eq!(wrap(-1, 5), 4);
        assert_eq!(wrap(5, 5), 0);
        assert_eq!(wrap(12, 5), 2);
        assert_eq!(wrap(-6, 5), 4);
    }

    #[test]
    fn direction_parse_is_lenient() {
        assert_eq!(Direction::parse("north"), Some(Direction::North));
        assert_eq!(Direction::parse("  NorthEast  "), Some(Direction::Northeast));
        assert_eq!(Direction::parse("WEST"), Some(Direction::West));
        assert_eq!(Direction::parse("up"), None);
        assert_eq!(Direction::parse(""), None);
    }

    #[test]
    fn tile_code_serialises_start_as_x() {
        let row = vec![
            TileCode(tile::COMMON),
            TileCode(tile::START),
            TileCode(tile::RARE),
        ];
        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"[1,"X",3]"#);
        let back: Vec<TileCode> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn tile_points_table() {
        assert_eq!(tile_points(tile::DEPLETED), 0);
        assert_eq!(tile_points(tile::COMMON), 1);
        assert_eq!(tile_points(tile::UNCOMMON), 5);
        assert_eq!(tile_points(tile::RARE), 10);
        assert_eq!(tile_points(tile::START), 25);
    }
}
