use std::collections::BTreeMap;

use alloy_primitives::{Address, B256};
use serde::Serialize;

use crate::constants::*;
use crate::map::player_spawn;
use crate::types::*;

/// In-memory state of one running game. The session owns the map
/// buffer and the player records; the wall-clock is injected (callers
/// pass epoch milliseconds), so every rule here is deterministic.
#[derive(Clone, Debug)]
pub struct Session {
    game_id: u64,
    map: GameMap,
    players: BTreeMap<Address, PlayerState>,
    deadline_ms: u64,
    expired: bool,
}

/// One cell of a player's 3×3 window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewCell {
    pub tile: TileCode,
    pub player: Option<Address>,
    pub coordinates: Position,
}

/// 3×3 window centred on the player, `cells[dy][dx]` with the player
/// in the middle, plus the player's own stats.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewWindow {
    pub cells: Vec<Vec<ViewCell>>,
    pub position: Position,
    pub score: u32,
    pub moves_remaining: u8,
    pub mines_remaining: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MoveOutcome {
    pub position: Position,
    pub tile: u8,
    pub moves_remaining: u8,
    pub mines_remaining: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MineOutcome {
    pub points_earned: u32,
    pub score: u32,
    pub mines_remaining: u8,
}

impl Session {
    /// Build the session at server start: every registered player gets
    /// a deterministic starting cell and full budgets.
    pub fn new(
        game_id: u64,
        map: GameMap,
        player_addresses: &[Address],
        seed: B256,
        now_ms: u64,
    ) -> Self {
        let size = map.size;
        let players = player_addresses
            .iter()
            .map(|&addr| {
                let state = PlayerState {
                    position: player_spawn(seed, addr, game_id, size),
                    score: 0,
                    moves_remaining: MAX_MOVES,
                    mines_remaining: MAX_MINES,
                };
                (addr, state)
            })
            .collect();
        Self {
            game_id,
            map,
            players,
            deadline_ms: now_ms + GAME_DURATION_MS,
            expired: false,
        }
    }

    pub fn game_id(&self) -> u64 {
        self.game_id
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn is_player(&self, addr: Address) -> bool {
        self.players.contains_key(&addr)
    }

    pub fn time_remaining_ms(&self, now_ms: u64) -> u64 {
        if self.expired {
            return 0;
        }
        self.deadline_ms.saturating_sub(now_ms)
    }

    pub fn deadline_ms(&self) -> u64 {
        self.deadline_ms
    }

    fn timer_expired(&self, now_ms: u64) -> bool {
        self.expired || now_ms >= self.deadline_ms
    }

    /// Timer fired: zero every budget. Later move/mine attempts return
    /// `TimerExpired`.
    pub fn expire(&mut self) {
        self.expired = true;
        for p in self.players.values_mut() {
            p.moves_remaining = 0;
            p.mines_remaining = 0;
        }
    }

    /// 3×3 window centred on the caller.
    pub fn view(&self, addr: Address) -> Result<ViewWindow, RuleError> {
        let player = self.players.get(&addr).ok_or(RuleError::UnknownPlayer)?;
        Ok(self.window_at(*player))
    }

    fn window_at(&self, player: PlayerState) -> ViewWindow {
        let size = self.map.size;
        let pos = player.position;
        let mut cells = Vec::with_capacity(3);
        for dy in -1i64..=1 {
            let mut row = Vec::with_capacity(3);
            for dx in -1i64..=1 {
                let x = wrap(pos.x as i64 + dx, size);
                let y = wrap(pos.y as i64 + dy, size);
                let occupant = self
                    .players
                    .iter()
                    .find(|(_, p)| p.position.x == x && p.position.y == y)
                    .map(|(a, _)| *a);
                row.push(ViewCell {
                    tile: TileCode(self.map.tile(x, y)),
                    player: occupant,
                    coordinates: Position { x, y },
                });
            }
            cells.push(row);
        }
        ViewWindow {
            cells,
            position: pos,
            score: player.score,
            moves_remaining: player.moves_remaining,
            mines_remaining: player.mines_remaining,
        }
    }

    /// Move one step in `direction` (torus wrap), spending one move.
    pub fn move_player(
        &mut self,
        addr: Address,
        direction: &str,
        now_ms: u64,
    ) -> Result<MoveOutcome, RuleError> {
        if !self.players.contains_key(&addr) {
            return Err(RuleError::UnknownPlayer);
        }
        if self.timer_expired(now_ms) {
            return Err(RuleError::TimerExpired);
        }
        let dir = Direction::parse(direction).ok_or(RuleError::InvalidDirection)?;

        let size = self.map.size;
        let player = self.players.get_mut(&addr).ok_or(RuleError::UnknownPlayer)?;
        if player.moves_remaining == 0 {
            return Err(RuleError::NoMovesRemaining);
        }
        let (dx, dy) = dir.delta();
        player.position = Position {
            x: wrap(player.position.x as i64 + dx, size),
            y: wrap(player.position.y as i64 + dy, size),
        };
        player.moves_remaining -= 1;
        let out = MoveOutcome {
            position: player.position,
            tile: self.map.tile(player.position.x, player.position.y),
            moves_remaining: player.moves_remaining,
            mines_remaining: player.mines_remaining,
        };
        Ok(out)
    }

    /// Mine the tile under the caller: credit its points, deplete it,
    /// spend one mine.
    pub fn mine(&mut self, addr: Address, now_ms: u64) -> Result<MineOutcome, RuleError> {
        if !self.players.contains_key(&addr) {
            return Err(RuleError::UnknownPlayer);
        }
        if self.timer_expired(now_ms) {
            return Err(RuleError::TimerExpired);
        }
        let player = self.players.get(&addr).ok_or(RuleError::UnknownPlayer)?;
        if player.mines_remaining == 0 {
            return Err(RuleError::NoMinesRemaining);
        }
        let pos = player.position;
        let t = self.map.tile(pos.x, pos.y);
        if t == tile::DEPLETED {
            return Err(RuleError::TileDepleted);
        }
        let points = tile_points(t);
        self.map.set_tile(pos.x, pos.y, tile::DEPLETED);
        let player = self.players.get_mut(&addr).ok_or(RuleError::UnknownPlayer)?;
        player.score += points;
        player.mines_remaining -= 1;
        Ok(MineOutcome {
            points_earned: points,
            score: player.score,
            mines_remaining: player.mines_remaining,
        })
    }

    /// A player is finished when out of mines, or out of moves while
    /// stranded on a depleted tile. Vacuously true with no players.
    pub fn all_players_finished(&self) -> bool {
        self.players.values().all(|p| {
            p.mines_remaining == 0
                || (p.moves_remaining == 0
                    && self.map.tile(p.position.x, p.position.y) == tile::DEPLETED)
        })
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            game_id: self.game_id,
            players: self
                .players
                .iter()
                .map(|(&address, p)| PlayerSummary {
                    address,
                    position: p.position,
                    tile: TileCode(self.map.tile(p.position.x, p.position.y)),
                    score: p.score,
                    moves_remaining: p.moves_remaining,
                    mines_remaining: p.mines_remaining,
                })
                .collect(),
            all_finished: self.all_players_finished(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::generate_map;
    use alloy_primitives::B256;

    const T0: u64 = 1_700_000_000_000;

    fn flat_map(size: u32, t: u8) -> GameMap {
        GameMap {
            size,
            land: vec![vec![t; size as usize]; size as usize],
            starting_position: StartingPosition { x: 0, y: 0, original_land_type: t },
        }
    }

    fn player(n: u8) -> Address {
        Address::with_last_byte(n)
    }

    fn session_with(map: GameMap, players: &[Address]) -> Session {
        Session::new(7, map, players, B256::repeat_byte(0x42), T0)
    }

    #[test]
    fn players_start_with_full_budgets() {
        let s = session_with(flat_map(5, tile::COMMON), &[player(1), player(2)]);
        let snap = s.snapshot();
        assert_eq!(snap.players.len(), 2);
        for p in &snap.players {
            assert_eq!(p.score, 0);
            assert_eq!(p.moves_remaining, MAX_MOVES);
            assert_eq!(p.mines_remaining, MAX_MINES);
            assert!(p.position.x < 5 && p.position.y < 5);
        }
    }

    #[test]
    fn spawn_matches_reference_generator() {
        let seed = B256::repeat_byte(0x42);
        let s = Session::new(7, flat_map(5, tile::COMMON), &[player(1)], seed, T0);
        let expected = player_spawn(seed, player(1), 7, 5);
        assert_eq!(s.snapshot().players[0].position, expected);
    }

    #[test]
    fn east_moves_wrap_around_the_torus() {
        // Scenario: 5×5 map, 12 east moves end at (x+12) mod 5.
        let mut s = session_with(flat_map(5, tile::COMMON), &[player(1)]);
        let start = s.view(player(1)).unwrap().position;
        for _ in 0..12 {
            s.move_player(player(1), "east", T0 + 1).unwrap();
        }
        let end = s.view(player(1)).unwrap().position;
        assert_eq!(end.x, wrap(start.x as i64 + 12, 5));
        assert_eq!(end.y, start.y);
        assert_eq!(
            s.move_player(player(1), "east", T0 + 2),
            Err(RuleError::NoMovesRemaining)
        );
    }

    #[test]
    fn budgets_never_increase() {
        let mut s = session_with(flat_map(5, tile::COMMON), &[player(1)]);
        let mut last_moves = MAX_MOVES;
        let mut last_mines = MAX_MINES;
        for i in 0..20u64 {
            let _ = s.move_player(player(1), "north", T0 + i);
            let _ = s.mine(player(1), T0 + i);
            let p = &s.snapshot().players[0];
            assert!(p.moves_remaining <= last_moves);
            assert!(p.mines_remaining <= last_mines);
            last_moves = p.moves_remaining;
            last_mines = p.mines_remaining;
        }
    }

    #[test]
    fn invalid_direction_is_rejected() {
        let mut s = session_with(flat_map(5, tile::COMMON), &[player(1)]);
        assert_eq!(
            s.move_player(player(1), "upwards", T0),
            Err(RuleError::InvalidDirection)
        );
        // and costs nothing
        assert_eq!(s.snapshot().players[0].moves_remaining, MAX_MOVES);
    }

    #[test]
    fn mine_depletes_and_scores() {
        let mut s = session_with(flat_map(3, tile::RARE), &[player(1)]);
        let first = s.mine(player(1), T0).unwrap();
        assert_eq!(first.points_earned, POINTS_RARE);
        assert_eq!(first.score, POINTS_RARE);
        assert_eq!(first.mines_remaining, MAX_MINES - 1);
        // same cell again: depleted
        assert_eq!(s.mine(player(1), T0), Err(RuleError::TileDepleted));
    }

    #[test]
    fn mining_the_start_marker_pays_25() {
        let mut map = flat_map(3, tile::COMMON);
        map.starting_position = StartingPosition { x: 1, y: 1, original_land_type: tile::COMMON };
        map.set_tile(1, 1, tile::START);
        let mut s = session_with(map, &[player(1)]);
        // walk the player onto the marker
        let pos = s.view(player(1)).unwrap().position;
        let dx = 1i64 - pos.x as i64;
        let dy = 1i64 - pos.y as i64;
        for _ in 0..dx.unsigned_abs() {
            s.move_player(player(1), if dx > 0 { "east" } else { "west" }, T0).unwrap();
        }
        for _ in 0..dy.unsigned_abs() {
            s.move_player(player(1), if dy > 0 { "south" } else { "north" }, T0).unwrap();
        }
        let out = s.mine(player(1), T0).unwrap();
        assert_eq!(out.points_earned, POINTS_START);
    }

    #[test]
    fn timer_expiry_zeroes_budgets_and_blocks_actions() {
        let mut s = session_with(flat_map(5, tile::COMMON), &[player(1), player(2)]);
        s.expire();
        for p in &s.snapshot().players {
            assert_eq!(p.moves_remaining, 0);
            assert_eq!(p.mines_remaining, 0);
        }
        assert_eq!(
            s.move_player(player(1), "east", T0),
            Err(RuleError::TimerExpired)
        );
        assert_eq!(s.mine(player(2), T0), Err(RuleError::TimerExpired));
        assert_eq!(s.time_remaining_ms(T0), 0);
    }

    #[test]
    fn deadline_passing_expires_without_the_timer_task() {
        let mut s = session_with(flat_map(5, tile::COMMON), &[player(1)]);
        let late = T0 + GAME_DURATION_MS;
        assert_eq!(
            s.move_player(player(1), "east", late),
            Err(RuleError::TimerExpired)
        );
        assert_eq!(s.time_remaining_ms(late), 0);
        // one millisecond earlier still plays
        assert!(s.move_player(player(1), "east", late - 1).is_ok());
    }

    #[test]
    fn unknown_player_is_distinct_from_rule_errors() {
        let mut s = session_with(flat_map(5, tile::COMMON), &[player(1)]);
        assert_eq!(s.view(player(9)).unwrap_err(), RuleError::UnknownPlayer);
        assert_eq!(
            s.move_player(player(9), "east", T0),
            Err(RuleError::UnknownPlayer)
        );
        assert_eq!(s.mine(player(9), T0), Err(RuleError::UnknownPlayer));
    }

    #[test]
    fn view_is_a_3x3_wrapped_window() {
        let map = generate_map(B256::repeat_byte(0x11), 5);
        let s = Session::new(3, map.clone(), &[player(1)], B256::repeat_byte(0x11), T0);
        let w = s.view(player(1)).unwrap();
        assert_eq!(w.cells.len(), 3);
        let pos = w.position;
        for (dy, row) in w.cells.iter().enumerate() {
            assert_eq!(row.len(), 3);
            for (dx, cell) in row.iter().enumerate() {
                let x = wrap(pos.x as i64 + dx as i64 - 1, 5);
                let y = wrap(pos.y as i64 + dy as i64 - 1, 5);
                assert_eq!(cell.coordinates, Position { x, y });
                assert_eq!(cell.tile, TileCode(map.tile(x, y)));
            }
        }
        // the centre cell shows the caller
        assert_eq!(w.cells[1][1].player, Some(player(1)));
    }

    #[test]
    fn finish_condition_mines_exhausted() {
        let mut s = session_with(flat_map(3, tile::COMMON), &[player(1)]);
        assert!(!s.all_players_finished());
        for _ in 0..3 {
            s.mine(player(1), T0).unwrap();
            if s.snapshot().players[0].mines_remaining > 0 {
                s.move_player(player(1), "east", T0).unwrap();
            }
        }
        assert!(s.all_players_finished());
    }

    #[test]
    fn finish_condition_stranded_on_depleted_tile() {
        // Out of moves on a depleted tile, mines left: finished.
        let mut s = session_with(flat_map(3, tile::COMMON), &[player(1)]);
        s.mine(player(1), T0).unwrap();
        for _ in 0..6 {
            s.move_player(player(1), "east", T0).unwrap();
            s.move_player(player(1), "west", T0).unwrap();
        }
        let p = &s.snapshot().players[0];
        assert_eq!(p.moves_remaining, 0);
        assert!(p.mines_remaining > 0);
        assert!(s.all_players_finished());
    }

    #[test]
    fn zero_player_game_is_vacuously_finished() {
        let s = session_with(flat_map(1, tile::COMMON), &[]);
        assert!(s.all_players_finished());
        assert!(s.snapshot().all_finished);
    }
}
