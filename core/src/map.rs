use alloy_primitives::{keccak256, Address, B256};

use crate::dice::Dice;
use crate::types::{tile, GameMap, Position, StartingPosition};

/// Shared randomness for one game: `keccak256(commit_block_hash ∥ reveal)`.
///
/// This is the same value the contract computes after the reveal lands,
/// so anyone holding the commit block hash and the revealed secret can
/// reproduce the map byte for byte.
pub fn random_hash(commit_block_hash: B256, reveal: B256) -> B256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(commit_block_hash.as_slice());
    buf[32..].copy_from_slice(reveal.as_slice());
    keccak256(buf)
}

/// Generate the `size × size` land grid from the game's random hash.
///
/// Row-major, one nibble per cell: 0–10 common, 11–14 uncommon, 15 rare.
/// Two more nibbles each for the starting cell's x and y (mod size); the
/// tile there is remembered and overwritten with the start marker.
pub fn generate_map(seed: B256, size: u32) -> GameMap {
    let mut dice = Dice::new(seed.0);
    let mut land = Vec::with_capacity(size as usize);
    for _ in 0..size {
        let mut row = Vec::with_capacity(size as usize);
        for _ in 0..size {
            row.push(tile_for_roll(dice.roll(1)));
        }
        land.push(row);
    }

    let x = (dice.roll(2) % size as u64) as u32;
    let y = (dice.roll(2) % size as u64) as u32;
    let original = land[y as usize][x as usize];
    land[y as usize][x as usize] = tile::START;

    GameMap {
        size,
        land,
        starting_position: StartingPosition {
            x,
            y,
            original_land_type: original,
        },
    }
}

fn tile_for_roll(n: u64) -> u8 {
    match n {
        0..=10 => tile::COMMON,
        11..=14 => tile::UNCOMMON,
        _ => tile::RARE,
    }
}

/// Deterministic starting cell for one player.
///
/// Total over all inputs: the per-player seed is
/// `keccak256(random_hash ∥ address ∥ game_id_be ∥ map_size_be)` fed
/// through the same dice generator used for the map.
pub fn player_spawn(seed: B256, player: Address, game_id: u64, size: u32) -> Position {
    let mut buf = Vec::with_capacity(32 + 20 + 8 + 8);
    buf.extend_from_slice(seed.as_slice());
    buf.extend_from_slice(player.as_slice());
    buf.extend_from_slice(&game_id.to_be_bytes());
    buf.extend_from_slice(&(size as u64).to_be_bytes());
    let mut dice = Dice::new(keccak256(buf).0);
    let x = (dice.roll(2) % size as u64) as u32;
    let y = (dice.roll(2) % size as u64) as u32;
    Position { x, y }
}
