pub mod constants;
pub mod dice;
pub mod map;
pub mod session;
pub mod types;

pub use constants::*;
pub use dice::Dice;
pub use map::{generate_map, player_spawn, random_hash};
pub use session::{MineOutcome, MoveOutcome, Session, ViewCell, ViewWindow};
pub use types::*;
