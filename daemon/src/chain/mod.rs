use std::fmt;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;

pub mod rpc;

#[cfg(test)]
pub mod mock;

// ── Errors ──────────────────────────────────────────────────

/// Chain-side failures, split the way the retry policies need them:
/// `BlockNotReady` is expected early and retried, `BlockHashUnavailable`
/// is fatal for the affected phase, everything else retries with the
/// phase-specific backoff.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainError {
    InsufficientFunds,
    NotAuthorized,
    BlockNotReady,
    BlockHashUnavailable,
    Reverted(String),
    Transport(String),
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientFunds => f.write_str("insufficient funds"),
            Self::NotAuthorized => f.write_str("not authorized"),
            Self::BlockNotReady => f.write_str("commit block not ready"),
            Self::BlockHashUnavailable => f.write_str("commit block hash unavailable"),
            Self::Reverted(detail) => write!(f, "reverted: {detail}"),
            Self::Transport(detail) => write!(f, "transport: {detail}"),
        }
    }
}

impl std::error::Error for ChainError {}

// ── Records ─────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GameInfo {
    pub gamemaster: Address,
    pub creator: Address,
    pub stake_amount: U256,
    pub open: bool,
    pub player_count: u64,
    pub has_opened: bool,
    pub has_closed: bool,
}

/// The 8-field commit-reveal accessor. Older contract revisions had a
/// narrower tuple without `has_stored_block_hash`; only this shape is
/// supported.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitRevealState {
    pub committed_hash: B256,
    pub commit_block_number: u64,
    pub reveal_value: B256,
    pub random_hash: B256,
    pub has_committed: bool,
    pub has_revealed: bool,
    pub has_stored_block_hash: bool,
    pub map_size: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PayoutInfo {
    pub winners: Vec<Address>,
    pub payout_amount: U256,
    pub has_paid_out: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub block_number: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GameEvent {
    Created {
        game_id: u64,
        gamemaster: Address,
        creator: Address,
        stake_amount: U256,
    },
    Opened {
        game_id: u64,
    },
    Closed {
        game_id: u64,
        player_count: u64,
        map_size: u32,
    },
    Committed {
        game_id: u64,
        hash: B256,
    },
}

impl GameEvent {
    pub fn game_id(&self) -> u64 {
        match self {
            Self::Created { game_id, .. }
            | Self::Opened { game_id }
            | Self::Closed { game_id, .. }
            | Self::Committed { game_id, .. } => *game_id,
        }
    }
}

// ── Client interface ────────────────────────────────────────

/// Typed view of the contract operations this daemon needs. Reads are
/// safe to issue concurrently; writes are serialised per game by the
/// state machine.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn get_block_number(&self) -> Result<u64, ChainError>;

    async fn get_game_info(&self, game_id: u64) -> Result<GameInfo, ChainError>;
    async fn get_commit_reveal_state(&self, game_id: u64)
        -> Result<CommitRevealState, ChainError>;
    async fn get_payout_info(&self, game_id: u64) -> Result<PayoutInfo, ChainError>;
    async fn get_players(&self, game_id: u64) -> Result<Vec<Address>, ChainError>;

    /// Fails with `BlockHashUnavailable` once the commit block has
    /// left the chain's retention window.
    async fn get_commit_block_hash(&self, game_id: u64) -> Result<B256, ChainError>;

    async fn commit_hash(&self, game_id: u64, hash: B256) -> Result<TxReceipt, ChainError>;
    async fn store_commit_block_hash(
        &self,
        game_id: u64,
        server_url: &str,
    ) -> Result<TxReceipt, ChainError>;
    async fn reveal_hash(&self, game_id: u64, reveal: B256) -> Result<TxReceipt, ChainError>;
    async fn payout(&self, game_id: u64, winners: &[Address]) -> Result<TxReceipt, ChainError>;

    /// All game events in `[from_block, to_block]`, in chain order.
    async fn get_events(&self, from_block: u64, to_block: u64)
        -> Result<Vec<GameEvent>, ChainError>;

    /// Availability probe instead of probing `get_commit_block_hash`
    /// through its error path.
    async fn is_block_hash_available(&self, game_id: u64) -> Result<bool, ChainError> {
        match self.get_commit_block_hash(game_id).await {
            Ok(_) => Ok(true),
            Err(ChainError::BlockHashUnavailable) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
