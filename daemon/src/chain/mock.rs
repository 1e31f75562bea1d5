//! Scripted in-memory chain for state-machine and pipeline tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use alloy_primitives::{keccak256, Address, B256, U256};
use async_trait::async_trait;

use crate::chain::{
    ChainClient, ChainError, CommitRevealState, GameEvent, GameInfo, PayoutInfo, TxReceipt,
};

#[derive(Clone, Debug)]
pub struct MockGame {
    pub info: GameInfo,
    pub crs: CommitRevealState,
    pub payout: PayoutInfo,
    pub players: Vec<Address>,
    pub commit_block_hash: Option<B256>,
    pub server_url: Option<String>,
}

#[derive(Default)]
struct MockState {
    block_number: u64,
    games: HashMap<u64, MockGame>,
    events: Vec<(u64, GameEvent)>,
    calls: Vec<String>,
    failures: VecDeque<(String, ChainError)>,
}

/// Every write mutates the scripted state the way the contract would,
/// so repeated ticks observe chain truth evolving. Failures queued with
/// `fail_next` are consumed by the next matching operation.
pub struct MockChain {
    state: Mutex<MockState>,
}

impl MockChain {
    pub fn new(block_number: u64) -> Self {
        Self {
            state: Mutex::new(MockState { block_number, ..Default::default() }),
        }
    }

    pub fn add_game(
        &self,
        game_id: u64,
        gamemaster: Address,
        creator: Address,
        stake_amount: U256,
        players: Vec<Address>,
    ) {
        let game = MockGame {
            info: GameInfo {
                gamemaster,
                creator,
                stake_amount,
                open: false,
                player_count: players.len() as u64,
                has_opened: false,
                has_closed: false,
            },
            crs: CommitRevealState::default(),
            payout: PayoutInfo::default(),
            players,
            commit_block_hash: None,
            server_url: None,
        };
        self.state.lock().unwrap().games.insert(game_id, game);
    }

    pub fn set_block(&self, n: u64) {
        self.state.lock().unwrap().block_number = n;
    }

    pub fn close_game(&self, game_id: u64) {
        let mut state = self.state.lock().unwrap();
        let game = state.games.get_mut(&game_id).expect("unknown game");
        game.info.has_closed = true;
        game.crs.map_size = 1 + 4 * game.info.player_count as u32;
    }

    pub fn drop_commit_block_hash(&self, game_id: u64) {
        let mut state = self.state.lock().unwrap();
        state.games.get_mut(&game_id).expect("unknown game").commit_block_hash = None;
    }

    pub fn push_event(&self, block: u64, event: GameEvent) {
        self.state.lock().unwrap().events.push((block, event));
    }

    pub fn fail_next(&self, op: &str, err: ChainError) {
        self.state
            .lock()
            .unwrap()
            .failures
            .push_back((op.to_string(), err));
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_of(&self, op: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.starts_with(op))
            .count()
    }

    pub fn game(&self, game_id: u64) -> MockGame {
        self.state.lock().unwrap().games.get(&game_id).expect("unknown game").clone()
    }

    fn take_failure(state: &mut MockState, op: &str) -> Option<ChainError> {
        let idx = state.failures.iter().position(|(name, _)| name == op)?;
        state.failures.remove(idx).map(|(_, e)| e)
    }

    fn receipt(state: &MockState) -> TxReceipt {
        TxReceipt {
            tx_hash: B256::repeat_byte(0x77),
            block_number: state.block_number,
        }
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn get_block_number(&self) -> Result<u64, ChainError> {
        Ok(self.state.lock().unwrap().block_number)
    }

    async fn get_game_info(&self, game_id: u64) -> Result<GameInfo, ChainError> {
        let state = self.state.lock().unwrap();
        state
            .games
            .get(&game_id)
            .map(|g| g.info.clone())
            .ok_or_else(|| ChainError::Reverted("GameNotFound".to_string()))
    }

    async fn get_commit_reveal_state(
        &self,
        game_id: u64,
    ) -> Result<CommitRevealState, ChainError> {
        let state = self.state.lock().unwrap();
        state
            .games
            .get(&game_id)
            .map(|g| g.crs.clone())
            .ok_or_else(|| ChainError::Reverted("GameNotFound".to_string()))
    }

    async fn get_payout_info(&self, game_id: u64) -> Result<PayoutInfo, ChainError> {
        let state = self.state.lock().unwrap();
        state
            .games
            .get(&game_id)
            .map(|g| g.payout.clone())
            .ok_or_else(|| ChainError::Reverted("GameNotFound".to_string()))
    }

    async fn get_players(&self, game_id: u64) -> Result<Vec<Address>, ChainError> {
        let state = self.state.lock().unwrap();
        state
            .games
            .get(&game_id)
            .map(|g| g.players.clone())
            .ok_or_else(|| ChainError::Reverted("GameNotFound".to_string()))
    }

    async fn get_commit_block_hash(&self, game_id: u64) -> Result<B256, ChainError> {
        let state = self.state.lock().unwrap();
        state
            .games
            .get(&game_id)
            .ok_or_else(|| ChainError::Reverted("GameNotFound".to_string()))?
            .commit_block_hash
            .ok_or(ChainError::BlockHashUnavailable)
    }

    async fn commit_hash(&self, game_id: u64, hash: B256) -> Result<TxReceipt, ChainError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("commitHash({game_id})"));
        if let Some(err) = Self::take_failure(&mut state, "commitHash") {
            return Err(err);
        }
        let block = state.block_number;
        let game = state
            .games
            .get_mut(&game_id)
            .ok_or_else(|| ChainError::Reverted("GameNotFound".to_string()))?;
        game.crs.has_committed = true;
        game.crs.committed_hash = hash;
        game.crs.commit_block_number = block;
        game.commit_block_hash = Some(B256::repeat_byte(0xbb));
        Ok(Self::receipt(&state))
    }

    async fn store_commit_block_hash(
        &self,
        game_id: u64,
        server_url: &str,
    ) -> Result<TxReceipt, ChainError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("storeCommitBlockHash({game_id})"));
        if let Some(err) = Self::take_failure(&mut state, "storeCommitBlockHash") {
            return Err(err);
        }
        let current = state.block_number;
        let game = state
            .games
            .get_mut(&game_id)
            .ok_or_else(|| ChainError::Reverted("GameNotFound".to_string()))?;
        if current < game.crs.commit_block_number {
            return Err(ChainError::BlockNotReady);
        }
        if game.commit_block_hash.is_none() {
            return Err(ChainError::BlockHashUnavailable);
        }
        game.crs.has_stored_block_hash = true;
        game.server_url = Some(server_url.to_string());
        Ok(Self::receipt(&state))
    }

    async fn reveal_hash(&self, game_id: u64, reveal: B256) -> Result<TxReceipt, ChainError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("revealHash({game_id})"));
        if let Some(err) = Self::take_failure(&mut state, "revealHash") {
            return Err(err);
        }
        let game = state
            .games
            .get_mut(&game_id)
            .ok_or_else(|| ChainError::Reverted("GameNotFound".to_string()))?;
        if keccak256(reveal.as_slice()) != game.crs.committed_hash {
            return Err(ChainError::Reverted("RevealMismatch".to_string()));
        }
        let Some(block_hash) = game.commit_block_hash else {
            return Err(ChainError::BlockHashUnavailable);
        };
        game.crs.has_revealed = true;
        game.crs.reveal_value = reveal;
        game.crs.random_hash = scriptgame_core::random_hash(block_hash, reveal);
        Ok(Self::receipt(&state))
    }

    async fn payout(&self, game_id: u64, winners: &[Address]) -> Result<TxReceipt, ChainError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("payout({game_id})"));
        if let Some(err) = Self::take_failure(&mut state, "payout") {
            return Err(err);
        }
        let game = state
            .games
            .get_mut(&game_id)
            .ok_or_else(|| ChainError::Reverted("GameNotFound".to_string()))?;
        game.payout.has_paid_out = true;
        game.payout.winners = winners.to_vec();
        Ok(Self::receipt(&state))
    }

    async fn get_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<GameEvent>, ChainError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .events
            .iter()
            .filter(|(block, _)| *block >= from_block && *block <= to_block)
            .map(|(_, ev)| ev.clone())
            .collect())
    }
}
