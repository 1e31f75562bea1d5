use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use scriptgame_core::{generate_map, map_size_for_players, random_hash, GameMap, SessionSnapshot};

use crate::chain::{ChainClient, ChainError, CommitRevealState, GameInfo, PayoutInfo};
use crate::commit_reveal::{self, REVEAL_RETRY_DELAY, STORE_DELAY};
use crate::config::{port_for_game, Config};
use crate::store::{ArtifactStore, ScoresArtifact, StoreError};

// ── Freshness policy ────────────────────────────────────────

/// The execution layer retains the last 256 block hashes.
pub const BLOCK_RETENTION_WINDOW: u64 = 256;

/// Anything older than this is treated as irrecoverable: at age 239 a
/// game still starts, at 240 it is expired. The margin below the
/// retention window leaves room for the startup work itself.
pub const MAX_COMMIT_AGE_BLOCKS: u64 = BLOCK_RETENTION_WINDOW - 16;

pub const PAYOUT_MAX_ATTEMPTS: u32 = 10;
pub const REVEAL_MAX_ATTEMPTS: u32 = 2;

/// Grace period before a completed game's listener is torn down.
pub const SHUTDOWN_DELAY: Duration = Duration::from_secs(15);

const GENERIC_RETRY_DELAY: Duration = Duration::from_secs(5);

// ── Phases ──────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Created,
    Committed,
    Closed,
    GameRunning,
    GameFinished,
    PayoutComplete,
    Complete,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Committed => "COMMITTED",
            Self::Closed => "CLOSED",
            Self::GameRunning => "GAME_RUNNING",
            Self::GameFinished => "GAME_FINISHED",
            Self::PayoutComplete => "PAYOUT_COMPLETE",
            Self::Complete => "COMPLETE",
        }
    }
}

/// Phase derivable from chain truth plus two local observations (the
/// active-server registry and the scores artifact). Re-evaluated from
/// scratch on every tick; nothing here trusts prior local state.
pub fn derive_phase(
    info: &GameInfo,
    crs: &CommitRevealState,
    payout: &PayoutInfo,
    scores_exist: bool,
    server_active: bool,
    all_players_finished: bool,
) -> Phase {
    if crs.has_revealed {
        return Phase::Complete;
    }
    if payout.has_paid_out {
        return Phase::PayoutComplete;
    }
    let staged = info.has_closed && crs.has_committed && crs.has_stored_block_hash;
    if staged && scores_exist && all_players_finished {
        return Phase::GameFinished;
    }
    if staged && server_active {
        return Phase::GameRunning;
    }
    if staged {
        return Phase::Closed;
    }
    if crs.has_committed {
        return Phase::Committed;
    }
    Phase::Created
}

/// Locally-recorded skip flags pin a game past a phase whose chain-side
/// transaction was abandoned.
pub fn apply_pins(phase: Phase, payout_skipped: bool, reveal_skipped: bool) -> Phase {
    let mut phase = phase;
    if phase == Phase::GameFinished && payout_skipped {
        phase = Phase::PayoutComplete;
    }
    if phase == Phase::PayoutComplete && reveal_skipped {
        phase = Phase::Complete;
    }
    phase
}

// ── Backoff ─────────────────────────────────────────────────

/// Payout retry backoff for attempt `n` (1-based): `min(5s × 2^(n−1), 5min)`.
pub fn payout_backoff(attempt: u32) -> Duration {
    let secs = 5u64.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16));
    Duration::from_secs(secs.min(300))
}

/// Longer backoff while the gamemaster wallet is short on gas:
/// `min(10s × 2^n, 10min)`.
pub fn funds_backoff(attempt: u32) -> Duration {
    let secs = 10u64.saturating_mul(1u64 << attempt.min(16));
    Duration::from_secs(secs.min(600))
}

// ── Game record ─────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct GameRecord {
    pub id: u64,
    pub gamemaster: Address,
    pub creator: Address,
    pub stake_amount: U256,
    pub phase: Phase,
    pub player_count: u64,
    pub map_size: u32,
    pub last_updated: DateTime<Utc>,
    pub payout_skipped: bool,
    pub reveal_skipped: bool,
    pub expired: Option<String>,

    payout_attempts: u32,
    reveal_attempts: u32,
    retry_after: Option<Instant>,
    store_after: Option<Instant>,
}

impl GameRecord {
    pub fn new(id: u64, gamemaster: Address, creator: Address, stake_amount: U256) -> Self {
        Self {
            id,
            gamemaster,
            creator,
            stake_amount,
            phase: Phase::Created,
            player_count: 0,
            map_size: 0,
            last_updated: Utc::now(),
            payout_skipped: false,
            reveal_skipped: false,
            expired: None,
            payout_attempts: 0,
            reveal_attempts: 0,
            retry_after: None,
            store_after: None,
        }
    }

    fn gated(&self) -> bool {
        self.retry_after.is_some_and(|t| Instant::now() < t)
    }

    fn expire(&mut self, reason: &str) {
        warn!(game = self.id, reason, "game expired");
        self.expired = Some(reason.to_string());
        self.phase = Phase::Complete;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    /// Terminal: the orchestrator drops the record and counts the game.
    Completed,
}

// ── Server lifecycle handles ────────────────────────────────

/// Narrow handles into the per-game server machinery, supplied by the
/// orchestrator at construction so the machine never owns a listener.
#[async_trait]
pub trait ServerLifecycle: Send + Sync {
    async fn start_server(
        &self,
        record: &GameRecord,
        map: GameMap,
        seed: B256,
        players: Vec<Address>,
    ) -> anyhow::Result<()>;
    async fn stop_server(&self, game_id: u64);
    fn is_active(&self, game_id: u64) -> bool;
    fn snapshot_players(&self, game_id: u64) -> Option<SessionSnapshot>;
    async fn persist_scores(&self, game_id: u64) -> anyhow::Result<()>;
    /// Delayed teardown; the implementation re-checks at fire time that
    /// the registered server is still the same one.
    fn schedule_shutdown(&self, game_id: u64, delay: Duration);
}

// ── Winners ─────────────────────────────────────────────────

/// Exactly the players sharing the maximum final score.
pub fn winners_from_scores(scores: &ScoresArtifact) -> Vec<Address> {
    let Some(max) = scores.players.iter().map(|p| p.score).max() else {
        return Vec::new();
    };
    scores
        .players
        .iter()
        .filter(|p| p.score == max)
        .map(|p| p.address)
        .collect()
}

// ── Worker ──────────────────────────────────────────────────

/// Drives one game through its phases. One tick reads chain truth,
/// derives the phase, and runs at most one action; failures are
/// recorded on the game and retried, never propagated to the
/// orchestrator.
pub struct GameWorker {
    chain: Arc<dyn ChainClient>,
    store: Arc<ArtifactStore>,
    servers: Arc<dyn ServerLifecycle>,
    cfg: Arc<Config>,
}

impl GameWorker {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        store: Arc<ArtifactStore>,
        servers: Arc<dyn ServerLifecycle>,
        cfg: Arc<Config>,
    ) -> Self {
        Self { chain, store, servers, cfg }
    }

    pub async fn tick(&self, rec: &mut GameRecord) -> TickOutcome {
        if rec.expired.is_some() {
            return self.complete(rec).await;
        }

        let info = match self.chain.get_game_info(rec.id).await {
            Ok(i) => i,
            Err(e) => {
                warn!(game = rec.id, error = %e, "game info read failed");
                return TickOutcome::Continue;
            }
        };
        let crs = match self.chain.get_commit_reveal_state(rec.id).await {
            Ok(s) => s,
            Err(e) => {
                warn!(game = rec.id, error = %e, "commit-reveal state read failed");
                return TickOutcome::Continue;
            }
        };
        let payout = match self.chain.get_payout_info(rec.id).await {
            Ok(p) => p,
            Err(e) => {
                warn!(game = rec.id, error = %e, "payout info read failed");
                return TickOutcome::Continue;
            }
        };

        rec.player_count = info.player_count;
        if crs.map_size > 0 {
            rec.map_size = crs.map_size;
        }

        let scores_exist = self.store.scores_exist(rec.id);
        let server_active = self.servers.is_active(rec.id);
        let all_finished = self
            .servers
            .snapshot_players(rec.id)
            .map(|s| s.all_finished)
            .unwrap_or(false);

        let derived = apply_pins(
            derive_phase(&info, &crs, &payout, scores_exist, server_active, all_finished),
            rec.payout_skipped,
            rec.reveal_skipped,
        );
        if derived != rec.phase {
            info!(
                game = rec.id,
                from = rec.phase.label(),
                to = derived.label(),
                players = rec.player_count,
                "phase transition"
            );
            rec.phase = derived;
            rec.retry_after = None;
        }
        rec.last_updated = Utc::now();

        match rec.phase {
            Phase::Created => self.act_created(rec, &crs).await,
            Phase::Committed => self.act_committed(rec, &crs).await,
            Phase::Closed => self.act_closed(rec, &info, &crs).await,
            Phase::GameRunning => self.act_running(rec, all_finished, scores_exist).await,
            Phase::GameFinished => self.act_finished(rec, &payout).await,
            Phase::PayoutComplete => self.act_payout_complete(rec, &crs).await,
            Phase::Complete => return self.complete(rec).await,
        }
        if rec.expired.is_some() {
            return self.complete(rec).await;
        }
        TickOutcome::Continue
    }

    /// CREATED: generate (or reload) the secret and commit its hash.
    async fn act_created(&self, rec: &mut GameRecord, crs: &CommitRevealState) {
        if crs.has_committed || rec.gated() {
            return;
        }
        let secret = match commit_reveal::ensure_secret(&self.store, rec.id).await {
            Ok(s) => s,
            Err(e) => {
                warn!(game = rec.id, error = %e, "reveal secret unavailable");
                rec.retry_after = Some(Instant::now() + GENERIC_RETRY_DELAY);
                return;
            }
        };
        match self
            .chain
            .commit_hash(rec.id, commit_reveal::commitment(secret))
            .await
        {
            Ok(receipt) => {
                info!(
                    game = rec.id,
                    tx = %receipt.tx_hash,
                    block = receipt.block_number,
                    "hash committed"
                );
                rec.store_after = Some(Instant::now() + STORE_DELAY);
                rec.retry_after = None;
            }
            Err(e) => {
                warn!(game = rec.id, error = %e, "commit failed");
                rec.retry_after = Some(Instant::now() + GENERIC_RETRY_DELAY);
            }
        }
    }

    /// COMMITTED: once the commit block has landed, publish the server
    /// URL and the block-hash reference; then wait for closure.
    async fn act_committed(&self, rec: &mut GameRecord, crs: &CommitRevealState) {
        if crs.has_stored_block_hash || rec.gated() {
            return;
        }
        if rec.store_after.is_some_and(|t| Instant::now() < t) {
            return;
        }
        if crs.commit_block_number == 0 {
            return;
        }
        let current = match self.chain.get_block_number().await {
            Ok(b) => b,
            Err(e) => {
                warn!(game = rec.id, error = %e, "block number read failed");
                return;
            }
        };
        if current < crs.commit_block_number {
            return;
        }

        let port = match port_for_game(rec.id) {
            Ok(p) => p,
            Err(e) => {
                rec.expire(&format!("no listen port: {e}"));
                return;
            }
        };
        let url = self.cfg.server_url(port);
        match self.chain.store_commit_block_hash(rec.id, &url).await {
            Ok(receipt) => {
                info!(game = rec.id, tx = %receipt.tx_hash, url, "block hash reference stored");
                rec.store_after = None;
                rec.retry_after = None;
            }
            Err(ChainError::BlockNotReady) => {
                debug!(game = rec.id, "commit block not ready yet");
                rec.retry_after = Some(Instant::now() + GENERIC_RETRY_DELAY);
            }
            Err(ChainError::BlockHashUnavailable) => {
                rec.expire("commit block hash left the retention window before it was stored");
            }
            Err(e) => {
                warn!(game = rec.id, error = %e, "store block hash failed");
                rec.retry_after = Some(Instant::now() + GENERIC_RETRY_DELAY);
            }
        }
    }

    /// CLOSED: freshness checks, then regenerate the map from the
    /// shared randomness and bring up the game server.
    async fn act_closed(&self, rec: &mut GameRecord, info: &GameInfo, crs: &CommitRevealState) {
        if rec.gated() {
            return;
        }
        let current = match self.chain.get_block_number().await {
            Ok(b) => b,
            Err(e) => {
                warn!(game = rec.id, error = %e, "block number read failed");
                return;
            }
        };
        if current.saturating_sub(crs.commit_block_number) >= MAX_COMMIT_AGE_BLOCKS {
            rec.expire("too old to start: commit block past the freshness horizon");
            return;
        }
        match self.chain.is_block_hash_available(rec.id).await {
            Ok(true) => {}
            Ok(false) => {
                rec.expire("commit block hash no longer available");
                return;
            }
            Err(e) => {
                warn!(game = rec.id, error = %e, "block hash availability check failed");
                rec.retry_after = Some(Instant::now() + GENERIC_RETRY_DELAY);
                return;
            }
        }
        let block_hash = match self.chain.get_commit_block_hash(rec.id).await {
            Ok(h) => h,
            Err(ChainError::BlockHashUnavailable) => {
                rec.expire("commit block hash no longer available");
                return;
            }
            Err(e) => {
                warn!(game = rec.id, error = %e, "commit block hash read failed");
                rec.retry_after = Some(Instant::now() + GENERIC_RETRY_DELAY);
                return;
            }
        };
        let reveal = match self.store.load_reveal(rec.id).await {
            Ok(r) => r,
            Err(StoreError::Missing { .. }) => {
                // Without the secret the map cannot be rebuilt; terminal.
                rec.expire("reveal artifact missing");
                return;
            }
            Err(e) => {
                warn!(game = rec.id, error = %e, "reveal artifact read failed");
                rec.retry_after = Some(Instant::now() + GENERIC_RETRY_DELAY);
                return;
            }
        };

        let seed = random_hash(block_hash, reveal);
        let expected = map_size_for_players(info.player_count);
        let map_size = if crs.map_size > 0 {
            if crs.map_size != expected {
                warn!(
                    game = rec.id,
                    chain = crs.map_size,
                    expected,
                    "map size diverges from 1 + 4 × playerCount; trusting the chain"
                );
            }
            crs.map_size
        } else {
            expected
        };
        // after a restart the persisted map is reused; regeneration from
        // the same seed would produce the identical grid anyway
        let map = match self.store.load_map(rec.id).await {
            Ok(existing) if existing.size == map_size => existing,
            Ok(_) | Err(StoreError::Missing { .. }) => {
                let map = generate_map(seed, map_size);
                if let Err(e) = self.store.save_map(rec.id, &map, reveal, seed).await {
                    warn!(game = rec.id, error = %e, "map artifact write failed");
                    rec.retry_after = Some(Instant::now() + GENERIC_RETRY_DELAY);
                    return;
                }
                map
            }
            Err(e) => {
                warn!(game = rec.id, error = %e, "map artifact read failed");
                rec.retry_after = Some(Instant::now() + GENERIC_RETRY_DELAY);
                return;
            }
        };
        let players = match self.chain.get_players(rec.id).await {
            Ok(p) => p,
            Err(e) => {
                warn!(game = rec.id, error = %e, "player list read failed");
                rec.retry_after = Some(Instant::now() + GENERIC_RETRY_DELAY);
                return;
            }
        };
        match self.servers.start_server(rec, map, seed, players).await {
            Ok(()) => {
                info!(game = rec.id, size = map_size, "game server started");
            }
            Err(e) => {
                warn!(game = rec.id, error = %e, "game server start failed");
                rec.retry_after = Some(Instant::now() + GENERIC_RETRY_DELAY);
            }
        }
    }

    /// GAME_RUNNING: watch the live session; once every player is
    /// finished, persist the final scores.
    async fn act_running(&self, rec: &mut GameRecord, all_finished: bool, scores_exist: bool) {
        if all_finished && !scores_exist {
            match self.servers.persist_scores(rec.id).await {
                Ok(()) => info!(game = rec.id, "final scores persisted"),
                Err(e) => warn!(game = rec.id, error = %e, "score persistence failed"),
            }
        }
    }

    /// GAME_FINISHED: pay the winners, with capped exponential backoff.
    async fn act_finished(&self, rec: &mut GameRecord, payout: &PayoutInfo) {
        if payout.has_paid_out || rec.payout_skipped || rec.gated() {
            return;
        }
        let scores = match self.store.load_scores(rec.id).await {
            Ok(s) => s,
            Err(e) => {
                warn!(game = rec.id, error = %e, "scores artifact unavailable for payout");
                rec.retry_after = Some(Instant::now() + GENERIC_RETRY_DELAY);
                return;
            }
        };
        let winners = winners_from_scores(&scores);
        rec.payout_attempts += 1;
        match self.chain.payout(rec.id, &winners).await {
            Ok(receipt) => {
                info!(
                    game = rec.id,
                    tx = %receipt.tx_hash,
                    winners = winners.len(),
                    "payout submitted"
                );
                rec.retry_after = None;
            }
            Err(ChainError::InsufficientFunds) => {
                let backoff = funds_backoff(rec.payout_attempts);
                warn!(
                    game = rec.id,
                    attempt = rec.payout_attempts,
                    backoff_secs = backoff.as_secs(),
                    "payout blocked on gamemaster balance; wallet needs topping up"
                );
                rec.retry_after = Some(Instant::now() + backoff);
                self.maybe_skip_payout(rec);
            }
            Err(e) => {
                let backoff = payout_backoff(rec.payout_attempts);
                warn!(
                    game = rec.id,
                    attempt = rec.payout_attempts,
                    backoff_secs = backoff.as_secs(),
                    error = %e,
                    "payout failed"
                );
                rec.retry_after = Some(Instant::now() + backoff);
                self.maybe_skip_payout(rec);
            }
        }
    }

    fn maybe_skip_payout(&self, rec: &mut GameRecord) {
        if rec.payout_attempts >= PAYOUT_MAX_ATTEMPTS {
            warn!(game = rec.id, "payout retries exhausted; skipping payout");
            rec.payout_skipped = true;
            rec.retry_after = None;
        }
    }

    /// PAYOUT_COMPLETE: reveal the secret; a single retry, then skip.
    async fn act_payout_complete(&self, rec: &mut GameRecord, crs: &CommitRevealState) {
        if rec.reveal_skipped || rec.gated() {
            return;
        }
        let reveal = match self.store.load_reveal(rec.id).await {
            Ok(r) => r,
            Err(e) => {
                warn!(game = rec.id, error = %e, "reveal artifact unavailable; skipping reveal");
                rec.reveal_skipped = true;
                return;
            }
        };
        // a mismatched artifact would only burn retries on a guaranteed
        // revert
        if commit_reveal::commitment(reveal) != crs.committed_hash {
            warn!(
                game = rec.id,
                "persisted reveal does not match the on-chain commitment; skipping reveal"
            );
            rec.reveal_skipped = true;
            return;
        }
        rec.reveal_attempts += 1;
        match self.chain.reveal_hash(rec.id, reveal).await {
            Ok(receipt) => {
                info!(game = rec.id, tx = %receipt.tx_hash, "secret revealed");
                rec.retry_after = None;
            }
            Err(e) => {
                if rec.reveal_attempts >= REVEAL_MAX_ATTEMPTS {
                    warn!(game = rec.id, error = %e, "reveal retries exhausted; skipping reveal");
                    rec.reveal_skipped = true;
                } else {
                    warn!(game = rec.id, error = %e, "reveal failed; retrying once");
                    rec.retry_after = Some(Instant::now() + REVEAL_RETRY_DELAY);
                }
            }
        }
    }

    /// COMPLETE: tear down with a grace period and hand the record
    /// back to the orchestrator for removal.
    async fn complete(&self, rec: &mut GameRecord) -> TickOutcome {
        if self.servers.is_active(rec.id) {
            self.servers.schedule_shutdown(rec.id, SHUTDOWN_DELAY);
        }
        info!(
            game = rec.id,
            expired = rec.expired.as_deref().unwrap_or(""),
            payout_skipped = rec.payout_skipped,
            reveal_skipped = rec.reveal_skipped,
            map_size = rec.map_size,
            last_updated = %rec.last_updated,
            "game complete"
        );
        TickOutcome::Completed
    }
}
