use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use alloy_primitives::{Address, B256};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tracing::{debug, info, warn};

use scriptgame_core::{GameMap, SessionSnapshot};

use crate::chain::{ChainClient, GameEvent};
use crate::config::{port_for_game, Config};
use crate::machine::{GameRecord, GameWorker, Phase, ServerLifecycle, TickOutcome};
use crate::server::{start_game_server, GameServer};
use crate::store::ArtifactStore;

/// Main-loop cadence; every registered game is visited once per pass.
const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Live event intake polls at this cadence.
const EVENT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Pause after an unexpected error before the next attempt.
const ERROR_PAUSE: Duration = Duration::from_secs(1);

// ── Active-server registry ──────────────────────────────────

/// Orchestrator-owned map of live listeners, one per game. Also the
/// implementation of the narrow lifecycle handles the state machine
/// gets.
pub struct ServerRegistry {
    cfg: Arc<Config>,
    store: Arc<ArtifactStore>,
    active: Arc<StdMutex<HashMap<u64, Arc<GameServer>>>>,
}

impl ServerRegistry {
    pub fn new(cfg: Arc<Config>, store: Arc<ArtifactStore>) -> Self {
        Self {
            cfg,
            store,
            active: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    fn get(&self, game_id: u64) -> Option<Arc<GameServer>> {
        self.active.lock().unwrap().get(&game_id).cloned()
    }

    /// Snapshot and persist scores for every live game, then close all
    /// listeners. Used on SIGINT.
    pub async fn shutdown_all(&self) {
        let servers: Vec<(u64, Arc<GameServer>)> =
            self.active.lock().unwrap().drain().collect();
        for (game_id, server) in servers {
            let snapshot = server.session.lock().unwrap().snapshot();
            if let Err(e) = self.store.save_scores(game_id, &snapshot).await {
                warn!(game = game_id, error = %e, "score snapshot failed during shutdown");
            }
            server.stop();
            info!(game = game_id, "listener closed");
        }
    }
}

#[async_trait]
impl ServerLifecycle for ServerRegistry {
    async fn start_server(
        &self,
        record: &GameRecord,
        map: GameMap,
        seed: B256,
        players: Vec<Address>,
    ) -> Result<()> {
        if self.is_active(record.id) {
            return Ok(());
        }
        let port = port_for_game(record.id)?;
        let server = start_game_server(
            &self.cfg,
            record.id,
            port,
            record.stake_amount,
            map,
            players,
            seed,
        )
        .await?;
        self.active
            .lock()
            .unwrap()
            .insert(record.id, Arc::new(server));
        Ok(())
    }

    async fn stop_server(&self, game_id: u64) {
        if let Some(server) = self.active.lock().unwrap().remove(&game_id) {
            server.stop();
        }
    }

    fn is_active(&self, game_id: u64) -> bool {
        self.active.lock().unwrap().contains_key(&game_id)
    }

    fn snapshot_players(&self, game_id: u64) -> Option<SessionSnapshot> {
        self.get(game_id)
            .map(|s| s.session.lock().unwrap().snapshot())
    }

    async fn persist_scores(&self, game_id: u64) -> Result<()> {
        let snapshot = self
            .snapshot_players(game_id)
            .ok_or_else(|| anyhow::anyhow!("game {game_id}: no active server"))?;
        self.store.save_scores(game_id, &snapshot).await?;
        Ok(())
    }

    fn schedule_shutdown(&self, game_id: u64, delay: Duration) {
        let Some(scheduled) = self.get(game_id) else {
            return;
        };
        let active = self.active.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // only tear down the server this was scheduled for; a
            // replacement registered in the meantime stays up
            let still_same = {
                let map = active.lock().unwrap();
                map.get(&game_id).is_some_and(|s| Arc::ptr_eq(s, &scheduled))
            };
            if still_same {
                if let Some(server) = active.lock().unwrap().remove(&game_id) {
                    server.stop();
                    info!(game = game_id, "listener closed after grace period");
                }
            } else {
                debug!(game = game_id, "delayed shutdown skipped; server replaced");
            }
        });
    }
}

// ── Orchestrator ────────────────────────────────────────────

struct GameEntry {
    record: Arc<TokioMutex<GameRecord>>,
    busy: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl GameEntry {
    fn new(record: GameRecord) -> Self {
        Self {
            record: Arc::new(TokioMutex::new(record)),
            busy: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// GAME_RUNNING games are visited first, then ascending game id.
fn sweep_order(entries: &BTreeMap<u64, GameEntry>) -> Vec<u64> {
    let mut ids: Vec<(bool, u64)> = entries
        .iter()
        .map(|(&id, e)| (!e.running.load(Ordering::SeqCst), id))
        .collect();
    ids.sort();
    ids.into_iter().map(|(_, id)| id).collect()
}

pub struct Orchestrator {
    cfg: Arc<Config>,
    chain: Arc<dyn ChainClient>,
    servers: Arc<ServerRegistry>,
    worker: Arc<GameWorker>,
    gamemaster: Address,
    games: BTreeMap<u64, GameEntry>,
    completed_games: u64,
}

impl Orchestrator {
    pub fn new(
        cfg: Arc<Config>,
        chain: Arc<dyn ChainClient>,
        store: Arc<ArtifactStore>,
        gamemaster: Address,
    ) -> Self {
        let servers = Arc::new(ServerRegistry::new(cfg.clone(), store.clone()));
        let worker = Arc::new(GameWorker::new(
            chain.clone(),
            store,
            servers.clone(),
            cfg.clone(),
        ));
        Self {
            cfg,
            chain,
            servers,
            worker,
            gamemaster,
            games: BTreeMap::new(),
            completed_games: 0,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let scanned_to = self.scan_history().await?;
        info!(
            contract = %self.cfg.contract_address,
            gamemaster = %self.gamemaster,
            games = self.games.len(),
            "orchestrator started"
        );

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        tokio::spawn(event_pump(self.chain.clone(), scanned_to + 1, event_tx));

        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<u64>();
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("interrupt received; shutting down");
                    self.servers.shutdown_all().await;
                    return Ok(());
                }
                Some(event) = event_rx.recv() => self.handle_event(event),
                Some(game_id) = done_rx.recv() => {
                    self.games.remove(&game_id);
                    self.completed_games += 1;
                    info!(
                        game = game_id,
                        completed_games = self.completed_games,
                        tracked = self.games.len(),
                        "game retired"
                    );
                }
                _ = ticker.tick() => self.sweep(&done_tx),
            }
        }
    }

    /// Bounded historical discovery: every `GameCreated` with this
    /// daemon's gamemaster, from genesis to the current head.
    async fn scan_history(&mut self) -> Result<u64> {
        let latest = self.chain.get_block_number().await?;
        let events = self.chain.get_events(0, latest).await?;
        for event in events {
            self.handle_event(event);
        }
        Ok(latest)
    }

    fn handle_event(&mut self, event: GameEvent) {
        match event {
            GameEvent::Created {
                game_id,
                gamemaster,
                creator,
                stake_amount,
            } => {
                if gamemaster != self.gamemaster {
                    return;
                }
                if self.games.contains_key(&game_id) {
                    return;
                }
                info!(game = game_id, %creator, "game discovered");
                self.games.insert(
                    game_id,
                    GameEntry::new(GameRecord::new(game_id, gamemaster, creator, stake_amount)),
                );
            }
            // state is re-read from the chain on the next tick; the
            // event is only a nudge worth logging
            other => debug!(game = other.game_id(), event = ?other, "chain event"),
        }
    }

    /// One pass over the registry. Per game, at most one state-machine
    /// action is in flight at a time; a busy game is skipped, not
    /// queued.
    fn sweep(&self, done_tx: &mpsc::UnboundedSender<u64>) {
        for game_id in sweep_order(&self.games) {
            let entry = &self.games[&game_id];
            if entry.busy.swap(true, Ordering::SeqCst) {
                continue;
            }
            let worker = self.worker.clone();
            let record = entry.record.clone();
            let busy = entry.busy.clone();
            let running = entry.running.clone();
            let done_tx = done_tx.clone();
            tokio::spawn(async move {
                let mut rec = record.lock().await;
                let outcome = worker.tick(&mut rec).await;
                running.store(rec.phase == Phase::GameRunning, Ordering::SeqCst);
                busy.store(false, Ordering::SeqCst);
                if outcome == TickOutcome::Completed {
                    let _ = done_tx.send(rec.id);
                }
            });
        }
    }
}

/// Polls the chain for new events and feeds them to the main loop.
async fn event_pump(
    chain: Arc<dyn ChainClient>,
    mut from_block: u64,
    tx: mpsc::UnboundedSender<GameEvent>,
) {
    let mut poll = tokio::time::interval(EVENT_POLL_INTERVAL);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        poll.tick().await;
        let latest = match chain.get_block_number().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "event pump: block number read failed");
                tokio::time::sleep(ERROR_PAUSE).await;
                continue;
            }
        };
        if latest < from_block {
            continue;
        }
        match chain.get_events(from_block, latest).await {
            Ok(events) => {
                for event in events {
                    if tx.send(event).is_err() {
                        return;
                    }
                }
                from_block = latest + 1;
            }
            Err(e) => {
                warn!(error = %e, "event pump: log query failed");
                tokio::time::sleep(ERROR_PAUSE).await;
            }
        }
    }
}
