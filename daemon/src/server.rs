use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use scriptgame_core::{GameMap, RuleError, Session, TileCode, ViewWindow};

use crate::auth::{
    challenge_message, recover_signer, AuthError, TokenAuthority, CHALLENGE_TTL_MS,
    TOKEN_TTL_SECS,
};
use crate::config::{Config, TLS_CERT_PATH, TLS_KEY_PATH};

/// Timer warnings, seconds before expiry, each fired once.
const TIMER_WARNINGS_SECS: [u64; 4] = [60, 30, 10, 5];

pub type SessionHandle = Arc<Mutex<Session>>;

pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

// ── API errors ──────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match &self {
            Self::BadRequest(m)
            | Self::Unauthorized(m)
            | Self::Forbidden(m)
            | Self::NotFound(m)
            | Self::Internal(m) => m.clone(),
        };
        (self.status(), Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<RuleError> for ApiError {
    fn from(e: RuleError) -> Self {
        match e {
            RuleError::UnknownPlayer => Self::NotFound(e.to_string()),
            _ => Self::BadRequest(e.to_string()),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::MalformedSignature => Self::BadRequest(e.to_string()),
            AuthError::Recovery(_) => Self::Internal(e.to_string()),
            AuthError::SignatureMismatch => Self::Forbidden(e.to_string()),
            AuthError::InvalidToken | AuthError::TokenExpired => {
                Self::Unauthorized(e.to_string())
            }
        }
    }
}

// ── Request context ─────────────────────────────────────────

pub struct ApiContext {
    pub game_id: u64,
    pub contract: Address,
    pub stake_amount: U256,
    pub session: SessionHandle,
    pub tokens: TokenAuthority,
    pub started_at: DateTime<Utc>,
}

fn authenticate(ctx: &ApiContext, headers: &HeaderMap) -> Result<Address, ApiError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| ApiError::Unauthorized("Missing authorization token".to_string()))?;
    let token = value
        .to_str()
        .ok()
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthorized("Malformed authorization header".to_string()))?;
    let address = ctx.tokens.verify(token)?;
    if !ctx.session.lock().unwrap().is_player(address) {
        return Err(ApiError::Forbidden(
            "Address is no longer a player of this game".to_string(),
        ));
    }
    Ok(address)
}

// ── Bodies ──────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerInfoBody {
    name: &'static str,
    game_id: u64,
    contract: Address,
    stake_amount: String,
    phase: &'static str,
    player_count: usize,
    started_at: String,
    uptime_secs: i64,
    time_remaining: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
    game_id: u64,
    phase: &'static str,
    player_count: usize,
    time_remaining: u64,
    started_at: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlayerRow {
    address: Address,
    score: u32,
    moves_remaining: u8,
    mines_remaining: u8,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlayersBody {
    players: Vec<PlayerRow>,
    count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChallengeBody {
    message: String,
    timestamp: u64,
    game_id: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterBody {
    address: String,
    signature: String,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenBody {
    token: String,
    expires_in: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MapBody {
    view: ViewWindow,
    time_remaining: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoveBody {
    direction: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MoveResultBody {
    position: scriptgame_core::Position,
    tile: TileCode,
    moves_remaining: u8,
    mines_remaining: u8,
    view: ViewWindow,
    time_remaining: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MineResultBody {
    points_earned: u32,
    score: u32,
    mines_remaining: u8,
    view: ViewWindow,
    time_remaining: u64,
}

// ── Handlers ────────────────────────────────────────────────

async fn root(State(ctx): State<Arc<ApiContext>>) -> Json<ServerInfoBody> {
    let session = ctx.session.lock().unwrap();
    let phase = if session.all_players_finished() {
        "GAME_FINISHED"
    } else {
        "GAME_RUNNING"
    };
    Json(ServerInfoBody {
        name: "ScriptGame",
        game_id: ctx.game_id,
        contract: ctx.contract,
        // decimal string: stakes overflow 2^53 routinely
        stake_amount: ctx.stake_amount.to_string(),
        phase,
        player_count: session.player_count(),
        started_at: ctx.started_at.to_rfc3339(),
        uptime_secs: (Utc::now() - ctx.started_at).num_seconds(),
        time_remaining: session.time_remaining_ms(now_ms()),
    })
}

async fn liveness() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn status(State(ctx): State<Arc<ApiContext>>) -> Json<StatusBody> {
    let session = ctx.session.lock().unwrap();
    let phase = if session.all_players_finished() {
        "GAME_FINISHED"
    } else {
        "GAME_RUNNING"
    };
    Json(StatusBody {
        game_id: ctx.game_id,
        phase,
        player_count: session.player_count(),
        time_remaining: session.time_remaining_ms(now_ms()),
        started_at: ctx.started_at.to_rfc3339(),
    })
}

/// Sanitised stats: no positions, no current tile.
async fn players(State(ctx): State<Arc<ApiContext>>) -> Json<PlayersBody> {
    let snapshot = ctx.session.lock().unwrap().snapshot();
    let players: Vec<PlayerRow> = snapshot
        .players
        .iter()
        .map(|p| PlayerRow {
            address: p.address,
            score: p.score,
            moves_remaining: p.moves_remaining,
            mines_remaining: p.mines_remaining,
        })
        .collect();
    let count = players.len();
    Json(PlayersBody { players, count })
}

async fn register_challenge(State(ctx): State<Arc<ApiContext>>) -> Json<ChallengeBody> {
    let timestamp = now_ms();
    Json(ChallengeBody {
        message: challenge_message(ctx.contract, ctx.game_id, timestamp),
        timestamp,
        game_id: ctx.game_id,
    })
}

async fn register_submit(
    State(ctx): State<Arc<ApiContext>>,
    Json(body): Json<RegisterBody>,
) -> Result<Json<TokenBody>, ApiError> {
    let address: Address = body
        .address
        .parse()
        .map_err(|_| ApiError::BadRequest("Invalid address".to_string()))?;
    let now = now_ms();
    if now.saturating_sub(body.timestamp) > CHALLENGE_TTL_MS {
        return Err(ApiError::BadRequest("Challenge expired".to_string()));
    }
    let message = challenge_message(ctx.contract, ctx.game_id, body.timestamp);
    let recovered = recover_signer(&message, &body.signature)?;
    if recovered != address {
        return Err(AuthError::SignatureMismatch.into());
    }
    if !ctx.session.lock().unwrap().is_player(address) {
        return Err(ApiError::Forbidden(
            "Address is not a player of this game".to_string(),
        ));
    }
    let token = ctx.tokens.issue(address, now / 1000)?;
    Ok(Json(TokenBody { token, expires_in: TOKEN_TTL_SECS }))
}

async fn map_view(
    State(ctx): State<Arc<ApiContext>>,
    headers: HeaderMap,
) -> Result<Json<MapBody>, ApiError> {
    let address = authenticate(&ctx, &headers)?;
    let session = ctx.session.lock().unwrap();
    let view = session.view(address)?;
    Ok(Json(MapBody {
        view,
        time_remaining: session.time_remaining_ms(now_ms()),
    }))
}

async fn do_move(
    State(ctx): State<Arc<ApiContext>>,
    headers: HeaderMap,
    Json(body): Json<MoveBody>,
) -> Result<Json<MoveResultBody>, ApiError> {
    let address = authenticate(&ctx, &headers)?;
    let mut session = ctx.session.lock().unwrap();
    let outcome = session.move_player(address, &body.direction, now_ms())?;
    let view = session.view(address)?;
    Ok(Json(MoveResultBody {
        position: outcome.position,
        tile: TileCode(outcome.tile),
        moves_remaining: outcome.moves_remaining,
        mines_remaining: outcome.mines_remaining,
        view,
        time_remaining: session.time_remaining_ms(now_ms()),
    }))
}

async fn do_mine(
    State(ctx): State<Arc<ApiContext>>,
    headers: HeaderMap,
) -> Result<Json<MineResultBody>, ApiError> {
    let address = authenticate(&ctx, &headers)?;
    let mut session = ctx.session.lock().unwrap();
    let outcome = session.mine(address, now_ms())?;
    let view = session.view(address)?;
    Ok(Json(MineResultBody {
        points_earned: outcome.points_earned,
        score: outcome.score,
        mines_remaining: outcome.mines_remaining,
        view,
        time_remaining: session.time_remaining_ms(now_ms()),
    }))
}

fn router(ctx: Arc<ApiContext>) -> Router {
    use tower_http::cors::{Any, CorsLayer};
    // permissive CORS for browser play; preflights short-circuit in the layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    Router::new()
        .route("/", get(root))
        .route("/test", get(liveness))
        .route("/status", get(status))
        .route("/players", get(players))
        .route("/register", get(register_challenge).post(register_submit))
        .route("/map", get(map_view))
        .route("/move", post(do_move))
        .route("/mine", post(do_mine))
        .layer(cors)
        .with_state(ctx)
}

// ── Server lifecycle ────────────────────────────────────────

/// One listener for one game, plus its timer task.
pub struct GameServer {
    pub game_id: u64,
    pub port: u16,
    pub session: SessionHandle,
    handle: Handle,
    timer_stop: watch::Sender<bool>,
    _serve_task: JoinHandle<()>,
    _timer_task: JoinHandle<()>,
}

impl GameServer {
    /// Graceful stop: cancel the timer, let in-flight requests finish.
    pub fn stop(&self) {
        info!(game = self.game_id, port = self.port, "stopping listener");
        let _ = self.timer_stop.send(true);
        self.handle.graceful_shutdown(Some(Duration::from_secs(5)));
    }
}

pub async fn start_game_server(
    cfg: &Config,
    game_id: u64,
    port: u16,
    stake_amount: U256,
    map: GameMap,
    players: Vec<Address>,
    seed: B256,
) -> Result<GameServer> {
    let started = now_ms();
    let session: SessionHandle = Arc::new(Mutex::new(Session::new(
        game_id, map, &players, seed, started,
    )));
    let deadline_ms = session.lock().unwrap().deadline_ms();

    let ctx = Arc::new(ApiContext {
        game_id,
        contract: cfg.contract_address,
        stake_amount,
        session: session.clone(),
        tokens: TokenAuthority::new(&cfg.jwt_secret, cfg.contract_address),
        started_at: Utc::now(),
    });
    let app = router(ctx);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = std::net::TcpListener::bind(addr)
        .with_context(|| format!("game {game_id}: cannot bind port {port}"))?;
    listener.set_nonblocking(true)?;

    let handle = Handle::new();
    let serve_handle = handle.clone();
    let make = app.into_make_service();

    let tls = if Config::tls_available() {
        match RustlsConfig::from_pem_file(TLS_CERT_PATH, TLS_KEY_PATH).await {
            Ok(tls) => Some(tls),
            Err(e) => {
                // same port, plain HTTP
                warn!(game = game_id, error = %e, "TLS setup failed; falling back to HTTP");
                None
            }
        }
    } else {
        None
    };

    let serve_task = match tls {
        Some(tls) => tokio::spawn(async move {
            if let Err(e) = axum_server::from_tcp_rustls(listener, tls)
                .handle(serve_handle)
                .serve(make)
                .await
            {
                error!(game = game_id, error = %e, "game server terminated");
            }
        }),
        None => tokio::spawn(async move {
            if let Err(e) = axum_server::from_tcp(listener)
                .handle(serve_handle)
                .serve(make)
                .await
            {
                error!(game = game_id, error = %e, "game server terminated");
            }
        }),
    };

    let (timer_stop, timer_rx) = watch::channel(false);
    let timer_task = tokio::spawn(run_timer(game_id, session.clone(), deadline_ms, timer_rx));

    info!(game = game_id, port, "listening");
    Ok(GameServer {
        game_id,
        port,
        session,
        handle,
        timer_stop,
        _serve_task: serve_task,
        _timer_task: timer_task,
    })
}

/// Warns once per threshold, then zeroes every budget at the deadline.
async fn run_timer(
    game_id: u64,
    session: SessionHandle,
    deadline_ms: u64,
    mut stop: watch::Receiver<bool>,
) {
    for threshold in TIMER_WARNINGS_SECS {
        let fire_at = deadline_ms.saturating_sub(threshold * 1000);
        let now = now_ms();
        if fire_at <= now {
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(fire_at - now)) => {
                warn!(game = game_id, "{threshold}s remaining");
            }
            _ = stop.changed() => return,
        }
    }
    let now = now_ms();
    if deadline_ms > now {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(deadline_ms - now)) => {}
            _ = stop.changed() => return,
        }
    }
    session.lock().unwrap().expire();
    info!(game = game_id, "time expired; all budgets zeroed");
}
