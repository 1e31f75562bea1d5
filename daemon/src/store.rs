use std::fmt;
use std::path::{Path, PathBuf};

use alloy_primitives::B256;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use scriptgame_core::{GameMap, SessionSnapshot, StartingPosition, TileCode};

// ── Errors ──────────────────────────────────────────────────

#[derive(Debug)]
pub enum StoreError {
    /// The artifact the current phase depends on is not on disk.
    Missing { kind: &'static str, game_id: u64 },
    Io(std::io::Error),
    Format(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { kind, game_id } => {
                write!(f, "artifact {kind}_{game_id} is missing")
            }
            Self::Io(e) => write!(f, "artifact io error: {e}"),
            Self::Format(e) => write!(f, "artifact format error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

// ── Artifact shapes ─────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapArtifact {
    pub size: u32,
    pub land: Vec<Vec<TileCode>>,
    pub starting_position: StartingPosition,
    pub metadata: MapMetadata,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapMetadata {
    pub generated: String,
    pub game_id: u64,
    pub reveal_value: B256,
    pub random_hash: B256,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoresArtifact {
    pub game_id: u64,
    pub players: Vec<scriptgame_core::PlayerSummary>,
    pub count: usize,
    pub saved_at: String,
}

// ── Store ───────────────────────────────────────────────────

/// Flat per-game key-value persistence over one directory. Three keys
/// per game: `reveal_<id>`, `map_<id>`, `scores_<id>`. Writes go to a
/// temp file first and are renamed into place.
#[derive(Clone, Debug)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self { dir: dir.to_path_buf() })
    }

    fn path(&self, kind: &str, game_id: u64) -> PathBuf {
        self.dir.join(format!("{kind}_{game_id}"))
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    // ── reveal ──────────────────────────────────────────────

    pub async fn save_reveal(&self, game_id: u64, reveal: B256) -> Result<(), StoreError> {
        let body = format!("0x{}", hex::encode(reveal.as_slice()));
        self.write_atomic(&self.path("reveal", game_id), body.as_bytes())
            .await
    }

    pub async fn load_reveal(&self, game_id: u64) -> Result<B256, StoreError> {
        let path = self.path("reveal", game_id);
        let body = match tokio::fs::read_to_string(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::Missing { kind: "reveal", game_id })
            }
            Err(e) => return Err(e.into()),
        };
        body.trim()
            .parse::<B256>()
            .map_err(|e| StoreError::Format(format!("reveal_{game_id}: {e}")))
    }

    // ── map ─────────────────────────────────────────────────

    pub async fn save_map(
        &self,
        game_id: u64,
        map: &GameMap,
        reveal: B256,
        random_hash: B256,
    ) -> Result<(), StoreError> {
        let artifact = MapArtifact {
            size: map.size,
            land: map
                .land
                .iter()
                .map(|row| row.iter().map(|&t| TileCode(t)).collect())
                .collect(),
            starting_position: map.starting_position,
            metadata: MapMetadata {
                generated: Utc::now().to_rfc3339(),
                game_id,
                reveal_value: reveal,
                random_hash,
            },
        };
        let body = serde_json::to_vec_pretty(&artifact)
            .map_err(|e| StoreError::Format(e.to_string()))?;
        self.write_atomic(&self.path("map", game_id), &body).await
    }

    pub async fn load_map(&self, game_id: u64) -> Result<GameMap, StoreError> {
        let path = self.path("map", game_id);
        let body = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::Missing { kind: "map", game_id })
            }
            Err(e) => return Err(e.into()),
        };
        let artifact: MapArtifact = serde_json::from_slice(&body)
            .map_err(|e| StoreError::Format(format!("map_{game_id}: {e}")))?;
        Ok(GameMap {
            size: artifact.size,
            land: artifact
                .land
                .iter()
                .map(|row| row.iter().map(|t| t.0).collect())
                .collect(),
            starting_position: artifact.starting_position,
        })
    }

    // ── scores ──────────────────────────────────────────────

    pub async fn save_scores(
        &self,
        game_id: u64,
        snapshot: &SessionSnapshot,
    ) -> Result<(), StoreError> {
        let artifact = ScoresArtifact {
            game_id,
            players: snapshot.players.clone(),
            count: snapshot.players.len(),
            saved_at: Utc::now().to_rfc3339(),
        };
        let body = serde_json::to_vec_pretty(&artifact)
            .map_err(|e| StoreError::Format(e.to_string()))?;
        self.write_atomic(&self.path("scores", game_id), &body).await
    }

    pub async fn load_scores(&self, game_id: u64) -> Result<ScoresArtifact, StoreError> {
        let path = self.path("scores", game_id);
        let body = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::Missing { kind: "scores", game_id })
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&body)
            .map_err(|e| StoreError::Format(format!("scores_{game_id}: {e}")))
    }

    pub fn scores_exist(&self, game_id: u64) -> bool {
        self.path("scores", game_id).exists()
    }
}
