use std::time::Duration;

use alloy_primitives::{keccak256, B256};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::store::{ArtifactStore, StoreError};

/// Delay between the commit landing and the store-block-hash attempt,
/// absorbing normal chain latency.
pub const STORE_DELAY: Duration = Duration::from_secs(15);

/// Backoff before the single reveal retry.
pub const REVEAL_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Draw a fresh 32-byte reveal secret.
pub fn generate_secret() -> B256 {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    B256::from(bytes)
}

/// The on-chain commitment for a secret.
pub fn commitment(reveal: B256) -> B256 {
    keccak256(reveal.as_slice())
}

/// The secret for one game: reuse the persisted one when present so a
/// restart between generation and reveal never re-commits to a
/// different value, otherwise generate and persist before first use.
pub async fn ensure_secret(store: &ArtifactStore, game_id: u64) -> Result<B256, StoreError> {
    match store.load_reveal(game_id).await {
        Ok(reveal) => Ok(reveal),
        Err(StoreError::Missing { .. }) => {
            let reveal = generate_secret();
            store.save_reveal(game_id, reveal).await?;
            Ok(reveal)
        }
        Err(e) => Err(e),
    }
}
