use std::time::Duration;

use alloy::contract::Error as ContractError;
use alloy::network::EthereumWallet;
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::TransactionReceipt;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy_primitives::{Address, B256, U256};
use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::warn;

use crate::chain::{
    ChainClient, ChainError, CommitRevealState, GameEvent, GameInfo, PayoutInfo, TxReceipt,
};
use crate::config::Config;

/// Bounded receipt wait; a timeout is treated as a retryable revert.
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(60);

sol! {
    #[sol(rpc)]
    contract ScriptGame {
        function getGameInfo(uint256 gameId) external view returns (
            address gamemaster,
            address creator,
            uint256 stakeAmount,
            bool open,
            uint256 playerCount,
            bool hasOpened,
            bool hasClosed
        );

        function getCommitRevealState(uint256 gameId) external view returns (
            bytes32 committedHash,
            uint256 commitBlockNumber,
            bytes32 revealValue,
            bytes32 randomHash,
            bool hasCommitted,
            bool hasRevealed,
            bool hasStoredBlockHash,
            uint256 mapSize
        );

        function getPayoutInfo(uint256 gameId) external view returns (
            address[] winners,
            uint256 payoutAmount,
            bool hasPaidOut
        );

        function getPlayers(uint256 gameId) external view returns (address[] players);
        function getCommitBlockHash(uint256 gameId) external view returns (bytes32);

        function commitHash(uint256 gameId, bytes32 hash) external;
        function storeCommitBlockHash(uint256 gameId, string serverUrl) external;
        function revealHash(uint256 gameId, bytes32 reveal) external;
        function payout(uint256 gameId, address[] winners) external;

        event GameCreated(uint256 indexed gameId, address indexed gamemaster, address creator, uint256 stakeAmount);
        event GameOpened(uint256 indexed gameId);
        event GameClosed(uint256 indexed gameId, uint256 playerCount, uint256 mapSize);
        event HashCommitted(uint256 indexed gameId, bytes32 hash);
    }
}

/// Gamemaster-signed client over an HTTP provider.
pub struct EvmClient {
    contract: ScriptGame::ScriptGameInstance<DynProvider>,
    provider: DynProvider,
    gamemaster: Address,
}

impl EvmClient {
    pub async fn connect(cfg: &Config) -> Result<Self> {
        let signer: PrivateKeySigner = cfg
            .privkey
            .parse()
            .context("PRIVKEY is not a valid secp256k1 private key")?;
        let gamemaster = signer.address();
        let wallet = EthereumWallet::from(signer);
        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .connect_http(cfg.rpc_url.clone())
            .erased();

        let chain_id = provider
            .get_chain_id()
            .await
            .context("chain RPC is unreachable")?;
        if chain_id != cfg.chain_id {
            warn!(expected = cfg.chain_id, actual = chain_id, "chain id mismatch");
        }

        let contract = ScriptGame::new(cfg.contract_address, provider.clone());
        Ok(Self { contract, provider, gamemaster })
    }

    pub fn gamemaster(&self) -> Address {
        self.gamemaster
    }

    fn receipt(receipt: TransactionReceipt) -> Result<TxReceipt, ChainError> {
        if !receipt.status() {
            return Err(ChainError::Reverted("transaction reverted".to_string()));
        }
        Ok(TxReceipt {
            tx_hash: receipt.transaction_hash,
            block_number: receipt.block_number.unwrap_or_default(),
        })
    }
}

/// Classify a provider/contract failure into the retry taxonomy. The
/// contract's custom error names surface in the node's revert message,
/// so recognition is by substring; anything unrecognised stays a
/// generic `Reverted` and takes the standard retry path.
fn classify(err: ContractError) -> ChainError {
    let msg = err.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("insufficient funds") {
        ChainError::InsufficientFunds
    } else if msg.contains("BlockNotReady") {
        ChainError::BlockNotReady
    } else if msg.contains("BlockHashUnavailable") {
        ChainError::BlockHashUnavailable
    } else if msg.contains("NotAuthorized") || lower.contains("not authorized") {
        ChainError::NotAuthorized
    } else if lower.contains("revert") {
        ChainError::Reverted(msg)
    } else {
        ChainError::Transport(msg)
    }
}

fn transport(err: impl std::fmt::Display) -> ChainError {
    ChainError::Transport(err.to_string())
}

#[async_trait]
impl ChainClient for EvmClient {
    async fn get_block_number(&self) -> Result<u64, ChainError> {
        self.provider.get_block_number().await.map_err(transport)
    }

    async fn get_game_info(&self, game_id: u64) -> Result<GameInfo, ChainError> {
        let r = self
            .contract
            .getGameInfo(U256::from(game_id))
            .call()
            .await
            .map_err(classify)?;
        Ok(GameInfo {
            gamemaster: r.gamemaster,
            creator: r.creator,
            stake_amount: r.stakeAmount,
            open: r.open,
            player_count: r.playerCount.to::<u64>(),
            has_opened: r.hasOpened,
            has_closed: r.hasClosed,
        })
    }

    async fn get_commit_reveal_state(
        &self,
        game_id: u64,
    ) -> Result<CommitRevealState, ChainError> {
        let r = self
            .contract
            .getCommitRevealState(U256::from(game_id))
            .call()
            .await
            .map_err(classify)?;
        Ok(CommitRevealState {
            committed_hash: r.committedHash,
            commit_block_number: r.commitBlockNumber.to::<u64>(),
            reveal_value: r.revealValue,
            random_hash: r.randomHash,
            has_committed: r.hasCommitted,
            has_revealed: r.hasRevealed,
            has_stored_block_hash: r.hasStoredBlockHash,
            map_size: r.mapSize.to::<u32>(),
        })
    }

    async fn get_payout_info(&self, game_id: u64) -> Result<PayoutInfo, ChainError> {
        let r = self
            .contract
            .getPayoutInfo(U256::from(game_id))
            .call()
            .await
            .map_err(classify)?;
        Ok(PayoutInfo {
            winners: r.winners,
            payout_amount: r.payoutAmount,
            has_paid_out: r.hasPaidOut,
        })
    }

    async fn get_players(&self, game_id: u64) -> Result<Vec<Address>, ChainError> {
        self.contract
            .getPlayers(U256::from(game_id))
            .call()
            .await
            .map_err(classify)
    }

    async fn get_commit_block_hash(&self, game_id: u64) -> Result<B256, ChainError> {
        let hash = self
            .contract
            .getCommitBlockHash(U256::from(game_id))
            .call()
            .await
            .map_err(classify)?;
        // blockhash() yields zero once the block leaves the retention
        // window even where the contract does not revert.
        if hash == B256::ZERO {
            return Err(ChainError::BlockHashUnavailable);
        }
        Ok(hash)
    }

    async fn commit_hash(&self, game_id: u64, hash: B256) -> Result<TxReceipt, ChainError> {
        let pending = self
            .contract
            .commitHash(U256::from(game_id), hash)
            .send()
            .await
            .map_err(classify)?;
        let receipt = pending
            .with_timeout(Some(RECEIPT_TIMEOUT))
            .get_receipt()
            .await
            .map_err(|e| ChainError::Reverted(e.to_string()))?;
        Self::receipt(receipt)
    }

    async fn store_commit_block_hash(
        &self,
        game_id: u64,
        server_url: &str,
    ) -> Result<TxReceipt, ChainError> {
        let pending = self
            .contract
            .storeCommitBlockHash(U256::from(game_id), server_url.to_string())
            .send()
            .await
            .map_err(classify)?;
        let receipt = pending
            .with_timeout(Some(RECEIPT_TIMEOUT))
            .get_receipt()
            .await
            .map_err(|e| ChainError::Reverted(e.to_string()))?;
        Self::receipt(receipt)
    }

    async fn reveal_hash(&self, game_id: u64, reveal: B256) -> Result<TxReceipt, ChainError> {
        let pending = self
            .contract
            .revealHash(U256::from(game_id), reveal)
            .send()
            .await
            .map_err(classify)?;
        let receipt = pending
            .with_timeout(Some(RECEIPT_TIMEOUT))
            .get_receipt()
            .await
            .map_err(|e| ChainError::Reverted(e.to_string()))?;
        Self::receipt(receipt)
    }

    async fn payout(&self, game_id: u64, winners: &[Address]) -> Result<TxReceipt, ChainError> {
        let pending = self
            .contract
            .payout(U256::from(game_id), winners.to_vec())
            .send()
            .await
            .map_err(classify)?;
        let receipt = pending
            .with_timeout(Some(RECEIPT_TIMEOUT))
            .get_receipt()
            .await
            .map_err(|e| ChainError::Reverted(e.to_string()))?;
        Self::receipt(receipt)
    }

    async fn get_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<GameEvent>, ChainError> {
        // (block, log index) so the merged stream replays in chain order
        let mut events: Vec<(u64, u64, GameEvent)> = Vec::new();

        let created = self
            .contract
            .GameCreated_filter()
            .from_block(from_block)
            .to_block(to_block)
            .query()
            .await
            .map_err(transport)?;
        for (ev, log) in created {
            events.push((
                log.block_number.unwrap_or_default(),
                log.log_index.unwrap_or_default(),
                GameEvent::Created {
                    game_id: ev.gameId.to::<u64>(),
                    gamemaster: ev.gamemaster,
                    creator: ev.creator,
                    stake_amount: ev.stakeAmount,
                },
            ));
        }

        let opened = self
            .contract
            .GameOpened_filter()
            .from_block(from_block)
            .to_block(to_block)
            .query()
            .await
            .map_err(transport)?;
        for (ev, log) in opened {
            events.push((
                log.block_number.unwrap_or_default(),
                log.log_index.unwrap_or_default(),
                GameEvent::Opened { game_id: ev.gameId.to::<u64>() },
            ));
        }

        let closed = self
            .contract
            .GameClosed_filter()
            .from_block(from_block)
            .to_block(to_block)
            .query()
            .await
            .map_err(transport)?;
        for (ev, log) in closed {
            events.push((
                log.block_number.unwrap_or_default(),
                log.log_index.unwrap_or_default(),
                GameEvent::Closed {
                    game_id: ev.gameId.to::<u64>(),
                    player_count: ev.playerCount.to::<u64>(),
                    map_size: ev.mapSize.to::<u32>(),
                },
            ));
        }

        let committed = self
            .contract
            .HashCommitted_filter()
            .from_block(from_block)
            .to_block(to_block)
            .query()
            .await
            .map_err(transport)?;
        for (ev, log) in committed {
            events.push((
                log.block_number.unwrap_or_default(),
                log.log_index.unwrap_or_default(),
                GameEvent::Committed { game_id: ev.gameId.to::<u64>(), hash: ev.hash },
            ));
        }

        events.sort_by_key(|(block, index, _)| (*block, *index));
        Ok(events.into_iter().map(|(_, _, ev)| ev).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_by_revert_detail() {
        let cases = [
            ("server returned an error response: insufficient funds for gas * price + value", ChainError::InsufficientFunds),
            ("execution reverted: BlockNotReady", ChainError::BlockNotReady),
            ("execution reverted: BlockHashUnavailable", ChainError::BlockHashUnavailable),
            ("execution reverted: NotAuthorized", ChainError::NotAuthorized),
        ];
        for (msg, expected) in cases {
            let err = ContractError::TransportError(
                alloy::transports::TransportErrorKind::custom_str(msg),
            );
            assert_eq!(classify(err), expected, "{msg}");
        }
    }

    #[test]
    fn unknown_reverts_stay_retryable() {
        let err = ContractError::TransportError(
            alloy::transports::TransportErrorKind::custom_str("execution reverted: 0xdeadbeef"),
        );
        match classify(err) {
            ChainError::Reverted(_) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn non_revert_errors_are_transport() {
        let err = ContractError::TransportError(
            alloy::transports::TransportErrorKind::custom_str("connection refused"),
        );
        match classify(err) {
            ChainError::Transport(_) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}
