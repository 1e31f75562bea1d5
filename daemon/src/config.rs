use std::env;
use std::path::{Path, PathBuf};

use alloy_primitives::Address;
use anyhow::{anyhow, Context, Result};
use url::Url;

pub const DEFAULT_CHAIN_ID: u64 = 8453;
pub const DEFAULT_GAME_API_BASE: &str = "http://localhost";
pub const DEFAULT_DATA_DIR: &str = "gamedata";

/// TLS material is looked up at these conventional paths in the
/// process working directory.
pub const TLS_CERT_PATH: &str = "server.cert";
pub const TLS_KEY_PATH: &str = "server.key";

/// Daemon configuration, read from the environment once at startup.
/// A missing required variable is a fatal initialisation error.
#[derive(Clone, Debug)]
pub struct Config {
    pub contract_address: Address,
    pub chain_id: u64,
    pub rpc_url: Url,
    pub game_api_base: String,
    pub privkey: String,
    pub jwt_secret: String,
    pub data_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let contract_address = required("CONTRACT_ADDRESS")?
            .parse::<Address>()
            .context("CONTRACT_ADDRESS is not a 0x-prefixed 20-byte hex address")?;
        let chain_id = match env::var("CHAIN_ID") {
            Ok(v) => v.parse::<u64>().context("CHAIN_ID is not an integer")?,
            Err(_) => DEFAULT_CHAIN_ID,
        };
        let rpc_url = required("RPC_URL")?
            .parse::<Url>()
            .context("RPC_URL is not a valid URL")?;
        let game_api_base =
            env::var("GAME_API_BASE").unwrap_or_else(|_| DEFAULT_GAME_API_BASE.to_string());
        let privkey = required("PRIVKEY")?;
        let jwt_secret = required("JWT_SECRET")?;
        let data_dir = env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR));

        Ok(Self {
            contract_address,
            chain_id,
            rpc_url,
            game_api_base,
            privkey,
            jwt_secret,
            data_dir,
        })
    }

    /// True when both TLS files exist; listeners then try HTTPS first.
    pub fn tls_available() -> bool {
        Path::new(TLS_CERT_PATH).exists() && Path::new(TLS_KEY_PATH).exists()
    }

    /// Public URL published on chain for one game's server:
    /// `<base>:<port>`, prefixing a scheme when the base has none.
    pub fn server_url(&self, port: u16) -> String {
        if self.game_api_base.contains("://") {
            format!("{}:{}", self.game_api_base, port)
        } else {
            let scheme = if Self::tls_available() { "https" } else { "http" };
            format!("{}://{}:{}", scheme, self.game_api_base, port)
        }
    }
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| anyhow!("missing required environment variable {name}"))
}

/// One TCP port per game.
pub fn port_for_game(game_id: u64) -> Result<u16> {
    u16::try_from(8000 + game_id).map_err(|_| anyhow!("game id {game_id} maps past the port range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(base: &str) -> Config {
        Config {
            contract_address: Address::ZERO,
            chain_id: DEFAULT_CHAIN_ID,
            rpc_url: "http://localhost:8545".parse().unwrap(),
            game_api_base: base.to_string(),
            privkey: String::new(),
            jwt_secret: "secret".to_string(),
            data_dir: PathBuf::from("gamedata"),
        }
    }

    #[test]
    fn server_url_keeps_an_existing_scheme() {
        let cfg = test_config("https://games.example.org");
        assert_eq!(cfg.server_url(8007), "https://games.example.org:8007");
    }

    #[test]
    fn server_url_prefixes_bare_hosts() {
        let cfg = test_config("localhost");
        assert_eq!(cfg.server_url(8001), "http://localhost:8001");
    }

    #[test]
    fn ports_are_8000_plus_game_id() {
        assert_eq!(port_for_game(0).unwrap(), 8000);
        assert_eq!(port_for_game(42).unwrap(), 8042);
        assert!(port_for_game(60_000).is_err());
    }
}
