use std::fmt;

use alloy_primitives::{Address, Signature};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// A signed challenge is accepted for five minutes, as stated in the
/// challenge text itself.
pub const CHALLENGE_TTL_MS: u64 = 5 * 60 * 1000;

/// Bearer tokens live for one hour.
pub const TOKEN_TTL_SECS: u64 = 60 * 60;

// ── Errors ──────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthError {
    MalformedSignature,
    /// The recovery machinery itself failed; surfaces as a 500.
    Recovery(String),
    SignatureMismatch,
    InvalidToken,
    TokenExpired,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedSignature => f.write_str("malformed signature"),
            Self::Recovery(e) => write!(f, "signature recovery failed: {e}"),
            Self::SignatureMismatch => f.write_str("signature does not match address"),
            Self::InvalidToken => f.write_str("invalid token"),
            Self::TokenExpired => f.write_str("token expired"),
        }
    }
}

impl std::error::Error for AuthError {}

// ── Challenge ───────────────────────────────────────────────

fn lower_hex(addr: Address) -> String {
    format!("0x{}", hex::encode(addr.as_slice()))
}

/// The fixed EIP-191 challenge template. The timestamp handed out by
/// `GET /register` is echoed back verbatim by the client, so the exact
/// byte string can be rebuilt for recovery.
pub fn challenge_message(contract: Address, game_id: u64, timestamp_ms: u64) -> String {
    format!(
        "Sign this message to authenticate with the game server.\n\
         \n\
         Contract: {}\n\
         GameId: {}\n\
         Namespace: ScriptGame\n\
         Timestamp: {}\n\
         \n\
         This signature is valid for 5 minutes.",
        lower_hex(contract),
        game_id,
        timestamp_ms,
    )
}

/// Recover the EIP-191 personal-sign signer of `message`.
pub fn recover_signer(message: &str, signature_hex: &str) -> Result<Address, AuthError> {
    let sig: Signature = signature_hex
        .parse()
        .map_err(|_| AuthError::MalformedSignature)?;
    sig.recover_address_from_msg(message.as_bytes())
        .map_err(|e| AuthError::Recovery(e.to_string()))
}

// ── Bearer tokens ───────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: u64,
    exp: u64,
}

/// HS256 token mint/check scoped to one contract: the signing secret
/// is `BASE ∥ "-" ∥ contract_address_lower`, so tokens never cross
/// deployments.
#[derive(Clone, Debug)]
pub struct TokenAuthority {
    secret: String,
}

impl TokenAuthority {
    pub fn new(base: &str, contract: Address) -> Self {
        Self {
            secret: format!("{}-{}", base, lower_hex(contract)),
        }
    }

    pub fn issue(&self, address: Address, now_secs: u64) -> Result<String, AuthError> {
        let claims = Claims {
            sub: lower_hex(address),
            iat: now_secs,
            exp: now_secs + TOKEN_TTL_SECS,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| AuthError::Recovery(e.to_string()))
    }

    pub fn verify(&self, token: &str) -> Result<Address, AuthError> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
            _ => AuthError::InvalidToken,
        })?;
        data.claims
            .sub
            .parse::<Address>()
            .map_err(|_| AuthError::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::signers::local::PrivateKeySigner;
    use alloy::signers::SignerSync;

    fn now_secs() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    #[test]
    fn challenge_template_is_exact() {
        let contract = Address::with_last_byte(0xaa);
        let msg = challenge_message(contract, 3, 1_700_000_000_123);
        assert_eq!(
            msg,
            "Sign this message to authenticate with the game server.\n\n\
             Contract: 0x00000000000000000000000000000000000000aa\n\
             GameId: 3\n\
             Namespace: ScriptGame\n\
             Timestamp: 1700000000123\n\n\
             This signature is valid for 5 minutes."
        );
    }

    #[test]
    fn recovery_round_trip() {
        let signer = PrivateKeySigner::random();
        let msg = challenge_message(Address::with_last_byte(1), 7, 1_700_000_000_000);
        let sig = signer.sign_message_sync(msg.as_bytes()).unwrap();
        let sig_hex = format!("0x{}", hex::encode(sig.as_bytes()));
        let recovered = recover_signer(&msg, &sig_hex).unwrap();
        assert_eq!(recovered, signer.address());
    }

    #[test]
    fn recovery_rejects_a_tampered_message() {
        let signer = PrivateKeySigner::random();
        let msg = challenge_message(Address::with_last_byte(1), 7, 1_700_000_000_000);
        let sig = signer.sign_message_sync(msg.as_bytes()).unwrap();
        let sig_hex = format!("0x{}", hex::encode(sig.as_bytes()));
        let other = challenge_message(Address::with_last_byte(1), 8, 1_700_000_000_000);
        // recovery over a different message yields a different signer
        match recover_signer(&other, &sig_hex) {
            Ok(addr) => assert_ne!(addr, signer.address()),
            Err(_) => {}
        }
    }

    #[test]
    fn malformed_signature_is_not_a_500() {
        assert_eq!(
            recover_signer("hello", "0x1234"),
            Err(AuthError::MalformedSignature)
        );
        assert_eq!(
            recover_signer("hello", "not hex at all"),
            Err(AuthError::MalformedSignature)
        );
    }

    #[test]
    fn token_round_trip() {
        let contract = Address::with_last_byte(0x10);
        let authority = TokenAuthority::new("topsecret", contract);
        let player = Address::with_last_byte(0x99);
        let token = authority.issue(player, now_secs()).unwrap();
        assert_eq!(authority.verify(&token).unwrap(), player);
    }

    #[test]
    fn tokens_are_scoped_to_the_contract() {
        let player = Address::with_last_byte(0x99);
        let a = TokenAuthority::new("topsecret", Address::with_last_byte(0x10));
        let b = TokenAuthority::new("topsecret", Address::with_last_byte(0x11));
        let token = a.issue(player, now_secs()).unwrap();
        assert_eq!(b.verify(&token), Err(AuthError::InvalidToken));
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let authority = TokenAuthority::new("topsecret", Address::with_last_byte(0x10));
        let player = Address::with_last_byte(0x99);
        // issued two hours ago, expired one hour ago
        let token = authority.issue(player, now_secs() - 2 * TOKEN_TTL_SECS).unwrap();
        assert_eq!(authority.verify(&token), Err(AuthError::TokenExpired));
    }

    #[test]
    fn garbage_tokens_are_invalid() {
        let authority = TokenAuthority::new("topsecret", Address::with_last_byte(0x10));
        assert_eq!(authority.verify("not-a-jwt"), Err(AuthError::InvalidToken));
    }
}
