//! Server identity and signed tunnel claims.
//!
//! The tunnel broker admits a connection only if it carries a claim signed
//! by the server's key. A claim is the base64url (no padding) encoding of a
//! JSON payload; the signature is Ed25519 over the encoded claim string,
//! also base64url without padding, so both survive a text config file.

use std::fmt;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;
use zeroize::Zeroizing;

use super::TunnelError;

/// Claim lifetime. The manager refreshes well before this runs out.
pub const CLAIM_TTL_SECONDS: i64 = 300;

/// Audience the broker expects.
pub const CLAIM_AUDIENCE: &str = "https://tunnel.vana.org";

/// The server's signing key and the wallet address derived from it.
pub struct ServerIdentity {
    signing_key: SigningKey,
    wallet: String,
}

impl fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("wallet", &self.wallet)
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}

impl ServerIdentity {
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(secret))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let wallet = wallet_address(&signing_key.verifying_key());
        Self {
            signing_key,
            wallet,
        }
    }

    /// Load the hex-encoded seed at `path`, creating it (mode 0600) if it
    /// does not exist yet.
    pub async fn load_or_create(path: &Path) -> Result<Self, TunnelError> {
        let key_error = |source: std::io::Error| TunnelError::Key {
            path: path.to_path_buf(),
            source,
        };

        match tokio::fs::read_to_string(path).await {
            Ok(raw) => {
                let raw = Zeroizing::new(raw);
                let mut seed = Zeroizing::new([0u8; 32]);
                hex::decode_to_slice(raw.trim(), seed.as_mut_slice())
                    .map_err(|_| TunnelError::InvalidKey(path.to_path_buf()))?;
                Ok(Self::from_secret_bytes(&seed))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let identity = Self::generate();
                let encoded = Zeroizing::new(hex::encode(identity.signing_key.to_bytes()));

                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(key_error)?;
                }
                tokio::fs::write(path, encoded.as_bytes())
                    .await
                    .map_err(key_error)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                        .await
                        .map_err(key_error)?;
                }

                info!(path = %path.display(), wallet = %identity.wallet, "Generated server identity");
                Ok(identity)
            }
            Err(e) => Err(key_error(e)),
        }
    }

    /// `0x`-prefixed address identifying this server to the broker.
    pub fn wallet(&self) -> &str {
        &self.wallet
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

/// `0x` + hex of the last 20 bytes of SHA-256(verifying key).
pub fn wallet_address(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    format!("0x{}", hex::encode(&digest[digest.len() - 20..]))
}

/// What the broker's auth plugin checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimPayload {
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub owner: String,
    pub wallet: String,
    pub subdomain: String,
    pub run_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedClaim {
    pub payload: ClaimPayload,
    /// base64url(payload JSON)
    pub claim: String,
    /// base64url(Ed25519 signature over `claim`)
    pub sig: String,
}

/// Build and sign a fresh claim for one connection attempt.
pub fn generate_signed_claim(
    identity: &ServerIdentity,
    owner: &str,
    run_id: &str,
    now: DateTime<Utc>,
) -> Result<SignedClaim, TunnelError> {
    let iat = now.timestamp();
    let payload = ClaimPayload {
        aud: CLAIM_AUDIENCE.to_string(),
        iat,
        exp: iat + CLAIM_TTL_SECONDS,
        owner: owner.to_string(),
        wallet: identity.wallet().to_string(),
        subdomain: identity.wallet().to_lowercase(),
        run_id: run_id.to_string(),
    };

    let claim = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload)?);
    let sig = URL_SAFE_NO_PAD.encode(identity.sign(claim.as_bytes()).to_bytes());

    Ok(SignedClaim {
        payload,
        claim,
        sig,
    })
}

/// Check a claim against `key` and decode its payload. This is what the
/// broker does; kept here so the format is tested from both ends.
pub fn verify_signed_claim(
    key: &VerifyingKey,
    claim: &str,
    sig: &str,
) -> Result<ClaimPayload, TunnelError> {
    let sig_bytes = URL_SAFE_NO_PAD
        .decode(sig)
        .map_err(|e| TunnelError::InvalidClaim(e.to_string()))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|e| TunnelError::InvalidClaim(e.to_string()))?;
    key.verify(claim.as_bytes(), &signature)
        .map_err(|e| TunnelError::InvalidClaim(e.to_string()))?;

    let json = URL_SAFE_NO_PAD
        .decode(claim)
        .map_err(|e| TunnelError::InvalidClaim(e.to_string()))?;
    Ok(serde_json::from_slice(&json)?)
}
