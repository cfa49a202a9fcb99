//! Bearer-token authentication
//!
//! RS256-signed JWTs for HTTP transports. The aggregator signs and validates
//! with a local RSA keypair; absence of a private key disables auth globally.
//! Verification runs on jsonwebtoken's `aws_lc_rs` backend; the `rsa` crate
//! is used only to mint a local keypair and derive its public half.

use std::path::Path;

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::settings::Settings;
use crate::{Error, Result};

/// Token issuer claim.
const ISSUER: &str = "magg";

/// Token audience claim.
const AUDIENCE: &str = "mcp";

/// Default token lifetime in seconds (one day).
const DEFAULT_TTL_SECS: u64 = 24 * 60 * 60;

/// RSA modulus size for generated keys.
const KEY_BITS: usize = 2048;

/// Claims carried in an aggregator token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Issuer; always `magg`.
    pub iss: String,
    /// Audience.
    pub aud: String,
    /// Subject (client identity).
    pub sub: String,
    /// Issued-at (Unix timestamp).
    pub iat: u64,
    /// Expiry (Unix timestamp), validated by jsonwebtoken.
    pub exp: u64,
    /// Informational scopes; not enforced by the aggregator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
}

/// Signs and validates bearer tokens.
pub struct Authenticator {
    encoding: EncodingKey,
    decoding: DecodingKey,
    public_pem: String,
}

impl Authenticator {
    /// Build from settings: `MAGG_PRIVATE_KEY` overrides the key file. No
    /// key material means auth is disabled (`Ok(None)`).
    ///
    /// # Errors
    ///
    /// Returns an auth error for unreadable or world-accessible key files
    /// and for malformed PEM material.
    pub fn from_settings(settings: &Settings) -> Result<Option<Self>> {
        let pem = match &settings.private_key {
            Some(pem) if !pem.is_empty() => pem.clone(),
            _ => {
                let path = settings.private_key_path();
                if !path.exists() {
                    return Ok(None);
                }
                check_key_permissions(&path)?;
                std::fs::read_to_string(&path)
                    .map_err(|e| Error::Auth(format!("cannot read {}: {e}", path.display())))?
            }
        };

        Self::from_private_pem(&pem).map(Some)
    }

    /// Build from a private-key PEM string.
    ///
    /// # Errors
    ///
    /// Returns an auth error when the PEM does not parse as an RSA key.
    pub fn from_private_pem(pem: &str) -> Result<Self> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| Error::Auth(format!("invalid private key: {e}")))?;
        let public_pem = RsaPublicKey::from(&private)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::Auth(format!("cannot derive public key: {e}")))?;

        let encoding = EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| Error::Auth(format!("invalid signing key: {e}")))?;
        let decoding = DecodingKey::from_rsa_pem(public_pem.as_bytes())
            .map_err(|e| Error::Auth(format!("invalid verification key: {e}")))?;

        Ok(Self {
            encoding,
            decoding,
            public_pem,
        })
    }

    /// Issue a token for `sub`.
    ///
    /// # Errors
    ///
    /// Returns an auth error when signing fails.
    pub fn issue(&self, sub: &str, ttl_secs: Option<u64>, scopes: Option<Vec<String>>) -> Result<String> {
        let now = unix_now();
        let claims = Claims {
            iss: ISSUER.to_string(),
            aud: AUDIENCE.to_string(),
            sub: sub.to_string(),
            iat: now,
            exp: now + ttl_secs.unwrap_or(DEFAULT_TTL_SECS),
            scopes,
        };
        encode(&Header::new(Algorithm::RS256), &claims, &self.encoding)
            .map_err(|e| Error::Auth(format!("token signing failed: {e}")))
    }

    /// Validate a bearer token and return its claims.
    ///
    /// # Errors
    ///
    /// Returns an auth error for bad signatures, expiry, or wrong
    /// issuer/audience.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[ISSUER]);
        validation.set_audience(&[AUDIENCE]);
        validation.leeway = 60;

        let data = decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|e| Error::Auth(format!("token rejected: {e}")))?;
        Ok(data.claims)
    }

    /// Validate an `Authorization` header value. The core consumes the
    /// resulting boolean: `Ok` means the request is authenticated.
    ///
    /// # Errors
    ///
    /// Returns an auth error for a missing or malformed header, or an
    /// invalid token.
    pub fn authorize(&self, header: Option<&str>) -> Result<Claims> {
        let header = header.ok_or_else(|| Error::Auth("missing Authorization header".into()))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| Error::Auth("expected Bearer scheme".into()))?;
        self.verify(token)
    }

    /// Public key PEM for external verifiers.
    #[must_use]
    pub fn public_key_pem(&self) -> &str {
        &self.public_pem
    }
}

/// Generate an RSA keypair and write the private key (owner read/write
/// only) plus its `.pub` sibling.
///
/// # Errors
///
/// Returns an auth error when generation fails and IO errors from writing.
pub fn generate_keypair(path: &Path) -> Result<String> {
    let mut rng = rand::thread_rng();
    let private = RsaPrivateKey::new(&mut rng, KEY_BITS)
        .map_err(|e| Error::Auth(format!("key generation failed: {e}")))?;

    let private_pem = private
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| Error::Auth(format!("key encoding failed: {e}")))?;
    let public_pem = RsaPublicKey::from(&private)
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| Error::Auth(format!("key encoding failed: {e}")))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, private_pem.as_bytes())?;
    restrict_key_permissions(path)?;
    std::fs::write(path.with_extension("key.pub"), public_pem.as_bytes())?;

    info!(path = %path.display(), "Generated RSA keypair");
    Ok(public_pem)
}

#[cfg(unix)]
fn restrict_key_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_key_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn check_key_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(path)?.permissions().mode();
    if mode & 0o077 != 0 {
        warn!(path = %path.display(), mode = format!("{:o}", mode & 0o777), "Private key is group/world accessible");
        return Err(Error::Auth(format!(
            "{} must be readable by its owner only (chmod 600)",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_key_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
