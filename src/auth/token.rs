//! Signed bearer tokens (compact JWS, HS256).
//!
//! Wire format: `base64url(header).base64url(claims).base64url(signature)`,
//! no padding, HMAC-SHA256 over the first two segments. Validation here is
//! purely structural and cryptographic; whether the token's session is
//! still live is the session registry's business.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::role::Role;

type HmacSha256 = Hmac<Sha256>;

/// `iss` claim for every token this service mints.
pub const TOKEN_ISSUER: &str = "llmpid-api-service";

/// The only accepted `alg` header value.
pub const TOKEN_ALGORITHM: &str = "HS256";

/// Minimum signing key length in bytes.
pub const MIN_KEY_BYTES: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("token has expired")]
    Expired,
    #[error("token is not yet valid")]
    NotYetValid,
    #[error("invalid token issuer: {0}")]
    InvalidIssuer(String),
    #[error("token ttl must be positive")]
    InvalidTtl,
    #[error("signing key must be at least {MIN_KEY_BYTES} bytes")]
    WeakKey,
    #[error("signing key is not valid hex")]
    KeyEncoding,
    #[error("claims encoding failed: {0}")]
    Encoding(String),
}

/// Symmetric signing secret. Never printed.
#[derive(Clone)]
pub struct SigningKey(Vec<u8>);

impl SigningKey {
    pub fn new(bytes: Vec<u8>) -> Result<Self, TokenError> {
        if bytes.len() < MIN_KEY_BYTES {
            return Err(TokenError::WeakKey);
        }
        Ok(Self(bytes))
    }

    pub fn from_hex(encoded: &str) -> Result<Self, TokenError> {
        let bytes = hex::decode(encoded.trim()).map_err(|_| TokenError::KeyEncoding)?;
        Self::new(bytes)
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningKey([redacted; {} bytes])", self.0.len())
    }
}

/// Typed replacement for an open claim map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimData {
    pub role: Role,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub session_id: String,
    pub data: ClaimData,
    pub iss: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    #[serde(default)]
    typ: Option<String>,
}

/// A freshly minted token together with the claims it carries.
#[derive(Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claims: Claims,
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("token", &"[redacted]")
            .field("claims", &self.claims)
            .finish()
    }
}

/// `hex(sha256(username ‖ "-" ‖ id))`: a stable pseudonym for an identity
/// that never exposes the raw username in `sub`.
pub fn derive_subject(username: &str, identity_id: i64) -> String {
    let digest = Sha256::digest(format!("{username}-{identity_id}").as_bytes());
    hex::encode(digest)
}

/// Mints and checks tokens with one injected key.
#[derive(Debug)]
pub struct TokenIssuer {
    key: SigningKey,
}

impl TokenIssuer {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    pub fn issue_token(
        &self,
        username: &str,
        subject: &str,
        role: Role,
        session_id: &str,
        ttl_minutes: i64,
    ) -> Result<IssuedToken, TokenError> {
        if ttl_minutes <= 0 {
            return Err(TokenError::InvalidTtl);
        }
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: subject.to_string(),
            session_id: session_id.to_string(),
            data: ClaimData {
                role,
                username: username.to_string(),
            },
            iss: TOKEN_ISSUER.to_string(),
            iat: now,
            nbf: now,
            exp: now.saturating_add(ttl_minutes.saturating_mul(60)),
        };
        let token = self.sign_claims(&claims)?;
        Ok(IssuedToken { token, claims })
    }

    /// Serialize and sign arbitrary claims. No validation is applied.
    pub fn sign_claims(&self, claims: &Claims) -> Result<String, TokenError> {
        let header = Header {
            alg: TOKEN_ALGORITHM.to_string(),
            typ: Some("JWT".to_string()),
        };
        let header_json =
            serde_json::to_vec(&header).map_err(|e| TokenError::Encoding(e.to_string()))?;
        let claims_json =
            serde_json::to_vec(claims).map_err(|e| TokenError::Encoding(e.to_string()))?;
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header_json),
            URL_SAFE_NO_PAD.encode(claims_json)
        );
        let signature = self.mac(signing_input.as_bytes())?.finalize().into_bytes();
        Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature)))
    }

    /// Check algorithm, signature, validity window and issuer, in that order.
    pub fn validate_token(&self, token: &str) -> Result<Claims, TokenError> {
        let mut parts = token.split('.');
        let (Some(header_b64), Some(claims_b64), Some(signature_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed);
        };

        let header_json = URL_SAFE_NO_PAD
            .decode(header_b64)
            .map_err(|_| TokenError::Malformed)?;
        let header: Header =
            serde_json::from_slice(&header_json).map_err(|_| TokenError::Malformed)?;
        if header.alg != TOKEN_ALGORITHM {
            return Err(TokenError::UnsupportedAlgorithm(header.alg));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| TokenError::InvalidSignature)?;
        let signing_input_len = header_b64.len() + 1 + claims_b64.len();
        self.mac(&token.as_bytes()[..signing_input_len])?
            .verify_slice(&signature)
            .map_err(|_| TokenError::InvalidSignature)?;

        let claims_json = URL_SAFE_NO_PAD
            .decode(claims_b64)
            .map_err(|_| TokenError::Malformed)?;
        let claims: Claims =
            serde_json::from_slice(&claims_json).map_err(|_| TokenError::Malformed)?;

        let now = chrono::Utc::now().timestamp();
        if claims.exp <= now {
            tracing::debug!("Rejected expired token");
            return Err(TokenError::Expired);
        }
        if claims.nbf > now {
            return Err(TokenError::NotYetValid);
        }
        if claims.iss != TOKEN_ISSUER {
            tracing::info!(issuer = %claims.iss, "Rejected token with foreign issuer");
            return Err(TokenError::InvalidIssuer(claims.iss));
        }
        Ok(claims)
    }

    fn mac(&self, input: &[u8]) -> Result<HmacSha256, TokenError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.key.as_bytes())
            .map_err(|_| TokenError::WeakKey)?;
        mac.update(input);
        Ok(mac)
    }
}
