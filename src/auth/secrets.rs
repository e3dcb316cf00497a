//! Secure randomness and password hashing.
//!
//! Hashes are Argon2id PHC strings (`$argon2id$v=19$m=..,t=..,p=..$salt$hash`),
//! so the cost parameters travel with every stored hash and old hashes stay
//! verifiable after the defaults change.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use std::sync::OnceLock;

/// Salt byte length for password hashing.
const SALT_BYTES: usize = 16;

/// Derived key length embedded in each hash.
const OUTPUT_BYTES: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secure random source unavailable: {0}")]
    EntropyUnavailable(String),
    #[error("{0}")]
    Hashing(String),
}

/// Argon2id cost parameters used for new hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for HashParams {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 1,
            parallelism: 2,
        }
    }
}

/// Produces random material and hashes/verifies secrets.
#[derive(Debug)]
pub struct SecretProvider {
    params: HashParams,
    dummy_hash: OnceLock<Option<String>>,
}

impl Default for SecretProvider {
    fn default() -> Self {
        Self::new(HashParams::default())
    }
}

impl SecretProvider {
    pub fn new(params: HashParams) -> Self {
        Self {
            params,
            dummy_hash: OnceLock::new(),
        }
    }

    pub fn params(&self) -> HashParams {
        self.params
    }

    /// Fill `len` bytes from the OS CSPRNG.
    pub fn random_bytes(&self, len: usize) -> Result<Vec<u8>, SecretError> {
        let mut bytes = vec![0u8; len];
        rand::rngs::OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| SecretError::EntropyUnavailable(e.to_string()))?;
        Ok(bytes)
    }

    /// Hex-encoded random value of `byte_len` bytes (2 * `byte_len` chars).
    pub fn generate_random_token(&self, byte_len: usize) -> Result<String, SecretError> {
        let bytes = self.random_bytes(byte_len).inspect_err(|e| {
            tracing::error!("Unable to generate secure random bytes: {e}");
        })?;
        Ok(hex::encode(bytes))
    }

    /// Salted Argon2id hash of `plaintext` as a PHC string.
    pub fn hash_password(&self, plaintext: &str) -> Result<String, SecretError> {
        let salt_bytes = self.random_bytes(SALT_BYTES)?;
        let salt = SaltString::encode_b64(&salt_bytes)
            .map_err(|e| SecretError::Hashing(format!("salt encoding: {e}")))?;
        let phc = self
            .hasher()?
            .hash_password(plaintext.as_bytes(), &salt)
            .map_err(|e| {
                tracing::error!("Unable to hash credential: {e}");
                SecretError::Hashing(e.to_string())
            })?
            .to_string();
        Ok(phc)
    }

    /// `Ok(false)` on mismatch; `Err` only when `hash` is not a usable PHC string.
    pub fn verify_password(&self, plaintext: &str, hash: &str) -> Result<bool, SecretError> {
        let parsed = PasswordHash::new(hash)
            .map_err(|e| SecretError::Hashing(format!("malformed password hash: {e}")))?;
        // Parameters come from the PHC string, not from `self.params`.
        match Argon2::default().verify_password(plaintext.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => {
                tracing::error!("Unable to compare password hash: {e}");
                Err(SecretError::Hashing(e.to_string()))
            }
        }
    }

    /// Burn roughly one verification worth of CPU so that a lookup miss
    /// takes as long as a wrong password.
    pub fn dummy_verify(&self, plaintext: &str) {
        let dummy = self
            .dummy_hash
            .get_or_init(|| self.hash_password("llmpid-dummy-credential").ok());
        if let Some(hash) = dummy {
            let _ = self.verify_password(plaintext, hash);
        }
    }

    fn hasher(&self) -> Result<Argon2<'static>, SecretError> {
        let params = Params::new(
            self.params.memory_kib,
            self.params.iterations,
            self.params.parallelism,
            Some(OUTPUT_BYTES),
        )
        .map_err(|e| SecretError::Hashing(format!("invalid argon2 params: {e}")))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

#[cfg(test)]
pub(crate) fn fast_params() -> HashParams {
    HashParams {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
    }
}
