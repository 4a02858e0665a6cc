use rand::Rng;
use subtle::ConstantTimeEq;

use crate::Result;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use sha2::{Digest, Sha256};

/// Credential lookup key length.
pub const KEY_LEN: usize = 64;
/// Session bearer token length.
pub const SESSION_TOKEN_LEN: usize = 128;
/// Device agent-channel token length.
pub const DEVICE_TOKEN_LEN: usize = 48;

/// How a stored hash matched the provided secret.
pub enum TokenMatch {
    /// Matched an argon2 hash.
    Argon2,
    /// Matched the legacy SHA-256 hash (no pepper).
    Legacy,
}

/// Generate a random alphanumeric secret of the given length.
pub fn generate_secret(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

/// Generate a credential lookup key.
pub fn generate_key() -> String {
    generate_secret(KEY_LEN)
}

/// Generate a session bearer token.
pub fn generate_session_token() -> String {
    generate_secret(SESSION_TOKEN_LEN)
}

/// Generate a device agent-channel token.
pub fn generate_device_token() -> String {
    generate_secret(DEVICE_TOKEN_LEN)
}

/// Hash a secret using argon2id and a pepper.
pub fn hash_secret(secret: &str, pepper: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let password = format!("{secret}{pepper}");
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow::anyhow!("failed to hash secret: {}", err))?
        .to_string())
}

/// Try to match a provided secret against the stored hash.
pub fn match_secret(secret: &str, stored_hash: &str, pepper: &str) -> Result<Option<TokenMatch>> {
    if verify_argon2(secret, stored_hash, pepper)? {
        return Ok(Some(TokenMatch::Argon2));
    }

    if verify_legacy(secret, stored_hash) {
        return Ok(Some(TokenMatch::Legacy));
    }

    Ok(None)
}

/// Deterministic session-token digest used as the sessions primary key.
/// Sessions are looked up by token, so the stored form must be derivable
/// from the token alone.
pub fn session_token_digest(token: &str, pepper: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.update(pepper.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Legacy SHA-256 hashing used before argon2 support.
pub fn legacy_hash(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn verify_argon2(secret: &str, stored_hash: &str, pepper: &str) -> Result<bool> {
    let password = format!("{secret}{pepper}");
    let Ok(password_hash) = PasswordHash::new(stored_hash) else {
        return Ok(false);
    };

    let result = Argon2::default()
        .verify_password(password.as_bytes(), &password_hash)
        .map(|_| true)
        .unwrap_or_else(|_| false);

    Ok(result)
}

fn verify_legacy(secret: &str, stored_hash: &str) -> bool {
    let expected = legacy_hash(secret);
    expected.len() == stored_hash.len()
        && expected.as_bytes().ct_eq(stored_hash.as_bytes()).into()
}

/// Constant-time equality for fixed configuration secrets.
pub fn fixed_eq(left: &str, right: &str) -> bool {
    left.len() == right.len() && left.as_bytes().ct_eq(right.as_bytes()).into()
}
