//! Opaque token generation.
//!
//! Two variants with distinct trust levels:
//! - [`generate`] is fast and non-cryptographic, used for internal
//!   correlation ids (peer ids, transfer ids).
//! - [`generate_secure`] draws from the OS entropy source and is used for
//!   anything handed out as a bearer capability (session keys, file tokens,
//!   download/stream keys).

use crate::error::TokenError;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};

/// URL-safe alphabet, 64 characters so a random byte maps without bias.
const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Minimum accepted token length. Shorter tokens are guessable.
pub const MIN_LENGTH: usize = 8;

fn ensure_length(length: usize) -> Result<(), TokenError> {
    if length < MIN_LENGTH {
        return Err(TokenError::TooShort {
            requested: length,
            minimum: MIN_LENGTH,
        });
    }
    Ok(())
}

/// Generate a fast, non-cryptographic token.
///
/// Not suitable for capabilities; use [`generate_secure`] for those.
pub fn generate(length: usize) -> Result<String, TokenError> {
    ensure_length(length)?;
    let mut rng = rand::thread_rng();
    Ok((0..length)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect())
}

/// Generate a cryptographically unpredictable token.
///
/// Fails with [`TokenError::Entropy`] if the OS entropy source is
/// unavailable; callers must treat that as fatal for the request.
pub fn generate_secure(length: usize) -> Result<String, TokenError> {
    ensure_length(length)?;
    let mut buf = vec![0u8; length];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| TokenError::Entropy(e.to_string()))?;
    Ok(buf
        .iter()
        .map(|b| ALPHABET[(b & 63) as usize] as char)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_requested_length() {
        assert_eq!(generate(8).unwrap().len(), 8);
        assert_eq!(generate(64).unwrap().len(), 64);
        assert_eq!(generate_secure(16).unwrap().len(), 16);
    }

    #[test]
    fn rejects_short_lengths() {
        assert!(matches!(
            generate(7),
            Err(TokenError::TooShort { requested: 7, .. })
        ));
        assert!(matches!(generate_secure(0), Err(TokenError::TooShort { .. })));
        assert!(generate(MIN_LENGTH).is_ok());
    }

    #[test]
    fn uses_url_safe_alphabet() {
        let token = generate_secure(256).unwrap();
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn secure_tokens_are_distinct() {
        let a = generate_secure(32).unwrap();
        let b = generate_secure(32).unwrap();
        assert_ne!(a, b);
    }
}
