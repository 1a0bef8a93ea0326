//! Randomness and comparison primitives shared by the session, login and
//! password components.

use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// The random source could not produce the requested bytes
#[derive(Debug, Clone, thiserror::Error)]
#[error("insufficient entropy: {message}")]
pub struct EntropyError {
    message: String,
}

impl EntropyError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A cryptographic random source.
///
/// Components draw through this trait instead of calling the OS RNG directly,
/// which lets tests substitute a source that fails on demand.
pub trait EntropySource: Send + Sync + fmt::Debug {
    /// Fill `dest` entirely with random bytes.
    fn fill(&self, dest: &mut [u8]) -> Result<(), EntropyError>;
}

/// The operating system's CSPRNG
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill(&self, dest: &mut [u8]) -> Result<(), EntropyError> {
        OsRng
            .try_fill_bytes(dest)
            .map_err(|e| EntropyError::new(e.to_string()))
    }
}

/// Shared handle to the OS random source
pub fn os_entropy() -> Arc<dyn EntropySource> {
    Arc::new(OsEntropy)
}

/// Draw `len` random bytes and return them hex encoded (`2 * len` chars).
pub fn random_hex(source: &dyn EntropySource, len: usize) -> Result<String, EntropyError> {
    let mut buf = vec![0u8; len];
    source.fill(&mut buf)?;
    Ok(hex::encode(buf))
}

/// Compare two byte strings without leaking the position of the first
/// difference. Buffers of different lengths are never equal.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_hex_length() {
        let token = random_hex(&OsEntropy, 32).unwrap();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_random_hex_differs() {
        let a = random_hex(&OsEntropy, 16).unwrap();
        let b = random_hex(&OsEntropy, 16).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_entropy_error_message() {
        let err = EntropyError::new("device unavailable");
        assert_eq!(err.to_string(), "insufficient entropy: device unavailable");
    }
}
