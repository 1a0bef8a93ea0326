//! PBKDF2-HMAC-SHA256 password store

use crate::security::{constant_time_eq, os_entropy, EntropyError, EntropySource};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Lowest accepted PBKDF2 iteration count
pub const MINIMUM_ITERATIONS: u16 = 4096;
/// Salt length in bytes
pub const SALT_LENGTH: usize = 64;
/// Derived hash length in bytes
pub const HASH_LENGTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum PasswordError {
    #[error("insufficient iterations: {given} is below the minimum of 4096")]
    InsufficientIterations { given: u16 },

    #[error(transparent)]
    InsufficientEntropy(#[from] EntropyError),

    #[error("no such identifier")]
    NoSuchIdentifier,

    #[error("bad password")]
    BadPassword,

    #[error("incorrect salt length: expected 64 bytes, got {0}")]
    IncorrectSaltLength(usize),

    #[error("incorrect hash length: expected 64 bytes, got {0}")]
    IncorrectHashLength(usize),
}

/// Something that can verify an identifier/password pair
pub trait PasswordChecker: Send + Sync {
    fn check_password(&self, identifier: &str, password: &str) -> Result<(), PasswordError>;
}

/// A salted PBKDF2 hash and the parameters used to compute it.
///
/// Serialises as `{"salt": <base64>, "iterations": <u16>, "hash": <base64>}`;
/// deserialisation enforces the same validation as [`Pbkdf2Hash::from_parts`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Pbkdf2HashRecord")]
pub struct Pbkdf2Hash {
    #[serde(with = "base64_bytes")]
    salt: Vec<u8>,
    iterations: u16,
    #[serde(with = "base64_bytes")]
    hash: Vec<u8>,
}

impl Pbkdf2Hash {
    /// Hash `password` with a fresh random salt
    pub fn new(
        password: &str,
        iterations: u16,
        entropy: &dyn EntropySource,
    ) -> Result<Self, PasswordError> {
        check_iterations(iterations)?;

        let mut salt = vec![0u8; SALT_LENGTH];
        entropy.fill(&mut salt)?;
        let hash = derive(password.as_bytes(), &salt, iterations);

        Ok(Self {
            salt,
            iterations,
            hash,
        })
    }

    /// Rebuild a hash record from stored parts
    pub fn from_parts(salt: Vec<u8>, iterations: u16, hash: Vec<u8>) -> Result<Self, PasswordError> {
        if salt.len() != SALT_LENGTH {
            return Err(PasswordError::IncorrectSaltLength(salt.len()));
        }
        if hash.len() != HASH_LENGTH {
            return Err(PasswordError::IncorrectHashLength(hash.len()));
        }
        check_iterations(iterations)?;

        Ok(Self {
            salt,
            iterations,
            hash,
        })
    }

    pub fn iterations(&self) -> u16 {
        self.iterations
    }

    /// Recompute the hash of `password` and compare in constant time
    pub fn verify(&self, password: &str) -> bool {
        let candidate = derive(password.as_bytes(), &self.salt, self.iterations);
        constant_time_eq(&candidate, &self.hash)
    }
}

impl fmt::Debug for Pbkdf2Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pbkdf2Hash")
            .field("iterations", &self.iterations)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct Pbkdf2HashRecord {
    #[serde(with = "base64_bytes")]
    salt: Vec<u8>,
    iterations: u16,
    #[serde(with = "base64_bytes")]
    hash: Vec<u8>,
}

impl TryFrom<Pbkdf2HashRecord> for Pbkdf2Hash {
    type Error = PasswordError;

    fn try_from(record: Pbkdf2HashRecord) -> Result<Self, Self::Error> {
        Pbkdf2Hash::from_parts(record.salt, record.iterations, record.hash)
    }
}

fn check_iterations(iterations: u16) -> Result<(), PasswordError> {
    if iterations < MINIMUM_ITERATIONS {
        return Err(PasswordError::InsufficientIterations { given: iterations });
    }
    Ok(())
}

fn derive(password: &[u8], salt: &[u8], iterations: u16) -> Vec<u8> {
    let mut out = vec![0u8; HASH_LENGTH];
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, u32::from(iterations), &mut out);
    out
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// In-memory identifier → hash store.
///
/// Writes happen at configuration time; checks take the read lock only long
/// enough to clone the record, so hashing runs unlocked.
pub struct InMemPwdStore {
    table: RwLock<HashMap<String, Pbkdf2Hash>>,
    entropy: Arc<dyn EntropySource>,
}

impl InMemPwdStore {
    pub fn new() -> Self {
        Self::with_entropy(os_entropy())
    }

    pub fn with_entropy(entropy: Arc<dyn EntropySource>) -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
            entropy,
        }
    }

    /// Hash and store `password` for `identifier`
    pub fn set_password(
        &self,
        identifier: impl Into<String>,
        password: &str,
        iterations: u16,
    ) -> Result<(), PasswordError> {
        let hash = Pbkdf2Hash::new(password, iterations, self.entropy.as_ref())?;
        self.table.write().insert(identifier.into(), hash);
        Ok(())
    }

    /// Store a precomputed hash, typically loaded from configuration
    pub fn set_hash(
        &self,
        identifier: impl Into<String>,
        salt: Vec<u8>,
        iterations: u16,
        hash: Vec<u8>,
    ) -> Result<(), PasswordError> {
        let hash = Pbkdf2Hash::from_parts(salt, iterations, hash)?;
        self.insert(identifier, hash);
        Ok(())
    }

    /// Store an already validated record
    pub fn insert(&self, identifier: impl Into<String>, hash: Pbkdf2Hash) {
        self.table.write().insert(identifier.into(), hash);
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.table.read().contains_key(identifier)
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }
}

impl Default for InMemPwdStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InMemPwdStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemPwdStore")
            .field("identifiers", &self.len())
            .finish()
    }
}

impl PasswordChecker for InMemPwdStore {
    fn check_password(&self, identifier: &str, password: &str) -> Result<(), PasswordError> {
        let record = self
            .table
            .read()
            .get(identifier)
            .cloned()
            .ok_or(PasswordError::NoSuchIdentifier)?;

        if record.verify(password) {
            Ok(())
        } else {
            Err(PasswordError::BadPassword)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::OsEntropy;

    #[derive(Debug)]
    struct FailingEntropy;

    impl EntropySource for FailingEntropy {
        fn fill(&self, _dest: &mut [u8]) -> Result<(), EntropyError> {
            Err(EntropyError::new("empty pool"))
        }
    }

    #[test]
    fn test_set_and_check_password() {
        let store = InMemPwdStore::new();
        store.set_password("testUser", "P@ssword1", 4096).unwrap();

        assert!(store.check_password("testUser", "P@ssword1").is_ok());
        assert!(matches!(
            store.check_password("testUser", "P@ssword2"),
            Err(PasswordError::BadPassword)
        ));
        assert!(matches!(
            store.check_password("nobody", "P@ssword1"),
            Err(PasswordError::NoSuchIdentifier)
        ));
    }

    #[test]
    fn test_insufficient_iterations() {
        let store = InMemPwdStore::new();
        let err = store.set_password("u", "pw", 4095).unwrap_err();
        assert!(matches!(err, PasswordError::InsufficientIterations { given: 4095 }));
        assert!(store.is_empty());
    }

    #[test]
    fn test_entropy_failure() {
        let store = InMemPwdStore::with_entropy(Arc::new(FailingEntropy));
        let err = store.set_password("u", "pw", 4096).unwrap_err();
        assert!(matches!(err, PasswordError::InsufficientEntropy(_)));
        assert!(!store.contains("u"));
    }

    #[test]
    fn test_set_hash_validation() {
        let store = InMemPwdStore::new();

        let err = store
            .set_hash("u", vec![0; 32], 4096, vec![0; HASH_LENGTH])
            .unwrap_err();
        assert!(matches!(err, PasswordError::IncorrectSaltLength(32)));

        let err = store
            .set_hash("u", vec![0; SALT_LENGTH], 4096, vec![0; 63])
            .unwrap_err();
        assert!(matches!(err, PasswordError::IncorrectHashLength(63)));

        let err = store
            .set_hash("u", vec![0; SALT_LENGTH], 1000, vec![0; HASH_LENGTH])
            .unwrap_err();
        assert!(matches!(err, PasswordError::InsufficientIterations { .. }));

        assert!(store.is_empty());
    }

    #[test]
    fn test_set_hash_then_check() {
        let hash = Pbkdf2Hash::new("hunter2", 4096, &OsEntropy).unwrap();
        let json = serde_json::to_value(&hash).unwrap();

        let store = InMemPwdStore::new();
        let loaded: Pbkdf2Hash = serde_json::from_value(json).unwrap();
        store.insert("alice", loaded);

        assert!(store.check_password("alice", "hunter2").is_ok());
        assert!(store.check_password("alice", "hunter3").is_err());
    }

    #[test]
    fn test_wire_format() {
        let hash = Pbkdf2Hash::new("pw", 5000, &OsEntropy).unwrap();
        let json = serde_json::to_value(&hash).unwrap();

        assert_eq!(json["iterations"], 5000);
        assert_eq!(json["salt"].as_str().unwrap().len(), 88);
        assert_eq!(json["hash"].as_str().unwrap().len(), 88);
    }

    #[test]
    fn test_deserialize_rejects_bad_records() {
        let short_salt = serde_json::json!({
            "salt": "AAAA",
            "iterations": 4096,
            "hash": "A".repeat(86) + "==",
        });
        assert!(serde_json::from_value::<Pbkdf2Hash>(short_salt).is_err());

        let too_many = serde_json::json!({
            "salt": "A".repeat(86) + "==",
            "iterations": 70000,
            "hash": "A".repeat(86) + "==",
        });
        assert!(serde_json::from_value::<Pbkdf2Hash>(too_many).is_err());

        let not_base64 = serde_json::json!({
            "salt": "!!!",
            "iterations": 4096,
            "hash": "A".repeat(86) + "==",
        });
        assert!(serde_json::from_value::<Pbkdf2Hash>(not_base64).is_err());
    }

    #[test]
    fn test_debug_hides_hash() {
        let hash = Pbkdf2Hash::new("pw", 4096, &OsEntropy).unwrap();
        let debug = format!("{:?}", hash);
        assert!(debug.contains("4096"));
        assert!(!debug.contains("salt"));
    }
}
