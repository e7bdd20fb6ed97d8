//! Password hashing and secret handling.
//!
//! The server never stores the access password. It stores a random
//! 64-byte salt and `SHA-512(salt || password)`, both hex-encoded in the
//! sysconfig file. Verification is constant-time.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of the password salt in bytes.
pub const SALT_LEN: usize = 64;

/// Length of a SHA-512 digest in bytes.
pub const HASH_LEN: usize = 64;

/// Minimum acceptable access password length when setting one.
pub const MIN_PASSWORD_LEN: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("{field} is not valid hex: {source}")]
    BadHex {
        field: &'static str,
        source: hex::FromHexError,
    },

    #[error("{field} must be {expected} bytes, got {got}")]
    BadLength {
        field: &'static str,
        expected: usize,
        got: usize,
    },
}

// ── Salted hashing ────────────────────────────────────────────────────

/// Generate a fresh random salt from the OS entropy source.
pub fn new_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// `SHA-512(salt || password)`.
pub fn hash_password(salt: &[u8; SALT_LEN], password: &str) -> [u8; HASH_LEN] {
    let mut hasher = Sha512::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

/// Constant-time check of a plaintext password against the stored hash.
pub fn verify_password(salt: &[u8; SALT_LEN], stored: &[u8; HASH_LEN], password: &str) -> bool {
    let computed = hash_password(salt, password);
    computed.ct_eq(stored).into()
}

/// Constant-time equality for two same-length byte strings. Used for the
/// admin shutdown challenge as well as password hashes.
pub fn ct_equal(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

// ── Hex forms for the sysconfig file ──────────────────────────────────

pub fn salt_from_hex(s: &str) -> Result<[u8; SALT_LEN], CryptoError> {
    fixed_from_hex("PASS_SALT", s)
}

pub fn hash_from_hex(s: &str) -> Result<[u8; HASH_LEN], CryptoError> {
    fixed_from_hex("PASS_HASH", s)
}

fn fixed_from_hex<const N: usize>(field: &'static str, s: &str) -> Result<[u8; N], CryptoError> {
    let bytes = hex::decode(s.trim()).map_err(|source| CryptoError::BadHex { field, source })?;
    let got = bytes.len();
    bytes.try_into().map_err(|_| CryptoError::BadLength {
        field,
        expected: N,
        got,
    })
}

// ── Key material ──────────────────────────────────────────────────────

/// Disk encryption keys are generated as 256-bit random strings, the
/// same size the KMIP backend creates for AES-256.
pub const KEY_LEN: usize = 32;

/// Owned key material that is wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyBuffer(Vec<u8>);

impl KeyBuffer {
    /// Generate fresh random key material.
    pub fn generate() -> Self {
        let mut buf = vec![0u8; KEY_LEN];
        OsRng.fill_bytes(&mut buf);
        KeyBuffer(buf)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        KeyBuffer(bytes)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// Key bytes must never end up in logs.
impl std::fmt::Debug for KeyBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyBuffer({} bytes)", self.0.len())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
