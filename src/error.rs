//! Unified Error Handling Module
//!
//! Provides typed errors for the vault core with user-friendly messages.
//! `BadPassword` and `CorruptVault` intentionally render identically so that
//! a caller-visible message never becomes a decryption oracle.

use std::fmt;
use std::io;

/// Top-level error type returned by every public vault-core operation.
#[derive(Debug)]
pub enum VaultCoreError {
    /// Wrong password, or a ciphertext that fails to authenticate. Never
    /// distinguished from `CorruptVault` in the `Display` impl.
    BadPassword,
    /// Master password does not meet the fixed policy check (§4.5).
    WeakPassword(String),
    /// A credential lookup failed.
    NotFound(String),
    /// A credential with this service name already exists.
    Duplicate(String),
    /// The vault file could not be parsed. Never distinguished from
    /// `BadPassword` in the `Display` impl.
    CorruptVault(String),
    /// The file declares a version newer than this build understands.
    UnsupportedVersion(u8),
    /// A vault already exists at the target path.
    VaultExists(String),
    /// Underlying filesystem error.
    Io(io::Error),
    /// Owner-only permissions could not be established or verified.
    Permission(String),
    /// A cryptographic primitive failed outside of authentication
    /// (construction errors, not a wrong password).
    Crypto(CryptoError),
    /// The OS keychain is not available on this host.
    KeychainUnavailable,
    /// Recovery was never configured for this vault.
    RecoveryDisabled,
    /// Challenge words did not reconstruct a valid wrapped key.
    RecoveryFailed,
    /// An operation was attempted while the vault service was not
    /// `Unlocked`.
    NotUnlocked,
    /// Caller-supplied argument failed a basic shape check.
    InvalidArgument(String),
}

/// Cryptographic primitive errors, opaque by design (§4.1).
#[derive(Debug, Clone)]
pub enum CryptoError {
    KeyDerivation(String),
    Encryption(String),
    Decryption,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::KeyDerivation(msg) => write!(f, "key derivation failed: {msg}"),
            CryptoError::Encryption(msg) => write!(f, "encryption failed: {msg}"),
            CryptoError::Decryption => write!(f, "decryption failed"),
        }
    }
}

impl std::error::Error for CryptoError {}

impl fmt::Display for VaultCoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Intentionally identical wording: do not give an attacker an
            // oracle for "wrong password" vs "corrupted file".
            VaultCoreError::BadPassword | VaultCoreError::CorruptVault(_) => {
                write!(f, "incorrect password or corrupted vault")
            }
            VaultCoreError::WeakPassword(msg) => write!(f, "password does not meet policy: {msg}"),
            VaultCoreError::NotFound(what) => write!(f, "not found: {what}"),
            VaultCoreError::Duplicate(service) => write!(f, "'{service}' already exists"),
            VaultCoreError::UnsupportedVersion(v) => write!(f, "unsupported vault format version {v}"),
            VaultCoreError::VaultExists(path) => write!(f, "a vault already exists at '{path}'"),
            VaultCoreError::Io(e) => write!(f, "I/O error: {e}"),
            VaultCoreError::Permission(msg) => write!(f, "permission error: {msg}"),
            VaultCoreError::Crypto(e) => write!(f, "{e}"),
            VaultCoreError::KeychainUnavailable => write!(f, "the OS keychain is unavailable"),
            VaultCoreError::RecoveryDisabled => write!(f, "recovery was not configured for this vault"),
            VaultCoreError::RecoveryFailed => write!(f, "recovery phrase did not match"),
            VaultCoreError::NotUnlocked => write!(f, "the vault is not unlocked"),
            VaultCoreError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
        }
    }
}

impl std::error::Error for VaultCoreError {}

impl From<io::Error> for VaultCoreError {
    fn from(err: io::Error) -> Self {
        VaultCoreError::Io(err)
    }
}

impl From<serde_json::Error> for VaultCoreError {
    fn from(err: serde_json::Error) -> Self {
        VaultCoreError::CorruptVault(err.to_string())
    }
}

impl From<CryptoError> for VaultCoreError {
    fn from(err: CryptoError) -> Self {
        match err {
            // A GCM tag mismatch during decryption is the storage engine's
            // definition of "wrong password" (§4.3 load/save contract).
            CryptoError::Decryption => VaultCoreError::BadPassword,
            other => VaultCoreError::Crypto(other),
        }
    }
}

/// Result type alias used throughout the crate.
pub type VaultResult<T> = Result<T, VaultCoreError>;
