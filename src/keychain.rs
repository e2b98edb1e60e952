//! Keychain Adapter Module
//!
//! An opaque named-secret store (`available? / put / get / delete`, §4.2).
//! The host OS keychain is an external collaborator — this module defines
//! the contract the vault service programs against, an in-memory double for
//! tests, and a thin adapter onto the platform secret store for the cases
//! where a real backend is wired in.

use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::VaultCoreError;

/// Errors specific to the keychain boundary. `Unavailable` is the only
/// keychain error that is silently fallback-eligible (§7); every other
/// variant must reach the caller via [`VaultCoreError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeychainError {
    Unavailable,
    NotFound,
    Backend(String),
}

impl From<KeychainError> for VaultCoreError {
    fn from(err: KeychainError) -> Self {
        match err {
            KeychainError::Unavailable => VaultCoreError::KeychainUnavailable,
            KeychainError::NotFound => VaultCoreError::NotFound("keychain entry".to_string()),
            KeychainError::Backend(msg) => VaultCoreError::Permission(msg),
        }
    }
}

/// Capability seam over the platform secret store (§9 Design Notes).
pub trait KeychainProvider: Send + Sync {
    fn available(&self) -> bool;
    fn put(&self, name: &str, secret: &SecretString) -> Result<(), KeychainError>;
    fn get(&self, name: &str) -> Result<SecretString, KeychainError>;
    fn delete(&self, name: &str) -> Result<(), KeychainError>;
}

/// Derive a deterministic, collision-resistant keychain entry name from a
/// vault's absolute path and a purpose tag, so two vaults never share an
/// entry (§4.2).
pub fn entry_name(vault_path: &std::path::Path, purpose: &str) -> String {
    let digest = crate::crypto::hmac_sha256(b"pass-cli/keychain-entry", vault_path.to_string_lossy().as_bytes());
    format!("pass-cli:{purpose}:{}", hex_encode(&digest[..16]))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// In-memory keychain double. Used by tests and by callers that explicitly
/// disable OS keychain integration.
#[derive(Default)]
pub struct InMemoryKeychain {
    store: Mutex<HashMap<String, String>>,
}

impl InMemoryKeychain {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeychainProvider for InMemoryKeychain {
    fn available(&self) -> bool {
        true
    }

    fn put(&self, name: &str, secret: &SecretString) -> Result<(), KeychainError> {
        self.store
            .lock()
            .map_err(|_| KeychainError::Backend("lock poisoned".to_string()))?
            .insert(name.to_string(), secret.expose_secret().to_string());
        Ok(())
    }

    fn get(&self, name: &str) -> Result<SecretString, KeychainError> {
        let store = self.store.lock().map_err(|_| KeychainError::Backend("lock poisoned".to_string()))?;
        store
            .get(name)
            .map(|s| SecretString::from(s.clone()))
            .ok_or(KeychainError::NotFound)
    }

    fn delete(&self, name: &str) -> Result<(), KeychainError> {
        self.store
            .lock()
            .map_err(|_| KeychainError::Backend("lock poisoned".to_string()))?
            .remove(name);
        Ok(())
    }
}

/// A keychain that is always unavailable — the fallback-eligible default
/// when no backend was configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullKeychain;

impl KeychainProvider for NullKeychain {
    fn available(&self) -> bool {
        false
    }

    fn put(&self, _name: &str, _secret: &SecretString) -> Result<(), KeychainError> {
        Err(KeychainError::Unavailable)
    }

    fn get(&self, _name: &str) -> Result<SecretString, KeychainError> {
        Err(KeychainError::Unavailable)
    }

    fn delete(&self, _name: &str) -> Result<(), KeychainError> {
        Err(KeychainError::Unavailable)
    }
}

/// Adapter onto the platform secret store (macOS Keychain, Windows
/// Credential Manager, Secret Service on Linux) via the `keyring` crate.
/// Carries no vault-specific logic: it only maps the four trait methods
/// onto the backing store and translates its errors.
pub struct OsKeychain {
    service: String,
}

impl OsKeychain {
    pub fn new(service: impl Into<String>) -> Self {
        Self { service: service.into() }
    }

    fn entry(&self, name: &str) -> Result<keyring::Entry, KeychainError> {
        keyring::Entry::new(&self.service, name).map_err(|e| KeychainError::Backend(e.to_string()))
    }
}

impl KeychainProvider for OsKeychain {
    fn available(&self) -> bool {
        // Probing the backend is itself an operation that can fail on
        // headless hosts; a failed probe just means "treat as unavailable".
        keyring::Entry::new(&self.service, "pass-cli-probe").is_ok()
    }

    fn put(&self, name: &str, secret: &SecretString) -> Result<(), KeychainError> {
        self.entry(name)?
            .set_password(secret.expose_secret())
            .map_err(map_keyring_error)
    }

    fn get(&self, name: &str) -> Result<SecretString, KeychainError> {
        self.entry(name)?
            .get_password()
            .map(SecretString::from)
            .map_err(map_keyring_error)
    }

    fn delete(&self, name: &str) -> Result<(), KeychainError> {
        self.entry(name)?.delete_password().map_err(map_keyring_error)
    }
}

fn map_keyring_error(err: keyring::Error) -> KeychainError {
    match err {
        keyring::Error::NoEntry => KeychainError::NotFound,
        keyring::Error::NoStorageAccess(_) | keyring::Error::PlatformFailure(_) => KeychainError::Unavailable,
        other => KeychainError::Backend(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_put_get_delete_roundtrip() {
        let kc = InMemoryKeychain::new();
        let secret = SecretString::from("s3kret".to_string());
        kc.put("entry-a", &secret).unwrap();
        let back = kc.get("entry-a").unwrap();
        assert_eq!(back.expose_secret(), "s3kret");
        kc.delete("entry-a").unwrap();
        assert_eq!(kc.get("entry-a").unwrap_err(), KeychainError::NotFound);
    }

    #[test]
    fn null_keychain_is_always_unavailable() {
        let kc = NullKeychain;
        assert!(!kc.available());
        assert_eq!(kc.put("x", &SecretString::from("y".to_string())).unwrap_err(), KeychainError::Unavailable);
    }

    #[test]
    fn entry_names_are_distinct_per_vault_path() {
        let a = entry_name(std::path::Path::new("/home/alice/.pass-cli/vault.enc"), "password");
        let b = entry_name(std::path::Path::new("/home/bob/.pass-cli/vault.enc"), "password");
        assert_ne!(a, b);
    }

    #[test]
    fn entry_names_differ_per_purpose() {
        let path = std::path::Path::new("/home/alice/.pass-cli/vault.enc");
        let a = entry_name(path, "password");
        let b = entry_name(path, "audit-key");
        assert_ne!(a, b);
    }
}
