//! Vault Data Model
//!
//! The plaintext structures sealed inside the vault payload (§4.4): a
//! `Credential` per service, keyed by service name, plus a per-credential
//! usage ledger. None of these types are ever serialized on their own —
//! only as the payload `storage` encrypts and `audit` never sees.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::crypto::NONCE_LEN;

/// Current in-memory data model version. Bumped whenever a field is added
/// or removed in a way that needs an explicit migration in [`crate::storage`].
pub const VAULT_DATA_VERSION: u8 = 1;

/// A single stored credential.
///
/// `service` is the map key in [`VaultData::credentials`] and is therefore
/// not duplicated here; everything else travels with the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: SecretString,
    pub category: Option<String>,
    pub url: Option<String>,
    pub notes: Option<String>,
    /// Present only when TOTP has been configured for this credential.
    pub totp: Option<TotpConfig>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Keyed by an opaque location identifier (working directory path,
    /// optionally salted with a detected VCS remote) — never by raw
    /// absolute path alone, so the usage ledger cannot be used to
    /// reconstruct a user's full filesystem layout from the vault file.
    #[serde(default)]
    pub usage: BTreeMap<String, UsageRecord>,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: SecretString, now: DateTime<Utc>) -> Self {
        Self {
            username: username.into(),
            password,
            category: None,
            url: None,
            notes: None,
            totp: None,
            created_at: now,
            updated_at: now,
            usage: BTreeMap::new(),
        }
    }

    /// Invariant (§4.4): a TOTP secret, if present, is never empty.
    pub fn is_valid(&self) -> bool {
        match &self.totp {
            Some(totp) => !secrecy::ExposeSecret::expose_secret(&totp.secret).is_empty(),
            None => true,
        }
    }
}

/// TOTP parameters for a credential, stored so a caller can generate codes
/// without guessing the issuer's algorithm/digit/period choices. The vault
/// core never generates a code itself (§1 Non-goals) — this is storage only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TotpConfig {
    pub secret: SecretString,
    #[serde(default = "TotpConfig::default_algorithm")]
    pub algorithm: String,
    #[serde(default = "TotpConfig::default_digits")]
    pub digits: u32,
    #[serde(default = "TotpConfig::default_period")]
    pub period: u32,
    pub issuer: Option<String>,
}

impl TotpConfig {
    pub fn new(secret: SecretString) -> Self {
        Self { secret, algorithm: Self::default_algorithm(), digits: Self::default_digits(), period: Self::default_period(), issuer: None }
    }

    fn default_algorithm() -> String {
        "SHA1".to_string()
    }
    fn default_digits() -> u32 {
        6
    }
    fn default_period() -> u32 {
        30
    }
}

/// Tracks how often and where a credential has been accessed, without ever
/// recording *which* field was read beyond a per-field counter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageRecord {
    pub location_key: String,
    pub git_repo: Option<String>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub access_count: u64,
    #[serde(default)]
    pub field_access: BTreeMap<String, u64>,
}

impl UsageRecord {
    pub fn new(location_key: impl Into<String>, git_repo: Option<String>) -> Self {
        Self { location_key: location_key.into(), git_repo, last_accessed_at: None, access_count: 0, field_access: BTreeMap::new() }
    }

    /// Monotonic bump: never decreases `access_count`, never moves
    /// `last_accessed_at` backwards (§8 Testable Properties).
    pub fn record_access(&mut self, field: &str, at: DateTime<Utc>) {
        self.access_count += 1;
        if self.last_accessed_at.map(|prev| at >= prev).unwrap_or(true) {
            self.last_accessed_at = Some(at);
        }
        *self.field_access.entry(field.to_string()).or_insert(0) += 1;
    }
}

/// The full plaintext payload sealed inside a vault file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultData {
    pub version: u8,
    pub credentials: BTreeMap<String, Credential>,
}

impl VaultData {
    pub fn new() -> Self {
        Self { version: VAULT_DATA_VERSION, credentials: BTreeMap::new() }
    }

    /// Invariant (§4.4): service names are unique, which `BTreeMap` already
    /// guarantees structurally; this additionally checks every credential's
    /// own shape invariant.
    pub fn is_valid(&self) -> bool {
        self.credentials.values().all(Credential::is_valid)
    }
}

impl Default for VaultData {
    fn default() -> Self {
        Self::new()
    }
}

/// Describes whether and how mnemonic-phrase recovery was configured for a
/// vault, persisted alongside (but never inside) the encrypted payload so
/// that `unlock` can tell whether recovery is offered without first
/// decrypting anything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryDescriptor {
    /// Whether recovery is configured for this vault at all.
    pub enabled: bool,
    /// Whether `unwrap_with_challenge_words` additionally requires a 25th-word
    /// passphrase on top of the challenge words (§4.4, §4.7).
    pub passphrase_required: bool,
    /// Indices (0-23) of the words the holder will be challenged on, chosen
    /// once at setup time and fixed thereafter.
    pub challenge_positions: Vec<u8>,
    /// Salt for the recovery KEK derivation (`salt_for_recovery_kek`, §3).
    pub salt: Vec<u8>,
    /// PBKDF2 iteration count for the recovery KEK (`kdf_params`, §3).
    pub iterations: u32,
    /// Salt for the per-word HMAC commitments below, independent of `salt`
    /// (which keys the PBKDF2 derivation, not the commitments).
    pub commitment_salt: Vec<u8>,
    /// HMAC-SHA256(commitment_salt, word) for every position NOT in
    /// `challenge_positions`, keyed by position, so recovery can brute-force
    /// each of those 18 words against the fixed BIP39 wordlist instead of
    /// requiring the holder to retype them (§4.7).
    pub word_commitments: Vec<(u8, [u8; 32])>,
    /// The vault key, AEAD-sealed under the recovery KEK (§3
    /// `wrapped_key_ciphertext`).
    pub wrapped_key_ciphertext: Vec<u8>,
    /// Nonce used to seal `wrapped_key_ciphertext` (§3 `wrapped_key_nonce`).
    pub wrapped_key_nonce: [u8; NONCE_LEN],
}

/// Non-secret metadata describing a vault, readable without unlocking it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultMetadata {
    pub keychain_enabled: bool,
    pub audit_enabled: bool,
    pub recovery: Option<RecoveryDescriptor>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn now() -> DateTime<Utc> {
        "2024-01-01T00:00:00Z".parse().unwrap()
    }

    #[test]
    fn credential_with_no_totp_is_valid() {
        let c = Credential::new("alice", SecretString::from("hunter2".to_string()), now());
        assert!(c.is_valid());
    }

    #[test]
    fn credential_with_empty_totp_is_invalid() {
        let mut c = Credential::new("alice", SecretString::from("hunter2".to_string()), now());
        c.totp = Some(TotpConfig::new(SecretString::from(String::new())));
        assert!(!c.is_valid());
    }

    #[test]
    fn credential_with_totp_configured_is_valid() {
        let mut c = Credential::new("alice", SecretString::from("hunter2".to_string()), now());
        c.totp = Some(TotpConfig::new(SecretString::from("JBSWY3DPEHPK3PXP".to_string())));
        assert!(c.is_valid());
        assert_eq!(c.totp.as_ref().unwrap().digits, 6);
    }

    #[test]
    fn usage_record_access_count_is_monotonic() {
        let mut usage = UsageRecord::new("proj-a", None);
        let t0 = now();
        usage.record_access("password", t0);
        usage.record_access("username", t0 + chrono::Duration::seconds(1));
        assert_eq!(usage.access_count, 2);
        assert_eq!(usage.field_access.get("password"), Some(&1));
        assert_eq!(usage.last_accessed_at, Some(t0 + chrono::Duration::seconds(1)));
    }

    #[test]
    fn usage_record_does_not_move_last_accessed_backwards() {
        let mut usage = UsageRecord::new("proj-a", None);
        let t0 = now();
        usage.record_access("password", t0 + chrono::Duration::seconds(10));
        usage.record_access("password", t0);
        assert_eq!(usage.last_accessed_at, Some(t0 + chrono::Duration::seconds(10)));
        assert_eq!(usage.access_count, 2);
    }

    #[test]
    fn vault_data_starts_empty_and_valid() {
        let data = VaultData::new();
        assert!(data.credentials.is_empty());
        assert!(data.is_valid());
    }
}
