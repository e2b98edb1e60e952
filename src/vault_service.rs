//! Vault Service — the single orchestrator
//!
//! Owns the `Uninitialized -> Locked -> Unlocked -> Locked` state machine
//! (§4.5), exclusively serializes every mutation, and is the only module
//! that touches more than one of `crypto`, `storage`, `recovery`,
//! `keychain`, and `audit` at a time. Generalizes the unified-API-surface
//! shape of `PassmanCore` plus the lockout/failed-attempt bookkeeping of a
//! session wrapper onto capability-seam traits so every dependency can be
//! swapped for a test double.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use secrecy::{ExposeSecret, SecretString};

use crate::audit::{AuditAction, AuditLog};
use crate::clock::{Clock, IndexRng};
use crate::config::Config;
use crate::crypto::{CryptoProvider, KEY_LEN, NONCE_LEN};
use crate::error::{VaultCoreError, VaultResult};
use crate::keychain::{self, KeychainProvider};
use crate::model::{Credential, UsageRecord, VaultData, VaultMetadata};
use crate::recovery::{self, RecoverySetup};
use crate::storage::{self, FORMAT_V2};

/// Lifecycle state of a vault service instance (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    Locked,
    Unlocked,
}

struct UnlockedState {
    vault_key: [u8; KEY_LEN],
    data: VaultData,
}

struct LockoutState {
    failed_attempts: u32,
    lockout_until: Option<chrono::DateTime<chrono::Utc>>,
}

impl Default for LockoutState {
    fn default() -> Self {
        Self { failed_attempts: 0, lockout_until: None }
    }
}

/// Draw a fresh AEAD nonce through the injected [`CryptoProvider`], rather
/// than the free function in `crypto`, so tests can still substitute a
/// fixed nonce.
fn fresh_nonce(crypto: &dyn CryptoProvider) -> [u8; NONCE_LEN] {
    let bytes = crypto.random_bytes(NONCE_LEN);
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&bytes);
    nonce
}

/// The vault service. One instance owns one vault file and serializes all
/// access to it through `&mut self`; callers needing concurrent access from
/// multiple threads wrap it in their own `Mutex` (§4.5: single exclusive
/// lock, not an ambient global singleton).
pub struct VaultService {
    path: PathBuf,
    config: Config,
    crypto: Box<dyn CryptoProvider>,
    keychain: Box<dyn KeychainProvider>,
    clock: Box<dyn Clock>,
    rng: Box<dyn IndexRng>,
    audit: Mutex<Option<AuditLog>>,
    lockout: LockoutState,
    unlocked: Option<UnlockedState>,
}

impl VaultService {
    pub fn new(
        path: impl Into<PathBuf>,
        config: Config,
        crypto: Box<dyn CryptoProvider>,
        keychain: Box<dyn KeychainProvider>,
        clock: Box<dyn Clock>,
        rng: Box<dyn IndexRng>,
    ) -> Self {
        Self {
            path: path.into(),
            config,
            crypto,
            keychain,
            clock,
            rng,
            audit: Mutex::new(None),
            lockout: LockoutState::default(),
            unlocked: None,
        }
    }

    pub fn state(&self) -> State {
        if self.unlocked.is_some() {
            State::Unlocked
        } else if self.path.exists() {
            State::Locked
        } else {
            State::Uninitialized
        }
    }

    fn metadata_path(&self) -> PathBuf {
        self.path.with_extension("meta.json")
    }

    fn require_unlocked(&mut self) -> VaultResult<&mut UnlockedState> {
        self.unlocked.as_mut().ok_or(VaultCoreError::NotUnlocked)
    }

    fn audit_log(&self) -> std::sync::MutexGuard<'_, Option<AuditLog>> {
        let mut guard = self.audit.lock().expect("audit mutex poisoned");
        if guard.is_none() {
            if let Ok(log) = AuditLog::open(Config::audit_log_path(), self.audit_chain_key()) {
                *guard = Some(log);
            }
        }
        guard
    }

    fn audit_chain_key(&self) -> [u8; 32] {
        // Derived deterministically from the vault's path so verification
        // can be done offline without needing the vault key itself — the
        // audit log must stay readable even while the vault is locked.
        self.crypto.hmac_sha256(b"pass-cli/audit-chain", self.path.to_string_lossy().as_bytes())
    }

    fn record_audit(&self, action: AuditAction, service: Option<&str>, success: bool) {
        if !self.config.security.audit_enabled {
            return;
        }
        let now = self.clock.now();
        if let Some(log) = self.audit_log().as_ref() {
            log.record(action, service, success, now);
        }
    }

    /// True once an append has failed and the audit chain can no longer be
    /// trusted as complete — the vault service surfaces this but never lets
    /// it block a write (§4.6).
    pub fn audit_degraded(&self) -> bool {
        self.audit_log().as_ref().map(|l| l.is_degraded()).unwrap_or(false)
    }

    fn check_lockout(&self) -> VaultResult<()> {
        if let Some(until) = self.lockout.lockout_until {
            if self.clock.now() < until {
                return Err(VaultCoreError::InvalidArgument(format!(
                    "too many failed attempts, locked out until {until}"
                )));
            }
        }
        Ok(())
    }

    fn record_failed_unlock(&mut self) {
        self.lockout.failed_attempts += 1;
        if self.lockout.failed_attempts >= self.config.security.max_failed_attempts {
            let backoff = chrono::Duration::seconds(30 * 2i64.pow(self.lockout.failed_attempts - self.config.security.max_failed_attempts));
            self.lockout.lockout_until = Some(self.clock.now() + backoff);
        }
    }

    fn record_successful_unlock(&mut self) {
        self.lockout.failed_attempts = 0;
        self.lockout.lockout_until = None;
    }

    // ---- Lifecycle ----

    /// Initialize a brand-new vault, v1 format (password directly derives
    /// the vault key, no separate wrapped-key block). Exists mainly so the
    /// migration tests have a v1 fixture to migrate from; new vaults should
    /// normally go through [`Self::initialize`].
    pub fn initialize_v1(&mut self, master_password: &SecretString) -> VaultResult<()> {
        if self.path.exists() {
            return Err(VaultCoreError::VaultExists(self.path.display().to_string()));
        }
        self.validate_password(master_password)?;

        let salt = self.random_salt();
        let vault_key = self.crypto.derive_kek(master_password.expose_secret().as_bytes(), &salt, crate::crypto::MIN_WRITE_ITERATIONS);

        let data = VaultData::new();
        let plaintext = serde_json::to_vec(&data).map_err(|e| VaultCoreError::Io(std::io::Error::other(e)))?;
        storage::write_vault(&self.path, storage::FORMAT_V1, &salt, None, &vault_key, &plaintext)?;

        self.write_metadata(&VaultMetadata { keychain_enabled: false, audit_enabled: self.config.security.audit_enabled, recovery: None, created_at: self.clock.now() })?;
        self.unlocked = Some(UnlockedState { vault_key, data });
        self.record_audit(AuditAction::Initialize, None, true);
        Ok(())
    }

    fn random_salt(&self) -> [u8; storage::SALT_LEN] {
        let bytes = self.crypto.random_bytes(storage::SALT_LEN);
        let mut salt = [0u8; storage::SALT_LEN];
        salt.copy_from_slice(&bytes);
        salt
    }

    /// Wrap `vault_key` under `kek` through the injected [`CryptoProvider`],
    /// producing the `nonce || ciphertext || tag` block `storage::write_vault`
    /// expects for a v2 vault's wrapped-key field.
    fn wrap_vault_key(&self, vault_key: &[u8; KEY_LEN], kek: &[u8; KEY_LEN]) -> VaultResult<Vec<u8>> {
        let nonce = fresh_nonce(self.crypto.as_ref());
        let ciphertext = self.crypto.aead_seal(kek, &nonce, vault_key, storage::MAGIC)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Unwrap a v2 wrapped-key block under `kek` through the injected
    /// [`CryptoProvider`]. A wrong KEK is reported as [`VaultCoreError::BadPassword`].
    fn unwrap_vault_key(&self, wrapped: &[u8], kek: &[u8; KEY_LEN]) -> VaultResult<[u8; KEY_LEN]> {
        if wrapped.len() != storage::WRAPPED_KEY_LEN {
            return Err(VaultCoreError::CorruptVault("wrapped key has the wrong length".to_string()));
        }
        let (wrap_nonce, wrapped_ct) = wrapped.split_at(NONCE_LEN);
        let wrap_nonce: [u8; NONCE_LEN] = wrap_nonce.try_into().unwrap();
        let plaintext = self.crypto.aead_open(kek, &wrap_nonce, wrapped_ct, storage::MAGIC).map_err(|_| VaultCoreError::BadPassword)?;
        plaintext.try_into().map_err(|_| VaultCoreError::CorruptVault("wrapped key has the wrong length".to_string()))
    }

    /// Initialize a new vault, v2 format: a random vault key wrapped by the
    /// password-derived KEK, so the password can be rotated without
    /// re-encrypting the payload (§4.3, §9 Open Question 1 decision: v2 is
    /// the only format new vaults are ever created in).
    pub fn initialize(&mut self, master_password: &SecretString) -> VaultResult<()> {
        self.initialize_with_options(master_password, false)
    }

    pub fn initialize_with_keychain(&mut self, master_password: &SecretString) -> VaultResult<()> {
        self.initialize_with_options(master_password, true)
    }

    fn initialize_with_options(&mut self, master_password: &SecretString, enable_keychain: bool) -> VaultResult<()> {
        if self.path.exists() {
            return Err(VaultCoreError::VaultExists(self.path.display().to_string()));
        }
        self.validate_password(master_password)?;

        let vault_key = {
            let bytes = self.crypto.random_bytes(KEY_LEN);
            let mut buf = [0u8; KEY_LEN];
            buf.copy_from_slice(&bytes);
            buf
        };

        let salt = self.random_salt();
        let kek = self.crypto.derive_kek(master_password.expose_secret().as_bytes(), &salt, crate::crypto::MIN_WRITE_ITERATIONS);
        let wrapped_blob = self.wrap_vault_key(&vault_key, &kek)?;

        let data = VaultData::new();
        let plaintext = serde_json::to_vec(&data).map_err(|e| VaultCoreError::Io(std::io::Error::other(e)))?;
        storage::write_vault(&self.path, FORMAT_V2, &salt, Some(&wrapped_blob), &vault_key, &plaintext)?;

        let keychain_enabled = enable_keychain && self.keychain.available();
        if keychain_enabled {
            let name = keychain::entry_name(&self.path, "password");
            let _ = self.keychain.put(&name, master_password);
        }

        self.write_metadata(&VaultMetadata { keychain_enabled, audit_enabled: self.config.security.audit_enabled, recovery: None, created_at: self.clock.now() })?;
        self.unlocked = Some(UnlockedState { vault_key, data });
        self.record_audit(AuditAction::Initialize, None, true);
        Ok(())
    }

    /// Initialize a new vault and set up mnemonic recovery in the same step,
    /// returning the phrase to show the holder exactly once. `passphrase` is
    /// the optional 25th word (§4.4 Setup, §4.7): when present, recovery
    /// requires the same passphrase in addition to the challenge words.
    pub fn initialize_with_recovery(&mut self, master_password: &SecretString, passphrase: Option<&SecretString>) -> VaultResult<RecoverySetup> {
        self.initialize(master_password)?;
        let unlocked = self.unlocked.as_ref().expect("just initialized");
        let setup = recovery::setup_recovery(&unlocked.vault_key, self.rng.as_ref(), passphrase)?;

        let mut meta = self.read_metadata()?;
        meta.recovery = Some(setup.descriptor.clone());
        self.write_metadata(&meta)?;
        self.record_audit(AuditAction::RecoverySetup, None, true);
        Ok(setup)
    }

    /// Choose the three random positions the caller should prompt the
    /// holder to retype immediately after showing them a fresh mnemonic
    /// (§4.4 post-setup verification). Advisory only: callers decide how
    /// many of the (up to three) attempts to allow, and the vault exists
    /// regardless of the outcome.
    pub fn recovery_verification_positions(&self) -> Vec<u8> {
        recovery::pick_positions(self.rng.as_ref(), recovery::VERIFICATION_WORD_COUNT, recovery::WORD_COUNT)
    }

    /// Check caller-supplied words against `positions` of the mnemonic
    /// returned by [`Self::initialize_with_recovery`]. Never unwraps
    /// anything; a failure here is advisory feedback to show the user
    /// again, not a reason to undo vault creation (§4.4).
    pub fn verify_recovery_words(setup: &RecoverySetup, positions: &[u8], words: &[&str]) -> bool {
        recovery::check_words_at_positions(&setup.mnemonic, positions, words)
    }

    /// Migrate a v1 (password-direct) vault to v2 (key-wrapped), generating
    /// fresh recovery material in the same step (§4.4). Credentials are
    /// never altered, only re-sealed under a new random vault key.
    ///
    /// Idempotent under retry: every write in this method goes through
    /// [`storage::atomic_write`]'s tmp-then-rename discipline, so a crash
    /// between (d) recovery setup and (e) writing the new vault leaves the
    /// original v1 file untouched on disk — the next call starts over from
    /// `load(password)` exactly as it did the first time. Does not require
    /// a prior `unlock`; it derives everything it needs directly from the
    /// v1 file on disk.
    pub fn migrate_v1_to_v2(&mut self, master_password: &SecretString) -> VaultResult<RecoverySetup> {
        let raw = storage::read_raw(&self.path)?;
        if raw.header.version != storage::FORMAT_V1 {
            return Err(VaultCoreError::InvalidArgument("vault is not in v1 format".to_string()));
        }

        // (a) load v1 via the master password.
        let old_kek = self.crypto.derive_kek(master_password.expose_secret().as_bytes(), &raw.header.salt, crate::crypto::MIN_WRITE_ITERATIONS);
        let plaintext = storage::decrypt_payload(&raw, &old_kek)?;
        let data: VaultData = serde_json::from_slice(&plaintext)?;

        // (b) generate a new vault key.
        let vault_key = {
            let bytes = self.crypto.random_bytes(KEY_LEN);
            let mut buf = [0u8; KEY_LEN];
            buf.copy_from_slice(&bytes);
            buf
        };

        // (c) prepare the v2 re-seal: fresh salt, fresh KEK, vault key
        // wrapped under it. Nothing is written to disk yet.
        let new_salt = self.random_salt();
        let new_kek = self.crypto.derive_kek(master_password.expose_secret().as_bytes(), &new_salt, crate::crypto::MIN_WRITE_ITERATIONS);
        let wrapped_blob = self.wrap_vault_key(&vault_key, &new_kek)?;

        // (d) run recovery setup against the new vault key, producing a
        // fresh mnemonic. Still nothing persisted.
        let setup = recovery::setup_recovery(&vault_key, self.rng.as_ref(), None)?;

        // (e) atomically write the new vault, then the sidecar. If the
        // process dies between these two writes the vault is already v2
        // but metadata still claims no recovery; a caller can re-run
        // `initialize_with_recovery`-style setup in that narrow window, but
        // the common case -- dying before the vault write lands -- leaves
        // the original v1 file fully intact for a clean retry.
        let new_plaintext = serde_json::to_vec(&data).map_err(|e| VaultCoreError::Io(std::io::Error::other(e)))?;
        storage::write_vault(&self.path, FORMAT_V2, &new_salt, Some(&wrapped_blob), &vault_key, &new_plaintext)?;

        let mut meta = self.read_metadata().unwrap_or(VaultMetadata {
            keychain_enabled: false,
            audit_enabled: self.config.security.audit_enabled,
            recovery: None,
            created_at: self.clock.now(),
        });
        meta.recovery = Some(setup.descriptor.clone());
        self.write_metadata(&meta)?;

        self.unlocked = Some(UnlockedState { vault_key, data });
        self.record_audit(AuditAction::Migrate, None, true);
        Ok(setup)
    }

    /// Recover vault access by presenting only the challenge words at the
    /// positions recorded at setup time, when the master password has been
    /// lost (§4.7). The remaining eighteen words are reconstructed
    /// internally; the caller never needs to know or re-enter them.
    pub fn unlock_with_recovery_challenge(&mut self, challenge_words: &[SecretString], passphrase: Option<&SecretString>) -> VaultResult<()> {
        let meta = self.read_metadata()?;
        let descriptor = meta.recovery.ok_or(VaultCoreError::RecoveryDisabled)?;
        if descriptor.passphrase_required && passphrase.is_none() {
            self.record_audit(AuditAction::RecoveryFailed, None, false);
            return Err(VaultCoreError::RecoveryFailed);
        }

        let vault_key = match recovery::unwrap_with_challenge_words(&descriptor, challenge_words, passphrase) {
            Ok(key) => key,
            Err(e) => {
                self.record_audit(AuditAction::RecoveryFailed, None, false);
                return Err(e);
            }
        };

        self.unlock_with_key(&vault_key)?;
        self.record_audit(AuditAction::RecoveryUsed, None, true);
        Ok(())
    }

    /// Unlock with the master password. Maps GCM authentication failure and
    /// corrupt-file parsing to the same [`VaultCoreError::BadPassword`]
    /// message so neither is an oracle for the other (§4.3).
    pub fn unlock(&mut self, master_password: &SecretString) -> VaultResult<()> {
        self.check_lockout()?;
        match self.try_unlock(master_password) {
            Ok(()) => {
                self.record_successful_unlock();
                self.record_audit(AuditAction::Unlock, None, true);
                Ok(())
            }
            Err(err) => {
                self.record_failed_unlock();
                self.record_audit(AuditAction::UnlockFailed, None, false);
                Err(err)
            }
        }
    }

    fn try_unlock(&mut self, master_password: &SecretString) -> VaultResult<()> {
        if !self.path.exists() {
            return Err(VaultCoreError::NotFound(self.path.display().to_string()));
        }
        let raw = storage::read_raw(&self.path)?;
        let kek = self.crypto.derive_kek(master_password.expose_secret().as_bytes(), &raw.header.salt, crate::crypto::MIN_WRITE_ITERATIONS);

        let vault_key = match raw.header.version {
            storage::FORMAT_V1 => kek,
            FORMAT_V2 => self.unwrap_vault_key(&raw.wrapped_vault_key, &kek)?,
            v => return Err(VaultCoreError::UnsupportedVersion(v)),
        };

        let plaintext = storage::decrypt_payload(&raw, &vault_key)?;
        let data: VaultData = serde_json::from_slice(&plaintext)?;
        self.unlocked = Some(UnlockedState { vault_key, data });
        Ok(())
    }

    /// Unlock directly from an already-known 32-byte vault key, bypassing
    /// password derivation entirely. The recovery flow is the only caller in
    /// this crate: once challenge words reconstruct the vault key, unlocking
    /// is just "does this key decrypt the payload" (§4.5).
    pub fn unlock_with_key(&mut self, vault_key: &[u8; KEY_LEN]) -> VaultResult<()> {
        let raw = storage::read_raw(&self.path)?;
        let plaintext = storage::decrypt_payload(&raw, vault_key).map_err(|_| VaultCoreError::CorruptVault("vault key does not open this vault".to_string()))?;
        let data: VaultData = serde_json::from_slice(&plaintext)?;
        self.unlocked = Some(UnlockedState { vault_key: *vault_key, data });
        Ok(())
    }

    /// Unlock using a password retrieved from the OS keychain, when the
    /// vault was initialized with keychain integration enabled.
    pub fn unlock_with_keychain(&mut self) -> VaultResult<()> {
        let name = keychain::entry_name(&self.path, "password");
        let password = self.keychain.get(&name).map_err(VaultCoreError::from)?;
        self.unlock(&password)
    }

    /// Clear the in-memory vault key and plaintext data. Secrets held in
    /// [`secrecy::SecretString`]/`Credential::password` zeroize on drop; the
    /// raw vault key buffer is explicitly wiped here (§4.5, §7).
    pub fn lock(&mut self) {
        if let Some(mut state) = self.unlocked.take() {
            crate::crypto::zeroize(&mut state.vault_key);
        }
        self.record_audit(AuditAction::Lock, None, true);
    }

    // ---- CRUD ----

    pub fn add(&mut self, service: impl Into<String>, username: impl Into<String>, password: SecretString) -> VaultResult<()> {
        let now = self.clock.now();
        let service = service.into();
        let state = self.require_unlocked()?;
        if state.data.credentials.contains_key(&service) {
            return Err(VaultCoreError::Duplicate(service));
        }
        state.data.credentials.insert(service.clone(), Credential::new(username, password, now));
        self.save()?;
        self.record_audit(AuditAction::Add, Some(&service), true);
        Ok(())
    }

    /// Fetch a credential. When `track_usage` is true, records this access in
    /// the credential's usage ledger and persists it; when false, the vault
    /// is neither mutated nor written to disk (§4.4 `get(service,
    /// track_usage)`; a caller peeking at a value need not pay for a write).
    pub fn get(&mut self, service: &str, track_usage: bool, location_key: &str, git_repo: Option<&str>) -> VaultResult<Credential> {
        let now = self.clock.now();
        let state = self.require_unlocked()?;
        let credential = state.data.credentials.get_mut(service).ok_or_else(|| VaultCoreError::NotFound(service.to_string()))?;
        if track_usage {
            let usage = credential.usage.entry(location_key.to_string()).or_insert_with(|| UsageRecord::new(location_key, git_repo.map(str::to_string)));
            usage.record_access("password", now);
        }
        let snapshot = credential.clone();
        if track_usage {
            self.save()?;
        }
        self.record_audit(AuditAction::Get, Some(service), true);
        Ok(snapshot)
    }

    /// Record a field access (username, url, notes, ...) without the
    /// full-read bookkeeping `get` performs, for callers that only peek at
    /// one field (e.g. a `--field url` CLI flag).
    pub fn record_field_access(&mut self, service: &str, field: &str, location_key: &str, git_repo: Option<&str>) -> VaultResult<()> {
        let now = self.clock.now();
        let state = self.require_unlocked()?;
        let credential = state.data.credentials.get_mut(service).ok_or_else(|| VaultCoreError::NotFound(service.to_string()))?;
        let usage = credential.usage.entry(location_key.to_string()).or_insert_with(|| UsageRecord::new(location_key, git_repo.map(str::to_string)));
        usage.record_access(field, now);
        self.save()
    }

    pub fn update<F>(&mut self, service: &str, mutate: F) -> VaultResult<()>
    where
        F: FnOnce(&mut Credential),
    {
        let now = self.clock.now();
        let state = self.require_unlocked()?;
        let credential = state.data.credentials.get_mut(service).ok_or_else(|| VaultCoreError::NotFound(service.to_string()))?;
        mutate(credential);
        credential.updated_at = now;
        if !credential.is_valid() {
            return Err(VaultCoreError::InvalidArgument("credential failed shape validation after update".to_string()));
        }
        self.save()?;
        self.record_audit(AuditAction::Update, Some(service), true);
        Ok(())
    }

    pub fn delete(&mut self, service: &str) -> VaultResult<Credential> {
        let state = self.require_unlocked()?;
        let removed = state.data.credentials.remove(service).ok_or_else(|| VaultCoreError::NotFound(service.to_string()))?;
        if let Err(err) = self.save() {
            // Revert in-memory state: the save failed, so the on-disk vault
            // still has this credential (§4.5 write-path contract).
            if let Some(state) = self.unlocked.as_mut() {
                state.data.credentials.insert(service.to_string(), removed);
            }
            return Err(err);
        }
        self.record_audit(AuditAction::Delete, Some(service), true);
        Ok(removed)
    }

    pub fn list_metadata(&mut self) -> VaultResult<Vec<(String, String, Option<String>)>> {
        let state = self.require_unlocked()?;
        Ok(state.data.credentials.iter().map(|(service, cred)| (service.clone(), cred.username.clone(), cred.category.clone())).collect())
    }

    /// Re-wrap the cached vault key under a new password-derived KEK. Requires
    /// an `Unlocked` session: the vault key is never re-derived from the old
    /// password here (§4.5 Session caching, Open Question 2).
    ///
    /// Under v2 this only ever touches the wrapped-key block: the existing
    /// salt and payload nonce/ciphertext are left byte-identical, because the
    /// payload AAD is `magic|version|salt|nonce` and changing any of those
    /// would force a full payload re-seal, defeating the point of key
    /// wrapping (§3, §8). v1 has no such indirection — the "vault key" the
    /// caller holds already *is* the KEK, so a v1 password change must derive
    /// a brand new one and re-seal the payload under it directly.
    pub fn change_password(&mut self, new_password: &SecretString) -> VaultResult<()> {
        self.validate_password(new_password)?;
        let raw = storage::read_raw(&self.path)?;
        let state = self.unlocked.as_ref().ok_or(VaultCoreError::NotUnlocked)?;
        let vault_key = state.vault_key;

        match raw.header.version {
            storage::FORMAT_V1 => {
                let plaintext = serde_json::to_vec(&state.data).map_err(|e| VaultCoreError::Io(std::io::Error::other(e)))?;
                let new_salt = self.random_salt();
                let new_kek = self.crypto.derive_kek(new_password.expose_secret().as_bytes(), &new_salt, crate::crypto::MIN_WRITE_ITERATIONS);
                storage::write_vault(&self.path, storage::FORMAT_V1, &new_salt, None, &new_kek, &plaintext)?;
                if let Some(state) = self.unlocked.as_mut() {
                    state.vault_key = new_kek;
                }
            }
            FORMAT_V2 => {
                let new_kek = self.crypto.derive_kek(new_password.expose_secret().as_bytes(), &raw.header.salt, crate::crypto::MIN_WRITE_ITERATIONS);
                let new_wrapped_blob = self.wrap_vault_key(&vault_key, &new_kek)?;
                storage::rewrap_vault_key(&self.path, &raw, &new_wrapped_blob)?;
            }
            v => return Err(VaultCoreError::UnsupportedVersion(v)),
        }

        if self.read_metadata().map(|m| m.keychain_enabled).unwrap_or(false) {
            let name = keychain::entry_name(&self.path, "password");
            let _ = self.keychain.put(&name, new_password);
        }

        self.record_audit(AuditAction::ChangePassword, None, true);
        Ok(())
    }

    /// Snapshot the current vault to a manual, timestamped backup (§4.3).
    /// Does not touch lock state; the backup is taken from whatever is on
    /// disk right now, not from the in-memory session.
    pub fn create_backup(&self) -> VaultResult<PathBuf> {
        let dest = storage::create_manual_backup(&self.path)?;
        self.record_audit(AuditAction::BackupCreate, Some(&dest.display().to_string()), true);
        Ok(dest)
    }

    /// Restore `backup` over the live vault path atomically. Does not unlock
    /// the vault: the caller must supply whatever password was active when
    /// the backup was taken (§4.3 Restore). Any existing session is dropped
    /// since the on-disk key material it was derived from may no longer
    /// match what is now at `self.path`.
    pub fn restore_backup(&mut self, backup: &Path) -> VaultResult<()> {
        storage::restore_from(backup, &self.path)?;
        if let Some(mut state) = self.unlocked.take() {
            crate::crypto::zeroize(&mut state.vault_key);
        }
        self.record_audit(AuditAction::BackupRestore, Some(&backup.display().to_string()), true);
        Ok(())
    }

    /// Report whether the OS keychain backend is reachable, for callers
    /// deciding whether to offer `unlock_with_keychain` (§4.2).
    pub fn keychain_status(&self) -> bool {
        let available = self.keychain.available();
        self.record_audit(AuditAction::KeychainStatus, None, available);
        available
    }

    /// Every automatic and manual backup next to the vault, newest first
    /// (§4.3 Backup discovery).
    pub fn list_backups(&self) -> VaultResult<Vec<PathBuf>> {
        storage::list_backups(&self.path)
    }

    /// Replay the audit chain and report how much of it verifies (§4.6).
    pub fn verify_audit_log(&self) -> VaultResult<crate::audit::AuditVerification> {
        let log = AuditLog::open(Config::audit_log_path(), self.audit_chain_key())?;
        log.verify()
    }

    fn validate_password(&self, password: &SecretString) -> VaultResult<()> {
        self.config.validate_master_password(password.expose_secret()).map_err(|errs| VaultCoreError::WeakPassword(errs.join("; ")))
    }

    fn save(&mut self) -> VaultResult<()> {
        let raw = storage::read_raw(&self.path)?;
        let state = self.unlocked.as_ref().ok_or(VaultCoreError::NotUnlocked)?;
        let plaintext = serde_json::to_vec(&state.data).map_err(|e| VaultCoreError::Io(std::io::Error::other(e)))?;
        let wrapped = Some(raw.wrapped_vault_key.as_slice()).filter(|w| !w.is_empty());
        storage::write_vault(&self.path, raw.header.version, &raw.header.salt, wrapped, &state.vault_key, &plaintext)
    }

    fn write_metadata(&self, meta: &VaultMetadata) -> VaultResult<()> {
        let json = serde_json::to_vec_pretty(meta).map_err(|e| VaultCoreError::Io(std::io::Error::other(e)))?;
        storage::atomic_write(&self.metadata_path(), &json)
    }

    pub fn read_metadata(&self) -> VaultResult<VaultMetadata> {
        let bytes = std::fs::read(self.metadata_path())?;
        serde_json::from_slice(&bytes).map_err(|e| VaultCoreError::CorruptVault(e.to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{FixedClock, SystemRng};
    use crate::crypto::SystemCrypto;
    use crate::keychain::InMemoryKeychain;
    use tempfile::tempdir;

    const STRONG_PASSWORD: &str = "Correct-Horse-7!";
    const OTHER_STRONG_PASSWORD: &str = "New-Pass-Word-9$";

    fn test_config() -> Config {
        let mut config = Config::default();
        // Most tests don't exercise the audit log; disabling it keeps them
        // from touching any path at all beyond the tempdir under test.
        config.security.audit_enabled = false;
        config
    }

    fn fixed_start() -> chrono::DateTime<chrono::Utc> {
        "2024-01-01T00:00:00Z".parse().unwrap()
    }

    fn service_at(path: PathBuf, config: Config) -> VaultService {
        VaultService::new(path, config, Box::new(SystemCrypto), Box::new(InMemoryKeychain::new()), Box::new(FixedClock::new(fixed_start())), Box::new(SystemRng))
    }

    fn strong(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    // --- §8 scenario 1: initialize, unlock, add, lock, unlock, get ---
    #[test]
    fn scenario_initialize_add_lock_unlock_get() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.enc");
        let mut service = service_at(path.clone(), test_config());

        assert_eq!(service.state(), State::Uninitialized);
        service.initialize(&strong(STRONG_PASSWORD)).unwrap();
        assert_eq!(service.state(), State::Unlocked);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], storage::MAGIC);
        assert_eq!(bytes[4], storage::FORMAT_V2);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }

        service.add("github", "alice", strong("s3kret-pw")).unwrap();
        service.lock();
        assert_eq!(service.state(), State::Locked);

        service.unlock(&strong(STRONG_PASSWORD)).unwrap();
        let credential = service.get("github", true, "demo", None).unwrap();
        assert_eq!(credential.username, "alice");
    }

    // --- §8 scenario 2: change_password rotates which password unlocks ---
    #[test]
    fn scenario_change_password_rotates_unlock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.enc");
        let mut service = service_at(path, test_config());
        service.initialize(&strong(STRONG_PASSWORD)).unwrap();
        service.add("github", "alice", strong("pw")).unwrap();

        service.change_password(&strong(OTHER_STRONG_PASSWORD)).unwrap();
        service.lock();

        assert!(matches!(service.unlock(&strong(STRONG_PASSWORD)), Err(VaultCoreError::BadPassword)));
        service.unlock(&strong(OTHER_STRONG_PASSWORD)).unwrap();
        let credential = service.get("github", true, "demo", None).unwrap();
        assert_eq!(credential.username, "alice");
    }

    // --- key-wrapping property: payload ciphertext is unchanged by a
    // password change under v2; only the wrapped-key block differs ---
    #[test]
    fn change_password_leaves_payload_ciphertext_byte_identical() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.enc");
        let mut service = service_at(path.clone(), test_config());
        service.initialize(&strong(STRONG_PASSWORD)).unwrap();
        service.add("github", "alice", strong("pw")).unwrap();

        let before = storage::read_raw(&path).unwrap();
        service.change_password(&strong(OTHER_STRONG_PASSWORD)).unwrap();
        let after = storage::read_raw(&path).unwrap();

        assert_eq!(before.ciphertext, after.ciphertext);
        assert_ne!(before.wrapped_vault_key, after.wrapped_vault_key);
    }

    // --- §8 scenario 3: recovery setup then challenge-word recovery ---
    #[test]
    fn scenario_recovery_challenge_unlocks_vault() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.enc");
        let mut service = service_at(path, test_config());
        let setup = service.initialize_with_recovery(&strong(STRONG_PASSWORD), None).unwrap();
        assert_eq!(setup.mnemonic.words().count(), crate::recovery::WORD_COUNT);

        let words: Vec<&str> = setup.mnemonic.words().collect();
        let challenge_words: Vec<SecretString> =
            setup.descriptor.challenge_positions.iter().map(|&p| strong(words[p as usize])).collect();

        service.lock();
        service.unlock_with_recovery_challenge(&challenge_words, None).unwrap();
        assert_eq!(service.state(), State::Unlocked);
    }

    #[test]
    fn recovery_challenge_with_wrong_word_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.enc");
        let mut service = service_at(path, test_config());
        let setup = service.initialize_with_recovery(&strong(STRONG_PASSWORD), None).unwrap();

        let words: Vec<&str> = setup.mnemonic.words().collect();
        let mut challenge_words: Vec<SecretString> =
            setup.descriptor.challenge_positions.iter().map(|&p| strong(words[p as usize])).collect();
        challenge_words[0] = strong("zzzznotaword");

        service.lock();
        assert!(matches!(service.unlock_with_recovery_challenge(&challenge_words, None), Err(VaultCoreError::RecoveryFailed)));
    }

    // --- §8 scenario 4: corrupting a ciphertext byte yields BadPassword, never a panic ---
    #[test]
    fn scenario_corrupted_ciphertext_yields_bad_password() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.enc");
        let mut service = service_at(path.clone(), test_config());
        service.initialize(&strong(STRONG_PASSWORD)).unwrap();
        service.add("github", "alice", strong("pw")).unwrap();
        service.lock();

        let mut bytes = std::fs::read(&path).unwrap();
        let idx = bytes.len() - 5;
        bytes[idx] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(service.unlock(&strong(STRONG_PASSWORD)), Err(VaultCoreError::BadPassword) | Err(VaultCoreError::CorruptVault(_))));
    }

    // --- §8 scenario 6: weak password is rejected and no file is created ---
    #[test]
    fn scenario_weak_password_rejected_no_file_created() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.enc");
        let mut service = service_at(path.clone(), test_config());

        let result = service.initialize(&strong("Short1!"));
        assert!(matches!(result, Err(VaultCoreError::WeakPassword(_))));
        assert!(!path.exists());
        assert_eq!(service.state(), State::Uninitialized);
    }

    #[test]
    fn duplicate_service_name_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.enc");
        let mut service = service_at(path, test_config());
        service.initialize(&strong(STRONG_PASSWORD)).unwrap();
        service.add("github", "alice", strong("pw")).unwrap();
        assert!(matches!(service.add("github", "bob", strong("pw2")), Err(VaultCoreError::Duplicate(_))));
    }

    #[test]
    fn operations_fail_with_not_unlocked_before_unlock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.enc");
        let mut service = service_at(path, test_config());
        assert!(matches!(service.add("x", "y", strong("pw")), Err(VaultCoreError::NotUnlocked)));
    }

    #[test]
    fn delete_is_not_found_for_missing_service_and_existing_entry_survives_it() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.enc");
        let mut service = service_at(path, test_config());
        service.initialize(&strong(STRONG_PASSWORD)).unwrap();
        service.add("github", "alice", strong("pw")).unwrap();

        assert!(matches!(service.delete("gitlab"), Err(VaultCoreError::NotFound(_))));
        // the unrelated credential is still there afterwards
        assert!(service.get("github", true, "demo", None).is_ok());

        service.delete("github").unwrap();
        assert!(matches!(service.get("github", true, "demo", None), Err(VaultCoreError::NotFound(_))));
    }

    #[test]
    fn update_patches_fields_and_bumps_updated_at() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.enc");
        let mut service = service_at(path, test_config());
        service.initialize(&strong(STRONG_PASSWORD)).unwrap();
        service.add("github", "alice", strong("pw")).unwrap();

        service
            .update("github", |c| {
                c.category = Some("dev".to_string());
            })
            .unwrap();

        let credential = service.get("github", true, "demo", None).unwrap();
        assert_eq!(credential.category.as_deref(), Some("dev"));
        assert!(credential.updated_at >= credential.created_at);
    }

    #[test]
    fn get_tracks_usage_monotonically_across_calls() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.enc");
        let mut service = service_at(path, test_config());
        service.initialize(&strong(STRONG_PASSWORD)).unwrap();
        service.add("github", "alice", strong("pw")).unwrap();

        service.get("github", true, "proj-a", None).unwrap();
        let after_one = service.get("github", true, "proj-a", None).unwrap();
        let usage = after_one.usage.get("proj-a").unwrap();
        assert_eq!(usage.access_count, 2);
    }

    #[test]
    fn get_with_track_usage_false_never_records_or_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.enc");
        let mut service = service_at(path, test_config());
        service.initialize(&strong(STRONG_PASSWORD)).unwrap();
        service.add("github", "alice", strong("pw")).unwrap();

        let credential = service.get("github", false, "proj-a", None).unwrap();
        assert!(credential.usage.is_empty());

        service.get("github", false, "proj-a", None).unwrap();
        let after = service.get("github", false, "proj-a", None).unwrap();
        assert!(after.usage.is_empty());
    }

    #[test]
    fn list_metadata_never_exposes_passwords() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.enc");
        let mut service = service_at(path, test_config());
        service.initialize(&strong(STRONG_PASSWORD)).unwrap();
        service.add("github", "alice", strong("super-secret-pw")).unwrap();

        let listing = service.list_metadata().unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].0, "github");
        assert_eq!(listing[0].1, "alice");
    }

    #[test]
    fn lock_zeroizes_the_cached_vault_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.enc");
        let mut service = service_at(path, test_config());
        service.initialize(&strong(STRONG_PASSWORD)).unwrap();

        let key_ptr_before = service.unlocked.as_ref().unwrap().vault_key;
        assert_ne!(key_ptr_before, [0u8; KEY_LEN]);

        service.lock();
        assert!(service.unlocked.is_none());
    }

    #[test]
    fn manual_backup_then_restore_roundtrips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.enc");
        let mut service = service_at(path.clone(), test_config());
        service.initialize(&strong(STRONG_PASSWORD)).unwrap();
        service.add("github", "alice", strong("pw")).unwrap();

        let backup = service.create_backup().unwrap();
        service.add("gitlab", "bob", strong("pw2")).unwrap();

        service.restore_backup(&backup).unwrap();
        assert_eq!(service.state(), State::Locked);

        service.unlock(&strong(STRONG_PASSWORD)).unwrap();
        assert!(service.get("github", true, "demo", None).is_ok());
        assert!(matches!(service.get("gitlab", true, "demo", None), Err(VaultCoreError::NotFound(_))));
    }

    // --- migration v1 -> v2 preserves credentials and produces recovery material ---
    #[test]
    fn migrate_v1_to_v2_preserves_credentials_and_unlocks_with_new_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.enc");
        let mut service = service_at(path.clone(), test_config());
        service.initialize_v1(&strong(STRONG_PASSWORD)).unwrap();
        service.add("github", "alice", strong("pw")).unwrap();
        service.lock();

        let setup = service.migrate_v1_to_v2(&strong(STRONG_PASSWORD)).unwrap();
        assert_eq!(setup.mnemonic.words().count(), crate::recovery::WORD_COUNT);

        let raw = storage::read_raw(&path).unwrap();
        assert_eq!(raw.header.version, storage::FORMAT_V2);

        service.lock();
        service.unlock(&strong(STRONG_PASSWORD)).unwrap();
        let credential = service.get("github", true, "demo", None).unwrap();
        assert_eq!(credential.username, "alice");

        let meta = service.read_metadata().unwrap();
        assert!(meta.recovery.is_some());
        assert!(meta.recovery.as_ref().unwrap().enabled);
        assert!(!meta.recovery.as_ref().unwrap().passphrase_required);
    }

    #[test]
    fn migrate_rejects_an_already_v2_vault() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.enc");
        let mut service = service_at(path, test_config());
        service.initialize(&strong(STRONG_PASSWORD)).unwrap();
        assert!(matches!(service.migrate_v1_to_v2(&strong(STRONG_PASSWORD)), Err(VaultCoreError::InvalidArgument(_))));
    }

    #[test]
    fn recovery_verification_positions_are_three_distinct_values_in_range() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.enc");
        let service = service_at(path, test_config());
        let positions = service.recovery_verification_positions();
        assert_eq!(positions.len(), crate::recovery::VERIFICATION_WORD_COUNT);
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), positions.len());
    }

    #[test]
    fn verify_recovery_words_confirms_correct_and_rejects_wrong() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.enc");
        let mut service = service_at(path, test_config());
        let setup = service.initialize_with_recovery(&strong(STRONG_PASSWORD), None).unwrap();

        let positions = service.recovery_verification_positions();
        let words: Vec<&str> = setup.mnemonic.words().collect();
        let correct: Vec<&str> = positions.iter().map(|&p| words[p as usize]).collect();
        assert!(VaultService::verify_recovery_words(&setup, &positions, &correct));

        let mut wrong = correct.clone();
        wrong[0] = "zzzznotaword";
        assert!(!VaultService::verify_recovery_words(&setup, &positions, &wrong));
    }

    #[test]
    fn keychain_unlock_roundtrips_when_enabled() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.enc");
        let mut service = service_at(path, test_config());
        service.initialize_with_keychain(&strong(STRONG_PASSWORD)).unwrap();
        service.lock();

        service.unlock_with_keychain().unwrap();
        assert_eq!(service.state(), State::Unlocked);
    }

    #[test]
    fn audit_log_records_initialize_and_verifies() {
        let dir = tempdir().unwrap();
        let audit_path = dir.path().join("audit.log");
        std::env::set_var("PASS_AUDIT_LOG", &audit_path);

        let mut config = test_config();
        config.security.audit_enabled = true;
        let path = dir.path().join("vault.enc");
        let mut service = service_at(path, config);
        service.initialize(&strong(STRONG_PASSWORD)).unwrap();
        service.add("github", "alice", strong("pw")).unwrap();

        let verification = service.verify_audit_log().unwrap();
        assert!(verification.is_intact());
        assert!(verification.valid_entries >= 2);
        assert!(!service.audit_degraded());

        std::env::remove_var("PASS_AUDIT_LOG");
    }
}
