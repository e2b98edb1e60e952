//! Tamper-Evident Audit Log
//!
//! Append-only JSONL log, each line chained to the previous via an
//! HMAC-SHA256 tag (§4.6). Never records secret material — passwords, TOTP
//! secrets, and recovery phrases are excluded by construction, not by
//! redaction after the fact. Grounded in spirit on
//! `other_examples/e5e8caab_jeranaias-rigrun__src-audit.rs.rs`'s
//! `AuditEntry`/rotation shape, generalized to the chained-HMAC integrity
//! model §4.6 requires.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::error::VaultResult;

/// Rotate the active log once it exceeds this size.
pub const ROTATE_AT_BYTES: u64 = 10 * 1024 * 1024;

/// Chain anchor for the first entry of a log: an all-zero HMAC block,
/// hex-encoded. Never an entry's actual `hmac` value, so a fresh log can
/// always be told apart from a log whose true first entry happens to chain
/// to something else.
const GENESIS_ANCHOR: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// The kind of operation recorded. Intentionally coarse — enough to
/// reconstruct "what happened to which service", never "what the secret
/// value was".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Initialize,
    Unlock,
    UnlockFailed,
    Lock,
    Add,
    Update,
    Delete,
    Get,
    ChangePassword,
    RecoverySetup,
    RecoveryUsed,
    RecoveryFailed,
    BackupCreate,
    BackupRestore,
    KeychainStatus,
    /// v1 -> v2 key-wrapping migration (§4.4).
    Migrate,
    /// Written as the first entry of a freshly rotated log, chained to the
    /// all-zero anchor, so the new file's chain has its own documented start.
    Rotate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    /// Service name, when the action targets one credential. Never the
    /// credential's secret fields.
    pub service: Option<String>,
    pub success: bool,
    /// HMAC over this entry's own fields, keyed by the chain key, computed
    /// over the chain's previous tag so any reordering or truncation breaks
    /// verification.
    pub hmac: String,
    pub prev_hmac: String,
}

/// A single, append-only audit log file chained by HMAC-SHA256.
pub struct AuditLog {
    path: PathBuf,
    chain_key: [u8; 32],
    /// Set when an append fails; the vault service consults this to decide
    /// whether to surface a degraded-audit warning rather than block the
    /// underlying vault operation (§4.6: audit failures never block writes).
    degraded: AtomicBool,
}

impl AuditLog {
    pub fn open(path: PathBuf, chain_key: [u8; 32]) -> VaultResult<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        Ok(Self { path, chain_key, degraded: AtomicBool::new(false) })
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    fn last_hmac(&self) -> VaultResult<String> {
        if !self.path.exists() {
            return Ok(GENESIS_ANCHOR.to_string());
        }
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut last = GENESIS_ANCHOR.to_string();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(entry) = serde_json::from_str::<AuditEntry>(&line) {
                last = entry.hmac;
            }
        }
        Ok(last)
    }

    /// Append one entry. Failures (disk full, permission loss) are swallowed
    /// into the `degraded` flag rather than propagated, because an audit
    /// failure must never block the vault write it is describing.
    pub fn record(&self, action: AuditAction, service: Option<&str>, success: bool, now: DateTime<Utc>) {
        if let Err(_err) = self.try_record(action, service, success, now) {
            self.degraded.store(true, Ordering::Relaxed);
        }
    }

    fn try_record(&self, action: AuditAction, service: Option<&str>, success: bool, now: DateTime<Utc>) -> VaultResult<()> {
        self.maybe_rotate(now)?;
        self.append_entry(action, service, success, now)
    }

    fn append_entry(&self, action: AuditAction, service: Option<&str>, success: bool, now: DateTime<Utc>) -> VaultResult<()> {
        let prev_hmac = self.last_hmac()?;

        let mut entry = AuditEntry {
            timestamp: now,
            action,
            service: service.map(str::to_string),
            success,
            hmac: String::new(),
            prev_hmac: prev_hmac.clone(),
        };
        let signing_bytes = canonical_bytes(&entry)?;
        let mut mac_input = prev_hmac.into_bytes();
        mac_input.extend_from_slice(&signing_bytes);
        let tag = crypto::hmac_sha256(&self.chain_key, &mac_input);
        entry.hmac = hex_encode(&tag);

        let line = serde_json::to_string(&entry).map_err(std::io::Error::other)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        set_owner_only(&file)?;
        let mut file = file;
        writeln!(file, "{line}")?;
        file.sync_all()?;
        Ok(())
    }

    /// Rename the active log away once it exceeds [`ROTATE_AT_BYTES`] and
    /// start a fresh one anchored to the all-zero block, recording a
    /// `Rotate` entry as the new file's first line so the break in the old
    /// chain is itself an audited event (§4.6).
    fn maybe_rotate(&self, now: DateTime<Utc>) -> VaultResult<()> {
        if let Ok(meta) = fs::metadata(&self.path) {
            if meta.len() >= ROTATE_AT_BYTES {
                let rotated = self.path.with_extension(format!("log.{}", now.timestamp()));
                fs::rename(&self.path, rotated)?;
                self.append_entry(AuditAction::Rotate, None, true, now)?;
            }
        }
        Ok(())
    }

    /// Replay the chain, returning the number of entries that verified and
    /// the zero-based line number of the first entry that did not (if any).
    /// A prefix of valid entries followed by a broken one indicates
    /// tampering or truncation from that point forward (§4.6, §8).
    pub fn verify(&self) -> VaultResult<AuditVerification> {
        if !self.path.exists() {
            return Ok(AuditVerification { valid_entries: 0, first_bad_line: None });
        }
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut prev_hmac = GENESIS_ANCHOR.to_string();
        let mut valid_entries = 0usize;
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let parsed: Result<AuditEntry, _> = serde_json::from_str(&line);
            let entry = match parsed {
                Ok(e) => e,
                Err(_) => return Ok(AuditVerification { valid_entries, first_bad_line: Some(idx) }),
            };
            if entry.prev_hmac != prev_hmac {
                return Ok(AuditVerification { valid_entries, first_bad_line: Some(idx) });
            }
            let mut expected = entry.clone();
            expected.hmac = String::new();
            let signing_bytes = canonical_bytes(&expected)?;
            let mut mac_input = prev_hmac.clone().into_bytes();
            mac_input.extend_from_slice(&signing_bytes);
            let tag = crypto::hmac_sha256(&self.chain_key, &mac_input);
            if hex_encode(&tag) != entry.hmac {
                return Ok(AuditVerification { valid_entries, first_bad_line: Some(idx) });
            }
            prev_hmac = entry.hmac;
            valid_entries += 1;
        }
        Ok(AuditVerification { valid_entries, first_bad_line: None })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditVerification {
    pub valid_entries: usize,
    pub first_bad_line: Option<usize>,
}

impl AuditVerification {
    pub fn is_intact(&self) -> bool {
        self.first_bad_line.is_none()
    }
}

fn canonical_bytes(entry: &AuditEntry) -> VaultResult<Vec<u8>> {
    serde_json::to_vec(entry).map_err(|e| std::io::Error::other(e).into())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(unix)]
fn set_owner_only(file: &File) -> VaultResult<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = file.metadata()?.permissions();
    perms.set_mode(0o600);
    file.set_permissions(perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner_only(_file: &File) -> VaultResult<()> {
    Ok(())
}
