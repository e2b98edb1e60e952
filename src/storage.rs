//! On-Disk Vault Format and Atomic Storage Engine
//!
//! Binary layout (§3), atomic write algorithm (tmp + fsync + backup +
//! rename + fsync-dir, §4.3), and backup management. Generalizes the
//! teacher's `vault.rs` header/atomic-write shape to the two key-handling
//! modes required here:
//!
//! - v1: the vault key *is* the password-derived KEK (no wrapping).
//!   Layout: `magic(4) | version(1)=1 | salt(32) | nonce(12) | ciphertext`.
//! - v2: the vault key is random and independently wrapped by the
//!   password-derived KEK, so it can be rewrapped on password change
//!   without touching the payload.
//!   Layout: `magic(4) | version(1)=2 | salt(32) | nonce(12) |
//!   wrapped_vault_key(60) | ciphertext`.
//!
//! All multi-byte fields are fixed-size; there are no length prefixes and
//! no endianness decisions anywhere in the header. Authentication rests
//! entirely on the AEAD tag appended to `ciphertext` — there is no separate
//! HMAC field, so a wrong key and a corrupt file are structurally
//! indistinguishable to every caller (§4.3).

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::crypto::{self, KEY_LEN, NONCE_LEN};
use crate::error::{CryptoError, VaultCoreError, VaultResult};

/// Magic bytes identifying a pass-cli vault file.
pub const MAGIC: &[u8; 4] = b"PCLI";

/// Vault stores the vault key directly derived from the password; no
/// separate wrapped key block.
pub const FORMAT_V1: u8 = 1;
/// Vault key is random and wrapped by the password-derived KEK, enabling
/// password rotation without re-encrypting the payload.
pub const FORMAT_V2: u8 = 2;

/// Salt length for the password-to-KEK derivation (§3).
pub const SALT_LEN: usize = 32;
/// `nonce(12) + ciphertext(32) + tag(16)` for the wrapped vault key AEAD.
pub const WRAPPED_KEY_LEN: usize = NONCE_LEN + KEY_LEN + crypto::TAG_LEN;

const HEADER_LEN: usize = MAGIC.len() + 1 + SALT_LEN + NONCE_LEN;

const BACKUP_SUFFIX: &str = ".backup";

/// Parsed vault file header fields, independent of the format version.
#[derive(Debug, Clone)]
pub struct VaultHeader {
    pub version: u8,
    pub salt: [u8; SALT_LEN],
    pub nonce: [u8; NONCE_LEN],
}

/// A fully parsed vault file, ready for key derivation / unwrapping.
pub struct RawVault {
    pub header: VaultHeader,
    /// Present only for [`FORMAT_V2`]; empty for v1.
    pub wrapped_vault_key: Vec<u8>,
    pub ciphertext: Vec<u8>,
    /// The header prefix bytes (`magic | version | salt | nonce`), bound as
    /// AAD into the payload AEAD so header tampering is also detected.
    header_prefix: Vec<u8>,
}

/// Read and structurally parse a vault file without deriving any key.
pub fn read_raw(path: &Path) -> VaultResult<RawVault> {
    let mut file = File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    if buf.len() < HEADER_LEN || &buf[0..4] != MAGIC {
        return Err(VaultCoreError::CorruptVault("bad magic".to_string()));
    }
    let version = buf[4];
    if version != FORMAT_V1 && version != FORMAT_V2 {
        return Err(VaultCoreError::UnsupportedVersion(version));
    }
    let salt: [u8; SALT_LEN] = buf[5..5 + SALT_LEN].try_into().unwrap();
    let nonce_start = 5 + SALT_LEN;
    let nonce: [u8; NONCE_LEN] = buf[nonce_start..nonce_start + NONCE_LEN].try_into().unwrap();
    let header_prefix = buf[..HEADER_LEN].to_vec();

    let (wrapped_vault_key, ciphertext_start) = match version {
        FORMAT_V2 => {
            if buf.len() < HEADER_LEN + WRAPPED_KEY_LEN {
                return Err(VaultCoreError::CorruptVault("truncated wrapped key".to_string()));
            }
            (buf[HEADER_LEN..HEADER_LEN + WRAPPED_KEY_LEN].to_vec(), HEADER_LEN + WRAPPED_KEY_LEN)
        }
        _ => (Vec::new(), HEADER_LEN),
    };
    let ciphertext = buf[ciphertext_start..].to_vec();

    Ok(RawVault { header: VaultHeader { version, salt, nonce }, wrapped_vault_key, ciphertext, header_prefix })
}

/// Encode and write a vault file at the given format version.
///
/// `vault_key` is the key that actually seals the payload. For v1 it is the
/// password-derived KEK; for v2 it is a random key, and `wrapped_vault_key`
/// must be `Some(60 bytes: nonce || wrap(vault_key, kek))`.
pub fn write_vault(
    path: &Path,
    version: u8,
    salt: &[u8; SALT_LEN],
    wrapped_vault_key: Option<&[u8]>,
    vault_key: &[u8; KEY_LEN],
    plaintext: &[u8],
) -> VaultResult<()> {
    let nonce = crypto::random_nonce();

    let mut header_prefix = Vec::with_capacity(HEADER_LEN);
    header_prefix.extend_from_slice(MAGIC);
    header_prefix.push(version);
    header_prefix.extend_from_slice(salt);
    header_prefix.extend_from_slice(&nonce);

    let ciphertext = crypto::aead_seal(vault_key, &nonce, plaintext, &header_prefix)?;

    let mut file_data = header_prefix;
    if version == FORMAT_V2 {
        let wrapped = wrapped_vault_key.ok_or_else(|| VaultCoreError::InvalidArgument("v2 vault requires a wrapped key".to_string()))?;
        if wrapped.len() != WRAPPED_KEY_LEN {
            return Err(VaultCoreError::InvalidArgument("wrapped vault key has the wrong length".to_string()));
        }
        file_data.extend_from_slice(wrapped);
    }
    file_data.extend_from_slice(&ciphertext);

    atomic_write(path, &file_data)
}

/// Decrypt the payload, authenticating the header prefix as AAD. A wrong
/// key and a corrupt/truncated ciphertext both surface as
/// [`VaultCoreError::BadPassword`] (§4.3).
pub fn decrypt_payload(raw: &RawVault, vault_key: &[u8; KEY_LEN]) -> VaultResult<Vec<u8>> {
    crypto::aead_open(vault_key, &raw.header.nonce, &raw.ciphertext, &raw.header_prefix).map_err(|_| VaultCoreError::from(CryptoError::Decryption))
}

/// Unwrap the v2 wrapped vault key using a KEK, returning the 32-byte vault
/// key. Fails the same way a bad password does — no oracle distinguishing
/// "wrong password" from "corrupt wrapped-key block".
pub fn unwrap_vault_key(raw: &RawVault, kek: &[u8; KEY_LEN]) -> VaultResult<[u8; KEY_LEN]> {
    if raw.header.version != FORMAT_V2 || raw.wrapped_vault_key.len() != WRAPPED_KEY_LEN {
        return Err(VaultCoreError::CorruptVault("not a v2 vault".to_string()));
    }
    let wrap_nonce: [u8; NONCE_LEN] = raw.wrapped_vault_key[..NONCE_LEN].try_into().unwrap();
    let wrapped_ct = &raw.wrapped_vault_key[NONCE_LEN..];
    let plaintext = crypto::aead_open(kek, &wrap_nonce, wrapped_ct, MAGIC).map_err(|_| VaultCoreError::BadPassword)?;
    plaintext.try_into().map_err(|_| VaultCoreError::BadPassword)
}

/// Wrap a fresh vault key under a KEK, producing the 60-byte block
/// `write_vault` expects for `wrapped_vault_key`.
pub fn wrap_vault_key(vault_key: &[u8; KEY_LEN], kek: &[u8; KEY_LEN]) -> VaultResult<Vec<u8>> {
    let nonce = crypto::random_nonce();
    let ciphertext = crypto::aead_seal(kek, &nonce, vault_key, MAGIC)?;
    let mut out = Vec::with_capacity(WRAPPED_KEY_LEN);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Replace only the wrapped-key block of a v2 vault, leaving its header
/// (version, salt, payload nonce) and payload ciphertext byte-for-byte
/// untouched. This is what lets `change_password` rotate the password on a
/// v2 vault without re-sealing the payload: the payload AAD is
/// `magic|version|salt|nonce`, so keeping all three unchanged keeps the
/// payload ciphertext and tag unchanged too (§3, §8).
pub fn rewrap_vault_key(path: &Path, raw: &RawVault, new_wrapped_vault_key: &[u8]) -> VaultResult<()> {
    if raw.header.version != FORMAT_V2 {
        return Err(VaultCoreError::InvalidArgument("rewrap only applies to v2 vaults".to_string()));
    }
    if new_wrapped_vault_key.len() != WRAPPED_KEY_LEN {
        return Err(VaultCoreError::InvalidArgument("wrapped vault key has the wrong length".to_string()));
    }

    let mut file_data = Vec::with_capacity(raw.header_prefix.len() + WRAPPED_KEY_LEN + raw.ciphertext.len());
    file_data.extend_from_slice(&raw.header_prefix);
    file_data.extend_from_slice(new_wrapped_vault_key);
    file_data.extend_from_slice(&raw.ciphertext);

    atomic_write(path, &file_data)
}

/// Write `data` to `path` atomically: write to a sibling temp file, fsync
/// it, snapshot the existing file to `.backup` (if any), rename the temp
/// file into place, then fsync the containing directory so the rename
/// itself is durable (§4.3). Owner-only permissions are set on the temp
/// file before it is ever visible under its final name.
pub fn atomic_write(path: &Path, data: &[u8]) -> VaultResult<()> {
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&dir)?;
    let tmp_path = dir.join(format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("vault"),
        std::process::id()
    ));

    {
        let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(&tmp_path)?;
        set_owner_only(&file)?;
        file.write_all(data)?;
        file.sync_all()?;
    }

    if path.exists() {
        let backup_path = backup_path(path);
        fs::copy(path, &backup_path)?;
    }

    fs::rename(&tmp_path, path)?;
    fsync_dir(&dir)?;
    Ok(())
}

pub fn backup_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(BACKUP_SUFFIX);
    PathBuf::from(os)
}

/// Name a manual, timestamped backup distinct from the automatic
/// pre-overwrite `.backup` snapshot, so manual snapshots are never clobbered
/// by the next save.
pub fn manual_backup_path(path: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    let mut os = path.as_os_str().to_os_string();
    os.push(format!(".{stamp}.manual.backup"));
    PathBuf::from(os)
}

pub fn create_manual_backup(path: &Path) -> VaultResult<PathBuf> {
    if !path.exists() {
        return Err(VaultCoreError::NotFound(path.display().to_string()));
    }
    let dest = manual_backup_path(path);
    fs::copy(path, &dest)?;
    set_owner_only(&File::open(&dest)?)?;
    Ok(dest)
}

/// List every backup (automatic and manual) for a vault, newest first.
pub fn list_backups(path: &Path) -> VaultResult<Vec<PathBuf>> {
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
    let stem = path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
    let mut backups = Vec::new();
    if dir.is_dir() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&stem) && name != stem && name.contains("backup") {
                backups.push(entry.path());
            }
        }
    }
    backups.sort_by_key(|p| fs::metadata(p).and_then(|m| m.modified()).ok());
    backups.reverse();
    Ok(backups)
}

/// Return the newest backup that parses and decrypts under the given vault
/// key, skipping over anything corrupt (§4.3 restore contract). For v2
/// vaults, `vault_key` here is the already-unwrapped vault key, not the KEK.
pub fn find_newest_valid_backup(path: &Path, vault_key: &[u8; KEY_LEN]) -> VaultResult<Option<PathBuf>> {
    for candidate in list_backups(path)? {
        if let Ok(raw) = read_raw(&candidate) {
            if decrypt_payload(&raw, vault_key).is_ok() {
                return Ok(Some(candidate));
            }
        }
    }
    Ok(None)
}

pub fn restore_from(backup: &Path, target: &Path) -> VaultResult<()> {
    let data = fs::read(backup)?;
    atomic_write(target, &data)
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

#[cfg(unix)]
fn fsync_dir(dir: &Path) -> VaultResult<()> {
    let dir_file = File::open(dir)?;
    dir_file.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn fsync_dir(_dir: &Path) -> VaultResult<()> {
    // Directory-entry durability is an unsupported fsync target on this
    // platform; the file rename itself is still atomic.
    Ok(())
}
