//! Cryptographic Primitives Module
//!
//! AEAD seal/open, PBKDF2 key derivation, HMAC, secure randomness, and
//! explicit zeroization/constant-time comparison. Every primitive reports a
//! single opaque [`CryptoError`] — callers never branch on internal detail
//! (§4.1).

use aes_gcm::aead::{generic_array::GenericArray, Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::error::CryptoError;

/// Minimum PBKDF2 iteration count this build will ever *write*. Older
/// vaults recorded with a lower count must still be readable (§4.1).
pub const MIN_WRITE_ITERATIONS: u32 = 600_000;

/// Length in bytes of every key this module hands out.
pub const KEY_LEN: usize = 32;
/// Length in bytes of an AES-GCM nonce.
pub const NONCE_LEN: usize = 12;
/// Length in bytes of an AES-GCM authentication tag.
pub const TAG_LEN: usize = 16;

type HmacSha256 = Hmac<Sha256>;

/// Derive a 32-byte key-encryption key from a password and salt using
/// PBKDF2-HMAC-SHA256.
pub fn derive_kek(password: &[u8], salt: &[u8], iterations: u32) -> [u8; KEY_LEN] {
    let mut out = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out);
    out
}

/// Seal `plaintext` under `key`/`nonce`, binding `aad`. Returns
/// `ciphertext || tag`.
pub fn aead_seal(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key));
    cipher
        .encrypt(GenericArray::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|e| CryptoError::Encryption(e.to_string()))
}

/// Open a ciphertext produced by [`aead_seal`]. Any authentication failure
/// collapses to [`CryptoError::Decryption`] — this is the only signal the
/// storage engine is allowed to see when a password is wrong or a file is
/// tampered with.
pub fn aead_open(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key));
    cipher
        .decrypt(GenericArray::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::Decryption)
}

/// Fill a fresh buffer of `n` bytes from the OS CSPRNG.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/// Fill a fresh nonce from the OS CSPRNG.
pub fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Fill a fresh 32-byte key (vault key, salt, etc.) from the OS CSPRNG.
pub fn random_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

/// HMAC-SHA256 over `data` under `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts a key of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Overwrite `buf` with zeros in a way the compiler cannot elide.
pub fn zeroize(buf: &mut [u8]) {
    buf.zeroize();
}

/// Constant-time byte equality. Used anywhere a secret-derived value is
/// compared (HMAC tags, recovery candidates) so that comparison timing
/// cannot leak which byte first differed.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Capability seam over the primitives above (§9 Design Notes). Production
/// code uses [`SystemCrypto`]; tests can substitute a provider with a fixed
/// nonce/iteration count to keep the suite fast and deterministic.
pub trait CryptoProvider {
    fn derive_kek(&self, password: &[u8], salt: &[u8], iterations: u32) -> [u8; KEY_LEN];
    fn aead_seal(&self, key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn aead_open(&self, key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn random_bytes(&self, n: usize) -> Vec<u8>;
    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> [u8; 32];
}

/// The real, OS-CSPRNG-backed implementation of [`CryptoProvider`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCrypto;

impl CryptoProvider for SystemCrypto {
    fn derive_kek(&self, password: &[u8], salt: &[u8], iterations: u32) -> [u8; KEY_LEN] {
        derive_kek(password, salt, iterations)
    }

    fn aead_seal(&self, key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        aead_seal(key, nonce, plaintext, aad)
    }

    fn aead_open(&self, key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        aead_open(key, nonce, ciphertext, aad)
    }

    fn random_bytes(&self, n: usize) -> Vec<u8> {
        random_bytes(n)
    }

    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> [u8; 32] {
        hmac_sha256(key, data)
    }
}
