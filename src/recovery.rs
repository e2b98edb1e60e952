//! Mnemonic Recovery Module
//!
//! BIP39 24-word mnemonic escrow for the vault key, with a 6-of-24 word
//! challenge so a lost master password does not require copying down the
//! full phrase every time recovery is exercised (§4.7). The holder supplies
//! only the six challenge words; the remaining eighteen positions are
//! reconstructed by checking every BIP39 wordlist entry against a
//! per-position commitment, without ever storing the words themselves.
//! Grounded on `examples/r4-ndm-Vaughan/src/wallet/manager.rs`'s
//! `Mnemonic::from_entropy`/`to_seed` usage and its PBKDF2-HMAC-SHA256 KDF
//! call pattern, generalized to the independent-salt, key-wrapping design
//! this spec requires.

use bip39::{Language, Mnemonic};
use secrecy::{ExposeSecret, SecretString};

use crate::clock::IndexRng;
use crate::crypto::{self, KEY_LEN};
use crate::error::{VaultCoreError, VaultResult};
use crate::model::RecoveryDescriptor;

/// Number of words in the generated mnemonic (24 words = 256 bits of
/// entropy, BIP39's maximum strength).
pub const WORD_COUNT: usize = 24;
/// Number of words the holder is challenged on during recovery.
pub const CHALLENGE_WORD_COUNT: usize = 6;
/// Number of words verified in the post-setup spot-check (§9 Open Question 1).
pub const VERIFICATION_WORD_COUNT: usize = 3;
/// PBKDF2 iterations for the recovery-path KEK. Independent of, and need
/// not match, the password-path iteration count.
pub const RECOVERY_KDF_ITERATIONS: u32 = 600_000;

/// Freshly generated recovery material: the full phrase (shown to the
/// holder exactly once) plus the descriptor persisted alongside the vault.
pub struct RecoverySetup {
    pub mnemonic: Mnemonic,
    pub descriptor: RecoveryDescriptor,
}

/// Generate a fresh 24-word mnemonic, derive a KEK from it (optionally
/// salted further by a 25th-word `passphrase`, §4.4/§4.7), and wrap
/// `vault_key` under that KEK. The caller is responsible for persisting
/// `descriptor` alongside the vault and for displaying `mnemonic` to the
/// user exactly once.
pub fn setup_recovery(vault_key: &[u8; KEY_LEN], rng: &dyn IndexRng, passphrase: Option<&SecretString>) -> VaultResult<RecoverySetup> {
    let entropy = crypto::random_bytes(32); // 256 bits -> 24 words
    let mnemonic = Mnemonic::from_entropy(&entropy).map_err(|e| VaultCoreError::InvalidArgument(e.to_string()))?;
    let words: Vec<&str> = mnemonic.words().collect();

    let salt = crypto::random_bytes(32);
    let seed = mnemonic.to_seed(passphrase.map(|p| p.expose_secret()).unwrap_or(""));
    let kek = crypto::derive_kek(&seed, &salt, RECOVERY_KDF_ITERATIONS);

    let nonce = crypto::random_nonce();
    let wrapped_key_ciphertext = crypto::aead_seal(&kek, &nonce, vault_key, b"pass-cli/recovery-wrap")?;

    let challenge_positions = pick_positions(rng, CHALLENGE_WORD_COUNT, WORD_COUNT);

    let commitment_salt = crypto::random_bytes(32);
    let word_commitments: Vec<(u8, [u8; 32])> = (0..WORD_COUNT as u8)
        .filter(|pos| !challenge_positions.contains(pos))
        .map(|pos| (pos, commit_word(&commitment_salt, words[pos as usize])))
        .collect();

    let descriptor = RecoveryDescriptor {
        enabled: true,
        passphrase_required: passphrase.is_some(),
        challenge_positions,
        salt,
        iterations: RECOVERY_KDF_ITERATIONS,
        commitment_salt,
        word_commitments,
        wrapped_key_ciphertext,
        wrapped_key_nonce: nonce,
    };

    Ok(RecoverySetup { mnemonic, descriptor })
}

/// Choose `count` distinct positions out of `[0, max)`, via partial
/// Fisher-Yates over an index list so every position is equally likely and
/// none repeats. Reused for both the 6-word recovery challenge and the
/// 3-word post-setup verification spot-check.
pub fn pick_positions(rng: &dyn IndexRng, count: usize, max: usize) -> Vec<u8> {
    let mut positions: Vec<u8> = (0..max as u8).collect();
    for i in 0..count {
        let remaining = max - i;
        let pick = i + rng.gen_below(remaining);
        positions.swap(i, pick);
    }
    let mut chosen = positions[..count].to_vec();
    chosen.sort_unstable();
    chosen
}

fn commit_word(commitment_salt: &[u8], word: &str) -> [u8; 32] {
    crypto::hmac_sha256(commitment_salt, word.as_bytes())
}

/// Recovery path: the holder supplies only the `CHALLENGE_WORD_COUNT` words
/// at `descriptor.challenge_positions`, in that same position order. Every
/// other position is reconstructed by checking each of the 2048 BIP39
/// English words against its stored commitment, visiting the full wordlist
/// for every position regardless of when a match is found — so how long
/// reconstruction takes never leaks which candidate succeeded (§4.7).
pub fn unwrap_with_challenge_words(
    descriptor: &RecoveryDescriptor,
    challenge_words: &[SecretString],
    passphrase: Option<&SecretString>,
) -> VaultResult<[u8; KEY_LEN]> {
    if challenge_words.len() != descriptor.challenge_positions.len() {
        return Err(VaultCoreError::RecoveryFailed);
    }

    let wordlist: &'static [&'static str; 2048] = Language::English.word_list();
    let mut words: Vec<Option<String>> = vec![None; WORD_COUNT];
    for (&pos, supplied) in descriptor.challenge_positions.iter().zip(challenge_words.iter()) {
        let idx = pos as usize;
        if idx >= WORD_COUNT {
            return Err(VaultCoreError::RecoveryFailed);
        }
        words[idx] = Some(supplied.expose_secret().trim().to_lowercase());
    }

    for &(pos, ref commitment) in &descriptor.word_commitments {
        let idx = pos as usize;
        if idx >= WORD_COUNT {
            return Err(VaultCoreError::RecoveryFailed);
        }
        let mut found: Option<&'static str> = None;
        // Scan every candidate unconditionally; never short-circuit on match.
        for &candidate in wordlist.iter() {
            let tag = commit_word(&descriptor.commitment_salt, candidate);
            let matches = crypto::ct_eq(&tag, commitment);
            if matches {
                found = Some(candidate);
            }
        }
        match found {
            Some(word) => words[idx] = Some(word.to_string()),
            None => return Err(VaultCoreError::RecoveryFailed),
        }
    }

    let reconstructed: Vec<String> = words.into_iter().collect::<Option<Vec<String>>>().ok_or(VaultCoreError::RecoveryFailed)?;
    let phrase = reconstructed.join(" ");
    let mnemonic = Mnemonic::parse_in(Language::English, &phrase).map_err(|_| VaultCoreError::RecoveryFailed)?;

    let seed = mnemonic.to_seed(passphrase.map(|p| p.expose_secret()).unwrap_or(""));
    let kek = crypto::derive_kek(&seed, &descriptor.salt, descriptor.iterations);
    let plaintext = crypto::aead_open(&kek, &descriptor.wrapped_key_nonce, &descriptor.wrapped_key_ciphertext, b"pass-cli/recovery-wrap")
        .map_err(|_| VaultCoreError::RecoveryFailed)?;
    plaintext.try_into().map_err(|_| VaultCoreError::RecoveryFailed)
}

/// Check that the words at `positions` match the corresponding words of a
/// candidate mnemonic, without ever needing to unwrap anything — used at
/// setup time to confirm the holder actually wrote the phrase down
/// correctly (the 3-of-24 spot check referenced by §9 Open Question 1).
pub fn check_words_at_positions(candidate: &Mnemonic, positions: &[u8], expected_words: &[&str]) -> bool {
    let words: Vec<&str> = candidate.words().collect();
    if expected_words.len() != positions.len() {
        return false;
    }
    positions.iter().zip(expected_words.iter()).all(|(&pos, expected)| {
        words.get(pos as usize).map(|w| crypto::ct_eq(w.as_bytes(), expected.to_lowercase().as_bytes())).unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemRng;

    #[test]
    fn setup_then_challenge_words_unwrap_roundtrips() {
        let vault_key = crypto::random_key();
        let rng = SystemRng;
        let setup = setup_recovery(&vault_key, &rng, None).unwrap();
        assert!(!setup.descriptor.passphrase_required);

        let words: Vec<&str> = setup.mnemonic.words().collect();
        let challenge_words: Vec<SecretString> =
            setup.descriptor.challenge_positions.iter().map(|&p| SecretString::from(words[p as usize].to_string())).collect();

        let recovered = unwrap_with_challenge_words(&setup.descriptor, &challenge_words, None).unwrap();
        assert_eq!(recovered, vault_key);
    }

    #[test]
    fn setup_with_passphrase_requires_the_same_passphrase_to_recover() {
        let vault_key = crypto::random_key();
        let rng = SystemRng;
        let passphrase = SecretString::from("correct horse battery staple".to_string());
        let setup = setup_recovery(&vault_key, &rng, Some(&passphrase)).unwrap();
        assert!(setup.descriptor.passphrase_required);

        let words: Vec<&str> = setup.mnemonic.words().collect();
        let challenge_words: Vec<SecretString> =
            setup.descriptor.challenge_positions.iter().map(|&p| SecretString::from(words[p as usize].to_string())).collect();

        assert!(unwrap_with_challenge_words(&setup.descriptor, &challenge_words, None).is_err());
        let recovered = unwrap_with_challenge_words(&setup.descriptor, &challenge_words, Some(&passphrase)).unwrap();
        assert_eq!(recovered, vault_key);
    }

    #[test]
    fn wrong_challenge_word_fails_without_panicking() {
        let vault_key = crypto::random_key();
        let rng = SystemRng;
        let setup = setup_recovery(&vault_key, &rng, None).unwrap();

        let words: Vec<&str> = setup.mnemonic.words().collect();
        let mut challenge_words: Vec<SecretString> =
            setup.descriptor.challenge_positions.iter().map(|&p| SecretString::from(words[p as usize].to_string())).collect();
        challenge_words[0] = SecretString::from("zzzznotaword".to_string());

        let result = unwrap_with_challenge_words(&setup.descriptor, &challenge_words, None);
        assert!(matches!(result, Err(VaultCoreError::RecoveryFailed)));
    }

    #[test]
    fn wrong_number_of_challenge_words_fails_cleanly() {
        let vault_key = crypto::random_key();
        let rng = SystemRng;
        let setup = setup_recovery(&vault_key, &rng, None).unwrap();

        let too_few = vec![SecretString::from("abandon".to_string())];
        let result = unwrap_with_challenge_words(&setup.descriptor, &too_few, None);
        assert!(matches!(result, Err(VaultCoreError::RecoveryFailed)));
    }

    #[test]
    fn challenge_positions_are_six_distinct_values_in_range() {
        let rng = SystemRng;
        let positions = pick_positions(&rng, CHALLENGE_WORD_COUNT, WORD_COUNT);
        assert_eq!(positions.len(), CHALLENGE_WORD_COUNT);
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), CHALLENGE_WORD_COUNT);
        assert!(positions.iter().all(|&p| (p as usize) < WORD_COUNT));
    }

    #[test]
    fn verification_positions_are_distinct_and_disjoint_from_challenge() {
        let rng = SystemRng;
        let vault_key = crypto::random_key();
        let setup = setup_recovery(&vault_key, &rng, None).unwrap();
        let verify_positions = pick_positions(&rng, VERIFICATION_WORD_COUNT, WORD_COUNT);
        assert_eq!(verify_positions.len(), VERIFICATION_WORD_COUNT);
        let mut sorted = verify_positions.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), VERIFICATION_WORD_COUNT);
        let _ = setup; // descriptor not required for position selection itself
    }

    #[test]
    fn check_words_at_positions_matches_correct_words_only() {
        let vault_key = crypto::random_key();
        let rng = SystemRng;
        let setup = setup_recovery(&vault_key, &rng, None).unwrap();
        let words: Vec<&str> = setup.mnemonic.words().collect();
        let positions = &setup.descriptor.challenge_positions;
        let expected: Vec<&str> = positions.iter().map(|&p| words[p as usize]).collect();

        assert!(check_words_at_positions(&setup.mnemonic, positions, &expected));

        let mut wrong = expected.clone();
        wrong[0] = "zzzznotaword";
        assert!(!check_words_at_positions(&setup.mnemonic, positions, &wrong));
    }
}
