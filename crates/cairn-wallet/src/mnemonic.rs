//! BIP-39 mnemonic generation and seed recovery.

use bip39::{Language, Mnemonic};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::WalletError;
use crate::keys::Seed;

/// Word counts BIP-39 defines.
pub const VALID_WORD_COUNTS: [usize; 5] = [12, 15, 18, 21, 24];

/// Generate a fresh English mnemonic from OS entropy.
pub fn generate_mnemonic(words: usize) -> Result<String, WalletError> {
    if !VALID_WORD_COUNTS.contains(&words) {
        return Err(WalletError::InvalidMnemonic(format!(
            "word count must be one of {VALID_WORD_COUNTS:?}, got {words}"
        )));
    }
    // 11 bits per word, 1 checksum bit per 32 bits of entropy
    let mut entropy = Zeroizing::new(vec![0u8; words * 4 / 3]);
    rand::rngs::OsRng.fill_bytes(&mut entropy);
    let m = Mnemonic::from_entropy_in(Language::English, &entropy)
        .map_err(|e| WalletError::InvalidMnemonic(e.to_string()))?;
    Ok(m.to_string())
}

fn normalize(phrase: &str) -> String {
    phrase
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Check a phrase's words and checksum without deriving a seed.
pub fn validate_mnemonic(phrase: &str) -> Result<(), WalletError> {
    Mnemonic::parse_in(Language::English, normalize(phrase))
        .map(|_| ())
        .map_err(|e| WalletError::InvalidMnemonic(e.to_string()))
}

/// Parse a BIP-39 mnemonic phrase and stretch it into a 64-byte seed.
///
/// Normalizes whitespace and converts to lowercase before parsing.
pub fn mnemonic_to_seed(phrase: &str, passphrase: &str) -> Result<Seed, WalletError> {
    let normalized = Zeroizing::new(normalize(phrase));
    let m = Mnemonic::parse_in(Language::English, normalized.as_str())
        .map_err(|e| WalletError::InvalidMnemonic(e.to_string()))?;
    let bytes = Zeroizing::new(m.to_seed(passphrase));
    Ok(Seed::from_bytes(*bytes))
}
