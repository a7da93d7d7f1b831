//! Explicit unlocked-session context.
//!
//! A [`Session`] is the only holder of decrypted key material. It is passed
//! by reference into every call that needs to sign and is zeroized on
//! [`Session::lock`] or drop.

use std::fmt;

use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint};
use bitcoin::secp256k1::SecretKey;
use bitcoin::{CompressedPublicKey, Network};
use tracing::debug;

use cairn_core::error::{DerivationError, StorageError};
use cairn_core::traits::{SecretStorage, StoredSecret};

use crate::error::WalletError;
use crate::keys::{AccountKey, KeyDeriver, Seed, SigningKey};

/// Capability to fetch the private key for a derivation path.
///
/// The assembler borrows one key per input and drops it right after signing.
pub trait KeyProvider {
    fn signing_key(&self, path: &DerivationPath) -> Result<SigningKey, WalletError>;
}

impl<F> KeyProvider for F
where
    F: Fn(&DerivationPath) -> Result<SigningKey, DerivationError>,
{
    fn signing_key(&self, path: &DerivationPath) -> Result<SigningKey, WalletError> {
        Ok(self(path)?)
    }
}

/// Secret of a non-HD imported key.
pub struct ImportedKey {
    secret: SecretKey,
    network: Network,
}

impl ImportedKey {
    pub fn from_bytes(bytes: &[u8; 32], network: Network) -> Result<Self, DerivationError> {
        let secret = SecretKey::from_slice(bytes)
            .map_err(|e| DerivationError::Bip32(format!("imported key: {e}")))?;
        Ok(Self { secret, network })
    }

    pub fn network(&self) -> Network {
        self.network
    }
}

impl Drop for ImportedKey {
    fn drop(&mut self) {
        self.secret.non_secure_erase();
    }
}

impl fmt::Debug for ImportedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportedKey")
            .field("secret", &"[REDACTED]")
            .field("network", &self.network)
            .finish()
    }
}

/// Key material held while a session is unlocked.
#[derive(Debug)]
pub enum SessionSecret {
    Seed(Seed),
    ImportedKey(ImportedKey),
}

#[derive(Debug)]
enum SessionState {
    Locked,
    Unlocked(SessionSecret),
}

/// Lock/unlock lifecycle around the wallet's secret.
#[derive(Debug)]
pub struct Session {
    deriver: KeyDeriver,
    state: SessionState,
}

impl Session {
    /// A locked session for `network`.
    pub fn new(network: Network) -> Self {
        Self {
            deriver: KeyDeriver::new(network),
            state: SessionState::Locked,
        }
    }

    pub fn network(&self) -> Network {
        self.deriver.network()
    }

    pub fn unlock_with_seed(&mut self, seed: Seed) {
        self.state = SessionState::Unlocked(SessionSecret::Seed(seed));
        debug!("session unlocked with seed");
    }

    pub fn unlock_with_imported_key(&mut self, key: ImportedKey) -> Result<(), WalletError> {
        if key.network() != self.network() {
            return Err(StorageError::Backend(format!(
                "imported key is for {}, session is {}",
                key.network(),
                self.network()
            ))
            .into());
        }
        self.state = SessionState::Unlocked(SessionSecret::ImportedKey(key));
        debug!("session unlocked with imported key");
        Ok(())
    }

    /// Unlock with whatever the storage collaborator holds for `wallet_id`.
    pub fn unlock_from(
        &mut self,
        storage: &dyn SecretStorage,
        wallet_id: &str,
    ) -> Result<(), WalletError> {
        match storage.load_secret(wallet_id)? {
            StoredSecret::Seed(bytes) => {
                let seed = Seed::from_slice(&bytes)?;
                self.unlock_with_seed(seed);
                Ok(())
            }
            StoredSecret::ImportedKey { secret, network } => {
                let key = ImportedKey::from_bytes(&secret, network)?;
                self.unlock_with_imported_key(key)
            }
        }
    }

    /// Drop and zeroize the held secret.
    pub fn lock(&mut self) {
        if self.is_unlocked() {
            self.state = SessionState::Locked;
            debug!("session locked");
        }
    }

    pub fn is_unlocked(&self) -> bool {
        matches!(self.state, SessionState::Unlocked(_))
    }

    fn secret(&self) -> Result<&SessionSecret, WalletError> {
        match &self.state {
            SessionState::Unlocked(secret) => Ok(secret),
            SessionState::Locked => Err(WalletError::SessionLocked),
        }
    }

    fn seed(&self) -> Result<&Seed, WalletError> {
        match self.secret()? {
            SessionSecret::Seed(seed) => Ok(seed),
            SessionSecret::ImportedKey(_) => {
                Err(DerivationError::UnsupportedAccount("imported-key").into())
            }
        }
    }

    /// Master key fingerprint of the unlocked seed.
    pub fn master_fingerprint(&self) -> Result<Fingerprint, WalletError> {
        Ok(self.deriver.master_fingerprint(self.seed()?)?)
    }

    /// Account-level xpub for registering an account or sharing with co-signers.
    pub fn account_xpub(&self, path: &DerivationPath) -> Result<AccountKey, WalletError> {
        Ok(self.deriver.account_xpub(self.seed()?, path)?)
    }

    /// Public key of the unlocked imported key.
    pub fn imported_public_key(&self) -> Result<CompressedPublicKey, WalletError> {
        match self.secret()? {
            SessionSecret::ImportedKey(key) => {
                Ok(SigningKey::new(self.deriver.secp(), key.secret).public_key())
            }
            SessionSecret::Seed(_) => Err(WalletError::Signing(
                "session holds a seed, not an imported key".into(),
            )),
        }
    }
}

impl KeyProvider for Session {
    /// Seed sessions derive along `path`; an imported key answers only the
    /// empty path `m`.
    fn signing_key(&self, path: &DerivationPath) -> Result<SigningKey, WalletError> {
        match self.secret()? {
            SessionSecret::Seed(seed) => Ok(self.deriver.signing_key(seed, path)?),
            SessionSecret::ImportedKey(key) => {
                let steps: &[ChildNumber] = path.as_ref();
                if !steps.is_empty() {
                    return Err(DerivationError::UnsupportedAccount("imported-key").into());
                }
                Ok(SigningKey::new(self.deriver.secp(), key.secret))
            }
        }
    }
}
