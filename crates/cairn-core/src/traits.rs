//! Collaborator interfaces the engine is written against.
//!
//! - [`BlockchainProvider`] — UTXO lookup and broadcast (network-facing, async)
//! - [`SecretStorage`] — supplies decrypted key material for an unlocked session
//! - [`ContactBook`] — advisory lookup of destination rotation support
//!
//! The engine never persists secrets and never retries network calls itself.

use async_trait::async_trait;
use bitcoin::bip32::Xpub;
use bitcoin::{Network, Transaction, Txid};
use zeroize::Zeroizing;

use crate::error::{NetworkError, StorageError};
use crate::types::CandidateUtxo;

/// Source of UTXO data and sink for finished transactions.
///
/// UTXO data is trusted as supplied; the engine performs no SPV checks.
#[async_trait]
pub trait BlockchainProvider: Send + Sync {
    /// Unspent outputs currently locked to `address`.
    async fn get_utxos(&self, address: &str) -> Result<Vec<CandidateUtxo>, NetworkError>;

    /// Relay a fully signed transaction, returning its txid.
    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, NetworkError>;
}

/// Decrypted key material handed to a session for its lifetime.
pub enum StoredSecret {
    /// BIP-39 seed bytes (64 bytes after PBKDF2).
    Seed(Zeroizing<Vec<u8>>),
    /// Raw 32-byte secret of a non-HD imported key.
    ImportedKey {
        secret: Zeroizing<[u8; 32]>,
        network: Network,
    },
}

impl std::fmt::Debug for StoredSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoredSecret::Seed(_) => f.write_str("StoredSecret::Seed([REDACTED])"),
            StoredSecret::ImportedKey { network, .. } => f
                .debug_struct("StoredSecret::ImportedKey")
                .field("secret", &"[REDACTED]")
                .field("network", network)
                .finish(),
        }
    }
}

/// Encrypted-at-rest secret store. Decryption happens on the storage side.
pub trait SecretStorage: Send + Sync {
    fn load_secret(&self, wallet_id: &str) -> Result<StoredSecret, StorageError>;
}

/// What the contact book knows about a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactDestination {
    /// Contact shared an extended public key; fresh addresses can be derived per payment.
    Rotating { xpub: Xpub },
    /// Contact only ever receives at one address.
    Fixed { address: String },
}

/// Read-only address book lookup. Purely advisory.
pub trait ContactBook: Send + Sync {
    fn lookup(&self, destination: &str) -> Option<ContactDestination>;

    /// Whether payments to `destination` can rotate addresses.
    ///
    /// Default implementation: true only for [`ContactDestination::Rotating`].
    fn supports_rotation(&self, destination: &str) -> bool {
        matches!(self.lookup(destination), Some(ContactDestination::Rotating { .. }))
    }
}
