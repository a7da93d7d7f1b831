//! Wallet error types.

use cairn_core::error::{DerivationError, NetworkError, StorageError};
use thiserror::Error;

/// Errors that can occur in engine operations.
///
/// Every failure is terminal for the current operation: no partially built
/// or partially signed transaction is ever returned alongside an error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    /// Candidate inputs do not even cover the payment amount.
    #[error("insufficient funds: have {available}, need {required} (short by {shortfall})")]
    InsufficientFunds {
        /// Total value of all candidates in satoshis.
        available: u64,
        /// Target plus the fee of spending every candidate.
        required: u64,
        /// `required - available`.
        shortfall: u64,
    },

    /// Candidates cover the payment but not the fee on top of it.
    #[error(
        "insufficient funds after fee: have {available}, need {required} (short by {shortfall})"
    )]
    InsufficientFundsAfterFee {
        /// Total value of all candidates in satoshis.
        available: u64,
        /// Target plus the fee of spending every candidate.
        required: u64,
        /// `required - available`.
        shortfall: u64,
    },

    /// Invalid monetary amount.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Recipient address failed checksum or network validation.
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    /// Key lookup or signature creation failed for an input.
    #[error("signing failed: {0}")]
    Signing(String),

    /// PSBT construction, decoding or finalization failure.
    #[error("psbt: {0}")]
    Psbt(String),

    /// No account registered under this index.
    #[error("unknown account: {0}")]
    UnknownAccount(u32),

    /// Address was not handed out by the ledger.
    #[error("unknown address: {0}")]
    UnknownAddress(String),

    /// Account already registered under this index.
    #[error("account {0} already registered")]
    DuplicateAccount(u32),

    /// Account kind has no internal chain to draw change from.
    #[error("account {0} has no change chain")]
    NoChangeChain(u32),

    /// Operation needs key material but the session is locked.
    #[error("session is locked")]
    SessionLocked,

    /// Invalid BIP-39 mnemonic phrase.
    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    /// Serialization error.
    #[error("serialization: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(String),

    /// Ledger file is corrupted or has invalid format.
    #[error("corrupted file: {0}")]
    CorruptedFile(String),

    /// Key derivation failure.
    #[error(transparent)]
    Derivation(#[from] DerivationError),

    /// Blockchain data provider failure.
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// Secret storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl WalletError {
    /// Shortfall in satoshis for the two funds errors.
    pub fn shortfall(&self) -> Option<u64> {
        match self {
            WalletError::InsufficientFunds { shortfall, .. }
            | WalletError::InsufficientFundsAfterFee { shortfall, .. } => Some(*shortfall),
            _ => None,
        }
    }
}
