//! Error types shared across the cairn engine.
use thiserror::Error;

/// Key-tree derivation failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DerivationError {
    #[error("malformed derivation path: {0}")] MalformedPath(String),
    #[error("hardened step {0} requires the parent private key")] HardenedFromPublic(String),
    #[error("bip32: {0}")] Bip32(String),
    #[error("invalid multisig configuration: {0}")] InvalidMultisig(String),
    #[error("uncompressed public key at {0}")] UncompressedKey(String),
    #[error("{0} accounts cannot derive child keys")] UnsupportedAccount(&'static str),
}

/// Failures surfaced by the blockchain data provider collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("provider unavailable: {0}")] Unavailable(String),
    #[error("timeout")] Timeout,
    #[error("broadcast rejected: {0}")] Rejected(String),
    #[error("malformed provider response: {0}")] Malformed(String),
}

/// Failures surfaced by the secret storage collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("no secret stored for wallet {0}")] NotFound(String),
    #[error("secret storage is locked")] Locked,
    #[error("secret storage: {0}")] Backend(String),
}
