//! # cairn-wallet — transaction construction and privacy engine.
//!
//! Derives keys and addresses for single-signature, multisig and imported-key
//! accounts, tracks address usage, selects coins with randomized ordering,
//! mints a fresh change address for every transaction and signs locally or
//! emits unsigned PSBTs for co-signers.
//!
//! # Modules
//!
//! - [`error`] — `WalletError` enum
//! - [`keys`] — Seed, BIP-32 derivation, address and multisig script construction
//! - [`mnemonic`] — BIP-39 generation, validation and seed stretching
//! - [`session`] — Locked/unlocked key material and the `KeyProvider` seam
//! - [`ledger`] — Address ledger: derivation cursors and usage tracking
//! - [`change`] — Fresh change address allocation
//! - [`coin_selection`] — Randomized UTXO selection with fee and dust rules
//! - [`privacy`] — Round-amount detection, amount and timing jitter
//! - [`builder`] — Transaction assembly and signing
//! - [`psbt`] — Unsigned multisig PSBTs, co-signing and finalization
//! - [`config`] — Engine configuration
//! - [`wallet`] — Async composition over a blockchain provider

pub mod builder;
pub mod change;
pub mod coin_selection;
pub mod config;
pub mod error;
pub mod keys;
pub mod ledger;
pub mod mnemonic;
pub mod privacy;
pub mod psbt;
pub mod session;
pub mod wallet;

// Re-exports for convenient access
pub use builder::{Recipient, SignedTransaction, TransactionAssembler, TransactionDraft};
pub use change::{ChangeAllocator, ChangeDestination};
pub use coin_selection::{CoinSelector, SelectionRequest, SelectionResult, SelectionStrategy};
pub use config::{EngineConfig, PrivacyConfig};
pub use error::WalletError;
pub use keys::{KeyDeriver, Seed};
pub use ledger::AddressLedger;
pub use mnemonic::{generate_mnemonic, mnemonic_to_seed, validate_mnemonic};
pub use privacy::{is_round_amount, jitter_delay, randomize_amount, JitterRange};
pub use psbt::{sign_psbt, UnsignedPsbt};
pub use session::{KeyProvider, Session};
pub use wallet::{SendReport, Wallet};
