//! Protocol and policy constants. All monetary values in satoshis.

/// Satoshis per bitcoin.
pub const COIN: u64 = 100_000_000;

/// Standard relay dust limit for the most expensive common output (P2PKH at
/// 3 sat/vB). A change output below this value is never created.
pub const DUST_THRESHOLD: u64 = 546;

/// Minimum number of trailing decimal zeros for an amount to count as "round".
pub const ROUND_AMOUNT_TRAILING_ZEROS: u32 = 3;

/// Default relative perturbation applied by amount randomization (0.1%).
pub const DEFAULT_VARIANCE_FRACTION: f64 = 0.001;

/// Largest co-signer count a bare `OP_CHECKMULTISIG` template may carry while
/// staying within standard P2WSH/P2SH policy.
pub const MAX_MULTISIG_KEYS: u8 = 15;

// --- BIP-43 purposes ---------------------------------------------------------

/// BIP-44 purpose (legacy P2PKH accounts).
pub const PURPOSE_LEGACY: u32 = 44;

/// BIP-49 purpose (P2SH-wrapped P2WPKH accounts).
pub const PURPOSE_WRAPPED_SEGWIT: u32 = 49;

/// BIP-84 purpose (native P2WPKH accounts).
pub const PURPOSE_NATIVE_SEGWIT: u32 = 84;

/// BIP-48 purpose (multisig accounts).
pub const PURPOSE_MULTISIG: u32 = 48;

/// BIP-48 script-type level for P2SH-P2WSH.
pub const BIP48_SCRIPT_WRAPPED: u32 = 1;

/// BIP-48 script-type level for native P2WSH.
pub const BIP48_SCRIPT_NATIVE: u32 = 2;

/// SLIP-44 coin type for Bitcoin mainnet.
pub const COIN_TYPE_MAINNET: u32 = 0;

/// SLIP-44 coin type shared by every test network.
pub const COIN_TYPE_TESTNET: u32 = 1;

// --- Transaction weight model (weight units, 4 WU = 1 vbyte) ---------------

/// Weight of `nVersion` + `nLockTime`.
pub const TX_FIXED_WEIGHT: u64 = 4 * (4 + 4);

/// Weight of the segwit marker and flag bytes, paid once per transaction
/// that spends at least one witness input.
pub const SEGWIT_MARKER_WEIGHT: u64 = 2;

/// Non-witness bytes shared by every input: outpoint (36) + nSequence (4).
pub const INPUT_BASE_BYTES: u64 = 36 + 4;

/// Worst-case DER ECDSA signature plus sighash byte.
pub const ECDSA_SIG_BYTES: u64 = 72;

/// Compressed secp256k1 public key.
pub const PUBKEY_BYTES: u64 = 33;

/// `scriptPubKey` length of a P2PKH output.
pub const P2PKH_SCRIPT_LEN: u64 = 25;

/// `scriptPubKey` length of a P2SH output.
pub const P2SH_SCRIPT_LEN: u64 = 23;

/// `scriptPubKey` length of a P2WPKH output.
pub const P2WPKH_SCRIPT_LEN: u64 = 22;

/// `scriptPubKey` length of a P2WSH output.
pub const P2WSH_SCRIPT_LEN: u64 = 34;

/// Value field of every output.
pub const OUTPUT_VALUE_BYTES: u64 = 8;
