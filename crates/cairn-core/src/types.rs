//! Domain types shared by the key manager, ledger, selector and assembler.

use std::collections::HashSet;
use std::fmt;

use bitcoin::bip32::{DerivationPath, Fingerprint, Xpub};
use bitcoin::{Network, OutPoint, PublicKey};
use serde::{Deserialize, Serialize};

use crate::constants::{
    BIP48_SCRIPT_NATIVE, BIP48_SCRIPT_WRAPPED, COIN_TYPE_MAINNET, COIN_TYPE_TESTNET,
    MAX_MULTISIG_KEYS, PURPOSE_LEGACY, PURPOSE_MULTISIG, PURPOSE_NATIVE_SEGWIT,
    PURPOSE_WRAPPED_SEGWIT,
};
use crate::error::DerivationError;
use crate::weight;

/// Script family an account's addresses are built from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressType {
    /// P2PKH (BIP-44).
    Legacy,
    /// P2SH-wrapped segwit v0 (BIP-49, or BIP-48 script type 1).
    WrappedSegwit,
    /// Native segwit v0 (BIP-84, or BIP-48 script type 2).
    NativeSegwit,
}

impl AddressType {
    /// BIP-43 purpose for single-signature accounts of this type.
    pub fn purpose(&self) -> u32 {
        match self {
            AddressType::Legacy => PURPOSE_LEGACY,
            AddressType::WrappedSegwit => PURPOSE_WRAPPED_SEGWIT,
            AddressType::NativeSegwit => PURPOSE_NATIVE_SEGWIT,
        }
    }

    /// BIP-48 script-type level. Legacy has no multisig template.
    pub fn bip48_script_type(&self) -> Option<u32> {
        match self {
            AddressType::Legacy => None,
            AddressType::WrappedSegwit => Some(BIP48_SCRIPT_WRAPPED),
            AddressType::NativeSegwit => Some(BIP48_SCRIPT_NATIVE),
        }
    }

    pub fn is_segwit(&self) -> bool {
        !matches!(self, AddressType::Legacy)
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AddressType::Legacy => "legacy",
            AddressType::WrappedSegwit => "wrapped-segwit",
            AddressType::NativeSegwit => "native-segwit",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for AddressType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "legacy" | "p2pkh" => Ok(AddressType::Legacy),
            "wrapped-segwit" | "p2sh-p2wpkh" => Ok(AddressType::WrappedSegwit),
            "native-segwit" | "p2wpkh" => Ok(AddressType::NativeSegwit),
            other => Err(format!("unknown address type: {other}")),
        }
    }
}

/// BIP-44 chain split between receive and change branches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    /// Receive addresses (`/0/*`).
    External,
    /// Change addresses (`/1/*`).
    Internal,
}

impl Chain {
    /// Path level for this chain.
    pub fn index(&self) -> u32 {
        match self {
            Chain::External => 0,
            Chain::Internal => 1,
        }
    }
}

/// SLIP-44 coin type for a network.
pub fn coin_type(network: Network) -> u32 {
    match network {
        Network::Bitcoin => COIN_TYPE_MAINNET,
        _ => COIN_TYPE_TESTNET,
    }
}

/// Spending template of an output: determines its weight as an input and the
/// shape of the signatures needed to spend it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScriptTemplate {
    P2pkh,
    P2shP2wpkh,
    P2wpkh,
    P2shP2wsh { m: u8, n: u8 },
    P2wsh { m: u8, n: u8 },
}

impl ScriptTemplate {
    /// Single-key template for an address type.
    pub fn single(address_type: AddressType) -> Self {
        match address_type {
            AddressType::Legacy => ScriptTemplate::P2pkh,
            AddressType::WrappedSegwit => ScriptTemplate::P2shP2wpkh,
            AddressType::NativeSegwit => ScriptTemplate::P2wpkh,
        }
    }

    /// M-of-N template for an address type. Legacy bare P2SH multisig is not offered.
    pub fn multisig(address_type: AddressType, m: u8, n: u8) -> Result<Self, DerivationError> {
        validate_threshold(m, n)?;
        match address_type {
            AddressType::Legacy => Err(DerivationError::InvalidMultisig(
                "legacy multisig is not supported".into(),
            )),
            AddressType::WrappedSegwit => Ok(ScriptTemplate::P2shP2wsh { m, n }),
            AddressType::NativeSegwit => Ok(ScriptTemplate::P2wsh { m, n }),
        }
    }

    pub fn address_type(&self) -> AddressType {
        match self {
            ScriptTemplate::P2pkh => AddressType::Legacy,
            ScriptTemplate::P2shP2wpkh | ScriptTemplate::P2shP2wsh { .. } => {
                AddressType::WrappedSegwit
            }
            ScriptTemplate::P2wpkh | ScriptTemplate::P2wsh { .. } => AddressType::NativeSegwit,
        }
    }

    pub fn is_segwit(&self) -> bool {
        self.address_type().is_segwit()
    }

    pub fn is_multisig(&self) -> bool {
        matches!(
            self,
            ScriptTemplate::P2shP2wsh { .. } | ScriptTemplate::P2wsh { .. }
        )
    }

    /// Weight this template contributes when spent as an input.
    pub fn input_weight(&self) -> u64 {
        weight::input_weight(*self)
    }

    /// Weight of an output paying to this template.
    pub fn output_weight(&self) -> u64 {
        weight::output_weight_for_script_len(self.script_pubkey_len())
    }

    /// Length of the `scriptPubKey` this template locks to.
    pub fn script_pubkey_len(&self) -> u64 {
        use crate::constants::{
            P2PKH_SCRIPT_LEN, P2SH_SCRIPT_LEN, P2WPKH_SCRIPT_LEN, P2WSH_SCRIPT_LEN,
        };
        match self {
            ScriptTemplate::P2pkh => P2PKH_SCRIPT_LEN,
            ScriptTemplate::P2shP2wpkh | ScriptTemplate::P2shP2wsh { .. } => P2SH_SCRIPT_LEN,
            ScriptTemplate::P2wpkh => P2WPKH_SCRIPT_LEN,
            ScriptTemplate::P2wsh { .. } => P2WSH_SCRIPT_LEN,
        }
    }
}

fn validate_threshold(m: u8, n: u8) -> Result<(), DerivationError> {
    if m == 0 || n == 0 || m > n || n > MAX_MULTISIG_KEYS {
        return Err(DerivationError::InvalidMultisig(format!(
            "{m}-of-{n} outside 1 <= m <= n <= {MAX_MULTISIG_KEYS}"
        )));
    }
    Ok(())
}

/// Fee rate stored in sat/kvB so that `ceil(vsize * rate)` stays in integers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeeRate {
    sat_per_kvb: u64,
}

impl FeeRate {
    pub const fn from_sat_per_vb(sat_per_vb: u64) -> Self {
        Self {
            sat_per_kvb: sat_per_vb.saturating_mul(1000),
        }
    }

    pub const fn from_sat_per_kvb(sat_per_kvb: u64) -> Self {
        Self { sat_per_kvb }
    }

    /// Parse a fractional sat/vB rate, keeping three decimal places.
    pub fn from_sat_per_vb_f64(sat_per_vb: f64) -> Option<Self> {
        if !sat_per_vb.is_finite() || sat_per_vb < 0.0 {
            return None;
        }
        let kvb = (sat_per_vb * 1000.0).round();
        if kvb > u64::MAX as f64 {
            return None;
        }
        Some(Self {
            sat_per_kvb: kvb as u64,
        })
    }

    pub fn sat_per_kvb(&self) -> u64 {
        self.sat_per_kvb
    }

    /// `ceil(vsize * rate)` in satoshis.
    pub fn fee_for_vsize(&self, vsize: u64) -> u64 {
        let millisats = (vsize as u128) * (self.sat_per_kvb as u128);
        let fee = millisats.div_ceil(1000);
        u64::try_from(fee).unwrap_or(u64::MAX)
    }
}

impl fmt::Display for FeeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03} sat/vB", self.sat_per_kvb / 1000, self.sat_per_kvb % 1000)
    }
}

/// A spendable output reported by the blockchain data provider.
///
/// Transient: fetched per selection attempt and never persisted by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateUtxo {
    pub outpoint: OutPoint,
    /// Value in satoshis.
    pub value: u64,
    /// Address that owns this output.
    pub address: String,
    pub template: ScriptTemplate,
    pub confirmations: u32,
}

impl CandidateUtxo {
    pub fn address_type(&self) -> AddressType {
        self.template.address_type()
    }
}

/// Key ordering rule for multisig scripts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyOrdering {
    /// BIP-67 lexicographic ordering of the compressed keys.
    #[default]
    Sorted,
    /// Keys appear in the order co-signers were declared.
    Declared,
}

/// One co-signer's account-level extended public key with its key origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CosignerKey {
    pub xpub: Xpub,
    /// Fingerprint of the co-signer's master key.
    pub fingerprint: Fingerprint,
    /// Path from the co-signer's master to `xpub` (BIP-48 account level).
    pub path: DerivationPath,
}

/// M-of-N configuration. Immutable once an account is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisigConfig {
    m: u8,
    cosigners: Vec<CosignerKey>,
    ordering: KeyOrdering,
    address_type: AddressType,
}

impl MultisigConfig {
    pub fn new(
        m: u8,
        cosigners: Vec<CosignerKey>,
        ordering: KeyOrdering,
        address_type: AddressType,
    ) -> Result<Self, DerivationError> {
        let n = u8::try_from(cosigners.len())
            .map_err(|_| DerivationError::InvalidMultisig("too many co-signers".into()))?;
        ScriptTemplate::multisig(address_type, m, n)?;

        let mut seen = HashSet::new();
        for c in &cosigners {
            if !seen.insert(c.xpub.encode()) {
                return Err(DerivationError::InvalidMultisig(format!(
                    "duplicate co-signer key {}",
                    c.fingerprint
                )));
            }
        }

        Ok(Self {
            m,
            cosigners,
            ordering,
            address_type,
        })
    }

    /// Required signatures.
    pub fn m(&self) -> u8 {
        self.m
    }

    /// Total co-signers.
    pub fn n(&self) -> u8 {
        self.cosigners.len() as u8
    }

    pub fn cosigners(&self) -> &[CosignerKey] {
        &self.cosigners
    }

    pub fn ordering(&self) -> KeyOrdering {
        self.ordering
    }

    pub fn address_type(&self) -> AddressType {
        self.address_type
    }

    pub fn template(&self) -> ScriptTemplate {
        match self.address_type {
            AddressType::WrappedSegwit => ScriptTemplate::P2shP2wsh {
                m: self.m,
                n: self.n(),
            },
            _ => ScriptTemplate::P2wsh {
                m: self.m,
                n: self.n(),
            },
        }
    }

    /// Co-signer whose master fingerprint matches, if any.
    pub fn cosigner_by_fingerprint(&self, fingerprint: Fingerprint) -> Option<&CosignerKey> {
        self.cosigners.iter().find(|c| c.fingerprint == fingerprint)
    }
}

/// How an account's keys are held.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AccountKind {
    /// HD single-signature account (BIP-44/49/84).
    Single {
        /// Account-level extended public key.
        xpub: Xpub,
        /// Master fingerprint of the seed the account was derived from.
        fingerprint: Fingerprint,
        /// Path from the master key to `xpub`.
        path: DerivationPath,
    },
    /// HD M-of-N account (BIP-48).
    Multisig(MultisigConfig),
    /// A single imported key: one fixed address and no change chain.
    ImportedKey { public_key: PublicKey },
}

impl AccountKind {
    pub fn label(&self) -> &'static str {
        match self {
            AccountKind::Single { .. } => "single-signature",
            AccountKind::Multisig(_) => "multisig",
            AccountKind::ImportedKey { .. } => "imported-key",
        }
    }
}

/// An account and its derivation cursors.
///
/// `external_index` / `internal_index` are the next unused indices and only
/// ever increase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub index: u32,
    pub kind: AccountKind,
    pub address_type: AddressType,
    pub external_index: u32,
    pub internal_index: u32,
}

impl Account {
    /// Spending template for outputs locked to this account's addresses.
    pub fn template(&self) -> ScriptTemplate {
        match &self.kind {
            AccountKind::Multisig(config) => config.template(),
            _ => ScriptTemplate::single(self.address_type),
        }
    }
}

/// An address handed out by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DerivedAddress {
    pub account_index: u32,
    pub chain: Chain,
    pub derivation_index: u32,
    /// Textual path, e.g. `m/84'/1'/0'/0/5`.
    pub derivation_path: String,
    pub address: String,
    pub address_type: AddressType,
    pub used: bool,
}
