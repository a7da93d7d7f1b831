//! Per-account derivation indices and the record of handed-out addresses.
//!
//! The ledger is the single owner of derivation cursors. All index mutation
//! happens under one mutex so two concurrent `next_address` calls can never
//! observe the same index.
//!
//! # File format
//! ```text
//! header_len (4 bytes LE) || header_json || snapshot_json
//! ```
//! Only public data is persisted: xpubs, indices and address records.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use bitcoin::bip32::DerivationPath;
use bitcoin::{Address, Network};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use cairn_core::error::DerivationError;
use cairn_core::types::{
    Account, AccountKind, AddressType, Chain, DerivedAddress, ScriptTemplate,
};

use crate::error::WalletError;
use crate::keys::{format_path, leaf_path, KeyDeriver, MultisigLeaf};

/// Magic bytes identifying a cairn ledger file.
pub const LEDGER_MAGIC: &[u8; 4] = b"CRNL";

/// Current ledger file format version.
pub const LEDGER_VERSION: u32 = 1;

/// Ledger file header serialized as JSON.
#[derive(Serialize, Deserialize)]
struct LedgerFileHeader {
    magic: String,
    version: u32,
}

/// Serializable, secret-free image of a ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub network: Network,
    pub accounts: Vec<Account>,
    pub addresses: Vec<DerivedAddress>,
}

#[derive(Default)]
struct LedgerState {
    accounts: BTreeMap<u32, Account>,
    records: Vec<DerivedAddress>,
    by_address: HashMap<String, usize>,
}

impl LedgerState {
    fn account(&self, index: u32) -> Result<&Account, WalletError> {
        self.accounts
            .get(&index)
            .ok_or(WalletError::UnknownAccount(index))
    }

    fn push(&mut self, record: DerivedAddress) {
        self.by_address
            .insert(record.address.clone(), self.records.len());
        self.records.push(record);
    }
}

/// Source of truth for "next unused index".
pub struct AddressLedger {
    deriver: KeyDeriver,
    state: Mutex<LedgerState>,
}

impl AddressLedger {
    pub fn new(network: Network) -> Self {
        Self {
            deriver: KeyDeriver::new(network),
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn network(&self) -> Network {
        self.deriver.network()
    }

    /// Register an account with zeroed cursors.
    pub fn register_account(
        &self,
        index: u32,
        kind: AccountKind,
        address_type: AddressType,
    ) -> Result<(), WalletError> {
        match &kind {
            AccountKind::Single { xpub, .. } => {
                if bitcoin::NetworkKind::from(self.network()) != xpub.network {
                    return Err(DerivationError::Bip32(format!(
                        "account xpub is not for {}",
                        self.network()
                    ))
                    .into());
                }
            }
            AccountKind::Multisig(config) => {
                if config.address_type() != address_type {
                    return Err(DerivationError::InvalidMultisig(format!(
                        "configuration is {}, account is {address_type}",
                        config.address_type()
                    ))
                    .into());
                }
            }
            AccountKind::ImportedKey { public_key } => {
                self.deriver.imported_address(public_key, address_type)?;
            }
        }

        let mut state = self.state.lock();
        if state.accounts.contains_key(&index) {
            return Err(WalletError::DuplicateAccount(index));
        }
        debug!(account = index, kind = kind.label(), %address_type, "account registered");
        state.accounts.insert(
            index,
            Account {
                index,
                kind,
                address_type,
                external_index: 0,
                internal_index: 0,
            },
        );
        Ok(())
    }

    pub fn account(&self, index: u32) -> Result<Account, WalletError> {
        self.state.lock().account(index).cloned()
    }

    pub fn accounts(&self) -> Vec<Account> {
        self.state.lock().accounts.values().cloned().collect()
    }

    /// Derive the address at the chain's cursor, record it and advance the
    /// cursor. Read, derive, append and increment happen under one lock.
    pub fn next_address(&self, account: u32, chain: Chain) -> Result<DerivedAddress, WalletError> {
        let mut state = self.state.lock();
        let acct = state.account(account)?;
        let index = match chain {
            Chain::External => acct.external_index,
            Chain::Internal => acct.internal_index,
        };

        let (address, path) = match (&acct.kind, chain) {
            (AccountKind::ImportedKey { .. }, Chain::Internal) => {
                return Err(WalletError::NoChangeChain(account));
            }
            (AccountKind::ImportedKey { .. }, Chain::External) if index > 0 => {
                return Err(DerivationError::UnsupportedAccount("imported-key").into());
            }
            _ => self.derive_for(acct, chain, index)?,
        };

        let next = index
            .checked_add(1)
            .ok_or_else(|| DerivationError::Bip32("derivation index exhausted".into()))?;
        let record = DerivedAddress {
            account_index: account,
            chain,
            derivation_index: index,
            derivation_path: path,
            address: address.to_string(),
            address_type: acct.address_type,
            used: false,
        };

        if let Some(acct) = state.accounts.get_mut(&account) {
            match chain {
                Chain::External => acct.external_index = next,
                Chain::Internal => acct.internal_index = next,
            }
        }
        state.push(record.clone());
        debug!(account, ?chain, index, "address derived");
        Ok(record)
    }

    fn derive_for(
        &self,
        account: &Account,
        chain: Chain,
        index: u32,
    ) -> Result<(Address, String), WalletError> {
        match &account.kind {
            AccountKind::Single { xpub, path, .. } => {
                let leaf = leaf_path(chain, index)?;
                let key = self
                    .deriver
                    .derive_from_xpub(xpub, &leaf, account.address_type)?;
                Ok((key.address, format_path(&path.extend(&leaf))))
            }
            AccountKind::Multisig(config) => {
                let leaf = self.deriver.multisig_leaf(config, chain, index)?;
                let address = self
                    .deriver
                    .multisig_address(&leaf.witness_script, account.address_type);
                let relative = leaf_path(chain, index)?;
                let path = config
                    .cosigners()
                    .first()
                    .map(|c| format_path(&c.path.extend(&relative)))
                    .unwrap_or_default();
                Ok((address, path))
            }
            AccountKind::ImportedKey { public_key } => {
                let address = self
                    .deriver
                    .imported_address(public_key, account.address_type)?;
                Ok((address, format_path(&DerivationPath::master())))
            }
        }
    }

    /// Idempotent: marking a used address again is a no-op.
    pub fn mark_used(&self, address: &str) -> Result<(), WalletError> {
        let mut state = self.state.lock();
        let pos = *state
            .by_address
            .get(address)
            .ok_or_else(|| WalletError::UnknownAddress(address.to_string()))?;
        if !state.records[pos].used {
            state.records[pos].used = true;
            debug!(address, "address marked used");
        }
        Ok(())
    }

    pub fn address_type_of(&self, address: &str) -> Result<AddressType, WalletError> {
        self.lookup(address)
            .map(|r| r.address_type)
            .ok_or_else(|| WalletError::UnknownAddress(address.to_string()))
    }

    /// Spending template of an address, from its owning account.
    pub fn template_of(&self, address: &str) -> Result<ScriptTemplate, WalletError> {
        let state = self.state.lock();
        let pos = state
            .by_address
            .get(address)
            .ok_or_else(|| WalletError::UnknownAddress(address.to_string()))?;
        let account = state.account(state.records[*pos].account_index)?;
        Ok(account.template())
    }

    pub fn lookup(&self, address: &str) -> Option<DerivedAddress> {
        let state = self.state.lock();
        state
            .by_address
            .get(address)
            .map(|pos| state.records[*pos].clone())
    }

    /// Newest unused receive address, or a fresh one if every address is used.
    /// An imported-key account always answers with its one address.
    pub fn receive_address(&self, account: u32) -> Result<DerivedAddress, WalletError> {
        let acct = self.account(account)?;
        let existing = self
            .addresses(account)
            .into_iter()
            .filter(|r| r.chain == Chain::External)
            .filter(|r| {
                !r.used || matches!(acct.kind, AccountKind::ImportedKey { .. })
            })
            .max_by_key(|r| r.derivation_index);
        match existing {
            Some(record) => Ok(record),
            None => self.next_address(account, Chain::External),
        }
    }

    /// Every address recorded for `account`, in derivation order per chain.
    pub fn addresses(&self, account: u32) -> Vec<DerivedAddress> {
        let state = self.state.lock();
        let mut out: Vec<_> = state
            .records
            .iter()
            .filter(|r| r.account_index == account)
            .cloned()
            .collect();
        out.sort_by_key(|r| (r.chain.index(), r.derivation_index));
        out
    }

    /// Script data needed to spend from or pay to a multisig ledger address.
    pub fn multisig_leaf(&self, address: &str) -> Result<MultisigLeaf, WalletError> {
        let record = self
            .lookup(address)
            .ok_or_else(|| WalletError::UnknownAddress(address.to_string()))?;
        let account = self.account(record.account_index)?;
        match &account.kind {
            AccountKind::Multisig(config) => Ok(self.deriver.multisig_leaf(
                config,
                record.chain,
                record.derivation_index,
            )?),
            other => Err(WalletError::Psbt(format!(
                "{address} belongs to a {} account",
                other.label()
            ))),
        }
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state.lock();
        LedgerSnapshot {
            network: self.network(),
            accounts: state.accounts.values().cloned().collect(),
            addresses: state.records.clone(),
        }
    }

    /// Rebuild a ledger, rejecting snapshots whose records contradict their
    /// accounts' cursors.
    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Result<Self, WalletError> {
        let ledger = Self::new(snapshot.network);
        {
            let mut state = ledger.state.lock();
            for account in snapshot.accounts {
                if state.accounts.insert(account.index, account.clone()).is_some() {
                    return Err(WalletError::CorruptedFile(format!(
                        "account {} listed twice",
                        account.index
                    )));
                }
            }

            let mut slots = HashSet::new();
            for record in snapshot.addresses {
                let account = state.account(record.account_index).map_err(|_| {
                    WalletError::CorruptedFile(format!(
                        "address {} references unknown account {}",
                        record.address, record.account_index
                    ))
                })?;
                let cursor = match record.chain {
                    Chain::External => account.external_index,
                    Chain::Internal => account.internal_index,
                };
                if record.derivation_index >= cursor {
                    return Err(WalletError::CorruptedFile(format!(
                        "address {} is at or past its chain cursor",
                        record.address
                    )));
                }
                if !slots.insert((record.account_index, record.chain, record.derivation_index))
                    || state.by_address.contains_key(&record.address)
                {
                    return Err(WalletError::CorruptedFile(format!(
                        "duplicate address record {}",
                        record.address
                    )));
                }
                state.push(record);
            }
        }
        Ok(ledger)
    }

    /// Save the ledger to a file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), WalletError> {
        let header = LedgerFileHeader {
            magic: String::from_utf8_lossy(LEDGER_MAGIC).to_string(),
            version: LEDGER_VERSION,
        };
        let header_json =
            serde_json::to_vec(&header).map_err(|e| WalletError::Serialization(e.to_string()))?;
        let payload = serde_json::to_vec(&self.snapshot())
            .map_err(|e| WalletError::Serialization(e.to_string()))?;

        let header_len = header_json.len() as u32;
        let mut file_data = Vec::with_capacity(4 + header_json.len() + payload.len());
        file_data.extend_from_slice(&header_len.to_le_bytes());
        file_data.extend_from_slice(&header_json);
        file_data.extend_from_slice(&payload);

        std::fs::write(path, &file_data).map_err(|e| WalletError::IoError(e.to_string()))
    }

    /// Load a ledger from a file.
    pub fn load_from_file(path: &Path) -> Result<Self, WalletError> {
        let file_data = std::fs::read(path).map_err(|e| WalletError::IoError(e.to_string()))?;

        let (len_bytes, rest) = file_data
            .split_first_chunk::<4>()
            .ok_or_else(|| WalletError::CorruptedFile("file too short".into()))?;
        let header_len = u32::from_le_bytes(*len_bytes) as usize;
        if rest.len() < header_len {
            return Err(WalletError::CorruptedFile("header truncated".into()));
        }

        let (header_json, payload) = rest.split_at(header_len);
        let header: LedgerFileHeader = serde_json::from_slice(header_json)
            .map_err(|e| WalletError::CorruptedFile(format!("invalid header: {e}")))?;

        if header.magic != String::from_utf8_lossy(LEDGER_MAGIC).as_ref() {
            return Err(WalletError::CorruptedFile("invalid magic bytes".into()));
        }
        if header.version != LEDGER_VERSION {
            return Err(WalletError::CorruptedFile(format!(
                "unsupported version: {}",
                header.version
            )));
        }

        let snapshot: LedgerSnapshot = serde_json::from_slice(payload)
            .map_err(|e| WalletError::CorruptedFile(format!("invalid payload: {e}")))?;
        Self::from_snapshot(snapshot)
    }
}

impl std::fmt::Debug for AddressLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AddressLedger")
            .field("network", &self.network())
            .field("accounts", &state.accounts.len())
            .field("addresses", &state.records.len())
            .finish()
    }
}
