//! Shared fixtures for the integration tests.

use bitcoin::hashes::Hash;
use bitcoin::{Network, OutPoint, Txid};

use cairn_core::types::{
    AccountKind, AddressType, CandidateUtxo, Chain, KeyOrdering, MultisigConfig, ScriptTemplate,
};
use cairn_wallet::keys::{
    account_path, multisig_account_path, parse_path, KeyDeriver, Seed, SEED_LEN,
};
use cairn_wallet::{AddressLedger, Session};

/// Deterministic 64-byte seed filled with `byte`.
pub fn seed(byte: u8) -> Seed {
    Seed::from_bytes([byte; SEED_LEN])
}

/// Session unlocked with [`seed`]`(byte)`.
pub fn session(network: Network, byte: u8) -> Session {
    let mut session = Session::new(network);
    session.unlock_with_seed(seed(byte));
    session
}

/// Bare candidate for selector-only tests. The address is never parsed.
pub fn candidate(value: u64, tag: u32, template: ScriptTemplate) -> CandidateUtxo {
    CandidateUtxo {
        outpoint: OutPoint::new(Txid::from_byte_array([(tag % 256) as u8; 32]), tag),
        value,
        address: format!("candidate-{tag}"),
        template,
        confirmations: 1,
    }
}

/// Single-signature account 0 derived from [`seed`]`(byte)`.
pub fn single_ledger(network: Network, address_type: AddressType, byte: u8) -> AddressLedger {
    let deriver = KeyDeriver::new(network);
    let path = account_path(address_type, network, 0).expect("valid account path");
    let key = deriver
        .account_xpub(&seed(byte), &path)
        .expect("account xpub");
    let ledger = AddressLedger::new(network);
    ledger
        .register_account(
            0,
            AccountKind::Single {
                xpub: key.xpub,
                fingerprint: key.fingerprint,
                path: key.path,
            },
            address_type,
        )
        .expect("register account");
    ledger
}

/// M-of-N native segwit configuration; co-signer `i` uses [`seed`]`(0x40 + i)`.
pub fn multisig_config(network: Network, m: u8, n: u8) -> MultisigConfig {
    let deriver = KeyDeriver::new(network);
    let path = multisig_account_path(AddressType::NativeSegwit, network, 0).expect("bip48 path");
    let cosigners = (0..n)
        .map(|i| {
            deriver
                .account_xpub(&seed(0x40 + i), &path)
                .expect("cosigner xpub")
                .into()
        })
        .collect();
    MultisigConfig::new(m, cosigners, KeyOrdering::Sorted, AddressType::NativeSegwit)
        .expect("multisig config")
}

/// Fund fresh receive addresses of `account`, one UTXO per value.
pub fn fund(ledger: &AddressLedger, account: u32, values: &[u64]) -> Vec<CandidateUtxo> {
    let template = ledger.account(account).expect("account").template();
    values
        .iter()
        .enumerate()
        .map(|(i, value)| {
            let record = ledger
                .next_address(account, Chain::External)
                .expect("receive address");
            CandidateUtxo {
                outpoint: OutPoint::new(Txid::from_byte_array([i as u8 + 1; 32]), i as u32),
                value: *value,
                address: record.address,
                template,
                confirmations: 1,
            }
        })
        .collect()
}

/// A native segwit address no test ledger owns.
pub fn foreign_address(network: Network) -> String {
    let path = parse_path("m/84'/1'/7'/0/0").expect("path");
    KeyDeriver::new(network)
        .derive(&seed(0xee), &path, AddressType::NativeSegwit)
        .expect("derive")
        .address
        .to_string()
}
