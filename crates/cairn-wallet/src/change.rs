//! Change destination allocation.
//!
//! [`ChangeAllocator::allocate_change`] is the only place a change address is
//! obtained. It always mints a fresh internal-chain address; an index that
//! was allocated is never handed back, even if the transaction is abandoned.

use tracing::debug;

use cairn_core::types::{AccountKind, Chain, DerivedAddress, ScriptTemplate};

use crate::error::WalletError;
use crate::ledger::AddressLedger;

/// A freshly minted change destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeDestination {
    pub address: DerivedAddress,
    pub template: ScriptTemplate,
}

/// Mints change addresses from an [`AddressLedger`].
#[derive(Debug, Clone, Copy)]
pub struct ChangeAllocator<'a> {
    ledger: &'a AddressLedger,
}

impl<'a> ChangeAllocator<'a> {
    pub fn new(ledger: &'a AddressLedger) -> Self {
        Self { ledger }
    }

    /// Consume the next internal-chain index of `account`.
    pub fn allocate_change(&self, account: u32) -> Result<ChangeDestination, WalletError> {
        let acct = self.ledger.account(account)?;
        match &acct.kind {
            AccountKind::Single { .. } | AccountKind::Multisig(_) => {
                let address = self.ledger.next_address(account, Chain::Internal)?;
                debug!(
                    account,
                    index = address.derivation_index,
                    "change index allocated"
                );
                Ok(ChangeDestination {
                    address,
                    template: acct.template(),
                })
            }
            AccountKind::ImportedKey { .. } => Err(WalletError::NoChangeChain(account)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{Seed, SEED_LEN};
    use crate::ledger::tests::{multisig_config, single_kind};
    use bitcoin::Network;
    use cairn_core::types::AddressType;
    use std::collections::HashSet;

    fn ledger() -> AddressLedger {
        let ledger = AddressLedger::new(Network::Regtest);
        let seed = Seed::from_bytes([4u8; SEED_LEN]);
        ledger
            .register_account(
                0,
                single_kind(&seed, Network::Regtest, AddressType::WrappedSegwit),
                AddressType::WrappedSegwit,
            )
            .unwrap();
        ledger
    }

    #[test]
    fn change_is_never_reused() {
        let ledger = ledger();
        let allocator = ChangeAllocator::new(&ledger);
        let mut seen = HashSet::new();
        let mut last = None;
        for _ in 0..25 {
            let change = allocator.allocate_change(0).unwrap();
            assert_eq!(change.address.chain, Chain::Internal);
            assert!(seen.insert(change.address.address.clone()));
            if let Some(prev) = last {
                assert!(change.address.derivation_index > prev);
            }
            last = Some(change.address.derivation_index);
        }
    }

    #[test]
    fn change_never_comes_from_external_chain() {
        let ledger = ledger();
        let receive = ledger.receive_address(0).unwrap();
        let change = ChangeAllocator::new(&ledger).allocate_change(0).unwrap();
        assert_ne!(change.address.address, receive.address);
        assert_eq!(change.template, ScriptTemplate::P2shP2wpkh);
    }

    #[test]
    fn first_change_index_is_burned() {
        let ledger = ledger();
        let allocator = ChangeAllocator::new(&ledger);
        let first = allocator.allocate_change(0).unwrap();
        assert_eq!(first.address.derivation_index, 0);
        // Nothing was broadcast; the index still stays consumed.
        let second = allocator.allocate_change(0).unwrap();
        assert_eq!(second.address.derivation_index, 1);
    }

    #[test]
    fn multisig_change_template() {
        let ledger = AddressLedger::new(Network::Regtest);
        ledger
            .register_account(
                3,
                AccountKind::Multisig(multisig_config(Network::Regtest, 2, 3)),
                AddressType::NativeSegwit,
            )
            .unwrap();
        let change = ChangeAllocator::new(&ledger).allocate_change(3).unwrap();
        assert_eq!(change.template, ScriptTemplate::P2wsh { m: 2, n: 3 });
    }

    #[test]
    fn unknown_account() {
        let ledger = ledger();
        assert_eq!(
            ChangeAllocator::new(&ledger).allocate_change(7).unwrap_err(),
            WalletError::UnknownAccount(7)
        );
    }
}
