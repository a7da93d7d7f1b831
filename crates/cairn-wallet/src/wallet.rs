//! Wallet composition: ledger, provider, privacy transforms and the assembler.
//!
//! The [`Wallet`] owns the [`AddressLedger`] and talks to the outside world
//! only through a [`BlockchainProvider`]. Each send is one pass: refresh
//! UTXOs, apply opt-in privacy transforms, assemble, optionally delay, then
//! broadcast. Nothing is retried here.

use std::path::Path;

use bitcoin::Txid;
use tracing::{debug, info, warn};

use cairn_core::traits::{BlockchainProvider, ContactBook};
use cairn_core::types::{AccountKind, AddressType, CandidateUtxo, DerivedAddress, FeeRate};

use crate::builder::{Recipient, TransactionAssembler};
use crate::config::EngineConfig;
use crate::error::WalletError;
use crate::keys::account_path;
use crate::ledger::AddressLedger;
use crate::privacy::{is_round_amount, randomize_amount};
use crate::psbt::UnsignedPsbt;
use crate::session::{KeyProvider, Session};

/// Outcome of a broadcast send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub txid: Txid,
    pub fee: u64,
    pub vsize: u64,
    /// Recipients as actually paid, after any amount randomization.
    pub recipients: Vec<Recipient>,
    pub change: Option<DerivedAddress>,
}

/// HD wallet engine bound to one blockchain provider.
pub struct Wallet<P: BlockchainProvider> {
    ledger: AddressLedger,
    config: EngineConfig,
    provider: P,
    contacts: Option<Box<dyn ContactBook>>,
}

impl<P: BlockchainProvider> Wallet<P> {
    /// Empty wallet for `config.network`.
    pub fn new(config: EngineConfig, provider: P) -> Self {
        Self {
            ledger: AddressLedger::new(config.network),
            config,
            provider,
            contacts: None,
        }
    }

    /// Resume from an existing ledger. The ledger's network wins.
    pub fn from_ledger(mut config: EngineConfig, ledger: AddressLedger, provider: P) -> Self {
        config.network = ledger.network();
        Self {
            ledger,
            config,
            provider,
            contacts: None,
        }
    }

    /// Resume from a ledger file written by [`save`](Self::save).
    pub fn load(config: EngineConfig, path: &Path, provider: P) -> Result<Self, WalletError> {
        let ledger = AddressLedger::load_from_file(path)?;
        Ok(Self::from_ledger(config, ledger, provider))
    }

    pub fn save(&self, path: &Path) -> Result<(), WalletError> {
        self.ledger.save_to_file(path)
    }

    /// Attach an advisory contact book.
    pub fn set_contact_book(&mut self, contacts: Box<dyn ContactBook>) -> &mut Self {
        self.contacts = Some(contacts);
        self
    }

    pub fn ledger(&self) -> &AddressLedger {
        &self.ledger
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Register a single-signature account derived from the unlocked seed.
    pub fn create_account(
        &self,
        session: &Session,
        index: u32,
        address_type: AddressType,
    ) -> Result<(), WalletError> {
        let path = account_path(address_type, self.config.network, index)?;
        let key = session.account_xpub(&path)?;
        self.ledger.register_account(
            index,
            AccountKind::Single {
                xpub: key.xpub,
                fingerprint: key.fingerprint,
                path: key.path,
            },
            address_type,
        )
    }

    /// [`create_account`](Self::create_account) with the configured default
    /// address type.
    pub fn create_default_account(
        &self,
        session: &Session,
        index: u32,
    ) -> Result<(), WalletError> {
        self.create_account(session, index, self.config.default_address_type)
    }

    /// Register an account of any kind.
    pub fn register_account(
        &self,
        index: u32,
        kind: AccountKind,
        address_type: AddressType,
    ) -> Result<(), WalletError> {
        self.ledger.register_account(index, kind, address_type)
    }

    pub fn receive_address(&self, account: u32) -> Result<DerivedAddress, WalletError> {
        self.ledger.receive_address(account)
    }

    /// Query the provider for every address of `account`.
    ///
    /// Lookups run one at a time with the configured jitter between them.
    /// Once every lookup has succeeded, addresses holding a confirmed UTXO
    /// are marked used. Unconfirmed UTXOs are still returned as candidates.
    pub async fn refresh_utxos(&self, account: u32) -> Result<Vec<CandidateUtxo>, WalletError> {
        self.ledger.account(account)?;
        let addresses = self.ledger.addresses(account);
        let mut funded = Vec::new();
        for (i, record) in addresses.iter().enumerate() {
            if i > 0 {
                if let Some(jitter) = self.config.privacy.request_jitter {
                    tokio::time::sleep(jitter.sample()).await;
                }
            }
            let found = self.provider.get_utxos(&record.address).await?;
            if !found.is_empty() {
                funded.push((record, found));
            }
        }

        // Every lookup succeeded; only now touch the ledger.
        let mut utxos = Vec::new();
        for (record, found) in funded {
            if found.iter().any(|utxo| utxo.confirmations > 0) {
                self.ledger.mark_used(&record.address)?;
            }
            let template = self.ledger.template_of(&record.address)?;
            utxos.extend(found.into_iter().map(|mut utxo| {
                utxo.template = template;
                utxo
            }));
        }
        debug!(
            account,
            addresses = addresses.len(),
            utxos = utxos.len(),
            "utxos refreshed"
        );
        Ok(utxos)
    }

    /// Refresh, sign with `key_provider` and broadcast a payment from `account`.
    ///
    /// Change goes back to `account`'s internal chain.
    pub async fn send<K: KeyProvider + ?Sized>(
        &self,
        key_provider: &K,
        account: u32,
        recipients: &[Recipient],
        fee_rate: FeeRate,
    ) -> Result<SendReport, WalletError> {
        self.send_with_change(key_provider, account, account, recipients, fee_rate)
            .await
    }

    /// [`send`](Self::send) with change drawn from a different account, as
    /// needed when spending from an imported key.
    pub async fn send_with_change<K: KeyProvider + ?Sized>(
        &self,
        key_provider: &K,
        account: u32,
        change_account: u32,
        recipients: &[Recipient],
        fee_rate: FeeRate,
    ) -> Result<SendReport, WalletError> {
        let utxos = self.refresh_utxos(account).await?;
        let recipients = self.prepare_recipients(recipients);

        let mut assembler = TransactionAssembler::new(&self.ledger);
        assembler.set_strategy(self.config.selection_strategy);
        let signed = assembler.build(&utxos, &recipients, change_account, fee_rate, key_provider)?;

        let txid = self.broadcast(&signed.tx).await?;
        info!(
            %txid,
            account,
            fee = signed.fee,
            vsize = signed.vsize,
            "transaction broadcast"
        );
        Ok(SendReport {
            txid,
            fee: signed.fee,
            vsize: signed.vsize,
            recipients,
            change: signed.change,
        })
    }

    /// Refresh a multisig account and build an unsigned PSBT for co-signers.
    pub async fn prepare_multisig(
        &self,
        account: u32,
        recipients: &[Recipient],
        fee_rate: FeeRate,
    ) -> Result<UnsignedPsbt, WalletError> {
        let utxos = self.refresh_utxos(account).await?;
        let recipients = self.prepare_recipients(recipients);
        let mut assembler = TransactionAssembler::new(&self.ledger);
        assembler.set_strategy(self.config.selection_strategy);
        assembler.build_psbt(&utxos, &recipients, account, fee_rate)
    }

    /// Extract a fully signed PSBT and broadcast it.
    pub async fn broadcast_psbt(&self, psbt: UnsignedPsbt) -> Result<Txid, WalletError> {
        let tx = psbt.extract()?;
        let txid = self.broadcast(&tx).await?;
        info!(%txid, "multisig transaction broadcast");
        Ok(txid)
    }

    async fn broadcast(&self, tx: &bitcoin::Transaction) -> Result<Txid, WalletError> {
        if let Some(delay) = self.config.privacy.broadcast_delay {
            let wait = delay.sample();
            debug!(delay_ms = wait.as_millis() as u64, "delaying broadcast");
            tokio::time::sleep(wait).await;
        }
        Ok(self.provider.broadcast(tx).await?)
    }

    /// Apply amount randomization and consult the contact book.
    fn prepare_recipients(&self, recipients: &[Recipient]) -> Vec<Recipient> {
        let privacy = &self.config.privacy;
        recipients
            .iter()
            .map(|r| {
                if let Some(contacts) = &self.contacts {
                    if !contacts.supports_rotation(&r.address) {
                        warn!(address = %r.address, "destination does not rotate addresses");
                    }
                }
                let mut r = r.clone();
                if privacy.randomize_round_amounts && is_round_amount(r.amount) {
                    let amount = randomize_amount(r.amount, privacy.variance_fraction);
                    debug!(from = r.amount, to = amount, "round amount randomized");
                    r.amount = amount;
                }
                r
            })
            .collect()
    }
}

impl<P: BlockchainProvider> std::fmt::Debug for Wallet<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("network", &self.config.network)
            .field("ledger", &self.ledger)
            .field("contacts", &self.contacts.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{parse_path, KeyDeriver, Seed, SEED_LEN};
    use crate::ledger::tests::multisig_config;
    use crate::privacy::JitterRange;
    use async_trait::async_trait;
    use bitcoin::hashes::Hash;
    use bitcoin::{Network, OutPoint, Transaction};
    use cairn_core::error::NetworkError;
    use cairn_core::traits::ContactDestination;
    use cairn_core::types::{Chain, ScriptTemplate};
    use mockall::mock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    mock! {
        pub Provider {}

        #[async_trait]
        impl BlockchainProvider for Provider {
            async fn get_utxos(&self, address: &str) -> Result<Vec<CandidateUtxo>, NetworkError>;
            async fn broadcast(&self, tx: &Transaction) -> Result<Txid, NetworkError>;
        }
    }

    const NET: Network = Network::Regtest;

    fn session() -> Session {
        let mut session = Session::new(NET);
        session.unlock_with_seed(Seed::from_bytes([0x31; SEED_LEN]));
        session
    }

    fn utxo(address: &str, value: u64, tag: u8) -> CandidateUtxo {
        CandidateUtxo {
            outpoint: OutPoint::new(Txid::from_byte_array([tag; 32]), 0),
            value,
            address: address.to_string(),
            // Deliberately wrong: the ledger's template must win.
            template: ScriptTemplate::P2pkh,
            confirmations: 6,
        }
    }

    fn recipient_address() -> String {
        KeyDeriver::new(NET)
            .derive(
                &Seed::from_bytes([0x55; SEED_LEN]),
                &parse_path("m/84'/1'/0'/0/0").unwrap(),
                AddressType::NativeSegwit,
            )
            .unwrap()
            .address
            .to_string()
    }

    fn funded_provider(funded: Vec<CandidateUtxo>) -> MockProvider {
        let mut provider = MockProvider::new();
        provider.expect_get_utxos().returning(move |address| {
            Ok(funded
                .iter()
                .filter(|u| u.address == address)
                .cloned()
                .collect())
        });
        provider
    }

    fn config() -> EngineConfig {
        let mut config = EngineConfig::regtest();
        config.privacy.request_jitter = Some(JitterRange::new(0, 2));
        config
    }

    #[tokio::test]
    async fn refresh_marks_funded_addresses_used() {
        let session = session();
        let seeded = Wallet::new(config(), MockProvider::new());
        seeded.create_account(&session, 0, AddressType::NativeSegwit).unwrap();
        let first = seeded.ledger().next_address(0, Chain::External).unwrap();
        let second = seeded.ledger().next_address(0, Chain::External).unwrap();
        let ledger = AddressLedger::from_snapshot(seeded.ledger().snapshot()).unwrap();

        let provider = funded_provider(vec![utxo(&second.address, 40_000, 1)]);
        let wallet = Wallet::from_ledger(config(), ledger, provider);

        let utxos = wallet.refresh_utxos(0).await.unwrap();
        assert_eq!(utxos.len(), 1);
        assert_eq!(utxos[0].template, ScriptTemplate::P2wpkh);
        assert!(wallet.ledger().lookup(&second.address).unwrap().used);
        assert!(!wallet.ledger().lookup(&first.address).unwrap().used);
    }

    #[tokio::test]
    async fn unconfirmed_receipt_does_not_mark_used() {
        let session = session();
        let seeded = Wallet::new(config(), MockProvider::new());
        seeded.create_default_account(&session, 0).unwrap();
        let pending = seeded.ledger().next_address(0, Chain::External).unwrap();
        let ledger = AddressLedger::from_snapshot(seeded.ledger().snapshot()).unwrap();

        let mut mempool = utxo(&pending.address, 25_000, 5);
        mempool.confirmations = 0;
        let wallet = Wallet::from_ledger(config(), ledger, funded_provider(vec![mempool]));

        let utxos = wallet.refresh_utxos(0).await.unwrap();
        assert_eq!(utxos.len(), 1);
        assert!(!wallet.ledger().lookup(&pending.address).unwrap().used);
        assert_eq!(wallet.receive_address(0).unwrap().address, pending.address);
    }

    #[test]
    fn default_account_uses_configured_address_type() {
        let session = session();
        let mut cfg = config();
        cfg.default_address_type = AddressType::WrappedSegwit;
        let wallet = Wallet::new(cfg, MockProvider::new());
        wallet.create_default_account(&session, 3).unwrap();

        let account = wallet.ledger().account(3).unwrap();
        assert_eq!(account.address_type, AddressType::WrappedSegwit);
        let address = wallet.receive_address(3).unwrap();
        assert!(address.derivation_path.starts_with("m/49'/1'/3'"));
    }

    #[tokio::test]
    async fn send_broadcasts_signed_transaction() {
        let wallet_session = session();
        let seeded = Wallet::new(config(), MockProvider::new());
        seeded.create_account(&wallet_session, 0, AddressType::NativeSegwit).unwrap();
        let funded = seeded.ledger().next_address(0, Chain::External).unwrap();
        let ledger = AddressLedger::from_snapshot(seeded.ledger().snapshot()).unwrap();

        let mut provider = funded_provider(vec![utxo(&funded.address, 500_000, 7)]);
        provider
            .expect_broadcast()
            .times(1)
            .returning(|tx| Ok(tx.compute_txid()));
        let wallet = Wallet::from_ledger(config(), ledger, provider);

        let report = wallet
            .send(
                &wallet_session,
                0,
                &[Recipient::new(recipient_address(), 120_000)],
                FeeRate::from_sat_per_vb(4),
            )
            .await
            .unwrap();
        assert!(report.fee > 0);
        assert_eq!(report.recipients[0].amount, 120_000);
        let change = report.change.unwrap();
        assert_eq!(change.chain, Chain::Internal);
    }

    #[tokio::test]
    async fn provider_failure_surfaces_as_network_error() {
        let session = session();
        let mut provider = MockProvider::new();
        provider
            .expect_get_utxos()
            .returning(|_| Err(NetworkError::Unavailable("connection refused".into())));
        provider.expect_broadcast().never();
        let wallet = Wallet::new(config(), provider);
        wallet.create_account(&session, 0, AddressType::NativeSegwit).unwrap();
        wallet.receive_address(0).unwrap();

        let err = wallet
            .send(
                &session,
                0,
                &[Recipient::new(recipient_address(), 10_000)],
                FeeRate::from_sat_per_vb(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::Network(NetworkError::Unavailable(_))));
        assert!(wallet.ledger().addresses(0).iter().all(|a| !a.used));
        assert_eq!(wallet.ledger().account(0).unwrap().internal_index, 0);
    }

    #[tokio::test]
    async fn round_amounts_randomized_when_enabled() {
        let session = session();
        let seeded = Wallet::new(config(), MockProvider::new());
        seeded.create_account(&session, 0, AddressType::NativeSegwit).unwrap();
        let funded = seeded.ledger().next_address(0, Chain::External).unwrap();
        let ledger = AddressLedger::from_snapshot(seeded.ledger().snapshot()).unwrap();

        let mut provider = funded_provider(vec![utxo(&funded.address, 50_000_000, 3)]);
        provider
            .expect_broadcast()
            .returning(|tx| Ok(tx.compute_txid()));
        let mut cfg = config();
        cfg.privacy.randomize_round_amounts = true;
        let wallet = Wallet::from_ledger(cfg, ledger, provider);

        let report = wallet
            .send(
                &session,
                0,
                &[Recipient::new(recipient_address(), 10_000_000)],
                FeeRate::from_sat_per_vb(1),
            )
            .await
            .unwrap();
        let paid = report.recipients[0].amount;
        assert!((9_990_000..=10_010_000).contains(&paid));
    }

    #[tokio::test]
    async fn insufficient_funds_does_not_broadcast() {
        let session = session();
        let seeded = Wallet::new(config(), MockProvider::new());
        seeded.create_account(&session, 0, AddressType::NativeSegwit).unwrap();
        let funded = seeded.ledger().next_address(0, Chain::External).unwrap();
        let ledger = AddressLedger::from_snapshot(seeded.ledger().snapshot()).unwrap();

        let mut provider = funded_provider(vec![utxo(&funded.address, 1_000, 2)]);
        provider.expect_broadcast().never();
        let wallet = Wallet::from_ledger(config(), ledger, provider);

        let err = wallet
            .send(
                &session,
                0,
                &[Recipient::new(recipient_address(), 5_000)],
                FeeRate::from_sat_per_vb(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFunds { .. }));
    }

    struct CountingBook(Arc<AtomicUsize>);

    impl ContactBook for CountingBook {
        fn lookup(&self, destination: &str) -> Option<ContactDestination> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Some(ContactDestination::Fixed {
                address: destination.to_string(),
            })
        }
    }

    #[tokio::test]
    async fn contact_book_is_advisory() {
        let session = session();
        let seeded = Wallet::new(config(), MockProvider::new());
        seeded.create_account(&session, 0, AddressType::NativeSegwit).unwrap();
        let funded = seeded.ledger().next_address(0, Chain::External).unwrap();
        let ledger = AddressLedger::from_snapshot(seeded.ledger().snapshot()).unwrap();

        let mut provider = funded_provider(vec![utxo(&funded.address, 200_000, 4)]);
        provider
            .expect_broadcast()
            .times(1)
            .returning(|tx| Ok(tx.compute_txid()));
        let lookups = Arc::new(AtomicUsize::new(0));
        let mut wallet = Wallet::from_ledger(config(), ledger, provider);
        wallet.set_contact_book(Box::new(CountingBook(lookups.clone())));

        wallet
            .send(
                &session,
                0,
                &[Recipient::new(recipient_address(), 20_000)],
                FeeRate::from_sat_per_vb(1),
            )
            .await
            .unwrap();
        assert_eq!(lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn prepare_multisig_builds_psbt() {
        let ledger = AddressLedger::new(NET);
        ledger
            .register_account(
                2,
                AccountKind::Multisig(multisig_config(NET, 2, 3)),
                AddressType::NativeSegwit,
            )
            .unwrap();
        let funded = ledger.next_address(2, Chain::External).unwrap();
        let provider = funded_provider(vec![utxo(&funded.address, 400_000, 9)]);
        let wallet = Wallet::from_ledger(config(), ledger, provider);

        let psbt = wallet
            .prepare_multisig(
                2,
                &[Recipient::new(recipient_address(), 100_000)],
                FeeRate::from_sat_per_vb(2),
            )
            .await
            .unwrap();
        assert_eq!((psbt.m(), psbt.n()), (2, 3));
        assert_eq!(psbt.unsigned_tx().input.len(), 1);
    }

    #[tokio::test]
    async fn save_and_load_keep_cursors() {
        let session = session();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.ledger");

        let wallet = Wallet::new(config(), MockProvider::new());
        wallet.create_account(&session, 0, AddressType::WrappedSegwit).unwrap();
        wallet.ledger().next_address(0, Chain::Internal).unwrap();
        wallet.save(&path).unwrap();

        let loaded = Wallet::load(EngineConfig::mainnet(), &path, MockProvider::new()).unwrap();
        assert_eq!(loaded.config().network, NET);
        assert_eq!(loaded.ledger().account(0).unwrap().internal_index, 1);
    }
}
