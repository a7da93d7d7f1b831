//! Transaction assembly: recipient validation, change allocation, selection,
//! output ordering and signing.
//!
//! Two entry points share one drafting pipeline:
//! 1. [`TransactionAssembler::build`] signs every input locally (single-sig)
//! 2. [`TransactionAssembler::build_psbt`] emits an unsigned PSBT carrying the
//!    scripts and key origins co-signers need (multisig)
//!
//! Any failure discards the draft; nothing partially signed escapes.

use std::str::FromStr;

use bitcoin::bip32::DerivationPath;
use bitcoin::consensus::encode;
use bitcoin::hashes::Hash;
use bitcoin::psbt::{Psbt, PsbtSighashType};
use bitcoin::script::PushBytesBuf;
use bitcoin::secp256k1::Message;
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    absolute, ecdsa, Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
    Witness,
};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info, warn};

use cairn_core::constants::DUST_THRESHOLD;
use cairn_core::types::{
    AccountKind, AddressType, CandidateUtxo, DerivedAddress, FeeRate, ScriptTemplate,
};
use cairn_core::weight::output_weight_for_script_len;

use crate::change::{ChangeAllocator, ChangeDestination};
use crate::coin_selection::{CoinSelector, SelectionRequest, SelectionStrategy};
use crate::error::WalletError;
use crate::keys::{format_path, parse_path, KeyDeriver, SigningKey};
use crate::ledger::AddressLedger;
use crate::psbt::UnsignedPsbt;
use crate::session::KeyProvider;

/// A transaction recipient: address and amount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    /// Destination address.
    pub address: String,
    /// Amount in satoshis.
    pub amount: u64,
}

impl Recipient {
    pub fn new(address: impl Into<String>, amount: u64) -> Self {
        Self {
            address: address.into(),
            amount,
        }
    }
}

/// A selected input bound to the path of the key that can spend it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftInput {
    pub utxo: CandidateUtxo,
    pub derivation_path: DerivationPath,
}

/// Position of the change output within the draft's outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeOutput {
    pub index: usize,
    pub destination: ChangeDestination,
}

/// One send request's inputs and outputs before signing. Never reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionDraft {
    pub inputs: Vec<DraftInput>,
    /// Recipients and change, in randomized order.
    pub outputs: Vec<TxOut>,
    pub change: Option<ChangeOutput>,
    pub fee_rate: FeeRate,
    pub fee: u64,
    pub estimated_vsize: u64,
}

impl TransactionDraft {
    /// Version 2, lock time 0, every input signalling RBF.
    pub fn unsigned_tx(&self) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: self
                .inputs
                .iter()
                .map(|i| TxIn {
                    previous_output: i.utxo.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                })
                .collect(),
            output: self.outputs.clone(),
        }
    }

    pub fn input_total(&self) -> u64 {
        self.inputs.iter().map(|i| i.utxo.value).sum()
    }
}

/// A fully signed transaction ready for broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub tx: Transaction,
    pub fee: u64,
    /// Virtual size of the signed transaction.
    pub vsize: u64,
    pub change: Option<DerivedAddress>,
}

impl SignedTransaction {
    /// Consensus-encoded bytes.
    pub fn raw(&self) -> Vec<u8> {
        encode::serialize(&self.tx)
    }

    pub fn raw_hex(&self) -> String {
        encode::serialize_hex(&self.tx)
    }
}

/// Builds transactions against one [`AddressLedger`].
///
/// # Example
/// ```ignore
/// let signed = TransactionAssembler::new(&ledger)
///     .build(&utxos, &[Recipient::new(addr, 50_000)], 0, fee_rate, &session)?;
/// ```
pub struct TransactionAssembler<'a> {
    ledger: &'a AddressLedger,
    deriver: KeyDeriver,
    strategy: SelectionStrategy,
}

impl<'a> TransactionAssembler<'a> {
    pub fn new(ledger: &'a AddressLedger) -> Self {
        Self {
            ledger,
            deriver: KeyDeriver::new(ledger.network()),
            strategy: SelectionStrategy::default(),
        }
    }

    /// Override the selection strategy (default: randomized).
    pub fn set_strategy(&mut self, strategy: SelectionStrategy) -> &mut Self {
        self.strategy = strategy;
        self
    }

    /// Draft, then sign every input with keys from `key_provider`.
    pub fn build<K: KeyProvider + ?Sized>(
        &self,
        utxos: &[CandidateUtxo],
        outputs: &[Recipient],
        change_account: u32,
        fee_rate: FeeRate,
        key_provider: &K,
    ) -> Result<SignedTransaction, WalletError> {
        let draft = self.draft(utxos, outputs, change_account, fee_rate)?;
        let tx = self.sign(&draft, key_provider)?;
        let vsize = tx.vsize() as u64;
        info!(
            txid = %tx.compute_txid(),
            inputs = tx.input.len(),
            outputs = tx.output.len(),
            fee = draft.fee,
            vsize,
            "transaction signed"
        );
        Ok(SignedTransaction {
            tx,
            fee: draft.fee,
            vsize,
            change: draft.change.map(|c| c.destination.address),
        })
    }

    /// Draft from a multisig account and encode it as an unsigned PSBT.
    ///
    /// Needs only the co-signers' xpubs; no private key is touched.
    pub fn build_psbt(
        &self,
        utxos: &[CandidateUtxo],
        outputs: &[Recipient],
        change_account: u32,
        fee_rate: FeeRate,
    ) -> Result<UnsignedPsbt, WalletError> {
        let account = self.ledger.account(change_account)?;
        let config = match &account.kind {
            AccountKind::Multisig(config) => config.clone(),
            other => {
                return Err(WalletError::Psbt(format!(
                    "account {change_account} is {}, not multisig",
                    other.label()
                )));
            }
        };
        for utxo in utxos {
            let owner = self.ledger.lookup(&utxo.address).map(|r| r.account_index);
            if owner != Some(change_account) {
                return Err(WalletError::Psbt(format!(
                    "input {} is not owned by account {change_account}",
                    utxo.address
                )));
            }
        }

        let draft = self.draft(utxos, outputs, change_account, fee_rate)?;
        let mut psbt = Psbt::from_unsigned_tx(draft.unsigned_tx())
            .map_err(|e| WalletError::Psbt(e.to_string()))?;

        for cosigner in config.cosigners() {
            psbt.xpub
                .insert(cosigner.xpub, (cosigner.fingerprint, cosigner.path.clone()));
        }

        for (input, draft_input) in psbt.inputs.iter_mut().zip(&draft.inputs) {
            let leaf = self.ledger.multisig_leaf(&draft_input.utxo.address)?;
            let address = self
                .deriver
                .multisig_address(&leaf.witness_script, account.address_type);
            input.witness_utxo = Some(TxOut {
                value: Amount::from_sat(draft_input.utxo.value),
                script_pubkey: address.script_pubkey(),
            });
            if account.address_type == AddressType::WrappedSegwit {
                input.redeem_script = Some(p2wsh_program(&leaf.witness_script, &self.deriver));
            }
            for key in &leaf.keys {
                input
                    .bip32_derivation
                    .insert(key.public_key, (key.fingerprint, key.path.clone()));
            }
            input.witness_script = Some(leaf.witness_script);
            input.sighash_type = Some(PsbtSighashType::from(EcdsaSighashType::All));
        }

        if let Some(change) = &draft.change {
            let leaf = self.ledger.multisig_leaf(&change.destination.address.address)?;
            let output = &mut psbt.outputs[change.index];
            if account.address_type == AddressType::WrappedSegwit {
                output.redeem_script = Some(p2wsh_program(&leaf.witness_script, &self.deriver));
            }
            for key in &leaf.keys {
                output
                    .bip32_derivation
                    .insert(key.public_key, (key.fingerprint, key.path.clone()));
            }
            output.witness_script = Some(leaf.witness_script);
        }

        info!(
            account = change_account,
            inputs = draft.inputs.len(),
            fee = draft.fee,
            m = config.m(),
            n = config.n(),
            "multisig psbt built"
        );
        Ok(UnsignedPsbt::new(psbt, config.m(), config.n()))
    }

    /// Validate recipients, allocate change, select inputs and lay out outputs.
    pub fn draft(
        &self,
        utxos: &[CandidateUtxo],
        outputs: &[Recipient],
        change_account: u32,
        fee_rate: FeeRate,
    ) -> Result<TransactionDraft, WalletError> {
        self.draft_with_rng(utxos, outputs, change_account, fee_rate, &mut rand::thread_rng())
    }

    pub fn draft_with_rng<R: Rng + ?Sized>(
        &self,
        utxos: &[CandidateUtxo],
        outputs: &[Recipient],
        change_account: u32,
        fee_rate: FeeRate,
        rng: &mut R,
    ) -> Result<TransactionDraft, WalletError> {
        let recipients = self.validate_recipients(outputs)?;
        let target = recipients
            .iter()
            .try_fold(0u64, |acc, r| acc.checked_add(r.value.to_sat()))
            .ok_or_else(|| WalletError::InvalidAmount("total amount overflow".into()))?;

        // The ledger decides each input's template, not the data provider.
        let mut candidates = Vec::with_capacity(utxos.len());
        for utxo in utxos {
            let mut candidate = utxo.clone();
            candidate.template = self.ledger.template_of(&utxo.address)?;
            candidates.push(candidate);
        }

        let change = ChangeAllocator::new(self.ledger).allocate_change(change_account)?;

        let request = SelectionRequest {
            target,
            fee_rate,
            recipient_weights: recipients
                .iter()
                .map(|r| output_weight_for_script_len(r.script_pubkey.len() as u64))
                .collect(),
            change_template: change.template,
            strategy: self.strategy,
        };
        let selection = match CoinSelector::select_with_rng(&candidates, &request, rng) {
            Ok(selection) => selection,
            Err(e) => {
                warn!(
                    account = change_account,
                    index = change.address.derivation_index,
                    error = %e,
                    "selection failed, change index burned"
                );
                return Err(e);
            }
        };

        let mut inputs = Vec::with_capacity(selection.selected.len());
        for utxo in selection.selected {
            let record = self
                .ledger
                .lookup(&utxo.address)
                .ok_or_else(|| WalletError::UnknownAddress(utxo.address.clone()))?;
            inputs.push(DraftInput {
                derivation_path: parse_path(&record.derivation_path)?,
                utxo,
            });
        }

        let mut laid_out: Vec<(TxOut, bool)> = recipients.into_iter().map(|o| (o, false)).collect();
        if selection.change > 0 {
            let script_pubkey = self.script_pubkey_of(&change.address.address)?;
            laid_out.push((
                TxOut {
                    value: Amount::from_sat(selection.change),
                    script_pubkey,
                },
                true,
            ));
        } else {
            debug!(
                account = change_account,
                index = change.address.derivation_index,
                "no change output, allocated index left unused"
            );
        }
        laid_out.shuffle(rng);

        let change = laid_out
            .iter()
            .position(|(_, is_change)| *is_change)
            .map(|index| ChangeOutput {
                index,
                destination: change,
            });

        Ok(TransactionDraft {
            inputs,
            outputs: laid_out.into_iter().map(|(o, _)| o).collect(),
            change,
            fee_rate,
            fee: selection.fee,
            estimated_vsize: selection.vsize,
        })
    }

    fn validate_recipients(&self, outputs: &[Recipient]) -> Result<Vec<TxOut>, WalletError> {
        if outputs.is_empty() {
            return Err(WalletError::InvalidRecipient("no recipients".into()));
        }
        outputs
            .iter()
            .map(|r| {
                if r.amount == 0 {
                    return Err(WalletError::InvalidAmount("recipient amount is zero".into()));
                }
                if r.amount < DUST_THRESHOLD {
                    return Err(WalletError::InvalidAmount(format!(
                        "recipient amount {} is below dust threshold {DUST_THRESHOLD}",
                        r.amount
                    )));
                }
                Ok(TxOut {
                    value: Amount::from_sat(r.amount),
                    script_pubkey: self.script_pubkey_of(&r.address)?,
                })
            })
            .collect()
    }

    fn script_pubkey_of(&self, address: &str) -> Result<ScriptBuf, WalletError> {
        let address = Address::from_str(address)
            .map_err(|e| WalletError::InvalidRecipient(format!("{address}: {e}")))?
            .require_network(self.ledger.network())
            .map_err(|e| WalletError::InvalidRecipient(format!("{address}: {e}")))?;
        Ok(address.script_pubkey())
    }

    fn sign<K: KeyProvider + ?Sized>(
        &self,
        draft: &TransactionDraft,
        key_provider: &K,
    ) -> Result<Transaction, WalletError> {
        let mut tx = draft.unsigned_tx();
        let mut solved = Vec::with_capacity(draft.inputs.len());
        {
            let mut cache = SighashCache::new(&tx);
            for (i, input) in draft.inputs.iter().enumerate() {
                let key = key_provider
                    .signing_key(&input.derivation_path)
                    .map_err(|e| match e {
                        WalletError::SessionLocked => WalletError::SessionLocked,
                        other => WalletError::Signing(format!("input {i}: {other}")),
                    })?;
                solved.push(self.sign_input(&mut cache, i, input, &key)?);
            }
        }
        for (txin, (script_sig, witness)) in tx.input.iter_mut().zip(solved) {
            txin.script_sig = script_sig;
            txin.witness = witness;
        }
        Ok(tx)
    }

    fn sign_input(
        &self,
        cache: &mut SighashCache<&Transaction>,
        index: usize,
        input: &DraftInput,
        key: &SigningKey,
    ) -> Result<(ScriptBuf, Witness), WalletError> {
        let public_key = key.public_key();
        let address_type = input.utxo.template.address_type();
        let owned = self.deriver.address_for(&public_key, address_type);
        if input.utxo.template.is_multisig() || owned.to_string() != input.utxo.address {
            return Err(WalletError::Signing(format!(
                "input {index}: key at {} does not control {}",
                format_path(&input.derivation_path),
                input.utxo.address
            )));
        }
        let amount = Amount::from_sat(input.utxo.value);
        let secp = self.deriver.secp();

        let sign = |digest: [u8; 32]| {
            let msg = Message::from_digest(digest);
            ecdsa::Signature::sighash_all(secp.sign_ecdsa(&msg, key.secret_key()))
        };

        match input.utxo.template {
            ScriptTemplate::P2pkh => {
                let script_pubkey = owned.script_pubkey();
                let sighash = cache
                    .legacy_signature_hash(index, &script_pubkey, EcdsaSighashType::All.to_u32())
                    .map_err(|e| WalletError::Signing(format!("input {index}: {e}")))?;
                let sig = sign(sighash.to_byte_array());
                let script_sig = bitcoin::script::Builder::new()
                    .push_slice(sig.serialize())
                    .push_key(&bitcoin::PublicKey::from(public_key))
                    .into_script();
                Ok((script_sig, Witness::new()))
            }
            ScriptTemplate::P2shP2wpkh | ScriptTemplate::P2wpkh => {
                let program = Address::p2wpkh(&public_key, self.ledger.network()).script_pubkey();
                let sighash = cache
                    .p2wpkh_signature_hash(index, &program, amount, EcdsaSighashType::All)
                    .map_err(|e| WalletError::Signing(format!("input {index}: {e}")))?;
                let sig = sign(sighash.to_byte_array());
                let script_sig = if input.utxo.template == ScriptTemplate::P2shP2wpkh {
                    push_script(&program)?
                } else {
                    ScriptBuf::new()
                };
                Ok((script_sig, Witness::p2wpkh(&sig, &public_key.0)))
            }
            ScriptTemplate::P2shP2wsh { .. } | ScriptTemplate::P2wsh { .. } => {
                Err(WalletError::Signing(format!(
                    "input {index}: multisig inputs are spent through build_psbt"
                )))
            }
        }
    }

    /// Outpoints of a draft's inputs, in transaction order.
    pub fn outpoints(draft: &TransactionDraft) -> Vec<OutPoint> {
        draft.inputs.iter().map(|i| i.utxo.outpoint).collect()
    }
}

fn p2wsh_program(witness_script: &ScriptBuf, deriver: &KeyDeriver) -> ScriptBuf {
    Address::p2wsh(witness_script, deriver.network()).script_pubkey()
}

/// scriptSig that pushes a single redeem script.
pub(crate) fn push_script(redeem_script: &ScriptBuf) -> Result<ScriptBuf, WalletError> {
    let push = PushBytesBuf::try_from(redeem_script.to_bytes())
        .map_err(|e| WalletError::Signing(format!("redeem script push: {e}")))?;
    Ok(bitcoin::script::Builder::new().push_slice(push).into_script())
}
