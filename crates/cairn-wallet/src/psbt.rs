//! Unsigned multisig PSBTs: encoding, co-signer signing, finalization.

use std::fmt;
use std::str::FromStr;

use bitcoin::bip32::Fingerprint;
use bitcoin::opcodes::all::{OP_CHECKMULTISIG, OP_PUSHBYTES_33, OP_PUSHNUM_1, OP_PUSHNUM_16};
use bitcoin::hashes::Hash;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{ecdsa, PublicKey, Script, Transaction, Witness};
use tracing::{debug, info};

use crate::builder::push_script;
use crate::error::WalletError;
use crate::session::KeyProvider;

/// A multisig spend awaiting co-signer signatures, with its M-of-N policy.
#[derive(Clone, PartialEq, Eq)]
pub struct UnsignedPsbt {
    psbt: Psbt,
    m: u8,
    n: u8,
}

impl UnsignedPsbt {
    pub(crate) fn new(psbt: Psbt, m: u8, n: u8) -> Self {
        Self { psbt, m, n }
    }

    /// Wrap a decoded PSBT, recovering M and N from its witness scripts.
    ///
    /// Every input must carry a multisig witness script and all of them must
    /// agree on the policy.
    pub fn from_psbt(psbt: Psbt) -> Result<Self, WalletError> {
        let mut policy: Option<(u8, u8)> = None;
        for (i, input) in psbt.inputs.iter().enumerate() {
            let script = input
                .witness_script
                .as_ref()
                .ok_or_else(|| WalletError::Psbt(format!("input {i} has no witness script")))?;
            let (m, keys) = parse_multisig(script)
                .map_err(|e| WalletError::Psbt(format!("input {i}: {e}")))?;
            let found = (m, keys.len() as u8);
            match policy {
                None => policy = Some(found),
                Some(p) if p != found => {
                    return Err(WalletError::Psbt(format!(
                        "input {i} is {}-of-{}, expected {}-of-{}",
                        found.0, found.1, p.0, p.1
                    )));
                }
                Some(_) => {}
            }
        }
        let (m, n) = policy.ok_or_else(|| WalletError::Psbt("psbt has no inputs".into()))?;
        Ok(Self { psbt, m, n })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WalletError> {
        let psbt = Psbt::deserialize(bytes).map_err(|e| WalletError::Psbt(e.to_string()))?;
        Self::from_psbt(psbt)
    }

    pub fn from_base64(s: &str) -> Result<Self, WalletError> {
        let psbt = Psbt::from_str(s.trim()).map_err(|e| WalletError::Psbt(e.to_string()))?;
        Self::from_psbt(psbt)
    }

    /// BIP-174 binary encoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.psbt.serialize()
    }

    pub fn to_base64(&self) -> String {
        self.psbt.to_string()
    }

    pub fn psbt(&self) -> &Psbt {
        &self.psbt
    }

    pub fn into_inner(self) -> Psbt {
        self.psbt
    }

    pub fn m(&self) -> u8 {
        self.m
    }

    pub fn n(&self) -> u8 {
        self.n
    }

    pub fn unsigned_tx(&self) -> &Transaction {
        &self.psbt.unsigned_tx
    }

    /// Input total minus output total, from the embedded witness UTXOs.
    pub fn fee(&self) -> Result<u64, WalletError> {
        self.psbt
            .fee()
            .map(|a| a.to_sat())
            .map_err(|e| WalletError::Psbt(e.to_string()))
    }

    /// Partial signatures collected so far on input `index`.
    pub fn signature_count(&self, index: usize) -> usize {
        self.psbt
            .inputs
            .get(index)
            .map_or(0, |input| input.partial_sigs.len())
    }

    /// True when every input is finalized or holds at least M signatures.
    pub fn is_complete(&self) -> bool {
        self.psbt.inputs.iter().all(|input| {
            input.final_script_witness.is_some() || input.partial_sigs.len() >= self.m as usize
        })
    }

    /// Assemble final witnesses from the collected signatures.
    ///
    /// The witness is `[<empty>, sig..., witness_script]` with signatures in
    /// the key order of the script. Wrapped inputs also get a scriptSig
    /// pushing the P2WSH program.
    ///
    /// Inputs are finalized on a copy; on error the PSBT is left unchanged.
    pub fn finalize(&mut self) -> Result<(), WalletError> {
        let m = self.m as usize;
        let mut inputs = self.psbt.inputs.clone();
        for (i, input) in inputs.iter_mut().enumerate() {
            if input.final_script_witness.is_some() {
                continue;
            }
            let script = input
                .witness_script
                .as_ref()
                .ok_or_else(|| WalletError::Psbt(format!("input {i} has no witness script")))?;
            let (_, keys) = parse_multisig(script)
                .map_err(|e| WalletError::Psbt(format!("input {i}: {e}")))?;

            let sigs: Vec<&ecdsa::Signature> = keys
                .iter()
                .filter_map(|k| input.partial_sigs.get(k))
                .take(m)
                .collect();
            if sigs.len() < m {
                return Err(WalletError::Psbt(format!(
                    "input {i} has {} of {m} required signatures",
                    sigs.len()
                )));
            }

            let mut witness = Witness::new();
            witness.push([0u8; 0]);
            for sig in sigs {
                witness.push(sig.to_vec());
            }
            witness.push(script.as_bytes());

            if let Some(redeem) = &input.redeem_script {
                input.final_script_sig = Some(push_script(redeem)?);
            }
            input.final_script_witness = Some(witness);
            input.partial_sigs.clear();
        }
        self.psbt.inputs = inputs;
        debug!(inputs = self.psbt.inputs.len(), "psbt finalized");
        Ok(())
    }

    /// The network-ready transaction. Every input must be finalized.
    pub fn extract(self) -> Result<Transaction, WalletError> {
        if let Some(i) = self
            .psbt
            .inputs
            .iter()
            .position(|input| input.final_script_witness.is_none())
        {
            return Err(WalletError::Psbt(format!("input {i} is not finalized")));
        }
        self.psbt
            .extract_tx()
            .map_err(|e| WalletError::Psbt(e.to_string()))
    }
}

impl fmt::Debug for UnsignedPsbt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsignedPsbt")
            .field("txid", &self.psbt.unsigned_tx.compute_txid())
            .field("inputs", &self.psbt.inputs.len())
            .field("outputs", &self.psbt.outputs.len())
            .field("m", &self.m)
            .field("n", &self.n)
            .finish()
    }
}

/// Add this co-signer's signatures to every input whose key origins name
/// `fingerprint`. Returns the number of signatures added.
///
/// Signatures are collected on a copy of the inputs and written back only
/// once every input has been handled, so a failure adds nothing.
pub fn sign_psbt<K: KeyProvider + ?Sized>(
    psbt: &mut UnsignedPsbt,
    key_provider: &K,
    fingerprint: Fingerprint,
) -> Result<usize, WalletError> {
    let secp = Secp256k1::signing_only();
    let mut inputs = psbt.psbt.inputs.clone();
    let mut cache = SighashCache::new(&psbt.psbt.unsigned_tx);
    let mut added = 0;

    for (i, input) in inputs.iter_mut().enumerate() {
        let script = input
            .witness_script
            .clone()
            .ok_or_else(|| WalletError::Psbt(format!("input {i} has no witness script")))?;
        let value = input
            .witness_utxo
            .as_ref()
            .map(|u| u.value)
            .ok_or_else(|| WalletError::Psbt(format!("input {i} has no witness utxo")))?;

        let ours: Vec<_> = input
            .bip32_derivation
            .iter()
            .filter(|(_, (fp, _))| *fp == fingerprint)
            .map(|(pk, (_, path))| (*pk, path.clone()))
            .collect();

        for (public_key, path) in ours {
            let key = key_provider.signing_key(&path)?;
            if key.public_key().0 != public_key {
                return Err(WalletError::Signing(format!(
                    "input {i}: key at {path} does not match the psbt key origin"
                )));
            }
            let sighash = cache
                .p2wsh_signature_hash(i, &script, value, EcdsaSighashType::All)
                .map_err(|e| WalletError::Signing(format!("input {i}: {e}")))?;
            let msg = Message::from_digest(sighash.to_byte_array());
            let sig = ecdsa::Signature::sighash_all(secp.sign_ecdsa(&msg, key.secret_key()));
            input.partial_sigs.insert(PublicKey::new(public_key), sig);
            added += 1;
        }
    }

    if added == 0 {
        return Err(WalletError::Signing(format!(
            "no inputs reference fingerprint {fingerprint}"
        )));
    }
    psbt.psbt.inputs = inputs;
    info!(%fingerprint, signatures = added, "psbt signed");
    Ok(added)
}

/// Threshold and keys of an `OP_m <33-byte keys> OP_n OP_CHECKMULTISIG` script.
fn parse_multisig(script: &Script) -> Result<(u8, Vec<PublicKey>), String> {
    let bytes = script.as_bytes();
    let small_int = |b: u8| -> Option<u8> {
        (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8())
            .contains(&b)
            .then(|| b - OP_PUSHNUM_1.to_u8() + 1)
    };
    let (first, rest) = bytes.split_first().ok_or("empty witness script")?;
    let (last, rest) = rest.split_last().ok_or("truncated witness script")?;
    let (n_byte, body) = rest.split_last().ok_or("truncated witness script")?;
    if *last != OP_CHECKMULTISIG.to_u8() {
        return Err("witness script is not a multisig script".into());
    }
    let m = small_int(*first).ok_or("bad threshold opcode")?;
    let n = small_int(*n_byte).ok_or("bad key count opcode")?;
    if m > n || body.len() != n as usize * 34 {
        return Err(format!("malformed {m}-of-{n} script"));
    }
    let keys = body
        .chunks_exact(34)
        .map(|chunk| {
            if chunk[0] != OP_PUSHBYTES_33.to_u8() {
                return Err("multisig key is not a compressed push".to_string());
            }
            PublicKey::from_slice(&chunk[1..]).map_err(|e| e.to_string())
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok((m, keys))
}
