//! Seed management and BIP-32 key derivation.
//!
//! Single-signature accounts follow BIP-44/49/84, multisig accounts BIP-48.
//! Every function here is a pure function of its inputs; nothing is cached
//! and no key material outlives the returned values.

use std::fmt;
use std::str::FromStr;

use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, Xpriv, Xpub};
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::secp256k1::{All, PublicKey as SecpPublicKey, Secp256k1, SecretKey};
use bitcoin::{script, Address, CompressedPublicKey, Network, PublicKey, ScriptBuf};
use zeroize::{Zeroize, ZeroizeOnDrop};

use cairn_core::error::DerivationError;
use cairn_core::types::{
    coin_type, AddressType, Chain, CosignerKey, KeyOrdering, MultisigConfig,
};

/// Length of a BIP-39 seed in bytes.
pub const SEED_LEN: usize = 64;

/// A 64-byte BIP-39 master seed.
///
/// Secret material is zeroized on drop to prevent leaking key material
/// in freed memory.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Seed {
    bytes: [u8; SEED_LEN],
}

impl Seed {
    /// Create a seed from raw bytes.
    pub fn from_bytes(bytes: [u8; SEED_LEN]) -> Self {
        Self { bytes }
    }

    /// Create a seed from a slice, which must be exactly [`SEED_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DerivationError> {
        if bytes.len() != SEED_LEN {
            return Err(DerivationError::Bip32(format!(
                "seed must be {SEED_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut seed = Self {
            bytes: [0u8; SEED_LEN],
        };
        seed.bytes.copy_from_slice(bytes);
        Ok(seed)
    }

    /// Get the raw seed bytes. Handle with care.
    pub fn as_bytes(&self) -> &[u8; SEED_LEN] {
        &self.bytes
    }
}

impl Clone for Seed {
    fn clone(&self) -> Self {
        Self { bytes: self.bytes }
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Seed").field("bytes", &"[REDACTED]").finish()
    }
}

/// A private key borrowed for signing one input.
///
/// The secret is erased when the value is dropped, on every exit path.
pub struct SigningKey {
    secret: SecretKey,
    public: CompressedPublicKey,
}

impl SigningKey {
    pub fn new(secp: &Secp256k1<All>, secret: SecretKey) -> Self {
        let public = CompressedPublicKey(SecpPublicKey::from_secret_key(secp, &secret));
        Self { secret, public }
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    pub fn public_key(&self) -> CompressedPublicKey {
        self.public
    }
}

impl Drop for SigningKey {
    fn drop(&mut self) {
        self.secret.non_secure_erase();
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("secret", &"[REDACTED]")
            .field("public", &self.public)
            .finish()
    }
}

/// Output of [`KeyDeriver::derive`].
#[derive(Debug)]
pub struct DerivedKey {
    pub path: DerivationPath,
    /// Present only when derived from a seed.
    pub private_key: Option<SigningKey>,
    pub public_key: CompressedPublicKey,
    pub address: Address,
}

/// Account-level key with its origin, as registered in the ledger and shared
/// with co-signers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountKey {
    pub xpub: Xpub,
    pub fingerprint: Fingerprint,
    pub path: DerivationPath,
}

impl From<AccountKey> for CosignerKey {
    fn from(key: AccountKey) -> Self {
        CosignerKey {
            xpub: key.xpub,
            fingerprint: key.fingerprint,
            path: key.path,
        }
    }
}

/// One key of a multisig leaf, in script order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafKey {
    pub public_key: SecpPublicKey,
    /// Master fingerprint of the co-signer owning this key.
    pub fingerprint: Fingerprint,
    /// Full path from that co-signer's master key.
    pub path: DerivationPath,
}

/// Witness script and keys of one multisig address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigLeaf {
    pub witness_script: ScriptBuf,
    pub keys: Vec<LeafKey>,
}

/// Stateless BIP-32 derivation bound to a network.
#[derive(Clone)]
pub struct KeyDeriver {
    secp: Secp256k1<All>,
    network: Network,
}

impl KeyDeriver {
    pub fn new(network: Network) -> Self {
        Self {
            secp: Secp256k1::new(),
            network,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn secp(&self) -> &Secp256k1<All> {
        &self.secp
    }

    /// Fingerprint of the master key, used as key origin in PSBTs.
    pub fn master_fingerprint(&self, seed: &Seed) -> Result<Fingerprint, DerivationError> {
        let mut master = self.master(seed)?;
        let fingerprint = master.fingerprint(&self.secp);
        master.private_key.non_secure_erase();
        Ok(fingerprint)
    }

    /// Derive the key pair and address at `path`.
    ///
    /// Deterministic: the same seed and path always produce the same result.
    pub fn derive(
        &self,
        seed: &Seed,
        path: &DerivationPath,
        address_type: AddressType,
    ) -> Result<DerivedKey, DerivationError> {
        let signing = self.signing_key(seed, path)?;
        let public_key = signing.public_key();
        Ok(DerivedKey {
            path: path.clone(),
            private_key: Some(signing),
            public_key,
            address: self.address_for(&public_key, address_type),
        })
    }

    /// Watch-only variant of [`derive`](Self::derive) from an account xpub.
    pub fn derive_from_xpub(
        &self,
        xpub: &Xpub,
        relative: &DerivationPath,
        address_type: AddressType,
    ) -> Result<DerivedKey, DerivationError> {
        let child = self.derive_public(xpub, relative)?;
        let public_key = child.to_pub();
        Ok(DerivedKey {
            path: relative.clone(),
            private_key: None,
            public_key,
            address: self.address_for(&public_key, address_type),
        })
    }

    /// Private key at `path` wrapped for one-shot signing.
    pub fn signing_key(
        &self,
        seed: &Seed,
        path: &DerivationPath,
    ) -> Result<SigningKey, DerivationError> {
        let mut master = self.master(seed)?;
        let derived = master.derive_priv(&self.secp, path);
        master.private_key.non_secure_erase();
        let mut child = derived.map_err(|e| DerivationError::Bip32(e.to_string()))?;
        let key = SigningKey::new(&self.secp, child.private_key);
        child.private_key.non_secure_erase();
        Ok(key)
    }

    /// Account-level xpub and its origin for sharing or registration.
    pub fn account_xpub(
        &self,
        seed: &Seed,
        path: &DerivationPath,
    ) -> Result<AccountKey, DerivationError> {
        let mut master = self.master(seed)?;
        let fingerprint = master.fingerprint(&self.secp);
        let derived = master.derive_priv(&self.secp, path);
        master.private_key.non_secure_erase();
        let mut account = derived.map_err(|e| DerivationError::Bip32(e.to_string()))?;
        let xpub = Xpub::from_priv(&self.secp, &account);
        account.private_key.non_secure_erase();
        Ok(AccountKey {
            xpub,
            fingerprint,
            path: path.clone(),
        })
    }

    /// Non-hardened child of an extended public key.
    pub fn derive_public(
        &self,
        xpub: &Xpub,
        relative: &DerivationPath,
    ) -> Result<Xpub, DerivationError> {
        let steps: &[ChildNumber] = relative.as_ref();
        if let Some(step) = steps.iter().find(|c| c.is_hardened()) {
            return Err(DerivationError::HardenedFromPublic(step.to_string()));
        }
        xpub.derive_pub(&self.secp, relative)
            .map_err(|e| DerivationError::Bip32(e.to_string()))
    }

    /// Single-key address of the given type.
    pub fn address_for(
        &self,
        public_key: &CompressedPublicKey,
        address_type: AddressType,
    ) -> Address {
        match address_type {
            AddressType::Legacy => Address::p2pkh(public_key.pubkey_hash(), self.network),
            AddressType::WrappedSegwit => Address::p2shwpkh(public_key, self.network),
            AddressType::NativeSegwit => Address::p2wpkh(public_key, self.network),
        }
    }

    /// Fixed address of an imported key.
    ///
    /// Only compressed keys are accepted, for every address type: signing
    /// always produces a compressed public key, so a P2PKH address of the
    /// uncompressed form could never be spent.
    pub fn imported_address(
        &self,
        public_key: &PublicKey,
        address_type: AddressType,
    ) -> Result<Address, DerivationError> {
        let compressed = CompressedPublicKey::try_from(*public_key)
            .map_err(|_| DerivationError::UncompressedKey("imported key".into()))?;
        Ok(self.address_for(&compressed, address_type))
    }

    /// Witness script and key origins for leaf `chain/index` of a multisig account.
    pub fn multisig_leaf(
        &self,
        config: &MultisigConfig,
        chain: Chain,
        index: u32,
    ) -> Result<MultisigLeaf, DerivationError> {
        let leaf = leaf_path(chain, index)?;
        let mut keys = Vec::with_capacity(config.cosigners().len());
        for cosigner in config.cosigners() {
            let child = self.derive_public(&cosigner.xpub, &leaf)?;
            keys.push(LeafKey {
                public_key: child.public_key,
                fingerprint: cosigner.fingerprint,
                path: cosigner.path.extend(&leaf),
            });
        }
        if config.ordering() == KeyOrdering::Sorted {
            keys.sort_by_key(|k| k.public_key.serialize());
        }

        let public_keys: Vec<SecpPublicKey> = keys.iter().map(|k| k.public_key).collect();
        Ok(MultisigLeaf {
            witness_script: multisig_script(config.m(), &public_keys),
            keys,
        })
    }

    /// Address of a multisig witness script for the configured address type.
    pub fn multisig_address(
        &self,
        witness_script: &ScriptBuf,
        address_type: AddressType,
    ) -> Address {
        match address_type {
            AddressType::WrappedSegwit => Address::p2shwsh(witness_script, self.network),
            _ => Address::p2wsh(witness_script, self.network),
        }
    }

    fn master(&self, seed: &Seed) -> Result<Xpriv, DerivationError> {
        Xpriv::new_master(self.network, seed.as_bytes())
            .map_err(|e| DerivationError::Bip32(e.to_string()))
    }
}

impl fmt::Debug for KeyDeriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyDeriver")
            .field("network", &self.network)
            .finish()
    }
}

/// `OP_m <keys> OP_n OP_CHECKMULTISIG` with keys in the given order.
pub fn multisig_script(m: u8, keys: &[SecpPublicKey]) -> ScriptBuf {
    let mut builder = script::Builder::new().push_int(m as i64);
    for key in keys {
        builder = builder.push_key(&PublicKey::new(*key));
    }
    builder
        .push_int(keys.len() as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}

fn hardened(index: u32) -> Result<ChildNumber, DerivationError> {
    ChildNumber::from_hardened_idx(index).map_err(|e| DerivationError::Bip32(e.to_string()))
}

fn normal(index: u32) -> Result<ChildNumber, DerivationError> {
    ChildNumber::from_normal_idx(index).map_err(|e| DerivationError::Bip32(e.to_string()))
}

/// `m/purpose'/coin'/account'` for a single-signature account.
pub fn account_path(
    address_type: AddressType,
    network: Network,
    account: u32,
) -> Result<DerivationPath, DerivationError> {
    Ok(DerivationPath::from(vec![
        hardened(address_type.purpose())?,
        hardened(coin_type(network))?,
        hardened(account)?,
    ]))
}

/// `m/48'/coin'/account'/script'` for a multisig account.
pub fn multisig_account_path(
    address_type: AddressType,
    network: Network,
    account: u32,
) -> Result<DerivationPath, DerivationError> {
    let script_type = address_type.bip48_script_type().ok_or_else(|| {
        DerivationError::InvalidMultisig("legacy multisig is not supported".into())
    })?;
    Ok(DerivationPath::from(vec![
        hardened(cairn_core::constants::PURPOSE_MULTISIG)?,
        hardened(coin_type(network))?,
        hardened(account)?,
        hardened(script_type)?,
    ]))
}

/// Relative `chain/index` leaf below an account key.
pub fn leaf_path(chain: Chain, index: u32) -> Result<DerivationPath, DerivationError> {
    Ok(DerivationPath::from(vec![normal(chain.index())?, normal(index)?]))
}

/// Parse a textual path such as `m/84'/1'/0'/0/5`.
pub fn parse_path(path: &str) -> Result<DerivationPath, DerivationError> {
    DerivationPath::from_str(path)
        .map_err(|e| DerivationError::MalformedPath(format!("{path}: {e}")))
}

/// Render a path as `m/84'/1'/0'/0/5`.
pub fn format_path(path: &DerivationPath) -> String {
    let steps: &[ChildNumber] = path.as_ref();
    let mut out = String::from("m");
    for step in steps {
        match step {
            ChildNumber::Hardened { index } => out.push_str(&format!("/{index}'")),
            ChildNumber::Normal { index } => out.push_str(&format!("/{index}")),
        }
    }
    out
}
