//! Engine configuration.

use bitcoin::Network;
use serde::{Deserialize, Serialize};

use cairn_core::constants::DEFAULT_VARIANCE_FRACTION;
use cairn_core::types::AddressType;

use crate::coin_selection::SelectionStrategy;
use crate::privacy::JitterRange;

/// Privacy transforms. Every one is off by default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    /// Perturb round recipient amounts before building.
    pub randomize_round_amounts: bool,
    /// Relative perturbation applied to round amounts.
    pub variance_fraction: f64,
    /// Delay between consecutive UTXO lookups.
    pub request_jitter: Option<JitterRange>,
    /// Delay before handing a signed transaction to the broadcaster.
    pub broadcast_delay: Option<JitterRange>,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            randomize_round_amounts: false,
            variance_fraction: DEFAULT_VARIANCE_FRACTION,
            request_jitter: None,
            broadcast_delay: None,
        }
    }
}

/// Configuration for the transaction engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub network: Network,
    /// Address type for newly registered single-signature accounts.
    pub default_address_type: AddressType,
    pub selection_strategy: SelectionStrategy,
    pub privacy: PrivacyConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network: Network::Testnet,
            default_address_type: AddressType::NativeSegwit,
            selection_strategy: SelectionStrategy::Randomized,
            privacy: PrivacyConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Configuration preset for mainnet.
    pub fn mainnet() -> Self {
        Self {
            network: Network::Bitcoin,
            ..Self::default()
        }
    }

    /// Configuration preset for testnet.
    pub fn testnet() -> Self {
        Self::default()
    }

    /// Configuration preset for a local regtest node.
    pub fn regtest() -> Self {
        Self {
            network: Network::Regtest,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privacy_is_opt_in() {
        let cfg = EngineConfig::default();
        assert!(!cfg.privacy.randomize_round_amounts);
        assert!(cfg.privacy.request_jitter.is_none());
        assert!(cfg.privacy.broadcast_delay.is_none());
        assert_eq!(cfg.privacy.variance_fraction, 0.001);
    }

    #[test]
    fn randomized_selection_by_default() {
        for cfg in [
            EngineConfig::mainnet(),
            EngineConfig::testnet(),
            EngineConfig::regtest(),
        ] {
            assert_eq!(cfg.selection_strategy, SelectionStrategy::Randomized);
        }
    }

    #[test]
    fn presets_set_network() {
        assert_eq!(EngineConfig::mainnet().network, Network::Bitcoin);
        assert_eq!(EngineConfig::testnet().network, Network::Testnet);
        assert_eq!(EngineConfig::regtest().network, Network::Regtest);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: EngineConfig = serde_json::from_str(
            r#"{
                "default_address_type": "wrapped-segwit",
                "privacy": { "randomize_round_amounts": true }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.default_address_type, AddressType::WrappedSegwit);
        assert!(cfg.privacy.randomize_round_amounts);
        assert_eq!(cfg.privacy.variance_fraction, 0.001);
        assert_eq!(cfg.network, Network::Testnet);
    }

    #[test]
    fn json_roundtrip() {
        let mut cfg = EngineConfig::regtest();
        cfg.privacy.broadcast_delay = Some(JitterRange::new(100, 900));
        let json = serde_json::to_string(&cfg).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}
