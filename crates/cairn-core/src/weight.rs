//! Transaction weight and virtual-size estimation per script template.
//!
//! Signatures are costed at their worst-case DER length, so estimates are an
//! upper bound on the final signed size.

use crate::constants::{
    ECDSA_SIG_BYTES, INPUT_BASE_BYTES, OUTPUT_VALUE_BYTES, PUBKEY_BYTES, SEGWIT_MARKER_WEIGHT,
    TX_FIXED_WEIGHT,
};
use crate::types::ScriptTemplate;

/// Serialized length of a Bitcoin `CompactSize` integer.
pub fn varint_len(n: u64) -> u64 {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Weight of an output whose `scriptPubKey` has `script_len` bytes.
pub fn output_weight_for_script_len(script_len: u64) -> u64 {
    4 * (OUTPUT_VALUE_BYTES + varint_len(script_len) + script_len)
}

/// Length of an `m`-of-`n` `OP_CHECKMULTISIG` witness script.
pub fn multisig_script_len(n: u8) -> u64 {
    // OP_m <n x push33> OP_n OP_CHECKMULTISIG
    3 + (n as u64) * (1 + PUBKEY_BYTES)
}

fn non_witness_input_weight(script_sig_len: u64) -> u64 {
    4 * (INPUT_BASE_BYTES + varint_len(script_sig_len) + script_sig_len)
}

fn p2wpkh_witness_weight() -> u64 {
    // item count, signature push, pubkey push
    1 + (1 + ECDSA_SIG_BYTES) + (1 + PUBKEY_BYTES)
}

fn multisig_witness_weight(m: u8, n: u8) -> u64 {
    let script_len = multisig_script_len(n);
    let items = m as u64 + 2;
    // item count, empty CHECKMULTISIG dummy, m signatures, witness script
    varint_len(items)
        + 1
        + (m as u64) * (1 + ECDSA_SIG_BYTES)
        + varint_len(script_len)
        + script_len
}

/// Weight an input of this template contributes, witness included.
pub fn input_weight(template: ScriptTemplate) -> u64 {
    match template {
        ScriptTemplate::P2pkh => {
            non_witness_input_weight((1 + ECDSA_SIG_BYTES) + (1 + PUBKEY_BYTES))
        }
        ScriptTemplate::P2shP2wpkh => {
            // scriptSig pushes the 22-byte P2WPKH redeem script
            non_witness_input_weight(1 + 22) + p2wpkh_witness_weight()
        }
        ScriptTemplate::P2wpkh => non_witness_input_weight(0) + p2wpkh_witness_weight(),
        ScriptTemplate::P2shP2wsh { m, n } => {
            // scriptSig pushes the 34-byte P2WSH redeem script
            non_witness_input_weight(1 + 34) + multisig_witness_weight(m, n)
        }
        ScriptTemplate::P2wsh { m, n } => {
            non_witness_input_weight(0) + multisig_witness_weight(m, n)
        }
    }
}

/// Convert weight units to virtual bytes, rounding up.
pub fn weight_to_vsize(weight: u64) -> u64 {
    weight.div_ceil(4)
}

/// Running weight estimate for a transaction being assembled input by input.
#[derive(Debug, Clone, Default)]
pub struct WeightEstimate {
    input_count: u64,
    input_weight: u64,
    legacy_inputs: u64,
    has_witness: bool,
    output_count: u64,
    output_weight: u64,
}

impl WeightEstimate {
    /// Start an estimate with the given output weights.
    pub fn with_outputs(output_weights: &[u64]) -> Self {
        Self {
            output_count: output_weights.len() as u64,
            output_weight: output_weights.iter().sum(),
            ..Self::default()
        }
    }

    pub fn add_input(&mut self, template: ScriptTemplate) {
        self.input_count += 1;
        self.input_weight += template.input_weight();
        if template.is_segwit() {
            self.has_witness = true;
        } else {
            self.legacy_inputs += 1;
        }
    }

    pub fn add_output(&mut self, weight: u64) {
        self.output_count += 1;
        self.output_weight += weight;
    }

    /// Copy of this estimate with one extra output.
    pub fn plus_output(&self, weight: u64) -> Self {
        let mut next = self.clone();
        next.add_output(weight);
        next
    }

    pub fn weight(&self) -> u64 {
        let mut total = TX_FIXED_WEIGHT
            + 4 * varint_len(self.input_count)
            + 4 * varint_len(self.output_count)
            + self.input_weight
            + self.output_weight;
        if self.has_witness {
            // Non-witness inputs still carry an empty witness stack count.
            total += SEGWIT_MARKER_WEIGHT + self.legacy_inputs;
        }
        total
    }

    pub fn vsize(&self) -> u64 {
        weight_to_vsize(self.weight())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_key_input_vsizes() {
        assert_eq!(weight_to_vsize(input_weight(ScriptTemplate::P2pkh)), 148);
        assert_eq!(weight_to_vsize(input_weight(ScriptTemplate::P2shP2wpkh)), 91);
        assert_eq!(weight_to_vsize(input_weight(ScriptTemplate::P2wpkh)), 68);
    }

    #[test]
    fn output_vsizes() {
        assert_eq!(ScriptTemplate::P2pkh.output_weight(), 34 * 4);
        assert_eq!(ScriptTemplate::P2shP2wpkh.output_weight(), 32 * 4);
        assert_eq!(ScriptTemplate::P2wpkh.output_weight(), 31 * 4);
        assert_eq!(ScriptTemplate::P2wsh { m: 2, n: 3 }.output_weight(), 43 * 4);
    }

    #[test]
    fn multisig_input_grows_with_keys() {
        let two_of_three = input_weight(ScriptTemplate::P2wsh { m: 2, n: 3 });
        let three_of_five = input_weight(ScriptTemplate::P2wsh { m: 3, n: 5 });
        assert!(three_of_five > two_of_three);
        // 2-of-3 P2WSH: 164 + (1 + 1 + 146 + 1 + 105) = 418 WU
        assert_eq!(two_of_three, 418);
        let wrapped = input_weight(ScriptTemplate::P2shP2wsh { m: 2, n: 3 });
        assert_eq!(wrapped - two_of_three, 4 * 35);
    }

    #[test]
    fn p2wpkh_one_in_two_out() {
        let mut est = WeightEstimate::with_outputs(&[
            ScriptTemplate::P2wpkh.output_weight(),
            ScriptTemplate::P2wpkh.output_weight(),
        ]);
        est.add_input(ScriptTemplate::P2wpkh);
        // 32 + 4 + 4 + 272 + 248 + 2 = 562 WU -> 141 vB
        assert_eq!(est.weight(), 562);
        assert_eq!(est.vsize(), 141);
    }

    #[test]
    fn legacy_only_has_no_marker() {
        let mut est = WeightEstimate::with_outputs(&[ScriptTemplate::P2pkh.output_weight()]);
        est.add_input(ScriptTemplate::P2pkh);
        assert_eq!(est.vsize(), 10 + 148 + 34);
    }

    #[test]
    fn plus_output_leaves_original() {
        let est = WeightEstimate::with_outputs(&[124]);
        let more = est.plus_output(124);
        assert_eq!(more.weight(), est.weight() + 124);
    }

    #[test]
    fn varint_boundaries() {
        assert_eq!(varint_len(0xfc), 1);
        assert_eq!(varint_len(0xfd), 3);
        assert_eq!(varint_len(0x1_0000), 5);
        assert_eq!(varint_len(u64::MAX), 9);
    }
}
