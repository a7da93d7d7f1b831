//! Randomized, fee-aware coin selection.
//!
//! Candidates are visited in a uniformly random order so the chosen set
//! does not correlate with value, age or address. After each input the fee
//! of both layouts (with and without change) is re-estimated from per-template
//! weights, and selection stops at the first input that funds either layout.
//!
//! Every successful result satisfies `total_input == target + fee + change`
//! exactly, with `change == 0 || change >= DUST_THRESHOLD`.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use cairn_core::constants::DUST_THRESHOLD;
use cairn_core::types::{CandidateUtxo, FeeRate, ScriptTemplate};
use cairn_core::weight::WeightEstimate;

use crate::error::WalletError;

/// Visiting order of candidates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    /// Uniform random permutation.
    #[default]
    Randomized,
    /// Deterministic value-descending order, for diagnostics only.
    LargestFirst,
}

/// Parameters of one selection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionRequest {
    /// Sum of recipient amounts in satoshis.
    pub target: u64,
    pub fee_rate: FeeRate,
    /// Weight of each recipient output.
    pub recipient_weights: Vec<u64>,
    /// Template of the change output, if one is created.
    pub change_template: ScriptTemplate,
    pub strategy: SelectionStrategy,
}

impl SelectionRequest {
    /// Request with a single recipient paying to the change template.
    pub fn new(target: u64, fee_rate: FeeRate, change_template: ScriptTemplate) -> Self {
        Self {
            target,
            fee_rate,
            recipient_weights: vec![change_template.output_weight()],
            change_template,
            strategy: SelectionStrategy::default(),
        }
    }
}

/// Result of coin selection: which UTXOs to spend and the fee/change breakdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionResult {
    /// Selected UTXOs, in the order they were visited.
    pub selected: Vec<CandidateUtxo>,
    /// Total value of selected UTXOs.
    pub total_input: u64,
    /// Transaction fee in satoshis.
    pub fee: u64,
    /// Change amount, 0 when no change output is created.
    pub change: u64,
    /// Estimated virtual size of the chosen layout.
    pub vsize: u64,
}

impl SelectionResult {
    pub fn has_change(&self) -> bool {
        self.change > 0
    }
}

/// Coin selector over a borrowed candidate set.
pub struct CoinSelector;

impl CoinSelector {
    /// Select UTXOs to pay `target` to one output of `change_template`'s type.
    pub fn select(
        candidates: &[CandidateUtxo],
        target: u64,
        fee_rate: FeeRate,
        change_template: ScriptTemplate,
    ) -> Result<SelectionResult, WalletError> {
        Self::select_request(
            candidates,
            &SelectionRequest::new(target, fee_rate, change_template),
        )
    }

    /// Select with the OS-seeded thread RNG.
    pub fn select_request(
        candidates: &[CandidateUtxo],
        request: &SelectionRequest,
    ) -> Result<SelectionResult, WalletError> {
        Self::select_with_rng(candidates, request, &mut rand::thread_rng())
    }

    /// Select with an explicit randomness source.
    pub fn select_with_rng<R: Rng + ?Sized>(
        candidates: &[CandidateUtxo],
        request: &SelectionRequest,
        rng: &mut R,
    ) -> Result<SelectionResult, WalletError> {
        if request.target == 0 {
            return Err(WalletError::InvalidAmount("target must be non-zero".into()));
        }

        let base = WeightEstimate::with_outputs(&request.recipient_weights);
        let change_weight = request.change_template.output_weight();
        let rate = request.fee_rate;

        if candidates.is_empty() {
            let required = request.target.saturating_add(rate.fee_for_vsize(base.vsize()));
            return Err(WalletError::InsufficientFunds {
                available: 0,
                required,
                shortfall: required,
            });
        }

        let mut order: Vec<&CandidateUtxo> = candidates.iter().collect();
        match request.strategy {
            SelectionStrategy::Randomized => order.shuffle(rng),
            SelectionStrategy::LargestFirst => order.sort_by(|a, b| b.value.cmp(&a.value)),
        }

        let mut estimate = base;
        let mut selected = Vec::new();
        let mut total: u64 = 0;

        for utxo in order {
            estimate.add_input(utxo.template);
            selected.push(utxo.clone());
            total = total
                .checked_add(utxo.value)
                .ok_or_else(|| WalletError::InvalidAmount("input total overflow".into()))?;

            let with_change = estimate.plus_output(change_weight);
            let fee_with_change = rate.fee_for_vsize(with_change.vsize());
            let fee_no_change = rate.fee_for_vsize(estimate.vsize());

            if let Some(change) = total
                .checked_sub(request.target)
                .and_then(|r| r.checked_sub(fee_with_change))
                .filter(|c| *c >= DUST_THRESHOLD)
            {
                return Ok(finish(selected, total, fee_with_change, change, with_change.vsize()));
            }

            if let Some(excess) = total
                .checked_sub(request.target)
                .and_then(|r| r.checked_sub(fee_no_change))
                .filter(|e| *e < DUST_THRESHOLD)
            {
                return Ok(finish(selected, total, fee_no_change + excess, 0, estimate.vsize()));
            }
        }

        // All candidates consumed. An excess too small to pay for its own
        // change output still goes to the fee.
        let fee_no_change = rate.fee_for_vsize(estimate.vsize());
        let required = request.target.saturating_add(fee_no_change);
        if total >= required {
            let fee = total - request.target;
            return Ok(finish(selected, total, fee, 0, estimate.vsize()));
        }

        let shortfall = required - total;
        if total < request.target {
            Err(WalletError::InsufficientFunds {
                available: total,
                required,
                shortfall,
            })
        } else {
            Err(WalletError::InsufficientFundsAfterFee {
                available: total,
                required,
                shortfall,
            })
        }
    }
}

fn finish(
    selected: Vec<CandidateUtxo>,
    total_input: u64,
    fee: u64,
    change: u64,
    vsize: u64,
) -> SelectionResult {
    debug!(inputs = selected.len(), total_input, fee, change, vsize, "selection complete");
    SelectionResult {
        selected,
        total_input,
        fee,
        change,
        vsize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::{OutPoint, Txid};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn utxo(n: u8, value: u64, template: ScriptTemplate) -> CandidateUtxo {
        CandidateUtxo {
            outpoint: OutPoint::new(Txid::from_byte_array([n; 32]), 0),
            value,
            address: format!("addr{n}"),
            template,
            confirmations: 6,
        }
    }

    fn native(values: &[u64]) -> Vec<CandidateUtxo> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| utxo(i as u8 + 1, *v, ScriptTemplate::P2wpkh))
            .collect()
    }

    fn assert_conserved(result: &SelectionResult, target: u64) {
        assert_eq!(result.total_input, target + result.fee + result.change);
        assert!(result.change == 0 || result.change >= DUST_THRESHOLD);
        let sum: u64 = result.selected.iter().map(|u| u.value).sum();
        assert_eq!(sum, result.total_input);
    }

    #[test]
    fn five_candidates_target_45000() {
        let candidates = native(&[10_000, 20_000, 30_000, 40_000, 50_000]);
        let rate = FeeRate::from_sat_per_vb(1);
        for seed in 0..50 {
            let mut rng = StdRng::seed_from_u64(seed);
            let request = SelectionRequest::new(45_000, rate, ScriptTemplate::P2wpkh);
            let result = CoinSelector::select_with_rng(&candidates, &request, &mut rng).unwrap();
            assert_conserved(&result, 45_000);
            assert!(result.total_input >= 45_000 + result.fee);
        }
    }

    #[test]
    fn single_small_utxo_shortfall() {
        let candidates = native(&[1_000]);
        let err = CoinSelector::select(
            &candidates,
            5_000,
            FeeRate::from_sat_per_vb(1),
            ScriptTemplate::P2wpkh,
        )
        .unwrap_err();
        // 1 P2WPKH in, 1 P2WPKH out: 438 WU -> 110 vB
        assert_eq!(
            err,
            WalletError::InsufficientFunds {
                available: 1_000,
                required: 5_110,
                shortfall: 4_110,
            }
        );
    }

    #[test]
    fn covers_amount_but_not_fee() {
        let candidates = native(&[5_000]);
        let err = CoinSelector::select(
            &candidates,
            4_950,
            FeeRate::from_sat_per_vb(1),
            ScriptTemplate::P2wpkh,
        )
        .unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFundsAfterFee { .. }));
        assert_eq!(err.shortfall(), Some(60));
    }

    #[test]
    fn empty_candidates_rejected() {
        let rate = FeeRate::from_sat_per_vb(1);
        let err = CoinSelector::select(&[], 1_000, rate, ScriptTemplate::P2wpkh).unwrap_err();
        assert!(matches!(
            err,
            WalletError::InsufficientFunds { available: 0, .. }
        ));
    }

    #[test]
    fn zero_target_rejected() {
        let candidates = native(&[10_000]);
        let rate = FeeRate::from_sat_per_vb(1);
        let err = CoinSelector::select(&candidates, 0, rate, ScriptTemplate::P2wpkh).unwrap_err();
        assert!(matches!(err, WalletError::InvalidAmount(_)));
    }

    #[test]
    fn sub_dust_excess_goes_to_fee() {
        // no-change fee 110, excess 100
        let candidates = native(&[10_210]);
        let result = CoinSelector::select(
            &candidates,
            10_000,
            FeeRate::from_sat_per_vb(1),
            ScriptTemplate::P2wpkh,
        )
        .unwrap();
        assert_eq!(result.change, 0);
        assert_eq!(result.fee, 210);
        assert_eq!(result.vsize, 110);
        assert_conserved(&result, 10_000);
    }

    #[test]
    fn gap_excess_absorbed_when_exhausted() {
        // no-change excess 560 >= dust, but change would only be 529 after its own fee
        let candidates = native(&[10_670]);
        let result = CoinSelector::select(
            &candidates,
            10_000,
            FeeRate::from_sat_per_vb(1),
            ScriptTemplate::P2wpkh,
        )
        .unwrap();
        assert_eq!(result.change, 0);
        assert_eq!(result.fee, 670);
        assert_conserved(&result, 10_000);
    }

    #[test]
    fn change_created_above_dust() {
        let candidates = native(&[100_000]);
        let result = CoinSelector::select(
            &candidates,
            10_000,
            FeeRate::from_sat_per_vb(2),
            ScriptTemplate::P2wpkh,
        )
        .unwrap();
        // 1 in, 2 out: 141 vB at 2 sat/vB
        assert_eq!(result.fee, 282);
        assert_eq!(result.change, 100_000 - 10_000 - 282);
        assert!(result.has_change());
    }

    #[test]
    fn fee_depends_on_input_template() {
        let rate = FeeRate::from_sat_per_vb(10);
        let legacy = CoinSelector::select(
            &[utxo(1, 1_000_000, ScriptTemplate::P2pkh)],
            10_000,
            rate,
            ScriptTemplate::P2wpkh,
        )
        .unwrap();
        let native = CoinSelector::select(
            &[utxo(1, 1_000_000, ScriptTemplate::P2wpkh)],
            10_000,
            rate,
            ScriptTemplate::P2wpkh,
        )
        .unwrap();
        assert!(legacy.fee > native.fee);
    }

    #[test]
    fn largest_first_is_deterministic() {
        let candidates = native(&[10_000, 50_000, 20_000]);
        let mut request =
            SelectionRequest::new(30_000, FeeRate::from_sat_per_vb(1), ScriptTemplate::P2wpkh);
        request.strategy = SelectionStrategy::LargestFirst;
        let result = CoinSelector::select_request(&candidates, &request).unwrap();
        assert_eq!(result.selected.len(), 1);
        assert_eq!(result.selected[0].value, 50_000);
    }

    #[test]
    fn multiple_recipients_raise_fee() {
        let candidates = native(&[1_000_000]);
        let rate = FeeRate::from_sat_per_vb(1);
        let one = SelectionRequest::new(10_000, rate, ScriptTemplate::P2wpkh);
        let mut three = one.clone();
        three.recipient_weights = vec![ScriptTemplate::P2wpkh.output_weight(); 3];
        let mut rng = StdRng::seed_from_u64(1);
        let a = CoinSelector::select_with_rng(&candidates, &one, &mut rng).unwrap();
        let b = CoinSelector::select_with_rng(&candidates, &three, &mut rng).unwrap();
        assert_eq!(b.fee - a.fee, 62);
    }

    #[test]
    fn order_varies_between_runs() {
        let candidates = native(&[10_000; 12]);
        let request =
            SelectionRequest::new(25_000, FeeRate::from_sat_per_vb(1), ScriptTemplate::P2wpkh);
        let mut rng = StdRng::seed_from_u64(7);
        let subsets: HashSet<Vec<u8>> = (0..200)
            .map(|_| {
                let result =
                    CoinSelector::select_with_rng(&candidates, &request, &mut rng).unwrap();
                let mut ids: Vec<u8> = result
                    .selected
                    .iter()
                    .map(|u| u.outpoint.txid.to_byte_array()[0])
                    .collect();
                ids.sort();
                ids
            })
            .collect();
        assert!(subsets.len() > 10);
    }

    #[test]
    fn seeded_rng_reproducible() {
        let candidates = native(&[1_000, 2_000, 3_000, 4_000, 5_000, 6_000]);
        let request =
            SelectionRequest::new(7_000, FeeRate::from_sat_per_vb(1), ScriptTemplate::P2wpkh);
        let run = |seed| {
            CoinSelector::select_with_rng(&candidates, &request, &mut StdRng::seed_from_u64(seed))
                .unwrap()
        };
        let a = run(3);
        let b = run(3);
        assert_eq!(a, b);
    }
}
