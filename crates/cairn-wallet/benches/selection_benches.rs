//! Criterion benchmarks for cairn-wallet hot paths.
//!
//! Covers: coin selection over large candidate sets, address derivation, and
//! multisig leaf construction.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use bitcoin::hashes::Hash;
use bitcoin::{Network, OutPoint, Txid};
use cairn_core::types::{
    AddressType, CandidateUtxo, Chain, FeeRate, KeyOrdering, MultisigConfig, ScriptTemplate,
};
use cairn_wallet::coin_selection::{CoinSelector, SelectionRequest, SelectionStrategy};
use cairn_wallet::keys::{
    account_path, leaf_path, multisig_account_path, KeyDeriver, Seed, SEED_LEN,
};

fn candidates(count: usize) -> Vec<CandidateUtxo> {
    (0..count)
        .map(|i| CandidateUtxo {
            outpoint: OutPoint::new(Txid::from_byte_array([(i % 251) as u8; 32]), i as u32),
            value: 10_000 + (i as u64 * 7_919) % 900_000,
            address: format!("addr-{i}"),
            template: ScriptTemplate::P2wpkh,
            confirmations: 1,
        })
        .collect()
}

fn bench_select_randomized(c: &mut Criterion) {
    let pool = candidates(500);
    let request =
        SelectionRequest::new(5_000_000, FeeRate::from_sat_per_vb(12), ScriptTemplate::P2wpkh);

    c.bench_function("select_randomized_500", |b| {
        b.iter(|| CoinSelector::select_request(black_box(&pool), black_box(&request)))
    });
}

fn bench_select_largest_first(c: &mut Criterion) {
    let pool = candidates(500);
    let mut request =
        SelectionRequest::new(5_000_000, FeeRate::from_sat_per_vb(12), ScriptTemplate::P2wpkh);
    request.strategy = SelectionStrategy::LargestFirst;

    c.bench_function("select_largest_first_500", |b| {
        b.iter(|| CoinSelector::select_request(black_box(&pool), black_box(&request)))
    });
}

fn bench_derive_from_xpub(c: &mut Criterion) {
    let deriver = KeyDeriver::new(Network::Testnet);
    let seed = Seed::from_bytes([0x5a; SEED_LEN]);
    let path = account_path(AddressType::NativeSegwit, Network::Testnet, 0).unwrap();
    let account = deriver.account_xpub(&seed, &path).unwrap();
    let leaf = leaf_path(Chain::External, 42).unwrap();

    c.bench_function("derive_address_from_xpub", |b| {
        b.iter(|| {
            deriver.derive_from_xpub(
                black_box(&account.xpub),
                black_box(&leaf),
                AddressType::NativeSegwit,
            )
        })
    });
}

fn bench_multisig_leaf(c: &mut Criterion) {
    let deriver = KeyDeriver::new(Network::Testnet);
    let path = multisig_account_path(AddressType::NativeSegwit, Network::Testnet, 0).unwrap();
    let cosigners = (0u8..3)
        .map(|i| deriver.account_xpub(&Seed::from_bytes([i + 1; SEED_LEN]), &path).unwrap().into())
        .collect();
    let config =
        MultisigConfig::new(2, cosigners, KeyOrdering::Sorted, AddressType::NativeSegwit).unwrap();

    c.bench_function("multisig_leaf_2_of_3", |b| {
        b.iter(|| deriver.multisig_leaf(black_box(&config), Chain::External, black_box(7)))
    });
}

criterion_group!(
    benches,
    bench_select_randomized,
    bench_select_largest_first,
    bench_derive_from_xpub,
    bench_multisig_leaf,
);
criterion_main!(benches);
