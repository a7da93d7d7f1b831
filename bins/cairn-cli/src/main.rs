//! cairn-cli — Offline command-line front end for the cairn engine.
//!
//! Generates and checks mnemonics, exports account xpubs, derives
//! watch-only addresses, plans coin selection over a UTXO file and walks a
//! multisig PSBT through inspection, co-signing and finalization.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use bitcoin::consensus::encode;
use bitcoin::Address;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{debug, info};

use cairn_core::types::{AddressType, CandidateUtxo, Chain, FeeRate, ScriptTemplate};
use cairn_wallet::coin_selection::{CoinSelector, SelectionRequest, SelectionStrategy};
use cairn_wallet::keys::{
    account_path, format_path, leaf_path, multisig_account_path, KeyDeriver, Seed,
};
use cairn_wallet::{
    generate_mnemonic, is_round_amount, mnemonic_to_seed, randomize_amount, sign_psbt,
    validate_mnemonic, EngineConfig, Session, UnsignedPsbt,
};

/// Cairn command-line interface.
#[derive(Parser)]
#[command(name = "cairn-cli")]
#[command(version, about = "Privacy-preserving HD transaction engine.")]
struct Cli {
    /// Config file (default: <config dir>/cairn/cairn.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mnemonic subcommands.
    Mnemonic {
        #[command(subcommand)]
        action: MnemonicAction,
    },
    /// Export an account-level extended public key.
    Xpub(XpubArgs),
    /// Derive watch-only addresses from an account xpub.
    Derive(DeriveArgs),
    /// Run coin selection over a JSON list of UTXOs.
    Plan(PlanArgs),
    /// Multisig PSBT subcommands.
    Psbt {
        #[command(subcommand)]
        action: PsbtAction,
    },
    /// Check whether an amount is round and suggest a randomized one.
    RoundCheck(RoundCheckArgs),
    /// Print the effective configuration.
    Config,
}

#[derive(Subcommand)]
enum MnemonicAction {
    /// Generate a new BIP-39 mnemonic.
    Generate {
        /// Word count (12, 15, 18, 21 or 24).
        #[arg(short, long, default_value = "24")]
        words: usize,
    },
    /// Validate a mnemonic (prompted without echo).
    Validate,
}

#[derive(Args)]
struct XpubArgs {
    /// Address type of the account (default: from config).
    #[arg(short = 't', long)]
    address_type: Option<AddressType>,

    /// Account index.
    #[arg(short, long, default_value = "0")]
    account: u32,

    /// Export the BIP-48 co-signer key instead of the single-sig account key.
    #[arg(long)]
    multisig: bool,

    /// Prompt for a BIP-39 passphrase.
    #[arg(long)]
    passphrase: bool,
}

#[derive(Args)]
struct DeriveArgs {
    /// Account-level xpub/tpub.
    #[arg(short, long)]
    xpub: String,

    /// Address type to encode (default: from config).
    #[arg(short = 't', long)]
    address_type: Option<AddressType>,

    /// Derive change addresses instead of receive addresses.
    #[arg(long)]
    change: bool,

    /// First index.
    #[arg(short, long, default_value = "0")]
    start: u32,

    /// Number of addresses.
    #[arg(short = 'n', long, default_value = "5")]
    count: u32,
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    Randomized,
    LargestFirst,
}

impl From<StrategyArg> for SelectionStrategy {
    fn from(s: StrategyArg) -> Self {
        match s {
            StrategyArg::Randomized => SelectionStrategy::Randomized,
            StrategyArg::LargestFirst => SelectionStrategy::LargestFirst,
        }
    }
}

#[derive(Args)]
struct PlanArgs {
    /// JSON file holding an array of candidate UTXOs.
    #[arg(short, long)]
    utxos: PathBuf,

    /// Amount to pay in satoshis.
    #[arg(short, long)]
    target: u64,

    /// Fee rate in sat/vB (fractions allowed).
    #[arg(short, long, default_value = "1")]
    fee_rate: f64,

    /// Address type of the change output (default: from config).
    #[arg(long)]
    change_type: Option<AddressType>,

    /// Selection strategy (default: from config).
    #[arg(long)]
    strategy: Option<StrategyArg>,
}

#[derive(Subcommand)]
enum PsbtAction {
    /// Summarize a PSBT.
    Inspect(PsbtInput),
    /// Add this seed's signatures to a PSBT and print it as base64.
    Sign {
        #[command(flatten)]
        input: PsbtInput,

        /// Prompt for a BIP-39 passphrase.
        #[arg(long)]
        passphrase: bool,
    },
    /// Finalize a fully signed PSBT and print the raw transaction hex.
    Finalize(PsbtInput),
}

#[derive(Args)]
struct PsbtInput {
    /// Base64 PSBT or a path to a file containing it.
    psbt: String,
}

#[derive(Args)]
struct RoundCheckArgs {
    /// Amount in satoshis.
    amount: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    debug!(network = %config.network, "configuration loaded");

    match cli.command {
        Commands::Mnemonic { action } => match action {
            MnemonicAction::Generate { words } => mnemonic_generate(words),
            MnemonicAction::Validate => mnemonic_validate(),
        },
        Commands::Xpub(args) => export_xpub(&config, args),
        Commands::Derive(args) => derive_addresses(&config, args),
        Commands::Plan(args) => plan(&config, args),
        Commands::Psbt { action } => match action {
            PsbtAction::Inspect(input) => psbt_inspect(&config, input),
            PsbtAction::Sign { input, passphrase } => psbt_sign(&config, input, passphrase),
            PsbtAction::Finalize(input) => psbt_finalize(input),
        },
        Commands::RoundCheck(args) => round_check(&config, args),
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Layer the config file (if any) and `CAIRN_*` environment variables over
/// the defaults. Nested keys use `__`, e.g. `CAIRN_PRIVACY__RANDOMIZE_ROUND_AMOUNTS`.
fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let path = match path {
        Some(p) => Some(p.to_path_buf()),
        None => dirs::config_dir().map(|d| d.join("cairn").join("cairn.toml")),
    };

    let mut builder = config::Config::builder();
    if let Some(path) = &path {
        builder = builder.add_source(config::File::from(path.clone()).required(false));
    }
    builder = builder.add_source(
        config::Environment::with_prefix("CAIRN")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    let layered = builder.build().context("Failed to read configuration")?;
    let config: EngineConfig = layered
        .try_deserialize()
        .context("Invalid configuration")?;
    Ok(config)
}

fn mnemonic_generate(words: usize) -> Result<()> {
    let phrase = generate_mnemonic(words).context("Failed to generate mnemonic")?;
    println!("{phrase}");
    eprintln!("\nWARNING: Anyone with these words can spend your funds. Store them offline.");
    Ok(())
}

fn mnemonic_validate() -> Result<()> {
    let phrase = prompt_secret("Mnemonic")?;
    validate_mnemonic(&phrase).context("Mnemonic is not valid")?;
    println!("Mnemonic is valid ({} words)", phrase.split_whitespace().count());
    Ok(())
}

fn export_xpub(config: &EngineConfig, args: XpubArgs) -> Result<()> {
    let session = unlock(config, args.passphrase)?;
    let address_type = args.address_type.unwrap_or(config.default_address_type);
    let path = if args.multisig {
        multisig_account_path(address_type, config.network, args.account)?
    } else {
        account_path(address_type, config.network, args.account)?
    };
    let key = session.account_xpub(&path)?;

    let origin = format_path(&key.path);
    println!(
        "{}",
        serde_json::json!({
            "fingerprint": key.fingerprint.to_string(),
            "path": origin,
            "xpub": key.xpub.to_string(),
            "key_origin": format!(
                "[{}{}]{}",
                key.fingerprint,
                origin.trim_start_matches('m'),
                key.xpub
            ),
        })
    );
    Ok(())
}

fn derive_addresses(config: &EngineConfig, args: DeriveArgs) -> Result<()> {
    let xpub: bitcoin::bip32::Xpub = args.xpub.parse().context("Invalid xpub")?;
    if bitcoin::NetworkKind::from(config.network) != xpub.network {
        bail!("xpub is not for {}", config.network);
    }
    let address_type = args.address_type.unwrap_or(config.default_address_type);
    let deriver = KeyDeriver::new(config.network);
    let chain = if args.change { Chain::Internal } else { Chain::External };

    for index in args.start..args.start.saturating_add(args.count) {
        let leaf = leaf_path(chain, index)?;
        let derived = deriver.derive_from_xpub(&xpub, &leaf, address_type)?;
        println!("{}\t{}", format_path(&leaf), derived.address);
    }
    Ok(())
}

fn plan(config: &EngineConfig, args: PlanArgs) -> Result<()> {
    let raw = std::fs::read_to_string(&args.utxos)
        .with_context(|| format!("Failed to read {}", args.utxos.display()))?;
    let candidates: Vec<CandidateUtxo> =
        serde_json::from_str(&raw).context("UTXO file must be a JSON array of candidates")?;
    let Some(fee_rate) = FeeRate::from_sat_per_vb_f64(args.fee_rate) else {
        bail!("Fee rate must be a non-negative number");
    };

    let mut request = SelectionRequest::new(
        args.target,
        fee_rate,
        ScriptTemplate::single(args.change_type.unwrap_or(config.default_address_type)),
    );
    request.strategy = args
        .strategy
        .map(SelectionStrategy::from)
        .unwrap_or(config.selection_strategy);

    let result = CoinSelector::select_request(&candidates, &request)?;
    info!(
        inputs = result.selected.len(),
        fee = result.fee,
        change = result.change,
        "selection planned"
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "selected": result.selected,
            "total_input": result.total_input,
            "fee": result.fee,
            "change": result.change,
            "vsize": result.vsize,
        }))?
    );
    Ok(())
}

fn psbt_inspect(config: &EngineConfig, input: PsbtInput) -> Result<()> {
    let psbt = read_psbt(&input)?;
    let tx = psbt.unsigned_tx();

    let inputs: Vec<_> = tx
        .input
        .iter()
        .enumerate()
        .map(|(i, txin)| {
            let value = psbt.psbt().inputs[i].witness_utxo.as_ref().map(|u| u.value.to_sat());
            serde_json::json!({
                "outpoint": txin.previous_output.to_string(),
                "value": value,
                "signatures": psbt.signature_count(i),
            })
        })
        .collect();
    let outputs: Vec<_> = tx
        .output
        .iter()
        .zip(&psbt.psbt().outputs)
        .map(|(out, meta)| {
            let address = Address::from_script(&out.script_pubkey, config.network)
                .map(|a| a.to_string())
                .ok();
            serde_json::json!({
                "address": address,
                "value": out.value.to_sat(),
                "change": meta.witness_script.is_some(),
            })
        })
        .collect();

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "txid": tx.compute_txid().to_string(),
            "policy": format!("{}-of-{}", psbt.m(), psbt.n()),
            "fee": psbt.fee().ok(),
            "complete": psbt.is_complete(),
            "inputs": inputs,
            "outputs": outputs,
        }))?
    );
    Ok(())
}

fn psbt_sign(config: &EngineConfig, input: PsbtInput, passphrase: bool) -> Result<()> {
    let mut psbt = read_psbt(&input)?;
    let session = unlock(config, passphrase)?;
    let fingerprint = session.master_fingerprint()?;
    let added = sign_psbt(&mut psbt, &session, fingerprint).context("Failed to sign PSBT")?;
    eprintln!("Added {added} signature(s) as {fingerprint}");
    println!("{}", psbt.to_base64());
    Ok(())
}

fn psbt_finalize(input: PsbtInput) -> Result<()> {
    let mut psbt = read_psbt(&input)?;
    psbt.finalize().context("PSBT is not fully signed")?;
    let tx = psbt.extract()?;
    eprintln!("txid: {}", tx.compute_txid());
    println!("{}", hex::encode(encode::serialize(&tx)));
    Ok(())
}

fn round_check(config: &EngineConfig, args: RoundCheckArgs) -> Result<()> {
    let round = is_round_amount(args.amount);
    let suggestion = round.then(|| randomize_amount(args.amount, config.privacy.variance_fraction));
    println!(
        "{}",
        serde_json::json!({
            "amount": args.amount,
            "round": round,
            "suggested": suggestion,
        })
    );
    Ok(())
}

/// Prompt for a mnemonic (and optional passphrase) and unlock a session.
fn unlock(config: &EngineConfig, passphrase: bool) -> Result<Session> {
    let phrase = prompt_secret("Mnemonic")?;
    let passphrase = if passphrase {
        prompt_secret("Passphrase")?
    } else {
        String::new()
    };
    let seed: Seed = mnemonic_to_seed(&phrase, &passphrase).context("Invalid mnemonic")?;
    let mut session = Session::new(config.network);
    session.unlock_with_seed(seed);
    Ok(session)
}

fn read_psbt(input: &PsbtInput) -> Result<UnsignedPsbt> {
    let path = Path::new(&input.psbt);
    let text = if path.is_file() {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?
    } else {
        input.psbt.clone()
    };
    UnsignedPsbt::from_base64(&text).context("Invalid PSBT")
}

/// Read a secret without echo.
fn prompt_secret(prompt: &str) -> Result<String> {
    rpassword::prompt_password(format!("{prompt}: ")).context("Failed to read input")
}
