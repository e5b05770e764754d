use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use ethers::prelude::*;
use gasless_aa::bundler::{wait_for_receipt, BundlerClient, ReceiptOutcome, ReceiptPolling, UserOperationReceipt};
use gasless_aa::chain::ChainClient;
use gasless_aa::codec::decode_hex;
use gasless_aa::config::{load_deployment, Deployment};
use gasless_aa::contracts::{execute_call_data, transfer_call_data};
use gasless_aa::encoding::{self, fmt_address, fmt_h256, fmt_u256, parse_u256_quantity};
use gasless_aa::gas::{ensure_fresh_quote, tune, GasEstimator};
use gasless_aa::hash::user_operation_hash;
use gasless_aa::paymaster::{sponsor_fee_from_logs, SponsorModel};
use gasless_aa::pipeline::{GaslessClient, GaslessRequest, PipelineSettings};
use gasless_aa::readiness::{check_readiness, prepare, PrepareOptions, ReadinessThresholds};
use gasless_aa::submit::{assemble, Route};
use gasless_aa::types::{GasEstimate, TunedLimits};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Canonical EntryPoint v0.7 deployment.
const ENTRY_POINT_V07: &str = "0x0000000071727De22E5E9d8BAf0edAc6f37da032";

// In --json mode stdout carries a single JSON document; everything human-readable goes to
// stderr.
macro_rules! outln {
    ($machine_mode:expr, $($arg:tt)*) => {{
        if $machine_mode {
            eprintln!($($arg)*);
        } else {
            println!($($arg)*);
        }
    }};
}

#[derive(Parser, Debug)]
#[command(name = "gasless-aa", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe the bundler and print tuned gas limits without sending.
    Estimate(EstimateArgs),

    /// Build, sponsor, sign and submit a UserOperation.
    Send(SendArgs),

    /// Pack and hash a UserOperation JSON file offline.
    Hash(HashArgs),

    /// Poll the bundler for a UserOperation receipt.
    Receipt(ReceiptArgs),

    /// Check that the sponsor can pay for a user's operations.
    Readiness(ReadinessArgs),

    /// Operator only: stake, deposit, refresh price and enable the token as needed.
    Prepare(PrepareArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Deployment artifact (chain, bundler, entry point, sponsor, tuning).
    #[arg(long, env = "GASLESS_AA_DEPLOYMENT", default_value = "deployments/sepolia.json")]
    deployment: PathBuf,

    /// Override the chain RPC URL (otherwise uses deployment JSON).
    #[arg(long, env = "GASLESS_AA_RPC_URL")]
    rpc: Option<String>,

    /// Override the bundler URL (otherwise uses deployment JSON).
    #[arg(long, env = "GASLESS_AA_BUNDLER_URL")]
    bundler: Option<String>,

    /// Smart account owner (or sponsor operator, for `prepare`) private key.
    ///
    /// Recommended: set via env var GASLESS_AA_OWNER_PRIVATE_KEY.
    #[arg(long, env = "GASLESS_AA_OWNER_PRIVATE_KEY", hide_env_values = true)]
    owner_private_key: Option<String>,

    /// Print a single JSON object to stdout; all other output goes to stderr.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct CallArgs {
    /// Smart account that sends the operation.
    #[arg(long, env = "GASLESS_AA_SENDER")]
    sender: String,

    /// EntryPoint nonce key (decimal or 0x-hex).
    #[arg(long, default_value = "0")]
    nonce_key: String,

    /// Account factory, only while the account is not deployed yet.
    #[arg(long, requires = "factory_data")]
    factory: Option<String>,

    /// Factory call data (0x-hex).
    #[arg(long)]
    factory_data: Option<String>,

    /// Raw account call data (0x-hex). Mutually exclusive with --target / --transfer-to.
    #[arg(long, conflicts_with_all = ["target", "transfer_to"])]
    call_data: Option<String>,

    /// Call target, wrapped in `execute(target, value, data)`. For --transfer-to this is the token.
    #[arg(long)]
    target: Option<String>,

    /// Wei sent with the wrapped call.
    #[arg(long, default_value = "0")]
    value: String,

    /// Inner call data for --target (0x-hex).
    #[arg(long, conflicts_with = "transfer_to")]
    data: Option<String>,

    /// Build an ERC-20 `transfer(to, amount)` on --target.
    #[arg(long, requires_all = ["transfer_amount", "target"])]
    transfer_to: Option<String>,

    /// Token amount in base units.
    #[arg(long)]
    transfer_amount: Option<String>,
}

#[derive(Args, Debug)]
struct EstimateArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    call: CallArgs,
}

#[derive(Args, Debug)]
struct SendArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[command(flatten)]
    call: CallArgs,

    /// Do not wait for the userOp receipt.
    #[arg(long)]
    no_wait: bool,

    /// If the bundler cannot accept operations, submit `handleOps` from the owner EOA.
    #[arg(long, default_value_t = false)]
    direct_fallback: bool,
}

#[derive(Args, Debug)]
struct HashArgs {
    /// JSON file holding a packed or unpacked UserOperation.
    #[arg(long)]
    op: PathBuf,

    #[arg(long, env = "GASLESS_AA_ENTRYPOINT", default_value = ENTRY_POINT_V07)]
    entry_point: String,

    #[arg(long, env = "GASLESS_AA_CHAIN_ID")]
    chain_id: u64,

    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct ReceiptArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// userOpHash to look up.
    #[arg(long)]
    hash: String,

    /// Override the deployment's poll count.
    #[arg(long)]
    attempts: Option<u32>,
}

#[derive(Args, Debug)]
struct ReadinessArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Smart account whose balances and credit are checked.
    #[arg(long, env = "GASLESS_AA_SENDER")]
    user: String,
}

#[derive(Args, Debug)]
struct PrepareArgs {
    #[command(flatten)]
    common: CommonArgs,

    #[arg(long, env = "GASLESS_AA_SENDER")]
    user: String,

    /// Stake added when the sponsor is under-staked (ETH, decimal string).
    #[arg(long, default_value = "0.2")]
    stake_eth: String,

    #[arg(long, default_value_t = 86_400)]
    unstake_delay_sec: u32,

    /// Deposit added when the sponsor's EntryPoint deposit is low (ETH, decimal string).
    #[arg(long, default_value = "0.3")]
    deposit_eth: String,

    /// Price to set when the token is not priced yet (sponsor's price units).
    #[arg(long)]
    token_price: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        // Always write logs to stderr so stdout can be used for script-friendly outputs.
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::Estimate(args) => cmd_estimate(args).await,
        Command::Send(args) => cmd_send(args).await,
        Command::Hash(args) => cmd_hash(args),
        Command::Receipt(args) => cmd_receipt(args).await,
        Command::Readiness(args) => cmd_readiness(args).await,
        Command::Prepare(args) => cmd_prepare(args).await,
    }
}

type SignedClient = SignerMiddleware<Provider<Http>, LocalWallet>;

fn load(common: &CommonArgs) -> Result<Deployment> {
    load_deployment(&common.deployment, common.rpc.clone(), common.bundler.clone())
}

async fn connect(dep: &Deployment) -> Result<Provider<Http>> {
    let provider =
        Provider::<Http>::try_from(dep.rpc_url.as_str())?.interval(Duration::from_millis(350));

    let chain_id = provider.get_chainid().await.context("eth_chainId failed")?.as_u64();
    if chain_id != dep.chain_id {
        return Err(anyhow!(
            "chainId mismatch: deployment has {}, RPC returned {}",
            dep.chain_id,
            chain_id
        ));
    }
    Ok(provider)
}

fn load_owner(common: &CommonArgs, chain_id: u64) -> Result<LocalWallet> {
    let owner_pk = common
        .owner_private_key
        .clone()
        .ok_or_else(|| anyhow!("missing GASLESS_AA_OWNER_PRIVATE_KEY (or --owner-private-key)"))?;
    let wallet = LocalWallet::from_str(&owner_pk).context("invalid owner private key")?;
    Ok(wallet.with_chain_id(chain_id))
}

fn chain_client<M: Middleware + 'static>(
    client: Arc<M>,
    dep: &Deployment,
    beneficiary: Address,
) -> ChainClient<M> {
    let chain = ChainClient::new(client, dep.entry_point, dep.sponsor.paymaster, beneficiary)
        .with_tx_timeout(Duration::from_secs(180));
    match dep.sponsor.staleness_threshold_secs {
        Some(secs) => chain.with_default_staleness(secs),
        None => chain,
    }
}

fn settings(dep: &Deployment) -> PipelineSettings {
    PipelineSettings {
        entry_point: dep.entry_point,
        chain_id: dep.chain_id,
        fees: dep.fees,
        tuner: dep.tuner,
        retry: dep.retry,
        network: dep.network,
    }
}

fn parse_address(s: &str, what: &str) -> Result<Address> {
    Address::from_str(s).with_context(|| format!("invalid {what} address: {s}"))
}

fn parse_hex_bytes(s: &str, field: &'static str) -> Result<Bytes> {
    Ok(Bytes::from(decode_hex(field, s)?))
}

fn build_call_data(call: &CallArgs) -> Result<Bytes> {
    if let Some(raw) = call.call_data.as_deref() {
        return parse_hex_bytes(raw, "callData");
    }
    let target = call
        .target
        .as_deref()
        .ok_or_else(|| anyhow!("pass --call-data, or --target with --data / --transfer-to"))?;
    let target = parse_address(target, "--target")?;

    if let Some(to) = call.transfer_to.as_deref() {
        let amount = call
            .transfer_amount
            .as_deref()
            .ok_or_else(|| anyhow!("--transfer-to requires --transfer-amount"))?;
        let inner = transfer_call_data(
            parse_address(to, "--transfer-to")?,
            parse_u256_quantity("transferAmount", amount)?,
        );
        return Ok(execute_call_data(target, U256::zero(), inner));
    }

    let value = parse_u256_quantity("value", &call.value)?;
    let inner = match call.data.as_deref() {
        Some(d) => parse_hex_bytes(d, "data")?,
        None => Bytes::new(),
    };
    Ok(execute_call_data(target, value, inner))
}

fn build_request(call: &CallArgs, dep: &Deployment) -> Result<GaslessRequest> {
    let factory = call
        .factory
        .as_deref()
        .map(|f| parse_address(f, "--factory"))
        .transpose()?;
    let factory_data = match call.factory_data.as_deref() {
        Some(d) => parse_hex_bytes(d, "factoryData")?,
        None => Bytes::new(),
    };

    Ok(GaslessRequest {
        sender: parse_address(&call.sender, "--sender")?,
        nonce_key: parse_u256_quantity("nonceKey", &call.nonce_key)?,
        factory,
        factory_data,
        call_data: build_call_data(call)?,
        sponsor: dep.sponsor.sponsor(gasless_aa::now_unix()),
    })
}

/// Refuses to send to a bundler that serves a different entry point. Bundlers without
/// `eth_supportedEntryPoints` are trusted.
async fn check_entry_point(relay: &BundlerClient, entry_point: Address) -> Result<()> {
    match relay.supported_entry_points().await {
        Ok(eps) if eps.contains(&entry_point) => Ok(()),
        Ok(eps) => Err(anyhow!(
            "bundler {} does not support entry point {} (supports {:?})",
            relay.url(),
            fmt_address(entry_point),
            eps
        )),
        Err(e) if e.is_method_not_found() => {
            tracing::warn!("bundler does not implement eth_supportedEntryPoints; skipping check");
            Ok(())
        }
        Err(e) => Err(e).context("eth_supportedEntryPoints failed"),
    }
}

fn limits_json(limits: &TunedLimits) -> serde_json::Value {
    serde_json::json!({
        "preVerificationGas": fmt_u256(limits.pre_verification_gas),
        "verificationGasLimit": fmt_u256(limits.verification_gas_limit),
        "callGasLimit": fmt_u256(limits.call_gas_limit),
        "paymasterVerificationGasLimit": fmt_u256(limits.paymaster_verification_gas_limit),
        "paymasterPostOpGasLimit": fmt_u256(limits.paymaster_post_op_gas_limit),
    })
}

fn gas_json(raw: &GasEstimate) -> serde_json::Value {
    serde_json::json!({
        "preVerificationGas": fmt_u256(raw.pre_verification_gas),
        "verificationGasLimit": fmt_u256(raw.verification_gas_limit),
        "callGasLimit": fmt_u256(raw.call_gas_limit),
        "paymasterVerificationGasLimit": fmt_u256(raw.paymaster_verification_gas_limit),
        "paymasterPostOpGasLimit": fmt_u256(raw.paymaster_post_op_gas_limit),
    })
}

fn receipt_json(receipt: &UserOperationReceipt, paymaster: Address) -> serde_json::Value {
    let logs: Vec<Log> = receipt.all_logs().cloned().collect();
    serde_json::json!({
        "userOpHash": fmt_h256(receipt.user_op_hash),
        "success": receipt.success,
        "actualGasCost": fmt_u256(receipt.actual_gas_cost),
        "actualGasUsed": fmt_u256(receipt.actual_gas_used),
        "reason": receipt.reason,
        "transactionHash": fmt_h256(receipt.receipt.transaction_hash),
        "blockNumber": receipt.receipt.block_number.map(|b| b.as_u64()),
        "sponsorFee": sponsor_fee_from_logs(&logs, paymaster),
    })
}

async fn cmd_estimate(args: EstimateArgs) -> Result<()> {
    let dep = load(&args.common)?;
    let machine_mode = args.common.json;

    let provider = connect(&dep).await?;
    let wallet = load_owner(&args.common, dep.chain_id)?;
    let client = Arc::new(SignerMiddleware::new(provider, wallet.clone()));
    let chain = chain_client(client, &dep, wallet.address());
    let relay = BundlerClient::new(dep.bundler_url.clone(), dep.http_timeout)?;

    let req = build_request(&args.call, &dep)?;
    let model = req.sponsor.model();
    let gasless = GaslessClient::new(&relay, &chain, &chain, &wallet, settings(&dep));
    let draft = gasless.draft(&req).await.context("failed to draft user operation")?;

    // Same steps as the send path, kept apart so the raw estimate can be shown.
    if model == SponsorModel::Token {
        ensure_fresh_quote(&chain, dep.network, gasless_aa::now_unix()).await?;
    }
    let raw = GasEstimator::new(&relay, dep.entry_point, dep.tuner)
        .probe(&draft)
        .await
        .context("bundler gas estimate failed")?;
    let limits = tune(&raw, model, &dep.tuner);
    let op = assemble(&draft, &limits);

    if machine_mode {
        let out = serde_json::json!({
            "raw": gas_json(&raw),
            "tuned": limits_json(&limits),
            "userOperation": encoding::user_op_to_json(&op),
        });
        println!("{}", out);
        return Ok(());
    }

    outln!(machine_mode, "sender:                        {}", req.sender);
    outln!(machine_mode, "sponsor model:                 {:?}", model);
    outln!(
        machine_mode,
        "preVerificationGas:            {} (raw {})",
        limits.pre_verification_gas,
        raw.pre_verification_gas
    );
    outln!(
        machine_mode,
        "verificationGasLimit:          {} (raw {})",
        limits.verification_gas_limit,
        raw.verification_gas_limit
    );
    outln!(
        machine_mode,
        "callGasLimit:                  {} (raw {})",
        limits.call_gas_limit,
        raw.call_gas_limit
    );
    outln!(
        machine_mode,
        "paymasterVerificationGasLimit: {} (raw {})",
        limits.paymaster_verification_gas_limit,
        raw.paymaster_verification_gas_limit
    );
    outln!(
        machine_mode,
        "paymasterPostOpGasLimit:       {} (raw {})",
        limits.paymaster_post_op_gas_limit,
        raw.paymaster_post_op_gas_limit
    );
    outln!(
        machine_mode,
        "\nUserOperation (unsigned):\n{}",
        serde_json::to_string_pretty(&encoding::user_op_to_json(&op))?
    );
    Ok(())
}

async fn cmd_send(args: SendArgs) -> Result<()> {
    let dep = load(&args.common)?;
    let machine_mode = args.common.json;

    let provider = connect(&dep).await?;
    let wallet = load_owner(&args.common, dep.chain_id)?;
    let client = Arc::new(SignerMiddleware::new(provider, wallet.clone()));
    let chain = chain_client(client, &dep, wallet.address());

    let relay = BundlerClient::new(dep.bundler_url.clone(), dep.http_timeout)?;
    check_entry_point(&relay, dep.entry_point).await?;

    let req = build_request(&args.call, &dep)?;
    let mut gasless = GaslessClient::new(&relay, &chain, &chain, &wallet, settings(&dep));
    if req.sponsor.model() == SponsorModel::Token {
        gasless = gasless.with_quote_source(&chain);
    }
    if args.direct_fallback {
        gasless = gasless.with_direct_submitter(&chain);
    }

    let outcome = match gasless.send(&req).await {
        Ok(o) => o,
        Err(e) => {
            if let Some(f) = e.failure() {
                if let Some(reason) = &f.reason {
                    outln!(machine_mode, "entry point reason: {}", reason);
                }
                for a in &f.history {
                    outln!(
                        machine_mode,
                        "attempt {}: {} (maxFee={}, priority={}, pvg={}): {}",
                        a.attempt,
                        a.kind,
                        a.fees.max_fee_per_gas,
                        a.fees.max_priority_fee_per_gas,
                        a.fees.pre_verification_gas,
                        a.message
                    );
                }
            }
            return Err(e).context("gasless send failed");
        }
    };

    outln!(machine_mode, "userOpHash: {}", fmt_h256(outcome.user_op_hash));
    outln!(machine_mode, "attempts:   {}", outcome.attempts);

    let mut out = serde_json::json!({
        "userOpHash": fmt_h256(outcome.user_op_hash),
        "attempts": outcome.attempts,
        "userOperation": encoding::user_op_to_json(&outcome.operation),
    });

    match outcome.route {
        Route::Direct { tx_hash } => {
            outln!(machine_mode, "submitted directly via handleOps: tx {}", fmt_h256(tx_hash));
            out["route"] = "direct".into();
            out["transactionHash"] = fmt_h256(tx_hash).into();
        }
        Route::Relay => {
            out["route"] = "relay".into();
            if args.no_wait {
                outln!(machine_mode, "--no-wait set: not waiting for receipt.");
            } else {
                match wait_for_receipt(&relay, outcome.user_op_hash, dep.receipt).await {
                    ReceiptOutcome::Included(r) => {
                        let summary = receipt_json(&r, dep.sponsor.paymaster);
                        outln!(
                            machine_mode,
                            "\nUserOp receipt:\n{}",
                            serde_json::to_string_pretty(&summary)?
                        );
                        out["receipt"] = summary;
                    }
                    ReceiptOutcome::Pending { attempts, .. } => {
                        outln!(
                            machine_mode,
                            "no receipt after {} polls; the operation may still be included",
                            attempts
                        );
                        report_held_operation(&relay, outcome.user_op_hash, machine_mode).await;
                        out["receipt"] = serde_json::Value::Null;
                    }
                }
            }
        }
    }

    if machine_mode {
        println!("{}", out);
    }
    Ok(())
}

fn cmd_hash(args: HashArgs) -> Result<()> {
    let raw = std::fs::read_to_string(&args.op)
        .with_context(|| format!("failed to read {}", args.op.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", args.op.display()))?;
    let packed = encoding::operation_from_json(&value)?.into_packed()?;
    let entry_point = parse_address(&args.entry_point, "--entry-point")?;

    let hash = user_operation_hash(&packed, entry_point, args.chain_id);

    if args.json {
        let out = serde_json::json!({
            "userOpHash": fmt_h256(hash),
            "entryPoint": fmt_address(entry_point),
            "chainId": args.chain_id,
            "packed": encoding::packed_op_to_json(&packed),
        });
        println!("{}", out);
    } else {
        println!("{}", fmt_h256(hash));
    }
    Ok(())
}

/// Says whether the relay still holds an operation whose receipt did not show up.
async fn report_held_operation(relay: &BundlerClient, hash: H256, machine_mode: bool) {
    match relay.get_user_operation_by_hash(hash).await {
        Ok(Some(found)) => match found.transaction_hash {
            Some(tx) => outln!(
                machine_mode,
                "relay reports the operation in tx {} but has no receipt yet",
                fmt_h256(tx)
            ),
            None => outln!(
                machine_mode,
                "relay still holds the operation (sender {}, nonce {})",
                fmt_address(found.user_operation.sender),
                found.user_operation.nonce
            ),
        },
        Ok(None) => outln!(
            machine_mode,
            "relay does not know {}; it was dropped or never accepted",
            fmt_h256(hash)
        ),
        Err(e) => tracing::warn!(error = %e, "eth_getUserOperationByHash failed"),
    }
}

async fn cmd_receipt(args: ReceiptArgs) -> Result<()> {
    let dep = load(&args.common)?;
    let machine_mode = args.common.json;

    let relay = BundlerClient::new(dep.bundler_url.clone(), dep.http_timeout)?;
    let hash = encoding::parse_h256("userOpHash", &args.hash)?;
    let polling = ReceiptPolling {
        attempts: args.attempts.unwrap_or(dep.receipt.attempts),
        ..dep.receipt
    };

    let receipt = match wait_for_receipt(&relay, hash, polling).await {
        ReceiptOutcome::Included(r) => *r,
        pending => {
            report_held_operation(&relay, hash, machine_mode).await;
            pending.into_result()?
        }
    };
    let summary = receipt_json(&receipt, dep.sponsor.paymaster);
    if machine_mode {
        println!("{}", summary);
    } else {
        outln!(machine_mode, "{}", serde_json::to_string_pretty(&summary)?);
    }
    if !receipt.success {
        bail!(
            "user operation reverted: {}",
            receipt.reason.as_deref().unwrap_or("no reason given")
        );
    }
    Ok(())
}

async fn cmd_readiness(args: ReadinessArgs) -> Result<()> {
    let dep = load(&args.common)?;
    let machine_mode = args.common.json;

    let provider = connect(&dep).await?;
    let chain = chain_client(Arc::new(provider), &dep, Address::zero());
    let user = parse_address(&args.user, "--user")?;

    let report = check_readiness(&chain, user, dep.sponsor.subject(), &ReadinessThresholds::default())
        .await
        .context("readiness check failed")?;

    if machine_mode {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        outln!(machine_mode, "paymaster: {}", dep.sponsor.paymaster);
        outln!(machine_mode, "user:      {}", user);
        outln!(machine_mode, "ready:     {}", report.is_ready);
        for issue in &report.issues {
            outln!(machine_mode, "  - {}", issue);
        }
        outln!(
            machine_mode,
            "\ndetails:\n{}",
            serde_json::to_string_pretty(&report.details)?
        );
    }

    if !report.is_ready {
        bail!("sponsor is not ready ({} issue(s))", report.issues.len());
    }
    Ok(())
}

async fn cmd_prepare(args: PrepareArgs) -> Result<()> {
    let dep = load(&args.common)?;
    let machine_mode = args.common.json;

    let provider = connect(&dep).await?;
    let wallet = load_owner(&args.common, dep.chain_id)?;
    let operator = wallet.address();
    let client: Arc<SignedClient> = Arc::new(SignerMiddleware::new(provider, wallet));
    let chain = chain_client(client, &dep, operator);
    let user = parse_address(&args.user, "--user")?;

    let opts = PrepareOptions {
        stake_amount: ethers::utils::parse_ether(args.stake_eth.clone())
            .with_context(|| format!("invalid --stake-eth value: {}", args.stake_eth))?,
        unstake_delay_sec: args.unstake_delay_sec,
        deposit_amount: ethers::utils::parse_ether(args.deposit_eth.clone())
            .with_context(|| format!("invalid --deposit-eth value: {}", args.deposit_eth))?,
        token_price: args
            .token_price
            .as_deref()
            .map(|p| parse_u256_quantity("tokenPrice", p))
            .transpose()?,
    };

    outln!(machine_mode, "operator: {}", operator);
    let steps = prepare(
        &chain,
        user,
        dep.sponsor.subject(),
        &ReadinessThresholds::default(),
        &opts,
    )
    .await
    .context("prepare failed")?;

    if machine_mode {
        println!("{}", serde_json::to_string(&steps)?);
    } else if steps.is_empty() {
        outln!(machine_mode, "nothing to do; sponsor side already satisfies the checks");
    } else {
        for (i, step) in steps.iter().enumerate() {
            outln!(machine_mode, "{}. {:?} tx {}", i + 1, step.action, fmt_h256(step.tx_hash));
        }
    }
    Ok(())
}
