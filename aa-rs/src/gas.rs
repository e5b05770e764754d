use async_trait::async_trait;
use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, H256, U256};
use serde::Deserialize;

use crate::bundler::Relay;
use crate::error::{Error, RelayError};
use crate::paymaster::SponsorModel;
use crate::types::{GasEstimate, PackedUserOperation, TunedLimits, UserOperation};

const BPS: u32 = 10_000;

/// Probe placeholders. Only their magnitude matters to the relay.
pub const PROBE_VERIFICATION_GAS: u64 = 150_000;
pub const PROBE_CALL_GAS: u64 = 200_000;
pub const PROBE_PRE_VERIFICATION_GAS: u64 = 60_000;
pub const PROBE_PAYMASTER_VERIFICATION_GAS: u64 = 60_000;
pub const PROBE_POST_OP_GAS: u64 = 60_000;
pub const PLACEHOLDER_SIGNATURE_LEN: usize = 65;

/// Used when the relay does not implement `eth_estimateUserOperationGas`.
pub const FALLBACK_VERIFICATION_GAS: u64 = 1_000_000;
pub const FALLBACK_CALL_GAS: u64 = 2_000_000;
pub const FALLBACK_PAYMASTER_VERIFICATION_GAS: u64 = 300_000;
pub const FALLBACK_POST_OP_GAS: u64 = 100_000;

const ZERO_BYTE_GAS: u64 = 4;
const NON_ZERO_BYTE_GAS: u64 = 16;
const TX_BASE_GAS: u64 = 21_000;
const PER_OP_OVERHEAD_GAS: u64 = 18_300;
const PER_WORD_GAS: u64 = 4;
const PVG_BUFFER_PERCENT: u64 = 20;
const PVG_FIXED_PAD: u64 = 5_000;

/// Minimum fraction of a granted limit the relay expects to be consumed, in basis points.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EfficiencyRatio(u32);

impl EfficiencyRatio {
    pub const DEFAULT: EfficiencyRatio = EfficiencyRatio(4_500);

    pub fn from_bps(bps: u32) -> Result<Self, Error> {
        if bps == 0 || bps > BPS {
            return Err(Error::Config(format!(
                "efficiency ratio must be in (0, 1], got {bps} bps"
            )));
        }
        Ok(Self(bps))
    }

    pub fn from_ratio(r: f64) -> Result<Self, Error> {
        if !(r > 0.0 && r <= 1.0) {
            return Err(Error::Config(format!(
                "efficiency ratio must be in (0, 1], got {r}"
            )));
        }
        // Rounding down keeps the tuned limit at or above `floor / r`.
        Self::from_bps(((r * f64::from(BPS)).floor() as u32).max(1))
    }

    pub fn bps(self) -> u32 {
        self.0
    }
}

impl Default for EfficiencyRatio {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// `max(ceil(floor / ratio), raw)`.
pub fn tune_gas_limit(raw: U256, nominal_floor: U256, ratio: EfficiencyRatio) -> U256 {
    let bps = U256::from(ratio.bps());
    let scaled = nominal_floor.saturating_mul(U256::from(BPS));
    let ceiling = scaled.saturating_add(bps - U256::one()) / bps;
    ceiling.max(raw)
}

/// Expected actual usage per gas component.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NominalFloors {
    pub account_verification: U256,
    pub paymaster_verification: U256,
    pub post_op: U256,
}

impl NominalFloors {
    pub fn token() -> Self {
        Self {
            account_verification: U256::from(40_000u64),
            paymaster_verification: U256::from(40_000u64),
            post_op: U256::from(35_000u64),
        }
    }

    /// Credit validation reads operator config and user credit, so it floors higher.
    pub fn credit() -> Self {
        Self {
            account_verification: U256::from(40_000u64),
            paymaster_verification: U256::from(60_000u64),
            post_op: U256::from(45_000u64),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TunerConfig {
    pub ratio: EfficiencyRatio,
    pub token_floors: NominalFloors,
    pub credit_floors: NominalFloors,
    pub call_gas_buffer_percent: u64,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            ratio: EfficiencyRatio::DEFAULT,
            token_floors: NominalFloors::token(),
            credit_floors: NominalFloors::credit(),
            call_gas_buffer_percent: 10,
        }
    }
}

impl TunerConfig {
    pub fn floors(&self, model: SponsorModel) -> NominalFloors {
        match model {
            SponsorModel::Token => self.token_floors,
            SponsorModel::Credit => self.credit_floors,
        }
    }
}

pub(crate) fn add_percent(v: U256, percent: u64) -> U256 {
    v.saturating_add(v.saturating_mul(U256::from(percent)) / 100)
}

pub fn tune(estimate: &GasEstimate, model: SponsorModel, cfg: &TunerConfig) -> TunedLimits {
    let floors = cfg.floors(model);
    TunedLimits {
        pre_verification_gas: estimate.pre_verification_gas,
        verification_gas_limit: tune_gas_limit(
            estimate.verification_gas_limit,
            floors.account_verification,
            cfg.ratio,
        ),
        call_gas_limit: add_percent(estimate.call_gas_limit, cfg.call_gas_buffer_percent),
        paymaster_verification_gas_limit: tune_gas_limit(
            estimate.paymaster_verification_gas_limit,
            floors.paymaster_verification,
            cfg.ratio,
        ),
        paymaster_post_op_gas_limit: tune_gas_limit(
            estimate.paymaster_post_op_gas_limit,
            floors.post_op,
            cfg.ratio,
        ),
    }
}

fn packed_op_token(op: &PackedUserOperation) -> Token {
    Token::Tuple(vec![
        Token::Address(op.sender),
        Token::Uint(op.nonce),
        Token::Bytes(op.init_code.to_vec()),
        Token::Bytes(op.call_data.to_vec()),
        Token::FixedBytes(op.account_gas_limits.to_vec()),
        Token::Uint(op.pre_verification_gas),
        Token::FixedBytes(op.gas_fees.to_vec()),
        Token::Bytes(op.paymaster_and_data.to_vec()),
        Token::Bytes(op.signature.to_vec()),
    ])
}

/// Calldata cost of the ABI-encoded operation plus fixed overheads, buffered.
pub fn local_pre_verification_gas(op: &PackedUserOperation) -> U256 {
    let encoded = encode(&[packed_op_token(op)]);
    let calldata: u64 = encoded
        .iter()
        .map(|b| if *b == 0 { ZERO_BYTE_GAS } else { NON_ZERO_BYTE_GAS })
        .sum();
    let words = encoded.len().div_ceil(32) as u64;
    let raw = calldata + TX_BASE_GAS + PER_OP_OVERHEAD_GAS + PER_WORD_GAS * words;
    U256::from(raw + raw * PVG_BUFFER_PERCENT / 100 + PVG_FIXED_PAD)
}

pub fn fallback_estimate(op: &PackedUserOperation) -> GasEstimate {
    GasEstimate {
        pre_verification_gas: local_pre_verification_gas(op),
        verification_gas_limit: U256::from(FALLBACK_VERIFICATION_GAS),
        call_gas_limit: U256::from(FALLBACK_CALL_GAS),
        paymaster_verification_gas_limit: U256::from(FALLBACK_PAYMASTER_VERIFICATION_GAS),
        paymaster_post_op_gas_limit: U256::from(FALLBACK_POST_OP_GAS),
    }
}

/// Copy of `draft` with conservative placeholder limits and a dummy signature.
pub fn probe_operation(draft: &UserOperation) -> UserOperation {
    let mut op = draft.clone();
    op.verification_gas_limit = U256::from(PROBE_VERIFICATION_GAS);
    op.call_gas_limit = U256::from(PROBE_CALL_GAS);
    op.pre_verification_gas = U256::from(PROBE_PRE_VERIFICATION_GAS);
    if op.paymaster.is_some() {
        op.paymaster_verification_gas_limit = U256::from(PROBE_PAYMASTER_VERIFICATION_GAS);
        op.paymaster_post_op_gas_limit = U256::from(PROBE_POST_OP_GAS);
    }
    let mut sig = vec![0xffu8; PLACEHOLDER_SIGNATURE_LEN];
    sig[PLACEHOLDER_SIGNATURE_LEN - 1] = 0x1c;
    op.signature = Bytes::from(sig);
    op
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NetworkKind {
    /// Test or permissioned network where this client may refresh the sponsor's price.
    #[default]
    Permissioned,
    Production,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PriceQuote {
    pub price: U256,
    pub updated_at: u64,
    pub staleness_threshold: u64,
}

impl PriceQuote {
    /// A zero price or a never-set timestamp is never fresh.
    pub fn is_fresh(&self, now: u64) -> bool {
        !self.price.is_zero()
            && self.updated_at != 0
            && now.saturating_sub(self.updated_at) <= self.staleness_threshold
    }
}

/// A sponsor whose exchange rate is cached on-chain with an expiry.
#[async_trait]
pub trait PriceQuoteSource: Send + Sync {
    fn paymaster(&self) -> Address;

    async fn read_quote(&self) -> Result<PriceQuote, Error>;

    /// Sends the refresh transaction and returns once it is final.
    async fn refresh_quote(&self) -> Result<H256, Error>;
}

pub async fn ensure_fresh_quote(
    source: &dyn PriceQuoteSource,
    network: NetworkKind,
    now: u64,
) -> Result<PriceQuote, Error> {
    let quote = source.read_quote().await?;
    if quote.is_fresh(now) {
        return Ok(quote);
    }

    let paymaster = source.paymaster();
    let stale = |q: PriceQuote, remediation: String| Error::StaleQuote {
        paymaster,
        updated_at: q.updated_at,
        threshold: q.staleness_threshold,
        now,
        remediation,
    };

    match network {
        NetworkKind::Production => Err(stale(
            quote,
            "ask the sponsor operator to call updatePrice(); this client holds no refresh key"
                .to_string(),
        )),
        NetworkKind::Permissioned => {
            tracing::warn!(
                paymaster = ?paymaster,
                updated_at = quote.updated_at,
                threshold = quote.staleness_threshold,
                "sponsor price quote is stale; refreshing"
            );
            let tx = source.refresh_quote().await?;
            let refreshed = source.read_quote().await?;
            if refreshed.is_fresh(now) {
                tracing::info!(tx = ?tx, updated_at = refreshed.updated_at, "sponsor price refreshed");
                Ok(refreshed)
            } else {
                Err(stale(
                    refreshed,
                    format!("refresh transaction {tx:?} did not make the quote fresh"),
                ))
            }
        }
    }
}

/// Probes the relay once and tunes the result.
pub struct GasEstimator<'a> {
    relay: &'a dyn Relay,
    entry_point: Address,
    tuner: TunerConfig,
    quote_source: Option<&'a dyn PriceQuoteSource>,
    network: NetworkKind,
    clock: fn() -> u64,
}

impl<'a> GasEstimator<'a> {
    pub fn new(relay: &'a dyn Relay, entry_point: Address, tuner: TunerConfig) -> Self {
        Self {
            relay,
            entry_point,
            tuner,
            quote_source: None,
            network: NetworkKind::default(),
            clock: crate::now_unix,
        }
    }

    pub fn with_quote_source(
        mut self,
        source: &'a dyn PriceQuoteSource,
        network: NetworkKind,
    ) -> Self {
        self.quote_source = Some(source);
        self.network = network;
        self
    }

    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    /// Raw relay estimate for `draft`, or the fallback table if the relay cannot estimate or
    /// cannot be reached.
    pub async fn probe(&self, draft: &UserOperation) -> Result<GasEstimate, Error> {
        let probe = probe_operation(draft);
        match self
            .relay
            .estimate_user_operation_gas(&probe, self.entry_point)
            .await
        {
            Ok(est) => Ok(est),
            Err(e) if e.is_method_not_found() => {
                tracing::warn!(error = %e, "relay cannot estimate; using fallback limits");
                Ok(fallback_estimate(&probe.pack()?))
            }
            Err(RelayError::Transport(e)) => {
                tracing::warn!(error = %e, "relay unreachable; using fallback limits");
                Ok(fallback_estimate(&probe.pack()?))
            }
            Err(RelayError::Rpc(e)) => Err(Error::Estimation(e)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn estimate(
        &self,
        draft: &UserOperation,
        model: SponsorModel,
    ) -> Result<TunedLimits, Error> {
        if let Some(source) = self.quote_source {
            ensure_fresh_quote(source, self.network, (self.clock)()).await?;
        }

        let raw = self.probe(draft).await?;
        let tuned = tune(&raw, model, &self.tuner);
        tracing::debug!(?raw, ?tuned, ?model, "gas limits tuned");
        Ok(tuned)
    }
}
