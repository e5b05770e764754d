use anyhow::{anyhow, bail, Context, Result};
use ethers::types::{Address, U256};
use serde::Deserialize;
use std::time::Duration;
use std::{env, fs, path::Path};

use crate::bundler::ReceiptPolling;
use crate::encoding::parse_u256_quantity;
use crate::fees::FeePolicy;
use crate::gas::{EfficiencyRatio, NetworkKind, NominalFloors, TunerConfig};
use crate::paymaster::{CreditLayout, Sponsor, SponsorModel, SponsorshipPayload, DEFAULT_VALIDITY_WINDOW_SECS};
use crate::readiness::Subject;
use crate::retry::RetryPolicy;

const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRaw {
    pub chain_id: u64,
    pub rpc: String,
    #[serde(default)]
    pub rpc_env_var: Option<String>,
    pub bundler: String,
    #[serde(default)]
    pub bundler_env_var: Option<String>,
    pub entry_point: String,
    #[serde(default)]
    pub network: NetworkKind,
    pub sponsor: SponsorRaw,
    #[serde(default)]
    pub fees: FeesRaw,
    #[serde(default)]
    pub tuning: TuningRaw,
    #[serde(default)]
    pub retry: RetryRaw,
    #[serde(default)]
    pub receipt: ReceiptRaw,
    #[serde(default)]
    pub http_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SponsorRaw {
    pub kind: SponsorModel,
    pub paymaster: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub max_rate: Option<String>,
    #[serde(default)]
    pub credit_layout: CreditLayout,
    #[serde(default)]
    pub validity_window_seconds: Option<u64>,
    /// Used only when the sponsor contract has no `priceStalenessThreshold` getter.
    #[serde(default)]
    pub staleness_threshold_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeesRaw {
    #[serde(default)]
    pub multiplier_bps: Option<u64>,
    #[serde(default)]
    pub min_priority_fee_wei: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FloorsRaw {
    pub account_verification: u64,
    pub paymaster_verification: u64,
    pub post_op: u64,
}

impl From<FloorsRaw> for NominalFloors {
    fn from(raw: FloorsRaw) -> Self {
        NominalFloors {
            account_verification: U256::from(raw.account_verification),
            paymaster_verification: U256::from(raw.paymaster_verification),
            post_op: U256::from(raw.post_op),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TuningRaw {
    #[serde(default)]
    pub efficiency_ratio: Option<f64>,
    #[serde(default)]
    pub token_floors: Option<FloorsRaw>,
    #[serde(default)]
    pub credit_floors: Option<FloorsRaw>,
    #[serde(default)]
    pub call_gas_buffer_percent: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRaw {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub flat_bump_percent: Option<u64>,
    #[serde(default)]
    pub replacement_bump_percent: Option<u64>,
    #[serde(default)]
    pub pvg_buffer_percent: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptRaw {
    #[serde(default)]
    pub poll_attempts: Option<u32>,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SponsorTarget {
    Token {
        token: Address,
        validity_window_secs: u64,
    },
    Credit {
        operator: Address,
        max_rate: Option<U256>,
        layout: CreditLayout,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SponsorConfig {
    pub paymaster: Address,
    pub target: SponsorTarget,
    pub staleness_threshold_secs: Option<u64>,
}

impl SponsorConfig {
    /// Sponsorship for an operation built at `now`.
    pub fn sponsor(&self, now: u64) -> Sponsor {
        match &self.target {
            SponsorTarget::Token {
                token,
                validity_window_secs,
            } => Sponsor {
                paymaster: self.paymaster,
                payload: SponsorshipPayload::token(*token, *validity_window_secs, now),
                credit_layout: CreditLayout::default(),
            },
            SponsorTarget::Credit {
                operator,
                max_rate,
                layout,
            } => Sponsor {
                paymaster: self.paymaster,
                payload: SponsorshipPayload::credit(*operator, *max_rate),
                credit_layout: *layout,
            },
        }
    }

    pub fn subject(&self) -> Subject {
        match &self.target {
            SponsorTarget::Token { token, .. } => Subject::Token(*token),
            SponsorTarget::Credit { operator, .. } => Subject::Operator(*operator),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Deployment {
    pub chain_id: u64,
    pub rpc_url: String,
    pub bundler_url: String,
    pub entry_point: Address,
    pub network: NetworkKind,
    pub sponsor: SponsorConfig,
    pub fees: FeePolicy,
    pub tuner: TunerConfig,
    pub retry: RetryPolicy,
    pub receipt: ReceiptPolling,
    pub http_timeout: Duration,
}

pub fn load_deployment(
    path: &Path,
    rpc_override: Option<String>,
    bundler_override: Option<String>,
) -> Result<Deployment> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read deployment json at {}", path.display()))?;
    let raw: DeploymentRaw = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse deployment json at {}", path.display()))?;
    resolve(raw, rpc_override, bundler_override)
}

/// Override, then the named env var, then the literal value.
fn pick_url(override_url: Option<String>, env_var: Option<&str>, literal: &str) -> String {
    if let Some(url) = override_url {
        return url;
    }
    env_var
        .and_then(|name| env::var(name).ok())
        .unwrap_or_else(|| literal.to_string())
}

pub fn resolve(
    raw: DeploymentRaw,
    rpc_override: Option<String>,
    bundler_override: Option<String>,
) -> Result<Deployment> {
    let rpc_url = pick_url(rpc_override, raw.rpc_env_var.as_deref(), &raw.rpc);
    let bundler_url = pick_url(bundler_override, raw.bundler_env_var.as_deref(), &raw.bundler);

    let entry_point = parse_addr(&raw.entry_point).context("invalid entryPoint address")?;
    let sponsor = resolve_sponsor(&raw.sponsor)?;

    let defaults = FeePolicy::default();
    let fees = FeePolicy {
        multiplier_bps: raw.fees.multiplier_bps.unwrap_or(defaults.multiplier_bps),
        min_priority_fee: raw
            .fees
            .min_priority_fee_wei
            .as_deref()
            .map(|s| parse_u256_quantity("minPriorityFeeWei", s))
            .transpose()?,
    };
    if fees.multiplier_bps == 0 {
        bail!("fees.multiplierBps must be positive");
    }

    let defaults = TunerConfig::default();
    let tuner = TunerConfig {
        ratio: match raw.tuning.efficiency_ratio {
            Some(r) => EfficiencyRatio::from_ratio(r)?,
            None => defaults.ratio,
        },
        token_floors: raw.tuning.token_floors.map(Into::into).unwrap_or(defaults.token_floors),
        credit_floors: raw.tuning.credit_floors.map(Into::into).unwrap_or(defaults.credit_floors),
        call_gas_buffer_percent: raw
            .tuning
            .call_gas_buffer_percent
            .unwrap_or(defaults.call_gas_buffer_percent),
    };

    let defaults = RetryPolicy::default();
    let retry = RetryPolicy {
        max_attempts: raw.retry.max_attempts.unwrap_or(defaults.max_attempts),
        flat_bump_percent: raw.retry.flat_bump_percent.unwrap_or(defaults.flat_bump_percent),
        replacement_bump_percent: raw
            .retry
            .replacement_bump_percent
            .unwrap_or(defaults.replacement_bump_percent),
        pvg_buffer_percent: raw.retry.pvg_buffer_percent.unwrap_or(defaults.pvg_buffer_percent),
    };
    if retry.max_attempts == 0 {
        bail!("retry.maxAttempts must be at least 1");
    }

    let defaults = ReceiptPolling::default();
    let receipt = ReceiptPolling {
        attempts: raw.receipt.poll_attempts.unwrap_or(defaults.attempts),
        interval: raw
            .receipt
            .poll_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.interval),
    };

    Ok(Deployment {
        chain_id: raw.chain_id,
        rpc_url,
        bundler_url,
        entry_point,
        network: raw.network,
        sponsor,
        fees,
        tuner,
        retry,
        receipt,
        http_timeout: Duration::from_secs(
            raw.http_timeout_seconds.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
        ),
    })
}

fn resolve_sponsor(raw: &SponsorRaw) -> Result<SponsorConfig> {
    let paymaster = parse_addr(&raw.paymaster).context("invalid sponsor.paymaster address")?;
    let target = match raw.kind {
        SponsorModel::Token => {
            let token = raw
                .token
                .as_deref()
                .ok_or_else(|| anyhow!("sponsor.kind \"token\" requires sponsor.token"))?;
            SponsorTarget::Token {
                token: parse_addr(token).context("invalid sponsor.token address")?,
                validity_window_secs: raw
                    .validity_window_seconds
                    .unwrap_or(DEFAULT_VALIDITY_WINDOW_SECS),
            }
        }
        SponsorModel::Credit => {
            let operator = raw
                .operator
                .as_deref()
                .ok_or_else(|| anyhow!("sponsor.kind \"credit\" requires sponsor.operator"))?;
            SponsorTarget::Credit {
                operator: parse_addr(operator).context("invalid sponsor.operator address")?,
                max_rate: raw
                    .max_rate
                    .as_deref()
                    .map(|s| parse_u256_quantity("maxRate", s))
                    .transpose()?,
                layout: raw.credit_layout,
            }
        }
    };
    Ok(SponsorConfig {
        paymaster,
        target,
        staleness_threshold_secs: raw.staleness_threshold_seconds,
    })
}

fn parse_addr(s: &str) -> Result<Address> {
    s.parse::<Address>().map_err(|e| anyhow!("{e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(v: serde_json::Value) -> DeploymentRaw {
        serde_json::from_value(v).unwrap()
    }

    fn token_deployment() -> serde_json::Value {
        json!({
            "chainId": 11155111,
            "rpc": "https://rpc.example",
            "bundler": "https://bundler.example",
            "entryPoint": "0x0000000071727De22E5E9d8BAf0edAc6f37da032",
            "sponsor": {
                "kind": "token",
                "paymaster": "0x9999999999999999999999999999999999999999",
                "token": "0x7e7e7e7e7e7e7e7e7e7e7e7e7e7e7e7e7e7e7e7e"
            }
        })
    }

    #[test]
    fn minimal_deployment_uses_defaults() {
        let d = resolve(raw(token_deployment()), None, None).unwrap();
        assert_eq!(d.chain_id, 11155111);
        assert_eq!(d.rpc_url, "https://rpc.example");
        assert_eq!(d.network, NetworkKind::Permissioned);
        assert_eq!(d.fees, FeePolicy::default());
        assert_eq!(d.tuner, TunerConfig::default());
        assert_eq!(d.retry, RetryPolicy::default());
        assert_eq!(d.http_timeout, Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS));
        assert_eq!(
            d.sponsor.target,
            SponsorTarget::Token {
                token: Address::repeat_byte(0x7e),
                validity_window_secs: DEFAULT_VALIDITY_WINDOW_SECS,
            }
        );
        assert_eq!(d.sponsor.subject(), Subject::Token(Address::repeat_byte(0x7e)));
    }

    #[test]
    fn overrides_win_over_file_values() {
        let d = resolve(
            raw(token_deployment()),
            Some("http://localhost:8545".into()),
            Some("http://localhost:4337".into()),
        )
        .unwrap();
        assert_eq!(d.rpc_url, "http://localhost:8545");
        assert_eq!(d.bundler_url, "http://localhost:4337");
    }

    #[test]
    fn credit_deployment_with_tuning_and_retry() {
        let d = resolve(
            raw(json!({
                "chainId": 1,
                "rpc": "https://rpc.example",
                "bundler": "https://bundler.example",
                "entryPoint": "0x0000000071727De22E5E9d8BAf0edAc6f37da032",
                "network": "production",
                "sponsor": {
                    "kind": "credit",
                    "paymaster": "0x9999999999999999999999999999999999999999",
                    "operator": "0x0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b",
                    "maxRate": "1000000",
                    "creditLayout": "rateCapped"
                },
                "fees": { "multiplierBps": 12000, "minPriorityFeeWei": "0x3b9aca00" },
                "tuning": { "efficiencyRatio": 0.5, "creditFloors": { "accountVerification": 1, "paymasterVerification": 2, "postOp": 3 } },
                "retry": { "maxAttempts": 3 },
                "receipt": { "pollAttempts": 5, "pollIntervalMs": 200 },
                "httpTimeoutSeconds": 10
            })),
            None,
            None,
        )
        .unwrap();

        assert_eq!(d.network, NetworkKind::Production);
        assert_eq!(d.fees.multiplier_bps, 12_000);
        assert_eq!(d.fees.min_priority_fee, Some(U256::from(1_000_000_000u64)));
        assert_eq!(d.tuner.ratio.bps(), 5_000);
        assert_eq!(d.tuner.credit_floors.post_op, U256::from(3u64));
        assert_eq!(d.tuner.token_floors, NominalFloors::token());
        assert_eq!(d.retry.max_attempts, 3);
        assert_eq!(d.retry.flat_bump_percent, 15);
        assert_eq!(d.receipt.interval, Duration::from_millis(200));

        let sponsor = d.sponsor.sponsor(0);
        assert_eq!(sponsor.model(), SponsorModel::Credit);
        assert_eq!(sponsor.credit_layout, CreditLayout::RateCapped);
        assert_eq!(sponsor.paymaster_data().unwrap().len(), 52);
    }

    #[test]
    fn token_sponsor_requires_token() {
        let mut v = token_deployment();
        v["sponsor"].as_object_mut().unwrap().remove("token");
        let err = resolve(raw(v), None, None).unwrap_err();
        assert!(err.to_string().contains("sponsor.token"));
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let mut v = token_deployment();
        v["retry"] = json!({ "maxAttempts": 0 });
        assert!(resolve(raw(v), None, None).is_err());
    }
}
