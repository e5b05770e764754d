//! Rejection classification and the fee/gas mutations applied between submission attempts.

use ethers::types::{Bytes, U256};

use crate::encoding::parse_quantity_value;
use crate::error::{FeeSnapshot, RejectionKind, RpcError};
use crate::fees::FeeQuote;
use crate::gas::add_percent;
use crate::types::UserOperation;

/// Initial attempt plus four retries.
pub const MAX_ATTEMPTS: u32 = 5;

/// Substring table over the lowercased relay message.
///
/// The entry found earliest in the message wins, so the field a message is about decides the
/// kind even when the explanation names another field; table order breaks ties. Fee and gas
/// entries only apply when the message also says the value was too small (see
/// [`LOW_QUALIFIERS`]); otherwise a message that merely names the field is unclassified.
pub const CLASSIFICATION_TABLE: &[(&str, RejectionKind)] = &[
    ("replacement underpriced", RejectionKind::ReplacementUnderpriced),
    ("replacement op must increase", RejectionKind::ReplacementUnderpriced),
    ("replacement fee too low", RejectionKind::ReplacementUnderpriced),
    ("preverificationgas", RejectionKind::PreVerificationGasTooLow),
    ("pre-verification gas", RejectionKind::PreVerificationGasTooLow),
    ("pre verification gas", RejectionKind::PreVerificationGasTooLow),
    ("maxpriorityfeepergas", RejectionKind::PriorityFeeTooLow),
    ("max priority fee", RejectionKind::PriorityFeeTooLow),
    ("priority fee", RejectionKind::PriorityFeeTooLow),
    ("maxfeepergas", RejectionKind::MaxFeeTooLow),
    ("max fee", RejectionKind::MaxFeeTooLow),
];

pub const LOW_QUALIFIERS: &[&str] = &[
    "too low",
    "at least",
    "below",
    "minimum",
    "required",
    "insufficient",
    "underpriced",
];

const MINIMUM_MARKERS: &[&str] = &["at least", "required", "minimum", "expected", "need"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Bump applied when no usable minimum is stated.
    pub flat_bump_percent: u64,
    /// Increase over the in-pool fees a replacement must carry.
    pub replacement_bump_percent: u64,
    /// Added on top of a relay-stated pre-verification gas minimum.
    pub pvg_buffer_percent: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            flat_bump_percent: 15,
            replacement_bump_percent: 10,
            pvg_buffer_percent: 5,
        }
    }
}

/// A classified relay rejection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejection {
    pub kind: RejectionKind,
    /// Minimum stated in the message, if one could be parsed.
    pub required: Option<U256>,
    /// In-pool fees from a replacement-underpriced error payload.
    pub current: Option<FeeQuote>,
}

pub fn classify(err: &RpcError) -> Rejection {
    let msg = err.message.to_ascii_lowercase();
    let qualified = LOW_QUALIFIERS.iter().any(|q| msg.contains(q));
    let kind = CLASSIFICATION_TABLE
        .iter()
        .filter(|(_, kind)| qualified || *kind == RejectionKind::ReplacementUnderpriced)
        .filter_map(|(needle, kind)| msg.find(needle).map(|pos| (pos, *kind)))
        .min_by_key(|(pos, _)| *pos)
        .map(|(_, kind)| kind)
        .unwrap_or(RejectionKind::Unclassified);

    let current = match kind {
        RejectionKind::ReplacementUnderpriced => err.data.as_ref().and_then(in_pool_fees),
        _ => None,
    };
    let required = match kind {
        RejectionKind::Unclassified | RejectionKind::ReplacementUnderpriced => None,
        _ => parse_required_amount(&err.message),
    };

    Rejection {
        kind,
        required,
        current,
    }
}

fn in_pool_fees(data: &serde_json::Value) -> Option<FeeQuote> {
    let priority = data.get("currentMaxPriorityFee")?;
    let max_fee = data.get("currentMaxFee")?;
    Some(FeeQuote {
        max_priority_fee_per_gas: parse_quantity_value("currentMaxPriorityFee", priority).ok()?,
        max_fee_per_gas: parse_quantity_value("currentMaxFee", max_fee).ok()?,
    })
}

fn parse_number(tok: &str) -> Option<U256> {
    if let Some(h) = tok.strip_prefix("0x") {
        if !h.is_empty() && h.chars().all(|c| c.is_ascii_hexdigit()) {
            return U256::from_str_radix(h, 16).ok();
        }
        return None;
    }
    if !tok.is_empty() && tok.chars().all(|c| c.is_ascii_digit()) {
        return U256::from_dec_str(tok).ok();
    }
    None
}

fn numbers(s: &str) -> impl Iterator<Item = U256> + '_ {
    s.split(|c: char| !c.is_ascii_alphanumeric())
        .filter_map(parse_number)
}

/// The minimum a relay message asks for: the first number after a marker such as
/// "at least", otherwise the largest number in the message.
pub fn parse_required_amount(message: &str) -> Option<U256> {
    let lower = message.to_ascii_lowercase();
    let after_marker = MINIMUM_MARKERS
        .iter()
        .filter_map(|m| lower.find(m).map(|i| i + m.len()))
        .min();
    if let Some(start) = after_marker {
        if let Some(n) = numbers(&lower[start..]).next() {
            return Some(n);
        }
    }
    numbers(&lower).max()
}

/// Mutable fee/gas fields of an operation between attempts.
///
/// Consumed by [`RetryState::next`]; the returned state has no signature until re-signed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryState {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub pre_verification_gas: U256,
    pub signature: Bytes,
}

impl RetryState {
    pub fn from_operation(op: &UserOperation) -> Self {
        Self {
            max_fee_per_gas: op.max_fee_per_gas,
            max_priority_fee_per_gas: op.max_priority_fee_per_gas,
            pre_verification_gas: op.pre_verification_gas,
            signature: op.signature.clone(),
        }
    }

    pub fn apply_to(&self, op: &mut UserOperation) {
        op.max_fee_per_gas = self.max_fee_per_gas;
        op.max_priority_fee_per_gas = self.max_priority_fee_per_gas;
        op.pre_verification_gas = self.pre_verification_gas;
        op.signature = self.signature.clone();
    }

    pub fn signed(self, signature: Bytes) -> Self {
        Self { signature, ..self }
    }

    pub fn snapshot(&self) -> FeeSnapshot {
        FeeSnapshot {
            max_fee_per_gas: self.max_fee_per_gas,
            max_priority_fee_per_gas: self.max_priority_fee_per_gas,
            pre_verification_gas: self.pre_verification_gas,
        }
    }

    /// State for the next attempt. The caller must not call this for unclassified rejections.
    pub fn next(self, rejection: &Rejection, policy: &RetryPolicy) -> RetryState {
        let flat = |v: U256| add_percent(v, policy.flat_bump_percent).max(v + U256::one());
        // A stated minimum that does not move us forward is treated as absent.
        let adopt = |current: U256| match rejection.required {
            Some(min) if min > current => min,
            _ => flat(current),
        };

        let mut max_fee = self.max_fee_per_gas;
        let mut priority = self.max_priority_fee_per_gas;
        let mut pvg = self.pre_verification_gas;

        match rejection.kind {
            RejectionKind::ReplacementUnderpriced => {
                priority = flat(priority);
                max_fee = flat(max_fee);
                if let Some(cur) = rejection.current {
                    let bump = policy.replacement_bump_percent;
                    priority = priority.max(add_percent(cur.max_priority_fee_per_gas, bump));
                    max_fee = max_fee.max(add_percent(cur.max_fee_per_gas, bump));
                }
            }
            RejectionKind::PriorityFeeTooLow => priority = adopt(priority),
            RejectionKind::MaxFeeTooLow => max_fee = adopt(max_fee),
            RejectionKind::PreVerificationGasTooLow => {
                pvg = match rejection.required {
                    Some(min) => add_percent(min, policy.pvg_buffer_percent).max(pvg),
                    None => flat(pvg),
                };
            }
            RejectionKind::Unclassified => {}
        }

        RetryState {
            max_fee_per_gas: max_fee.max(priority),
            max_priority_fee_per_gas: priority,
            pre_verification_gas: pvg,
            signature: Bytes::new(),
        }
    }
}
