use ethers::types::{Address, H256, U256};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;

/// Malformed or wrong-width byte field. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("invalid hex in {field}: {reason}")]
    InvalidHex { field: &'static str, reason: String },

    #[error("{field} must be exactly {expected} bytes, got {actual}")]
    WrongLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{field} is {actual} bytes, shorter than its {min}-byte header")]
    Truncated {
        field: &'static str,
        min: usize,
        actual: usize,
    },

    #[error("{field} value {value} does not fit in {width} bytes")]
    FieldOverflow {
        field: &'static str,
        width: usize,
        value: U256,
    },

    #[error("inconsistent operation: {0}")]
    Inconsistent(&'static str),
}

/// JSON-RPC error object as returned by a bundler: `{code, message, data?}`.
#[derive(Debug, Clone, PartialEq, Deserialize, thiserror::Error)]
#[error("RPC error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl RpcError {
    pub const METHOD_NOT_FOUND: i64 = -32601;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// True when the relay does not implement the requested method.
    ///
    /// Some relays answer with the standard `-32601` code, others wrap the condition in a
    /// generic server error and only say so in the message.
    pub fn is_method_not_found(&self) -> bool {
        if self.code == Self::METHOD_NOT_FOUND {
            return true;
        }
        let msg = self.message.to_ascii_lowercase();
        msg.contains("method not found")
            || msg.contains("method not supported")
            || msg.contains("does not exist/is not available")
            || msg.contains("unsupported method")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("relay transport error: {0:#}")]
    Transport(anyhow::Error),

    #[error("unexpected relay response: {0}")]
    Malformed(String),
}

impl RelayError {
    pub fn is_method_not_found(&self) -> bool {
        matches!(self, RelayError::Rpc(e) if e.is_method_not_found())
    }
}

/// Rejection categories the submission loop understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    ReplacementUnderpriced,
    PriorityFeeTooLow,
    MaxFeeTooLow,
    PreVerificationGasTooLow,
    Unclassified,
}

impl RejectionKind {
    pub fn is_recoverable(self) -> bool {
        !matches!(self, RejectionKind::Unclassified)
    }
}

impl fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectionKind::ReplacementUnderpriced => "replacement underpriced",
            RejectionKind::PriorityFeeTooLow => "priority fee too low",
            RejectionKind::MaxFeeTooLow => "max fee too low",
            RejectionKind::PreVerificationGasTooLow => "pre-verification gas too low",
            RejectionKind::Unclassified => "unclassified",
        };
        f.write_str(s)
    }
}

/// Broad cause of an EntryPoint or relay failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AaFailureKind {
    InvalidSignature,
    InvalidNonce,
    /// Account prefund or paymaster deposit cannot cover the operation.
    InsufficientFunds,
    /// Account or paymaster validation reverted.
    Reverted,
    RateLimited,
    /// An `AAxx` code outside the groups above.
    Other,
}

impl fmt::Display for AaFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AaFailureKind::InvalidSignature => "invalid signature",
            AaFailureKind::InvalidNonce => "invalid or already used nonce",
            AaFailureKind::InsufficientFunds => "account or paymaster cannot pay",
            AaFailureKind::Reverted => "validation reverted",
            AaFailureKind::RateLimited => "relay rate limit",
            AaFailureKind::Other => "entry point rejection",
        };
        f.write_str(s)
    }
}

/// Decoded EntryPoint failure: the `AAxx` code when the relay quoted one, and its cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AaFailure {
    pub code: Option<String>,
    pub kind: AaFailureKind,
}

/// Relay error code for throttled requests.
pub const RATE_LIMIT_CODE: i64 = -32604;

/// First standalone `AAxx` token in `msg`, upper-cased.
fn aa_code(msg: &str) -> Option<String> {
    let b = msg.as_bytes();
    (0..b.len().saturating_sub(3)).find_map(|i| {
        let standalone = (i == 0 || !b[i - 1].is_ascii_alphanumeric())
            && b.get(i + 4).map_or(true, |c| !c.is_ascii_alphanumeric());
        let is_code = b[i].eq_ignore_ascii_case(&b'a')
            && b[i + 1].eq_ignore_ascii_case(&b'a')
            && b[i + 2].is_ascii_digit()
            && b[i + 3].is_ascii_digit();
        (standalone && is_code).then(|| format!("AA{}", &msg[i + 2..i + 4]))
    })
}

impl AaFailure {
    /// Reads the EntryPoint code (or the equivalent wording) out of a relay error.
    ///
    /// `None` when the error carries neither.
    pub fn from_rpc(err: &RpcError) -> Option<AaFailure> {
        let msg = err.message.to_ascii_lowercase();
        let code = aa_code(&err.message);

        if err.code == RATE_LIMIT_CODE || msg.contains("rate limit") || msg.contains("too many requests") {
            return Some(AaFailure {
                code,
                kind: AaFailureKind::RateLimited,
            });
        }

        let by_code = code.as_deref().map(|c| match c {
            "AA21" | "AA31" => AaFailureKind::InsufficientFunds,
            "AA23" | "AA33" => AaFailureKind::Reverted,
            "AA24" | "AA34" => AaFailureKind::InvalidSignature,
            "AA25" => AaFailureKind::InvalidNonce,
            _ => AaFailureKind::Other,
        });
        let by_text = || {
            if msg.contains("invalid signature") || msg.contains("signature error") {
                Some(AaFailureKind::InvalidSignature)
            } else if msg.contains("nonce too low") || msg.contains("invalid account nonce") {
                Some(AaFailureKind::InvalidNonce)
            } else if msg.contains("paymaster deposit too low") || msg.contains("didn't pay prefund") {
                Some(AaFailureKind::InsufficientFunds)
            } else if msg.contains("reverted") {
                Some(AaFailureKind::Reverted)
            } else {
                None
            }
        };

        by_code
            .or_else(by_text)
            .map(|kind| AaFailure { code, kind })
    }
}

impl fmt::Display for AaFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{code}: {}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// Fee/gas fields as they were sent on a given attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeeSnapshot {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub pre_verification_gas: U256,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub user_op_hash: H256,
    pub fees: FeeSnapshot,
    pub kind: RejectionKind,
    pub message: String,
}

/// Terminal submission failure with everything a caller needs to resubmit manually.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionFailure {
    pub category: RejectionKind,
    /// EntryPoint cause decoded from `last_error`, if it names one.
    pub reason: Option<AaFailure>,
    pub last_error: RpcError,
    pub attempts: u32,
    pub last_fees: FeeSnapshot,
    pub history: Vec<AttemptRecord>,
}

impl fmt::Display for SubmissionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(reason) = &self.reason {
            write!(f, "[{reason}] ")?;
        }
        write!(
            f,
            "{} after {} attempt(s) (maxFeePerGas={}, maxPriorityFeePerGas={}, preVerificationGas={}): {}",
            self.category,
            self.attempts,
            self.last_fees.max_fee_per_gas,
            self.last_fees.max_priority_fee_per_gas,
            self.last_fees.pre_verification_gas,
            self.last_error.message
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(
        "price quote of sponsor {paymaster:?} is stale (updatedAt={updated_at}, threshold={threshold}s, now={now}): {remediation}"
    )]
    StaleQuote {
        paymaster: Address,
        updated_at: u64,
        threshold: u64,
        now: u64,
        remediation: String,
    },

    #[error("gas estimation rejected by relay: {0}")]
    Estimation(RpcError),

    #[error("relay does not support {method}")]
    UnsupportedMethod { method: String },

    #[error("submission retries exhausted: {0}")]
    SubmissionExhausted(Box<SubmissionFailure>),

    #[error("submission rejected: {0}")]
    SubmissionRejected(Box<SubmissionFailure>),

    #[error("no receipt for {hash:?} after {attempts} polls; the operation may still be included")]
    ReceiptTimeout { hash: H256, attempts: u32 },

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("{context}: {source:#}")]
    Chain {
        context: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Wraps an on-chain call failure with a short description of the call.
    pub fn chain<E>(context: &'static str) -> impl FnOnce(E) -> Error
    where
        E: fmt::Display,
    {
        move |e| Error::Chain {
            context,
            source: anyhow::anyhow!("{e}"),
        }
    }

    pub fn failure(&self) -> Option<&SubmissionFailure> {
        match self {
            Error::SubmissionExhausted(f) | Error::SubmissionRejected(f) => Some(f),
            _ => None,
        }
    }
}
