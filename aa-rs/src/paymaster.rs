use ethers::types::{Address, Bytes, Log, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};

use crate::codec::{decode_uint, encode_uint, pack_paymaster_and_data, split_paymaster_and_data};
use crate::error::CodecError;

/// Last-resort limits when no estimate is available for the sponsor's own validation.
pub const DEFAULT_VERIFICATION_GAS: u64 = 80_000;
pub const DEFAULT_POST_OP_GAS: u64 = 100_000;

/// Default validity window of a token sponsorship.
pub const DEFAULT_VALIDITY_WINDOW_SECS: u64 = 3600;

/// `validAfter` is backdated so a slightly-fast node clock does not reject the operation.
pub const VALID_AFTER_GRACE_SECS: u64 = 100;

const VALIDITY_WIDTH: usize = 6;
const MAX_RATE_WIDTH: usize = 32;

pub const TOKEN_DATA_LEN: usize = 20 + 2 * VALIDITY_WIDTH;
pub const CREDIT_MINIMAL_DATA_LEN: usize = 20;
pub const CREDIT_RATE_CAPPED_DATA_LEN: usize = 20 + MAX_RATE_WIDTH;

/// Which sponsorship model an operation uses. Selects the tuner floors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SponsorModel {
    Token,
    Credit,
}

/// Byte layout of the credit payload. Deployment-specific; never auto-detected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CreditLayout {
    /// `operator (20)`
    #[default]
    Minimal,
    /// `operator (20) || maxRate (32)`
    RateCapped,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SponsorshipPayload {
    Token {
        token: Address,
        valid_until: u64,
        valid_after: u64,
    },
    Credit {
        operator: Address,
        max_rate: U256,
    },
}

impl SponsorshipPayload {
    /// Token payload valid from `now - 100` until `now + window`.
    pub fn token(token: Address, window_secs: u64, now: u64) -> Self {
        SponsorshipPayload::Token {
            token,
            valid_until: now.saturating_add(window_secs),
            valid_after: now.saturating_sub(VALID_AFTER_GRACE_SECS),
        }
    }

    /// Credit payload. `max_rate` defaults to "no cap" when not given.
    pub fn credit(operator: Address, max_rate: Option<U256>) -> Self {
        SponsorshipPayload::Credit {
            operator,
            max_rate: max_rate.unwrap_or(U256::MAX),
        }
    }

    pub fn model(&self) -> SponsorModel {
        match self {
            SponsorshipPayload::Token { .. } => SponsorModel::Token,
            SponsorshipPayload::Credit { .. } => SponsorModel::Credit,
        }
    }

    /// The `paymasterData` tail (everything after the 52-byte header).
    pub fn encode(&self, layout: CreditLayout) -> Result<Bytes, CodecError> {
        let mut out = Vec::with_capacity(CREDIT_RATE_CAPPED_DATA_LEN);
        match self {
            SponsorshipPayload::Token {
                token,
                valid_until,
                valid_after,
            } => {
                out.extend_from_slice(token.as_bytes());
                out.extend(encode_uint(
                    "validUntil",
                    U256::from(*valid_until),
                    VALIDITY_WIDTH,
                )?);
                out.extend(encode_uint(
                    "validAfter",
                    U256::from(*valid_after),
                    VALIDITY_WIDTH,
                )?);
            }
            SponsorshipPayload::Credit { operator, max_rate } => {
                out.extend_from_slice(operator.as_bytes());
                if layout == CreditLayout::RateCapped {
                    out.extend(encode_uint("maxRate", *max_rate, MAX_RATE_WIDTH)?);
                }
            }
        }
        Ok(out.into())
    }

    /// Parses a `paymasterData` tail. The layout is recognised by length.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        match data.len() {
            TOKEN_DATA_LEN => {
                // u48 values always fit in u64
                let valid_until = decode_uint(&data[20..26]).low_u64();
                let valid_after = decode_uint(&data[26..32]).low_u64();
                Ok(SponsorshipPayload::Token {
                    token: Address::from_slice(&data[..20]),
                    valid_until,
                    valid_after,
                })
            }
            CREDIT_MINIMAL_DATA_LEN => Ok(SponsorshipPayload::Credit {
                operator: Address::from_slice(data),
                max_rate: U256::MAX,
            }),
            CREDIT_RATE_CAPPED_DATA_LEN => Ok(SponsorshipPayload::Credit {
                operator: Address::from_slice(&data[..20]),
                max_rate: decode_uint(&data[20..]),
            }),
            n => Err(CodecError::WrongLength {
                field: "paymasterData",
                expected: TOKEN_DATA_LEN,
                actual: n,
            }),
        }
    }
}

/// A sponsor contract together with the payload it should see.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sponsor {
    pub paymaster: Address,
    pub payload: SponsorshipPayload,
    pub credit_layout: CreditLayout,
}

impl Sponsor {
    pub fn model(&self) -> SponsorModel {
        self.payload.model()
    }

    pub fn paymaster_data(&self) -> Result<Bytes, CodecError> {
        self.payload.encode(self.credit_layout)
    }

    pub fn paymaster_and_data(
        &self,
        verification_gas: U256,
        post_op_gas: U256,
    ) -> Result<Bytes, CodecError> {
        pack_paymaster_and_data(
            self.paymaster,
            verification_gas,
            post_op_gas,
            &self.paymaster_data()?,
        )
    }
}

/// Full `paymasterAndData` for the token model (84 bytes).
pub fn build_token_sponsorship(
    paymaster: Address,
    token: Address,
    verification_gas: Option<U256>,
    post_op_gas: Option<U256>,
    window_secs: u64,
    now: u64,
) -> Result<Bytes, CodecError> {
    Sponsor {
        paymaster,
        payload: SponsorshipPayload::token(token, window_secs, now),
        credit_layout: CreditLayout::default(),
    }
    .paymaster_and_data(
        verification_gas.unwrap_or_else(|| U256::from(DEFAULT_VERIFICATION_GAS)),
        post_op_gas.unwrap_or_else(|| U256::from(DEFAULT_POST_OP_GAS)),
    )
}

/// Full `paymasterAndData` for the credit model (72 bytes minimal, 104 rate-capped).
pub fn build_credit_sponsorship(
    paymaster: Address,
    operator: Address,
    verification_gas: Option<U256>,
    post_op_gas: Option<U256>,
    max_rate: Option<U256>,
    layout: CreditLayout,
) -> Result<Bytes, CodecError> {
    Sponsor {
        paymaster,
        payload: SponsorshipPayload::credit(operator, max_rate),
        credit_layout: layout,
    }
    .paymaster_and_data(
        verification_gas.unwrap_or_else(|| U256::from(DEFAULT_VERIFICATION_GAS)),
        post_op_gas.unwrap_or_else(|| U256::from(DEFAULT_POST_OP_GAS)),
    )
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedSponsorship {
    pub paymaster: Address,
    pub verification_gas: U256,
    pub post_op_gas: U256,
    pub payload: SponsorshipPayload,
}

/// Inverse of the builders, for diagnostics. `None` for an unsponsored operation.
pub fn decode_paymaster_data(
    paymaster_and_data: &[u8],
) -> Result<Option<DecodedSponsorship>, CodecError> {
    let Some(fields) = split_paymaster_and_data(paymaster_and_data)? else {
        return Ok(None);
    };
    Ok(Some(DecodedSponsorship {
        paymaster: fields.paymaster,
        verification_gas: fields.verification_gas_limit,
        post_op_gas: fields.post_op_gas_limit,
        payload: SponsorshipPayload::decode(&fields.data)?,
    }))
}

pub const POST_OP_PROCESSED_EVENT: &str =
    "PostOpProcessed(address,address,uint256,uint256,uint256)";

/// What the sponsor charged for an operation, from its `PostOpProcessed` event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SponsorFee {
    pub actual_gas_cost_wei: U256,
    pub token_cost: U256,
}

pub fn post_op_processed_topic() -> H256 {
    H256::from(keccak256(POST_OP_PROCESSED_EVENT.as_bytes()))
}

pub fn sponsor_fee_from_logs(logs: &[Log], paymaster: Address) -> Option<SponsorFee> {
    let topic = post_op_processed_topic();
    logs.iter()
        .filter(|l| l.address == paymaster && l.topics.first() == Some(&topic))
        .find(|l| l.data.len() >= 96)
        .map(|l| SponsorFee {
            actual_gas_cost_wei: decode_uint(&l.data[..32]),
            token_cost: decode_uint(&l.data[32..64]),
        })
}
