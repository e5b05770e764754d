//! Packed <-> unpacked conversion for EntryPoint v0.7 operations, plus the hex helpers used at
//! every byte boundary.

use ethers::types::{Address, Bytes, U256};

use crate::error::CodecError;
use crate::types::{PackedUserOperation, UserOperation};

pub const ADDRESS_LEN: usize = 20;
pub const GAS_FIELD_LEN: usize = 16;
/// `paymaster (20) || verificationGas (16) || postOpGas (16)`
pub const PAYMASTER_HEADER_LEN: usize = ADDRESS_LEN + 2 * GAS_FIELD_LEN;

/// Big-endian encoding of `value` into exactly `width` bytes.
pub fn encode_uint(field: &'static str, value: U256, width: usize) -> Result<Vec<u8>, CodecError> {
    if value.bits() > width * 8 {
        return Err(CodecError::FieldOverflow {
            field,
            width,
            value,
        });
    }
    let mut word = [0u8; 32];
    value.to_big_endian(&mut word);
    Ok(word[32 - width..].to_vec())
}

pub fn decode_uint(bytes: &[u8]) -> U256 {
    U256::from_big_endian(bytes)
}

fn encode_u128(field: &'static str, value: U256) -> Result<[u8; 16], CodecError> {
    let v = encode_uint(field, value, GAS_FIELD_LEN)?;
    let mut out = [0u8; 16];
    out.copy_from_slice(&v);
    Ok(out)
}

fn join_u128(hi: [u8; 16], lo: [u8; 16]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[..16].copy_from_slice(&hi);
    out[16..].copy_from_slice(&lo);
    out
}

/// Splits a packed word into its `(high, low)` 128-bit halves.
pub fn split_u128_pair(word: &[u8; 32]) -> (U256, U256) {
    (decode_uint(&word[..16]), decode_uint(&word[16..]))
}

pub fn pack_account_gas_limits(
    verification_gas_limit: U256,
    call_gas_limit: U256,
) -> Result<[u8; 32], CodecError> {
    Ok(join_u128(
        encode_u128("verificationGasLimit", verification_gas_limit)?,
        encode_u128("callGasLimit", call_gas_limit)?,
    ))
}

pub fn pack_gas_fees(
    max_priority_fee_per_gas: U256,
    max_fee_per_gas: U256,
) -> Result<[u8; 32], CodecError> {
    Ok(join_u128(
        encode_u128("maxPriorityFeePerGas", max_priority_fee_per_gas)?,
        encode_u128("maxFeePerGas", max_fee_per_gas)?,
    ))
}

pub fn pack_init_code(factory: Option<Address>, factory_data: &Bytes) -> Result<Bytes, CodecError> {
    match factory {
        None if !factory_data.is_empty() => {
            Err(CodecError::Inconsistent("factoryData set without factory"))
        }
        None => Ok(Bytes::new()),
        Some(f) => {
            let mut out = Vec::with_capacity(ADDRESS_LEN + factory_data.len());
            out.extend_from_slice(f.as_bytes());
            out.extend_from_slice(factory_data);
            Ok(out.into())
        }
    }
}

pub fn pack_paymaster_and_data(
    paymaster: Address,
    verification_gas_limit: U256,
    post_op_gas_limit: U256,
    paymaster_data: &[u8],
) -> Result<Bytes, CodecError> {
    let mut out = Vec::with_capacity(PAYMASTER_HEADER_LEN + paymaster_data.len());
    out.extend_from_slice(paymaster.as_bytes());
    out.extend_from_slice(&encode_u128(
        "paymasterVerificationGasLimit",
        verification_gas_limit,
    )?);
    out.extend_from_slice(&encode_u128("paymasterPostOpGasLimit", post_op_gas_limit)?);
    out.extend_from_slice(paymaster_data);
    Ok(out.into())
}

/// `(factory, factoryData)`; `None` when `initCode` is empty.
pub fn split_init_code(init_code: &[u8]) -> Result<Option<(Address, Bytes)>, CodecError> {
    match init_code.len() {
        0 => Ok(None),
        n if n < ADDRESS_LEN => Err(CodecError::Truncated {
            field: "initCode",
            min: ADDRESS_LEN,
            actual: n,
        }),
        _ => Ok(Some((
            Address::from_slice(&init_code[..ADDRESS_LEN]),
            Bytes::from(init_code[ADDRESS_LEN..].to_vec()),
        ))),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymasterFields {
    pub paymaster: Address,
    pub verification_gas_limit: U256,
    pub post_op_gas_limit: U256,
    pub data: Bytes,
}

pub fn split_paymaster_and_data(pm: &[u8]) -> Result<Option<PaymasterFields>, CodecError> {
    match pm.len() {
        0 => Ok(None),
        n if n < PAYMASTER_HEADER_LEN => Err(CodecError::Truncated {
            field: "paymasterAndData",
            min: PAYMASTER_HEADER_LEN,
            actual: n,
        }),
        _ => Ok(Some(PaymasterFields {
            paymaster: Address::from_slice(&pm[..20]),
            verification_gas_limit: decode_uint(&pm[20..36]),
            post_op_gas_limit: decode_uint(&pm[36..52]),
            data: Bytes::from(pm[52..].to_vec()),
        })),
    }
}

pub fn pack(op: &UserOperation) -> Result<PackedUserOperation, CodecError> {
    let paymaster_and_data = match op.paymaster {
        Some(pm) => pack_paymaster_and_data(
            pm,
            op.paymaster_verification_gas_limit,
            op.paymaster_post_op_gas_limit,
            &op.paymaster_data,
        )?,
        None => {
            if !op.paymaster_verification_gas_limit.is_zero()
                || !op.paymaster_post_op_gas_limit.is_zero()
                || !op.paymaster_data.is_empty()
            {
                return Err(CodecError::Inconsistent(
                    "paymaster limits or data set without paymaster",
                ));
            }
            Bytes::new()
        }
    };

    Ok(PackedUserOperation {
        sender: op.sender,
        nonce: op.nonce,
        init_code: pack_init_code(op.factory, &op.factory_data)?,
        call_data: op.call_data.clone(),
        account_gas_limits: pack_account_gas_limits(op.verification_gas_limit, op.call_gas_limit)?,
        pre_verification_gas: op.pre_verification_gas,
        gas_fees: pack_gas_fees(op.max_priority_fee_per_gas, op.max_fee_per_gas)?,
        paymaster_and_data,
        signature: op.signature.clone(),
    })
}

pub fn unpack(op: &PackedUserOperation) -> Result<UserOperation, CodecError> {
    let (verification_gas_limit, call_gas_limit) = split_u128_pair(&op.account_gas_limits);
    let (max_priority_fee_per_gas, max_fee_per_gas) = split_u128_pair(&op.gas_fees);

    let (factory, factory_data) = match split_init_code(&op.init_code)? {
        Some((f, d)) => (Some(f), d),
        None => (None, Bytes::new()),
    };

    let mut out = UserOperation {
        sender: op.sender,
        nonce: op.nonce,
        factory,
        factory_data,
        call_data: op.call_data.clone(),
        call_gas_limit,
        verification_gas_limit,
        pre_verification_gas: op.pre_verification_gas,
        max_fee_per_gas,
        max_priority_fee_per_gas,
        signature: op.signature.clone(),
        ..Default::default()
    };

    if let Some(pm) = split_paymaster_and_data(&op.paymaster_and_data)? {
        out.paymaster = Some(pm.paymaster);
        out.paymaster_verification_gas_limit = pm.verification_gas_limit;
        out.paymaster_post_op_gas_limit = pm.post_op_gas_limit;
        out.paymaster_data = pm.data;
    }

    Ok(out)
}

/// Decodes `0x`-prefixed (or bare) hex. Rejects odd length and non-hex characters.
pub fn decode_hex(field: &'static str, s: &str) -> Result<Vec<u8>, CodecError> {
    let s = s.trim();
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    if s.len() % 2 != 0 {
        return Err(CodecError::InvalidHex {
            field,
            reason: format!("odd number of digits ({})", s.len()),
        });
    }
    hex::decode(s).map_err(|e| CodecError::InvalidHex {
        field,
        reason: e.to_string(),
    })
}

pub fn decode_fixed<const N: usize>(field: &'static str, s: &str) -> Result<[u8; N], CodecError> {
    let bytes = decode_hex(field, s)?;
    if bytes.len() != N {
        return Err(CodecError::WrongLength {
            field,
            expected: N,
            actual: bytes.len(),
        });
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    Ok(out)
}

pub fn decode_address(field: &'static str, s: &str) -> Result<Address, CodecError> {
    decode_fixed::<20>(field, s).map(Address::from)
}
