//! JSON boundary for the relay surface: quantities are `0x` hex, absent optionals are omitted.

use ethers::types::{Address, Bytes, H256, U256};
use serde_json::{Map, Value};

use crate::codec::{decode_address, decode_fixed, decode_hex};
use crate::error::CodecError;
use crate::types::{PackedUserOperation, UserOperation};

pub fn fmt_address(addr: Address) -> String {
    format!("0x{}", hex::encode(addr.as_bytes()))
}

pub fn fmt_h256(h: H256) -> String {
    format!("0x{}", hex::encode(h.as_bytes()))
}

/// JSON-RPC "quantity" encoding.
pub fn fmt_u256(v: U256) -> String {
    if v.is_zero() {
        "0x0".to_string()
    } else {
        format!("0x{:x}", v)
    }
}

pub fn fmt_bytes(b: &[u8]) -> String {
    format!("0x{}", hex::encode(b))
}

/// Unpacked v0.7 operation as `eth_sendUserOperation` / `eth_estimateUserOperationGas` expect it.
pub fn user_op_to_json(op: &UserOperation) -> Value {
    let mut m = Map::new();
    m.insert("sender".into(), fmt_address(op.sender).into());
    m.insert("nonce".into(), fmt_u256(op.nonce).into());
    if let Some(factory) = op.factory {
        m.insert("factory".into(), fmt_address(factory).into());
        m.insert("factoryData".into(), fmt_bytes(&op.factory_data).into());
    }
    m.insert("callData".into(), fmt_bytes(&op.call_data).into());
    m.insert("callGasLimit".into(), fmt_u256(op.call_gas_limit).into());
    m.insert(
        "verificationGasLimit".into(),
        fmt_u256(op.verification_gas_limit).into(),
    );
    m.insert(
        "preVerificationGas".into(),
        fmt_u256(op.pre_verification_gas).into(),
    );
    m.insert("maxFeePerGas".into(), fmt_u256(op.max_fee_per_gas).into());
    m.insert(
        "maxPriorityFeePerGas".into(),
        fmt_u256(op.max_priority_fee_per_gas).into(),
    );
    if let Some(pm) = op.paymaster {
        m.insert("paymaster".into(), fmt_address(pm).into());
        m.insert(
            "paymasterVerificationGasLimit".into(),
            fmt_u256(op.paymaster_verification_gas_limit).into(),
        );
        m.insert(
            "paymasterPostOpGasLimit".into(),
            fmt_u256(op.paymaster_post_op_gas_limit).into(),
        );
        m.insert("paymasterData".into(), fmt_bytes(&op.paymaster_data).into());
    }
    m.insert("signature".into(), fmt_bytes(&op.signature).into());
    Value::Object(m)
}

pub fn packed_op_to_json(op: &PackedUserOperation) -> Value {
    serde_json::json!({
        "sender": fmt_address(op.sender),
        "nonce": fmt_u256(op.nonce),
        "initCode": fmt_bytes(&op.init_code),
        "callData": fmt_bytes(&op.call_data),
        "accountGasLimits": fmt_bytes(&op.account_gas_limits),
        "preVerificationGas": fmt_u256(op.pre_verification_gas),
        "gasFees": fmt_bytes(&op.gas_fees),
        "paymasterAndData": fmt_bytes(&op.paymaster_and_data),
        "signature": fmt_bytes(&op.signature),
    })
}

fn str_field<'a>(v: &'a Value, field: &'static str) -> Result<Option<&'a str>, CodecError> {
    match v.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(CodecError::InvalidHex {
            field,
            reason: format!("expected hex string, got {other}"),
        }),
    }
}

fn req_str<'a>(v: &'a Value, field: &'static str) -> Result<&'a str, CodecError> {
    str_field(v, field)?.ok_or(CodecError::InvalidHex {
        field,
        reason: "missing".into(),
    })
}

fn quantity(v: &Value, field: &'static str) -> Result<U256, CodecError> {
    match v.get(field) {
        None | Some(Value::Null) => Ok(U256::zero()),
        Some(q) => parse_quantity_value(field, q),
    }
}

fn bytes_field(v: &Value, field: &'static str) -> Result<Bytes, CodecError> {
    Ok(match str_field(v, field)? {
        Some(s) => decode_hex(field, s)?.into(),
        None => Bytes::new(),
    })
}

/// Accepts a `0x` hex quantity, a decimal string, or a JSON integer.
pub fn parse_quantity_value(field: &'static str, v: &Value) -> Result<U256, CodecError> {
    match v {
        Value::String(s) => parse_u256_quantity(field, s),
        Value::Number(n) => n.as_u64().map(U256::from).ok_or(CodecError::InvalidHex {
            field,
            reason: format!("not an unsigned integer: {n}"),
        }),
        other => Err(CodecError::InvalidHex {
            field,
            reason: format!("expected quantity, got {other}"),
        }),
    }
}

pub fn parse_u256_quantity(field: &'static str, s: &str) -> Result<U256, CodecError> {
    let s = s.trim();
    if let Some(h) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        if h.is_empty() {
            return Ok(U256::zero());
        }
        return U256::from_str_radix(h, 16).map_err(|e| CodecError::InvalidHex {
            field,
            reason: e.to_string(),
        });
    }
    U256::from_dec_str(s).map_err(|e| CodecError::InvalidHex {
        field,
        reason: format!("{e:?}"),
    })
}

pub fn parse_h256(field: &'static str, s: &str) -> Result<H256, CodecError> {
    decode_fixed::<32>(field, s).map(H256::from)
}

/// Reads an operation file in either the packed or the unpacked JSON shape.
///
/// The presence of `accountGasLimits` selects the packed shape.
pub fn operation_from_json(v: &Value) -> Result<crate::types::Operation, CodecError> {
    if v.get("accountGasLimits").is_some() {
        return packed_op_from_json(v).map(crate::types::Operation::Packed);
    }
    user_op_from_json(v).map(crate::types::Operation::Unpacked)
}

pub fn packed_op_from_json(v: &Value) -> Result<PackedUserOperation, CodecError> {
    Ok(PackedUserOperation {
        sender: decode_address("sender", req_str(v, "sender")?)?,
        nonce: quantity(v, "nonce")?,
        init_code: bytes_field(v, "initCode")?,
        call_data: bytes_field(v, "callData")?,
        account_gas_limits: decode_fixed::<32>(
            "accountGasLimits",
            req_str(v, "accountGasLimits")?,
        )?,
        pre_verification_gas: quantity(v, "preVerificationGas")?,
        gas_fees: decode_fixed::<32>("gasFees", req_str(v, "gasFees")?)?,
        paymaster_and_data: bytes_field(v, "paymasterAndData")?,
        signature: bytes_field(v, "signature")?,
    })
}

pub fn user_op_from_json(v: &Value) -> Result<UserOperation, CodecError> {
    let factory = str_field(v, "factory")?
        .map(|s| decode_address("factory", s))
        .transpose()?;
    let paymaster = str_field(v, "paymaster")?
        .map(|s| decode_address("paymaster", s))
        .transpose()?;
    Ok(UserOperation {
        sender: decode_address("sender", req_str(v, "sender")?)?,
        nonce: quantity(v, "nonce")?,
        factory,
        factory_data: bytes_field(v, "factoryData")?,
        call_data: bytes_field(v, "callData")?,
        call_gas_limit: quantity(v, "callGasLimit")?,
        verification_gas_limit: quantity(v, "verificationGasLimit")?,
        pre_verification_gas: quantity(v, "preVerificationGas")?,
        max_fee_per_gas: quantity(v, "maxFeePerGas")?,
        max_priority_fee_per_gas: quantity(v, "maxPriorityFeePerGas")?,
        paymaster,
        paymaster_verification_gas_limit: quantity(v, "paymasterVerificationGasLimit")?,
        paymaster_post_op_gas_limit: quantity(v, "paymasterPostOpGasLimit")?,
        paymaster_data: bytes_field(v, "paymasterData")?,
        signature: bytes_field(v, "signature")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op() -> UserOperation {
        UserOperation {
            sender: Address::repeat_byte(0x11),
            nonce: U256::from(1),
            call_data: Bytes::from(vec![0xab]),
            call_gas_limit: U256::from(0x10),
            max_fee_per_gas: U256::from(255),
            ..Default::default()
        }
    }

    #[test]
    fn absent_factory_and_paymaster_are_omitted() {
        let v = user_op_to_json(&op());
        assert!(v.get("factory").is_none());
        assert!(v.get("factoryData").is_none());
        assert!(v.get("paymaster").is_none());
        assert!(v.get("paymasterData").is_none());
        assert_eq!(v["callGasLimit"], "0x10");
        assert_eq!(v["maxFeePerGas"], "0xff");
        assert_eq!(v["preVerificationGas"], "0x0");
        assert_eq!(v["signature"], "0x");
    }

    #[test]
    fn present_paymaster_emits_all_paymaster_fields() {
        let mut o = op();
        o.paymaster = Some(Address::repeat_byte(0x99));
        o.paymaster_verification_gas_limit = U256::from(80_000u64);
        o.paymaster_data = Bytes::from(vec![0x01, 0x02]);
        let v = user_op_to_json(&o);
        assert_eq!(v["paymasterVerificationGasLimit"], "0x13880");
        assert_eq!(v["paymasterPostOpGasLimit"], "0x0");
        assert_eq!(v["paymasterData"], "0x0102");
        assert_eq!(user_op_from_json(&v).unwrap(), o);
    }

    #[test]
    fn quantities_accept_hex_decimal_and_numbers() {
        assert_eq!(parse_u256_quantity("q", "0x").unwrap(), U256::zero());
        assert_eq!(parse_u256_quantity("q", "0x1f").unwrap(), U256::from(31));
        assert_eq!(parse_u256_quantity("q", "1500").unwrap(), U256::from(1500));
        assert_eq!(
            parse_quantity_value("q", &json!(42)).unwrap(),
            U256::from(42)
        );
        assert!(parse_u256_quantity("q", "12a").is_err());
        assert!(parse_quantity_value("q", &json!(true)).is_err());
    }

    #[test]
    fn packed_json_with_odd_hex_is_a_codec_error() {
        let v = json!({
            "sender": "0x1111111111111111111111111111111111111111",
            "nonce": "0x0",
            "callData": "0xabc",
            "accountGasLimits": format!("0x{}", "00".repeat(32)),
            "gasFees": format!("0x{}", "00".repeat(32)),
        });
        assert!(matches!(
            packed_op_from_json(&v),
            Err(CodecError::InvalidHex {
                field: "callData",
                ..
            })
        ));
    }

    #[test]
    fn operation_shape_is_detected() {
        let packed = op().pack().unwrap();
        let v = packed_op_to_json(&packed);
        match operation_from_json(&v).unwrap() {
            crate::types::Operation::Packed(p) => assert_eq!(p, packed),
            other => panic!("unexpected: {other:?}"),
        }
        let v = user_op_to_json(&op());
        assert!(matches!(
            operation_from_json(&v).unwrap(),
            crate::types::Operation::Unpacked(_)
        ));
    }

    #[test]
    fn parse_h256_requires_32_bytes() {
        assert!(parse_h256("hash", "0x1234").is_err());
        let h = parse_h256("hash", &format!("0x{}", "ab".repeat(32))).unwrap();
        assert_eq!(h, H256::repeat_byte(0xab));
    }
}
