use ethers::types::{Address, Bytes, U256};

use crate::codec;
use crate::error::CodecError;

/// ERC-4337 PackedUserOperation (EntryPoint v0.7 layout).
///
/// This is the form the EntryPoint hashes and executes. Gas limits and fees are packed two
/// per 32-byte word, paymaster limits live inside `paymaster_and_data`.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct PackedUserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    /// `verificationGasLimit (16) || callGasLimit (16)`
    pub account_gas_limits: [u8; 32],
    pub pre_verification_gas: U256,
    /// `maxPriorityFeePerGas (16) || maxFeePerGas (16)`
    pub gas_fees: [u8; 32],
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

/// Unpacked projection used on the relay JSON-RPC surface.
///
/// `factory` and `paymaster` are absent rather than zero when unused.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub factory: Option<Address>,
    pub factory_data: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster: Option<Address>,
    pub paymaster_verification_gas_limit: U256,
    pub paymaster_post_op_gas_limit: U256,
    pub paymaster_data: Bytes,
    pub signature: Bytes,
}

impl UserOperation {
    pub fn pack(&self) -> Result<PackedUserOperation, CodecError> {
        codec::pack(self)
    }
}

impl PackedUserOperation {
    pub fn unpack(&self) -> Result<UserOperation, CodecError> {
        codec::unpack(self)
    }
}

/// An operation in either representation. Conversions validate shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Packed(PackedUserOperation),
    Unpacked(UserOperation),
}

impl Operation {
    pub fn into_packed(self) -> Result<PackedUserOperation, CodecError> {
        match self {
            Operation::Packed(p) => {
                // Re-derive to reject truncated sub-fields carried in from outside.
                codec::unpack(&p)?;
                Ok(p)
            }
            Operation::Unpacked(u) => codec::pack(&u),
        }
    }

    pub fn into_unpacked(self) -> Result<UserOperation, CodecError> {
        match self {
            Operation::Packed(p) => codec::unpack(&p),
            Operation::Unpacked(u) => {
                codec::pack(&u)?;
                Ok(u)
            }
        }
    }
}

impl From<PackedUserOperation> for Operation {
    fn from(p: PackedUserOperation) -> Self {
        Operation::Packed(p)
    }
}

impl From<UserOperation> for Operation {
    fn from(u: UserOperation) -> Self {
        Operation::Unpacked(u)
    }
}

/// Raw limits as reported by `eth_estimateUserOperationGas` (or the fallback table).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct GasEstimate {
    pub pre_verification_gas: U256,
    pub verification_gas_limit: U256,
    pub call_gas_limit: U256,
    pub paymaster_verification_gas_limit: U256,
    pub paymaster_post_op_gas_limit: U256,
}

/// Limits after efficiency-floor tuning; these go into the submitted operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct TunedLimits {
    pub pre_verification_gas: U256,
    pub verification_gas_limit: U256,
    pub call_gas_limit: U256,
    pub paymaster_verification_gas_limit: U256,
    pub paymaster_post_op_gas_limit: U256,
}

impl TunedLimits {
    pub fn apply_to(&self, op: &mut UserOperation) {
        op.pre_verification_gas = self.pre_verification_gas;
        op.verification_gas_limit = self.verification_gas_limit;
        op.call_gas_limit = self.call_gas_limit;
        if op.paymaster.is_some() {
            op.paymaster_verification_gas_limit = self.paymaster_verification_gas_limit;
            op.paymaster_post_op_gas_limit = self.paymaster_post_op_gas_limit;
        }
    }
}
