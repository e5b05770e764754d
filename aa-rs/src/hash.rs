use ethers::abi::{encode, Token};
use ethers::types::{Address, H256, U256};
use ethers::utils::keccak256;

use crate::types::PackedUserOperation;

/// Hash of the operation fields, without the entry point / chain binding.
fn inner_hash(op: &PackedUserOperation) -> [u8; 32] {
    let encoded = encode(&[
        Token::Address(op.sender),
        Token::Uint(op.nonce),
        Token::FixedBytes(keccak256(&op.init_code).to_vec()),
        Token::FixedBytes(keccak256(&op.call_data).to_vec()),
        Token::FixedBytes(op.account_gas_limits.to_vec()),
        Token::Uint(op.pre_verification_gas),
        Token::FixedBytes(op.gas_fees.to_vec()),
        Token::FixedBytes(keccak256(&op.paymaster_and_data).to_vec()),
    ]);
    keccak256(encoded)
}

/// Canonical `userOpHash` as computed by `EntryPoint.getUserOpHash` (v0.7).
///
/// The signature is not part of the hash; every other field is.
pub fn user_operation_hash(op: &PackedUserOperation, entry_point: Address, chain_id: u64) -> H256 {
    let encoded = encode(&[
        Token::FixedBytes(inner_hash(op).to_vec()),
        Token::Address(entry_point),
        Token::Uint(U256::from(chain_id)),
    ]);
    H256::from(keccak256(encoded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::Bytes;

    const EP: &str = "0x0000000071727De22E5E9d8BAf0edAc6f37da032";

    fn entry_point() -> Address {
        EP.parse().unwrap()
    }

    fn sample() -> PackedUserOperation {
        PackedUserOperation {
            sender: Address::repeat_byte(0x11),
            nonce: U256::from(3),
            init_code: Bytes::new(),
            call_data: Bytes::from(vec![0xb6, 0x1d, 0x27, 0xf6]),
            account_gas_limits: [0x01; 32],
            pre_verification_gas: U256::from(50_000u64),
            gas_fees: [0x02; 32],
            paymaster_and_data: Bytes::from(vec![0x33; 84]),
            signature: Bytes::new(),
        }
    }

    #[test]
    fn matches_entry_point_get_user_op_hash() {
        let op = crate::types::UserOperation {
            sender: Address::repeat_byte(0x11),
            nonce: U256::zero(),
            call_data: Bytes::from(vec![0xb6, 0x1d, 0x27, 0xf6]),
            verification_gas_limit: U256::from(100_000u64),
            call_gas_limit: U256::from(200_000u64),
            pre_verification_gas: U256::from(50_000u64),
            max_priority_fee_per_gas: U256::from(1_000_000_000u64),
            max_fee_per_gas: U256::from(2_000_000_000u64),
            signature: Bytes::from(vec![0xff; 65]),
            ..Default::default()
        };
        let packed = op.pack().unwrap();
        assert_eq!(
            hex::encode(packed.account_gas_limits),
            "000000000000000000000000000186a000000000000000000000000000030d40"
        );
        assert_eq!(
            hex::encode(packed.gas_fees),
            "0000000000000000000000003b9aca0000000000000000000000000077359400"
        );
        assert_eq!(
            hex::encode(user_operation_hash(&packed, entry_point(), 11155111)),
            "9e90243e8b15729b5cd8043f84f77354327ad5fd87aa0fa8dc2a61af94ed95ae"
        );
    }

    #[test]
    fn hash_is_deterministic() {
        let a = user_operation_hash(&sample(), entry_point(), 11155111);
        let b = user_operation_hash(&sample(), entry_point(), 11155111);
        assert_eq!(a, b);
    }

    #[test]
    fn hash_ignores_signature() {
        let mut signed = sample();
        signed.signature = Bytes::from(vec![0xff; 65]);
        assert_eq!(
            user_operation_hash(&sample(), entry_point(), 1),
            user_operation_hash(&signed, entry_point(), 1)
        );
    }

    #[test]
    fn every_hashed_field_changes_the_hash() {
        let base = user_operation_hash(&sample(), entry_point(), 1);
        let mutations: Vec<Box<dyn Fn(&mut PackedUserOperation)>> = vec![
            Box::new(|op| op.sender = Address::repeat_byte(0x12)),
            Box::new(|op| op.nonce = U256::from(4)),
            Box::new(|op| op.init_code = Bytes::from(vec![0x01; 20])),
            Box::new(|op| op.call_data = Bytes::from(vec![0xb6])),
            Box::new(|op| op.account_gas_limits[31] ^= 1),
            Box::new(|op| op.pre_verification_gas = U256::from(50_001u64)),
            Box::new(|op| op.gas_fees[0] ^= 1),
            Box::new(|op| op.paymaster_and_data = Bytes::from(vec![0x33; 72])),
        ];
        for (i, mutate) in mutations.iter().enumerate() {
            let mut op = sample();
            mutate(&mut op);
            assert_ne!(
                user_operation_hash(&op, entry_point(), 1),
                base,
                "mutation {i} did not change the hash"
            );
        }
    }

    #[test]
    fn hash_is_bound_to_entry_point_and_chain() {
        let base = user_operation_hash(&sample(), entry_point(), 1);
        assert_ne!(user_operation_hash(&sample(), entry_point(), 10), base);
        assert_ne!(
            user_operation_hash(&sample(), Address::repeat_byte(0x01), 1),
            base
        );
    }

    #[test]
    fn outer_hash_wraps_inner_hash() {
        let op = sample();
        let mut manual = Vec::with_capacity(96);
        manual.extend_from_slice(&inner_hash(&op));
        manual.extend_from_slice(&[0u8; 12]);
        manual.extend_from_slice(entry_point().as_bytes());
        let mut chain = [0u8; 32];
        U256::from(1u64).to_big_endian(&mut chain);
        manual.extend_from_slice(&chain);
        assert_eq!(
            user_operation_hash(&op, entry_point(), 1),
            H256::from(keccak256(manual))
        );
    }
}
