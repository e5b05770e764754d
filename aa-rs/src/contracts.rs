use ethers::abi::AbiEncode;
use ethers::contract::abigen;
use ethers::types::{Address, Bytes, U256};

use crate::types;

// EntryPoint v0.7. The uint112/uint48 members of DepositInfo are declared uint256 (same
// 32-byte words on the wire).
abigen!(
    EntryPoint,
    r#"[
        struct PackedUserOperation { address sender; uint256 nonce; bytes initCode; bytes callData; bytes32 accountGasLimits; uint256 preVerificationGas; bytes32 gasFees; bytes paymasterAndData; bytes signature; }
        function getNonce(address sender, uint192 key) view returns (uint256 nonce)
        function getDepositInfo(address account) view returns (uint256 deposit, bool staked, uint256 stake, uint32 unstakeDelaySec, uint256 withdrawTime)
        function handleOps(PackedUserOperation[] ops, address beneficiary)
    ]"#
);

// Union of the token paymaster and the credit sponsor surfaces. Only the leading words of
// `cachedPrice` and `operators` are declared; both contracts agree on them.
abigen!(
    Sponsor,
    r#"[
        function cachedPrice() view returns (uint256 price, uint256 updatedAt)
        function priceStalenessThreshold() view returns (uint256)
        function updatePrice()
        function tokenPrices(address token) view returns (uint256)
        function balances(address user, address token) view returns (uint256)
        function operators(address operator) view returns (address token, address treasury, bool isConfigured, bool isPaused, uint256 exchangeRate)
        function getAvailableCredit(address user, address token) view returns (uint256)
        function addStake(uint32 unstakeDelaySec) payable
        function addDeposit() payable
        function addGasToken(address token)
        function setTokenPrice(address token, uint256 price)
    ]"#
);

abigen!(
    Erc20,
    r#"[
        function balanceOf(address owner) view returns (uint256)
        function transfer(address to, uint256 amount) returns (bool)
    ]"#
);

abigen!(
    SimpleAccount,
    r#"[
        function execute(address dest, uint256 value, bytes func)
    ]"#
);

impl From<&types::PackedUserOperation> for PackedUserOperation {
    fn from(op: &types::PackedUserOperation) -> Self {
        Self {
            sender: op.sender,
            nonce: op.nonce,
            init_code: op.init_code.clone(),
            call_data: op.call_data.clone(),
            account_gas_limits: op.account_gas_limits,
            pre_verification_gas: op.pre_verification_gas,
            gas_fees: op.gas_fees,
            paymaster_and_data: op.paymaster_and_data.clone(),
            signature: op.signature.clone(),
        }
    }
}

/// `SimpleAccount.execute(dest, value, func)` call data.
pub fn execute_call_data(dest: Address, value: U256, func: Bytes) -> Bytes {
    ExecuteCall { dest, value, func }.encode().into()
}

/// `ERC20.transfer(to, amount)` call data.
pub fn transfer_call_data(to: Address, amount: U256) -> Bytes {
    TransferCall { to, amount }.encode().into()
}
