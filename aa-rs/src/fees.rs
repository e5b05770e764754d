use async_trait::async_trait;
use ethers::types::U256;

use crate::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeeQuote {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

/// Source of the network's current EIP-1559 fees.
#[async_trait]
pub trait FeeOracle: Send + Sync {
    async fn eip1559_fees(&self) -> Result<FeeQuote, Error>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeePolicy {
    /// Safety multiplier applied to both fields, in bps (15_000 = x1.5).
    pub multiplier_bps: u64,
    /// Some networks refuse priority fees below a fixed amount.
    pub min_priority_fee: Option<U256>,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            multiplier_bps: 15_000,
            min_priority_fee: None,
        }
    }
}

impl FeePolicy {
    pub fn apply(&self, raw: FeeQuote) -> FeeQuote {
        let scale = |v: U256| v.saturating_mul(U256::from(self.multiplier_bps)) / 10_000;
        let mut priority = scale(raw.max_priority_fee_per_gas);
        if let Some(min) = self.min_priority_fee {
            priority = priority.max(min);
        }
        FeeQuote {
            max_fee_per_gas: scale(raw.max_fee_per_gas).max(priority),
            max_priority_fee_per_gas: priority,
        }
    }
}

pub async fn quote_fees(oracle: &dyn FeeOracle, policy: &FeePolicy) -> Result<FeeQuote, Error> {
    let raw = oracle.eip1559_fees().await?;
    let quote = policy.apply(raw);
    tracing::debug!(
        raw_max_fee = %raw.max_fee_per_gas,
        raw_priority = %raw.max_priority_fee_per_gas,
        max_fee = %quote.max_fee_per_gas,
        priority = %quote.max_priority_fee_per_gas,
        "fee quote"
    );
    Ok(quote)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GWEI: u64 = 1_000_000_000;

    fn gwei(n: u64) -> U256 {
        U256::from(n * GWEI)
    }

    #[test]
    fn multiplier_scales_both_fields() {
        let q = FeePolicy::default().apply(FeeQuote {
            max_fee_per_gas: gwei(20),
            max_priority_fee_per_gas: gwei(2),
        });
        assert_eq!(q.max_fee_per_gas, gwei(30));
        assert_eq!(q.max_priority_fee_per_gas, gwei(3));
    }

    #[test]
    fn priority_floor_keeps_max_fee_above_priority() {
        let policy = FeePolicy {
            multiplier_bps: 10_000,
            min_priority_fee: Some(U256::from(GWEI / 2)),
        };
        let q = policy.apply(FeeQuote {
            max_fee_per_gas: U256::from(100u64),
            max_priority_fee_per_gas: U256::from(1u64),
        });
        assert_eq!(q.max_priority_fee_per_gas, U256::from(GWEI / 2));
        assert!(q.max_fee_per_gas >= q.max_priority_fee_per_gas);
    }

    struct Fixed(FeeQuote);

    #[async_trait]
    impl FeeOracle for Fixed {
        async fn eip1559_fees(&self) -> Result<FeeQuote, Error> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn quote_applies_policy() {
        let oracle = Fixed(FeeQuote {
            max_fee_per_gas: gwei(10),
            max_priority_fee_per_gas: gwei(1),
        });
        let q = quote_fees(&oracle, &FeePolicy::default()).await.unwrap();
        assert_eq!(q.max_fee_per_gas, gwei(15));
    }
}
