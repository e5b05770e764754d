//! ethers-backed implementations of the on-chain seams used by the pipeline.

use anyhow::anyhow;
use async_trait::async_trait;
use ethers::abi::Detokenize;
use ethers::contract::ContractCall;
use ethers::providers::Middleware;
use ethers::types::{Address, H256, U256, U64};
use std::sync::Arc;
use std::time::Duration;

use crate::contracts::{self, EntryPoint, Erc20, Sponsor};
use crate::error::Error;
use crate::fees::{FeeOracle, FeeQuote};
use crate::gas::{PriceQuote, PriceQuoteSource};
use crate::readiness::{DepositInfo, OperatorConfig, SponsorChain};
use crate::submit::{DirectSubmitter, NonceSource};
use crate::types::PackedUserOperation;

/// One provider plus the entry point and sponsor it talks to.
#[derive(Clone, Debug)]
pub struct ChainClient<M> {
    client: Arc<M>,
    entry_point: Address,
    paymaster: Address,
    /// Receives the refund of directly submitted `handleOps` bundles.
    beneficiary: Address,
    tx_timeout: Duration,
    /// Used when the sponsor does not expose `priceStalenessThreshold`.
    default_staleness_secs: u64,
}

impl<M: Middleware + 'static> ChainClient<M> {
    pub fn new(client: Arc<M>, entry_point: Address, paymaster: Address, beneficiary: Address) -> Self {
        Self {
            client,
            entry_point,
            paymaster,
            beneficiary,
            tx_timeout: Duration::from_secs(120),
            default_staleness_secs: 3600,
        }
    }

    pub fn with_tx_timeout(mut self, timeout: Duration) -> Self {
        self.tx_timeout = timeout;
        self
    }

    pub fn with_default_staleness(mut self, secs: u64) -> Self {
        self.default_staleness_secs = secs;
        self
    }

    fn entry_point_contract(&self) -> EntryPoint<M> {
        EntryPoint::new(self.entry_point, self.client.clone())
    }

    fn sponsor_contract(&self) -> Sponsor<M> {
        Sponsor::new(self.paymaster, self.client.clone())
    }
}

fn saturating_u64(v: U256) -> u64 {
    if v > U256::from(u64::MAX) {
        u64::MAX
    } else {
        v.as_u64()
    }
}

/// Sends `call` and waits for a successful receipt.
async fn confirm<M, D>(
    call: ContractCall<M, D>,
    context: &'static str,
    timeout: Duration,
) -> Result<H256, Error>
where
    M: Middleware + 'static,
    D: Detokenize + Send + Sync,
{
    let pending = call.send().await.map_err(Error::chain(context))?;
    let tx_hash = pending.tx_hash();
    tracing::info!(tx = ?tx_hash, "{context} sent");

    let receipt = tokio::time::timeout(timeout, pending)
        .await
        .map_err(|_| Error::Chain {
            context,
            source: anyhow!("no receipt for {tx_hash:?} after {}s", timeout.as_secs()),
        })?
        .map_err(Error::chain(context))?
        .ok_or_else(|| Error::Chain {
            context,
            source: anyhow!("transaction {tx_hash:?} dropped from mempool"),
        })?;

    if receipt.status != Some(U64::from(1)) {
        return Err(Error::Chain {
            context,
            source: anyhow!("transaction {tx_hash:?} mined but reverted"),
        });
    }
    Ok(tx_hash)
}

#[async_trait]
impl<M: Middleware + 'static> NonceSource for ChainClient<M> {
    async fn nonce(&self, sender: Address, key: U256) -> Result<U256, Error> {
        self.entry_point_contract()
            .get_nonce(sender, key)
            .call()
            .await
            .map_err(Error::chain("EntryPoint.getNonce"))
    }
}

#[async_trait]
impl<M: Middleware + 'static> FeeOracle for ChainClient<M> {
    async fn eip1559_fees(&self) -> Result<FeeQuote, Error> {
        let (max_fee_per_gas, max_priority_fee_per_gas) = self
            .client
            .estimate_eip1559_fees(None)
            .await
            .map_err(Error::chain("eip1559 fee estimate"))?;
        Ok(FeeQuote {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        })
    }
}

#[async_trait]
impl<M: Middleware + 'static> PriceQuoteSource for ChainClient<M> {
    fn paymaster(&self) -> Address {
        self.paymaster
    }

    async fn read_quote(&self) -> Result<PriceQuote, Error> {
        let sponsor = self.sponsor_contract();
        let (price, updated_at) = sponsor
            .cached_price()
            .call()
            .await
            .map_err(Error::chain("sponsor.cachedPrice"))?;
        let staleness_threshold = match sponsor.price_staleness_threshold().call().await {
            Ok(v) => saturating_u64(v),
            Err(e) => {
                tracing::debug!(error = %e, "priceStalenessThreshold unavailable; using default");
                self.default_staleness_secs
            }
        };
        Ok(PriceQuote {
            price,
            updated_at: saturating_u64(updated_at),
            staleness_threshold,
        })
    }

    async fn refresh_quote(&self) -> Result<H256, Error> {
        confirm(self.sponsor_contract().update_price(), "sponsor.updatePrice", self.tx_timeout).await
    }
}

#[async_trait]
impl<M: Middleware + 'static> SponsorChain for ChainClient<M> {
    fn paymaster(&self) -> Address {
        self.paymaster
    }

    async fn deposit_info(&self) -> Result<DepositInfo, Error> {
        let (deposit, staked, stake, unstake_delay_sec, withdraw_time) = self
            .entry_point_contract()
            .get_deposit_info(self.paymaster)
            .call()
            .await
            .map_err(Error::chain("EntryPoint.getDepositInfo"))?;
        Ok(DepositInfo {
            deposit,
            staked,
            stake,
            unstake_delay_sec,
            withdraw_time,
        })
    }

    async fn cached_price(&self) -> Result<U256, Error> {
        let (price, _) = self
            .sponsor_contract()
            .cached_price()
            .call()
            .await
            .map_err(Error::chain("sponsor.cachedPrice"))?;
        Ok(price)
    }

    async fn token_price(&self, token: Address) -> Result<U256, Error> {
        self.sponsor_contract()
            .token_prices(token)
            .call()
            .await
            .map_err(Error::chain("sponsor.tokenPrices"))
    }

    async fn sponsor_balance(&self, user: Address, token: Address) -> Result<U256, Error> {
        self.sponsor_contract()
            .balances(user, token)
            .call()
            .await
            .map_err(Error::chain("sponsor.balances"))
    }

    async fn operator_config(&self, operator: Address) -> Result<OperatorConfig, Error> {
        let (token, treasury, is_configured, is_paused, exchange_rate) = self
            .sponsor_contract()
            .operators(operator)
            .call()
            .await
            .map_err(Error::chain("sponsor.operators"))?;
        Ok(OperatorConfig {
            token,
            treasury,
            is_configured,
            is_paused,
            exchange_rate,
        })
    }

    async fn available_credit(&self, user: Address, token: Address) -> Result<U256, Error> {
        self.sponsor_contract()
            .get_available_credit(user, token)
            .call()
            .await
            .map_err(Error::chain("sponsor.getAvailableCredit"))
    }

    async fn token_balance(&self, token: Address, owner: Address) -> Result<U256, Error> {
        Erc20::new(token, self.client.clone())
            .balance_of(owner)
            .call()
            .await
            .map_err(Error::chain("ERC20.balanceOf"))
    }

    async fn add_stake(&self, amount: U256, unstake_delay_sec: u32) -> Result<H256, Error> {
        let call = self.sponsor_contract().add_stake(unstake_delay_sec).value(amount);
        confirm(call, "sponsor.addStake", self.tx_timeout).await
    }

    async fn add_deposit(&self, amount: U256) -> Result<H256, Error> {
        let call = self.sponsor_contract().add_deposit().value(amount);
        confirm(call, "sponsor.addDeposit", self.tx_timeout).await
    }

    async fn refresh_price(&self) -> Result<H256, Error> {
        self.refresh_quote().await
    }

    async fn add_gas_token(&self, token: Address) -> Result<H256, Error> {
        confirm(
            self.sponsor_contract().add_gas_token(token),
            "sponsor.addGasToken",
            self.tx_timeout,
        )
        .await
    }

    async fn set_token_price(&self, token: Address, price: U256) -> Result<H256, Error> {
        confirm(
            self.sponsor_contract().set_token_price(token, price),
            "sponsor.setTokenPrice",
            self.tx_timeout,
        )
        .await
    }
}

#[async_trait]
impl<M: Middleware + 'static> DirectSubmitter for ChainClient<M> {
    async fn handle_ops(&self, op: &PackedUserOperation) -> Result<H256, Error> {
        let call = self
            .entry_point_contract()
            .handle_ops(vec![contracts::PackedUserOperation::from(op)], self.beneficiary);
        confirm(call, "EntryPoint.handleOps", self.tx_timeout).await
    }
}
