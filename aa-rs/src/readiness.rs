//! Operator-side checks that a sponsor can actually pay for a user's operations, and the
//! corrective "prepare" workflow.

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use serde::Serialize;

use crate::error::Error;

const ONE_DAY_SECS: u32 = 86_400;

fn eth_fraction(tenths: u64) -> U256 {
    U256::from(tenths) * U256::exp10(17)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct DepositInfo {
    pub deposit: U256,
    pub staked: bool,
    pub stake: U256,
    pub unstake_delay_sec: u32,
    pub withdraw_time: U256,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct OperatorConfig {
    pub token: Address,
    pub treasury: Address,
    pub is_configured: bool,
    pub is_paused: bool,
    pub exchange_rate: U256,
}

/// Reads and operator writes against a sponsor and its entry point.
///
/// Write methods return only once the transaction is final.
#[async_trait]
pub trait SponsorChain: Send + Sync {
    fn paymaster(&self) -> Address;

    async fn deposit_info(&self) -> Result<DepositInfo, Error>;
    async fn cached_price(&self) -> Result<U256, Error>;
    async fn token_price(&self, token: Address) -> Result<U256, Error>;
    async fn sponsor_balance(&self, user: Address, token: Address) -> Result<U256, Error>;
    async fn operator_config(&self, operator: Address) -> Result<OperatorConfig, Error>;
    async fn available_credit(&self, user: Address, token: Address) -> Result<U256, Error>;
    async fn token_balance(&self, token: Address, owner: Address) -> Result<U256, Error>;

    async fn add_stake(&self, amount: U256, unstake_delay_sec: u32) -> Result<H256, Error>;
    async fn add_deposit(&self, amount: U256) -> Result<H256, Error>;
    async fn refresh_price(&self) -> Result<H256, Error>;
    async fn add_gas_token(&self, token: Address) -> Result<H256, Error>;
    async fn set_token_price(&self, token: Address, price: U256) -> Result<H256, Error>;
}

/// What the sponsor is checked for: a payment token or a credit operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Subject {
    Token(Address),
    Operator(Address),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadinessThresholds {
    pub min_stake: U256,
    pub min_unstake_delay_sec: u32,
    pub min_deposit: U256,
}

impl Default for ReadinessThresholds {
    fn default() -> Self {
        Self {
            min_stake: eth_fraction(1),
            min_unstake_delay_sec: ONE_DAY_SECS,
            min_deposit: eth_fraction(1),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessDetails {
    pub paymaster_stake: U256,
    pub unstake_delay_sec: u32,
    pub paymaster_deposit: U256,
    pub cached_price: U256,
    pub subject_supported: bool,
    pub token: Address,
    /// Token model only.
    pub token_price: Option<U256>,
    pub user_token_balance: U256,
    /// Prior deposit (token model) or available credit (credit model).
    pub user_sponsor_balance: U256,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessReport {
    pub is_ready: bool,
    pub issues: Vec<String>,
    pub details: ReadinessDetails,
}

pub async fn check_readiness(
    chain: &dyn SponsorChain,
    user: Address,
    subject: Subject,
    thresholds: &ReadinessThresholds,
) -> Result<ReadinessReport, Error> {
    let mut issues = Vec::new();

    let (deposit, cached_price) = futures::try_join!(chain.deposit_info(), chain.cached_price())?;

    if deposit.stake < thresholds.min_stake {
        issues.push(format!(
            "paymaster stake {} wei is below the {} wei minimum",
            deposit.stake, thresholds.min_stake
        ));
    }
    if deposit.unstake_delay_sec < thresholds.min_unstake_delay_sec {
        issues.push(format!(
            "paymaster unstake delay {}s is below {}s",
            deposit.unstake_delay_sec, thresholds.min_unstake_delay_sec
        ));
    }
    if deposit.deposit < thresholds.min_deposit {
        issues.push(format!(
            "paymaster deposit {} wei is below the {} wei minimum",
            deposit.deposit, thresholds.min_deposit
        ));
    }
    if cached_price.is_zero() {
        issues.push("sponsor price cache is not initialized".to_string());
    }

    let details = match subject {
        Subject::Token(token) => {
            let (token_price, user_token_balance, user_deposit) = futures::try_join!(
                chain.token_price(token),
                chain.token_balance(token, user),
                chain.sponsor_balance(user, token),
            )?;
            let supported = !token_price.is_zero();
            if !supported {
                issues.push(format!("token {token:?} is not supported by the sponsor (price unset)"));
            }
            if user_token_balance.is_zero() {
                issues.push(format!("user {user:?} holds none of token {token:?}"));
            }
            if user_deposit.is_zero() {
                issues.push(format!("user {user:?} has no deposit with the sponsor"));
            }
            ReadinessDetails {
                paymaster_stake: deposit.stake,
                unstake_delay_sec: deposit.unstake_delay_sec,
                paymaster_deposit: deposit.deposit,
                cached_price,
                subject_supported: supported,
                token,
                token_price: Some(token_price),
                user_token_balance,
                user_sponsor_balance: user_deposit,
            }
        }
        Subject::Operator(operator) => {
            let config = chain.operator_config(operator).await?;
            let supported = config.is_configured && !config.is_paused;
            if !config.is_configured {
                issues.push(format!("operator {operator:?} is not configured"));
            } else if config.is_paused {
                issues.push(format!("operator {operator:?} is paused"));
            }

            let (user_token_balance, credit) = if config.token.is_zero() {
                (U256::zero(), U256::zero())
            } else {
                futures::try_join!(
                    chain.token_balance(config.token, user),
                    chain.available_credit(user, config.token),
                )?
            };
            if user_token_balance.is_zero() {
                issues.push(format!(
                    "user {user:?} holds none of operator token {:?}",
                    config.token
                ));
            }
            if credit.is_zero() {
                issues.push(format!("user {user:?} has no available credit with the sponsor"));
            }
            ReadinessDetails {
                paymaster_stake: deposit.stake,
                unstake_delay_sec: deposit.unstake_delay_sec,
                paymaster_deposit: deposit.deposit,
                cached_price,
                subject_supported: supported,
                token: config.token,
                token_price: None,
                user_token_balance,
                user_sponsor_balance: credit,
            }
        }
    };

    Ok(ReadinessReport {
        is_ready: issues.is_empty(),
        issues,
        details,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum PrepareAction {
    Stake,
    Deposit,
    PriceRefresh,
    EnableToken,
    TokenPrice,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareStep {
    pub action: PrepareAction,
    pub tx_hash: H256,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrepareOptions {
    pub stake_amount: U256,
    pub unstake_delay_sec: u32,
    pub deposit_amount: U256,
    /// Price to set for a token the sponsor does not price yet.
    pub token_price: Option<U256>,
}

impl Default for PrepareOptions {
    fn default() -> Self {
        Self {
            stake_amount: eth_fraction(2),
            unstake_delay_sec: ONE_DAY_SECS,
            deposit_amount: eth_fraction(3),
            token_price: None,
        }
    }
}

/// Runs the readiness check and performs the missing corrective writes in order, each one
/// final before the next starts. User-side issues (balances, credit, operator config) are
/// left to the caller.
pub async fn prepare(
    chain: &dyn SponsorChain,
    user: Address,
    subject: Subject,
    thresholds: &ReadinessThresholds,
    opts: &PrepareOptions,
) -> Result<Vec<PrepareStep>, Error> {
    let report = check_readiness(chain, user, subject, thresholds).await?;
    let d = &report.details;
    let mut steps = Vec::new();

    let mut record = |action: PrepareAction, tx_hash: H256| {
        tracing::info!(?action, tx = ?tx_hash, "prepare step confirmed");
        steps.push(PrepareStep { action, tx_hash });
    };

    if d.paymaster_stake < thresholds.min_stake || d.unstake_delay_sec < thresholds.min_unstake_delay_sec {
        let delay = opts.unstake_delay_sec.max(thresholds.min_unstake_delay_sec);
        record(PrepareAction::Stake, chain.add_stake(opts.stake_amount, delay).await?);
    }
    if d.paymaster_deposit < thresholds.min_deposit {
        record(PrepareAction::Deposit, chain.add_deposit(opts.deposit_amount).await?);
    }
    if d.cached_price.is_zero() {
        record(PrepareAction::PriceRefresh, chain.refresh_price().await?);
    }
    if let Subject::Token(token) = subject {
        if !d.subject_supported {
            // Registration reverts when the token is already listed but unpriced.
            match chain.add_gas_token(token).await {
                Ok(tx) => record(PrepareAction::EnableToken, tx),
                Err(e) => tracing::warn!(token = ?token, error = %e, "addGasToken failed; continuing"),
            }
            match opts.token_price {
                Some(price) => record(
                    PrepareAction::TokenPrice,
                    chain.set_token_price(token, price).await?,
                ),
                None => tracing::warn!(token = ?token, "token price unset and no price given; skipping"),
            }
        }
    }

    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct State {
        deposit: DepositInfo,
        cached_price: U256,
        token_price: U256,
        sponsor_balance: U256,
        token_balance: U256,
        operator: OperatorConfig,
        credit: U256,
        writes: Vec<&'static str>,
        add_gas_token_fails: bool,
    }

    #[derive(Default)]
    struct FakeChain(Mutex<State>);

    impl FakeChain {
        fn write(&self, name: &'static str) -> H256 {
            let mut s = self.0.lock().unwrap();
            s.writes.push(name);
            H256::from_low_u64_be(s.writes.len() as u64)
        }
    }

    #[async_trait]
    impl SponsorChain for FakeChain {
        fn paymaster(&self) -> Address {
            Address::repeat_byte(0x99)
        }
        async fn deposit_info(&self) -> Result<DepositInfo, Error> {
            Ok(self.0.lock().unwrap().deposit)
        }
        async fn cached_price(&self) -> Result<U256, Error> {
            Ok(self.0.lock().unwrap().cached_price)
        }
        async fn token_price(&self, _: Address) -> Result<U256, Error> {
            Ok(self.0.lock().unwrap().token_price)
        }
        async fn sponsor_balance(&self, _: Address, _: Address) -> Result<U256, Error> {
            Ok(self.0.lock().unwrap().sponsor_balance)
        }
        async fn operator_config(&self, _: Address) -> Result<OperatorConfig, Error> {
            Ok(self.0.lock().unwrap().operator)
        }
        async fn available_credit(&self, _: Address, _: Address) -> Result<U256, Error> {
            Ok(self.0.lock().unwrap().credit)
        }
        async fn token_balance(&self, _: Address, _: Address) -> Result<U256, Error> {
            Ok(self.0.lock().unwrap().token_balance)
        }
        async fn add_stake(&self, amount: U256, delay: u32) -> Result<H256, Error> {
            let h = self.write("addStake");
            let mut s = self.0.lock().unwrap();
            s.deposit.stake += amount;
            s.deposit.unstake_delay_sec = delay;
            Ok(h)
        }
        async fn add_deposit(&self, amount: U256) -> Result<H256, Error> {
            let h = self.write("addDeposit");
            self.0.lock().unwrap().deposit.deposit += amount;
            Ok(h)
        }
        async fn refresh_price(&self) -> Result<H256, Error> {
            let h = self.write("updatePrice");
            self.0.lock().unwrap().cached_price = U256::from(3_000u64);
            Ok(h)
        }
        async fn add_gas_token(&self, _: Address) -> Result<H256, Error> {
            if self.0.lock().unwrap().add_gas_token_fails {
                return Err(Error::Chain {
                    context: "addGasToken",
                    source: anyhow::anyhow!("already listed"),
                });
            }
            Ok(self.write("addGasToken"))
        }
        async fn set_token_price(&self, _: Address, price: U256) -> Result<H256, Error> {
            let h = self.write("setTokenPrice");
            self.0.lock().unwrap().token_price = price;
            Ok(h)
        }
    }

    fn user() -> Address {
        Address::repeat_byte(0x01)
    }

    fn token() -> Address {
        Address::repeat_byte(0x7e)
    }

    fn ready_chain() -> FakeChain {
        FakeChain(Mutex::new(State {
            deposit: DepositInfo {
                deposit: eth_fraction(5),
                staked: true,
                stake: eth_fraction(2),
                unstake_delay_sec: ONE_DAY_SECS,
                withdraw_time: U256::zero(),
            },
            cached_price: U256::from(3_000u64),
            token_price: U256::from(100_000_000u64),
            sponsor_balance: U256::from(10u64),
            token_balance: U256::from(10u64),
            operator: OperatorConfig {
                token: token(),
                is_configured: true,
                ..Default::default()
            },
            credit: U256::from(5u64),
            ..Default::default()
        }))
    }

    #[tokio::test]
    async fn healthy_sponsor_is_ready() {
        let chain = ready_chain();
        let r = check_readiness(&chain, user(), Subject::Token(token()), &Default::default())
            .await
            .unwrap();
        assert!(r.is_ready, "{:?}", r.issues);
        assert_eq!(r.details.token_price, Some(U256::from(100_000_000u64)));

        let r = check_readiness(
            &chain,
            user(),
            Subject::Operator(Address::repeat_byte(0x0b)),
            &Default::default(),
        )
        .await
        .unwrap();
        assert!(r.is_ready, "{:?}", r.issues);
        assert_eq!(r.details.user_sponsor_balance, U256::from(5u64));
    }

    #[tokio::test]
    async fn issues_are_reported_in_order() {
        let chain = FakeChain::default();
        let r = check_readiness(&chain, user(), Subject::Token(token()), &Default::default())
            .await
            .unwrap();
        assert!(!r.is_ready);
        assert_eq!(r.issues.len(), 7);
        assert!(r.issues[0].contains("stake"));
        assert!(r.issues[1].contains("unstake delay"));
        assert!(r.issues[2].contains("deposit"));
        assert!(r.issues[3].contains("price cache"));
        assert!(r.issues[4].contains("not supported"));
        assert!(r.issues[5].contains("holds none"));
        assert!(r.issues[6].contains("no deposit"));
    }

    #[tokio::test]
    async fn paused_operator_is_an_issue() {
        let chain = ready_chain();
        chain.0.lock().unwrap().operator.is_paused = true;
        let r = check_readiness(
            &chain,
            user(),
            Subject::Operator(Address::repeat_byte(0x0b)),
            &Default::default(),
        )
        .await
        .unwrap();
        assert_eq!(r.issues.len(), 1);
        assert!(r.issues[0].contains("paused"));
        assert!(!r.details.subject_supported);
    }

    #[tokio::test]
    async fn prepare_runs_missing_steps_in_order() {
        let chain = FakeChain::default();
        {
            let mut s = chain.0.lock().unwrap();
            s.token_balance = U256::one();
            s.sponsor_balance = U256::one();
        }
        let opts = PrepareOptions {
            token_price: Some(U256::from(100_000_000u64)),
            ..Default::default()
        };
        let steps = prepare(&chain, user(), Subject::Token(token()), &Default::default(), &opts)
            .await
            .unwrap();

        let actions: Vec<PrepareAction> = steps.iter().map(|s| s.action).collect();
        assert_eq!(
            actions,
            vec![
                PrepareAction::Stake,
                PrepareAction::Deposit,
                PrepareAction::PriceRefresh,
                PrepareAction::EnableToken,
                PrepareAction::TokenPrice,
            ]
        );
        assert_eq!(
            chain.0.lock().unwrap().writes,
            vec!["addStake", "addDeposit", "updatePrice", "addGasToken", "setTokenPrice"]
        );

        let r = check_readiness(&chain, user(), Subject::Token(token()), &Default::default())
            .await
            .unwrap();
        assert!(r.is_ready, "{:?}", r.issues);
    }

    #[tokio::test]
    async fn prepare_tolerates_already_listed_token() {
        let chain = ready_chain();
        {
            let mut s = chain.0.lock().unwrap();
            s.token_price = U256::zero();
            s.add_gas_token_fails = true;
        }
        let opts = PrepareOptions {
            token_price: Some(U256::from(1u64)),
            ..Default::default()
        };
        let steps = prepare(&chain, user(), Subject::Token(token()), &Default::default(), &opts)
            .await
            .unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].action, PrepareAction::TokenPrice);
    }

    #[tokio::test]
    async fn prepare_on_ready_sponsor_does_nothing() {
        let chain = ready_chain();
        let steps = prepare(
            &chain,
            user(),
            Subject::Token(token()),
            &Default::default(),
            &Default::default(),
        )
        .await
        .unwrap();
        assert!(steps.is_empty());
        assert!(chain.0.lock().unwrap().writes.is_empty());
    }
}
