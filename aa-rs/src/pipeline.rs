//! End-to-end gasless flow: draft, estimate, assemble, sign and submit.

use ethers::types::{Address, Bytes, U256};

use crate::bundler::Relay;
use crate::error::Error;
use crate::fees::{quote_fees, FeeOracle, FeePolicy};
use crate::gas::{GasEstimator, NetworkKind, PriceQuoteSource, TunerConfig};
use crate::paymaster::Sponsor;
use crate::retry::RetryPolicy;
use crate::signer::OperationSigner;
use crate::submit::{assemble, DirectSubmitter, NonceSource, SubmissionOutcome, Submitter};
use crate::types::{TunedLimits, UserOperation};

/// What the caller wants executed and who pays for it.
#[derive(Clone, Debug)]
pub struct GaslessRequest {
    pub sender: Address,
    pub nonce_key: U256,
    /// Set only while the account is not yet deployed.
    pub factory: Option<Address>,
    pub factory_data: Bytes,
    pub call_data: Bytes,
    pub sponsor: Sponsor,
}

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub entry_point: Address,
    pub chain_id: u64,
    pub fees: FeePolicy,
    pub tuner: TunerConfig,
    pub retry: RetryPolicy,
    pub network: NetworkKind,
}

#[derive(Clone, Debug)]
pub struct Estimated {
    /// Assembled and unsigned.
    pub operation: UserOperation,
    pub limits: TunedLimits,
}

pub struct GaslessClient<'a> {
    relay: &'a dyn Relay,
    nonces: &'a dyn NonceSource,
    fees: &'a dyn FeeOracle,
    signer: &'a dyn OperationSigner,
    quote_source: Option<&'a dyn PriceQuoteSource>,
    direct: Option<&'a dyn DirectSubmitter>,
    settings: PipelineSettings,
}

impl<'a> GaslessClient<'a> {
    pub fn new(
        relay: &'a dyn Relay,
        nonces: &'a dyn NonceSource,
        fees: &'a dyn FeeOracle,
        signer: &'a dyn OperationSigner,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            relay,
            nonces,
            fees,
            signer,
            quote_source: None,
            direct: None,
            settings,
        }
    }

    /// Enables the quote-freshness gate before every estimate.
    pub fn with_quote_source(mut self, source: &'a dyn PriceQuoteSource) -> Self {
        self.quote_source = Some(source);
        self
    }

    pub fn with_direct_submitter(mut self, direct: &'a dyn DirectSubmitter) -> Self {
        self.direct = Some(direct);
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Unsigned operation with live nonce and fees, sponsor attached, gas limits unset.
    pub async fn draft(&self, req: &GaslessRequest) -> Result<UserOperation, Error> {
        let nonce = self.nonces.nonce(req.sender, req.nonce_key).await?;
        let fees = quote_fees(self.fees, &self.settings.fees).await?;

        Ok(UserOperation {
            sender: req.sender,
            nonce,
            factory: req.factory,
            factory_data: req.factory_data.clone(),
            call_data: req.call_data.clone(),
            max_fee_per_gas: fees.max_fee_per_gas,
            max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
            paymaster: Some(req.sponsor.paymaster),
            paymaster_data: req.sponsor.paymaster_data()?,
            ..Default::default()
        })
    }

    pub async fn estimate(&self, req: &GaslessRequest) -> Result<Estimated, Error> {
        let draft = self.draft(req).await?;

        let mut estimator = GasEstimator::new(self.relay, self.settings.entry_point, self.settings.tuner);
        if let Some(source) = self.quote_source {
            estimator = estimator.with_quote_source(source, self.settings.network);
        }
        let limits = estimator.estimate(&draft, req.sponsor.model()).await?;

        Ok(Estimated {
            operation: assemble(&draft, &limits),
            limits,
        })
    }

    pub async fn send(&self, req: &GaslessRequest) -> Result<SubmissionOutcome, Error> {
        let estimated = self.estimate(req).await?;
        tracing::info!(
            sender = ?req.sender,
            nonce = %estimated.operation.nonce,
            model = ?req.sponsor.model(),
            "sending sponsored user operation"
        );

        let mut submitter = Submitter::new(
            self.relay,
            self.signer,
            self.settings.entry_point,
            self.settings.chain_id,
            self.settings.retry,
        );
        if let Some(direct) = self.direct {
            submitter = submitter.with_direct_submitter(direct);
        }
        submitter.submit(estimated.operation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::UserOperationReceipt;
    use crate::error::{RelayError, RpcError};
    use crate::fees::FeeQuote;
    use crate::gas::PriceQuote;
    use crate::hash::user_operation_hash;
    use crate::paymaster::{CreditLayout, SponsorshipPayload, TOKEN_DATA_LEN};
    use crate::submit::Route;
    use crate::types::GasEstimate;
    use async_trait::async_trait;
    use ethers::signers::LocalWallet;
    use ethers::types::H256;
    use std::sync::Mutex;

    const KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const CHAIN: u64 = 31337;

    #[derive(Default)]
    struct FakeRelay {
        estimated: Mutex<Vec<UserOperation>>,
        sent: Mutex<Vec<UserOperation>>,
    }

    #[async_trait]
    impl Relay for FakeRelay {
        async fn estimate_user_operation_gas(
            &self,
            op: &UserOperation,
            _: Address,
        ) -> Result<GasEstimate, RelayError> {
            self.estimated.lock().unwrap().push(op.clone());
            Ok(GasEstimate {
                pre_verification_gas: U256::from(48_000u64),
                verification_gas_limit: U256::from(30_000u64),
                call_gas_limit: U256::from(50_000u64),
                paymaster_verification_gas_limit: U256::from(20_000u64),
                paymaster_post_op_gas_limit: U256::from(10_000u64),
            })
        }

        async fn send_user_operation(
            &self,
            op: &UserOperation,
            entry_point: Address,
        ) -> Result<H256, RelayError> {
            let mut sent = self.sent.lock().unwrap();
            sent.push(op.clone());
            if sent.len() == 1 {
                return Err(RpcError::new(-32602, "maxPriorityFeePerGas must be at least 5000").into());
            }
            Ok(user_operation_hash(&op.pack().unwrap(), entry_point, CHAIN))
        }

        async fn get_user_operation_receipt(
            &self,
            _: H256,
        ) -> Result<Option<UserOperationReceipt>, RelayError> {
            Ok(None)
        }
    }

    struct FixedNonce;

    #[async_trait]
    impl NonceSource for FixedNonce {
        async fn nonce(&self, _: Address, key: U256) -> Result<U256, Error> {
            Ok(key + U256::from(3u64))
        }
    }

    struct FixedFees;

    #[async_trait]
    impl FeeOracle for FixedFees {
        async fn eip1559_fees(&self) -> Result<FeeQuote, Error> {
            Ok(FeeQuote {
                max_fee_per_gas: U256::from(10_000u64),
                max_priority_fee_per_gas: U256::from(1_000u64),
            })
        }
    }

    struct StaleQuotes;

    #[async_trait]
    impl PriceQuoteSource for StaleQuotes {
        fn paymaster(&self) -> Address {
            paymaster()
        }
        async fn read_quote(&self) -> Result<PriceQuote, Error> {
            Ok(PriceQuote {
                price: U256::one(),
                updated_at: 1,
                staleness_threshold: 60,
            })
        }
        async fn refresh_quote(&self) -> Result<H256, Error> {
            unreachable!()
        }
    }

    fn paymaster() -> Address {
        Address::repeat_byte(0x99)
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            entry_point: Address::repeat_byte(0xee),
            chain_id: CHAIN,
            fees: FeePolicy::default(),
            tuner: TunerConfig::default(),
            retry: RetryPolicy::default(),
            network: NetworkKind::Production,
        }
    }

    fn token_request() -> GaslessRequest {
        GaslessRequest {
            sender: Address::repeat_byte(0x11),
            nonce_key: U256::zero(),
            factory: None,
            factory_data: Bytes::new(),
            call_data: Bytes::from(vec![0xb6, 0x1d, 0x27, 0xf6]),
            sponsor: Sponsor {
                paymaster: paymaster(),
                payload: SponsorshipPayload::token(Address::repeat_byte(0x7e), 3600, 1_700_000_000),
                credit_layout: CreditLayout::Minimal,
            },
        }
    }

    #[tokio::test]
    async fn draft_carries_nonce_fees_and_sponsor() {
        let (relay, wallet) = (FakeRelay::default(), KEY.parse::<LocalWallet>().unwrap());
        let client = GaslessClient::new(&relay, &FixedNonce, &FixedFees, &wallet, settings());
        let draft = client.draft(&token_request()).await.unwrap();

        assert_eq!(draft.nonce, U256::from(3u64));
        assert_eq!(draft.max_priority_fee_per_gas, U256::from(1_500u64));
        assert_eq!(draft.max_fee_per_gas, U256::from(15_000u64));
        assert_eq!(draft.paymaster, Some(paymaster()));
        assert_eq!(draft.paymaster_data.len(), TOKEN_DATA_LEN);
        assert!(draft.signature.is_empty());
    }

    #[tokio::test]
    async fn send_estimates_tunes_and_retries_to_acceptance() {
        let (relay, wallet) = (FakeRelay::default(), KEY.parse::<LocalWallet>().unwrap());
        let client = GaslessClient::new(&relay, &FixedNonce, &FixedFees, &wallet, settings());
        let outcome = client.send(&token_request()).await.unwrap();

        assert_eq!(outcome.route, Route::Relay);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.history.len(), 1);

        let op = &outcome.operation;
        // Token floors at 45%: ceil(40_000/0.45), ceil(35_000/0.45).
        assert_eq!(op.verification_gas_limit, U256::from(88_889u64));
        assert_eq!(op.paymaster_verification_gas_limit, U256::from(88_889u64));
        assert_eq!(op.paymaster_post_op_gas_limit, U256::from(77_778u64));
        assert_eq!(op.call_gas_limit, U256::from(55_000u64));
        assert_eq!(op.pre_verification_gas, U256::from(48_000u64));
        assert_eq!(op.max_priority_fee_per_gas, U256::from(5_000u64));

        let probe = &relay.estimated.lock().unwrap()[0];
        assert_eq!(probe.signature.len(), 65);
        assert_eq!(relay.sent.lock().unwrap().len(), 2);
        assert_eq!(
            outcome.user_op_hash,
            user_operation_hash(&op.pack().unwrap(), settings().entry_point, CHAIN)
        );
    }

    #[tokio::test]
    async fn stale_quote_stops_before_the_relay_is_contacted() {
        let (relay, wallet) = (FakeRelay::default(), KEY.parse::<LocalWallet>().unwrap());
        let client = GaslessClient::new(&relay, &FixedNonce, &FixedFees, &wallet, settings())
            .with_quote_source(&StaleQuotes);
        let err = client.send(&token_request()).await.unwrap_err();

        assert!(matches!(err, Error::StaleQuote { .. }), "{err}");
        assert!(relay.estimated.lock().unwrap().is_empty());
        assert!(relay.sent.lock().unwrap().is_empty());
    }
}
