use async_trait::async_trait;
use ethers::types::{Address, H256, U256};

use crate::bundler::Relay;
use crate::error::{AaFailure, AttemptRecord, Error, RelayError, RpcError, SubmissionFailure};
use crate::hash::user_operation_hash;
use crate::retry::{classify, RetryPolicy, RetryState};
use crate::signer::OperationSigner;
use crate::types::{PackedUserOperation, TunedLimits, UserOperation};

/// `EntryPoint.getNonce(sender, key)`.
#[async_trait]
pub trait NonceSource: Send + Sync {
    async fn nonce(&self, sender: Address, key: U256) -> Result<U256, Error>;
}

/// Sends `EntryPoint.handleOps([op], beneficiary)` directly, bypassing the relay.
#[async_trait]
pub trait DirectSubmitter: Send + Sync {
    async fn handle_ops(&self, op: &PackedUserOperation) -> Result<H256, Error>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmissionState {
    Building,
    Signed,
    Submitted,
    Retrying,
    Succeeded,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    Relay,
    Direct { tx_hash: H256 },
}

#[derive(Clone, Debug)]
pub struct SubmissionOutcome {
    pub user_op_hash: H256,
    pub route: Route,
    pub attempts: u32,
    /// The operation exactly as it was accepted, signature included.
    pub operation: UserOperation,
    /// Rejected attempts that preceded acceptance.
    pub history: Vec<AttemptRecord>,
}

/// Final operation from a draft and tuned limits. The result is unsigned.
pub fn assemble(draft: &UserOperation, limits: &TunedLimits) -> UserOperation {
    let mut op = draft.clone();
    limits.apply_to(&mut op);
    op.signature = Default::default();
    op
}

/// Hashes `op` and attaches a fresh signature. Returns the hash that was signed.
pub async fn sign_operation(
    op: &mut UserOperation,
    signer: &dyn OperationSigner,
    entry_point: Address,
    chain_id: u64,
) -> Result<H256, Error> {
    let hash = user_operation_hash(&op.pack()?, entry_point, chain_id);
    op.signature = signer.sign_hash(hash).await?;
    Ok(hash)
}

pub struct Submitter<'a> {
    relay: &'a dyn Relay,
    signer: &'a dyn OperationSigner,
    entry_point: Address,
    chain_id: u64,
    policy: RetryPolicy,
    direct: Option<&'a dyn DirectSubmitter>,
}

fn enter(state: &mut SubmissionState, next: SubmissionState, attempt: u32) {
    tracing::debug!(attempt, from = ?*state, to = ?next, "submission state");
    *state = next;
}

fn failure(
    rpc: &RpcError,
    kind: crate::error::RejectionKind,
    attempt: u32,
    retry: &RetryState,
    history: &[AttemptRecord],
) -> Box<SubmissionFailure> {
    Box::new(SubmissionFailure {
        category: kind,
        reason: AaFailure::from_rpc(rpc),
        last_error: rpc.clone(),
        attempts: attempt,
        last_fees: retry.snapshot(),
        history: history.to_vec(),
    })
}

impl<'a> Submitter<'a> {
    pub fn new(
        relay: &'a dyn Relay,
        signer: &'a dyn OperationSigner,
        entry_point: Address,
        chain_id: u64,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            relay,
            signer,
            entry_point,
            chain_id,
            policy,
            direct: None,
        }
    }

    pub fn with_direct_submitter(mut self, direct: &'a dyn DirectSubmitter) -> Self {
        self.direct = Some(direct);
        self
    }

    /// Signs and submits `op`, mutating fees or pre-verification gas on recoverable
    /// rejections. Every attempt is re-hashed and re-signed.
    pub async fn submit(&self, mut op: UserOperation) -> Result<SubmissionOutcome, Error> {
        let mut phase = SubmissionState::Building;
        let mut retry = RetryState::from_operation(&op);
        let mut history: Vec<AttemptRecord> = Vec::new();

        for attempt in 1..=self.policy.max_attempts {
            retry.apply_to(&mut op);
            let hash = sign_operation(&mut op, self.signer, self.entry_point, self.chain_id).await?;
            retry = retry.signed(op.signature.clone());
            enter(&mut phase, SubmissionState::Signed, attempt);

            tracing::info!(
                attempt,
                user_op_hash = ?hash,
                max_fee = %op.max_fee_per_gas,
                priority_fee = %op.max_priority_fee_per_gas,
                pre_verification_gas = %op.pre_verification_gas,
                "submitting user operation"
            );
            enter(&mut phase, SubmissionState::Submitted, attempt);

            match self.relay.send_user_operation(&op, self.entry_point).await {
                Ok(relay_hash) => {
                    if relay_hash != hash {
                        tracing::warn!(local = ?hash, relay = ?relay_hash, "relay returned a different userOpHash");
                    }
                    enter(&mut phase, SubmissionState::Succeeded, attempt);
                    return Ok(SubmissionOutcome {
                        user_op_hash: relay_hash,
                        route: Route::Relay,
                        attempts: attempt,
                        operation: op,
                        history,
                    });
                }
                Err(e) if e.is_method_not_found() => {
                    let Some(direct) = self.direct else {
                        enter(&mut phase, SubmissionState::Failed, attempt);
                        return Err(Error::UnsupportedMethod {
                            method: "eth_sendUserOperation".to_string(),
                        });
                    };
                    tracing::warn!("relay cannot accept operations; submitting handleOps directly");
                    let tx_hash = direct.handle_ops(&op.pack()?).await?;
                    enter(&mut phase, SubmissionState::Succeeded, attempt);
                    return Ok(SubmissionOutcome {
                        user_op_hash: hash,
                        route: Route::Direct { tx_hash },
                        attempts: attempt,
                        operation: op,
                        history,
                    });
                }
                Err(RelayError::Rpc(rpc)) => {
                    let rejection = classify(&rpc);
                    tracing::warn!(
                        attempt,
                        kind = %rejection.kind,
                        code = rpc.code,
                        message = %rpc.message,
                        "relay rejected user operation"
                    );
                    history.push(AttemptRecord {
                        attempt,
                        user_op_hash: hash,
                        fees: retry.snapshot(),
                        kind: rejection.kind,
                        message: rpc.message.clone(),
                    });

                    if !rejection.kind.is_recoverable() {
                        enter(&mut phase, SubmissionState::Failed, attempt);
                        return Err(Error::SubmissionRejected(failure(
                            &rpc,
                            rejection.kind,
                            attempt,
                            &retry,
                            &history,
                        )));
                    }
                    if attempt == self.policy.max_attempts {
                        enter(&mut phase, SubmissionState::Failed, attempt);
                        return Err(Error::SubmissionExhausted(failure(
                            &rpc,
                            rejection.kind,
                            attempt,
                            &retry,
                            &history,
                        )));
                    }

                    enter(&mut phase, SubmissionState::Retrying, attempt);
                    retry = retry.next(&rejection, &self.policy);
                }
                Err(e) => {
                    enter(&mut phase, SubmissionState::Failed, attempt);
                    return Err(e.into());
                }
            }
        }

        Err(Error::Config(format!(
            "retry policy allows {} attempts; at least 1 is required",
            self.policy.max_attempts
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::UserOperationReceipt;
    use crate::error::RejectionKind;
    use crate::types::GasEstimate;
    use anyhow::anyhow;
    use ethers::signers::LocalWallet;
    use ethers::types::{Bytes, Signature};
    use std::sync::Mutex;

    const KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const CHAIN: u64 = 11155111;

    type Script = Box<dyn Fn(&UserOperation) -> Result<H256, RelayError> + Send + Sync>;

    struct ScriptedRelay {
        on_send: Script,
        sent: Mutex<Vec<UserOperation>>,
    }

    impl ScriptedRelay {
        fn new(on_send: impl Fn(&UserOperation) -> Result<H256, RelayError> + Send + Sync + 'static) -> Self {
            Self {
                on_send: Box::new(on_send),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self) -> Vec<UserOperation> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Relay for ScriptedRelay {
        async fn estimate_user_operation_gas(
            &self,
            _: &UserOperation,
            _: Address,
        ) -> Result<GasEstimate, RelayError> {
            unreachable!()
        }

        async fn send_user_operation(
            &self,
            op: &UserOperation,
            _: Address,
        ) -> Result<H256, RelayError> {
            self.sent.lock().unwrap().push(op.clone());
            (self.on_send)(op)
        }

        async fn get_user_operation_receipt(
            &self,
            _: H256,
        ) -> Result<Option<UserOperationReceipt>, RelayError> {
            unreachable!()
        }
    }

    #[derive(Default)]
    struct RecordingDirect(Mutex<Vec<PackedUserOperation>>);

    #[async_trait]
    impl DirectSubmitter for RecordingDirect {
        async fn handle_ops(&self, op: &PackedUserOperation) -> Result<H256, Error> {
            self.0.lock().unwrap().push(op.clone());
            Ok(H256::repeat_byte(0xdd))
        }
    }

    fn wallet() -> LocalWallet {
        KEY.parse().unwrap()
    }

    fn entry_point() -> Address {
        Address::repeat_byte(0xee)
    }

    fn op() -> UserOperation {
        UserOperation {
            sender: Address::repeat_byte(0x11),
            call_data: Bytes::from(vec![0xb6, 0x1d]),
            call_gas_limit: U256::from(100_000u64),
            verification_gas_limit: U256::from(100_000u64),
            pre_verification_gas: U256::from(50_000u64),
            max_fee_per_gas: U256::from(1_000u64),
            max_priority_fee_per_gas: U256::from(100u64),
            ..Default::default()
        }
    }

    fn rpc(msg: &str) -> RelayError {
        RpcError::new(-32602, msg).into()
    }

    fn local_hash(op: &UserOperation) -> H256 {
        user_operation_hash(&op.pack().unwrap(), entry_point(), CHAIN)
    }

    #[tokio::test]
    async fn priority_fee_rejection_converges_in_two_attempts() {
        let relay = ScriptedRelay::new(|op| {
            if op.max_priority_fee_per_gas < U256::from(2_000u64) {
                Err(rpc(&format!(
                    "maxPriorityFeePerGas is {} but must be at least 2000",
                    op.max_priority_fee_per_gas
                )))
            } else {
                Ok(local_hash(op))
            }
        });
        let signer = wallet();
        let submitter = Submitter::new(&relay, &signer, entry_point(), CHAIN, RetryPolicy::default());

        let out = submitter.submit(op()).await.unwrap();
        assert_eq!(out.attempts, 2);
        assert_eq!(out.route, Route::Relay);
        assert_eq!(out.history.len(), 1);
        assert_eq!(out.history[0].kind, RejectionKind::PriorityFeeTooLow);

        let sent = relay.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].max_priority_fee_per_gas, U256::from(2_000u64));
        assert!(sent[1].max_fee_per_gas >= sent[1].max_priority_fee_per_gas);
        assert_ne!(sent[0].signature, sent[1].signature);

        // the accepted signature is over the mutated operation
        let sig = Signature::try_from(sent[1].signature.as_ref()).unwrap();
        let recovered = sig.recover(local_hash(&sent[1]).as_bytes()).unwrap();
        assert_eq!(recovered, OperationSigner::address(&signer));
    }

    #[tokio::test]
    async fn retries_stop_after_exactly_five_attempts() {
        let relay = ScriptedRelay::new(|_| Err(rpc("replacement underpriced")));
        let signer = wallet();
        let submitter = Submitter::new(&relay, &signer, entry_point(), CHAIN, RetryPolicy::default());

        let err = submitter.submit(op()).await.unwrap_err();
        let failure = match &err {
            Error::SubmissionExhausted(f) => f,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(failure.attempts, 5);
        assert_eq!(failure.history.len(), 5);
        assert_eq!(failure.category, RejectionKind::ReplacementUnderpriced);
        assert_eq!(relay.sent().len(), 5);

        // fees rise monotonically across attempts
        let fees: Vec<U256> = relay.sent().iter().map(|o| o.max_fee_per_gas).collect();
        assert!(fees.windows(2).all(|w| w[1] > w[0]));
        assert_eq!(failure.last_fees.max_fee_per_gas, fees[4]);
    }

    #[tokio::test]
    async fn unclassified_rejection_is_terminal() {
        let relay = ScriptedRelay::new(|_| Err(rpc("AA24 signature error")));
        let signer = wallet();
        let submitter = Submitter::new(&relay, &signer, entry_point(), CHAIN, RetryPolicy::default());

        match submitter.submit(op()).await {
            Err(Error::SubmissionRejected(f)) => {
                assert_eq!(f.attempts, 1);
                assert_eq!(f.category, RejectionKind::Unclassified);
                assert!(f.last_error.message.contains("AA24"));
                let reason = f.reason.clone().unwrap();
                assert_eq!(reason.code.as_deref(), Some("AA24"));
                assert_eq!(reason.kind, crate::error::AaFailureKind::InvalidSignature);
                assert!(f.to_string().starts_with("[AA24: invalid signature]"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(relay.sent().len(), 1);
    }

    #[tokio::test]
    async fn missing_send_method_falls_back_to_handle_ops() {
        let relay = ScriptedRelay::new(|_| Err(RpcError::new(-32601, "method not found").into()));
        let signer = wallet();
        let direct = RecordingDirect::default();
        let submitter = Submitter::new(&relay, &signer, entry_point(), CHAIN, RetryPolicy::default())
            .with_direct_submitter(&direct);

        let out = submitter.submit(op()).await.unwrap();
        assert_eq!(
            out.route,
            Route::Direct {
                tx_hash: H256::repeat_byte(0xdd)
            }
        );
        let sent = direct.0.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].signature.len(), 65);
        assert_eq!(out.user_op_hash, local_hash(&out.operation));
    }

    #[tokio::test]
    async fn missing_send_method_without_fallback_is_unsupported() {
        let relay = ScriptedRelay::new(|_| Err(RpcError::new(-32601, "method not found").into()));
        let signer = wallet();
        let submitter = Submitter::new(&relay, &signer, entry_point(), CHAIN, RetryPolicy::default());

        assert!(matches!(
            submitter.submit(op()).await,
            Err(Error::UnsupportedMethod { .. })
        ));
    }

    #[tokio::test]
    async fn transport_errors_are_not_retried() {
        let relay = ScriptedRelay::new(|_| Err(RelayError::Transport(anyhow!("connection reset"))));
        let signer = wallet();
        let submitter = Submitter::new(&relay, &signer, entry_point(), CHAIN, RetryPolicy::default());

        assert!(matches!(
            submitter.submit(op()).await,
            Err(Error::Relay(RelayError::Transport(_)))
        ));
        assert_eq!(relay.sent().len(), 1);
    }

    #[test]
    fn assemble_applies_limits_and_clears_signature() {
        let mut draft = op();
        draft.signature = Bytes::from(vec![1; 65]);
        let limits = TunedLimits {
            call_gas_limit: U256::from(7u64),
            ..Default::default()
        };
        let out = assemble(&draft, &limits);
        assert_eq!(out.call_gas_limit, U256::from(7u64));
        assert!(out.signature.is_empty());
    }
}
