// src/coordinator.rs
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
#[cfg(test)]
use mockall::automock;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::codec;
use crate::error::{PaymasterError, PaymasterResult};
use crate::ledger::PaymasterLedger;
use crate::signer::{OperationHasher, SignatureScheme};
use crate::types::{OperationState, Settlement, UserOperation, ValidationContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    pub succeeded: bool,
    pub actual_gas_cost: U256,
}

/// Runs the wallet's call. A revert is `Ok` with `succeeded == false`; an
/// `Err` means the call could not be run at all.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CallExecutor: Send + Sync {
    async fn execute(&self, op: &UserOperation) -> PaymasterResult<ExecutionOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationReceipt {
    pub op_hash: H256,
    pub state: OperationState,
    pub settlement: Settlement,
}

struct AccountAuth {
    owner: Address,
    scheme: Arc<dyn SignatureScheme>,
}

/// Sequences account validation, paymaster validation, execution and
/// post-op for one entry point and chain.
///
/// Operations of one sender run one at a time: a nonce is either committed
/// or rolled back before the sender's next operation is checked against it.
pub struct EntryPointCoordinator {
    hasher: OperationHasher,
    executor: Option<Arc<dyn CallExecutor>>,
    accounts: RwLock<HashMap<Address, AccountAuth>>,
    ledgers: RwLock<HashMap<Address, Arc<PaymasterLedger>>>,
    // next expected nonce per sender
    nonces: Mutex<HashMap<Address, U256>>,
    lanes: Mutex<HashMap<Address, Arc<AsyncMutex<()>>>>,
    states: Mutex<HashMap<H256, OperationState>>,
}

impl EntryPointCoordinator {
    pub fn new(hasher: OperationHasher, executor: Arc<dyn CallExecutor>) -> Self {
        Self::with_executor(hasher, Some(executor))
    }

    /// Coordinator for operations executed elsewhere, by a bundler. Only
    /// `preflight` and `record_submitted` are usable.
    pub fn relay_only(hasher: OperationHasher) -> Self {
        Self::with_executor(hasher, None)
    }

    fn with_executor(hasher: OperationHasher, executor: Option<Arc<dyn CallExecutor>>) -> Self {
        Self {
            hasher,
            executor,
            accounts: RwLock::new(HashMap::new()),
            ledgers: RwLock::new(HashMap::new()),
            nonces: Mutex::new(HashMap::new()),
            lanes: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_account(
        &self,
        sender: Address,
        owner: Address,
        scheme: Arc<dyn SignatureScheme>,
    ) {
        self.accounts
            .write()
            .insert(sender, AccountAuth { owner, scheme });
    }

    pub fn register_ledger(&self, ledger: Arc<PaymasterLedger>) {
        self.ledgers.write().insert(ledger.sponsor(), ledger);
    }

    pub fn observe_nonce(&self, sender: Address, next_nonce: U256) {
        self.nonces.lock().insert(sender, next_nonce);
    }

    pub fn expected_nonce(&self, sender: Address) -> U256 {
        self.nonces
            .lock()
            .get(&sender)
            .copied()
            .unwrap_or_default()
    }

    pub fn state_of(&self, op_hash: H256) -> Option<OperationState> {
        self.states.lock().get(&op_hash).copied()
    }

    /// Local checks before handing the operation to a relay. Nothing is
    /// reserved: the nonce is compared, not consumed.
    pub async fn preflight(
        &self,
        op: &UserOperation,
        now: u64,
    ) -> PaymasterResult<ValidationContext> {
        self.verify_sender(op)?;
        let expected = self.expected_nonce(op.sender);
        if op.nonce != expected {
            return Err(stale(op, expected));
        }

        let op_hash = self.hasher.hash(op);
        self.admit(op_hash)?;
        match self.validate_sponsor(op, now).await {
            Ok((_, context)) => Ok(context),
            Err(e) => {
                self.advance(op_hash, OperationState::RejectedAtValidation);
                Err(e)
            }
        }
    }

    /// Marks a preflighted operation as accepted by the relay.
    pub fn record_submitted(&self, op_hash: H256) -> PaymasterResult<()> {
        let mut states = self.states.lock();
        match states.get(&op_hash).copied() {
            Some(state) if state.can_advance_to(OperationState::Submitted) => {
                states.insert(op_hash, OperationState::Submitted);
                Ok(())
            }
            other => Err(PaymasterError::InvalidParameters(format!(
                "cannot submit {op_hash:?} from {other:?}"
            ))),
        }
    }

    /// Runs one operation to settlement. Any failure aborts the remaining
    /// steps; once paymaster validation passed, post-op always runs.
    pub async fn handle_op(
        &self,
        op: UserOperation,
        now: u64,
        timeout: Duration,
    ) -> PaymasterResult<OperationReceipt> {
        let executor = self.executor.clone().ok_or_else(|| {
            PaymasterError::InvalidParameters("no call executor configured".to_string())
        })?;
        self.verify_sender(&op)?;

        let lane = self.lane(op.sender);
        let _turn = lane.lock().await;
        self.reserve_nonce(&op)?;

        let op_hash = self.hasher.hash(&op);
        if let Err(e) = self.admit(op_hash) {
            self.release_nonce(&op);
            return Err(e);
        }

        let (ledger, context) = match self.validate_sponsor(&op, now).await {
            Ok(validated) => validated,
            Err(e) => {
                warn!("Paymaster validation of {:?} failed: {}", op_hash, e);
                self.release_nonce(&op);
                self.advance(op_hash, OperationState::RejectedAtValidation);
                return Err(e);
            }
        };
        self.advance(op_hash, OperationState::ValidatedBySponsor);

        let outcome = match tokio::time::timeout(timeout, executor.execute(&op)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!("Execution of {:?} abandoned: {}", op_hash, e);
                self.abandon(&op, op_hash);
                return Err(e);
            }
            Err(_) => {
                warn!("Execution of {:?} timed out after {:?}", op_hash, timeout);
                self.abandon(&op, op_hash);
                return Err(PaymasterError::Timeout("execution"));
            }
        };
        if !outcome.succeeded {
            info!("Execution of {:?} reverted, settling gas only", op_hash);
        }
        self.advance(op_hash, OperationState::Executed);

        match ledger
            .post_op(&context, outcome.actual_gas_cost, outcome.succeeded)
            .await
        {
            Ok(settlement) => {
                self.advance(op_hash, OperationState::Settled);
                Ok(OperationReceipt {
                    op_hash,
                    state: OperationState::Settled,
                    settlement,
                })
            }
            Err(e) => {
                self.advance(op_hash, OperationState::RejectedAtSettlement);
                Err(e)
            }
        }
    }

    fn verify_sender(&self, op: &UserOperation) -> PaymasterResult<()> {
        let accounts = self.accounts.read();
        let auth = accounts
            .get(&op.sender)
            .ok_or(PaymasterError::UnknownAccount(op.sender))?;
        self.hasher.verify(op, auth.owner, auth.scheme.as_ref())
    }

    fn ledger(&self, sponsor: Address) -> PaymasterResult<Arc<PaymasterLedger>> {
        self.ledgers
            .read()
            .get(&sponsor)
            .cloned()
            .ok_or(PaymasterError::UnknownSponsor(sponsor))
    }

    async fn validate_sponsor(
        &self,
        op: &UserOperation,
        now: u64,
    ) -> PaymasterResult<(Arc<PaymasterLedger>, ValidationContext)> {
        let sponsor_data = codec::decode(&op.paymaster_and_data)?;
        let ledger = self.ledger(sponsor_data.paymaster)?;
        let context = ledger.validate(op, &sponsor_data, now).await?;
        Ok((ledger, context))
    }

    fn lane(&self, sender: Address) -> Arc<AsyncMutex<()>> {
        self.lanes
            .lock()
            .entry(sender)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn reserve_nonce(&self, op: &UserOperation) -> PaymasterResult<()> {
        let mut nonces = self.nonces.lock();
        let expected = nonces.get(&op.sender).copied().unwrap_or_default();
        if op.nonce != expected {
            return Err(stale(op, expected));
        }
        let next = op
            .nonce
            .checked_add(U256::one())
            .ok_or_else(|| PaymasterError::InvalidParameters("nonce overflow".to_string()))?;
        nonces.insert(op.sender, next);
        Ok(())
    }

    fn release_nonce(&self, op: &UserOperation) {
        let mut nonces = self.nonces.lock();
        let reserved = op.nonce + U256::one();
        if nonces.get(&op.sender) == Some(&reserved) {
            nonces.insert(op.sender, op.nonce);
        } else {
            warn!(
                "Nonce {} of {:?} not released, counter was moved externally",
                op.nonce, op.sender
            );
        }
    }

    fn abandon(&self, op: &UserOperation, op_hash: H256) {
        self.release_nonce(op);
        self.states.lock().remove(&op_hash);
    }

    /// Starts tracking an operation. A preflighted operation continues from
    /// where it stopped.
    fn admit(&self, op_hash: H256) -> PaymasterResult<()> {
        let mut states = self.states.lock();
        match states.get(&op_hash).copied() {
            Some(OperationState::ValidatedLocally | OperationState::Submitted) => Ok(()),
            Some(state) if !state.is_terminal() => Err(PaymasterError::InvalidParameters(
                format!("operation {op_hash:?} already in flight"),
            )),
            _ => {
                states.insert(op_hash, OperationState::ValidatedLocally);
                debug!("Operation {:?} validated locally", op_hash);
                Ok(())
            }
        }
    }

    fn advance(&self, op_hash: H256, next: OperationState) {
        let mut states = self.states.lock();
        let current = states
            .get(&op_hash)
            .copied()
            .unwrap_or(OperationState::Received);
        if current.can_advance_to(next) {
            debug!("Operation {:?}: {} -> {}", op_hash, current, next);
            states.insert(op_hash, next);
        } else {
            warn!(
                "Ignoring illegal transition of {:?}: {} -> {}",
                op_hash, current, next
            );
        }
    }
}

fn stale(op: &UserOperation, expected: U256) -> PaymasterError {
    PaymasterError::StaleNonce {
        sender: op.sender,
        expected,
        actual: op.nonce,
    }
}
