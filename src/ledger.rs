// src/ledger.rs
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ethers::types::{Address, H256, U256};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::converter::{CostConverter, ExchangeRate};
use crate::error::{PaymasterError, PaymasterResult};
use crate::signer::OperationHasher;
use crate::token::TokenContracts;
use crate::types::{Settlement, SponsorData, UserOperation, ValidationContext};

#[derive(Debug, Default)]
struct LedgerState {
    deposit: U256,
    settled: HashSet<H256>,
    collected: HashMap<Address, U256>,
}

/// One sponsor's deposit, rate table and settlement record.
///
/// Validation only reads. Settlement is the single mutation point and is
/// applied at most once per operation hash. The state lock is never held
/// across a token contract call.
pub struct PaymasterLedger {
    sponsor: Address,
    hasher: OperationHasher,
    converter: RwLock<CostConverter>,
    tokens: Arc<dyn TokenContracts>,
    state: Mutex<LedgerState>,
}

impl PaymasterLedger {
    pub fn new(
        sponsor: Address,
        hasher: OperationHasher,
        converter: CostConverter,
        tokens: Arc<dyn TokenContracts>,
    ) -> Self {
        Self {
            sponsor,
            hasher,
            converter: RwLock::new(converter),
            tokens,
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn sponsor(&self) -> Address {
        self.sponsor
    }

    pub fn add_token(&self, token: Address, rate: ExchangeRate) {
        self.converter.write().add_token(token, rate);
    }

    pub fn supported_tokens(&self) -> Vec<Address> {
        self.converter.read().supported_tokens()
    }

    pub fn quote(&self, token: Address, gas_cost: U256) -> PaymasterResult<U256> {
        self.converter.read().quote(token, gas_cost)
    }

    pub fn deposit(&self, amount: U256) -> PaymasterResult<U256> {
        let mut state = self.state.lock();
        state.deposit = state
            .deposit
            .checked_add(amount)
            .ok_or(PaymasterError::GasOverflow)?;
        info!("Sponsor {:?} deposit is now {}", self.sponsor, state.deposit);
        Ok(state.deposit)
    }

    /// Replaces the deposit with the value observed on chain.
    pub fn set_deposit(&self, amount: U256) {
        self.state.lock().deposit = amount;
    }

    pub fn deposit_balance(&self) -> U256 {
        self.state.lock().deposit
    }

    pub fn collected(&self, token: Address) -> U256 {
        self.state
            .lock()
            .collected
            .get(&token)
            .copied()
            .unwrap_or_default()
    }

    pub fn is_settled(&self, op_hash: H256) -> bool {
        self.state.lock().settled.contains(&op_hash)
    }

    /// Admission check. Fixes the worst-case bill and the exchange rate used
    /// later by `post_op`.
    pub async fn validate(
        &self,
        op: &UserOperation,
        sponsor_data: &SponsorData,
        now: u64,
    ) -> PaymasterResult<ValidationContext> {
        if sponsor_data.paymaster != self.sponsor {
            return Err(PaymasterError::SponsorMismatch {
                expected: self.sponsor,
                actual: sponsor_data.paymaster,
            });
        }
        let token = sponsor_data.token;
        let max_gas_cost = op.max_gas_cost()?;
        let rate = self.converter.read().rate_of(token)?;
        let max_token_cost = rate.apply(max_gas_cost)?;

        let (allowance, balance) = tokio::try_join!(
            self.tokens.allowance(token, op.sender, self.sponsor),
            self.tokens.balance_of(token, op.sender),
        )?;
        let available = allowance.min(balance);
        if available < max_token_cost {
            return Err(PaymasterError::InsufficientAllowance {
                required: max_token_cost,
                available,
            });
        }

        let deposit = self.deposit_balance();
        if deposit < max_gas_cost {
            return Err(PaymasterError::InsufficientDeposit {
                required: max_gas_cost,
                available: deposit,
            });
        }

        if let Some(window) = sponsor_data.window {
            if !window.contains(now) {
                return Err(PaymasterError::OutsideValidityWindow {
                    now,
                    valid_after: window.valid_after,
                    valid_until: window.valid_until,
                });
            }
        }

        let op_hash = self.hasher.hash(op);
        debug!(
            "Validated {:?}: max gas cost {}, max token cost {} of {:?}",
            op_hash, max_gas_cost, max_token_cost, token
        );

        Ok(ValidationContext {
            op_hash,
            sender: op.sender,
            paymaster: self.sponsor,
            token,
            rate,
            max_gas_cost,
            max_token_cost,
        })
    }

    /// Charges the sender for `actual_gas_cost` at the validation-time rate,
    /// never more than the validation-time worst case.
    pub async fn post_op(
        &self,
        context: &ValidationContext,
        actual_gas_cost: U256,
        execution_succeeded: bool,
    ) -> PaymasterResult<Settlement> {
        if context.paymaster != self.sponsor {
            return Err(PaymasterError::SponsorMismatch {
                expected: self.sponsor,
                actual: context.paymaster,
            });
        }

        if actual_gas_cost > context.max_gas_cost {
            warn!(
                "Actual gas cost {} of {:?} exceeds validated maximum {}, capping",
                actual_gas_cost, context.op_hash, context.max_gas_cost
            );
        }
        let gas_cost_charged = actual_gas_cost.min(context.max_gas_cost);
        let token_amount_charged = context
            .rate
            .apply(gas_cost_charged)?
            .min(context.max_token_cost);

        // gas is already spent: a short deposit is drained, the sender still pays
        let shortfall = {
            let mut state = self.state.lock();
            if !state.settled.insert(context.op_hash) {
                return Err(PaymasterError::AlreadySettled(context.op_hash));
            }
            if state.deposit < gas_cost_charged {
                let available = std::mem::take(&mut state.deposit);
                Some(PaymasterError::SettlementDepositShortfall {
                    required: gas_cost_charged,
                    available,
                })
            } else {
                state.deposit -= gas_cost_charged;
                None
            }
        };
        if let Some(e) = &shortfall {
            error!(
                "Settlement of {:?} overdraws sponsor {:?}: {}",
                context.op_hash, self.sponsor, e
            );
        }

        if !token_amount_charged.is_zero() {
            if let Err(e) = self
                .tokens
                .transfer_from(context.token, context.sender, self.sponsor, token_amount_charged)
                .await
            {
                error!(
                    "Settlement of {:?} failed, sponsor {:?} absorbs {} gas: {}",
                    context.op_hash, self.sponsor, gas_cost_charged, e
                );
                let reason = match e {
                    PaymasterError::SettlementTransferFailed(reason) => reason,
                    other => other.to_string(),
                };
                return Err(PaymasterError::SettlementTransferFailed(reason));
            }
        }

        *self
            .state
            .lock()
            .collected
            .entry(context.token)
            .or_default() += token_amount_charged;

        if let Some(e) = shortfall {
            return Err(e);
        }

        if execution_succeeded {
            info!(
                "Settled {:?}: charged {} of {:?} for gas {}",
                context.op_hash, token_amount_charged, context.token, gas_cost_charged
            );
        } else {
            info!(
                "Settled reverted {:?}: charged {} of {:?} for gas {}",
                context.op_hash, token_amount_charged, context.token, gas_cost_charged
            );
        }

        Ok(Settlement {
            op_hash: context.op_hash,
            token: context.token,
            gas_cost_charged,
            token_amount_charged,
            execution_succeeded,
        })
    }
}
