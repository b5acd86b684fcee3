// src/factory.rs
use std::collections::HashMap;

use ethers::abi::AbiEncode;
use ethers::types::{Address, Bytes, U256};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::contracts::{ApproveCall, ExecuteCall};
use crate::error::{PaymasterError, PaymasterResult};
use crate::types::UserOperation;

/// Caller-supplied gas limits and fees. Not estimated here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasHints {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

impl Default for GasHints {
    fn default() -> Self {
        Self {
            call_gas_limit: 100_000.into(),
            verification_gas_limit: 150_000.into(),
            pre_verification_gas: 1_000_000.into(),
            max_fee_per_gas: 2_000_000_000u64.into(),
            max_priority_fee_per_gas: 1_000_000_000u64.into(),
        }
    }
}

/// What the wallet should do: call `target` with `value` and `data`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallIntent {
    pub sender: Address,
    pub target: Address,
    pub value: U256,
    pub data: Bytes,
}

impl CallIntent {
    /// `token.approve(spender, amount)` from the wallet, the setup call a
    /// wallet makes before paying gas in `token`.
    pub fn erc20_approve(
        sender: Address,
        token: Address,
        spender: Address,
        amount: U256,
    ) -> Self {
        Self {
            sender,
            target: token,
            value: U256::zero(),
            data: ApproveCall { spender, amount }.encode().into(),
        }
    }
}

/// SimpleAccount `execute(dest, value, func)` calldata.
pub fn encode_execute(target: Address, value: U256, data: Bytes) -> Bytes {
    ExecuteCall {
        dest: target,
        value,
        func: data,
    }
    .encode()
    .into()
}

/// Builds unsigned operations and tracks the next expected nonce per sender.
#[derive(Debug, Default)]
pub struct UserOperationFactory {
    next_nonces: Mutex<HashMap<Address, U256>>,
    init_codes: Mutex<HashMap<Address, Bytes>>,
}

impl UserOperationFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the nonce counter from chain state (`EntryPoint.getNonce`).
    pub fn observe_nonce(&self, sender: Address, next_nonce: U256) {
        self.next_nonces.lock().insert(sender, next_nonce);
    }

    /// Deployment code to carry on the sender's next operation.
    pub fn set_init_code(&self, sender: Address, init_code: Bytes) {
        self.init_codes.lock().insert(sender, init_code);
    }

    pub fn create(
        &self,
        intent: CallIntent,
        nonce: U256,
        gas: GasHints,
    ) -> PaymasterResult<UserOperation> {
        if intent.target.is_zero() {
            return Err(PaymasterError::InvalidTarget);
        }

        {
            let mut nonces = self.next_nonces.lock();
            if let Some(expected) = nonces.get(&intent.sender) {
                if *expected != nonce {
                    return Err(PaymasterError::StaleNonce {
                        sender: intent.sender,
                        expected: *expected,
                        actual: nonce,
                    });
                }
            }
            let next = nonce
                .checked_add(U256::one())
                .ok_or_else(|| PaymasterError::InvalidParameters("nonce overflow".to_string()))?;
            nonces.insert(intent.sender, next);
        }

        let init_code = self
            .init_codes
            .lock()
            .remove(&intent.sender)
            .unwrap_or_default();

        debug!(
            "Created operation for {:?} nonce {} targeting {:?}",
            intent.sender, nonce, intent.target
        );

        Ok(UserOperation {
            sender: intent.sender,
            nonce,
            init_code,
            call_data: encode_execute(intent.target, intent.value, intent.data),
            call_gas_limit: gas.call_gas_limit,
            verification_gas_limit: gas.verification_gas_limit,
            pre_verification_gas: gas.pre_verification_gas,
            max_fee_per_gas: gas.max_fee_per_gas,
            max_priority_fee_per_gas: gas.max_priority_fee_per_gas,
            paymaster_and_data: Bytes::default(),
            signature: Bytes::default(),
        })
    }
}
