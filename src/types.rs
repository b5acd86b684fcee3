// src/types.rs
use std::fmt;

use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};

use crate::converter::ExchangeRate;
use crate::error::{PaymasterError, PaymasterResult};

/// Verification gas is charged up to three times when a paymaster is present:
/// account validation, paymaster validation and the post-op call.
const PAYMASTER_VERIFICATION_GAS_MULTIPLIER: u64 = 3;

/// ERC-4337 v0.6 user operation, serialized in the bundler RPC shape.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

/// Unique identifier for a user operation from a given sender
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct UserOperationId {
    pub sender: Address,
    pub nonce: U256,
}

impl UserOperation {
    pub fn id(&self) -> UserOperationId {
        UserOperationId {
            sender: self.sender,
            nonce: self.nonce,
        }
    }

    /// ABI-encodes every field except the signature. Dynamic fields are
    /// replaced by their keccak256 so the encoding is fixed width.
    pub fn pack(&self) -> Bytes {
        encode(&[
            Token::Address(self.sender),
            Token::Uint(self.nonce),
            Token::FixedBytes(keccak256(&self.init_code).to_vec()),
            Token::FixedBytes(keccak256(&self.call_data).to_vec()),
            Token::Uint(self.call_gas_limit),
            Token::Uint(self.verification_gas_limit),
            Token::Uint(self.pre_verification_gas),
            Token::Uint(self.max_fee_per_gas),
            Token::Uint(self.max_priority_fee_per_gas),
            Token::FixedBytes(keccak256(&self.paymaster_and_data).to_vec()),
        ])
        .into()
    }

    /// Hash of the operation bound to one entry point and chain, identical to
    /// the entry point's `getUserOpHash`.
    pub fn op_hash(&self, entry_point: Address, chain_id: u64) -> H256 {
        keccak256(encode(&[
            Token::FixedBytes(keccak256(self.pack()).to_vec()),
            Token::Address(entry_point),
            Token::Uint(chain_id.into()),
        ]))
        .into()
    }

    /// Sponsor address, if paymasterAndData is long enough to carry one.
    pub fn paymaster(&self) -> Option<Address> {
        if self.paymaster_and_data.len() < 20 {
            None
        } else {
            Some(Address::from_slice(&self.paymaster_and_data[..20]))
        }
    }

    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }

    /// Maximum native cost the entry point would require as prefund.
    pub fn max_gas_cost(&self) -> PaymasterResult<U256> {
        let mul = if self.paymaster_and_data.is_empty() {
            U256::one()
        } else {
            U256::from(PAYMASTER_VERIFICATION_GAS_MULTIPLIER)
        };
        self.verification_gas_limit
            .checked_mul(mul)
            .and_then(|gas| gas.checked_add(self.call_gas_limit))
            .and_then(|gas| gas.checked_add(self.pre_verification_gas))
            .and_then(|gas| gas.checked_mul(self.max_fee_per_gas))
            .ok_or(PaymasterError::GasOverflow)
    }

    /// Attaches encoded sponsor data. The signature covers paymasterAndData,
    /// so any existing signature is dropped.
    pub fn with_sponsor_data(mut self, paymaster_and_data: Bytes) -> Self {
        self.paymaster_and_data = paymaster_and_data;
        self.signature = Bytes::default();
        self
    }
}

/// Inclusive validity window, in seconds since the epoch. `valid_until == 0`
/// means the window never closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidityWindow {
    pub valid_after: u64,
    pub valid_until: u64,
}

impl ValidityWindow {
    pub fn new(valid_after: u64, valid_until: u64) -> Self {
        Self {
            valid_after,
            valid_until,
        }
    }

    pub fn contains(&self, now: u64) -> bool {
        now >= self.valid_after && (self.valid_until == 0 || now <= self.valid_until)
    }
}

/// Decoded paymasterAndData.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SponsorData {
    pub paymaster: Address,
    pub token: Address,
    pub window: Option<ValidityWindow>,
}

/// Numbers fixed at paymaster validation and threaded unmodified into post-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationContext {
    pub op_hash: H256,
    pub sender: Address,
    pub paymaster: Address,
    pub token: Address,
    pub rate: ExchangeRate,
    pub max_gas_cost: U256,
    pub max_token_cost: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settlement {
    pub op_hash: H256,
    pub token: Address,
    pub gas_cost_charged: U256,
    pub token_amount_charged: U256,
    pub execution_succeeded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationState {
    Received,
    ValidatedLocally,
    Submitted,
    ValidatedBySponsor,
    Executed,
    Settled,
    RejectedAtValidation,
    RejectedAtSettlement,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Settled | Self::RejectedAtValidation | Self::RejectedAtSettlement
        )
    }

    pub fn can_advance_to(self, next: OperationState) -> bool {
        use OperationState::*;
        matches!(
            (self, next),
            (Received, ValidatedLocally)
                | (Received, RejectedAtValidation)
                | (ValidatedLocally, Submitted)
                | (ValidatedLocally, ValidatedBySponsor)
                | (ValidatedLocally, RejectedAtValidation)
                | (Submitted, ValidatedBySponsor)
                | (Submitted, RejectedAtValidation)
                | (ValidatedBySponsor, Executed)
                | (Executed, Settled)
                | (Executed, RejectedAtSettlement)
        )
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymasterResponse {
    pub paymaster_and_data: Bytes,
    pub max_token_cost: U256,
    pub valid_after: u64,
    pub valid_until: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenQuote {
    pub token: Address,
    pub gas_cost: U256,
    pub token_amount: U256,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_zeroed() {
        // Matches getUserOpHash() on an entry point at
        // 0x66a15edcc3b50a663e72f1457ffd49b9ae284ddc, chain ID 1337.
        let operation = UserOperation::default();
        let entry_point = "0x66a15edcc3b50a663e72f1457ffd49b9ae284ddc"
            .parse()
            .unwrap();
        let hash = operation.op_hash(entry_point, 1337);
        assert_eq!(
            hash,
            "0xdca97c3b49558ab360659f6ead939773be8bf26631e61bb17045bb70dc983b2d"
                .parse()
                .unwrap()
        );
    }

    #[test]
    fn test_hash() {
        let operation = UserOperation {
            sender: "0x1306b01bc3e4ad202612d3843387e94737673f53"
                .parse()
                .unwrap(),
            nonce: 8942.into(),
            init_code: "0x6942069420694206942069420694206942069420"
                .parse()
                .unwrap(),
            call_data: "0x0000000000000000000000000000000000000000080085"
                .parse()
                .unwrap(),
            call_gas_limit: 10000.into(),
            verification_gas_limit: 100000.into(),
            pre_verification_gas: 100.into(),
            max_fee_per_gas: 99999.into(),
            max_priority_fee_per_gas: 9999999.into(),
            paymaster_and_data:
                "0x0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef"
                    .parse()
                    .unwrap(),
            signature: "0xda0929f527cded8d0a1eaf2e8861d7f7e2d8160b7b13942f99dd367df4473a"
                .parse()
                .unwrap(),
        };
        let entry_point = "0x66a15edcc3b50a663e72f1457ffd49b9ae284ddc"
            .parse()
            .unwrap();
        let hash = operation.op_hash(entry_point, 1337);
        assert_eq!(
            hash,
            "0x484add9e4d8c3172d11b5feb6a3cc712280e176d278027cfa02ee396eb28afa1"
                .parse()
                .unwrap()
        );
    }

    #[test]
    fn max_gas_cost_triples_verification_with_paymaster() {
        let mut op = UserOperation {
            call_gas_limit: 10.into(),
            verification_gas_limit: 100.into(),
            pre_verification_gas: 1.into(),
            max_fee_per_gas: 2.into(),
            ..Default::default()
        };
        assert_eq!(op.max_gas_cost().unwrap(), U256::from(222));

        op.paymaster_and_data = vec![0u8; 40].into();
        assert_eq!(op.max_gas_cost().unwrap(), U256::from(622));
    }

    #[test]
    fn max_gas_cost_overflow() {
        let op = UserOperation {
            call_gas_limit: U256::MAX,
            pre_verification_gas: 1.into(),
            max_fee_per_gas: 1.into(),
            ..Default::default()
        };
        assert_eq!(op.max_gas_cost(), Err(PaymasterError::GasOverflow));
    }

    #[test]
    fn attaching_sponsor_data_drops_signature() {
        let op = UserOperation {
            signature: vec![1u8; 65].into(),
            ..Default::default()
        };
        let op = op.with_sponsor_data(vec![7u8; 40].into());
        assert!(!op.is_signed());
        assert_eq!(op.paymaster(), Some(Address::repeat_byte(7)));
    }

    #[test]
    fn validity_window_bounds() {
        let window = ValidityWindow::new(100, 200);
        assert!(!window.contains(99));
        assert!(window.contains(100));
        assert!(window.contains(200));
        assert!(!window.contains(201));
        assert!(ValidityWindow::new(0, 0).contains(u64::MAX));
    }

    #[test]
    fn state_transitions() {
        use OperationState::*;
        assert!(Received.can_advance_to(ValidatedLocally));
        assert!(Executed.can_advance_to(RejectedAtSettlement));
        assert!(!Settled.can_advance_to(Executed));
        assert!(!ValidatedBySponsor.can_advance_to(Settled));
        assert!(Settled.is_terminal());
    }

    #[test]
    fn user_operation_json_is_camel_case() {
        let op = UserOperation {
            nonce: 1.into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["nonce"], "0x1");
        assert!(json.get("paymasterAndData").is_some());
        assert!(json.get("maxPriorityFeePerGas").is_some());
    }
}
