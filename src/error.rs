// src/error.rs
use ethers::types::{Address, H256, U256};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaymasterError {
    #[error("Target address cannot be the zero address")]
    InvalidTarget,

    #[error("Stale nonce for {sender:?}: expected {expected}, got {actual}")]
    StaleNonce {
        sender: Address,
        expected: U256,
        actual: U256,
    },

    #[error("Signature does not match the operation owner")]
    SignatureMismatch,

    #[error("Malformed paymasterAndData: {0}")]
    MalformedSponsorData(String),

    #[error("Token {0:?} has no configured exchange rate")]
    UnknownToken(Address),

    #[error("Insufficient token allowance: required {required}, available {available}")]
    InsufficientAllowance { required: U256, available: U256 },

    #[error("Insufficient sponsor deposit: required {required}, available {available}")]
    InsufficientDeposit { required: U256, available: U256 },

    #[error("Time {now} outside validity window [{valid_after}, {valid_until}]")]
    OutsideValidityWindow {
        now: u64,
        valid_after: u64,
        valid_until: u64,
    },

    #[error("paymasterAndData names sponsor {actual:?}, expected {expected:?}")]
    SponsorMismatch { expected: Address, actual: Address },

    #[error("No ledger registered for sponsor {0:?}")]
    UnknownSponsor(Address),

    #[error("No owner registered for account {0:?}")]
    UnknownAccount(Address),

    #[error("Settlement transfer failed: {0}")]
    SettlementTransferFailed(String),

    #[error("Sponsor deposit short at settlement: required {required}, available {available}")]
    SettlementDepositShortfall { required: U256, available: U256 },

    #[error("Operation {0:?} was already settled")]
    AlreadySettled(H256),

    #[error("Gas cost calculation overflow")]
    GasOverflow,

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("Relay transport error: {0}")]
    RelayTransport(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Ethereum provider error: {0}")]
    EthereumProviderError(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
}

impl PaymasterError {
    /// Errors raised after gas was already spent on the sponsor's behalf.
    pub fn is_settlement_error(&self) -> bool {
        matches!(
            self,
            Self::SettlementTransferFailed(_)
                | Self::SettlementDepositShortfall { .. }
                | Self::AlreadySettled(_)
        )
    }

    /// Errors reported by sponsor validation. The operation was never executed.
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            Self::InsufficientAllowance { .. }
                | Self::InsufficientDeposit { .. }
                | Self::OutsideValidityWindow { .. }
                | Self::UnknownToken(_)
                | Self::SponsorMismatch { .. }
                | Self::MalformedSponsorData(_)
        )
    }
}

pub type PaymasterResult<T> = Result<T, PaymasterError>;
