// src/lib.rs
//! ERC-20 gas sponsorship for ERC-4337 smart-contract wallets.

pub mod codec;
pub mod contracts;
pub mod converter;
pub mod coordinator;
pub mod error;
pub mod factory;
pub mod ledger;
pub mod paymaster;
pub mod relay;
pub mod rpc;
pub mod signer;
pub mod token;
pub mod types;

pub use error::{PaymasterError, PaymasterResult};
pub use types::UserOperation;
