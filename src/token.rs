// src/token.rs
use std::sync::Arc;

use async_trait::async_trait;
use ethers::providers::Middleware;
use ethers::types::{Address, U256, U64};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::contracts::IERC20;
use crate::error::{PaymasterError, PaymasterResult};

/// Token contract surface the ledger reads for admission and writes at
/// settlement.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TokenContracts: Send + Sync {
    async fn allowance(&self, token: Address, owner: Address, spender: Address)
        -> PaymasterResult<U256>;

    async fn balance_of(&self, token: Address, owner: Address) -> PaymasterResult<U256>;

    async fn transfer_from(
        &self,
        token: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> PaymasterResult<()>;
}

/// ERC-20 access through any ethers middleware. `transfer_from` needs a
/// signing middleware whose account holds the allowance.
pub struct Erc20Contracts<M> {
    client: Arc<M>,
}

impl<M: Middleware + 'static> Erc20Contracts<M> {
    pub fn new(client: Arc<M>) -> Self {
        Self { client }
    }

    fn erc20(&self, token: Address) -> IERC20<M> {
        IERC20::new(token, Arc::clone(&self.client))
    }
}

#[async_trait]
impl<M: Middleware + 'static> TokenContracts for Erc20Contracts<M> {
    async fn allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> PaymasterResult<U256> {
        self.erc20(token)
            .allowance(owner, spender)
            .call()
            .await
            .map_err(|e| PaymasterError::EthereumProviderError(e.to_string()))
    }

    async fn balance_of(&self, token: Address, owner: Address) -> PaymasterResult<U256> {
        self.erc20(token)
            .balance_of(owner)
            .call()
            .await
            .map_err(|e| PaymasterError::EthereumProviderError(e.to_string()))
    }

    async fn transfer_from(
        &self,
        token: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> PaymasterResult<()> {
        let call = self.erc20(token).transfer_from(from, to, amount);
        let pending = call
            .send()
            .await
            .map_err(|e| PaymasterError::SettlementTransferFailed(e.to_string()))?;
        let receipt = pending
            .await
            .map_err(|e| PaymasterError::SettlementTransferFailed(e.to_string()))?
            .ok_or_else(|| {
                PaymasterError::SettlementTransferFailed("transfer dropped".to_string())
            })?;

        if receipt.status != Some(U64::one()) {
            return Err(PaymasterError::SettlementTransferFailed(format!(
                "transfer reverted in {:?}",
                receipt.transaction_hash
            )));
        }
        debug!(
            "Pulled {} of token {:?} from {:?} in {:?}",
            amount, token, from, receipt.transaction_hash
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::*;

    /// In-memory ERC-20 balances and allowances.
    #[derive(Default)]
    pub(crate) struct TokenBook {
        balances: Mutex<HashMap<(Address, Address), U256>>,
        allowances: Mutex<HashMap<(Address, Address, Address), U256>>,
    }

    impl TokenBook {
        pub(crate) fn mint(&self, token: Address, owner: Address, amount: U256) {
            *self.balances.lock().entry((token, owner)).or_default() += amount;
        }

        pub(crate) fn approve(
            &self,
            token: Address,
            owner: Address,
            spender: Address,
            amount: U256,
        ) {
            self.allowances.lock().insert((token, owner, spender), amount);
        }

        pub(crate) fn balance(&self, token: Address, owner: Address) -> U256 {
            self.balances
                .lock()
                .get(&(token, owner))
                .copied()
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl TokenContracts for TokenBook {
        async fn allowance(
            &self,
            token: Address,
            owner: Address,
            spender: Address,
        ) -> PaymasterResult<U256> {
            Ok(self
                .allowances
                .lock()
                .get(&(token, owner, spender))
                .copied()
                .unwrap_or_default())
        }

        async fn balance_of(&self, token: Address, owner: Address) -> PaymasterResult<U256> {
            Ok(self.balance(token, owner))
        }

        async fn transfer_from(
            &self,
            token: Address,
            from: Address,
            to: Address,
            amount: U256,
        ) -> PaymasterResult<()> {
            let mut allowances = self.allowances.lock();
            let mut balances = self.balances.lock();
            let allowance = allowances.entry((token, from, to)).or_default();
            if *allowance < amount {
                return Err(PaymasterError::SettlementTransferFailed(
                    "ERC20: insufficient allowance".to_string(),
                ));
            }
            let balance = balances.entry((token, from)).or_default();
            if *balance < amount {
                return Err(PaymasterError::SettlementTransferFailed(
                    "ERC20: transfer amount exceeds balance".to_string(),
                ));
            }
            if *allowance != U256::MAX {
                *allowance -= amount;
            }
            *balance -= amount;
            *balances.entry((token, to)).or_default() += amount;
            Ok(())
        }
    }
}
