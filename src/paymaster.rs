// src/paymaster.rs
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use ethers::providers::Middleware;
use ethers::types::{Address, U256};
use tracing::{debug, info};

use crate::codec;
use crate::contracts::IEntryPoint;
use crate::error::{PaymasterError, PaymasterResult};
use crate::ledger::PaymasterLedger;
use crate::types::{PaymasterResponse, SponsorData, TokenQuote, UserOperation, ValidityWindow};

/// Where the sponsor's entry point deposit is read from.
#[async_trait]
pub trait DepositSource: Send + Sync {
    async fn deposit_of(&self, account: Address) -> PaymasterResult<U256>;
}

#[async_trait]
impl<M: Middleware + 'static> DepositSource for IEntryPoint<M> {
    async fn deposit_of(&self, account: Address) -> PaymasterResult<U256> {
        self.balance_of(account)
            .call()
            .await
            .map_err(|e| PaymasterError::EthereumProviderError(e.to_string()))
    }
}

pub fn unix_now() -> PaymasterResult<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| PaymasterError::InvalidParameters(e.to_string()))?
        .as_secs())
}

/// The sponsor service behind the `pm` RPC namespace.
pub struct Paymaster {
    ledger: Arc<PaymasterLedger>,
    deposits: Arc<dyn DepositSource>,
    valid_duration: u64, // validity window in seconds
}

impl Paymaster {
    pub fn new(
        ledger: Arc<PaymasterLedger>,
        deposits: Arc<dyn DepositSource>,
        valid_duration: u64,
    ) -> Self {
        info!(
            "Initialized paymaster {:?} for tokens {:?}",
            ledger.sponsor(),
            ledger.supported_tokens()
        );
        Self {
            ledger,
            deposits,
            valid_duration,
        }
    }

    pub fn paymaster_address(&self) -> Address {
        self.ledger.sponsor()
    }

    pub fn supported_tokens(&self) -> Vec<Address> {
        self.ledger.supported_tokens()
    }

    pub fn quote(&self, token: Address, gas_cost: U256) -> PaymasterResult<TokenQuote> {
        Ok(TokenQuote {
            token,
            gas_cost,
            token_amount: self.ledger.quote(token, gas_cost)?,
        })
    }

    /// Checks that this sponsor would accept `user_op` paying in `token` and
    /// returns the paymasterAndData to attach before signing.
    pub async fn sponsor_user_operation(
        &self,
        user_op: UserOperation,
        token: Address,
    ) -> PaymasterResult<PaymasterResponse> {
        self.validate_user_operation(&user_op)?;

        let deposit = self.deposits.deposit_of(self.paymaster_address()).await?;
        self.ledger.set_deposit(deposit);

        let now = unix_now()?;
        let window = ValidityWindow::new(now, now + self.valid_duration);
        let sponsor_data = SponsorData {
            paymaster: self.paymaster_address(),
            token,
            window: Some(window),
        };
        let paymaster_and_data = codec::encode(&sponsor_data);

        let user_op = user_op.with_sponsor_data(paymaster_and_data.clone());
        let context = self.ledger.validate(&user_op, &sponsor_data, now).await?;
        debug!(
            "Sponsoring {:?} nonce {} for up to {} of {:?}",
            user_op.sender, user_op.nonce, context.max_token_cost, token
        );

        Ok(PaymasterResponse {
            paymaster_and_data,
            max_token_cost: context.max_token_cost,
            valid_after: window.valid_after,
            valid_until: window.valid_until,
        })
    }

    fn validate_user_operation(&self, user_op: &UserOperation) -> PaymasterResult<()> {
        if user_op.max_fee_per_gas.is_zero() {
            return Err(PaymasterError::InvalidParameters(
                "maxFeePerGas cannot be zero".to_string(),
            ));
        }
        if user_op.max_priority_fee_per_gas > user_op.max_fee_per_gas {
            return Err(PaymasterError::InvalidParameters(
                "maxPriorityFeePerGas exceeds maxFeePerGas".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::converter::{CostConverter, ExchangeRate};
    use crate::signer::tests::hasher;
    use crate::token::testing::TokenBook;

    pub(crate) struct FixedDeposit(pub U256);

    #[async_trait]
    impl DepositSource for FixedDeposit {
        async fn deposit_of(&self, _account: Address) -> PaymasterResult<U256> {
            Ok(self.0)
        }
    }

    pub(crate) fn sponsor() -> Address {
        Address::repeat_byte(0x50)
    }

    pub(crate) fn token() -> Address {
        Address::repeat_byte(0x70)
    }

    pub(crate) fn paymaster(deposit: u64) -> Paymaster {
        let book = Arc::new(TokenBook::default());
        book.mint(token(), Address::repeat_byte(0x0a), 1_000.into());
        book.approve(token(), Address::repeat_byte(0x0a), sponsor(), U256::MAX);
        let mut converter = CostConverter::new();
        converter.add_token(token(), ExchangeRate::whole(10).unwrap());
        let ledger = Arc::new(PaymasterLedger::new(sponsor(), hasher(), converter, book));
        Paymaster::new(ledger, Arc::new(FixedDeposit(deposit.into())), 3600)
    }

    pub(crate) fn user_op() -> UserOperation {
        UserOperation {
            sender: Address::repeat_byte(0x0a),
            pre_verification_gas: 1.into(),
            max_fee_per_gas: 1.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn sponsors_with_window() {
        let paymaster = paymaster(10);
        let response = paymaster
            .sponsor_user_operation(user_op(), token())
            .await
            .unwrap();

        let decoded = codec::decode(&response.paymaster_and_data).unwrap();
        assert_eq!(decoded.paymaster, sponsor());
        assert_eq!(decoded.token, token());
        let window = decoded.window.unwrap();
        assert_eq!(window.valid_until - window.valid_after, 3600);
        assert_eq!(response.max_token_cost, U256::from(10));
    }

    #[tokio::test]
    async fn refuses_without_deposit() {
        let paymaster = paymaster(0);
        assert!(matches!(
            paymaster.sponsor_user_operation(user_op(), token()).await,
            Err(PaymasterError::InsufficientDeposit { .. })
        ));
    }

    #[tokio::test]
    async fn refuses_zero_fee() {
        let paymaster = paymaster(10);
        let op = UserOperation {
            max_fee_per_gas: U256::zero(),
            ..user_op()
        };
        assert!(matches!(
            paymaster.sponsor_user_operation(op, token()).await,
            Err(PaymasterError::InvalidParameters(_))
        ));
    }

    #[test]
    fn quotes() {
        let paymaster = paymaster(10);
        assert_eq!(
            paymaster.quote(token(), 3.into()).unwrap().token_amount,
            U256::from(30)
        );
        assert_eq!(paymaster.supported_tokens(), vec![token()]);
    }
}
