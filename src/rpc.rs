// src/rpc.rs
use std::sync::Arc;

use ethers::types::{Address, U256};
use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::types::error::{ErrorObjectOwned, INTERNAL_ERROR_CODE, INVALID_PARAMS_CODE};
use jsonrpsee::types::ErrorObject;
use tracing::{debug, error, info};

use crate::error::PaymasterError;
use crate::paymaster::Paymaster;
use crate::types::{PaymasterResponse, TokenQuote, UserOperation};

// ERC-4337 error codes
const PAYMASTER_VALIDATION_REJECTED_CODE: i32 = -32501;
const OUT_OF_TIME_RANGE_CODE: i32 = -32503;
const SIGNATURE_CHECK_FAILED_CODE: i32 = -32507;

#[rpc(server, namespace = "pm")]
pub trait PaymasterRpc {
    /// Requests the paymaster to sponsor a user operation paid in `token`
    #[method(name = "sponsorUserOperation")]
    async fn sponsor(&self, user_op: UserOperation, token: Address) -> RpcResult<PaymasterResponse>;

    #[method(name = "supportedTokens")]
    async fn supported_tokens(&self) -> RpcResult<Vec<Address>>;

    /// Token amount the sponsor would charge for `gas_cost` native units
    #[method(name = "quote")]
    async fn quote(&self, token: Address, gas_cost: U256) -> RpcResult<TokenQuote>;
}

pub struct PaymasterRpcImpl {
    paymaster: Arc<Paymaster>,
}

impl PaymasterRpcImpl {
    pub fn new(paymaster: Arc<Paymaster>) -> Self {
        Self { paymaster }
    }
}

#[async_trait]
impl PaymasterRpcServer for PaymasterRpcImpl {
    async fn sponsor(
        &self,
        user_op: UserOperation,
        token: Address,
    ) -> RpcResult<PaymasterResponse> {
        debug!("Received sponsor request for sender: {:?}", user_op.sender);
        let sender = user_op.sender;

        match self.paymaster.sponsor_user_operation(user_op, token).await {
            Ok(response) => {
                info!("Sponsored operation for {:?} in token {:?}", sender, token);
                Ok(response)
            }
            Err(e) => {
                error!("Failed to sponsor operation for {:?}: {}", sender, e);
                Err(to_rpc_error(e))
            }
        }
    }

    async fn supported_tokens(&self) -> RpcResult<Vec<Address>> {
        Ok(self.paymaster.supported_tokens())
    }

    async fn quote(&self, token: Address, gas_cost: U256) -> RpcResult<TokenQuote> {
        self.paymaster.quote(token, gas_cost).map_err(to_rpc_error)
    }
}

pub fn to_rpc_error(e: PaymasterError) -> ErrorObjectOwned {
    let code = match &e {
        PaymasterError::OutsideValidityWindow { .. } => OUT_OF_TIME_RANGE_CODE,
        PaymasterError::SignatureMismatch => SIGNATURE_CHECK_FAILED_CODE,
        PaymasterError::InvalidTarget
        | PaymasterError::InvalidParameters(_)
        | PaymasterError::MalformedSponsorData(_) => INVALID_PARAMS_CODE,
        e if e.is_validation_error() => PAYMASTER_VALIDATION_REJECTED_CODE,
        PaymasterError::EthereumProviderError(_) => INTERNAL_ERROR_CODE,
        _ => -32000,
    };
    ErrorObject::owned(code, format!("Paymaster error: {}", e), None::<()>)
}
