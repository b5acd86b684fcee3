// src/relay.rs
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{Address, H256, U64};
use jsonrpsee::core::client::ClientT;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{PaymasterError, PaymasterResult};
use crate::types::UserOperation;

/// The bundler's synchronous answer. Acceptance does not imply inclusion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayOutcome {
    Accepted(H256),
    RejectedByRelay(String),
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait BundlerTransport: Send + Sync {
    async fn send_user_operation(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> PaymasterResult<RelayOutcome>;
}

pub struct HttpBundler {
    client: HttpClient,
}

impl HttpBundler {
    /// Connects and checks that the bundler serves `chain_id`.
    pub async fn connect(
        url: &str,
        chain_id: u64,
        request_timeout: Duration,
    ) -> PaymasterResult<Self> {
        let client = HttpClientBuilder::default()
            .request_timeout(request_timeout)
            .build(url)
            .map_err(|e| PaymasterError::RelayTransport(e.to_string()))?;

        let remote: U64 = client
            .request("eth_chainId", rpc_params![])
            .await
            .map_err(|e| PaymasterError::RelayTransport(e.to_string()))?;
        if remote.as_u64() != chain_id {
            return Err(PaymasterError::InvalidParameters(format!(
                "bundler serves chain {remote}, expected {chain_id}"
            )));
        }

        Ok(Self { client })
    }
}

#[async_trait]
impl BundlerTransport for HttpBundler {
    async fn send_user_operation(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> PaymasterResult<RelayOutcome> {
        let result: Result<H256, _> = self
            .client
            .request("eth_sendUserOperation", rpc_params![op, entry_point])
            .await;
        match result {
            Ok(handle) => Ok(RelayOutcome::Accepted(handle)),
            Err(jsonrpsee::core::Error::Call(err)) => {
                Ok(RelayOutcome::RejectedByRelay(err.to_string()))
            }
            Err(e) => Err(PaymasterError::RelayTransport(e.to_string())),
        }
    }
}

/// Submits signed operations for one entry point and chain.
pub struct RelayClient {
    transport: Arc<dyn BundlerTransport>,
    entry_point: Address,
    chain_id: u64,
}

impl RelayClient {
    pub fn new(transport: Arc<dyn BundlerTransport>, entry_point: Address, chain_id: u64) -> Self {
        Self {
            transport,
            entry_point,
            chain_id,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub async fn submit(
        &self,
        op: &UserOperation,
        timeout: Duration,
    ) -> PaymasterResult<RelayOutcome> {
        if !op.is_signed() {
            return Err(PaymasterError::SignatureMismatch);
        }

        let outcome = tokio::time::timeout(
            timeout,
            self.transport.send_user_operation(op, self.entry_point),
        )
        .await
        .map_err(|_| PaymasterError::Timeout("relay submission"))??;

        match &outcome {
            RelayOutcome::Accepted(handle) => {
                info!("Bundler accepted operation from {:?}: {:?}", op.sender, handle)
            }
            RelayOutcome::RejectedByRelay(reason) => {
                warn!("Bundler rejected operation from {:?}: {}", op.sender, reason)
            }
        }
        Ok(outcome)
    }
}
