//! Liquidation call encoding, simulation and dispatch.
//!
//! The core pipeline builds a [`CallSpec`] once during prepare, simulates it
//! with the exact payload that will later be broadcast, and dispatches the
//! same call at execute time. [`ContractExecutor`] is the production
//! implementation; tests substitute the trait.

use std::sync::Arc;

use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::sol;
use alloy::sol_types::SolCall;
use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::gas::FeeData;
use crate::sender::TransactionSender;

sol! {
    interface IPoolLiquidation {
        function liquidationCall(
            address collateralAsset,
            address debtAsset,
            address user,
            uint256 debtToCover,
            bool receiveAToken
        ) external;
    }

    interface IFlashLiquidator {
        function execute(
            address borrower,
            address debtAsset,
            address collateralAsset,
            uint256 debtAmount,
            bytes calldata swapPayload
        ) external;
    }
}

/// A fully-encoded outbound call.
#[derive(Debug, Clone)]
pub struct CallSpec {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
}

/// Encode `Pool.liquidationCall` for the direct path.
pub fn encode_liquidation_call(
    collateral_asset: Address,
    debt_asset: Address,
    user: Address,
    debt_to_cover: U256,
    receive_atoken: bool,
) -> Bytes {
    IPoolLiquidation::liquidationCallCall {
        collateralAsset: collateral_asset,
        debtAsset: debt_asset,
        user,
        debtToCover: debt_to_cover,
        receiveAToken: receive_atoken,
    }
    .abi_encode()
    .into()
}

/// Encode `FlashLiquidator.execute` for the flash-loan path.
pub fn encode_flash_execute(
    borrower: Address,
    debt_asset: Address,
    collateral_asset: Address,
    debt_amount: U256,
    swap_payload: Bytes,
) -> Bytes {
    IFlashLiquidator::executeCall {
        borrower,
        debtAsset: debt_asset,
        collateralAsset: collateral_asset,
        debtAmount: debt_amount,
        swapPayload: swap_payload,
    }
    .abi_encode()
    .into()
}

/// Outbound execution interface consumed by the core pipeline.
#[async_trait]
pub trait LiquidationExecutor: Send + Sync {
    /// `eth_call` the exact payload that would later be broadcast.
    async fn simulate(&self, call: &CallSpec) -> Result<()>;

    async fn estimate_gas(&self, call: &CallSpec) -> Result<u64>;

    /// Sign, broadcast and await confirmation. Returns the tx hash.
    async fn dispatch(&self, call: &CallSpec, gas_limit: u64, fees: FeeData) -> Result<B256>;
}

/// Alloy-backed executor broadcasting through a [`TransactionSender`].
pub struct ContractExecutor {
    http_url: String,
    from: Address,
    sender: Option<Arc<TransactionSender>>,
}

impl ContractExecutor {
    /// `sender` may be absent in dry-run deployments; simulation and gas
    /// estimation still work, dispatch fails fast.
    pub fn new(http_url: impl Into<String>, from: Address, sender: Option<Arc<TransactionSender>>) -> Self {
        Self {
            http_url: http_url.into(),
            from,
            sender,
        }
    }

    fn request_for(&self, call: &CallSpec) -> TransactionRequest {
        TransactionRequest::default()
            .with_from(self.from)
            .with_to(call.to)
            .with_input(call.data.clone())
            .with_value(call.value)
    }
}

#[async_trait]
impl LiquidationExecutor for ContractExecutor {
    #[instrument(skip(self, call), fields(to = %call.to))]
    async fn simulate(&self, call: &CallSpec) -> Result<()> {
        let provider = ProviderBuilder::new().connect_http(self.http_url.parse()?);
        provider
            .call(&self.request_for(call))
            .await
            .context("simulation reverted")?;
        debug!("Simulation succeeded");
        Ok(())
    }

    async fn estimate_gas(&self, call: &CallSpec) -> Result<u64> {
        let provider = ProviderBuilder::new().connect_http(self.http_url.parse()?);
        let gas = provider
            .estimate_gas(&self.request_for(call))
            .await
            .context("gas estimation failed")?;
        Ok(gas)
    }

    async fn dispatch(&self, call: &CallSpec, gas_limit: u64, fees: FeeData) -> Result<B256> {
        let sender = self
            .sender
            .as_ref()
            .context("no signer configured for dispatch")?;

        sender
            .send(
                call.to,
                call.data.clone(),
                call.value,
                gas_limit,
                fees.max_fee_per_gas(2.0, u128::MAX),
                fees.priority_fee,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_liquidation_call_encoding() {
        let data = encode_liquidation_call(
            Address::repeat_byte(1),
            Address::repeat_byte(2),
            Address::repeat_byte(3),
            U256::from(1000u64),
            false,
        );

        // selector + 5 words
        assert_eq!(data.len(), 4 + 5 * 32);
        assert_eq!(&data[..4], &IPoolLiquidation::liquidationCallCall::SELECTOR);
    }

    #[test]
    fn test_flash_execute_encoding() {
        let payload = Bytes::from(vec![0xaa, 0xbb]);
        let data = encode_flash_execute(
            Address::repeat_byte(1),
            Address::repeat_byte(2),
            Address::repeat_byte(3),
            U256::from(500u64),
            payload,
        );

        assert_eq!(&data[..4], &IFlashLiquidator::executeCall::SELECTOR);
        // dynamic bytes payload is embedded after the head words
        assert!(data.len() > 4 + 5 * 32);
    }
}
