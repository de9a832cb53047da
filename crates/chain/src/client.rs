//! Chain RPC client.
//!
//! The core engine talks to the chain exclusively through the [`ChainClient`]
//! trait; [`RpcClient`] is the Alloy-backed production implementation using
//! typed `sol!` contract bindings.

use alloy::primitives::{Address, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::sol;
use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::gas::FeeData;

sol! {
    /// Aave v3 reserve data layout (subset of fields is consumed).
    #[derive(Debug)]
    struct ReserveData {
        uint256 configuration;
        uint128 liquidityIndex;
        uint128 currentLiquidityRate;
        uint128 variableBorrowIndex;
        uint128 currentVariableBorrowRate;
        uint128 currentStableBorrowRate;
        uint40 lastUpdateTimestamp;
        uint16 id;
        address aTokenAddress;
        address stableDebtTokenAddress;
        address variableDebtTokenAddress;
        address interestRateStrategyAddress;
        uint128 accruedToTreasury;
        uint128 unbacked;
        uint128 isolationModeTotalDebt;
    }

    #[sol(rpc)]
    interface IPool {
        function getUserAccountData(address user)
            external
            view
            returns (
                uint256 totalCollateralBase,
                uint256 totalDebtBase,
                uint256 availableBorrowsBase,
                uint256 currentLiquidationThreshold,
                uint256 ltv,
                uint256 healthFactor
            );

        function getReserveData(address asset) external view returns (ReserveData memory);
    }

    #[sol(rpc)]
    interface IPriceOracle {
        function getAssetPrice(address asset) external view returns (uint256);
    }

    #[sol(rpc)]
    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
        function decimals() external view returns (uint8);
    }
}

/// Aave base-currency prices carry 8 decimals.
const BASE_CURRENCY_DECIMALS: f64 = 1e8;

/// Health factors are WAD-scaled on chain.
const WAD_F64: f64 = 1e18;

/// On-chain account summary from `getUserAccountData`.
#[derive(Debug, Clone, Copy)]
pub struct AccountData {
    pub total_collateral_usd: f64,
    pub total_debt_usd: f64,
    /// `+inf` when the account has no debt.
    pub health_factor: f64,
}

/// Read-side chain interface consumed by the core engine.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn block_number(&self) -> Result<u64>;

    async fn fee_data(&self) -> Result<FeeData>;

    /// Interest-bearing-token balance backing `asset` collateral for `user`.
    async fn supplied_balance(&self, asset: Address, user: Address) -> Result<U256>;

    /// Variable-debt-token balance for `asset` owed by `user`.
    async fn borrowed_balance(&self, asset: Address, user: Address) -> Result<U256>;

    async fn token_decimals(&self, asset: Address) -> Result<u8>;

    /// USD price from the pool's on-chain oracle.
    async fn oracle_price_usd(&self, asset: Address) -> Result<f64>;

    /// Account summary including the authoritative on-chain health factor.
    async fn account_data(&self, user: Address) -> Result<AccountData>;
}

/// Alloy-backed `ChainClient`.
pub struct RpcClient {
    http_url: String,
    pool: Address,
    oracle: Address,
    /// asset → (aToken, variableDebtToken), resolved once per reserve.
    reserve_tokens: DashMap<Address, (Address, Address)>,
}

impl RpcClient {
    pub async fn connect(http_url: &str, pool: Address, oracle: Address) -> Result<Self> {
        let provider = ProviderBuilder::new().connect_http(http_url.parse()?);
        let block = provider
            .get_block_number()
            .await
            .context("RPC connection check failed")?;
        info!(block = block, pool = %pool, "Chain RPC connected");

        Ok(Self {
            http_url: http_url.to_string(),
            pool,
            oracle,
            reserve_tokens: DashMap::new(),
        })
    }

    /// Resolve and memoize the reserve's derived token addresses.
    async fn reserve_tokens(&self, asset: Address) -> Result<(Address, Address)> {
        if let Some(tokens) = self.reserve_tokens.get(&asset) {
            return Ok(*tokens);
        }

        let provider = ProviderBuilder::new().connect_http(self.http_url.parse()?);
        let pool = IPool::new(self.pool, &provider);
        let data = pool
            .getReserveData(asset)
            .call()
            .await
            .context("getReserveData failed")?
            ._0;

        let tokens = (data.aTokenAddress, data.variableDebtTokenAddress);
        debug!(
            asset = %asset,
            atoken = %tokens.0,
            variable_debt_token = %tokens.1,
            "Resolved reserve tokens"
        );
        self.reserve_tokens.insert(asset, tokens);
        Ok(tokens)
    }

    async fn erc20_balance(&self, token: Address, user: Address) -> Result<U256> {
        let provider = ProviderBuilder::new().connect_http(self.http_url.parse()?);
        let erc20 = IERC20::new(token, &provider);
        Ok(erc20.balanceOf(user).call().await?._0)
    }
}

#[async_trait]
impl ChainClient for RpcClient {
    async fn block_number(&self) -> Result<u64> {
        let provider = ProviderBuilder::new().connect_http(self.http_url.parse()?);
        Ok(provider.get_block_number().await?)
    }

    async fn fee_data(&self) -> Result<FeeData> {
        let provider = ProviderBuilder::new().connect_http(self.http_url.parse()?);
        let base_fee = provider.get_gas_price().await?;
        let priority_fee = provider
            .get_max_priority_fee_per_gas()
            .await
            .unwrap_or(1_000_000_000);
        Ok(FeeData {
            base_fee,
            priority_fee,
        })
    }

    async fn supplied_balance(&self, asset: Address, user: Address) -> Result<U256> {
        let (atoken, _) = self.reserve_tokens(asset).await?;
        self.erc20_balance(atoken, user).await
    }

    async fn borrowed_balance(&self, asset: Address, user: Address) -> Result<U256> {
        let (_, variable_debt) = self.reserve_tokens(asset).await?;
        self.erc20_balance(variable_debt, user).await
    }

    async fn token_decimals(&self, asset: Address) -> Result<u8> {
        let provider = ProviderBuilder::new().connect_http(self.http_url.parse()?);
        let erc20 = IERC20::new(asset, &provider);
        Ok(erc20.decimals().call().await?._0)
    }

    async fn oracle_price_usd(&self, asset: Address) -> Result<f64> {
        let provider = ProviderBuilder::new().connect_http(self.http_url.parse()?);
        let oracle = IPriceOracle::new(self.oracle, &provider);
        let raw = oracle.getAssetPrice(asset).call().await?._0;
        let price = raw.to_string().parse::<f64>()? / BASE_CURRENCY_DECIMALS;
        anyhow::ensure!(price > 0.0, "oracle returned non-positive price for {asset}");
        Ok(price)
    }

    async fn account_data(&self, user: Address) -> Result<AccountData> {
        let provider = ProviderBuilder::new().connect_http(self.http_url.parse()?);
        let pool = IPool::new(self.pool, &provider);
        let data = pool.getUserAccountData(user).call().await?;

        let total_debt_usd =
            data.totalDebtBase.to_string().parse::<f64>()? / BASE_CURRENCY_DECIMALS;
        let health_factor = if data.totalDebtBase.is_zero() {
            f64::INFINITY
        } else {
            data.healthFactor.to_string().parse::<f64>()? / WAD_F64
        };

        Ok(AccountData {
            total_collateral_usd: data.totalCollateralBase.to_string().parse::<f64>()?
                / BASE_CURRENCY_DECIMALS,
            total_debt_usd,
            health_factor,
        })
    }
}
