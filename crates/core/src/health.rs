//! Off-chain health factor computation and liquidation profit estimation.
//!
//! HF is computed from cached balances × latest cached feed prices:
//!
//! ```text
//! total_debt_usd      = Σ debt_amount  × price / 10^decimals
//! weighted_collateral = Σ coll_amount  × price × threshold / 10^decimals
//! hf                  = weighted_collateral / total_debt_usd   (+inf when debt = 0)
//! ```
//!
//! An asset with no cached price contributes zero to its side; the omission
//! is logged but never fails the computation. The decisive comparison is the
//! on-chain oracle HF at execute time, so float rounding here is benign.

use alloy::primitives::{Address, U256};
use tracing::debug;

use crate::assets::AssetCatalog;
use crate::borrower::Borrower;
use crate::math;
use crate::prices::PriceAggregator;

/// Close factor: a single liquidation may cover half the debt.
const CLOSE_FACTOR_DIVISOR: u64 = 2;

/// A chosen (debt, collateral) pair with its economics.
#[derive(Debug, Clone)]
pub struct LiquidationPlan {
    pub debt_asset: Address,
    pub collateral_asset: Address,
    /// Debt to repay (close factor already applied).
    pub debt_amount: U256,
    pub debt_value_usd: f64,
    /// Collateral the liquidator must receive, bonus included. Exact
    /// integer ceiling in the collateral asset's base units.
    pub required_collateral: U256,
    /// Expected profit before gas, in USD.
    pub profit_usd: f64,
}

/// Predicted health factor from cached prices.
pub fn health_factor(
    borrower: &Borrower,
    prices: &PriceAggregator,
    catalog: &AssetCatalog,
) -> f64 {
    let mut total_debt_usd = 0.0;
    for (asset, amount) in borrower.debt.iter() {
        match side_value(asset, *amount, prices, catalog) {
            Some(value) => total_debt_usd += value,
            None => debug!(borrower = %borrower.address, asset = %asset, "Debt asset omitted from HF"),
        }
    }

    let mut weighted_collateral = 0.0;
    for (asset, amount) in borrower.collateral.iter() {
        match side_value(asset, *amount, prices, catalog) {
            Some(value) => {
                weighted_collateral += value * catalog.liquidation_threshold(asset);
            }
            None => {
                debug!(borrower = %borrower.address, asset = %asset, "Collateral asset omitted from HF")
            }
        }
    }

    if total_debt_usd == 0.0 {
        f64::INFINITY
    } else {
        weighted_collateral / total_debt_usd
    }
}

/// USD value of one balance, or `None` when price or decimals are unknown.
fn side_value(
    asset: &Address,
    amount: U256,
    prices: &PriceAggregator,
    catalog: &AssetCatalog,
) -> Option<f64> {
    let price = prices.price(asset)?;
    let decimals = catalog.decimals(asset)?;
    Some(math::amount_usd(amount, price, decimals))
}

/// Estimate the economics of liquidating one (debt, collateral) pair.
///
/// Returns `None` unless the borrower holds both assets and enough
/// collateral to cover the bonus-inflated repayment.
pub fn estimate_liquidation(
    borrower: &Borrower,
    debt_asset: Address,
    collateral_asset: Address,
    prices: &PriceAggregator,
    catalog: &AssetCatalog,
    bonus_bps: u16,
) -> Option<LiquidationPlan> {
    let debt_balance = borrower.debt_of(&debt_asset)?;
    let collateral_balance = borrower.collateral_of(&collateral_asset)?;
    if debt_balance.is_zero() || collateral_balance.is_zero() {
        return None;
    }

    let debt_price = prices.price(&debt_asset)?;
    let collateral_price = prices.price(&collateral_asset)?;
    let debt_decimals = catalog.decimals(&debt_asset)?;
    let collateral_decimals = catalog.decimals(&collateral_asset)?;

    let debt_amount = debt_balance / U256::from(CLOSE_FACTOR_DIVISOR);
    if debt_amount.is_zero() {
        return None;
    }

    let debt_value_usd = math::amount_usd(debt_amount, debt_price, debt_decimals);
    let bonus = bonus_bps as f64 / math::BPS_DENOMINATOR as f64;

    // required = ceil(debt_amount × p_debt × (1 + bonus) × 10^c_dec
    //                 / (p_coll × 10^d_dec)), carried in integers so the
    // collateral sufficiency bound is exact.
    let debt_price_fixed = math::price_to_fixed(debt_price);
    let collateral_price_fixed = math::price_to_fixed(collateral_price);
    if collateral_price_fixed.is_zero() {
        return None;
    }

    let numerator_scale = debt_price_fixed
        * U256::from(math::BPS_DENOMINATOR + bonus_bps as u64)
        * math::pow10(collateral_decimals);
    let denominator = collateral_price_fixed
        * U256::from(math::BPS_DENOMINATOR)
        * math::pow10(debt_decimals);
    let required_collateral = math::ceil_mul_div(debt_amount, numerator_scale, denominator);

    if required_collateral > collateral_balance {
        return None;
    }

    Some(LiquidationPlan {
        debt_asset,
        collateral_asset,
        debt_amount,
        debt_value_usd,
        required_collateral,
        profit_usd: debt_value_usd * bonus,
    })
}

/// Best plan over the configured (debt × collateral) cross product,
/// maximizing expected profit.
pub fn best_liquidation(
    borrower: &Borrower,
    debt_assets: &[Address],
    collateral_assets: &[Address],
    prices: &PriceAggregator,
    catalog: &AssetCatalog,
    bonus_bps: u16,
) -> Option<LiquidationPlan> {
    let mut best: Option<LiquidationPlan> = None;
    for debt_asset in debt_assets {
        for collateral_asset in collateral_assets {
            let Some(plan) = estimate_liquidation(
                borrower,
                *debt_asset,
                *collateral_asset,
                prices,
                catalog,
                bonus_bps,
            ) else {
                continue;
            };
            if best
                .as_ref()
                .map(|b| plan.profit_usd > b.profit_usd)
                .unwrap_or(true)
            {
                best = Some(plan);
            }
        }
    }
    best
}

/// Total debt in USD at on-chain oracle prices; used by the min-debt gates.
pub async fn oracle_debt_usd(
    borrower: &Borrower,
    chain: &dyn sentinel_chain::ChainClient,
    catalog: &AssetCatalog,
) -> anyhow::Result<f64> {
    let mut total = 0.0;
    for (asset, amount) in borrower.debt.iter() {
        if amount.is_zero() {
            continue;
        }
        let price = chain.oracle_price_usd(*asset).await?;
        let decimals = catalog.resolve_decimals(chain, *asset).await?;
        total += math::amount_usd(*amount, price, decimals);
    }
    Ok(total)
}
