//! Wide-integer arithmetic for balance and liquidation calculations.
//!
//! Token amounts stay as `U256` until the final scaled division; health
//! factors and USD values are 64-bit floats after scaling. The ceiling
//! division used for the required-collateral bound is exact.

use alloy::primitives::U256;

/// Feed prices are carried through integer math at 8 decimals.
pub const PRICE_DECIMALS: u32 = 8;

/// Basis points denominator (10000 = 100%).
pub const BPS_DENOMINATOR: u64 = 10_000;

/// Pre-computed powers of 10 for fast decimal scaling.
const POW10: [u128; 39] = [
    1,
    10,
    100,
    1_000,
    10_000,
    100_000,
    1_000_000,
    10_000_000,
    100_000_000,
    1_000_000_000,
    10_000_000_000,
    100_000_000_000,
    1_000_000_000_000,
    10_000_000_000_000,
    100_000_000_000_000,
    1_000_000_000_000_000,
    10_000_000_000_000_000,
    100_000_000_000_000_000,
    1_000_000_000_000_000_000,
    10_000_000_000_000_000_000,
    100_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000_000_000_000,
    1_000_000_000_000_000_000_000_000_000_000_000_000,
    10_000_000_000_000_000_000_000_000_000_000_000_000,
    100_000_000_000_000_000_000_000_000_000_000_000_000,
];

/// Fast power of 10 lookup (exact up to 10^38).
#[inline(always)]
pub fn pow10(exp: u8) -> U256 {
    if (exp as usize) < POW10.len() {
        U256::from(POW10[exp as usize])
    } else {
        U256::from(10u64).pow(U256::from(exp))
    }
}

/// Convert a token amount in base units to a float of whole tokens.
///
/// Only for the final ratio and for USD display values; intermediate
/// quantities stay in `U256`.
#[inline(always)]
pub fn scaled_to_f64(amount: U256, decimals: u8) -> f64 {
    if amount.is_zero() {
        return 0.0;
    }
    if amount <= U256::from(u128::MAX) {
        let value: u128 = amount.to();
        return value as f64 / 10f64.powi(decimals as i32);
    }
    // Wider than u128: fold the limbs.
    let limbs = amount.as_limbs();
    let mut value = 0.0f64;
    for (i, limb) in limbs.iter().enumerate() {
        value += *limb as f64 * 2f64.powi(64 * i as i32);
    }
    value / 10f64.powi(decimals as i32)
}

/// A positive USD price as an 8-decimal fixed-point integer.
#[inline(always)]
pub fn price_to_fixed(price_usd: f64) -> U256 {
    if price_usd <= 0.0 {
        return U256::ZERO;
    }
    U256::from((price_usd * 10f64.powi(PRICE_DECIMALS as i32)).round() as u128)
}

/// Exact ceiling of `a * b / denominator`.
#[inline(always)]
pub fn ceil_mul_div(a: U256, b: U256, denominator: U256) -> U256 {
    if denominator.is_zero() {
        return U256::MAX;
    }
    let numerator = a * b;
    (numerator + denominator - U256::from(1u64)) / denominator
}

/// Reduce a value by basis points: `value * (10000 - bps) / 10000`.
#[inline(always)]
pub fn apply_bps_down(value: U256, bps: u16) -> U256 {
    let keep = U256::from(BPS_DENOMINATOR.saturating_sub(bps as u64));
    value * keep / U256::from(BPS_DENOMINATOR)
}

/// USD value of a token amount at a float price.
#[inline(always)]
pub fn amount_usd(amount: U256, price_usd: f64, decimals: u8) -> f64 {
    scaled_to_f64(amount, decimals) * price_usd
}
