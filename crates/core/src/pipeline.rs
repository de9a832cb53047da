//! Prepare / execute pipeline.
//!
//! `prepare` builds and simulates a liquidation with the exact payload that
//! would later be broadcast, then caches it on the borrower record.
//! `execute` re-validates every gate in order — cheap predicates before
//! expensive RPC, the on-chain oracle HF as the final authority — and
//! dispatches the cached transaction.
//!
//! Both run under the borrower's advisory lock; the lock guard releases on
//! every exit path. The decision envelope is [`Outcome`]: callers log and
//! move on for everything except `Fatal`.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use alloy::primitives::{Address, U256};
use tracing::{debug, info, instrument, warn};

use sentinel_api::{AuditEvent, QuoteRequest};
use sentinel_chain::{
    encode_flash_execute, encode_liquidation_call, CallSpec, FeeData,
};

use crate::borrower::{BorrowerState, CachedTx, SkipReason, TxMode};
use crate::engine::EngineContext;
use crate::health::{self, LiquidationPlan};

/// Gas-limit headroom over the estimate (20%).
const GAS_LIMIT_BUFFER_DIVISOR: u64 = 5;

/// Decision envelope carried out of prepare and execute.
pub enum Outcome {
    /// The operation ran to completion.
    Done,
    /// A gate declined the operation; nothing dispatched.
    Skip(SkipReason),
    /// A single RPC-path failure; retried on the next trigger.
    Transient(anyhow::Error),
    /// Unrecoverable; the caller escalates.
    Fatal(anyhow::Error),
}

impl Outcome {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            Self::Skip(reason) => Some(*reason),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Done => write!(f, "done"),
            Self::Skip(reason) => write!(f, "skip({reason})"),
            Self::Transient(e) => write!(f, "transient({e})"),
            Self::Fatal(e) => write!(f, "fatal({e})"),
        }
    }
}

/// RAII slot in the global execution counter.
struct ExecutionPermit<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> ExecutionPermit<'a> {
    /// Claim a slot unless the cap is already reached.
    fn try_acquire(counter: &'a AtomicUsize, max: usize) -> Option<Self> {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()
            .map(|_| Self { counter })
    }
}

impl Drop for ExecutionPermit<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl EngineContext {
    /// Prepare a cached liquidation for a CRITICAL borrower.
    ///
    /// Non-blocking on the advisory lock: a duplicate schedule returns
    /// immediately with no side effect.
    #[instrument(skip(self), fields(borrower = %address))]
    pub async fn prepare(&self, address: Address) -> Outcome {
        let Some(_guard) = self.registry.try_lock(address) else {
            return Outcome::Skip(SkipReason::LockHeld);
        };
        self.prepare_locked(address).await
        // _guard drops here, releasing the lock on every path
    }

    /// Prepare body; requires the caller to hold the borrower lock.
    async fn prepare_locked(&self, address: Address) -> Outcome {
        let cfg = self.config.current();
        let Some(borrower) = self.registry.get(&address) else {
            return Outcome::Skip(SkipReason::NotInWatchSet);
        };
        if !borrower.hydrated {
            return Outcome::Skip(SkipReason::NotInWatchSet);
        }
        // Re-preparation from execute arrives in LIQUIDATABLE.
        if !matches!(
            borrower.state,
            BorrowerState::Critical | BorrowerState::Liquidatable
        ) {
            return Outcome::Skip(SkipReason::NotLiquidatable);
        }

        match health::oracle_debt_usd(&borrower, self.chain.as_ref(), &self.catalog).await {
            Ok(debt_usd) if debt_usd < cfg.min_debt_usd => {
                self.registry.record_skip(&address, SkipReason::BelowMinDebt);
                return Outcome::Skip(SkipReason::BelowMinDebt);
            }
            Ok(_) => {}
            Err(e) => return Outcome::Transient(e),
        }

        // Stale or silent feeds abort preparation quietly; no failure record.
        if self.prices.is_stale() || !self.prices.any_connected() {
            debug!(borrower = %address, "Feeds stale or disconnected, prepare aborted");
            return Outcome::Skip(SkipReason::StaleFeed);
        }

        let Some(plan) = health::best_liquidation(
            &borrower,
            &self.debt_targets(),
            &self.collateral_targets(),
            &self.prices,
            &self.catalog,
            cfg.liquidation_bonus_bps,
        ) else {
            return Outcome::Skip(SkipReason::NoViablePair);
        };

        let (call, mode) = match self.build_call(address, &plan).await {
            Ok(built) => built,
            Err(e) => return Outcome::Transient(e),
        };

        // Simulate with the exact payload that will later be broadcast.
        if let Err(e) = self.executor.simulate(&call).await {
            warn!(borrower = %address, error = %e, "Simulation rejected");
            self.registry
                .record_skip(&address, SkipReason::SimulationFailed);
            return Outcome::Skip(SkipReason::SimulationFailed);
        }

        let gas_estimate = match self.executor.estimate_gas(&call).await {
            Ok(gas) => gas,
            Err(e) => return Outcome::Transient(e),
        };
        let fees = self.fees.load();
        let Some(gas_cost_usd) = self.gas_cost_usd(gas_estimate, &fees) else {
            return Outcome::Transient(anyhow::anyhow!(
                "no cached price for the native asset, cannot bound gas cost"
            ));
        };
        if gas_cost_usd > cfg.max_gas_usd {
            warn!(
                borrower = %address,
                gas_cost_usd = gas_cost_usd,
                max_gas_usd = cfg.max_gas_usd,
                "Gas guard triggered"
            );
            self.registry.record_skip(&address, SkipReason::GasGuard);
            return Outcome::Skip(SkipReason::GasGuard);
        }

        if plan.profit_usd < cfg.min_profit_usd {
            debug!(
                borrower = %address,
                profit_usd = plan.profit_usd,
                min_profit_usd = cfg.min_profit_usd,
                "Profit floor triggered"
            );
            self.registry.record_skip(&address, SkipReason::ProfitFloor);
            return Outcome::Skip(SkipReason::ProfitFloor);
        }

        let gas_limit = gas_estimate + gas_estimate / GAS_LIMIT_BUFFER_DIVISOR;
        let prepared_block = self.latest_block.load(Ordering::Relaxed);
        let cached = CachedTx {
            target: call.to,
            calldata: call.data,
            value: call.value,
            gas_limit,
            max_fee_per_gas: fees.max_fee_per_gas(2.0, u128::MAX),
            priority_fee_per_gas: fees.priority_fee,
            expected_profit_usd: plan.profit_usd,
            gas_cost_usd,
            prepared_at: Instant::now(),
            mode,
            debt_asset: plan.debt_asset,
            collateral_asset: plan.collateral_asset,
            debt_amount: plan.debt_amount,
        };
        self.registry.store_cached_tx(&address, cached, prepared_block);

        info!(
            borrower = %address,
            debt_asset = %plan.debt_asset,
            collateral_asset = %plan.collateral_asset,
            profit_usd = plan.profit_usd,
            gas_cost_usd = gas_cost_usd,
            block = prepared_block,
            "Liquidation prepared"
        );
        Outcome::Done
    }

    /// Execute the cached liquidation for a LIQUIDATABLE borrower.
    #[instrument(skip(self), fields(borrower = %address))]
    pub async fn execute(&self, address: Address) -> Outcome {
        let Some(_guard) = self.registry.try_lock(address) else {
            return Outcome::Skip(SkipReason::LockHeld);
        };
        self.execute_locked(address).await
    }

    async fn execute_locked(&self, address: Address) -> Outcome {
        let cfg = self.config.current();
        let Some(borrower) = self.registry.get(&address) else {
            return Outcome::Skip(SkipReason::NotInWatchSet);
        };
        if borrower.state != BorrowerState::Liquidatable {
            return Outcome::Skip(SkipReason::NotLiquidatable);
        }

        // 1. Minimum debt at oracle prices.
        match health::oracle_debt_usd(&borrower, self.chain.as_ref(), &self.catalog).await {
            Ok(debt_usd) if debt_usd < cfg.min_debt_usd => {
                self.registry.record_skip(&address, SkipReason::BelowMinDebt);
                return Outcome::Skip(SkipReason::BelowMinDebt);
            }
            Ok(_) => {}
            Err(e) => return Outcome::Transient(e),
        }

        // 2. Fail-closed price policy: at least one live source.
        if !self.prices.can_execute() {
            warn!(borrower = %address, "Price feed policy denies execution");
            self.registry
                .record_skip(&address, SkipReason::PriceFeedPolicy);
            return Outcome::Skip(SkipReason::PriceFeedPolicy);
        }

        // 3. No connected source may be stale.
        if self.prices.is_stale() {
            warn!(borrower = %address, "Stale price feed, execution denied");
            return Outcome::Skip(SkipReason::StaleFeed);
        }

        // 4. Global concurrency bound.
        let Some(_permit) =
            ExecutionPermit::try_acquire(&self.active_executions, cfg.max_concurrent_tx)
        else {
            debug!(borrower = %address, "Execution deferred, concurrency cap reached");
            return Outcome::Skip(SkipReason::Deferred);
        };

        // 5. A cached transaction must exist; prepare in place otherwise.
        if borrower.cached_tx.is_none() {
            debug!(borrower = %address, "No cached transaction, preparing");
            return self.prepare_locked(address).await;
        }

        // 6. TTL refresh: invalidate and re-prepare a stale cache.
        let current_block = self.latest_block.load(Ordering::Relaxed);
        if self
            .registry
            .is_cache_stale(&address, current_block, cfg.tx_cache_ttl_blocks)
        {
            debug!(borrower = %address, block = current_block, "Cached transaction stale, re-preparing");
            self.registry.invalidate_cache(&address, "ttl_expired");
            let outcome = self.prepare_locked(address).await;
            if !outcome.is_done() {
                return outcome;
            }
        }

        let Some(cached) = self.registry.get(&address).and_then(|b| b.cached_tx) else {
            return Outcome::Skip(SkipReason::Unknown);
        };

        // 7. The on-chain oracle HF is the final authority.
        let oracle_hf = match self.chain.account_data(address).await {
            Ok(data) => data.health_factor,
            Err(e) => return Outcome::Transient(e),
        };
        self.registry
            .update_hf(&address, &self.bands(), borrower.predicted_hf, Some(oracle_hf));
        if oracle_hf >= 1.0 || oracle_hf > cfg.hf_liquidatable {
            info!(
                borrower = %address,
                oracle_hf = oracle_hf,
                "Oracle disagrees with prediction, not liquidatable"
            );
            self.registry
                .record_skip(&address, SkipReason::OracleNotLiquidatable);
            return Outcome::Skip(SkipReason::OracleNotLiquidatable);
        }

        // 8. Net profit after gas.
        let net_profit = cached.expected_profit_usd - cached.gas_cost_usd;
        if net_profit < cfg.min_profit_usd {
            self.registry.record_skip(&address, SkipReason::ProfitFloor);
            return Outcome::Skip(SkipReason::ProfitFloor);
        }

        // 9. Re-check the raw bounds against current limits.
        if cached.expected_profit_usd < cfg.min_profit_usd {
            self.registry.record_skip(&address, SkipReason::ProfitFloor);
            return Outcome::Skip(SkipReason::ProfitFloor);
        }
        if cached.gas_cost_usd > cfg.max_gas_usd {
            self.registry.record_skip(&address, SkipReason::GasGuard);
            return Outcome::Skip(SkipReason::GasGuard);
        }

        // 10. Kill-switch and dry-run.
        if !cfg.enable_execution || cfg.dry_run {
            info!(
                borrower = %address,
                target = %cached.target,
                expected_profit_usd = cached.expected_profit_usd,
                gas_cost_usd = cached.gas_cost_usd,
                net_profit_usd = net_profit,
                flash = matches!(cached.mode, TxMode::Flash { .. }),
                "Dry run: would dispatch liquidation"
            );
            return Outcome::Skip(SkipReason::ExecutionDisabled);
        }

        // 11. Dispatch and await confirmation; the permit releases on every
        // path out of this frame.
        self.registry.record_execution_attempt(&address);
        let call = CallSpec {
            to: cached.target,
            data: cached.calldata.clone(),
            value: cached.value,
        };
        let fees = FeeData {
            base_fee: cached.max_fee_per_gas.saturating_sub(cached.priority_fee_per_gas) / 2,
            priority_fee: cached.priority_fee_per_gas,
        };

        info!(
            borrower = %address,
            target = %cached.target,
            net_profit_usd = net_profit,
            "Dispatching liquidation"
        );
        match self.executor.dispatch(&call, cached.gas_limit, fees).await {
            Ok(tx_hash) => {
                info!(borrower = %address, tx_hash = %tx_hash, "Liquidation confirmed");
                self.registry.invalidate_cache(&address, "executed");
                self.audit(
                    AuditEvent::new("liquidation_executed", format!("{tx_hash}"))
                        .with_borrower(address),
                );
                Outcome::Done
            }
            Err(e) => {
                // The cache stays: the next block re-prepares via TTL or the
                // next price update clears it.
                warn!(borrower = %address, error = %e, "Broadcast failed");
                Outcome::Transient(e)
            }
        }
    }

    /// Gas cost in USD at the native asset's cached feed price.
    fn gas_cost_usd(&self, gas: u64, fees: &FeeData) -> Option<f64> {
        let native = self.native_asset()?;
        let price = self.prices.price(&native)?;
        let wei = gas as u128 * fees.effective_gas_price();
        Some(wei as f64 / 1e18 * price)
    }

    /// Encode the outbound call for a plan, flash mode when a flash
    /// liquidator is configured, direct pool call otherwise.
    async fn build_call(
        &self,
        address: Address,
        plan: &LiquidationPlan,
    ) -> anyhow::Result<(CallSpec, TxMode)> {
        let cfg = self.config.current();

        if let Some(flash) = cfg.flash_liquidator_address {
            let quote = self
                .quoter
                .quote(QuoteRequest {
                    sell_asset: plan.collateral_asset,
                    buy_asset: plan.debt_asset,
                    amount_in: plan.required_collateral,
                    recipient: flash,
                    slippage_bps: cfg.max_slippage_bps,
                })
                .await?;

            let data = encode_flash_execute(
                address,
                plan.debt_asset,
                plan.collateral_asset,
                plan.debt_amount,
                quote.payload.clone(),
            );
            Ok((
                CallSpec {
                    to: flash,
                    data,
                    value: U256::ZERO,
                },
                TxMode::Flash {
                    swap_payload: quote.payload,
                    min_swap_out: quote.min_out,
                },
            ))
        } else {
            let data = encode_liquidation_call(
                plan.collateral_asset,
                plan.debt_asset,
                address,
                plan.debt_amount,
                false,
            );
            Ok((
                CallSpec {
                    to: cfg.pool_address,
                    data,
                    value: U256::ZERO,
                },
                TxMode::Direct,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math;
    use crate::testutil::{test_context, FeedScript, Harness, USDC, WETH};
    use smallvec::smallvec;

    /// 10 WETH collateral / 10k USDC debt, hydrated, classified by `hf`.
    fn tracked_borrower(harness: &Harness, hf: f64) -> Address {
        let addr = Address::repeat_byte(1);
        harness.ctx.registry.upsert(addr, BorrowerState::Safe);
        harness.ctx.registry.set_balances(
            &addr,
            smallvec![(WETH, U256::from(10u64) * math::pow10(18))],
            smallvec![(USDC, U256::from(10_000u64) * math::pow10(6))],
        );
        harness.ctx.registry.mark_hydrated(&addr);
        harness
            .ctx
            .registry
            .update_hf(&addr, &harness.ctx.bands(), hf, None);
        addr
    }

    #[tokio::test]
    async fn test_prepare_caches_flash_transaction() {
        let harness = test_context(FeedScript::bothlive());
        let addr = tracked_borrower(&harness, 1.02);

        let outcome = harness.ctx.prepare(addr).await;
        assert!(outcome.is_done(), "outcome: {outcome}");

        let borrower = harness.ctx.registry.get(&addr).unwrap();
        let cached = borrower.cached_tx.expect("cached tx");
        assert!(matches!(cached.mode, TxMode::Flash { .. }));
        assert!((cached.expected_profit_usd - 250.0).abs() < 1e-6);
        assert_eq!(cached.debt_asset, USDC);
        assert_eq!(cached.collateral_asset, WETH);
        assert_eq!(harness.executor.simulations(), 1);
        assert!(!harness.ctx.registry.is_locked(&addr));
    }

    #[tokio::test]
    async fn test_prepare_direct_mode_without_flash_host() {
        let harness = test_context(FeedScript::bothlive().without_flash());
        let addr = tracked_borrower(&harness, 1.02);

        let outcome = harness.ctx.prepare(addr).await;
        assert!(outcome.is_done(), "outcome: {outcome}");

        let cached = harness.ctx.registry.get(&addr).unwrap().cached_tx.unwrap();
        assert!(matches!(cached.mode, TxMode::Direct));
        assert_eq!(cached.target, harness.ctx.config.current().pool_address);
        // direct mode never consults the quoter
        assert_eq!(harness.quoter.calls(), 0);
    }

    #[tokio::test]
    async fn test_prepare_simulation_rejected() {
        let harness = test_context(FeedScript::bothlive());
        let addr = tracked_borrower(&harness, 1.02);
        harness.executor.fail_simulation(true);

        let outcome = harness.ctx.prepare(addr).await;
        assert_eq!(outcome.skip_reason(), Some(SkipReason::SimulationFailed));

        let borrower = harness.ctx.registry.get(&addr).unwrap();
        assert!(borrower.cached_tx.is_none());
        assert_eq!(borrower.last_skip_reason, Some(SkipReason::SimulationFailed));
    }

    #[tokio::test]
    async fn test_prepare_profit_floor() {
        let harness = test_context(FeedScript::bothlive().with_min_profit(500.0));
        let addr = tracked_borrower(&harness, 1.02);

        let outcome = harness.ctx.prepare(addr).await;
        assert_eq!(outcome.skip_reason(), Some(SkipReason::ProfitFloor));
        let borrower = harness.ctx.registry.get(&addr).unwrap();
        assert!(borrower.cached_tx.is_none());
        assert_eq!(borrower.last_skip_reason, Some(SkipReason::ProfitFloor));
    }

    #[tokio::test]
    async fn test_prepare_gas_guard() {
        let harness = test_context(FeedScript::bothlive());
        let addr = tracked_borrower(&harness, 1.02);
        // 400 gwei effective over 500k gas at $2000 is far past $20
        harness.ctx.fees.update(FeeData {
            base_fee: 400_000_000_000,
            priority_fee: 10_000_000_000,
        });

        let outcome = harness.ctx.prepare(addr).await;
        assert_eq!(outcome.skip_reason(), Some(SkipReason::GasGuard));
        assert_eq!(
            harness.ctx.registry.get(&addr).unwrap().last_skip_reason,
            Some(SkipReason::GasGuard)
        );
    }

    #[tokio::test]
    async fn test_prepare_below_min_debt_recorded() {
        let harness = test_context(FeedScript::bothlive());
        let addr = Address::repeat_byte(1);
        harness.ctx.registry.upsert(addr, BorrowerState::Safe);
        harness.ctx.registry.set_balances(
            &addr,
            smallvec![(WETH, math::pow10(18))],
            smallvec![(USDC, U256::from(10u64) * math::pow10(6))],
        );
        harness.ctx.registry.mark_hydrated(&addr);
        harness
            .ctx
            .registry
            .update_hf(&addr, &harness.ctx.bands(), 1.02, None);

        let outcome = harness.ctx.prepare(addr).await;
        assert_eq!(outcome.skip_reason(), Some(SkipReason::BelowMinDebt));
        // below-min-debt outside the admission path is a skip, not a removal
        assert!(harness.ctx.registry.contains(&addr));
    }

    #[tokio::test]
    async fn test_prepare_mutex_exclusion() {
        let harness = test_context(FeedScript::bothlive());
        let addr = tracked_borrower(&harness, 1.02);
        harness.executor.delay_simulation_ms(20);

        let (first, second) = tokio::join!(
            harness.ctx.prepare(addr),
            harness.ctx.prepare(addr)
        );

        // exactly one acquired the lock; the other returned immediately
        let reasons = [first.skip_reason(), second.skip_reason()];
        assert!(reasons.contains(&Some(SkipReason::LockHeld)));
        assert_eq!(
            harness.executor.simulations(),
            1,
            "loser must have no side effects"
        );
        assert!(!harness.ctx.registry.is_locked(&addr), "no lock leaked");
    }

    #[tokio::test(start_paused = true)]
    async fn test_prepare_aborts_on_stale_feed() {
        let harness = test_context(FeedScript::bothlive());
        let addr = tracked_borrower(&harness, 1.02);

        // connected sources fall silent past the staleness window
        tokio::time::sleep(std::time::Duration::from_millis(10_000)).await;
        assert!(harness.ctx.prices.is_stale());

        let outcome = harness.ctx.prepare(addr).await;
        assert_eq!(outcome.skip_reason(), Some(SkipReason::StaleFeed));
        // quiet abort: no failure record
        assert_eq!(harness.ctx.registry.get(&addr).unwrap().last_skip_reason, None);
    }

    #[tokio::test]
    async fn test_execute_fail_closed_policy_gate() {
        let harness = test_context(FeedScript::silent());
        let addr = tracked_borrower(&harness, 0.95);

        let outcome = harness.ctx.execute(addr).await;
        assert_eq!(outcome.skip_reason(), Some(SkipReason::PriceFeedPolicy));
        // no outbound call of any kind was issued
        assert_eq!(harness.executor.simulations(), 0);
        assert_eq!(harness.executor.dispatches(), 0);
        assert!(!harness.ctx.registry.is_locked(&addr));
    }

    #[tokio::test]
    async fn test_execute_requires_liquidatable_state() {
        let harness = test_context(FeedScript::bothlive());
        let addr = tracked_borrower(&harness, 1.02); // CRITICAL

        let outcome = harness.ctx.execute(addr).await;
        assert_eq!(outcome.skip_reason(), Some(SkipReason::NotLiquidatable));
    }

    #[tokio::test]
    async fn test_execute_prepares_when_cache_missing() {
        let harness = test_context(FeedScript::bothlive());
        let addr = tracked_borrower(&harness, 0.95);

        let outcome = harness.ctx.execute(addr).await;
        // prepare ran in place and cached the transaction
        assert!(outcome.is_done(), "outcome: {outcome}");
        assert!(harness.ctx.registry.get(&addr).unwrap().cached_tx.is_some());
        assert_eq!(harness.executor.dispatches(), 0);
    }

    #[tokio::test]
    async fn test_execute_refreshes_ttl_stale_cache() {
        let harness = test_context(FeedScript::bothlive());
        let addr = tracked_borrower(&harness, 0.95);

        // prepare at block 1000, then advance past the 5-block TTL
        harness.ctx.latest_block.store(1_000, Ordering::Relaxed);
        assert!(harness.ctx.prepare(addr).await.is_done());
        harness.ctx.latest_block.store(1_006, Ordering::Relaxed);
        harness.chain.set_account_hf(addr, 0.95);

        let outcome = harness.ctx.execute(addr).await;
        // dry-run config: re-prepared then stopped at the kill switch
        assert_eq!(outcome.skip_reason(), Some(SkipReason::ExecutionDisabled));
        let borrower = harness.ctx.registry.get(&addr).unwrap();
        assert_eq!(borrower.prepared_block, Some(1_006));
        assert_eq!(harness.executor.simulations(), 2);
    }

    #[tokio::test]
    async fn test_execute_cache_fresh_at_ttl_boundary() {
        let harness = test_context(FeedScript::bothlive());
        let addr = tracked_borrower(&harness, 0.95);

        harness.ctx.latest_block.store(1_000, Ordering::Relaxed);
        assert!(harness.ctx.prepare(addr).await.is_done());
        harness.ctx.latest_block.store(1_005, Ordering::Relaxed);
        harness.chain.set_account_hf(addr, 0.95);

        let outcome = harness.ctx.execute(addr).await;
        assert_eq!(outcome.skip_reason(), Some(SkipReason::ExecutionDisabled));
        // still the original preparation
        let borrower = harness.ctx.registry.get(&addr).unwrap();
        assert_eq!(borrower.prepared_block, Some(1_000));
        assert_eq!(harness.executor.simulations(), 1);
    }

    #[tokio::test]
    async fn test_execute_oracle_is_final_authority() {
        let harness = test_context(FeedScript::bothlive());
        let addr = tracked_borrower(&harness, 0.95);
        assert!(harness.ctx.prepare(addr).await.is_done());
        // off-chain prediction says liquidatable, the oracle disagrees
        harness.chain.set_account_hf(addr, 1.05);

        let outcome = harness.ctx.execute(addr).await;
        assert_eq!(outcome.skip_reason(), Some(SkipReason::OracleNotLiquidatable));
        let borrower = harness.ctx.registry.get(&addr).unwrap();
        assert_eq!(borrower.last_skip_reason, Some(SkipReason::OracleNotLiquidatable));
        assert!((borrower.oracle_hf - 1.05).abs() < 1e-9);
        assert_eq!(harness.executor.dispatches(), 0);
    }

    #[tokio::test]
    async fn test_execute_dispatches_when_armed() {
        let harness = test_context(FeedScript::bothlive().armed());
        let addr = tracked_borrower(&harness, 0.95);
        assert!(harness.ctx.prepare(addr).await.is_done());
        harness.chain.set_account_hf(addr, 0.95);

        let outcome = harness.ctx.execute(addr).await;
        assert!(outcome.is_done(), "outcome: {outcome}");
        assert_eq!(harness.executor.dispatches(), 1);
        // counter decremented on completion, cache cleared after settlement
        assert_eq!(harness.ctx.active_executions.load(Ordering::SeqCst), 0);
        assert!(harness.ctx.registry.get(&addr).unwrap().cached_tx.is_none());
    }

    #[tokio::test]
    async fn test_execute_counter_released_on_broadcast_failure() {
        let harness = test_context(FeedScript::bothlive().armed());
        let addr = tracked_borrower(&harness, 0.95);
        assert!(harness.ctx.prepare(addr).await.is_done());
        harness.chain.set_account_hf(addr, 0.95);
        harness.executor.fail_dispatch(true);

        let outcome = harness.ctx.execute(addr).await;
        assert!(matches!(outcome, Outcome::Transient(_)));
        assert_eq!(harness.ctx.active_executions.load(Ordering::SeqCst), 0);
        // broadcast failure does not invalidate the cache
        assert!(harness.ctx.registry.get(&addr).unwrap().cached_tx.is_some());
    }

    #[tokio::test]
    async fn test_execute_deferred_at_concurrency_cap() {
        let harness = test_context(FeedScript::bothlive().armed());
        let addr = tracked_borrower(&harness, 0.95);
        assert!(harness.ctx.prepare(addr).await.is_done());
        harness.chain.set_account_hf(addr, 0.95);

        // cap of 1 already consumed
        harness.ctx.active_executions.store(1, Ordering::SeqCst);
        let outcome = harness.ctx.execute(addr).await;
        assert_eq!(outcome.skip_reason(), Some(SkipReason::Deferred));
        assert_eq!(harness.executor.dispatches(), 0);
        // the deferred path must not disturb the counter
        assert_eq!(harness.ctx.active_executions.load(Ordering::SeqCst), 1);
    }
}
