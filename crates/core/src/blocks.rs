//! Block loop: periodic HF refresh and execution trigger.
//!
//! Every tick reads the block height and fee data, refreshes the predicted
//! HF for hydrated borrowers in the WATCH and CRITICAL bands (and keeps
//! already-LIQUIDATABLE ones under refresh so a deferred execution is
//! retried), and dispatches `execute` for borrowers sitting at or below the
//! liquidation band. Preparation is never triggered here — that is the
//! event fan-out's job.

use std::sync::atomic::Ordering;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::borrower::BorrowerState;
use crate::engine::Engine;
use crate::health;

/// Emit registry statistics every this many ticks.
const STATS_EVERY_TICKS: u64 = 100;

impl Engine {
    /// Run the block loop until shutdown is signalled.
    pub async fn run_block_loop(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let ctx = self.context();
        let mut ticker = tokio::time::interval(ctx.config.current().block_poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            ticks += 1;
            self.block_tick().await;

            if ticks % STATS_EVERY_TICKS == 0 {
                ctx.log_stats(ctx.latest_block.load(Ordering::Relaxed));
            }
        }

        debug!("Block loop stopped");
        Ok(())
    }

    /// One tick: refresh chain state, recompute the watch set, execute.
    pub async fn block_tick(&self) {
        let ctx = self.context();

        match ctx.chain.block_number().await {
            Ok(block) => ctx.latest_block.store(block, Ordering::Relaxed),
            Err(e) => {
                warn!(error = %e, "Block number fetch failed");
                return;
            }
        }
        match ctx.chain.fee_data().await {
            Ok(fees) => ctx.fees.update(fees),
            Err(e) => debug!(error = %e, "Fee data fetch failed, keeping snapshot"),
        }

        let watch_set = ctx.registry.by_states(&[
            BorrowerState::Watch,
            BorrowerState::Critical,
            BorrowerState::Liquidatable,
        ]);

        for borrower in watch_set {
            if !borrower.hydrated {
                continue;
            }

            let hf = health::health_factor(&borrower, &ctx.prices, &ctx.catalog);
            let Some((_, state)) =
                ctx.registry.update_hf(&borrower.address, &ctx.bands(), hf, None)
            else {
                continue;
            };

            if state == BorrowerState::Liquidatable {
                let ctx = ctx.clone();
                let address = borrower.address;
                tokio::spawn(async move {
                    let outcome = ctx.execute(address).await;
                    debug!(borrower = %address, outcome = %outcome, "Execute finished");
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math;
    use crate::testutil::{test_context, FeedScript, USDC, WETH};
    use alloy::primitives::{Address, U256};
    use smallvec::smallvec;

    #[tokio::test]
    async fn test_block_tick_refreshes_height() {
        let harness = test_context(FeedScript::bothlive());
        let engine = Engine::new(harness.ctx.clone());
        harness.chain.set_block_number(4_242);

        engine.block_tick().await;

        assert_eq!(harness.ctx.latest_block.load(Ordering::Relaxed), 4_242);
    }

    #[tokio::test]
    async fn test_block_tick_moves_watch_borrower_down() {
        let harness = test_context(FeedScript::bothlive());
        let engine = Engine::new(harness.ctx.clone());
        let addr = Address::repeat_byte(1);
        harness.ctx.registry.upsert(addr, BorrowerState::Safe);
        harness.ctx.registry.set_balances(
            &addr,
            smallvec![(WETH, U256::from(10u64) * math::pow10(18))],
            smallvec![(USDC, U256::from(16_000u64) * math::pow10(6))],
        );
        harness.ctx.registry.mark_hydrated(&addr);
        // start in WATCH on an older computation
        harness
            .ctx
            .registry
            .update_hf(&addr, &harness.ctx.bands(), 1.08, None);

        // (10 × 2000 × 0.825) / 16000 = 1.03125: the refresh lands in CRITICAL
        engine.block_tick().await;
        assert_eq!(
            harness.ctx.registry.get(&addr).unwrap().state,
            BorrowerState::Critical
        );

        // collateral price collapse pushes the borrower through the bands
        harness.chain.set_block_number(10);
        harness.ctx.prices.write_slot(
            WETH,
            crate::prices::PricePoint {
                price_usd: 1_000.0,
                captured_at: std::time::Instant::now(),
                source: sentinel_api::PriceSource::Binance,
            },
        );
        engine.block_tick().await;

        let borrower = harness.ctx.registry.get(&addr).unwrap();
        assert_eq!(borrower.state, BorrowerState::Liquidatable);
        assert!((borrower.predicted_hf - 0.515625).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_unhydrated_borrowers_skipped() {
        let harness = test_context(FeedScript::bothlive());
        let engine = Engine::new(harness.ctx.clone());
        let addr = Address::repeat_byte(1);
        harness.ctx.registry.upsert(addr, BorrowerState::Safe);
        harness.ctx.registry.set_balances(
            &addr,
            smallvec![(WETH, math::pow10(18))],
            smallvec![(USDC, U256::from(10_000u64) * math::pow10(6))],
        );
        // forced into the scan set without hydration
        harness
            .ctx
            .registry
            .update_hf(&addr, &harness.ctx.bands(), 1.08, None);
        let before = harness.ctx.registry.get(&addr).unwrap().predicted_hf;

        engine.block_tick().await;

        // untouched: hydration guard held
        let after = harness.ctx.registry.get(&addr).unwrap().predicted_hf;
        assert_eq!(before, after);
    }
}
