//! Pool event routing.
//!
//! Every pool event resolves to the affected borrower, refreshes that
//! borrower's balances from chain, and enqueues an HF recomputation.
//! LiquidationCall events are authoritative: they settle whether the
//! borrower leaves the registry and produce an audit record classifying
//! why the observed liquidation was not ours.

use std::sync::Arc;

use alloy::primitives::Address;
use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use sentinel_api::AuditEvent;
use sentinel_chain::PoolEvent;

use crate::borrower::{Balances, Borrower, BorrowerState, SkipReason};
use crate::engine::EngineContext;
use crate::health;

/// Routes decoded pool events into registry updates and recompute triggers.
pub struct EventRouter {
    ctx: Arc<EngineContext>,
    updates_tx: mpsc::Sender<Address>,
}

impl EventRouter {
    pub fn new(ctx: Arc<EngineContext>, updates_tx: mpsc::Sender<Address>) -> Self {
        Self { ctx, updates_tx }
    }

    #[instrument(skip(self, event), fields(kind = event.kind(), borrower = %event.borrower()))]
    pub async fn handle(&self, event: PoolEvent) -> Result<()> {
        match &event {
            PoolEvent::LiquidationCall { .. } => self.handle_liquidation(&event).await,
            _ => self.handle_balance_event(&event).await,
        }
    }

    /// Borrow / Repay / Supply / Withdraw: refresh balances and notify.
    async fn handle_balance_event(&self, event: &PoolEvent) -> Result<()> {
        let address = event.borrower();

        // Repay only acts on borrowers we already track.
        if matches!(event, PoolEvent::Repay { .. }) && !self.ctx.registry.contains(&address) {
            debug!(borrower = %address, "Repay for untracked borrower ignored");
            return Ok(());
        }

        let was_new = self.ctx.registry.upsert(address, BorrowerState::Safe);

        if let Err(e) = self.refresh_balances(&address).await {
            // Transient: retried on the next event touching this borrower.
            warn!(borrower = %address, error = %e, "Balance refresh failed");
            return Ok(());
        }
        self.ctx.registry.mark_hydrated(&address);

        // Newly observed borrowers must clear the minimum debt bar, valued
        // at on-chain oracle prices. A failure to value is not a removal.
        if was_new && !matches!(event, PoolEvent::Repay { .. }) {
            if let Some(borrower) = self.ctx.registry.get(&address) {
                match health::oracle_debt_usd(
                    &borrower,
                    self.ctx.chain.as_ref(),
                    &self.ctx.catalog,
                )
                .await
                {
                    Ok(debt_usd) if debt_usd < self.ctx.config.current().min_debt_usd => {
                        debug!(
                            borrower = %address,
                            debt_usd = debt_usd,
                            "New borrower below minimum debt, dropping"
                        );
                        self.ctx.registry.remove(&address);
                        return Ok(());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(borrower = %address, error = %e, "Debt valuation failed, keeping borrower");
                    }
                }
            }
        }

        let _ = self.updates_tx.send(address).await;
        Ok(())
    }

    /// LiquidationCall: authoritative balance settlement plus audit.
    async fn handle_liquidation(&self, event: &PoolEvent) -> Result<()> {
        let address = event.borrower();
        let prior = self.ctx.registry.get(&address);

        info!(
            borrower = %address,
            block = event.block_number(),
            tracked = prior.is_some(),
            "Liquidation observed on pool"
        );

        self.ctx.registry.upsert(address, BorrowerState::Safe);
        if let Err(e) = self.refresh_balances(&address).await {
            warn!(borrower = %address, error = %e, "Post-liquidation refresh failed");
            return Ok(());
        }
        self.ctx.registry.mark_hydrated(&address);

        let Some(borrower) = self.ctx.registry.get(&address) else {
            return Ok(());
        };

        if !borrower.has_debt() {
            self.ctx.registry.remove(&address);
            self.ctx.audit(
                AuditEvent::new("liquidation_observed", "position_closed")
                    .with_borrower(address)
                    .with_block(event.block_number()),
            );
            return Ok(());
        }

        let classification = self.classify_miss(prior.as_ref(), &borrower).await;
        debug!(borrower = %address, classification = classification, "Liquidation miss classified");
        self.ctx.audit(
            AuditEvent::new("liquidation_observed", classification)
                .with_borrower(address)
                .with_block(event.block_number()),
        );

        let _ = self.updates_tx.send(address).await;
        Ok(())
    }

    /// Why someone else settled a position we were watching.
    async fn classify_miss(&self, prior: Option<&Borrower>, current: &Borrower) -> &'static str {
        let Some(prior) = prior else {
            return "not_in_watch_set";
        };

        if let Ok(debt_usd) = health::oracle_debt_usd(
            current,
            self.ctx.chain.as_ref(),
            &self.ctx.catalog,
        )
        .await
        {
            if debt_usd < self.ctx.config.current().min_debt_usd {
                return "below_min_debt";
            }
        }

        if prior.cached_tx.is_some() || prior.last_execution_attempt_at.is_some() {
            return "raced";
        }

        match prior.last_skip_reason {
            Some(SkipReason::OracleNotLiquidatable) => "oracle_not_liquidatable",
            Some(SkipReason::ProfitFloor) => "filtered_by_profit",
            Some(SkipReason::GasGuard) => "filtered_by_gas",
            _ => "unknown",
        }
    }

    /// Re-read both balance sides for every configured asset, dropping
    /// zero balances. Decimals are resolved and memoized along the way.
    async fn refresh_balances(&self, address: &Address) -> Result<()> {
        let mut collateral: Balances = Balances::new();
        for asset in self.ctx.collateral_targets() {
            let amount = self.ctx.chain.supplied_balance(asset, *address).await?;
            if !amount.is_zero() {
                let _ = self
                    .ctx
                    .catalog
                    .resolve_decimals(self.ctx.chain.as_ref(), asset)
                    .await;
                collateral.push((asset, amount));
            }
        }

        let mut debt: Balances = Balances::new();
        for asset in self.ctx.debt_targets() {
            let amount = self.ctx.chain.borrowed_balance(asset, *address).await?;
            if !amount.is_zero() {
                let _ = self
                    .ctx
                    .catalog
                    .resolve_decimals(self.ctx.chain.as_ref(), asset)
                    .await;
                debt.push((asset, amount));
            }
        }

        self.ctx.registry.set_balances(address, collateral, debt);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math;
    use crate::testutil::{test_context, FeedScript, USDC, WETH};
    use alloy::primitives::{B256, U256};

    fn borrow_event(addr: Address) -> PoolEvent {
        PoolEvent::Borrow {
            reserve: USDC,
            on_behalf_of: addr,
            amount: U256::from(1u64),
            block_number: 100,
            tx_hash: B256::ZERO,
        }
    }

    fn liquidation_event(addr: Address) -> PoolEvent {
        PoolEvent::LiquidationCall {
            collateral_asset: WETH,
            debt_asset: USDC,
            user: addr,
            debt_to_cover: U256::from(1u64),
            liquidated_collateral: U256::from(1u64),
            liquidator: Address::repeat_byte(0xEE),
            block_number: 101,
            tx_hash: B256::ZERO,
        }
    }

    #[tokio::test]
    async fn test_borrow_event_hydrates_new_borrower() {
        let harness = test_context(FeedScript::bothlive());
        let addr = Address::repeat_byte(1);
        harness.chain.set_supplied(WETH, addr, U256::from(10u64) * math::pow10(18));
        harness.chain.set_borrowed(USDC, addr, U256::from(10_000u64) * math::pow10(6));

        let (tx, mut rx) = mpsc::channel(8);
        let router = EventRouter::new(harness.ctx.clone(), tx);
        router.handle(borrow_event(addr)).await.unwrap();

        let borrower = harness.ctx.registry.get(&addr).unwrap();
        assert!(borrower.hydrated);
        assert_eq!(borrower.collateral_of(&WETH), Some(U256::from(10u64) * math::pow10(18)));
        assert_eq!(borrower.debt_of(&USDC), Some(U256::from(10_000u64) * math::pow10(6)));
        assert_eq!(rx.try_recv().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_repay_ignores_unknown_borrower() {
        let harness = test_context(FeedScript::bothlive());
        let addr = Address::repeat_byte(1);

        let (tx, mut rx) = mpsc::channel(8);
        let router = EventRouter::new(harness.ctx.clone(), tx);
        router
            .handle(PoolEvent::Repay {
                reserve: USDC,
                user: addr,
                amount: U256::from(1u64),
                block_number: 100,
                tx_hash: B256::ZERO,
            })
            .await
            .unwrap();

        assert!(!harness.ctx.registry.contains(&addr));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_new_borrower_below_min_debt_removed() {
        let harness = test_context(FeedScript::bothlive());
        let addr = Address::repeat_byte(1);
        // 10 USDC of debt against a 50 USD floor
        harness.chain.set_borrowed(USDC, addr, U256::from(10u64) * math::pow10(6));

        let (tx, _rx) = mpsc::channel(8);
        let router = EventRouter::new(harness.ctx.clone(), tx);
        router.handle(borrow_event(addr)).await.unwrap();

        assert!(!harness.ctx.registry.contains(&addr));
    }

    #[tokio::test]
    async fn test_transient_valuation_failure_keeps_borrower() {
        let harness = test_context(FeedScript::bothlive());
        let addr = Address::repeat_byte(1);
        harness.chain.set_borrowed(USDC, addr, U256::from(10u64) * math::pow10(6));
        harness.chain.fail_oracle(true);

        let (tx, _rx) = mpsc::channel(8);
        let router = EventRouter::new(harness.ctx.clone(), tx);
        router.handle(borrow_event(addr)).await.unwrap();

        assert!(harness.ctx.registry.contains(&addr));
    }

    #[tokio::test]
    async fn test_balance_refresh_failure_leaves_unhydrated() {
        let harness = test_context(FeedScript::bothlive());
        let addr = Address::repeat_byte(1);
        harness.chain.fail_balances(true);

        let (tx, mut rx) = mpsc::channel(8);
        let router = EventRouter::new(harness.ctx.clone(), tx);
        router.handle(borrow_event(addr)).await.unwrap();

        let borrower = harness.ctx.registry.get(&addr).unwrap();
        assert!(!borrower.hydrated);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_liquidation_with_zero_debt_removes() {
        let harness = test_context(FeedScript::bothlive());
        let addr = Address::repeat_byte(1);
        harness.ctx.registry.upsert(addr, BorrowerState::Safe);
        // no balances on chain: all debt zero after refresh

        let (tx, _rx) = mpsc::channel(8);
        let router = EventRouter::new(harness.ctx.clone(), tx);
        router.handle(liquidation_event(addr)).await.unwrap();

        assert!(!harness.ctx.registry.contains(&addr));
        tokio::task::yield_now().await;
        let audits = harness.notifier.events();
        assert!(audits.iter().any(|a| a.detail == "position_closed"));
    }

    #[tokio::test]
    async fn test_liquidation_miss_classified_raced() {
        let harness = test_context(FeedScript::bothlive());
        let addr = Address::repeat_byte(1);
        harness.ctx.registry.upsert(addr, BorrowerState::Safe);
        harness.ctx.registry.record_execution_attempt(&addr);
        // residual debt survives the liquidation
        harness.chain.set_borrowed(USDC, addr, U256::from(5_000u64) * math::pow10(6));

        let (tx, _rx) = mpsc::channel(8);
        let router = EventRouter::new(harness.ctx.clone(), tx);
        router.handle(liquidation_event(addr)).await.unwrap();

        assert!(harness.ctx.registry.contains(&addr));
        tokio::task::yield_now().await;
        let audits = harness.notifier.events();
        assert!(audits.iter().any(|a| a.detail == "raced"), "audits: {audits:?}");
    }

    #[tokio::test]
    async fn test_liquidation_of_untracked_borrower() {
        let harness = test_context(FeedScript::bothlive());
        let addr = Address::repeat_byte(1);
        harness.chain.set_borrowed(USDC, addr, U256::from(5_000u64) * math::pow10(6));

        let (tx, _rx) = mpsc::channel(8);
        let router = EventRouter::new(harness.ctx.clone(), tx);
        router.handle(liquidation_event(addr)).await.unwrap();

        tokio::task::yield_now().await;
        let audits = harness.notifier.events();
        assert!(audits.iter().any(|a| a.detail == "not_in_watch_set"));
    }
}
