//! Borrower records and the health-factor state machine.

use std::fmt;
use std::time::Instant;

use alloy::primitives::{Address, Bytes, U256};
use arrayvec::ArrayVec;
use smallvec::SmallVec;

/// Bounded length of the per-borrower transition history.
pub const HISTORY_CAP: usize = 100;

/// Classification bands over the predicted health factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BorrowerState {
    Safe,
    Watch,
    Critical,
    Liquidatable,
}

impl fmt::Display for BorrowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Safe => write!(f, "safe"),
            Self::Watch => write!(f, "watch"),
            Self::Critical => write!(f, "critical"),
            Self::Liquidatable => write!(f, "liquidatable"),
        }
    }
}

/// Configured band boundaries; `watch > critical > liquidatable >= 0`.
#[derive(Debug, Clone, Copy)]
pub struct Bands {
    pub watch: f64,
    pub critical: f64,
    pub liquidatable: f64,
}

impl Bands {
    /// Classify a health factor into its band. Total over the non-negative
    /// reals including `+inf` (zero-debt positions are SAFE).
    pub fn classify(&self, hf: f64) -> BorrowerState {
        if hf <= self.liquidatable {
            BorrowerState::Liquidatable
        } else if hf <= self.critical {
            BorrowerState::Critical
        } else if hf <= self.watch {
            BorrowerState::Watch
        } else {
            BorrowerState::Safe
        }
    }
}

/// One entry of the bounded transition history.
#[derive(Debug, Clone, Copy)]
pub struct StateTransition {
    pub state: BorrowerState,
    pub at: Instant,
    pub hf: f64,
}

/// Why a prepare/execute attempt (or an observed external liquidation)
/// did not result in our own settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotInWatchSet,
    BelowMinDebt,
    Raced,
    OracleNotLiquidatable,
    ProfitFloor,
    GasGuard,
    SimulationFailed,
    PriceFeedPolicy,
    StaleFeed,
    LockHeld,
    Deferred,
    NoViablePair,
    NotLiquidatable,
    ExecutionDisabled,
    Unknown,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotInWatchSet => "not_in_watch_set",
            Self::BelowMinDebt => "below_min_debt",
            Self::Raced => "raced",
            Self::OracleNotLiquidatable => "oracle_not_liquidatable",
            Self::ProfitFloor => "profit_floor",
            Self::GasGuard => "gas_guard",
            Self::SimulationFailed => "simulation_failed",
            Self::PriceFeedPolicy => "price_feed_policy",
            Self::StaleFeed => "stale_feed",
            Self::LockHeld => "lock_held",
            Self::Deferred => "deferred",
            Self::NoViablePair => "no_viable_pair",
            Self::NotLiquidatable => "not_liquidatable",
            Self::ExecutionDisabled => "execution_disabled",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution-path variant of a prepared transaction.
#[derive(Debug, Clone)]
pub enum TxMode {
    /// Direct `Pool.liquidationCall` with our own capital.
    Direct,
    /// Flash-loan host call carrying the pre-computed swap route.
    Flash {
        swap_payload: Bytes,
        min_swap_out: U256,
    },
}

/// A prepared liquidation transaction cached on the borrower record.
#[derive(Debug, Clone)]
pub struct CachedTx {
    pub target: Address,
    pub calldata: Bytes,
    pub value: U256,
    pub gas_limit: u64,
    pub max_fee_per_gas: u128,
    pub priority_fee_per_gas: u128,
    /// Expected profit before gas, in USD.
    pub expected_profit_usd: f64,
    pub gas_cost_usd: f64,
    pub prepared_at: Instant,
    pub mode: TxMode,
    pub debt_asset: Address,
    pub collateral_asset: Address,
    pub debt_amount: U256,
}

/// Per-asset balances; at most one entry per asset, zero balances omitted.
pub type Balances = SmallVec<[(Address, U256); 4]>;

/// The central tracked entity, keyed by address in the registry.
#[derive(Debug, Clone)]
pub struct Borrower {
    pub address: Address,
    pub state: BorrowerState,
    pub collateral: Balances,
    pub debt: Balances,
    /// Off-chain HF from cached feed prices; `+inf` with zero debt.
    pub predicted_hf: f64,
    /// Last on-chain oracle HF observed.
    pub oracle_hf: f64,
    /// False until the first authoritative chain event writes balances.
    /// Monotonic false → true.
    pub hydrated: bool,
    pub history: ArrayVec<StateTransition, HISTORY_CAP>,
    pub cached_tx: Option<CachedTx>,
    pub prepared_block: Option<u64>,
    pub last_skip_reason: Option<SkipReason>,
    pub last_execution_attempt_at: Option<Instant>,
    pub first_seen_at: Instant,
    pub last_updated_at: Instant,
    pub last_event_at: Option<Instant>,
}

impl Borrower {
    pub fn new(address: Address, state: BorrowerState) -> Self {
        let now = Instant::now();
        let mut history = ArrayVec::new();
        history.push(StateTransition {
            state,
            at: now,
            hf: f64::INFINITY,
        });

        Self {
            address,
            state,
            collateral: SmallVec::new(),
            debt: SmallVec::new(),
            predicted_hf: f64::INFINITY,
            oracle_hf: f64::INFINITY,
            hydrated: false,
            history,
            cached_tx: None,
            prepared_block: None,
            last_skip_reason: None,
            last_execution_attempt_at: None,
            first_seen_at: now,
            last_updated_at: now,
            last_event_at: None,
        }
    }

    pub fn collateral_of(&self, asset: &Address) -> Option<U256> {
        self.collateral
            .iter()
            .find(|(a, _)| a == asset)
            .map(|(_, amount)| *amount)
    }

    pub fn debt_of(&self, asset: &Address) -> Option<U256> {
        self.debt
            .iter()
            .find(|(a, _)| a == asset)
            .map(|(_, amount)| *amount)
    }

    /// Whether this borrower holds `asset` on either side.
    pub fn touches(&self, asset: &Address) -> bool {
        self.collateral_of(asset).is_some() || self.debt_of(asset).is_some()
    }

    pub fn has_debt(&self) -> bool {
        self.debt.iter().any(|(_, amount)| !amount.is_zero())
    }

    /// Append a transition, evicting the oldest entry at the cap.
    pub(crate) fn push_transition(&mut self, state: BorrowerState, hf: f64) {
        if self.history.is_full() {
            self.history.remove(0);
        }
        self.history.push(StateTransition {
            state,
            at: Instant::now(),
            hf,
        });
    }
}
