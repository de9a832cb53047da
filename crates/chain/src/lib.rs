//! Chain interaction layer for the liquidation agent.
//!
//! This crate provides:
//! - The `ChainClient` trait and its Alloy-backed RPC implementation
//! - Pool event subscription (Borrow / Repay / Supply / Withdraw /
//!   LiquidationCall) over WebSocket
//! - Calldata encoding, simulation and dispatch for liquidation calls
//!   (direct pool call and flash-liquidator modes)
//! - Transaction sending with a cached nonce and relay-mode selection
//! - EIP-1559 fee snapshotting

mod client;
mod events;
mod executor;
mod gas;
mod sender;

pub use client::{AccountData, ChainClient, RpcClient};
pub use events::{PoolEvent, PoolEventListener};
pub use executor::{
    encode_flash_execute, encode_liquidation_call, CallSpec, ContractExecutor,
    LiquidationExecutor,
};
pub use gas::{FeeData, FeeSnapshot};
pub use sender::{NonceManager, RelayMode, TransactionSender};
