//! Pool event subscription over WebSocket.
//!
//! Subscribes to the pool's Borrow / Repay / Supply / Withdraw /
//! LiquidationCall logs and decodes them into [`PoolEvent`] values. The
//! borrower resolution rule lives here: deposit-side events are attributed
//! to the `onBehalfOf` party, the others to the indexed user.

use std::pin::Pin;

use alloy::primitives::{Address, B256, U256};
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{Filter, Log};
use anyhow::Result;
use futures::stream::{Stream, StreamExt};
use tracing::{debug, info};

/// Event topic0 constants for log filtering.
pub mod topics {
    use alloy::primitives::B256;

    /// keccak256("Supply(address,address,address,uint256,uint16)")
    pub const SUPPLY: B256 = B256::new([
        0x2b, 0x62, 0x7c, 0xe5, 0x32, 0x47, 0xe1, 0x4b, 0x2c, 0x94, 0x3c, 0xb3, 0x84, 0xf6, 0x22,
        0xb9, 0x70, 0x64, 0x99, 0x4c, 0x68, 0x32, 0x18, 0x0f, 0x2a, 0x71, 0x7c, 0x7f, 0xa2, 0xac,
        0xe2, 0x9e,
    ]);

    /// keccak256("Withdraw(address,address,address,uint256)")
    pub const WITHDRAW: B256 = B256::new([
        0x31, 0x15, 0xd1, 0x44, 0x9a, 0x7b, 0x73, 0x2c, 0x4a, 0x14, 0x53, 0x4b, 0x82, 0x26, 0x19,
        0xf7, 0x2c, 0xc4, 0xd7, 0x0e, 0xf5, 0x2d, 0x8e, 0x0e, 0x2a, 0x7d, 0x6d, 0x80, 0x6b, 0x48,
        0xd8, 0x39,
    ]);

    /// keccak256("Borrow(address,address,address,uint256,uint8,uint256,uint16)")
    pub const BORROW: B256 = B256::new([
        0xb3, 0xd0, 0x84, 0x82, 0x0f, 0xb1, 0xa9, 0xde, 0xcf, 0xef, 0xf7, 0xce, 0x23, 0xfb, 0x0d,
        0xb6, 0x95, 0x43, 0xa8, 0xae, 0x27, 0x5f, 0xde, 0x06, 0x3a, 0xba, 0xf5, 0x81, 0x2f, 0x3c,
        0xc5, 0x88,
    ]);

    /// keccak256("Repay(address,address,address,uint256,bool)")
    pub const REPAY: B256 = B256::new([
        0xa5, 0x34, 0xc8, 0xdc, 0xe0, 0x52, 0x79, 0xf5, 0xb3, 0x05, 0xbd, 0xfd, 0xa9, 0x35, 0x48,
        0x8f, 0xf4, 0xf1, 0xc8, 0x3d, 0xd2, 0x62, 0x1e, 0x7e, 0xb0, 0x56, 0xd7, 0xa5, 0x93, 0x98,
        0x74, 0x80,
    ]);

    /// keccak256("LiquidationCall(address,address,address,uint256,uint256,address,bool)")
    pub const LIQUIDATION_CALL: B256 = B256::new([
        0xe4, 0x13, 0xa3, 0x21, 0xe8, 0x68, 0x14, 0x69, 0x7e, 0x5d, 0x12, 0x0c, 0xb6, 0x28, 0x45,
        0x1e, 0x97, 0x08, 0x86, 0x7c, 0xfd, 0x6a, 0x6c, 0xd8, 0x16, 0xd2, 0xe7, 0xb0, 0xb4, 0xd0,
        0xb4, 0x80,
    ]);

    pub fn pool_topics() -> Vec<B256> {
        vec![SUPPLY, WITHDRAW, BORROW, REPAY, LIQUIDATION_CALL]
    }
}

/// A decoded pool event.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    Borrow {
        reserve: Address,
        on_behalf_of: Address,
        amount: U256,
        block_number: u64,
        tx_hash: B256,
    },
    Repay {
        reserve: Address,
        user: Address,
        amount: U256,
        block_number: u64,
        tx_hash: B256,
    },
    Supply {
        reserve: Address,
        on_behalf_of: Address,
        amount: U256,
        block_number: u64,
        tx_hash: B256,
    },
    Withdraw {
        reserve: Address,
        user: Address,
        amount: U256,
        block_number: u64,
        tx_hash: B256,
    },
    LiquidationCall {
        collateral_asset: Address,
        debt_asset: Address,
        user: Address,
        debt_to_cover: U256,
        liquidated_collateral: U256,
        liquidator: Address,
        block_number: u64,
        tx_hash: B256,
    },
}

impl PoolEvent {
    /// The borrower whose position this event touches.
    pub fn borrower(&self) -> Address {
        match self {
            Self::Borrow { on_behalf_of, .. } | Self::Supply { on_behalf_of, .. } => *on_behalf_of,
            Self::Repay { user, .. }
            | Self::Withdraw { user, .. }
            | Self::LiquidationCall { user, .. } => *user,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Borrow { .. } => "Borrow",
            Self::Repay { .. } => "Repay",
            Self::Supply { .. } => "Supply",
            Self::Withdraw { .. } => "Withdraw",
            Self::LiquidationCall { .. } => "LiquidationCall",
        }
    }

    pub fn block_number(&self) -> u64 {
        match self {
            Self::Borrow { block_number, .. }
            | Self::Repay { block_number, .. }
            | Self::Supply { block_number, .. }
            | Self::Withdraw { block_number, .. }
            | Self::LiquidationCall { block_number, .. } => *block_number,
        }
    }
}

/// WebSocket subscription source for pool events.
pub struct PoolEventListener {
    ws_url: String,
    pool: Address,
}

impl PoolEventListener {
    pub fn new(ws_url: impl Into<String>, pool: Address) -> Self {
        Self {
            ws_url: ws_url.into(),
            pool,
        }
    }

    /// Subscribe to the pool's event logs. The returned stream ends when the
    /// underlying connection drops; callers resubscribe with backoff.
    pub async fn subscribe(&self) -> Result<Pin<Box<dyn Stream<Item = PoolEvent> + Send>>> {
        info!(pool = %self.pool, ws_url = %self.ws_url, "Subscribing to pool events");

        let ws = WsConnect::new(&self.ws_url);
        let provider = ProviderBuilder::new().connect_ws(ws).await?;

        let filter = Filter::new()
            .address(self.pool)
            .event_signature(topics::pool_topics());

        let sub = provider.subscribe_logs(&filter).await?;
        let inner = sub.into_stream();

        // The provider is carried in the stream state so the WebSocket stays
        // open for the lifetime of the subscription.
        let stream = futures::stream::unfold(
            (provider, inner),
            |(provider, mut inner)| async move {
                loop {
                    match inner.next().await {
                        Some(log) => {
                            if let Some(event) = decode_pool_event(&log) {
                                return Some((event, (provider, inner)));
                            }
                            debug!(topic = ?log.topics().first(), "Skipping undecodable pool log");
                        }
                        None => return None,
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }
}

/// Decode a raw log into a [`PoolEvent`], if it matches a known topic.
pub fn decode_pool_event(log: &Log) -> Option<PoolEvent> {
    let topic0 = *log.topics().first()?;
    let block_number = log.block_number.unwrap_or(0);
    let tx_hash = log.transaction_hash.unwrap_or_default();
    let data = &log.data().data;

    let topic_addr = |i: usize| -> Option<Address> {
        log.topics().get(i).map(|t| Address::from_slice(&t[12..]))
    };
    let data_word = |i: usize| -> Option<U256> {
        data.get(i * 32..(i + 1) * 32).map(U256::from_be_slice)
    };

    if topic0 == topics::BORROW {
        // Borrow(address indexed reserve, address user, address indexed onBehalfOf,
        //        uint256 amount, uint8 rateMode, uint256 rate, uint16 indexed referral)
        Some(PoolEvent::Borrow {
            reserve: topic_addr(1)?,
            on_behalf_of: topic_addr(2)?,
            amount: data_word(1)?,
            block_number,
            tx_hash,
        })
    } else if topic0 == topics::REPAY {
        // Repay(address indexed reserve, address indexed user, address indexed repayer,
        //       uint256 amount, bool useATokens)
        Some(PoolEvent::Repay {
            reserve: topic_addr(1)?,
            user: topic_addr(2)?,
            amount: data_word(0)?,
            block_number,
            tx_hash,
        })
    } else if topic0 == topics::SUPPLY {
        // Supply(address indexed reserve, address user, address indexed onBehalfOf,
        //        uint256 amount, uint16 indexed referral)
        Some(PoolEvent::Supply {
            reserve: topic_addr(1)?,
            on_behalf_of: topic_addr(2)?,
            amount: data_word(1)?,
            block_number,
            tx_hash,
        })
    } else if topic0 == topics::WITHDRAW {
        // Withdraw(address indexed reserve, address indexed user, address indexed to,
        //          uint256 amount)
        Some(PoolEvent::Withdraw {
            reserve: topic_addr(1)?,
            user: topic_addr(2)?,
            amount: data_word(0)?,
            block_number,
            tx_hash,
        })
    } else if topic0 == topics::LIQUIDATION_CALL {
        // LiquidationCall(address indexed collateralAsset, address indexed debtAsset,
        //                 address indexed user, uint256 debtToCover,
        //                 uint256 liquidatedCollateralAmount, address liquidator,
        //                 bool receiveAToken)
        let liquidator = data
            .get(64 + 12..96)
            .map(Address::from_slice)
            .unwrap_or_default();
        Some(PoolEvent::LiquidationCall {
            collateral_asset: topic_addr(1)?,
            debt_asset: topic_addr(2)?,
            user: topic_addr(3)?,
            debt_to_cover: data_word(0)?,
            liquidated_collateral: data_word(1)?,
            liquidator,
            block_number,
            tx_hash,
        })
    } else {
        None
    }
}
