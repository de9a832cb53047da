//! Transaction signing and broadcast.
//!
//! The nonce is tracked locally with an atomic counter so dispatch never
//! waits on a nonce RPC; it is synced from chain at startup and re-synced
//! after a failed broadcast. The broadcast endpoint is selected by the
//! configured relay mode.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use anyhow::{Context, Result};
use tracing::{info, warn};

/// Broadcast transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Broadcast through the public RPC endpoint.
    #[default]
    None,
    /// Broadcast through the Flashbots protect RPC.
    Flashbots,
    /// Broadcast through a custom private relay URL.
    Custom,
}

const FLASHBOTS_RPC: &str = "https://rpc.flashbots.net";

/// Locally cached nonce with atomic increments.
pub struct NonceManager {
    current: AtomicU64,
}

impl NonceManager {
    pub fn new(initial: u64) -> Self {
        Self {
            current: AtomicU64::new(initial),
        }
    }

    /// Claim the next nonce.
    #[inline]
    pub fn next(&self) -> u64 {
        self.current.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    /// Re-align with the chain after a failure; only moves forward.
    pub fn sync(&self, chain_nonce: u64) {
        let current = self.current.load(Ordering::SeqCst);
        if chain_nonce > current {
            self.current.store(chain_nonce, Ordering::SeqCst);
        }
    }

    /// Hard reset after a dropped transaction.
    pub fn reset(&self, chain_nonce: u64) {
        self.current.store(chain_nonce, Ordering::SeqCst);
    }
}

/// Signs and broadcasts liquidation transactions.
pub struct TransactionSender {
    send_url: String,
    wallet: EthereumWallet,
    pub address: Address,
    chain_id: u64,
    nonce: NonceManager,
    confirmation_timeout: Duration,
}

impl TransactionSender {
    /// Build a sender from the signer key, selecting the broadcast endpoint
    /// by relay mode. Fetches the starting nonce from the public endpoint.
    pub async fn new(
        signer_key: &str,
        rpc_url: &str,
        chain_id: u64,
        relay_mode: RelayMode,
        private_relay_url: Option<&str>,
        confirmation_timeout: Duration,
    ) -> Result<Self> {
        let key = signer_key.trim_start_matches("0x");
        let signer: PrivateKeySigner = key.parse().context("invalid signer key")?;
        let address = signer.address();
        let wallet = EthereumWallet::from(signer);

        let send_url = match relay_mode {
            RelayMode::None => rpc_url.to_string(),
            RelayMode::Flashbots => FLASHBOTS_RPC.to_string(),
            RelayMode::Custom => private_relay_url
                .context("relay_mode = custom requires private_relay_url")?
                .to_string(),
        };

        let provider = ProviderBuilder::new().connect_http(rpc_url.parse()?);
        let initial_nonce = provider.get_transaction_count(address).await?;

        info!(
            address = %address,
            chain_id = chain_id,
            relay = ?relay_mode,
            initial_nonce = initial_nonce,
            "Transaction sender initialized"
        );

        Ok(Self {
            send_url,
            wallet,
            address,
            chain_id,
            nonce: NonceManager::new(initial_nonce),
            confirmation_timeout,
        })
    }

    /// Broadcast a signed EIP-1559 transaction and await its receipt.
    ///
    /// Returns the transaction hash on a successful receipt. Any failure
    /// re-syncs the cached nonce from chain before returning the error.
    pub async fn send(
        &self,
        to: Address,
        calldata: Bytes,
        value: U256,
        gas_limit: u64,
        max_fee_per_gas: u128,
        priority_fee_per_gas: u128,
    ) -> Result<B256> {
        let nonce = self.nonce.next();

        let tx = TransactionRequest::default()
            .with_to(to)
            .with_input(calldata)
            .with_value(value)
            .with_nonce(nonce)
            .with_gas_limit(gas_limit)
            .with_max_fee_per_gas(max_fee_per_gas)
            .with_max_priority_fee_per_gas(priority_fee_per_gas)
            .with_chain_id(self.chain_id);

        info!(
            to = %to,
            nonce = nonce,
            gas_limit = gas_limit,
            max_fee_gwei = max_fee_per_gas / 1_000_000_000,
            "Broadcasting transaction"
        );

        let provider = ProviderBuilder::new()
            .wallet(self.wallet.clone())
            .connect_http(self.send_url.parse()?);

        let result = async {
            let pending = provider.send_transaction(tx).await?;
            let tx_hash = *pending.tx_hash();
            let receipt = pending.get_receipt().await?;
            anyhow::Ok((tx_hash, receipt))
        };

        match tokio::time::timeout(self.confirmation_timeout, result).await {
            Ok(Ok((tx_hash, receipt))) => {
                if receipt.status() {
                    info!(
                        tx_hash = %tx_hash,
                        block = receipt.block_number.unwrap_or(0),
                        gas_used = receipt.gas_used,
                        "Transaction confirmed"
                    );
                    Ok(tx_hash)
                } else {
                    warn!(tx_hash = %tx_hash, "Transaction reverted");
                    self.resync_nonce().await;
                    anyhow::bail!("transaction reverted: {tx_hash}")
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Broadcast failed");
                self.resync_nonce().await;
                Err(e)
            }
            Err(_) => {
                warn!(timeout_secs = self.confirmation_timeout.as_secs(), "Confirmation timed out");
                self.resync_nonce().await;
                anyhow::bail!("confirmation timed out after {:?}", self.confirmation_timeout)
            }
        }
    }

    async fn resync_nonce(&self) {
        let provider = match self.send_url.parse() {
            Ok(url) => ProviderBuilder::new().connect_http(url),
            Err(_) => return,
        };
        match provider.get_transaction_count(self.address).await {
            Ok(chain_nonce) => self.nonce.reset(chain_nonce),
            Err(e) => warn!(error = %e, "Nonce resync failed"),
        }
    }
}
