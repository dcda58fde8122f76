//! Engine configuration.

use crate::hand::Address;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// WebSocket RPC URL for live log subscription.
    pub ws_url: String,
    /// HTTP RPC URL for backfill and state queries.
    pub http_url: String,
    /// RPS factory contract address (20 bytes).
    pub factory_address: Address,
    /// Block the factory was deployed at; backfill starts here.
    pub creation_block: u64,
    /// Blocks a ledger head must be buried under before it is treated as
    /// confirmed.
    pub confirmations: u64,
    /// Deadline window for locally created games.
    pub timeout_in_blocks: u64,
    /// Max block range per eth_getLogs request.
    pub getlogs_max_range: u64,
    /// Reconnection backoff (initial and max seconds).
    pub reconnection: ReconnectionConfig,
}

/// Reconnection backoff.
#[derive(Debug, Clone)]
pub struct ReconnectionConfig {
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            initial_backoff_secs: 1,
            max_backoff_secs: 60,
        }
    }
}
