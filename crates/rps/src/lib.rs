//! Off-chain RPS runtime: game reconciliation, event decoding, and timeout
//! scheduling for the commit-reveal rock-paper-scissors contracts.
//!
//! - **GameIndexer**: follows factory `Created` logs and game events
//!   (WebSocket + HTTP backfill; decoded, ordered, broadcast).
//! - **Reconciler**: once per newly confirmed block, diffs each tracked
//!   game's pending/confirmed ledger state, runs the pure protocol state
//!   machine, and submits the one legal automatic move (reveal, rescind,
//!   win-by-default) behind per-action idempotency guards.
//! - **GameRegistry**: persisted records with tx-hash/contract/active
//!   indices, including crash-recovery matching of creation events against
//!   games whose submitted tx hash was never stored.

pub mod abi;
pub mod config;
pub mod game;
pub mod hand;
pub mod indexer;
pub mod reconciler;
pub mod registry;
pub mod rpc;
pub mod scheduler;
pub mod store;

pub use abi::{
    DecodeError, EventKind, GameCreation, GameEvent, ObservedEvent, TopicTable,
};
pub use config::{EngineConfig, ReconnectionConfig};
pub use game::{apply, GameId, GameRecord, GameSnapshot, GameState, ProtocolError};
pub use hand::{
    commitment, outcome_of_hands, random_salt, round_result, Address, Hand, Hash32, Outcome,
    RoundResult,
};
pub use indexer::{GameIndexer, IndexedItem};
pub use reconciler::{
    BlockTag, EngineError, GameCall, Ledger, LedgerError, Notifier, NullNotifier, Reconciler,
    Submitter, SubmitError,
};
pub use registry::{CreationDisposition, GameRegistry};
pub use rpc::EthLedger;
pub use scheduler::TimeoutScheduler;
pub use store::{MemoryStore, Store, StoreError};
