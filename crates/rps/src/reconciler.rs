//! Reconciliation loop: keeps local game records consistent with ledger
//! truth and automates the next legal move.
//!
//! Driven once per newly confirmed block by the host (strictly increasing,
//! one tick at a time). Pending (unconfirmed) state is used only for change
//! detection; every automatic submission is gated on confirmed state. At
//! most one automatic action is attempted per tick per game, and each
//! action's idempotency guard is recorded only on successful submission.

use crate::abi::{GameCreation, ObservedEvent};
use crate::game::{GameId, GameSnapshot, GameState};
use crate::hand::{commitment, random_salt, Address, Hand, Hash32};
use crate::registry::{CreationDisposition, GameRegistry};
use crate::scheduler::TimeoutScheduler;
use crate::store::{Store, StoreError};
use std::collections::BTreeSet;
use thiserror::Error;

/// Ledger state is queried either at the pending tag or at a specific
/// confirmed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Pending,
    Number(u64),
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("RPC error: {0}")]
    Rpc(String),
    #[error("decode error: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("submission rejected: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// The closed set of contract calls the engine submits. Signing and
/// broadcast are the submitter's concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameCall {
    Player0StartGame {
        player1: Option<Address>,
        timeout_in_blocks: u64,
        commitment: Hash32,
        wager: u128,
        /// wager + escrow, attached as value.
        value: u128,
    },
    Player1ShowHand {
        hand: Hand,
        /// The wager, attached as value.
        value: u128,
    },
    Player0Reveal {
        salt: Hash32,
        hand: Hand,
    },
    Player0Rescind,
    Player1WinByDefault,
}

/// Read-only view of on-chain game state.
#[allow(async_fn_in_trait)]
pub trait Ledger {
    async fn query(&self, contract: Address, tag: BlockTag) -> Result<GameSnapshot, LedgerError>;
}

/// Transaction submission collaborator. Returns an opaque transaction
/// identifier on success; the engine records it into the matching
/// idempotency guard.
#[allow(async_fn_in_trait)]
pub trait Submitter {
    async fn submit(&self, contract: Address, call: GameCall) -> Result<Hash32, SubmitError>;
}

/// Presentation hook, invoked after any record mutation. Observational only.
pub trait Notifier {
    fn game_updated(&self, id: GameId, reason: &str);
}

/// Notifier that does nothing.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn game_updated(&self, _id: GameId, _reason: &str) {}
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error("{0}")]
    Rejected(String),
}

/// Per-game reconciliation engine. Owns the registry and scheduler; the
/// ledger, submitter, and notifier are injected collaborators.
pub struct Reconciler<S: Store, L: Ledger, T: Submitter, N: Notifier> {
    registry: GameRegistry<S>,
    scheduler: TimeoutScheduler,
    ledger: L,
    submitter: T,
    notifier: N,
    user: Address,
    factory: Address,
    timeout_in_blocks: u64,
}

impl<S: Store, L: Ledger, T: Submitter, N: Notifier> Reconciler<S, L, T, N> {
    pub fn new(
        registry: GameRegistry<S>,
        ledger: L,
        submitter: T,
        notifier: N,
        user: Address,
        factory: Address,
        timeout_in_blocks: u64,
    ) -> Self {
        Self {
            registry,
            scheduler: TimeoutScheduler::new(),
            ledger,
            submitter,
            notifier,
            user,
            factory,
            timeout_in_blocks,
        }
    }

    pub fn registry(&self) -> &GameRegistry<S> {
        &self.registry
    }

    /// One confirmed-block tick. Only a store failure aborts the tick;
    /// ledger and submission errors are surfaced and the affected game is
    /// retried on a later tick.
    pub async fn on_confirmed_block(&mut self, block: u64) -> Result<(), StoreError> {
        let mut decided = BTreeSet::new();
        for id in self.scheduler.pop_due(block) {
            decided.insert(id);
            self.process_game_at(block, id).await?;
        }
        for id in self.registry.active_ids() {
            self.process_active_game(block, id, &mut decided).await?;
        }
        Ok(())
    }

    /// Route a decoded creation event into the registry.
    pub fn handle_creation(&mut self, creation: &GameCreation) -> Result<(), StoreError> {
        let user = self.user;
        match self.registry.observe_creation(creation, &user)? {
            CreationDisposition::Irrelevant | CreationDisposition::AlreadyKnown(_) => {}
            CreationDisposition::Bound(id)
            | CreationDisposition::Matched(id)
            | CreationDisposition::Registered(id) => {
                self.notifier.game_updated(id, "Process New Game:");
            }
        }
        Ok(())
    }

    /// Route a decoded game event to its record via the contract index and
    /// run the state machine. Unroutable or rejected events are dropped.
    pub fn handle_event(&mut self, observed: &ObservedEvent) -> Result<(), StoreError> {
        let Some(id) = self.registry.id_by_contract(&observed.contract) else {
            tracing::debug!(contract = %hex::encode(observed.contract),
                "event for untracked contract ignored");
            return Ok(());
        };
        if self.registry.apply_event(id, observed)? {
            if self.registry.get(id).is_some_and(|g| g.is_completed) {
                self.scheduler.remove(id);
            }
            self.notifier.game_updated(id, "Game Event:");
        }
        Ok(())
    }

    /// Local initiation: commit to a fresh salted hand and ask the factory
    /// for a new game. The record is rolled back if submission fails.
    pub async fn create_game(
        &mut self,
        wager: u128,
        escrow: u128,
        opponent: Option<Address>,
        hand0: Hand,
    ) -> Result<GameId, EngineError> {
        let salt = random_salt();
        let player0_commitment = commitment(&salt, hand0);
        let timeout_in_blocks = self.timeout_in_blocks;
        let id = self.registry.create_local(
            self.user,
            opponent,
            timeout_in_blocks,
            player0_commitment,
            wager,
            escrow,
            salt,
            hand0,
        )?;
        self.notifier.game_updated(id, "Create Game:");
        let call = GameCall::Player0StartGame {
            player1: opponent,
            timeout_in_blocks,
            commitment: player0_commitment,
            wager,
            value: wager + escrow,
        };
        match self.submitter.submit(self.factory, call).await {
            Ok(tx_hash) => {
                self.registry.record_creation_tx(id, tx_hash)?;
                self.notifier.game_updated(id, "Game Submitted:");
                Ok(id)
            }
            Err(e) => {
                tracing::warn!(id, reason = %e, "game creation submission failed");
                self.registry.remove(id)?;
                Err(e.into())
            }
        }
    }

    /// Join a game as player1, playing `hand1`. Gated on the confirmed
    /// snapshot; guarded against duplicate submission.
    pub async fn accept_game(&mut self, id: GameId, hand1: Hand) -> Result<(), EngineError> {
        let Some(record) = self.registry.get(id) else {
            return Err(EngineError::Rejected(format!("no game {}", id)));
        };
        let Some(confirmed) = record.confirmed_state.as_ref() else {
            return Err(EngineError::Rejected(format!("game {} isn't confirmed yet", id)));
        };
        if confirmed.state != GameState::WaitingForPlayer1 {
            return Err(EngineError::Rejected(format!("game {} isn't open to a wager", id)));
        }
        if !record.player1.map_or(true, |p| p == self.user) {
            return Err(EngineError::Rejected(format!("game {} isn't open to you", id)));
        }
        if let Some(tx) = record.player1_show_hand_tx {
            return Err(EngineError::Rejected(format!(
                "already played on game {} in tx 0x{}",
                id,
                hex::encode(tx)
            )));
        }
        let Some(contract) = record.contract else {
            return Err(EngineError::Rejected(format!("game {} has no contract", id)));
        };
        let value = record.wager;
        self.registry.update(id, |r| r.hand1 = Some(hand1))?;
        let tx_hash = self
            .submitter
            .submit(contract, GameCall::Player1ShowHand { hand: hand1, value })
            .await?;
        self.registry
            .update(id, |r| r.player1_show_hand_tx = Some(tx_hash))?;
        self.notifier.game_updated(id, "Accept Game:");
        Ok(())
    }

    pub fn dismiss_game(&mut self, id: GameId) -> Result<bool, StoreError> {
        let dismissed = self.registry.dismiss(id)?;
        if dismissed {
            self.scheduler.remove(id);
            self.notifier.game_updated(id, "Dismiss Game:");
        }
        Ok(dismissed)
    }

    /// Poll one active game: pending state for change detection, confirmed
    /// state for decisions. Ledger errors skip the game, never the tick.
    async fn process_active_game(
        &mut self,
        block: u64,
        id: GameId,
        decided: &mut BTreeSet<GameId>,
    ) -> Result<(), StoreError> {
        let Some(record) = self.registry.get(id) else {
            return Ok(());
        };
        let Some(contract) = record.contract else {
            // Nothing to poll until the creation is confirmed.
            return Ok(());
        };
        let last_unconfirmed = record.unconfirmed_state.clone();
        let last_confirmed = record.confirmed_state.clone();

        let pending = match self.ledger.query(contract, BlockTag::Pending).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(id, reason = %e, "pending state query failed");
                return Ok(());
            }
        };
        if last_unconfirmed.as_ref() == Some(&pending) {
            // Nothing moved since the last observation.
            return Ok(());
        }
        let confirmed = match self.ledger.query(contract, BlockTag::Number(block)).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(id, reason = %e, "confirmed state query failed");
                return Ok(());
            }
        };
        let confirmed_changed = last_confirmed.as_ref() != Some(&confirmed);
        self.registry.update(id, |r| {
            r.unconfirmed_state = Some(pending);
            r.confirmed_state = Some(confirmed);
        })?;
        self.notifier.game_updated(id, "Process Active Game:");
        if confirmed_changed && decided.insert(id) {
            self.process_game_at(block, id).await?;
        }
        Ok(())
    }

    /// The decision heart: derive the one automatic action (if any) from the
    /// state-machine-derived record, never from a raw snapshot.
    async fn process_game_at(&mut self, block: u64, id: GameId) -> Result<(), StoreError> {
        let Some(record) = self.registry.get(id).cloned() else {
            return Ok(());
        };
        if !record.is_active() {
            self.scheduler.remove(id);
            return Ok(());
        }
        if record.state == GameState::Completed {
            self.registry.update(id, |r| r.is_completed = true)?;
            self.scheduler.remove(id);
            self.notifier.game_updated(id, "Game Completed:");
            return Ok(());
        }
        let Some(contract) = record.contract else {
            return Ok(());
        };
        if record.player0 == self.user
            && record.state == GameState::WaitingForPlayer0Reveal
            && record.player0_reveal_tx.is_none()
        {
            if let (Some(salt), Some(hand0)) = (record.salt, record.hand0) {
                match self
                    .submitter
                    .submit(contract, GameCall::Player0Reveal { salt, hand: hand0 })
                    .await
                {
                    Ok(tx_hash) => {
                        self.registry
                            .update(id, |r| r.player0_reveal_tx = Some(tx_hash))?;
                        self.notifier.game_updated(id, "Reveal Submitted:");
                    }
                    Err(e) => {
                        // Guard stays unset; eligible again next tick.
                        tracing::warn!(id, reason = %e, "reveal submission failed");
                        self.scheduler.schedule(id, block + 1);
                    }
                }
                return Ok(());
            }
            tracing::warn!(
                id,
                "player1 showed a hand but the salt is not in this client; \
                 the originating instance must reveal before the deadline"
            );
        }
        if !record.deadline_passed(block) {
            // Deadline rule is strict, so the trigger is one past the window.
            self.scheduler.schedule(id, record.timeout_block() + 1);
            return Ok(());
        }
        if record.player0 == self.user
            && record.state == GameState::WaitingForPlayer1
            && record.player0_rescind_tx.is_none()
        {
            tracing::info!(id, "player1 timed out, rescinding to recover the stake");
            match self.submitter.submit(contract, GameCall::Player0Rescind).await {
                Ok(tx_hash) => {
                    self.registry
                        .update(id, |r| r.player0_rescind_tx = Some(tx_hash))?;
                    self.notifier.game_updated(id, "Rescind Submitted:");
                }
                Err(e) => {
                    tracing::warn!(id, reason = %e, "rescind submission failed");
                    self.scheduler.schedule(id, block + 1);
                }
            }
            return Ok(());
        }
        if record.player1 == Some(self.user)
            && record.state == GameState::WaitingForPlayer0Reveal
            && record.player1_win_by_default_tx.is_none()
        {
            tracing::info!(id, "player0 timed out, claiming win by default");
            match self
                .submitter
                .submit(contract, GameCall::Player1WinByDefault)
                .await
            {
                Ok(tx_hash) => {
                    self.registry
                        .update(id, |r| r.player1_win_by_default_tx = Some(tx_hash))?;
                    self.notifier.game_updated(id, "Win By Default Submitted:");
                }
                Err(e) => {
                    tracing::warn!(id, reason = %e, "win-by-default submission failed");
                    self.scheduler.schedule(id, block + 1);
                }
            }
        }
        Ok(())
    }
}
