//! Game registry: the id -> record map and its secondary indices, persisted
//! through the [Store] seam.
//!
//! Every mutation persists the new record before replacing it in memory and
//! re-deriving the indices, so a crash never leaves a half-applied
//! transition (state advanced but guard not recorded).

use crate::abi::{GameCreation, ObservedEvent};
use crate::game::{apply, GameId, GameRecord};
use crate::hand::{Address, Hand, Hash32};
use crate::store::{Store, StoreError};
use std::collections::{BTreeMap, BTreeSet, HashMap};

const NEXT_ID_KEY: &str = "next_id";

fn game_key(id: GameId) -> String {
    format!("game/{}", id)
}

/// How an observed creation event was reconciled against local records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationDisposition {
    /// Transaction hash known and contract already bound; nothing to do.
    AlreadyKnown(GameId),
    /// Bound the contract address and block to the record tracking this tx.
    Bound(GameId),
    /// Crash-recovery: matched a pending local record on all six terms.
    Matched(GameId),
    /// Registered a fresh record (foreign game, or started on another client).
    Registered(GameId),
    /// Not our game.
    Irrelevant,
}

pub struct GameRegistry<S: Store> {
    store: S,
    games: BTreeMap<GameId, GameRecord>,
    by_tx_hash: HashMap<Hash32, GameId>,
    by_contract: HashMap<Address, GameId>,
    active: BTreeSet<GameId>,
    /// Local creations whose submitted tx hash never made it to the store
    /// (crash between submission and write), awaiting a match by terms.
    unconfirmed: BTreeSet<GameId>,
    next_id: GameId,
}

impl<S: Store> GameRegistry<S> {
    /// Resume tracking from persisted records.
    pub fn load(store: S) -> Result<Self, StoreError> {
        let next_id = match store.get(NEXT_ID_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                key: NEXT_ID_KEY.to_string(),
                reason: e.to_string(),
            })?,
            None => 0,
        };
        let mut registry = Self {
            store,
            games: BTreeMap::new(),
            by_tx_hash: HashMap::new(),
            by_contract: HashMap::new(),
            active: BTreeSet::new(),
            unconfirmed: BTreeSet::new(),
            next_id,
        };
        for key in registry.store.keys_with_prefix("game/")? {
            let bytes = registry
                .store
                .get(&key)?
                .ok_or_else(|| StoreError::Corrupt {
                    key: key.clone(),
                    reason: "listed but unreadable".to_string(),
                })?;
            let record: GameRecord =
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
            registry.index(&record);
            registry.games.insert(record.id, record);
        }
        Ok(registry)
    }

    fn persist(&mut self, record: &GameRecord) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(record).map_err(|e| StoreError::Write(e.to_string()))?;
        self.store.put(&game_key(record.id), &bytes)
    }

    fn persist_next_id(&mut self) -> Result<(), StoreError> {
        let bytes =
            serde_json::to_vec(&self.next_id).map_err(|e| StoreError::Write(e.to_string()))?;
        self.store.put(NEXT_ID_KEY, &bytes)
    }

    fn index(&mut self, record: &GameRecord) {
        let id = record.id;
        if let Some(contract) = record.contract {
            self.by_contract.insert(contract, id);
        }
        if let Some(tx) = record.creation_tx {
            self.by_tx_hash.insert(tx, id);
            self.unconfirmed.remove(&id);
        } else {
            self.unconfirmed.insert(id);
        }
        if record.is_active() {
            self.active.insert(id);
        } else {
            self.active.remove(&id);
        }
    }

    /// Persist `record` and only then install it and refresh the indices.
    fn commit(&mut self, record: GameRecord) -> Result<(), StoreError> {
        self.persist(&record)?;
        self.index(&record);
        self.games.insert(record.id, record);
        Ok(())
    }

    /// Local initiation: player0 starts a game with a known secret. The game
    /// sits in the unconfirmed set until [record_creation_tx].
    #[allow(clippy::too_many_arguments)]
    pub fn create_local(
        &mut self,
        player0: Address,
        player1: Option<Address>,
        timeout_in_blocks: u64,
        player0_commitment: Hash32,
        wager: u128,
        escrow: u128,
        salt: Hash32,
        hand0: Hand,
    ) -> Result<GameId, StoreError> {
        let id = self.next_id;
        self.next_id += 1;
        self.persist_next_id()?;
        let mut record = GameRecord::new(
            id,
            player0,
            player1,
            timeout_in_blocks,
            player0_commitment,
            wager,
            escrow,
        );
        record.salt = Some(salt);
        record.hand0 = Some(hand0);
        self.commit(record)?;
        Ok(id)
    }

    /// Record the submitted creation tx hash, moving the game out of the
    /// crash-recovery set.
    pub fn record_creation_tx(&mut self, id: GameId, tx_hash: Hash32) -> Result<(), StoreError> {
        self.update(id, |record| record.creation_tx = Some(tx_hash))
    }

    /// Roll back a creation whose submission failed.
    pub fn remove(&mut self, id: GameId) -> Result<(), StoreError> {
        self.store.remove(&game_key(id))?;
        if let Some(record) = self.games.remove(&id) {
            if let Some(contract) = record.contract {
                self.by_contract.remove(&contract);
            }
            if let Some(tx) = record.creation_tx {
                self.by_tx_hash.remove(&tx);
            }
        }
        self.active.remove(&id);
        self.unconfirmed.remove(&id);
        Ok(())
    }

    /// Mutate one record atomically (persist first, then install).
    pub fn update(
        &mut self,
        id: GameId,
        f: impl FnOnce(&mut GameRecord),
    ) -> Result<(), StoreError> {
        let Some(record) = self.games.get(&id) else {
            return Ok(());
        };
        let mut next = record.clone();
        f(&mut next);
        self.commit(next)
    }

    /// Reconcile a decoded creation event against local state (§ creation-time
    /// matching): by tx hash first, then — for our own games — by exact
    /// equality of all six terms against the crash-recovery set.
    pub fn observe_creation(
        &mut self,
        creation: &GameCreation,
        user: &Address,
    ) -> Result<CreationDisposition, StoreError> {
        let relevant = creation.player0 == *user
            || creation.player1 == Some(*user)
            || creation.player1.is_none();
        if !relevant {
            return Ok(CreationDisposition::Irrelevant);
        }
        if let Some(&id) = self.by_tx_hash.get(&creation.tx_hash) {
            let known = self.games.get(&id).and_then(|g| g.contract);
            if known.is_some() {
                return Ok(CreationDisposition::AlreadyKnown(id));
            }
            self.update(id, |record| {
                record.contract = Some(creation.contract);
                record.previous_block = creation.block_number;
            })?;
            return Ok(CreationDisposition::Bound(id));
        }
        if creation.player0 == *user {
            // We are player0 but don't know this tx: either we crashed before
            // the hash was stored, or the game was started elsewhere.
            let matched = self
                .unconfirmed
                .iter()
                .copied()
                .find(|id| self.games.get(id).is_some_and(|g| terms_match(creation, g)));
            if let Some(id) = matched {
                self.update(id, |record| {
                    record.contract = Some(creation.contract);
                    record.previous_block = creation.block_number;
                    record.creation_tx = Some(creation.tx_hash);
                })?;
                tracing::info!(id, contract = %hex::encode(creation.contract),
                    "matched creation event to interrupted local game");
                return Ok(CreationDisposition::Matched(id));
            }
            tracing::warn!(contract = %hex::encode(creation.contract),
                "our game was created on another client; secret not available here");
        }
        let id = self.register(creation)?;
        Ok(CreationDisposition::Registered(id))
    }

    fn register(&mut self, creation: &GameCreation) -> Result<GameId, StoreError> {
        let id = self.next_id;
        self.next_id += 1;
        self.persist_next_id()?;
        self.commit(GameRecord::from_creation(id, creation))?;
        Ok(id)
    }

    /// Run the state machine on one game. A [ProtocolError] drops the event
    /// with a warning and returns Ok(false); the record is left untouched.
    pub fn apply_event(
        &mut self,
        id: GameId,
        observed: &ObservedEvent,
    ) -> Result<bool, StoreError> {
        let Some(record) = self.games.get(&id) else {
            return Ok(false);
        };
        match apply(record, observed) {
            Ok(next) => {
                tracing::info!(id, state = ?next.state, "game transition");
                self.commit(next)?;
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(id, block = observed.block_number, reason = %e,
                    "dropped protocol event");
                Ok(false)
            }
        }
    }

    /// Dismissal only hides a completed game; the record persists.
    pub fn dismiss(&mut self, id: GameId) -> Result<bool, StoreError> {
        let completed = self.games.get(&id).is_some_and(|g| g.is_completed);
        if !completed {
            return Ok(false);
        }
        self.update(id, |record| record.is_dismissed = true)?;
        Ok(true)
    }

    pub fn get(&self, id: GameId) -> Option<&GameRecord> {
        self.games.get(&id)
    }

    pub fn id_by_tx_hash(&self, tx_hash: &Hash32) -> Option<GameId> {
        self.by_tx_hash.get(tx_hash).copied()
    }

    pub fn id_by_contract(&self, contract: &Address) -> Option<GameId> {
        self.by_contract.get(contract).copied()
    }

    pub fn active_ids(&self) -> Vec<GameId> {
        self.active.iter().copied().collect()
    }

    pub fn unconfirmed_ids(&self) -> Vec<GameId> {
        self.unconfirmed.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.games.len()
    }

    pub fn is_empty(&self) -> bool {
        self.games.is_empty()
    }
}

/// Exact equality across all six creation terms; partial matches are never
/// accepted.
fn terms_match(creation: &GameCreation, record: &GameRecord) -> bool {
    creation.player0 == record.player0
        && creation.player1 == record.player1
        && creation.timeout_in_blocks == record.timeout_in_blocks
        && creation.player0_commitment == record.player0_commitment
        && creation.wager == record.wager
        && creation.escrow == record.escrow
}
