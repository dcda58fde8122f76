//! Game records and the pure protocol state machine.
//!
//! `apply` is the only way a protocol event mutates a game: it either returns
//! the next record or a [ProtocolError], leaving the input untouched. Callers
//! drop rejected events after logging; a rejection is never fatal to the
//! engine.

use crate::abi::{GameCreation, GameEvent, ObservedEvent};
use crate::hand::{commitment, outcome_of_hands, Address, Hand, Hash32, Outcome};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Locally assigned sequential game identifier.
pub type GameId = u64;

/// Protocol state, matching the contract's declaration order. Forward-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum GameState {
    Uninitialized = 0,
    WaitingForPlayer1 = 1,
    WaitingForPlayer0Reveal = 2,
    Completed = 3,
}

impl GameState {
    pub fn from_u8(n: u8) -> Option<Self> {
        match n {
            0 => Some(GameState::Uninitialized),
            1 => Some(GameState::WaitingForPlayer1),
            2 => Some(GameState::WaitingForPlayer0Reveal),
            3 => Some(GameState::Completed),
            _ => None,
        }
    }
}

/// The full on-chain tuple as reported by `query_state()` at a block tag.
/// Used only for change detection, never for protocol decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSnapshot {
    pub state: GameState,
    pub outcome: Outcome,
    pub timeout_in_blocks: u64,
    pub previous_block: u64,
    pub player0: Address,
    pub player1: Option<Address>,
    pub player0_commitment: Hash32,
    pub wager: u128,
    pub escrow: u128,
    pub salt: Hash32,
    pub hand0: u8,
    pub hand1: u8,
}

/// One tracked game. Created by local initiation or by observing a creation
/// event; mutated only through [apply] or confirmation-shadow updates; never
/// deleted (terminal records persist until dismissed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameRecord {
    pub id: GameId,
    /// Assigned once the creation transaction is confirmed.
    pub contract: Option<Address>,
    pub player0: Address,
    /// None = open to anyone.
    pub player1: Option<Address>,
    pub timeout_in_blocks: u64,
    /// Block at which the current state began; deadlines count from here.
    pub previous_block: u64,
    pub wager: u128,
    pub escrow: u128,
    /// Known only to the originating client; absent if another instance
    /// created the game.
    pub salt: Option<Hash32>,
    pub hand0: Option<Hand>,
    pub player0_commitment: Hash32,
    pub hand1: Option<Hand>,
    pub outcome: Option<Outcome>,
    pub state: GameState,
    // Idempotency guards: set once, on confirmed submission, never cleared.
    pub creation_tx: Option<Hash32>,
    pub player0_reveal_tx: Option<Hash32>,
    pub player0_rescind_tx: Option<Hash32>,
    pub player1_show_hand_tx: Option<Hash32>,
    pub player1_win_by_default_tx: Option<Hash32>,
    pub is_completed: bool,
    pub is_dismissed: bool,
    pub confirmed_state: Option<GameSnapshot>,
    pub unconfirmed_state: Option<GameSnapshot>,
}

impl GameRecord {
    /// A record as first created locally (before any transaction), or as
    /// registered from a foreign creation event (then `contract` and
    /// `creation_tx` get filled in by the caller).
    pub fn new(
        id: GameId,
        player0: Address,
        player1: Option<Address>,
        timeout_in_blocks: u64,
        player0_commitment: Hash32,
        wager: u128,
        escrow: u128,
    ) -> Self {
        Self {
            id,
            contract: None,
            player0,
            player1,
            timeout_in_blocks,
            previous_block: 0,
            wager,
            escrow,
            salt: None,
            hand0: None,
            player0_commitment,
            hand1: None,
            outcome: None,
            state: GameState::WaitingForPlayer1,
            creation_tx: None,
            player0_reveal_tx: None,
            player0_rescind_tx: None,
            player1_show_hand_tx: None,
            player1_win_by_default_tx: None,
            is_completed: false,
            is_dismissed: false,
            confirmed_state: None,
            unconfirmed_state: None,
        }
    }

    /// Build a record from a decoded creation event (foreign game, or a local
    /// game started on another client instance).
    pub fn from_creation(id: GameId, creation: &GameCreation) -> Self {
        let mut record = Self::new(
            id,
            creation.player0,
            creation.player1,
            creation.timeout_in_blocks,
            creation.player0_commitment,
            creation.wager,
            creation.escrow,
        );
        record.contract = Some(creation.contract);
        record.creation_tx = Some(creation.tx_hash);
        record.previous_block = creation.block_number;
        record
    }

    /// First block at which a deadline action becomes legal is
    /// `timeout_block() + 1` (the deadline rule is strict).
    pub fn timeout_block(&self) -> u64 {
        self.previous_block + self.timeout_in_blocks
    }

    pub fn deadline_passed(&self, block: u64) -> bool {
        block > self.timeout_block()
    }

    pub fn is_active(&self) -> bool {
        !self.is_completed && !self.is_dismissed
    }
}

/// Protocol violations: the event is dropped, the record left unmodified.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("{event} received in state {state:?}")]
    WrongState {
        event: &'static str,
        state: GameState,
    },
    #[error("invalid hand {0} in event")]
    InvalidHand(u8),
    #[error("invalid outcome {0} in event")]
    InvalidOutcome(u8),
    #[error("player1 0x{} does not match the designated player", hex::encode(.0))]
    PlayerMismatch(Address),
    #[error("reveal does not match player0's commitment")]
    CommitmentMismatch,
    #[error("revealed secret disagrees with the locally known one")]
    SecretMismatch,
    #[error("reported outcome {reported:?} != locally computed {computed:?}")]
    OutcomeMismatch {
        reported: Outcome,
        computed: Outcome,
    },
    #[error("timeout claimed at block {block}, deadline is block {deadline} exclusive")]
    PrematureTimeout { block: u64, deadline: u64 },
}

/// Pure transition function from (record, observed event) to the next record.
pub fn apply(record: &GameRecord, observed: &ObservedEvent) -> Result<GameRecord, ProtocolError> {
    match &observed.event {
        GameEvent::Player1ShowHand { player1, hand1 } => {
            player1_show_hand(record, observed.block_number, *player1, *hand1)
        }
        GameEvent::Player0Reveal {
            salt,
            hand0,
            outcome,
        } => player0_reveal(record, observed.block_number, salt, *hand0, *outcome),
        GameEvent::Player0Rescind => player0_rescind(record, observed.block_number),
        GameEvent::Player1WinByDefault => player1_win_by_default(record, observed.block_number),
    }
}

fn require_state(
    record: &GameRecord,
    expected: GameState,
    event: &'static str,
) -> Result<(), ProtocolError> {
    if record.state != expected {
        return Err(ProtocolError::WrongState {
            event,
            state: record.state,
        });
    }
    Ok(())
}

fn check_timeout(record: &GameRecord, block: u64) -> Result<(), ProtocolError> {
    if !record.deadline_passed(block) {
        return Err(ProtocolError::PrematureTimeout {
            block,
            deadline: record.timeout_block(),
        });
    }
    Ok(())
}

fn player1_show_hand(
    record: &GameRecord,
    block: u64,
    player1: Address,
    hand1: u8,
) -> Result<GameRecord, ProtocolError> {
    require_state(record, GameState::WaitingForPlayer1, "Player1ShowHand")?;
    let hand1 = Hand::from_u8(hand1).ok_or(ProtocolError::InvalidHand(hand1))?;
    if let Some(designated) = record.player1 {
        if designated != player1 {
            return Err(ProtocolError::PlayerMismatch(player1));
        }
    }
    let mut next = record.clone();
    next.player1 = Some(player1);
    next.hand1 = Some(hand1);
    next.previous_block = block;
    next.state = GameState::WaitingForPlayer0Reveal;
    Ok(next)
}

fn player0_reveal(
    record: &GameRecord,
    block: u64,
    salt: &Hash32,
    hand0: u8,
    outcome: u8,
) -> Result<GameRecord, ProtocolError> {
    require_state(record, GameState::WaitingForPlayer0Reveal, "Player0Reveal")?;
    let hand0 = Hand::from_u8(hand0).ok_or(ProtocolError::InvalidHand(hand0))?;
    let outcome = Outcome::from_u8(outcome).ok_or(ProtocolError::InvalidOutcome(outcome))?;
    // A locally known secret must agree byte-for-byte with the reveal; a
    // disagreement is a hard violation, never silently resolved.
    if record.salt.is_some_and(|known| known != *salt)
        || record.hand0.is_some_and(|known| known != hand0)
    {
        return Err(ProtocolError::SecretMismatch);
    }
    if commitment(salt, hand0) != record.player0_commitment {
        return Err(ProtocolError::CommitmentMismatch);
    }
    let hand1 = record.hand1.ok_or(ProtocolError::WrongState {
        event: "Player0Reveal",
        state: record.state,
    })?;
    let computed = outcome_of_hands(hand0, hand1);
    if outcome != computed {
        return Err(ProtocolError::OutcomeMismatch {
            reported: outcome,
            computed,
        });
    }
    let mut next = record.clone();
    next.salt = Some(*salt);
    next.hand0 = Some(hand0);
    next.outcome = Some(outcome);
    next.previous_block = block;
    next.state = GameState::Completed;
    next.is_completed = true;
    Ok(next)
}

fn player0_rescind(record: &GameRecord, block: u64) -> Result<GameRecord, ProtocolError> {
    require_state(record, GameState::WaitingForPlayer1, "Player0Rescind")?;
    check_timeout(record, block)?;
    let mut next = record.clone();
    next.outcome = Some(Outcome::Player0Rescinds);
    next.previous_block = block;
    next.state = GameState::Completed;
    next.is_completed = true;
    Ok(next)
}

fn player1_win_by_default(record: &GameRecord, block: u64) -> Result<GameRecord, ProtocolError> {
    require_state(
        record,
        GameState::WaitingForPlayer0Reveal,
        "Player1WinByDefault",
    )?;
    check_timeout(record, block)?;
    let mut next = record.clone();
    next.outcome = Some(Outcome::Player1WinsByDefault);
    next.previous_block = block;
    next.state = GameState::Completed;
    next.is_completed = true;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hand::random_salt;

    const PLAYER0: Address = [1u8; 20];
    const PLAYER1: Address = [2u8; 20];

    fn committed_record(salt: &Hash32, hand0: Hand) -> GameRecord {
        let mut record = GameRecord::new(
            0,
            PLAYER0,
            None,
            20,
            commitment(salt, hand0),
            100,
            10,
        );
        record.contract = Some([7u8; 20]);
        record.previous_block = 10;
        record
    }

    fn observed(event: GameEvent, block: u64) -> ObservedEvent {
        ObservedEvent {
            event,
            contract: [7u8; 20],
            block_number: block,
            tx_hash: [0xabu8; 32],
            log_index: 0,
        }
    }

    fn show_hand(player1: Address, hand1: u8, block: u64) -> ObservedEvent {
        observed(GameEvent::Player1ShowHand { player1, hand1 }, block)
    }

    #[test]
    fn show_hand_binds_open_slot() {
        let salt = random_salt();
        let record = committed_record(&salt, Hand::Rock);
        let next = apply(&record, &show_hand(PLAYER1, Hand::Paper as u8, 50)).unwrap();
        assert_eq!(next.player1, Some(PLAYER1));
        assert_eq!(next.hand1, Some(Hand::Paper));
        assert_eq!(next.previous_block, 50);
        assert_eq!(next.state, GameState::WaitingForPlayer0Reveal);
    }

    #[test]
    fn show_hand_rejects_wrong_sender() {
        let salt = random_salt();
        let mut record = committed_record(&salt, Hand::Rock);
        record.player1 = Some(PLAYER1);
        let intruder = [9u8; 20];
        assert_eq!(
            apply(&record, &show_hand(intruder, 0, 50)),
            Err(ProtocolError::PlayerMismatch(intruder))
        );
    }

    #[test]
    fn show_hand_rejects_invalid_hand() {
        let salt = random_salt();
        let record = committed_record(&salt, Hand::Rock);
        assert_eq!(
            apply(&record, &show_hand(PLAYER1, 3, 50)),
            Err(ProtocolError::InvalidHand(3))
        );
    }

    #[test]
    fn illegal_event_leaves_record_unchanged() {
        let salt = random_salt();
        let record = committed_record(&salt, Hand::Rock);
        let before = record.clone();
        let reveal = observed(
            GameEvent::Player0Reveal {
                salt,
                hand0: Hand::Rock as u8,
                outcome: Outcome::Draw as u8,
            },
            50,
        );
        assert!(apply(&record, &reveal).is_err());
        assert_eq!(record, before);
    }

    #[test]
    fn duplicate_show_hand_rejected() {
        let salt = random_salt();
        let record = committed_record(&salt, Hand::Rock);
        let event = show_hand(PLAYER1, Hand::Paper as u8, 50);
        let once = apply(&record, &event).unwrap();
        assert_eq!(
            apply(&once, &event),
            Err(ProtocolError::WrongState {
                event: "Player1ShowHand",
                state: GameState::WaitingForPlayer0Reveal,
            })
        );
    }

    #[test]
    fn reveal_requires_commitment_match() {
        let salt = random_salt();
        let record = committed_record(&salt, Hand::Rock);
        let record = apply(&record, &show_hand(PLAYER1, Hand::Paper as u8, 50)).unwrap();
        let wrong_salt = random_salt();
        let reveal = observed(
            GameEvent::Player0Reveal {
                salt: wrong_salt,
                hand0: Hand::Rock as u8,
                outcome: Outcome::Player1Wins as u8,
            },
            55,
        );
        assert_eq!(apply(&record, &reveal), Err(ProtocolError::CommitmentMismatch));
        assert_eq!(record.state, GameState::WaitingForPlayer0Reveal);
    }

    #[test]
    fn reveal_rejects_local_secret_mismatch() {
        let salt = random_salt();
        let mut record = committed_record(&salt, Hand::Rock);
        record.salt = Some(salt);
        record.hand0 = Some(Hand::Rock);
        let record = apply(&record, &show_hand(PLAYER1, Hand::Paper as u8, 50)).unwrap();
        let other_salt = random_salt();
        let reveal = observed(
            GameEvent::Player0Reveal {
                salt: other_salt,
                hand0: Hand::Rock as u8,
                outcome: Outcome::Player1Wins as u8,
            },
            55,
        );
        assert_eq!(apply(&record, &reveal), Err(ProtocolError::SecretMismatch));
    }

    #[test]
    fn reveal_rejects_wrong_reported_outcome() {
        let salt = random_salt();
        let record = committed_record(&salt, Hand::Rock);
        let record = apply(&record, &show_hand(PLAYER1, Hand::Paper as u8, 50)).unwrap();
        let reveal = observed(
            GameEvent::Player0Reveal {
                salt,
                hand0: Hand::Rock as u8,
                outcome: Outcome::Player0Wins as u8,
            },
            55,
        );
        assert_eq!(
            apply(&record, &reveal),
            Err(ProtocolError::OutcomeMismatch {
                reported: Outcome::Player0Wins,
                computed: Outcome::Player1Wins,
            })
        );
    }

    #[test]
    fn reveal_completes_game() {
        // Wager 100, escrow 10; player1 shows Paper (beats Rock) at block 50.
        let salt = random_salt();
        let record = committed_record(&salt, Hand::Rock);
        let record = apply(&record, &show_hand(PLAYER1, Hand::Paper as u8, 50)).unwrap();
        let reveal = observed(
            GameEvent::Player0Reveal {
                salt,
                hand0: Hand::Rock as u8,
                outcome: Outcome::Player1Wins as u8,
            },
            55,
        );
        let done = apply(&record, &reveal).unwrap();
        assert_eq!(done.state, GameState::Completed);
        assert_eq!(done.outcome, Some(Outcome::Player1Wins));
        assert!(done.is_completed);
        assert_eq!(done.salt, Some(salt));
        assert_eq!(done.hand0, Some(Hand::Rock));
    }

    #[test]
    fn rescind_boundary_is_strict() {
        let salt = random_salt();
        let record = committed_record(&salt, Hand::Rock);
        // previous_block 10, timeout 20: deadline block is 30, exclusive.
        let at_deadline = observed(GameEvent::Player0Rescind, 30);
        assert_eq!(
            apply(&record, &at_deadline),
            Err(ProtocolError::PrematureTimeout {
                block: 30,
                deadline: 30,
            })
        );
        let past_deadline = observed(GameEvent::Player0Rescind, 31);
        let done = apply(&record, &past_deadline).unwrap();
        assert_eq!(done.outcome, Some(Outcome::Player0Rescinds));
        assert_eq!(done.state, GameState::Completed);
    }

    #[test]
    fn win_by_default_requires_reveal_state_and_deadline() {
        let salt = random_salt();
        let record = committed_record(&salt, Hand::Rock);
        assert!(matches!(
            apply(&record, &observed(GameEvent::Player1WinByDefault, 100)),
            Err(ProtocolError::WrongState { .. })
        ));
        let record = apply(&record, &show_hand(PLAYER1, Hand::Paper as u8, 50)).unwrap();
        assert!(matches!(
            apply(&record, &observed(GameEvent::Player1WinByDefault, 70)),
            Err(ProtocolError::PrematureTimeout { .. })
        ));
        let done = apply(&record, &observed(GameEvent::Player1WinByDefault, 71)).unwrap();
        assert_eq!(done.outcome, Some(Outcome::Player1WinsByDefault));
        assert!(done.is_completed);
    }
}
