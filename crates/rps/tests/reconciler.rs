//! Scenario tests: full ticks against mock ledger/submitter collaborators.

use rps::{
    Address, BlockTag, EngineError, GameCall, GameCreation, GameEvent, GameId, GameRegistry,
    GameSnapshot, GameState, Hand, Hash32, Ledger, LedgerError, MemoryStore, Notifier,
    ObservedEvent, Outcome, Reconciler, SubmitError, Submitter,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const USER: Address = [1u8; 20];
const OPPONENT: Address = [2u8; 20];
const FACTORY: Address = [0xf0u8; 20];
const GAME_CONTRACT: Address = [7u8; 20];
const TIMEOUT: u64 = 20;

#[derive(Clone, Default)]
struct MockLedger {
    snapshots: Arc<Mutex<HashMap<Address, GameSnapshot>>>,
}

impl MockLedger {
    fn set(&self, contract: Address, snapshot: GameSnapshot) {
        self.snapshots.lock().unwrap().insert(contract, snapshot);
    }
}

impl Ledger for MockLedger {
    async fn query(&self, contract: Address, _tag: BlockTag) -> Result<GameSnapshot, LedgerError> {
        self.snapshots
            .lock()
            .unwrap()
            .get(&contract)
            .cloned()
            .ok_or_else(|| LedgerError::Rpc("unknown contract".to_string()))
    }
}

#[derive(Clone, Default)]
struct MockSubmitter {
    calls: Arc<Mutex<Vec<(Address, GameCall)>>>,
    attempts: Arc<Mutex<u64>>,
    fail: Arc<Mutex<bool>>,
    next_hash: Arc<Mutex<u8>>,
}

impl MockSubmitter {
    fn calls(&self) -> Vec<(Address, GameCall)> {
        self.calls.lock().unwrap().clone()
    }

    fn attempts(&self) -> u64 {
        *self.attempts.lock().unwrap()
    }

    fn set_fail(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

impl Submitter for MockSubmitter {
    async fn submit(&self, contract: Address, call: GameCall) -> Result<Hash32, SubmitError> {
        *self.attempts.lock().unwrap() += 1;
        if *self.fail.lock().unwrap() {
            return Err(SubmitError::Transport("connection refused".to_string()));
        }
        self.calls.lock().unwrap().push((contract, call));
        let mut n = self.next_hash.lock().unwrap();
        *n += 1;
        Ok([*n; 32])
    }
}

#[derive(Clone, Default)]
struct RecordingNotifier {
    reasons: Arc<Mutex<Vec<(GameId, String)>>>,
}

impl Notifier for RecordingNotifier {
    fn game_updated(&self, id: GameId, reason: &str) {
        self.reasons.lock().unwrap().push((id, reason.to_string()));
    }
}

type TestReconciler = Reconciler<MemoryStore, MockLedger, MockSubmitter, RecordingNotifier>;

fn new_reconciler() -> (TestReconciler, MockLedger, MockSubmitter) {
    let registry = GameRegistry::load(MemoryStore::new()).unwrap();
    let ledger = MockLedger::default();
    let submitter = MockSubmitter::default();
    let reconciler = Reconciler::new(
        registry,
        ledger.clone(),
        submitter.clone(),
        RecordingNotifier::default(),
        USER,
        FACTORY,
        TIMEOUT,
    );
    (reconciler, ledger, submitter)
}

fn creation(player0: Address, player1: Option<Address>, commitment: Hash32, tx_hash: Hash32) -> GameCreation {
    GameCreation {
        contract: GAME_CONTRACT,
        player0,
        player1,
        timeout_in_blocks: TIMEOUT,
        player0_commitment: commitment,
        wager: 100,
        escrow: 10,
        block_number: 10,
        tx_hash,
    }
}

fn snapshot(state: GameState, previous_block: u64, player0: Address) -> GameSnapshot {
    GameSnapshot {
        state,
        outcome: Outcome::Unknown,
        timeout_in_blocks: TIMEOUT,
        previous_block,
        player0,
        player1: None,
        player0_commitment: [0u8; 32],
        wager: 100,
        escrow: 10,
        salt: [0u8; 32],
        hand0: 0,
        hand1: 0,
    }
}

fn observed(event: GameEvent, block: u64) -> ObservedEvent {
    ObservedEvent {
        event,
        contract: GAME_CONTRACT,
        block_number: block,
        tx_hash: [0xeeu8; 32],
        log_index: 0,
    }
}

/// Start a game as player0 through the full create flow and bind its
/// creation event. Returns the id; the creation tx hash is [1; 32].
async fn start_local_game(reconciler: &mut TestReconciler) -> GameId {
    let id = reconciler
        .create_game(100, 10, None, Hand::Rock)
        .await
        .unwrap();
    let commitment = reconciler.registry().get(id).unwrap().player0_commitment;
    reconciler
        .handle_creation(&creation(USER, None, commitment, [1u8; 32]))
        .unwrap();
    id
}

#[tokio::test]
async fn create_game_records_tx_and_binds_creation() {
    let (mut reconciler, _ledger, submitter) = new_reconciler();
    let id = start_local_game(&mut reconciler).await;
    let record = reconciler.registry().get(id).unwrap();
    assert_eq!(record.creation_tx, Some([1u8; 32]));
    assert_eq!(record.contract, Some(GAME_CONTRACT));
    assert_eq!(record.previous_block, 10);
    assert_eq!(record.state, GameState::WaitingForPlayer1);
    let calls = submitter.calls();
    assert_eq!(calls.len(), 1);
    assert!(matches!(
        calls[0],
        (FACTORY, GameCall::Player0StartGame { wager: 100, value: 110, .. })
    ));
}

#[tokio::test]
async fn create_game_rolls_back_on_submission_failure() {
    let (mut reconciler, _ledger, submitter) = new_reconciler();
    submitter.set_fail(true);
    let result = reconciler.create_game(100, 10, None, Hand::Rock).await;
    assert!(matches!(result, Err(EngineError::Submit(_))));
    assert!(reconciler.registry().is_empty());
}

#[tokio::test]
async fn rescind_emitted_exactly_once() {
    // No player1 response for timeoutInBlocks=20 past previousBlock=10.
    let (mut reconciler, ledger, submitter) = new_reconciler();
    let id = start_local_game(&mut reconciler).await;
    ledger.set(GAME_CONTRACT, snapshot(GameState::WaitingForPlayer1, 10, USER));

    // Deadline is block 30, exclusive: nothing at 30, queued for 31.
    reconciler.on_confirmed_block(30).await.unwrap();
    assert_eq!(submitter.calls().len(), 1, "only the creation so far");

    reconciler.on_confirmed_block(31).await.unwrap();
    let calls = submitter.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1], (GAME_CONTRACT, GameCall::Player0Rescind));
    assert_eq!(
        reconciler.registry().get(id).unwrap().player0_rescind_tx,
        Some([2u8; 32])
    );

    // Re-running the tick does not emit a second request.
    reconciler.on_confirmed_block(32).await.unwrap();
    assert_eq!(submitter.calls().len(), 2);

    // The on-chain rescind event completes the game.
    reconciler
        .handle_event(&observed(GameEvent::Player0Rescind, 33))
        .unwrap();
    let record = reconciler.registry().get(id).unwrap();
    assert_eq!(record.outcome, Some(Outcome::Player0Rescinds));
    assert!(record.is_completed);
}

#[tokio::test]
async fn submission_failure_retries_without_guard() {
    let (mut reconciler, ledger, submitter) = new_reconciler();
    let id = start_local_game(&mut reconciler).await;
    ledger.set(GAME_CONTRACT, snapshot(GameState::WaitingForPlayer1, 10, USER));
    reconciler.on_confirmed_block(30).await.unwrap();

    submitter.set_fail(true);
    reconciler.on_confirmed_block(31).await.unwrap();
    assert_eq!(submitter.attempts(), 2); // creation + failed rescind
    assert_eq!(reconciler.registry().get(id).unwrap().player0_rescind_tx, None);

    submitter.set_fail(false);
    reconciler.on_confirmed_block(32).await.unwrap();
    let calls = submitter.calls();
    assert_eq!(calls.last().unwrap(), &(GAME_CONTRACT, GameCall::Player0Rescind));
    assert!(reconciler.registry().get(id).unwrap().player0_rescind_tx.is_some());
}

#[tokio::test]
async fn reveal_emitted_once_secret_is_local() {
    let (mut reconciler, ledger, submitter) = new_reconciler();
    let id = start_local_game(&mut reconciler).await;
    let salt = reconciler.registry().get(id).unwrap().salt.unwrap();

    // Player1 shows Paper (beats Rock) at block 50.
    reconciler
        .handle_event(&observed(
            GameEvent::Player1ShowHand {
                player1: OPPONENT,
                hand1: Hand::Paper as u8,
            },
            50,
        ))
        .unwrap();
    let record = reconciler.registry().get(id).unwrap();
    assert_eq!(record.state, GameState::WaitingForPlayer0Reveal);
    assert_eq!(record.previous_block, 50);

    ledger.set(GAME_CONTRACT, snapshot(GameState::WaitingForPlayer0Reveal, 50, USER));
    reconciler.on_confirmed_block(52).await.unwrap();
    let calls = submitter.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[1],
        (GAME_CONTRACT, GameCall::Player0Reveal { salt, hand: Hand::Rock })
    );

    // Second tick must not re-submit: the guard is set.
    reconciler.on_confirmed_block(53).await.unwrap();
    assert_eq!(submitter.calls().len(), 2);

    // The reveal event lands; the game completes with player1 winning.
    reconciler
        .handle_event(&observed(
            GameEvent::Player0Reveal {
                salt,
                hand0: Hand::Rock as u8,
                outcome: Outcome::Player1Wins as u8,
            },
            55,
        ))
        .unwrap();
    let record = reconciler.registry().get(id).unwrap();
    assert_eq!(record.state, GameState::Completed);
    assert_eq!(record.outcome, Some(Outcome::Player1Wins));
    assert!(record.is_completed);
}

#[tokio::test]
async fn win_by_default_claimed_after_deadline() {
    let (mut reconciler, ledger, submitter) = new_reconciler();
    // Foreign game naming us player1.
    reconciler
        .handle_creation(&creation(OPPONENT, Some(USER), [5u8; 32], [0xabu8; 32]))
        .unwrap();
    let id = reconciler.registry().id_by_contract(&GAME_CONTRACT).unwrap();

    // We showed our hand at block 50; player0 never reveals.
    reconciler
        .handle_event(&observed(
            GameEvent::Player1ShowHand {
                player1: USER,
                hand1: Hand::Scissors as u8,
            },
            50,
        ))
        .unwrap();
    ledger.set(
        GAME_CONTRACT,
        snapshot(GameState::WaitingForPlayer0Reveal, 50, OPPONENT),
    );

    reconciler.on_confirmed_block(70).await.unwrap();
    assert!(submitter.calls().is_empty(), "deadline is block 70, exclusive");

    reconciler.on_confirmed_block(71).await.unwrap();
    let calls = submitter.calls();
    assert_eq!(calls, vec![(GAME_CONTRACT, GameCall::Player1WinByDefault)]);
    assert!(reconciler
        .registry()
        .get(id)
        .unwrap()
        .player1_win_by_default_tx
        .is_some());

    reconciler.on_confirmed_block(72).await.unwrap();
    assert_eq!(submitter.calls().len(), 1);
}

#[tokio::test]
async fn accept_game_guards_against_double_play() {
    let (mut reconciler, ledger, submitter) = new_reconciler();
    // Open game proposed by someone else.
    reconciler
        .handle_creation(&creation(OPPONENT, None, [5u8; 32], [0xabu8; 32]))
        .unwrap();
    let id = reconciler.registry().id_by_contract(&GAME_CONTRACT).unwrap();

    // Not confirmed yet: acceptance refused.
    assert!(matches!(
        reconciler.accept_game(id, Hand::Paper).await,
        Err(EngineError::Rejected(_))
    ));

    ledger.set(GAME_CONTRACT, snapshot(GameState::WaitingForPlayer1, 10, OPPONENT));
    reconciler.on_confirmed_block(12).await.unwrap();
    reconciler.accept_game(id, Hand::Paper).await.unwrap();
    let calls = submitter.calls();
    assert_eq!(
        calls,
        vec![(
            GAME_CONTRACT,
            GameCall::Player1ShowHand { hand: Hand::Paper, value: 100 }
        )]
    );
    let record = reconciler.registry().get(id).unwrap();
    assert_eq!(record.hand1, Some(Hand::Paper));
    assert!(record.player1_show_hand_tx.is_some());

    // Second acceptance refused by the idempotency guard.
    assert!(matches!(
        reconciler.accept_game(id, Hand::Rock).await,
        Err(EngineError::Rejected(_))
    ));
    assert_eq!(submitter.calls().len(), 1);
}

#[tokio::test]
async fn completed_games_leave_the_active_set() {
    let (mut reconciler, ledger, submitter) = new_reconciler();
    let id = start_local_game(&mut reconciler).await;
    ledger.set(GAME_CONTRACT, snapshot(GameState::WaitingForPlayer1, 10, USER));
    reconciler.on_confirmed_block(15).await.unwrap();
    assert_eq!(reconciler.registry().active_ids(), vec![id]);

    reconciler
        .handle_event(&observed(GameEvent::Player0Rescind, 31))
        .unwrap();
    assert!(reconciler.registry().active_ids().is_empty());
    assert!(reconciler.registry().get(id).unwrap().is_completed);

    // Further ticks do nothing for the completed game.
    let before = submitter.attempts();
    reconciler.on_confirmed_block(40).await.unwrap();
    assert_eq!(submitter.attempts(), before);

    assert!(reconciler.dismiss_game(id).unwrap());
    assert!(reconciler.registry().get(id).unwrap().is_dismissed);
}

#[tokio::test]
async fn events_for_untracked_contracts_ignored() {
    let (mut reconciler, _ledger, _submitter) = new_reconciler();
    let mut event = observed(GameEvent::Player0Rescind, 40);
    event.contract = [0x99u8; 20];
    reconciler.handle_event(&event).unwrap();
    assert!(reconciler.registry().is_empty());
}

#[tokio::test]
async fn out_of_order_event_leaves_record_untouched() {
    let (mut reconciler, _ledger, _submitter) = new_reconciler();
    let id = start_local_game(&mut reconciler).await;
    let before = reconciler.registry().get(id).unwrap().clone();
    // A reveal before any show-hand is a protocol violation: dropped.
    reconciler
        .handle_event(&observed(
            GameEvent::Player0Reveal {
                salt: [0u8; 32],
                hand0: 0,
                outcome: 1,
            },
            40,
        ))
        .unwrap();
    assert_eq!(reconciler.registry().get(id).unwrap(), &before);
}

#[tokio::test]
async fn ledger_errors_skip_the_game_not_the_tick() {
    let (mut reconciler, _ledger, submitter) = new_reconciler();
    let id = start_local_game(&mut reconciler).await;
    // The ledger knows nothing about the contract: every query errors.
    reconciler.on_confirmed_block(31).await.unwrap();
    assert_eq!(submitter.calls().len(), 1, "only the creation submission");
    assert_eq!(
        reconciler.registry().get(id).unwrap().player0_rescind_tx,
        None
    );
}
