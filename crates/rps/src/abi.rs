//! ABI types and decoding for the RPS factory and game contracts.
//!
//! Log payloads are partitioned into 32-byte big-endian words by positional
//! index; each event kind has a fixed word schema selected purely from topic0.
//! The topic table is built once at startup from the event signatures.

use crate::game::{GameSnapshot, GameState};
use crate::hand::{Address, Hash32, Outcome};
use serde_json::Value;
use sha3::{Digest, Keccak256};
use std::collections::HashMap;
use thiserror::Error;

/// Event signatures as deployed. The factory emits `Created`; the game
/// contracts emit the four protocol events.
pub const CREATED_SIG: &str = "Created(address,address,address,uint256,bytes32,uint256,uint256)";
pub const PLAYER1_SHOW_HAND_SIG: &str = "Player1ShowHand(address,uint8)";
pub const PLAYER0_REVEAL_SIG: &str = "Player0Reveal(bytes32,uint8,uint8)";
pub const PLAYER0_RESCIND_SIG: &str = "Player0Rescind()";
pub const PLAYER1_WIN_BY_DEFAULT_SIG: &str = "Player1WinByDefault()";

/// Selector for `query_state()`.
pub const QUERY_STATE_SIG: &str = "query_state()";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unrecognized topic 0x{0}")]
    UnknownTopic(String),
    #[error("{kind}: expected {expected} data words, got {got}")]
    WordCount {
        kind: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("bad word: {0}")]
    BadWord(&'static str),
    #[error("missing log field: {0}")]
    MissingField(&'static str),
    #[error("bad creation receipt: {0}")]
    BadReceipt(String),
    #[error("bad hex: {0}")]
    BadHex(&'static str),
}

/// Tracked event kinds, one per topic0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Player1ShowHand,
    Player0Reveal,
    Player0Rescind,
    Player1WinByDefault,
}

impl EventKind {
    fn word_count(self) -> usize {
        match self {
            EventKind::Created => 7,
            EventKind::Player1ShowHand => 2,
            EventKind::Player0Reveal => 3,
            EventKind::Player0Rescind => 0,
            EventKind::Player1WinByDefault => 0,
        }
    }

    fn name(self) -> &'static str {
        match self {
            EventKind::Created => "Created",
            EventKind::Player1ShowHand => "Player1ShowHand",
            EventKind::Player0Reveal => "Player0Reveal",
            EventKind::Player0Rescind => "Player0Rescind",
            EventKind::Player1WinByDefault => "Player1WinByDefault",
        }
    }
}

/// First 4 bytes of Keccak-256 of a function signature.
pub fn selector(sig: &str) -> [u8; 4] {
    let digest: Hash32 = Keccak256::digest(sig.as_bytes()).into();
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Full 32-byte Keccak-256 of an event signature (log topic0).
pub fn event_topic(sig: &str) -> Hash32 {
    Keccak256::digest(sig.as_bytes()).into()
}

/// topic0 -> event kind table, populated once at startup.
#[derive(Debug, Clone)]
pub struct TopicTable {
    kinds: HashMap<Hash32, EventKind>,
    game_topics: Vec<Hash32>,
    created_topic: Hash32,
}

impl TopicTable {
    pub fn new() -> Self {
        let mut kinds = HashMap::new();
        let created_topic = event_topic(CREATED_SIG);
        kinds.insert(created_topic, EventKind::Created);
        let game = [
            (PLAYER1_SHOW_HAND_SIG, EventKind::Player1ShowHand),
            (PLAYER0_REVEAL_SIG, EventKind::Player0Reveal),
            (PLAYER0_RESCIND_SIG, EventKind::Player0Rescind),
            (PLAYER1_WIN_BY_DEFAULT_SIG, EventKind::Player1WinByDefault),
        ];
        let mut game_topics = Vec::new();
        for (sig, kind) in game {
            let topic = event_topic(sig);
            kinds.insert(topic, kind);
            game_topics.push(topic);
        }
        Self {
            kinds,
            game_topics,
            created_topic,
        }
    }

    pub fn kind_of(&self, topic0: &Hash32) -> Option<EventKind> {
        self.kinds.get(topic0).copied()
    }

    /// topic0 of the factory `Created` event.
    pub fn created_topic(&self) -> &Hash32 {
        &self.created_topic
    }

    /// topic0 values of the four game-contract events.
    pub fn game_topics(&self) -> &[Hash32] {
        &self.game_topics
    }
}

impl Default for TopicTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A typed game-contract event, produced only by the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameEvent {
    Player1ShowHand { player1: Address, hand1: u8 },
    Player0Reveal { salt: Hash32, hand0: u8, outcome: u8 },
    Player0Rescind,
    Player1WinByDefault,
}

/// A decoded game event with chain metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedEvent {
    pub event: GameEvent,
    /// Game contract that emitted the log.
    pub contract: Address,
    pub block_number: u64,
    pub tx_hash: Hash32,
    pub log_index: u64,
}

/// Decoded factory `Created` event: the game's full terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameCreation {
    pub contract: Address,
    pub player0: Address,
    /// None = open to anyone (zero address on chain).
    pub player1: Option<Address>,
    pub timeout_in_blocks: u64,
    pub player0_commitment: Hash32,
    pub wager: u128,
    pub escrow: u128,
    pub block_number: u64,
    pub tx_hash: Hash32,
}

/// Partition a data payload into exactly `expected` 32-byte words.
fn words(kind: EventKind, data: &[u8]) -> Result<Vec<&[u8]>, DecodeError> {
    let expected = kind.word_count();
    if data.len() != expected * 32 {
        return Err(DecodeError::WordCount {
            kind: kind.name(),
            expected,
            got: data.len() / 32 + usize::from(data.len() % 32 != 0),
        });
    }
    Ok(data.chunks_exact(32).collect())
}

/// Address word: low 20 bytes; the high 12 must be zero (no silent truncation).
fn word_address(word: &[u8]) -> Result<Address, DecodeError> {
    if word[..12].iter().any(|&b| b != 0) {
        return Err(DecodeError::BadWord("address word has nonzero padding"));
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&word[12..32]);
    Ok(out)
}

/// Address word where the zero address means "absent".
fn word_optional_address(word: &[u8]) -> Result<Option<Address>, DecodeError> {
    let addr = word_address(word)?;
    Ok(if addr == [0u8; 20] { None } else { Some(addr) })
}

fn word_u64(word: &[u8]) -> Result<u64, DecodeError> {
    if word[..24].iter().any(|&b| b != 0) {
        return Err(DecodeError::BadWord("integer word exceeds u64"));
    }
    Ok(u64::from_be_bytes(word[24..32].try_into().unwrap()))
}

fn word_u128(word: &[u8]) -> Result<u128, DecodeError> {
    if word[..16].iter().any(|&b| b != 0) {
        return Err(DecodeError::BadWord("integer word exceeds u128"));
    }
    Ok(u128::from_be_bytes(word[16..32].try_into().unwrap()))
}

fn word_u8(word: &[u8]) -> Result<u8, DecodeError> {
    if word[..31].iter().any(|&b| b != 0) {
        return Err(DecodeError::BadWord("integer word exceeds u8"));
    }
    Ok(word[31])
}

fn word_hash(word: &[u8]) -> Result<Hash32, DecodeError> {
    let mut out = [0u8; 32];
    out.copy_from_slice(word);
    Ok(out)
}

/// Decode the 7-word `Created` payload. Block number and tx hash come from
/// the enclosing log or receipt.
pub fn decode_creation_words(
    data: &[u8],
    block_number: u64,
    tx_hash: Hash32,
) -> Result<GameCreation, DecodeError> {
    let w = words(EventKind::Created, data)?;
    Ok(GameCreation {
        contract: word_address(w[0])?,
        player0: word_address(w[1])?,
        player1: word_optional_address(w[2])?,
        timeout_in_blocks: word_u64(w[3])?,
        player0_commitment: word_hash(w[4])?,
        wager: word_u128(w[5])?,
        escrow: word_u128(w[6])?,
        block_number,
        tx_hash,
    })
}

/// Decode a JSON-RPC log (eth_subscription / eth_getLogs result) into a typed
/// game event. `Created` logs are not game events; use [decode_creation_log].
pub fn decode_game_log(table: &TopicTable, log: &Value) -> Result<ObservedEvent, DecodeError> {
    let meta = LogMeta::parse(log)?;
    let kind = table
        .kind_of(&meta.topic0)
        .ok_or_else(|| DecodeError::UnknownTopic(hex::encode(meta.topic0)))?;
    let w = words(kind, &meta.data)?;
    let event = match kind {
        EventKind::Created => {
            return Err(DecodeError::BadWord("Created log is not a game event"));
        }
        EventKind::Player1ShowHand => GameEvent::Player1ShowHand {
            player1: word_address(w[0])?,
            hand1: word_u8(w[1])?,
        },
        EventKind::Player0Reveal => GameEvent::Player0Reveal {
            salt: word_hash(w[0])?,
            hand0: word_u8(w[1])?,
            outcome: word_u8(w[2])?,
        },
        EventKind::Player0Rescind => GameEvent::Player0Rescind,
        EventKind::Player1WinByDefault => GameEvent::Player1WinByDefault,
    };
    Ok(ObservedEvent {
        event,
        contract: meta.address,
        block_number: meta.block_number,
        tx_hash: meta.tx_hash,
        log_index: meta.log_index,
    })
}

/// Decode a factory `Created` log.
pub fn decode_creation_log(table: &TopicTable, log: &Value) -> Result<GameCreation, DecodeError> {
    let meta = LogMeta::parse(log)?;
    match table.kind_of(&meta.topic0) {
        Some(EventKind::Created) => {}
        Some(_) | None => return Err(DecodeError::UnknownTopic(hex::encode(meta.topic0))),
    }
    decode_creation_words(&meta.data, meta.block_number, meta.tx_hash)
}

/// Decode and cross-check a game-creation transaction receipt: success
/// status, exactly one log, `to` = factory, `from` = decoded player0.
pub fn decode_creation_receipt(
    receipt: &Value,
    factory: &Address,
) -> Result<GameCreation, DecodeError> {
    let status = receipt
        .get("status")
        .and_then(|s| s.as_str())
        .ok_or(DecodeError::MissingField("status"))?;
    if parse_hex_u64(status)? != 1 {
        return Err(DecodeError::BadReceipt(format!("status {}", status)));
    }
    let logs = receipt
        .get("logs")
        .and_then(|l| l.as_array())
        .ok_or(DecodeError::MissingField("logs"))?;
    if logs.len() != 1 {
        return Err(DecodeError::BadReceipt(format!(
            "expected 1 log, got {}",
            logs.len()
        )));
    }
    let to = parse_hex_bytes_20(
        receipt
            .get("to")
            .and_then(|t| t.as_str())
            .ok_or(DecodeError::MissingField("to"))?,
    )?;
    if &to != factory {
        return Err(DecodeError::BadReceipt(format!(
            "to 0x{} is not the factory",
            hex::encode(to)
        )));
    }
    let from = parse_hex_bytes_20(
        receipt
            .get("from")
            .and_then(|f| f.as_str())
            .ok_or(DecodeError::MissingField("from"))?,
    )?;
    let block_number = parse_hex_u64(
        receipt
            .get("blockNumber")
            .and_then(|n| n.as_str())
            .ok_or(DecodeError::MissingField("blockNumber"))?,
    )?;
    let tx_hash = parse_hex_bytes_32(
        receipt
            .get("transactionHash")
            .and_then(|h| h.as_str())
            .ok_or(DecodeError::MissingField("transactionHash"))?,
    )?;
    let data = parse_hex_bytes(
        logs[0]
            .get("data")
            .and_then(|d| d.as_str())
            .ok_or(DecodeError::MissingField("data"))?,
    )?;
    let creation = decode_creation_words(&data, block_number, tx_hash)?;
    if from != creation.player0 {
        return Err(DecodeError::BadReceipt(format!(
            "from 0x{} is not player0",
            hex::encode(from)
        )));
    }
    Ok(creation)
}

/// Decode the `query_state()` return: the full 12-word on-chain tuple.
pub fn decode_state_return(data: &[u8]) -> Result<GameSnapshot, DecodeError> {
    if data.len() != 12 * 32 {
        return Err(DecodeError::WordCount {
            kind: "query_state",
            expected: 12,
            got: data.len() / 32 + usize::from(data.len() % 32 != 0),
        });
    }
    let w: Vec<&[u8]> = data.chunks_exact(32).collect();
    let state = GameState::from_u8(word_u8(w[0])?)
        .ok_or(DecodeError::BadWord("state out of range"))?;
    let outcome = Outcome::from_u8(word_u8(w[1])?)
        .ok_or(DecodeError::BadWord("outcome out of range"))?;
    Ok(GameSnapshot {
        state,
        outcome,
        timeout_in_blocks: word_u64(w[2])?,
        previous_block: word_u64(w[3])?,
        player0: word_address(w[4])?,
        player1: word_optional_address(w[5])?,
        player0_commitment: word_hash(w[6])?,
        wager: word_u128(w[7])?,
        escrow: word_u128(w[8])?,
        salt: word_hash(w[9])?,
        hand0: word_u8(w[10])?,
        hand1: word_u8(w[11])?,
    })
}

/// Common chain metadata of a JSON-RPC log object.
struct LogMeta {
    address: Address,
    topic0: Hash32,
    data: Vec<u8>,
    block_number: u64,
    tx_hash: Hash32,
    log_index: u64,
}

impl LogMeta {
    fn parse(log: &Value) -> Result<Self, DecodeError> {
        let address = parse_hex_bytes_20(
            log.get("address")
                .and_then(|a| a.as_str())
                .ok_or(DecodeError::MissingField("address"))?,
        )?;
        let topics = log
            .get("topics")
            .and_then(|t| t.as_array())
            .ok_or(DecodeError::MissingField("topics"))?;
        let topic0 = parse_hex_bytes_32(
            topics
                .first()
                .and_then(|t| t.as_str())
                .ok_or(DecodeError::MissingField("topics[0]"))?,
        )?;
        let data = parse_hex_bytes(
            log.get("data")
                .and_then(|d| d.as_str())
                .ok_or(DecodeError::MissingField("data"))?,
        )?;
        let block_number = parse_hex_u64(
            log.get("blockNumber")
                .and_then(|n| n.as_str())
                .ok_or(DecodeError::MissingField("blockNumber"))?,
        )?;
        let tx_hash = parse_hex_bytes_32(
            log.get("transactionHash")
                .and_then(|h| h.as_str())
                .ok_or(DecodeError::MissingField("transactionHash"))?,
        )?;
        let log_index = parse_hex_u64(
            log.get("logIndex")
                .and_then(|n| n.as_str())
                .ok_or(DecodeError::MissingField("logIndex"))?,
        )?;
        Ok(Self {
            address,
            topic0,
            data,
            block_number,
            tx_hash,
            log_index,
        })
    }
}

pub fn parse_hex_u64(s: &str) -> Result<u64, DecodeError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).map_err(|_| DecodeError::BadHex("u64"))
}

pub fn parse_hex_bytes(s: &str) -> Result<Vec<u8>, DecodeError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(s).map_err(|_| DecodeError::BadHex("bytes"))
}

pub fn parse_hex_bytes_32(s: &str) -> Result<Hash32, DecodeError> {
    let bytes = parse_hex_bytes(s)?;
    if bytes.len() != 32 {
        return Err(DecodeError::BadHex("expected 32 bytes"));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

pub fn parse_hex_bytes_20(s: &str) -> Result<Address, DecodeError> {
    let bytes = parse_hex_bytes(s)?;
    if bytes.len() == 20 {
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes);
        Ok(out)
    } else if bytes.len() == 32 {
        // Indexed address in EVM is 32 bytes (left-padded); take last 20.
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes[12..32]);
        Ok(out)
    } else {
        Err(DecodeError::BadHex("expected 20 or 32 bytes for address"))
    }
}
