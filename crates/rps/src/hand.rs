//! Hands, outcomes, and the salted commitment scheme.
//!
//! Hand and Outcome match the contract's declaration order (discriminant = uint8).
//! A commitment binds a 256-bit salt and a hand before the opponent moves.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

/// 20-byte ledger address.
pub type Address = [u8; 20];
/// 32-byte hash (commitments, salts, transaction hashes, topics).
pub type Hash32 = [u8; 32];

/// Hand matches the contract's `Hand` declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Hand {
    Rock = 0,
    Paper = 1,
    Scissors = 2,
}

impl Hand {
    /// The validity predicate: exactly three legal values.
    pub fn from_u8(n: u8) -> Option<Self> {
        match n {
            0 => Some(Hand::Rock),
            1 => Some(Hand::Paper),
            2 => Some(Hand::Scissors),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Hand::Rock => "Rock",
            Hand::Paper => "Paper",
            Hand::Scissors => "Scissors",
        }
    }
}

/// Outcome matches the contract's `Outcome` declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Outcome {
    Unknown = 0,
    Draw = 1,
    Player0Wins = 2,
    Player1Wins = 3,
    Player1WinsByDefault = 4,
    Player0Rescinds = 5,
}

impl Outcome {
    pub fn from_u8(n: u8) -> Option<Self> {
        match n {
            0 => Some(Outcome::Unknown),
            1 => Some(Outcome::Draw),
            2 => Some(Outcome::Player0Wins),
            3 => Some(Outcome::Player1Wins),
            4 => Some(Outcome::Player1WinsByDefault),
            5 => Some(Outcome::Player0Rescinds),
            _ => None,
        }
    }
}

/// Keccak-256 over salt bytes followed by the single hand byte
/// (the contract's `soliditySha3(bytes32, uint8)`).
pub fn commitment(salt: &Hash32, hand: Hand) -> Hash32 {
    let mut hasher = Keccak256::new();
    hasher.update(salt);
    hasher.update([hand as u8]);
    hasher.finalize().into()
}

/// Cooperative outcome: d = (hand0 - hand1 + 3) mod 3.
pub fn outcome_of_hands(hand0: Hand, hand1: Hand) -> Outcome {
    match (hand0 as u8 + 3 - hand1 as u8) % 3 {
        0 => Outcome::Draw,
        1 => Outcome::Player0Wins,
        _ => Outcome::Player1Wins,
    }
}

/// Per-player view of an outcome, for presentation reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundResult {
    Draw,
    YouWin,
    TheyWin,
}

/// Result summary from one player's side. Player1's summary is
/// `round_result(hand1, hand0)`, symmetric with player0's.
pub fn round_result(your_hand: Hand, their_hand: Hand) -> RoundResult {
    match (your_hand as u8 + 3 - their_hand as u8) % 3 {
        0 => RoundResult::Draw,
        1 => RoundResult::YouWin,
        _ => RoundResult::TheyWin,
    }
}

/// Fresh 256-bit salt.
pub fn random_salt() -> Hash32 {
    let mut salt = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}
