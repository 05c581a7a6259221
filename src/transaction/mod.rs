//! Client transaction layer: RFC 3261 §17.1 state machines, the timer
//! wheel driving them, transaction matching keys, and the endpoint that
//! owns the tables.

pub mod endpoint;
pub mod key;
pub mod timer;
pub mod transaction;

use key::TransactionKey;
use rand::Rng;
use std::time::Duration;

/// Magic cookie every Via branch starts with.
pub const BRANCH_MAGIC: &str = "z9hG4bK";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Request sent, nothing heard yet (INVITE).
    Calling,
    /// Request sent, nothing heard yet (non-INVITE).
    Trying,
    /// A provisional response arrived.
    Proceeding,
    /// A final response arrived; lingering for retransmissions.
    Completed,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    ClientInvite,
    ClientNonInvite,
}

/// Names the RFC 3261 client timers, for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    A,
    B,
    D,
    E,
    F,
    K,
}

impl std::fmt::Display for TimerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TimerKind::A => "A",
            TimerKind::B => "B",
            TimerKind::D => "D",
            TimerKind::E => "E",
            TimerKind::F => "F",
            TimerKind::K => "K",
        };
        f.write_str(name)
    }
}

/// A scheduled transaction timer. The retransmission timers carry the
/// interval to double on re-arm.
#[derive(Debug, Clone)]
pub enum TransactionTimer {
    TimerA(TransactionKey, Duration),
    TimerB(TransactionKey),
    TimerD(TransactionKey),
    TimerE(TransactionKey, Duration),
    TimerF(TransactionKey),
    TimerK(TransactionKey),
    /// Ends the absorption window kept after a terminated transaction.
    Purge(TransactionKey),
}

impl TransactionTimer {
    pub fn key(&self) -> &TransactionKey {
        match self {
            TransactionTimer::TimerA(key, _)
            | TransactionTimer::TimerB(key)
            | TransactionTimer::TimerD(key)
            | TransactionTimer::TimerE(key, _)
            | TransactionTimer::TimerF(key)
            | TransactionTimer::TimerK(key)
            | TransactionTimer::Purge(key) => key,
        }
    }
}

/// `len` random lowercase hex characters.
pub fn random_hex(len: usize) -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::rng();
    (0..len).map(|_| HEX[rng.random_range(0..16)] as char).collect()
}

/// A fresh Via branch token.
pub fn make_branch() -> String {
    format!("{}{}", BRANCH_MAGIC, random_hex(16))
}

/// A fresh From/To tag.
pub fn make_tag() -> String {
    random_hex(16)
}

/// A fresh Call-ID scoped to the local host.
pub fn make_call_id(host: &str) -> String {
    format!("{}@{}", random_hex(32), host)
}

/// A small random starting CSeq for a new dialog-forming request.
pub fn random_sequence() -> u32 {
    rand::rng().random_range(1..10_000)
}

#[cfg(test)]
mod tests;
