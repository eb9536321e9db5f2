//! Fractional position keys for the replicated sequence.
//!
//! A [`Position`] is a non-empty string over the alphabet `a..=z`, compared
//! lexicographically. Keys never end in `a`, so a smaller key always exists.
//!
//! ```text
//!   prev = "m"                     next = "o"
//!       │                              │
//!       └────────── allocate ──────────┘
//!                      "n"
//!
//!   prev = "m"      next = "n"   (adjacent symbols)
//!       └── allocate ──┘
//!            "mn"                (one level deeper)
//! ```
//!
//! The allocator never returns a prefix of its upper bound, so any extension
//! of an allocated key still sorts inside the gap. The merge engine relies on
//! that when it appends an origin stamp (see [`Position::stamped`]).
//!
//! Reference: Weiss et al., Logoot, ICDCS 2009

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::character::OriginId;

const MIN_DIGIT: u8 = 0;
const MAX_DIGIT: u8 = 25;
const MID_DIGIT: u8 = 13;

/// Stamp digits live in `b..=q` so that `a` can terminate the origin bytes.
const STAMP_BASE: u8 = 1;
const STAMP_TERMINATOR: u8 = MIN_DIGIT;

/// Errors produced when parsing or allocating positions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PositionError {
    #[error("position is empty")]
    Empty,
    #[error("invalid position symbol {0:?}")]
    InvalidSymbol(char),
    #[error("position {0:?} ends with the minimum symbol")]
    TrailingMinimum(String),
    #[error("position bounds out of order: {prev} >= {next}")]
    OutOfOrder { prev: String, next: String },
}

/// An order key between two neighbours.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Position(String);

impl Position {
    /// Parse and validate a key received from the outside.
    pub fn parse(key: impl Into<String>) -> Result<Self, PositionError> {
        let key = key.into();
        validate(&key)?;
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of symbols in the key.
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// Append an order-preserving encoding of `(origin, clock)`.
    ///
    /// Two stamps compare like `(origin bytes, clock)`. Concurrent inserts
    /// into the same gap therefore get distinct keys, and a free gap always
    /// remains between them.
    pub fn stamped(&self, origin: &OriginId, clock: u64) -> Position {
        let mut digits = self.digits();
        for byte in origin.as_str().bytes() {
            digits.push(STAMP_BASE + (byte >> 4));
            digits.push(STAMP_BASE + (byte & 0x0f));
        }
        digits.push(STAMP_TERMINATOR);

        let nibbles = clock_nibbles(clock);
        // Width first: a longer clock is always the larger one.
        digits.push(STAMP_BASE + nibbles.len() as u8);
        digits.extend(nibbles.iter().map(|n| STAMP_BASE + n));
        Self::from_digits(&digits)
    }

    fn digits(&self) -> Vec<u8> {
        self.0.bytes().map(|b| b - b'a').collect()
    }

    fn from_digits(digits: &[u8]) -> Self {
        Self(digits.iter().map(|d| char::from(b'a' + d)).collect())
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Position {
    type Error = PositionError;

    fn try_from(key: String) -> Result<Self, Self::Error> {
        Self::parse(key)
    }
}

impl From<Position> for String {
    fn from(position: Position) -> Self {
        position.0
    }
}

/// Allocate a key strictly between `prev` and `next`.
///
/// Either bound may be absent (document start / end). The result is never a
/// prefix of `next` and never ends with the minimum symbol.
pub fn allocate(prev: Option<&Position>, next: Option<&Position>) -> Result<Position, PositionError> {
    let digits = match (prev, next) {
        (None, None) => vec![MID_DIGIT],
        (Some(prev), None) => after(&prev.digits()),
        (None, Some(next)) => before(&next.digits()),
        (Some(prev), Some(next)) => {
            if prev >= next {
                return Err(PositionError::OutOfOrder {
                    prev: prev.to_string(),
                    next: next.to_string(),
                });
            }
            between(&prev.digits(), &next.digits())
        }
    };
    Ok(Position::from_digits(&digits))
}

/// Allocate `count` increasing keys by recursive bisection.
///
/// Keys grow logarithmically with `count`, unlike a chain of
/// `allocate(prev, None)` calls which grows linearly.
pub fn spread(count: usize) -> Result<Vec<Position>, PositionError> {
    let mut out = Vec::with_capacity(count);
    fill(None, None, count, &mut out)?;
    Ok(out)
}

fn fill(
    low: Option<&Position>,
    high: Option<&Position>,
    count: usize,
    out: &mut Vec<Position>,
) -> Result<(), PositionError> {
    if count == 0 {
        return Ok(());
    }
    let left = count / 2;
    let pivot = allocate(low, high)?;
    fill(low, Some(&pivot), left, out)?;
    out.push(pivot.clone());
    fill(Some(&pivot), high, count - left - 1, out)
}

/// Next key above `digits` with no upper bound.
fn after(digits: &[u8]) -> Vec<u8> {
    let mut out = digits.to_vec();
    match out.last_mut() {
        Some(last) if *last < MAX_DIGIT => *last += 1,
        _ => out.push(MID_DIGIT),
    }
    out
}

/// Next key below `digits` with no lower bound.
fn before(digits: &[u8]) -> Vec<u8> {
    let mut out = digits.to_vec();
    match out.last_mut() {
        Some(last) if *last > MIN_DIGIT + 1 => *last -= 1,
        Some(last) => {
            *last = MIN_DIGIT;
            out.push(MID_DIGIT);
        }
        None => out.push(MID_DIGIT),
    }
    out
}

/// Key strictly between `prev < next`.
fn between(prev: &[u8], next: &[u8]) -> Vec<u8> {
    let shared = prev
        .iter()
        .zip(next)
        .take_while(|(a, b)| a == b)
        .count();

    // `prev` is a proper prefix of `next`: descend below next's remainder.
    if shared == prev.len() {
        let mut out = prev.to_vec();
        out.extend(before(&next[shared..]));
        return out;
    }

    let (low, high) = (prev[shared], next[shared]);
    let mut out = prev[..shared].to_vec();
    if high - low > 1 {
        out.push(low + (high - low) / 2);
    } else {
        // Adjacent symbols: keep prev's symbol and go one level deeper.
        out.push(low);
        out.extend(after(&prev[shared + 1..]));
    }
    out
}

fn clock_nibbles(clock: u64) -> Vec<u8> {
    let width = ((64 - clock.leading_zeros() + 3) / 4).max(1) as usize;
    (0..width)
        .rev()
        .map(|i| ((clock >> (i * 4)) & 0x0f) as u8)
        .collect()
}

fn validate(key: &str) -> Result<(), PositionError> {
    let Some(last) = key.chars().last() else {
        return Err(PositionError::Empty);
    };
    if let Some(bad) = key.chars().find(|c| !c.is_ascii_lowercase()) {
        return Err(PositionError::InvalidSymbol(bad));
    }
    if last == 'a' {
        return Err(PositionError::TrailingMinimum(key.to_string()));
    }
    Ok(())
}
