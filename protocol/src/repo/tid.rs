// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! Timestamp identifiers for record keys.
//!
//! A TID is 13 characters of sortable base32 (`234567a-z`) encoding a
//! 64-bit value with the top bit clear:
//!
//! ```text
//! 0 | 53 bits microseconds since epoch | 10 bits clock id
//! ```
//!
//! Lexicographic order of TIDs equals numeric order, so records created
//! later sort later. Each [`TidClock`] is strictly monotonic even when the
//! wall clock stalls or steps backwards.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use rand::Rng;

const ALPHABET: &[u8; 32] = b"234567abcdefghijklmnopqrstuvwxyz";
const TID_LENGTH: usize = 13;
const CLOCK_ID_BITS: u32 = 10;

/// Issues strictly increasing TIDs.
#[derive(Debug)]
pub struct TidClock {
    last_micros: AtomicU64,
    clock_id: u64,
}

impl Default for TidClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TidClock {
    /// A clock with a random 10-bit clock id.
    pub fn new() -> Self {
        Self::with_clock_id(rand::thread_rng().gen_range(0..(1 << CLOCK_ID_BITS)))
    }

    pub fn with_clock_id(clock_id: u64) -> Self {
        Self {
            last_micros: AtomicU64::new(0),
            clock_id: clock_id & ((1 << CLOCK_ID_BITS) - 1),
        }
    }

    pub fn next(&self) -> String {
        let now = Utc::now().timestamp_micros().max(0) as u64;
        let mut last = self.last_micros.load(Ordering::Relaxed);
        let micros = loop {
            let candidate = now.max(last + 1);
            match self.last_micros.compare_exchange_weak(
                last,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break candidate,
                Err(actual) => last = actual,
            }
        };
        encode((micros << CLOCK_ID_BITS) | self.clock_id)
    }
}

fn encode(mut value: u64) -> String {
    value &= u64::MAX >> 1;
    let mut out = [0u8; TID_LENGTH];
    for slot in out.iter_mut().rev() {
        *slot = ALPHABET[(value & 0x1f) as usize];
        value >>= 5;
    }
    out.iter().map(|&b| b as char).collect()
}

/// `true` for a syntactically valid TID.
pub fn is_valid_tid(s: &str) -> bool {
    s.len() == TID_LENGTH
        && s.bytes().all(|b| ALPHABET.contains(&b))
        // The first character carries the zero top bit.
        && s.as_bytes()[0] <= b'j'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tids_are_valid_and_sorted() {
        let clock = TidClock::new();
        let tids: Vec<String> = (0..1000).map(|_| clock.next()).collect();
        for tid in &tids {
            assert!(is_valid_tid(tid), "{}", tid);
        }
        let mut sorted = tids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted, tids);
    }

    #[test]
    fn encoding_is_fixed_width() {
        assert_eq!(encode(0), "2222222222222");
        assert_eq!(encode(1), "2222222222223");
        assert_eq!(encode(u64::MAX).len(), TID_LENGTH);
        assert!(is_valid_tid(&encode(u64::MAX)));
    }

    #[test]
    fn clock_id_is_masked() {
        let clock = TidClock::with_clock_id(u64::MAX);
        assert!(clock.clock_id < 1 << CLOCK_ID_BITS);
    }

    #[test]
    fn concurrent_callers_never_collide() {
        let clock = std::sync::Arc::new(TidClock::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let clock = clock.clone();
                std::thread::spawn(move || (0..500).map(|_| clock.next()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<String> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total);
    }

    #[test]
    fn rejects_malformed() {
        assert!(!is_valid_tid("short"));
        assert!(!is_valid_tid("222222222222!"));
        assert!(!is_valid_tid("z222222222222"));
    }
}
