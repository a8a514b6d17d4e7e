//! Time-derived XOR keys

use std::time::{SystemTime, UNIX_EPOCH};

/// An 8-byte XOR key derived from a timestamp.
///
/// The key bytes are the timestamp's native in-memory bytes, cycled over
/// the data being scrambled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeKey(u64);

impl TimeKey {
    pub const SIZE: usize = 8;

    pub const fn new(stamp: u64) -> Self {
        Self(stamp)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn bytes(&self) -> [u8; Self::SIZE] {
        self.0.to_ne_bytes()
    }

    /// Key with its byte order reversed
    pub fn reversed(&self) -> TimeKey {
        TimeKey(self.0.swap_bytes())
    }

    /// XOR `data` in place; applying twice restores the input.
    pub fn apply(&self, data: &mut [u8]) {
        let key = self.bytes();
        for (i, byte) in data.iter_mut().enumerate() {
            *byte ^= key[i % Self::SIZE];
        }
    }
}

/// Supplier of fresh keys for one dump
pub trait KeySource {
    fn next_key(&mut self) -> TimeKey;
}

/// Keys read from the wall clock, in nanoseconds.
///
/// Consecutive keys are strictly increasing, so two functions dumped in
/// the same clock tick still get different keys.
#[derive(Debug, Default)]
pub struct ClockKeys {
    last: u64,
}

impl ClockKeys {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeySource for ClockKeys {
    fn next_key(&mut self) -> TimeKey {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        self.last = now.max(self.last.wrapping_add(1));
        TimeKey(self.last)
    }
}

/// Deterministic key sequence (splitmix64), for reproducible chunks
#[derive(Debug, Clone)]
pub struct SeededKeys {
    state: u64,
}

impl SeededKeys {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }
}

impl KeySource for SeededKeys {
    fn next_key(&mut self) -> TimeKey {
        self.state = self.state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        TimeKey(z ^ (z >> 31))
    }
}
