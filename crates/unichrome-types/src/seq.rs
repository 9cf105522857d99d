//! Wrap-tolerant sequence comparisons.
//!
//! Engine sequence counters are 32-bit and wrap during the lifetime of a
//! device. Every "has the engine passed sequence S" question must therefore
//! be answered by the modular age test below, never by a raw `>=`.

/// Ages at or beyond this value mean "S is in the future", not "S is old".
pub const SEQ_HALF_RANGE: u32 = 1 << 31;

/// Distance from `seq` to `current`, modulo wraparound.
#[inline]
pub fn seq_age(current: u32, seq: u32) -> u32 {
    current.wrapping_sub(seq)
}

/// Whether an engine whose last-completed sequence is `current` has passed
/// `seq`.
#[inline]
pub fn seq_passed(current: u32, seq: u32) -> bool {
    seq_age(current, seq) < SEQ_HALF_RANGE
}
