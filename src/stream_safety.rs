//! Guards against backend streams that loop on one chunk or stall.

use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{Duration, Instant};

pub const DEFAULT_MAX_REPEATS: u32 = 10;
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyAbort {
    RepeatedChunk,
    Timeout,
}

impl fmt::Display for SafetyAbort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SafetyAbort::RepeatedChunk => write!(f, "repeated chunk detected"),
            SafetyAbort::Timeout => write!(f, "stream timeout exceeded"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamSafetyChecker {
    last_hash: Option<[u8; 32]>,
    repeats: u32,
    max_repeats: u32,
    last_chunk_at: Option<Instant>,
    timeout: Duration,
}

impl Default for StreamSafetyChecker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REPEATS, DEFAULT_STREAM_TIMEOUT)
    }
}

impl StreamSafetyChecker {
    pub fn new(max_repeats: u32, timeout: Duration) -> Self {
        Self {
            last_hash: None,
            repeats: 0,
            max_repeats,
            last_chunk_at: None,
            timeout,
        }
    }

    pub fn check(&mut self, data: &[u8]) -> Option<SafetyAbort> {
        self.check_at(data, Instant::now())
    }

    /// Record one chunk received at `now`. Returns the reason to abort, if any.
    ///
    /// The first occurrence of a chunk sets the baseline; `max_repeats` further
    /// identical chunks abort.
    pub fn check_at(&mut self, data: &[u8], now: Instant) -> Option<SafetyAbort> {
        if let Some(last) = self.last_chunk_at {
            if now.saturating_duration_since(last) > self.timeout {
                return Some(SafetyAbort::Timeout);
            }
        }
        self.last_chunk_at = Some(now);

        if data.is_empty() {
            return None;
        }

        let hash: [u8; 32] = Sha256::digest(data).into();
        if self.last_hash == Some(hash) {
            self.repeats += 1;
            if self.repeats >= self.max_repeats {
                return Some(SafetyAbort::RepeatedChunk);
            }
        } else {
            self.repeats = 0;
            self.last_hash = Some(hash);
        }
        None
    }

    pub fn reset(&mut self) {
        self.last_hash = None;
        self.repeats = 0;
        self.last_chunk_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_chunks_abort() {
        let mut checker = StreamSafetyChecker::new(3, DEFAULT_STREAM_TIMEOUT);
        for _ in 0..3 {
            assert_eq!(checker.check(b"same"), None);
        }
        assert_eq!(checker.check(b"same"), Some(SafetyAbort::RepeatedChunk));
    }

    #[test]
    fn test_default_allows_ten_chunks() {
        let mut checker = StreamSafetyChecker::default();
        for _ in 0..10 {
            assert_eq!(checker.check(b"data"), None);
        }
        assert_eq!(checker.check(b"data"), Some(SafetyAbort::RepeatedChunk));
    }

    #[test]
    fn test_distinct_chunks_pass() {
        let mut checker = StreamSafetyChecker::new(2, DEFAULT_STREAM_TIMEOUT);
        for i in 0u8..20 {
            assert_eq!(checker.check(&[i]), None);
        }
        assert_eq!(checker.check(b""), None);
    }

    #[test]
    fn test_stall_aborts() {
        let mut checker = StreamSafetyChecker::new(10, Duration::from_secs(1));
        let start = Instant::now();
        assert_eq!(checker.check_at(b"a", start), None);
        assert_eq!(
            checker.check_at(b"b", start + Duration::from_secs(2)),
            Some(SafetyAbort::Timeout)
        );
        assert_eq!(SafetyAbort::Timeout.to_string(), "stream timeout exceeded");
    }

    #[test]
    fn test_reset_clears_state() {
        let mut checker = StreamSafetyChecker::new(1, DEFAULT_STREAM_TIMEOUT);
        assert_eq!(checker.check(b"x"), None);
        checker.reset();
        assert_eq!(checker.check(b"x"), None);
        assert_eq!(checker.check(b"x"), Some(SafetyAbort::RepeatedChunk));
    }
}
