//! Stream record identifiers.

use std::fmt;
use std::str::FromStr;

/// Identifier of a record in an append-only stream.
///
/// Ids have the form `<milliseconds>-<sequence>` and are strictly increasing
/// within one stream. [`StreamId::ZERO`] sorts before every real record and is
/// used as the "read from the beginning" cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId {
    ms: u64,
    seq: u64,
}

impl StreamId {
    /// Cursor positioned before the first record of any stream.
    pub const ZERO: StreamId = StreamId { ms: 0, seq: 0 };

    /// Largest possible id, useful as an open upper bound for range reads.
    pub const MAX: StreamId = StreamId {
        ms: u64::MAX,
        seq: u64::MAX,
    };

    pub const fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    pub fn ms(&self) -> u64 {
        self.ms
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// The smallest id strictly greater than `self` that is valid for an
    /// append made at wall-clock time `now_ms`.
    pub fn successor(&self, now_ms: u64) -> StreamId {
        if now_ms > self.ms {
            StreamId::new(now_ms, 0)
        } else {
            StreamId::new(self.ms, self.seq + 1)
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

/// Error returned when parsing a malformed stream id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid stream id `{0}`")]
pub struct ParseStreamIdError(String);

impl FromStr for StreamId {
    type Err = ParseStreamIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseStreamIdError(s.to_string());
        match s.split_once('-') {
            Some((ms, seq)) => Ok(StreamId::new(
                ms.parse().map_err(|_| invalid())?,
                seq.parse().map_err(|_| invalid())?,
            )),
            None => Ok(StreamId::new(s.parse().map_err(|_| invalid())?, 0)),
        }
    }
}
