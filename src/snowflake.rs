//! Time-ordered 63-bit identifiers for relay logs.
//!
//! Layout: 41 bits of milliseconds since `EPOCH_MS`, 10 bits of node id,
//! 12 bits of per-millisecond sequence. Ids never go backwards within a
//! process; if the wall clock steps back the generator keeps using the last
//! seen millisecond.

use chrono::Utc;
use parking_lot::Mutex;

/// 2024-01-01T00:00:00Z
const EPOCH_MS: i64 = 1_704_067_200_000;
const NODE_BITS: u32 = 10;
const SEQ_BITS: u32 = 12;
const SEQ_MASK: i64 = (1 << SEQ_BITS) - 1;

#[derive(Debug)]
pub struct Snowflake {
    node: i64,
    state: Mutex<(i64, i64)>,
}

impl Snowflake {
    pub fn new(node: u16) -> Self {
        Self {
            node: (node as i64) & ((1 << NODE_BITS) - 1),
            state: Mutex::new((0, 0)),
        }
    }

    /// Node id derived from random bits so two processes sharing a database
    /// are unlikely to collide.
    pub fn with_random_node() -> Self {
        Self::new(rand::random::<u16>())
    }

    pub fn next_id(&self) -> i64 {
        let mut state = self.state.lock();
        let (last_ms, seq) = *state;
        let mut now = (Utc::now().timestamp_millis() - EPOCH_MS).max(last_ms);

        let next_seq = if now == last_ms {
            let s = (seq + 1) & SEQ_MASK;
            if s == 0 {
                // sequence exhausted, borrow the next millisecond
                now += 1;
            }
            s
        } else {
            0
        };

        *state = (now, next_seq);
        (now << (NODE_BITS + SEQ_BITS)) | (self.node << SEQ_BITS) | next_seq
    }
}

#[cfg(test)]
fn timestamp_ms(id: i64) -> i64 {
    (id >> (NODE_BITS + SEQ_BITS)) + EPOCH_MS
}
