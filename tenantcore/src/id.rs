//! Snowflake identifiers for relational and in-memory entities.
//!
//! Layout, most significant bit first:
//!
//! | bits | field                                  |
//! |------|----------------------------------------|
//! | 1    | sign, always 0                         |
//! | 42   | milliseconds since [`SNOWFLAKE_EPOCH_MS`] |
//! | 5    | worker id                              |
//! | 5    | process id                             |
//! | 12   | per-millisecond sequence               |

use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// 2025-09-28T00:00:00Z in unix milliseconds.
pub const SNOWFLAKE_EPOCH_MS: i64 = 1_759_017_600_000;

const WORKER_BITS: u32 = 5;
const PROCESS_BITS: u32 = 5;
const SEQUENCE_BITS: u32 = 12;

const MAX_WORKER: i64 = (1 << WORKER_BITS) - 1;
const MAX_PROCESS: i64 = (1 << PROCESS_BITS) - 1;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;

const PROCESS_SHIFT: u32 = SEQUENCE_BITS;
const WORKER_SHIFT: u32 = SEQUENCE_BITS + PROCESS_BITS;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + PROCESS_BITS + WORKER_BITS;

#[derive(Debug)]
struct State {
    last_ms: i64,
    sequence: i64,
}

/// Generates unique, time-ordered 64-bit ids.
#[derive(Debug)]
pub struct SnowflakeGenerator {
    worker_id: i64,
    process_id: i64,
    state: Mutex<State>,
}

impl SnowflakeGenerator {
    /// Creates a generator. Ids are masked to their 5-bit fields.
    pub fn new(worker_id: u8, process_id: u8) -> Self {
        Self {
            worker_id: i64::from(worker_id) & MAX_WORKER,
            process_id: i64::from(process_id) & MAX_PROCESS,
            state: Mutex::new(State {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    /// Next id. Monotonically increasing within this generator.
    ///
    /// When a millisecond's sequence is used up the caller sleeps into the
    /// next one without holding the generator's lock.
    pub fn next_id(&self) -> i64 {
        loop {
            match self.issue_at(current_millis()) {
                Ok(id) => return id,
                Err(exhausted_ms) => {
                    let wait = exhausted_ms + 1 - current_millis();
                    if let Ok(wait) = u64::try_from(wait) {
                        std::thread::sleep(Duration::from_millis(wait));
                    }
                }
            }
        }
    }

    /// Issues an id for `now`, or returns the millisecond whose sequence is
    /// exhausted.
    fn issue_at(&self, now: i64) -> Result<i64, i64> {
        let mut state = self.state.lock();

        // A clock stepping backwards keeps issuing from the last seen millisecond.
        let now = now.max(state.last_ms);
        if now == state.last_ms {
            if state.sequence == SEQUENCE_MASK {
                return Err(now);
            }
            state.sequence += 1;
        } else {
            state.last_ms = now;
            state.sequence = 0;
        }

        Ok(((now - SNOWFLAKE_EPOCH_MS) << TIMESTAMP_SHIFT)
            | (self.worker_id << WORKER_SHIFT)
            | (self.process_id << PROCESS_SHIFT)
            | state.sequence)
    }

    /// Splits an id into (milliseconds since epoch, worker, process, sequence).
    pub const fn decompose(id: i64) -> (i64, i64, i64, i64) {
        (
            id >> TIMESTAMP_SHIFT,
            (id >> WORKER_SHIFT) & MAX_WORKER,
            (id >> PROCESS_SHIFT) & MAX_PROCESS,
            id & SEQUENCE_MASK,
        )
    }
}

fn current_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(SNOWFLAKE_EPOCH_MS, |elapsed| {
            i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
        })
}

/// Next id from the process-wide generator.
///
/// The worker id is 0; the process id is the low bits of the OS process id.
pub fn next_snowflake() -> i64 {
    static GENERATOR: OnceLock<SnowflakeGenerator> = OnceLock::new();
    GENERATOR
        .get_or_init(|| {
            #[allow(clippy::cast_possible_truncation)]
            let process = (std::process::id() & 0x1F) as u8;
            SnowflakeGenerator::new(0, process)
        })
        .next_id()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn ids_increase_and_never_repeat() {
        let generator = SnowflakeGenerator::new(1, 2);
        let ids: Vec<i64> = (0..10_000).map(|_| generator.next_id()).collect();

        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(ids.iter().all(|id| *id > 0));
    }

    #[test]
    fn fields_land_in_their_bits() {
        let generator = SnowflakeGenerator::new(3, 17);
        let (elapsed, worker, process, _) = SnowflakeGenerator::decompose(generator.next_id());

        assert_eq!(worker, 3);
        assert_eq!(process, 17);
        assert!(elapsed > 0);
    }

    #[test]
    fn oversized_worker_ids_are_masked() {
        let generator = SnowflakeGenerator::new(0xFF, 0);
        let (_, worker, process, _) = SnowflakeGenerator::decompose(generator.next_id());
        assert_eq!((worker, process), (31, 0));
    }

    #[test]
    fn exhausted_millisecond_waits_for_the_next_without_the_lock() {
        let generator = SnowflakeGenerator::new(0, 0);
        let ms = SNOWFLAKE_EPOCH_MS + 5_000;

        let first = generator.issue_at(ms).unwrap();
        for _ in 0..SEQUENCE_MASK {
            generator.issue_at(ms).unwrap();
        }
        assert_eq!(generator.issue_at(ms), Err(ms));
        assert!(generator.state.try_lock().is_some());

        let next = generator.issue_at(ms + 1).unwrap();
        let (elapsed, _, _, sequence) = SnowflakeGenerator::decompose(next);
        assert_eq!((elapsed, sequence), (5_001, 0));
        assert!(next > first);
    }

    #[test]
    fn shared_generator_is_unique_across_threads() {
        let generator = Arc::new(SnowflakeGenerator::new(0, 0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let generator = Arc::clone(&generator);
                std::thread::spawn(move || (0..2_000).map(|_| generator.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 8_000);
    }
}
