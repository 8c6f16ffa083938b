//! Property-based test generators using proptest.
//!
//! Strategies for the writer's append pattern and the interleaving of
//! writer appends with producer and consumer cycles.

use proptest::prelude::*;

/// Strategy for one append by the external writer.
pub fn chunk_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..512)
}

/// Strategy for a sequence of appends.
pub fn append_sequence_strategy(
    min_chunks: usize,
    max_chunks: usize,
) -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(chunk_strategy(), min_chunks..max_chunks)
}

/// One step of a sync run.
#[derive(Debug, Clone)]
pub enum SyncStep {
    /// The external writer appends to the source.
    Write(Vec<u8>),
    /// The producer runs a cycle.
    Produce,
    /// The consumer runs a cycle.
    Consume,
    /// The producer process restarts from its persisted watermark.
    RestartProducer,
    /// The consumer process restarts from its persisted watermark.
    RestartConsumer,
}

/// Strategy for a single step.
pub fn sync_step_strategy() -> impl Strategy<Value = SyncStep> {
    prop_oneof![
        3 => chunk_strategy().prop_map(SyncStep::Write),
        3 => Just(SyncStep::Produce),
        3 => Just(SyncStep::Consume),
        1 => Just(SyncStep::RestartProducer),
        1 => Just(SyncStep::RestartConsumer),
    ]
}

/// Strategy for a sequence of steps.
pub fn sync_steps_strategy(min_steps: usize, max_steps: usize) -> impl Strategy<Value = Vec<SyncStep>> {
    prop::collection::vec(sync_step_strategy(), min_steps..max_steps)
}

/// Strategy for well-formed watermark records and the value they hold.
///
/// Includes surrounding whitespace and an optional `+`, which readers
/// tolerate.
pub fn watermark_record_strategy() -> impl Strategy<Value = (String, u64)> {
    (any::<u64>(), "[ \t\r\n]{0,2}", "\\+?", "[ \t\r\n]{0,2}").prop_map(
        |(value, lead, sign, trail)| (format!("{lead}{sign}{value}{trail}"), value),
    )
}

/// Strategy for watermark records that must be rejected.
pub fn corrupt_record_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-zA-Z]{1,8}",
        "[0-9]{1,5}[a-zA-Z.,_]{1,3}[0-9]{0,3}",
        "-[0-9]{1,5}",
        "\\+[+-][0-9]{1,5}",
        // One past u64::MAX.
        Just("18446744073709551616".to_string()),
    ]
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tailsync_storage::parse_watermark;

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn well_formed_records_parse((record, value) in watermark_record_strategy()) {
            prop_assert_eq!(parse_watermark(Path::new("wm"), record.as_bytes()).unwrap(), value);
        }

        #[test]
        fn corrupt_records_rejected(record in corrupt_record_strategy()) {
            prop_assert!(parse_watermark(Path::new("wm"), record.as_bytes()).is_err());
        }

        #[test]
        fn sequences_respect_bounds(steps in sync_steps_strategy(2, 10)) {
            prop_assert!((2..10).contains(&steps.len()));
        }
    }
}
