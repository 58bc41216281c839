//! Consensus parameters the relay validates against.

/// Difficulty and epoch parameters for the tracked chain.
///
/// The relay never hardcodes mainnet values so that tests can run against a
/// low-difficulty preset where valid headers are minable by nonce grinding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkParams {
    /// Number of blocks per difficulty epoch.
    pub epoch_length: u64,
    /// Expected wall-clock duration of one epoch in seconds.
    pub target_timespan_secs: u64,
    /// Compact encoding of the largest admissible target (pow limit).
    pub pow_limit_bits: u32,
}

impl NetworkParams {
    /// Bitcoin mainnet: 2016-block epochs retargeted over two weeks.
    pub fn mainnet() -> Self {
        Self {
            epoch_length: 2016,
            target_timespan_secs: 14 * 24 * 3600,
            pow_limit_bits: 0x1d00ffff,
        }
    }

    /// Regtest-style parameters with a caller-chosen epoch length.
    ///
    /// The pow limit `0x207fffff` lets roughly every other nonce satisfy
    /// proof-of-work, so tests can mine headers on the fly.
    pub fn low_difficulty(epoch_length: u64) -> Self {
        Self {
            epoch_length,
            target_timespan_secs: epoch_length * 600,
            pow_limit_bits: 0x207fffff,
        }
    }

    /// Seconds one block is expected to take on average.
    pub fn target_spacing_secs(&self) -> u64 {
        self.target_timespan_secs / self.epoch_length
    }
}
