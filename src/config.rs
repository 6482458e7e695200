use std::time::Duration;

/// Recognized configuration options, all with sane defaults.
/// Configuration *loading* (files, CLI flags) is out of scope; this reads
/// overrides from the environment, the same ambient-process-configuration
/// style `main.rs` uses for `env::args()`/`env_logger::init()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// `ConsensusMaxEpochLength`: epoch timer duration, in seconds.
    pub consensus_max_epoch_length_secs: u64,
    /// `ConsensusMessageQueueSize`: bounded capacity of the incoming and
    /// finalized-blocks channels.
    pub consensus_message_queue_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            consensus_max_epoch_length_secs: 10,
            consensus_message_queue_size: 1024,
        }
    }
}

impl Config {
    pub fn max_epoch_length(&self) -> Duration {
        Duration::from_secs(self.consensus_max_epoch_length_secs)
    }

    /// Overlay environment-variable overrides onto the defaults. Malformed
    /// values are logged and ignored rather than failing the process — this
    /// is ambient configuration, not a required input.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("CONSENSUS_MAX_EPOCH_LENGTH_SECS") {
            match v.parse() {
                Ok(secs) => config.consensus_max_epoch_length_secs = secs,
                Err(e) => log::warn!("ignoring invalid CONSENSUS_MAX_EPOCH_LENGTH_SECS: {e}"),
            }
        }
        if let Ok(v) = std::env::var("CONSENSUS_MESSAGE_QUEUE_SIZE") {
            match v.parse() {
                Ok(size) => config.consensus_message_queue_size = size,
                Err(e) => log::warn!("ignoring invalid CONSENSUS_MESSAGE_QUEUE_SIZE: {e}"),
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.consensus_max_epoch_length_secs > 0);
        assert!(config.consensus_message_queue_size > 0);
    }
}
