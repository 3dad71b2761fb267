use std::time::Duration;

use anyhow::bail;

#[derive(Debug, Clone)]
pub struct CrazyflieConfig {
    /// The receive loop blocks on the link for at most this long before it retries. This bounds
    ///  the time it takes for the loop to notice it was cancelled while the link is idle.
    pub receive_timeout: Duration,
    /// pause after a failed `receive()` before the receive loop tries again
    pub receive_error_backoff: Duration,

    /// A request sent with 'expect answer' is re-sent if no packet arrives on the same port
    ///  within this timeout.
    pub answer_timeout: Duration,
    /// Number of re-sends for a request that is not answered. After that, the request is
    ///  abandoned silently and higher layers notice the stall through missing progress.
    pub answer_retries: u32,

    /// Period (in units of 10ms) used to start logging for a block after the vehicle
    ///  acknowledged its creation
    pub log_start_period: u8,

    pub event_channel_capacity: usize,
    pub log_data_channel_capacity: usize,
}

impl Default for CrazyflieConfig {
    fn default() -> Self {
        CrazyflieConfig::new()
    }
}

impl CrazyflieConfig {
    pub fn new() -> CrazyflieConfig {
        CrazyflieConfig {
            receive_timeout: Duration::from_secs(1),
            receive_error_backoff: Duration::from_millis(100),
            answer_timeout: Duration::from_secs(1),
            answer_retries: 1,
            log_start_period: 10,
            event_channel_capacity: 128,
            log_data_channel_capacity: 64,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.receive_timeout.is_zero() {
            bail!("receive timeout must be positive");
        }
        if self.answer_timeout.is_zero() {
            bail!("answer timeout must be positive");
        }
        if self.log_start_period == 0 {
            bail!("log start period must be positive");
        }
        if self.event_channel_capacity == 0 || self.log_data_channel_capacity == 0 {
            bail!("channel capacities must be positive");
        }
        Ok(())
    }
}
