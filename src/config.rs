use std::time::Duration;
use anyhow::bail;

use crate::command::MAX_HEADER_AND_DATA_OVERHEAD;

#[derive(Debug, Clone)]
pub struct ResilientConfig {
    /// Interval at which the retry sender re-sends handshake commands that were not answered yet
    pub retry_interval: Duration,

    /// Upper bound for [crate::Supervisor::connect] to wait for the handshake to complete. `None`
    ///  means waiting forever, re-trying the handshake for as long as it takes.
    pub connect_timeout: Option<Duration>,
    /// Upper bound for a single call to the transport provider's `connect`
    pub transport_connect_timeout: Duration,

    /// After sending a JOIN_CONNECTION on a fresh transport connection, recovery waits this long
    ///  for the connection to become established before abandoning the attempt
    pub rejoin_attempt_timeout: Duration,
    /// Fixed pause between two recovery attempts
    pub recovery_backoff: Duration,
    /// `None` means that recovery is re-tried indefinitely. If a limit is configured and reached,
    ///  the logical connection is closed locally.
    pub max_recovery_attempts: Option<u32>,

    /// Interval for re-sending CLOSE_CONNECTION until it is acknowledged
    pub close_retry_interval: Duration,
    /// Time after which the receiving side of a CLOSE_CONNECTION closes the connection, even if
    ///  the peer's transport connection is not physically closed
    pub close_grace_period: Duration,
    /// Time after which the closing side gives up waiting for an acknowledgement and closes
    ///  the connection locally
    pub close_timeout: Duration,

    /// A cumulative DATA_RECEIVED is sent at this interval if packets were received since the
    ///  previous one...
    pub ack_interval: Duration,
    /// ... or as soon as this many packets were received
    pub ack_every_n_packets: u32,

    /// Application writes are split into DATA packets of at most this size
    pub max_payload_len: usize,
    /// Frames with a declared length above this are treated as protocol errors. This protects
    ///  against allocating huge buffers for corrupted length fields.
    pub max_frame_len: usize,
}

impl Default for ResilientConfig {
    fn default() -> Self {
        ResilientConfig {
            retry_interval: Duration::from_secs(1),
            connect_timeout: None,
            transport_connect_timeout: Duration::from_secs(10),
            rejoin_attempt_timeout: Duration::from_secs(10),
            recovery_backoff: Duration::from_secs(1),
            max_recovery_attempts: None,
            close_retry_interval: Duration::from_secs(2),
            close_grace_period: Duration::from_secs(5),
            close_timeout: Duration::from_secs(60),
            ack_interval: Duration::from_millis(200),
            ack_every_n_packets: 64,
            max_payload_len: 64*1024,
            max_frame_len: 16*1024*1024,
        }
    }
}

impl ResilientConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retry_interval.is_zero() || self.close_retry_interval.is_zero() || self.ack_interval.is_zero() {
            bail!("retry, close retry and ack intervals must be positive");
        }
        if self.ack_every_n_packets == 0 {
            bail!("ack_every_n_packets must be positive");
        }
        if self.max_payload_len == 0 {
            bail!("max_payload_len must be positive");
        }
        if self.max_payload_len > u32::MAX as usize {
            bail!("max_payload_len must fit into a u32 length field");
        }
        if self.max_payload_len + MAX_HEADER_AND_DATA_OVERHEAD > self.max_frame_len {
            bail!("max_frame_len ({}) is too small for DATA frames with a payload of {} bytes", self.max_frame_len, self.max_payload_len);
        }
        if self.max_recovery_attempts == Some(0) {
            bail!("max_recovery_attempts must be positive if it is set");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        assert!(ResilientConfig::default().validate().is_ok());
    }

    #[rstest]
    #[case::zero_retry(|c: &mut ResilientConfig| c.retry_interval = Duration::ZERO)]
    #[case::zero_ack_interval(|c: &mut ResilientConfig| c.ack_interval = Duration::ZERO)]
    #[case::zero_ack_count(|c: &mut ResilientConfig| c.ack_every_n_packets = 0)]
    #[case::zero_payload(|c: &mut ResilientConfig| c.max_payload_len = 0)]
    #[case::frame_too_small(|c: &mut ResilientConfig| c.max_frame_len = c.max_payload_len)]
    #[case::zero_recovery_attempts(|c: &mut ResilientConfig| c.max_recovery_attempts = Some(0))]
    fn test_validate_rejects(#[case] modify: fn(&mut ResilientConfig)) {
        let mut config = ResilientConfig::default();
        modify(&mut config);
        assert!(config.validate().is_err());
    }
}
