use std::time::Duration;

use cmux_frame::MAX_PAYLOAD;

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Acknowledgement timer for SABM. Default: 300 ms.
    pub t1: Duration,
    /// Retransmissions after the first SABM before giving up. Default: 3.
    pub retransmits: u32,
    /// Largest UIH payload sent per frame, capped at 127. Default: 127.
    pub max_payload: usize,
    /// Inbound bytes buffered per channel before receive is suspended.
    /// Default: 4 KiB.
    pub rx_buffer_limit: usize,
}

impl MuxConfig {
    /// Payload size actually used for outbound UIH frames.
    pub fn effective_payload(&self) -> usize {
        self.max_payload.clamp(1, MAX_PAYLOAD)
    }
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(300),
            retransmits: 3,
            max_payload: MAX_PAYLOAD,
            rx_buffer_limit: 4 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = MuxConfig::default();
        assert_eq!(config.t1, Duration::from_millis(300));
        assert_eq!(config.retransmits, 3);
        assert_eq!(config.effective_payload(), 127);
        assert_eq!(config.rx_buffer_limit, 4096);
    }

    #[test]
    fn payload_is_clamped() {
        let config = MuxConfig {
            max_payload: 4096,
            ..MuxConfig::default()
        };
        assert_eq!(config.effective_payload(), 127);

        let config = MuxConfig {
            max_payload: 0,
            ..MuxConfig::default()
        };
        assert_eq!(config.effective_payload(), 1);
    }
}
