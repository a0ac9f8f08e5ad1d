use std::time::Duration;

/// Timeouts governing session establishment.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a connector waits for the listener to publish a
    /// region file after dropping its marker.
    pub setup_timeout: Duration,
    /// How long the listener waits for a connector to acknowledge the
    /// published regions. Generous because the connector may be paced
    /// by a debugger or a loaded machine.
    pub ack_timeout: Duration,
    /// Granularity at which a blocked accept rechecks for markers.
    pub accept_poll: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            setup_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(50),
            accept_poll: Duration::from_millis(250),
        }
    }
}

impl SessionConfig {
    pub fn with_setup_timeout(mut self, setup_timeout: Duration) -> Self {
        self.setup_timeout = setup_timeout;
        self
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    pub fn with_accept_poll(mut self, accept_poll: Duration) -> Self {
        self.accept_poll = accept_poll;
        self
    }
}
