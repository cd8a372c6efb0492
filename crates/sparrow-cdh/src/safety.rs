use std::time::{Duration, Instant};

/// Dangerous commands get a floor between invocations so a repeated or
/// replayed uplink cannot hammer the satellite into a reset loop.
#[derive(Debug)]
pub struct CommandRateLimit {
    last_reset: Option<Instant>,
    last_shutdown: Option<Instant>,
    min_interval: Duration,
}

impl CommandRateLimit {
    pub fn new(min_interval: Duration) -> Self {
        Self { last_reset: None, last_shutdown: None, min_interval }
    }

    pub fn allow_reset(&mut self) -> bool {
        let now = Instant::now();
        if let Some(t) = self.last_reset {
            if now.duration_since(t) < self.min_interval {
                return false;
            }
        }
        self.last_reset = Some(now);
        true
    }

    pub fn allow_shutdown(&mut self) -> bool {
        let now = Instant::now();
        if let Some(t) = self.last_shutdown {
            if now.duration_since(t) < self.min_interval {
                return false;
            }
        }
        self.last_shutdown = Some(now);
        true
    }
}
