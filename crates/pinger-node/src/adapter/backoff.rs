use std::time::Duration;

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(600);

/// Exponential backoff: 1s, 2s, 4s, ... capped at 10 minutes.
#[derive(Debug, Clone, Default)]
pub struct Backoff {
    current: Option<Duration>,
    attempts: u32,
}

impl Backoff {
    /// Advance and return the delay to wait before the next try.
    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => INITIAL_BACKOFF,
            Some(d) => (d * 2).min(MAX_BACKOFF),
        };
        self.current = Some(delay);
        self.attempts += 1;
        delay
    }

    /// Delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.current = None;
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_cap() {
        let mut b = Backoff::default();
        let delays: Vec<u64> = (0..12).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, [1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 600, 600]);
        assert_eq!(b.attempts(), 12);

        b.reset();
        assert_eq!(b.attempts(), 0);
        assert_eq!(b.next_delay(), INITIAL_BACKOFF);
    }
}
