use std::thread;
use std::time::{Duration, Instant};

/// A deadline that can be polled from a busy loop.
pub struct Timeout {
    instant: Instant,
    duration: Duration,
}

impl Timeout {
    #[inline]
    pub fn new(duration: Duration) -> Self {
        Self {
            instant: Instant::now(),
            duration,
        }
    }

    #[inline]
    pub fn from_millis(millis: u64) -> Self {
        Self::new(Duration::from_millis(millis))
    }

    #[inline]
    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    #[inline]
    pub fn expired(&self) -> bool {
        self.instant.elapsed() >= self.duration
    }

    #[inline]
    pub fn remaining(&self) -> Duration {
        self.duration.saturating_sub(self.instant.elapsed())
    }

    /// Waits one polling step, or fails once the deadline has passed.
    #[inline]
    pub fn run(&self) -> Result<(), ()> {
        if self.expired() {
            return Err(());
        }
        // Host schedulers honor short sleeps, so back off a little instead of spinning.
        thread::sleep(self.remaining().min(Duration::from_micros(200)));
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zero_duration_expires_immediately() {
        let timeout = Timeout::new(Duration::ZERO);
        assert!(timeout.expired());
        assert_eq!(timeout.run(), Err(()));
        assert_eq!(timeout.remaining(), Duration::ZERO);
    }

    #[test]
    fn run_polls_until_deadline() {
        let timeout = Timeout::from_millis(5);
        let mut steps = 0;
        while timeout.run().is_ok() {
            steps += 1;
        }
        assert!(steps > 0);
        assert!(timeout.expired());
    }
}
