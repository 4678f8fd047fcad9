//! Exponential backoff with jitter for the client set sync loop.

use rand::Rng;
use tokio::time::Duration;

/// Growth applied to the interval after every step.
pub const BACKOFF_FACTOR: f64 = 1.5;
/// Maximum relative deviation applied to every returned interval.
pub const BACKOFF_JITTER: f64 = 0.1;

/// Backoff state for the sync loop.
///
/// `step` returns the current interval (jittered) and then grows it by
/// `factor`, never beyond `cap`. There is no step limit; once at the cap the
/// backoff keeps returning the cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    duration: Duration,
    factor: f64,
    jitter: f64,
    cap: Duration,
}

impl Backoff {
    /// A fresh backoff starting at `base`. A zero `cap` means no ceiling.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            duration: base,
            factor: BACKOFF_FACTOR,
            jitter: BACKOFF_JITTER,
            cap,
        }
    }

    /// The interval the next `step` is based on.
    pub fn current(&self) -> Duration {
        self.duration
    }

    /// The current interval with jitter, without advancing.
    pub fn jittered(&self) -> Duration {
        jitter(self.duration, self.jitter)
    }

    /// Returns the current interval with jitter and advances the backoff.
    pub fn step(&mut self) -> Duration {
        let duration = self.duration;

        let next = self.duration.mul_f64(self.factor);
        self.duration = if !self.cap.is_zero() && next > self.cap {
            self.cap
        } else {
            next
        };

        jitter(duration, self.jitter)
    }
}

/// Returns `duration` scaled by a random factor in `[1 - max_factor, 1 + max_factor]`.
pub fn jitter(duration: Duration, max_factor: f64) -> Duration {
    if max_factor <= 0.0 {
        return duration;
    }
    let factor = rand::thread_rng().gen_range(-max_factor..=max_factor);
    duration.mul_f64(1.0 + factor)
}
