use std::time::Duration;

use rand::Rng;

/// Shared backoff configuration used by HTTP retries and stream reconnects.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub jitter: f64,
}

impl BackoffConfig {
    /// Deterministic exponential backoff without jitter.
    pub fn exponential(initial_delay: Duration, factor: f64, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            factor,
            jitter: 0.0,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.initial_delay.is_zero() {
            return Err("Initial backoff delay must be > 0".to_string());
        }
        if self.max_delay.is_zero() {
            return Err("Max backoff delay must be > 0".to_string());
        }
        if self.max_delay < self.initial_delay {
            return Err("Max backoff delay must be >= initial backoff delay".to_string());
        }
        if self.factor < 1.0 || !self.factor.is_finite() {
            return Err("Backoff factor must be >= 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter) || !self.jitter.is_finite() {
            return Err("Jitter must be between 0.0 and 1.0".to_string());
        }
        Ok(())
    }

    /// Delay before retry/reconnect number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        calculate_backoff(*self, attempt)
    }
}

pub fn calculate_backoff(config: BackoffConfig, attempt: u32) -> Duration {
    let initial = config.initial_delay.as_secs_f64();
    let max = config.max_delay.as_secs_f64();
    let exponent = config.factor.powf(f64::from(attempt));
    let base = (initial * exponent).min(max);

    if config.jitter == 0.0 {
        return Duration::from_secs_f64(base);
    }

    let mut rng = rand::rng();
    let randomized = rng.random_range(0.0..=base);
    let blended = base * (1.0 - config.jitter) + randomized * config.jitter;
    Duration::from_secs_f64(blended)
}
