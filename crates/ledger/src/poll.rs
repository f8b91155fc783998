//! Exponential-backoff delay schedule for indexer polling.
//!
//! `delay = min(initial_delay_ms * multiplier^(attempt-1), max_delay_ms)`,
//! computed with clamped f64 exponentiation and compared in integer
//! milliseconds. Deterministic: no randomness, no wall clock.

/// Backoff schedule parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    /// Delay before the second poll (the first poll is immediate).
    pub initial_delay_ms: u64,
    /// Upper bound for any computed delay.
    pub max_delay_ms: u64,
    /// Multiplicative growth per attempt.
    pub multiplier: f64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 8_000,
            multiplier: 2.0,
        }
    }
}

/// Delay in milliseconds before poll `attempt` (1-indexed: attempt 1 is
/// the wait after the first miss).
pub fn compute_delay(config: &PollConfig, attempt: u32) -> u64 {
    let exponent = attempt.saturating_sub(1);
    // f64 saturates far above max_delay_ms for any realistic attempt
    // count; the clamp below makes overflow harmless.
    let scaled = (config.initial_delay_ms as f64) * config.multiplier.powi(exponent as i32);
    if !scaled.is_finite() || scaled >= config.max_delay_ms as f64 {
        config.max_delay_ms
    } else {
        scaled as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_cap() {
        let config = PollConfig::default();
        assert_eq!(compute_delay(&config, 1), 500);
        assert_eq!(compute_delay(&config, 2), 1_000);
        assert_eq!(compute_delay(&config, 3), 2_000);
        assert_eq!(compute_delay(&config, 4), 4_000);
        assert_eq!(compute_delay(&config, 5), 8_000);
        assert_eq!(compute_delay(&config, 6), 8_000);
        assert_eq!(compute_delay(&config, 60), 8_000);
    }

    #[test]
    fn huge_attempt_numbers_stay_clamped() {
        let config = PollConfig::default();
        assert_eq!(compute_delay(&config, u32::MAX), config.max_delay_ms);
    }
}
