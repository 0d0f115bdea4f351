//! Retry delay strategies: fixed, ladder, and exponential-with-jitter.

use crate::config::BackoffConfig;

use rand::Rng;
use std::time::Duration;

const DEFAULT_FIXED: Duration = Duration::from_secs(30);
const DEFAULT_BASE: Duration = Duration::from_secs(5);
const DEFAULT_FACTOR: f64 = 6.0;
const DEFAULT_MAX: Duration = Duration::from_secs(3600);

/// Maps an attempt number (1-indexed) to the delay before redelivery.
///
/// Pure apart from the RNG used for exponential jitter; safe to share
/// across worker tasks.
#[derive(Debug, Clone)]
pub enum BackoffStrategy {
    Fixed(Duration),
    /// Configured ladder; attempts past the end stick to the last rung.
    List(Vec<Duration>),
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
        jitter: f64,
    },
}

impl BackoffStrategy {
    /// Build a strategy from raw environment values. Malformed settings fall
    /// back to the documented defaults rather than failing startup.
    pub fn from_config(config: &BackoffConfig) -> Self {
        let mode = config
            .strategy
            .as_deref()
            .map(|s| s.trim().to_ascii_lowercase())
            .unwrap_or_default();

        match mode.as_str() {
            "fixed" => {
                let d = config
                    .fixed
                    .as_deref()
                    .and_then(parse_duration)
                    .unwrap_or(DEFAULT_FIXED);
                Self::Fixed(d)
            }
            "exponential" => {
                let base = config
                    .base
                    .as_deref()
                    .and_then(parse_duration)
                    .unwrap_or(DEFAULT_BASE);
                let factor = config
                    .factor
                    .as_deref()
                    .and_then(|s| s.trim().parse::<f64>().ok())
                    .filter(|&f| f > 1.0)
                    .unwrap_or(DEFAULT_FACTOR);
                let max = config
                    .max
                    .as_deref()
                    .and_then(parse_duration)
                    .unwrap_or(DEFAULT_MAX);
                let jitter = config
                    .jitter
                    .as_deref()
                    .and_then(|s| s.trim().parse::<f64>().ok())
                    .filter(|&j| (0.0..=1.0).contains(&j))
                    .unwrap_or(0.0);
                Self::Exponential {
                    base,
                    factor,
                    max,
                    jitter,
                }
            }
            _ => {
                let ladder: Vec<Duration> = config
                    .backoffs
                    .as_deref()
                    .map(|csv| csv.split(',').filter_map(parse_duration).collect())
                    .unwrap_or_default();
                if ladder.is_empty() {
                    Self::default_ladder()
                } else {
                    Self::List(ladder)
                }
            }
        }
    }

    fn default_ladder() -> Self {
        Self::List(vec![
            Duration::from_secs(5),
            Duration::from_secs(30),
            Duration::from_secs(120),
            Duration::from_secs(600),
            Duration::from_secs(3600),
        ])
    }

    /// Delay before redelivering the given attempt. Attempt numbers below 1
    /// are clamped so the first failure always lands on the first rung.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            Self::Fixed(d) => *d,
            Self::List(ladder) => {
                let index = (attempt as usize - 1).min(ladder.len() - 1);
                ladder[index]
            }
            Self::Exponential {
                base,
                factor,
                max,
                jitter,
            } => {
                let mut delay = base.as_secs_f64() * factor.powi(attempt as i32 - 1);
                delay = delay.min(max.as_secs_f64());
                if *jitter > 0.0 {
                    let noise: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
                    delay += noise * jitter * delay;
                }
                Duration::from_secs_f64(delay.max(0.0))
            }
        }
    }
}

fn parse_duration(raw: &str) -> Option<Duration> {
    humantime::parse_duration(raw.trim())
        .ok()
        .filter(|d| !d.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pairs: &[(&str, &str)]) -> BackoffConfig {
        let mut c = BackoffConfig::default();
        for (key, value) in pairs {
            let slot = match *key {
                "strategy" => &mut c.strategy,
                "backoffs" => &mut c.backoffs,
                "fixed" => &mut c.fixed,
                "base" => &mut c.base,
                "factor" => &mut c.factor,
                "max" => &mut c.max,
                "jitter" => &mut c.jitter,
                other => panic!("unknown key {other}"),
            };
            *slot = Some(value.to_string());
        }
        c
    }

    #[test]
    fn list_indexes_by_attempt_and_clamps_overruns() {
        let ladder = BackoffStrategy::List(vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400),
        ]);
        assert_eq!(ladder.next_delay(1), Duration::from_millis(100));
        assert_eq!(ladder.next_delay(3), Duration::from_millis(400));
        assert_eq!(ladder.next_delay(99), Duration::from_millis(400));
        // attempt 0 clamps to the first rung
        assert_eq!(ladder.next_delay(0), Duration::from_millis(100));
    }

    #[test]
    fn fixed_ignores_attempt_number() {
        let fixed = BackoffStrategy::Fixed(Duration::from_secs(7));
        assert_eq!(fixed.next_delay(1), Duration::from_secs(7));
        assert_eq!(fixed.next_delay(12), Duration::from_secs(7));
    }

    #[test]
    fn exponential_grows_and_clamps_to_max() {
        let strategy = BackoffStrategy::Exponential {
            base: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(5),
            jitter: 0.0,
        };
        assert_eq!(strategy.next_delay(1), Duration::from_secs(1));
        assert_eq!(strategy.next_delay(2), Duration::from_secs(2));
        assert_eq!(strategy.next_delay(3), Duration::from_secs(4));
        assert_eq!(strategy.next_delay(4), Duration::from_secs(5));
        assert_eq!(strategy.next_delay(10), Duration::from_secs(5));
    }

    #[test]
    fn exponential_jitter_stays_within_bounds() {
        let strategy = BackoffStrategy::Exponential {
            base: Duration::from_secs(10),
            factor: 2.0,
            max: Duration::from_secs(3600),
            jitter: 0.5,
        };
        for _ in 0..100 {
            let delay = strategy.next_delay(1).as_secs_f64();
            assert!((5.0..=15.0).contains(&delay), "delay {delay} out of bounds");
        }
    }

    #[test]
    fn from_config_defaults_to_the_standard_ladder() {
        let strategy = BackoffStrategy::from_config(&BackoffConfig::default());
        assert_eq!(strategy.next_delay(1), Duration::from_secs(5));
        assert_eq!(strategy.next_delay(5), Duration::from_secs(3600));
        assert_eq!(strategy.next_delay(6), Duration::from_secs(3600));
    }

    #[test]
    fn from_config_parses_a_custom_ladder() {
        let strategy =
            BackoffStrategy::from_config(&config(&[("backoffs", "100ms, 200ms ,400ms")]));
        assert_eq!(strategy.next_delay(1), Duration::from_millis(100));
        assert_eq!(strategy.next_delay(2), Duration::from_millis(200));
    }

    #[test]
    fn from_config_falls_back_on_malformed_values() {
        let strategy = BackoffStrategy::from_config(&config(&[
            ("strategy", "fixed"),
            ("fixed", "not a duration"),
        ]));
        assert_eq!(strategy.next_delay(3), Duration::from_secs(30));

        let strategy = BackoffStrategy::from_config(&config(&[
            ("strategy", "exponential"),
            ("factor", "0.5"),
            ("jitter", "7"),
        ]));
        match strategy {
            BackoffStrategy::Exponential { factor, jitter, .. } => {
                assert_eq!(factor, 6.0);
                assert_eq!(jitter, 0.0);
            }
            other => panic!("expected exponential, got {other:?}"),
        }
    }
}
