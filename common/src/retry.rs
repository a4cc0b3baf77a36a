use std::env;
use std::time::Duration;

use rand::Rng;

use crate::fault::Fault;

/// Multiplicador fijo del backoff exponencial.
pub const BACKOFF_MULTIPLIER: u64 = 2;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;

/// Política de reintentos de una tarea.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Demora antes del segundo intento (sin jitter)
    pub base_delay: Duration,

    /// Intentos totales, contando el primero
    pub max_attempts: u32,

    pub jitter: bool,

    /// Si los fallos no clasificados entran al camino de reintentos
    pub retry_unclassified: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            jitter: true,
            retry_unclassified: true,
        }
    }
}

impl RetryPolicy {
    /// Lee la política desde variables de entorno:
    /// RETRY_BASE_DELAY_MS, RETRY_MAX_ATTEMPTS, RETRY_JITTER, RETRY_UNCLASSIFIED.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let base_delay = lookup("RETRY_BASE_DELAY_MS")
            .and_then(|s| s.parse::<u64>().ok())
            // una base de 0 anularía todas las demoras
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.base_delay);

        let max_attempts = lookup("RETRY_MAX_ATTEMPTS")
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(defaults.max_attempts)
            .max(1);

        let jitter = lookup("RETRY_JITTER")
            .and_then(|s| parse_bool(&s))
            .unwrap_or(defaults.jitter);

        let retry_unclassified = lookup("RETRY_UNCLASSIFIED")
            .and_then(|s| parse_bool(&s))
            .unwrap_or(defaults.retry_unclassified);

        Self {
            base_delay,
            max_attempts,
            jitter,
            retry_unclassified,
        }
    }

    /// Demora nominal tras fallar el intento `attempt` (1-based):
    /// `base * 2^(attempt-1)`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let factor = BACKOFF_MULTIPLIER.saturating_pow(exp);
        let base_ms = self.base_delay.as_millis().min(u64::MAX as u128) as u64;
        Duration::from_millis(base_ms.saturating_mul(factor))
    }

    /// Demora real tras fallar el intento `attempt`. El jitter suma un
    /// valor uniforme en `[0, nominal)`, de modo que la demora del intento
    /// n+1 nunca es menor que la del intento n.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let nominal_ms = nominal.as_millis() as u64;

        if !self.jitter || nominal_ms == 0 {
            return nominal;
        }

        let extra = rand::thread_rng().gen_range(0..nominal_ms);
        Duration::from_millis(nominal_ms.saturating_add(extra))
    }

    /// ¿Hay que reintentar después de que el intento `attempt` falló con `fault`?
    pub fn should_retry(&self, fault: &Fault, attempt: u32) -> bool {
        if attempt >= self.max_attempts || !fault.is_retryable() {
            return false;
        }
        match fault {
            Fault::Unclassified(_) => self.retry_unclassified,
            _ => true,
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn policy(base_ms: u64, jitter: bool) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(base_ms),
            jitter,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn nominal_delay_doubles_per_attempt() {
        let p = policy(100, false);
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(400));
        assert_eq!(p.delay_for(4), Duration::from_millis(800));
    }

    #[test]
    fn jittered_delays_stay_in_band_and_strictly_increase() {
        let p = policy(50, true);
        for _ in 0..200 {
            let delays: Vec<Duration> = (1..=4).map(|a| p.delay_for(a)).collect();
            for (i, d) in delays.iter().enumerate() {
                let nominal = p.nominal_delay(i as u32 + 1);
                assert!(*d >= nominal && *d < nominal * 2, "{:?} fuera de banda", d);
            }
            assert!(delays.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn stops_after_max_attempts() {
        let p = RetryPolicy::default();
        let fault = Fault::Connectivity("down".into());
        assert!(p.should_retry(&fault, 1));
        assert!(p.should_retry(&fault, 4));
        assert!(!p.should_retry(&fault, 5));
    }

    #[test]
    fn configuration_is_never_retried() {
        let p = RetryPolicy::default();
        assert!(!p.should_retry(&Fault::Configuration("no env".into()), 1));
    }

    #[test]
    fn unclassified_retry_is_configurable() {
        let fault = Fault::Unclassified("bad data".into());
        assert!(RetryPolicy::default().should_retry(&fault, 1));

        let strict = RetryPolicy {
            retry_unclassified: false,
            ..RetryPolicy::default()
        };
        assert!(!strict.should_retry(&fault, 1));
    }

    #[test]
    fn from_lookup_reads_overrides_and_keeps_defaults() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("RETRY_BASE_DELAY_MS", "250"),
            ("RETRY_JITTER", "false"),
            ("RETRY_MAX_ATTEMPTS", "nope"),
        ]);
        let p = RetryPolicy::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(p.base_delay, Duration::from_millis(250));
        assert!(!p.jitter);
        assert_eq!(p.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(p.retry_unclassified);
    }

    #[test]
    fn zero_base_delay_falls_back_to_default() {
        let p = RetryPolicy::from_lookup(|k| (k == "RETRY_BASE_DELAY_MS").then(|| "0".to_string()));

        assert_eq!(p.base_delay, Duration::from_millis(DEFAULT_BASE_DELAY_MS));
        assert!(p.delay_for(2) > p.delay_for(1));
    }
}
