use std::env;

use common::RetryPolicy;

const DEFAULT_MASTER_BASE_URL: &str = "http://master:8080";
const DEFAULT_WORKER_CONCURRENCY: u32 = 2;

/// Configuración del worker, leída del entorno al arrancar.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub master_base_url: String,
    pub max_concurrency: u32,
    pub retry: RetryPolicy,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let master_base_url = lookup("MASTER_BASE_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_MASTER_BASE_URL.to_string());

        let max_concurrency = lookup("WORKER_CONCURRENCY")
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_WORKER_CONCURRENCY)
            .max(1);

        Self {
            master_base_url,
            max_concurrency,
            retry: RetryPolicy::from_lookup(&lookup),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_when_nothing_is_set() {
        let cfg = WorkerConfig::from_lookup(|_| None);
        assert_eq!(cfg.master_base_url, DEFAULT_MASTER_BASE_URL);
        assert_eq!(cfg.max_concurrency, DEFAULT_WORKER_CONCURRENCY);
        assert_eq!(cfg.retry, RetryPolicy::default());
    }

    #[test]
    fn reads_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("MASTER_BASE_URL", "http://localhost:9000/"),
            ("WORKER_CONCURRENCY", "0"),
            ("RETRY_MAX_ATTEMPTS", "3"),
        ]);
        let cfg = WorkerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.master_base_url, "http://localhost:9000");
        assert_eq!(cfg.max_concurrency, 1);
        assert_eq!(cfg.retry.max_attempts, 3);
    }
}
