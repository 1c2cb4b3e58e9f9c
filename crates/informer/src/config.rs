//! Informer configuration: defaults, `TANJUN_*` env knobs and validation.

#![forbid(unsafe_code)]

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tanjun_core::{LabelSelector, ListSelector, SelectorError};
use tanjun_kubehub::{BackoffConfig, ReflectorConfig};
use tracing::warn;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("backoff_initial_ms must be greater than zero")]
    ZeroBackoff,
    #[error("backoff_max_secs ({max_ms} ms) is below backoff_initial_ms ({initial_ms} ms)")]
    BackoffOrder { initial_ms: u64, max_ms: u64 },
    #[error("backoff_jitter must be in [0, 1), got {0}")]
    Jitter(f64),
    #[error("label selector: {0}")]
    Selector(#[from] SelectorError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InformerConfig {
    /// Namespace to mirror; `None` watches all namespaces.
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    /// Resync period; 0 disables it.
    pub resync_secs: u64,
    pub watch_timeout_secs: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_secs: u64,
    pub backoff_jitter: f64,
    pub failure_threshold: u32,
    /// Initial capacity of the delta queue.
    pub queue_cap: usize,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            label_selector: None,
            resync_secs: 30,
            watch_timeout_secs: 300,
            backoff_initial_ms: 800,
            backoff_max_secs: 30,
            backoff_jitter: 0.2,
            failure_threshold: 5,
            queue_cap: 2048,
        }
    }
}

impl InformerConfig {
    pub fn namespaced(namespace: &str) -> Self {
        Self { namespace: Some(namespace.to_string()), ..Self::default() }
    }

    /// Defaults overridden by `TANJUN_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(ns) = lookup("TANJUN_NAMESPACE").filter(|s| !s.is_empty()) {
            cfg.namespace = Some(ns);
        }
        if let Some(sel) = lookup("TANJUN_LABEL_SELECTOR").filter(|s| !s.is_empty()) {
            cfg.label_selector = Some(sel);
        }
        parse_into(&lookup, "TANJUN_RESYNC_SECS", &mut cfg.resync_secs);
        parse_into(&lookup, "TANJUN_WATCH_TIMEOUT_SECS", &mut cfg.watch_timeout_secs);
        parse_into(&lookup, "TANJUN_BACKOFF_INITIAL_MS", &mut cfg.backoff_initial_ms);
        parse_into(&lookup, "TANJUN_BACKOFF_MAX_SECS", &mut cfg.backoff_max_secs);
        parse_into(&lookup, "TANJUN_BACKOFF_JITTER", &mut cfg.backoff_jitter);
        parse_into(&lookup, "TANJUN_FAILURE_THRESHOLD", &mut cfg.failure_threshold);
        parse_into(&lookup, "TANJUN_QUEUE_CAP", &mut cfg.queue_cap);
        cfg
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff_initial_ms == 0 {
            return Err(ConfigError::ZeroBackoff);
        }
        let max_ms = self.backoff_max_secs.saturating_mul(1000);
        if max_ms < self.backoff_initial_ms {
            return Err(ConfigError::BackoffOrder { initial_ms: self.backoff_initial_ms, max_ms });
        }
        if !(0.0..1.0).contains(&self.backoff_jitter) {
            return Err(ConfigError::Jitter(self.backoff_jitter));
        }
        self.selector().map(|_| ())
    }

    pub fn selector(&self) -> Result<ListSelector, ConfigError> {
        let labels = match self.label_selector.as_deref() {
            Some(s) => LabelSelector::from_str(s)?,
            None => LabelSelector::everything(),
        };
        Ok(ListSelector { namespace: self.namespace.clone(), labels })
    }

    pub fn resync(&self) -> Option<Duration> {
        (self.resync_secs > 0).then(|| Duration::from_secs(self.resync_secs))
    }

    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(self.backoff_initial_ms),
            max: Duration::from_secs(self.backoff_max_secs),
            factor: 2,
            jitter: self.backoff_jitter,
        }
    }

    /// Validate and derive the reflector's settings.
    pub fn reflector(&self) -> Result<ReflectorConfig, ConfigError> {
        self.validate()?;
        Ok(ReflectorConfig {
            selector: self.selector()?,
            resync: self.resync(),
            backoff: self.backoff(),
            failure_threshold: self.failure_threshold.max(1),
        })
    }
}

fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else { return };
    match raw.trim().parse() {
        Ok(v) => *slot = v,
        Err(_) => warn!(var = key, value = %raw, "ignoring unparsable setting"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_overrides_defaults() {
        let vars: HashMap<&str, &str> = [
            ("TANJUN_NAMESPACE", "test"),
            ("TANJUN_RESYNC_SECS", "0"),
            ("TANJUN_BACKOFF_INITIAL_MS", "250"),
            ("TANJUN_FAILURE_THRESHOLD", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let cfg = InformerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.namespace.as_deref(), Some("test"));
        assert_eq!(cfg.resync(), None);
        assert_eq!(cfg.backoff().initial, Duration::from_millis(250));
        assert_eq!(cfg.failure_threshold, 5);
        assert_eq!(cfg.queue_cap, 2048);
    }

    #[test]
    fn validation_rejects_bad_backoff() {
        let zero = InformerConfig { backoff_initial_ms: 0, ..Default::default() };
        assert_eq!(zero.validate(), Err(ConfigError::ZeroBackoff));

        let inverted = InformerConfig { backoff_initial_ms: 5000, backoff_max_secs: 1, ..Default::default() };
        assert!(matches!(inverted.validate(), Err(ConfigError::BackoffOrder { .. })));

        let jitter = InformerConfig { backoff_jitter: 1.0, ..Default::default() };
        assert_eq!(jitter.validate(), Err(ConfigError::Jitter(1.0)));

        assert!(InformerConfig::default().validate().is_ok());
    }

    #[test]
    fn selector_comes_from_config() {
        let cfg = InformerConfig { label_selector: Some("app=tanjun,!legacy".into()), ..InformerConfig::namespaced("test") };
        let sel = cfg.selector().unwrap();
        assert_eq!(sel.namespace.as_deref(), Some("test"));
        assert_eq!(sel.labels.requirements().len(), 2);

        let bad = InformerConfig { label_selector: Some("=oops".into()), ..Default::default() };
        assert!(matches!(bad.validate(), Err(ConfigError::Selector(_))));
    }

    #[test]
    fn deserializes_partial_documents() {
        let cfg: InformerConfig = serde_json::from_str(r#"{"namespace":"test","resync_secs":5}"#).unwrap();
        assert_eq!(cfg.resync(), Some(Duration::from_secs(5)));
        assert_eq!(cfg.backoff_max_secs, 30);
    }
}
