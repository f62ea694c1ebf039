//! Configuration for the transaction core
//!
//! Built once at broker startup and shared read-only by the registry, the
//! reaper and the watchdog.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, TxnError};

pub const PRODUCER_MAX_PROP: &str = "imq.transaction.producer.maxNumMsgs";
pub const CONSUMER_MAX_PROP: &str = "imq.transaction.consumer.maxNumMsgs";
pub const REAP_LIMIT_PROP: &str = "imq.txn.reapLimit";
pub const REAP_OVER_THRESHOLD_PROP: &str = "imq.txn.reapLimitOverThreshold";
pub const REAP_INTERVAL_PROP: &str = "imq.txn.reapInterval";
pub const DETACHED_TIMEOUT_PROP: &str = "imq.transaction.detachedTimeout";
pub const DETACHED_RETAIN_ALL_PROP: &str = "imq.transaction.detachedRetainAll";
pub const RECONNECT_MULTIPLIER_PROP: &str = "imq.reconnect.multiplier";
pub const MAX_RECONNECT_INTERVAL_PROP: &str = "imq.cluster.maxReconnectInterval";
pub const RECONNECT_NOTIFY_WINDOW_PROP: &str = "imq.txn.reconnectNotifyWindow";
pub const AUTO_ROLLBACK_PROP: &str = "imq.transaction.autorollback";
pub const HA_PROP: &str = "imq.cluster.ha";

/// Transaction core configuration
///
/// # Presets
///
/// - [`TxnConfig::default()`] - Broker defaults (reap limit 500, 15 minute sweep)
/// - [`TxnConfig::immediate_reap()`] - Committed transactions are removed synchronously
/// - [`TxnConfig::high_availability()`] - HA cluster with a shared store
#[derive(Debug, Clone)]
pub struct TxnConfig {
    /// Maximum messages one transaction may produce
    pub producer_max_messages: usize,
    /// Maximum distinct messages one transaction may consume
    pub consumer_max_messages: usize,
    /// Committed transactions kept before the reaper trims inline; 0 reaps immediately
    pub reap_limit: usize,
    /// Percent over `reap_limit` that triggers an inline reap on the caller's thread
    pub reap_limit_over_threshold: u32,
    /// Period of the reaper sweep
    pub reap_interval: Duration,
    /// Timeout for detached transactions; zero disables the watchdog
    pub detached_timeout: Duration,
    /// Keep detached transactions tracked even after they stop qualifying
    pub detached_retain_all: bool,
    /// Multiplier applied to the detached timeout of one-phase prepared transactions
    pub reconnect_multiplier: u32,
    /// Longest interval between client reconnect attempts
    pub max_reconnect_interval: Duration,
    /// A broker that reconnected within this window is re-notified of pending commits
    pub reconnect_notify_window: Duration,
    /// Roll back every PREPARED transaction found at startup
    pub auto_rollback: bool,
    /// High availability (shared store, takeover) is enabled
    pub ha_enabled: bool,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            producer_max_messages: 10_000,
            consumer_max_messages: 1_000,
            reap_limit: 500,
            reap_limit_over_threshold: 100,
            reap_interval: Duration::from_secs(900),
            detached_timeout: Duration::ZERO,
            detached_retain_all: false,
            reconnect_multiplier: 5,
            max_reconnect_interval: Duration::ZERO,
            reconnect_notify_window: Duration::from_secs(900),
            auto_rollback: false,
            ha_enabled: false,
        }
    }
}

impl TxnConfig {
    /// Committed transactions are removed as soon as they are handed off
    pub fn immediate_reap() -> Self {
        Self {
            reap_limit: 0,
            ..Default::default()
        }
    }

    pub fn high_availability() -> Self {
        Self {
            ha_enabled: true,
            ..Default::default()
        }
    }

    /// Read the configuration from broker properties. Missing keys keep their defaults.
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = parse_prop::<usize>(props, PRODUCER_MAX_PROP)? {
            config.producer_max_messages = v;
        }
        if let Some(v) = parse_prop::<usize>(props, CONSUMER_MAX_PROP)? {
            config.consumer_max_messages = v;
        }
        if let Some(v) = parse_prop::<usize>(props, REAP_LIMIT_PROP)? {
            config.reap_limit = v;
        }
        if let Some(v) = parse_prop::<u32>(props, REAP_OVER_THRESHOLD_PROP)? {
            config.reap_limit_over_threshold = v;
        }
        if let Some(secs) = parse_prop::<i64>(props, REAP_INTERVAL_PROP)? {
            config.reap_interval = if secs <= 0 {
                Duration::from_secs(1)
            } else {
                Duration::from_secs(secs as u64)
            };
            config.reconnect_notify_window = config.reap_interval;
        }
        if let Some(secs) = parse_prop::<i64>(props, DETACHED_TIMEOUT_PROP)? {
            config.detached_timeout = Duration::from_secs(secs.max(0) as u64);
        }
        if let Some(v) = parse_prop::<bool>(props, DETACHED_RETAIN_ALL_PROP)? {
            config.detached_retain_all = v;
        }
        if let Some(v) = parse_prop::<u32>(props, RECONNECT_MULTIPLIER_PROP)? {
            config.reconnect_multiplier = v;
        }
        if let Some(ms) = parse_prop::<u64>(props, MAX_RECONNECT_INTERVAL_PROP)? {
            config.max_reconnect_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_prop::<u64>(props, RECONNECT_NOTIFY_WINDOW_PROP)? {
            config.reconnect_notify_window = Duration::from_secs(secs);
        }
        if let Some(v) = parse_prop::<bool>(props, AUTO_ROLLBACK_PROP)? {
            config.auto_rollback = v;
        }
        if let Some(v) = parse_prop::<bool>(props, HA_PROP)? {
            config.ha_enabled = v;
        }
        Ok(config)
    }

    /// The watchdog is off unless a positive timeout is configured
    pub fn detached_watchdog_enabled(&self) -> bool {
        !self.detached_timeout.is_zero()
    }

    /// Backlog size above which an add reaps one entry inline
    pub fn inline_reap_threshold(&self) -> usize {
        let over = self.reap_limit as u64 * u64::from(self.reap_limit_over_threshold) / 100;
        self.reap_limit.saturating_add(over as usize)
    }
}

fn parse_prop<T: FromStr>(props: &HashMap<String, String>, key: &str) -> Result<Option<T>> {
    match props.get(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            TxnError::internal(format!("Invalid value '{}' for property {}", raw, key))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TxnConfig::default();
        assert_eq!(config.producer_max_messages, 10_000);
        assert_eq!(config.consumer_max_messages, 1_000);
        assert_eq!(config.reap_limit, 500);
        assert_eq!(config.reap_interval, Duration::from_secs(900));
        assert!(!config.detached_watchdog_enabled());
        assert_eq!(config.inline_reap_threshold(), 1_000);
    }

    #[test]
    fn test_presets() {
        assert_eq!(TxnConfig::immediate_reap().reap_limit, 0);
        assert!(TxnConfig::high_availability().ha_enabled);
    }

    #[test]
    fn test_from_properties() {
        let mut props = HashMap::new();
        props.insert(REAP_LIMIT_PROP.to_string(), "10".to_string());
        props.insert(REAP_OVER_THRESHOLD_PROP.to_string(), "50".to_string());
        props.insert(REAP_INTERVAL_PROP.to_string(), "0".to_string());
        props.insert(DETACHED_TIMEOUT_PROP.to_string(), "30".to_string());
        props.insert(AUTO_ROLLBACK_PROP.to_string(), "true".to_string());

        let config = TxnConfig::from_properties(&props).unwrap();
        assert_eq!(config.reap_limit, 10);
        assert_eq!(config.inline_reap_threshold(), 15);
        assert_eq!(config.reap_interval, Duration::from_secs(1));
        assert_eq!(config.detached_timeout, Duration::from_secs(30));
        assert!(config.auto_rollback);
        assert_eq!(config.consumer_max_messages, 1_000);
    }

    #[test]
    fn test_invalid_property() {
        let mut props = HashMap::new();
        props.insert(PRODUCER_MAX_PROP.to_string(), "lots".to_string());
        let err = TxnConfig::from_properties(&props).unwrap_err();
        assert!(err.to_string().contains(PRODUCER_MAX_PROP));
    }
}
