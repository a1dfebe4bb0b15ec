//! Pool and subscription options.
//!
//! [`PoolOptions`] can be loaded from TOML. Durations are written as integer
//! milliseconds under `*_ms` keys:
//!
//! ```toml
//! relays = ["wss://relay.damus.io"]
//! use_event_cache = true
//! log_subscriptions = false
//!
//! [relay]
//! connect_timeout_ms = 10000
//! min_reconnect_delay_ms = 2000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::relay::RelayConfig;

/// Relays queried for write-relay lists, metadata and contact lists.
pub const DEFAULT_INFO_RELAYS: &[&str] = &["wss://us.rbr.bio", "wss://eu.rbr.bio"];

/// Pool-wide options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Relays to connect to as soon as the pool starts
    pub relays: Vec<String>,
    /// Keep a local event cache and answer queries from it
    pub use_event_cache: bool,
    /// Share one live subscription between identical `unsubscribe_on_eose` calls
    pub subscription_cache: bool,
    /// Log every batch of wire subscriptions
    pub log_subscriptions: bool,
    /// Accept events without checking their signatures
    pub skip_verification: bool,
    /// Strip signatures from received events before caching and delivery
    pub delete_signatures: bool,
    /// Relays used to look up write relays, metadata and contact lists
    pub info_relays: Vec<String>,
    /// How long a write relay, metadata or contact list lookup may take
    #[serde(rename = "lookup_timeout_ms", with = "duration_ms")]
    pub lookup_timeout: Duration,
    /// How long `get_event_by_id` waits for the event
    #[serde(rename = "event_timeout_ms", with = "duration_ms")]
    pub event_timeout: Duration,
    /// Settings for every relay connection
    pub relay: RelayConfig,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            use_event_cache: true,
            subscription_cache: true,
            log_subscriptions: false,
            skip_verification: false,
            delete_signatures: false,
            info_relays: DEFAULT_INFO_RELAYS.iter().map(|s| s.to_string()).collect(),
            lookup_timeout: Duration::from_secs(10),
            event_timeout: Duration::from_secs(30),
            relay: RelayConfig::default(),
        }
    }
}

impl PoolOptions {
    /// Parse options from a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    /// Load options from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            crate::error::ClientError::Config(format!("reading {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&source)
    }
}

/// Per-call subscription options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionOptions {
    /// Deliver an event again when another relay sends the same id
    pub allow_duplicate_events: bool,
    /// Deliver replaceable events older than one already delivered
    pub allow_older_events: bool,
    /// Close the wire subscriptions once every relay has sent EOSE
    pub unsubscribe_on_eose: bool,
    /// Relays used when author relay lookup finds nothing
    pub default_relays: Option<Vec<String>>,
    /// Log every event delivered to this subscription
    pub log_all_events: bool,
}

impl SubscriptionOptions {
    pub fn unsubscribe_on_eose() -> Self {
        Self {
            unsubscribe_on_eose: true,
            ..Self::default()
        }
    }
}

/// Serde helper for durations stored as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(value) => serializer.serialize_some(&(value.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = PoolOptions::default();
        assert!(options.use_event_cache);
        assert!(options.subscription_cache);
        assert!(!options.skip_verification);
        assert!(!options.delete_signatures);
        assert_eq!(options.info_relays.len(), 2);
        assert!(options.relay.auto_reconnect);
    }

    #[test]
    fn test_from_toml_partial() {
        let options = PoolOptions::from_toml_str(
            r#"
            relays = ["wss://relay.example.com"]
            skip_verification = true
            lookup_timeout_ms = 2500

            [relay]
            min_reconnect_delay_ms = 500
            max_reconnect_delay_ms = 60000
            "#,
        )
        .unwrap();

        assert_eq!(options.relays, vec!["wss://relay.example.com"]);
        assert!(options.skip_verification);
        assert_eq!(options.lookup_timeout, Duration::from_millis(2500));
        assert_eq!(options.relay.min_reconnect_delay, Duration::from_millis(500));
        assert_eq!(options.relay.max_reconnect_delay, Some(Duration::from_secs(60)));
        // untouched keys keep defaults
        assert!(options.use_event_cache);
        assert_eq!(options.relay.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_from_toml_rejects_bad_types() {
        let err = PoolOptions::from_toml_str("use_event_cache = \"yes\"").unwrap_err();
        assert!(matches!(err, crate::error::ClientError::Config(_)));
    }

    #[test]
    fn test_toml_roundtrip_of_defaults() {
        let options = PoolOptions::default();
        let text = toml::to_string(&options).unwrap();
        assert_eq!(PoolOptions::from_toml_str(&text).unwrap(), options);
    }
}
