//! The tracking core seam.
//!
//! [`TrackingCore`] is the base analytics capability: event capture, identity, sessions and
//! feature flags on top of persisted properties. The session-aware [`Client`](crate::Client)
//! wraps a core and adds initialization ordering, app properties and session replay. The crate
//! ships [`LocalCore`](crate::LocalCore); a different core can be plugged in with
//! [`ClientConfig::tracking_core`](crate::ClientConfig::tracking_core).
use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::From;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{storage::Storage, Result};

/// Event properties.
pub type Properties = serde_json::Map<String, Value>;

/// Value of a feature flag: a boolean for simple flags, a variant key for multivariate flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, From)]
#[serde(untagged)]
pub enum FeatureFlagValue {
    /// A boolean flag.
    Boolean(bool),
    /// A multivariate flag.
    Variant(String),
}

impl From<&str> for FeatureFlagValue {
    fn from(value: &str) -> Self {
        Self::Variant(value.to_owned())
    }
}

impl FeatureFlagValue {
    /// Whether the flag counts as enabled. Any variant counts as enabled.
    pub fn is_enabled(&self) -> bool {
        match self {
            FeatureFlagValue::Boolean(value) => *value,
            FeatureFlagValue::Variant(_) => true,
        }
    }

    /// The variant key, if this is a multivariate flag.
    pub fn as_variant(&self) -> Option<&str> {
        match self {
            FeatureFlagValue::Variant(variant) => Some(variant),
            FeatureFlagValue::Boolean(_) => None,
        }
    }
}

/// Per-call capture options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureOptions {
    /// Event uuid. Generated when absent.
    pub uuid: Option<Uuid>,
    /// Event timestamp. Defaults to now.
    pub timestamp: Option<DateTime<Utc>>,
    /// Ask the server not to resolve geoip for this event.
    pub disable_geoip: Option<bool>,
}

/// Called with the resolved session id whenever a core looks it up, including while enriching
/// captured events. The client uses it to keep native session replay on the same session.
pub type SessionListener = Arc<dyn Fn(&str) + Send + Sync>;

/// Everything a [`CoreFactory`] gets to build a core.
#[derive(Clone)]
pub struct CoreContext {
    /// Project API key.
    pub api_key: String,
    /// API host.
    pub host: String,
    /// Debug mode.
    pub debug: bool,
    /// Number of queued events that triggers a flush.
    pub flush_at: usize,
    /// Whether the client is globally disabled.
    pub disabled: bool,
    /// Idle time after which a session expires.
    pub session_expiration: Duration,
    /// Whether reading a flag captures `$feature_flag_called`.
    pub send_feature_flag_event: bool,
    /// Persisted properties shared with the client.
    pub storage: Arc<Storage>,
    /// Must be called by [`TrackingCore::session_id`] with every id it returns, once no locks
    /// are held.
    pub on_session_id: Option<SessionListener>,
}

/// Builds the [`TrackingCore`] for a client.
pub trait CoreFactory: Send + Sync {
    /// Create a core for `context`.
    fn create(&self, context: CoreContext) -> Arc<dyn TrackingCore>;
}

impl<F> CoreFactory for F
where
    F: Fn(CoreContext) -> Arc<dyn TrackingCore> + Send + Sync,
{
    fn create(&self, context: CoreContext) -> Arc<dyn TrackingCore> {
        self(context)
    }
}

/// The base analytics capability.
///
/// Synchronous methods must not block; anything that talks to the network is either `async` or
/// spawned in the background by the implementation.
#[async_trait]
pub trait TrackingCore: Send + Sync {
    /// Capture an event.
    fn capture(&self, event: &str, properties: Properties, options: CaptureOptions);

    /// Capture an autocaptured interaction.
    fn autocapture(&self, event_type: &str, elements: Vec<Value>, properties: Properties) {
        let mut properties = properties;
        properties.insert("$event_type".to_owned(), Value::from(event_type));
        properties.insert("$elements".to_owned(), Value::Array(elements));
        self.capture("$autocapture", properties, CaptureOptions::default());
    }

    /// Associate events with a known user. `None` re-identifies the current distinct id.
    fn identify(&self, distinct_id: Option<&str>, properties: Properties, options: CaptureOptions);

    /// Link `alias` to the current distinct id.
    fn alias(&self, alias: &str);

    /// Associate events with a group.
    fn group(&self, group_type: &str, group_key: &str, properties: Properties);

    /// Register super properties sent with every event.
    fn register(&self, properties: Properties);

    /// Remove a super property.
    fn unregister(&self, property: &str);

    /// Register properties sent with every event of the current session.
    fn register_for_session(&self, properties: Properties);

    /// Forget the user: new anonymous id, no super properties, no flags.
    fn reset(&self);

    /// Deliver queued events.
    async fn flush(&self) -> Result<()>;

    /// Opt back in to capturing.
    fn opt_in(&self);

    /// Opt out of capturing.
    fn opt_out(&self);

    /// Whether the client is disabled or the user opted out.
    fn is_disabled(&self) -> bool;

    /// Properties merged into every event.
    fn set_common_properties(&self, properties: Properties);

    /// Current distinct id.
    fn distinct_id(&self) -> String;

    /// Current anonymous id.
    fn anonymous_id(&self) -> String;

    /// Current session id, starting or rolling the session as needed. Empty means no session.
    fn session_id(&self) -> String;

    /// Drop the current session.
    fn reset_session_id(&self);

    /// Value of a flag, if known.
    fn feature_flag(&self, key: &str) -> Option<FeatureFlagValue>;

    /// Payload of a flag, if known.
    fn feature_flag_payload(&self, key: &str) -> Option<Value>;

    /// All flags currently cached.
    fn known_feature_flags(&self) -> Option<HashMap<String, FeatureFlagValue>>;

    /// Whether a flag is enabled. `None` if the flag is unknown.
    fn is_feature_enabled(&self, key: &str) -> Option<bool> {
        self.feature_flag(key).map(|value| value.is_enabled())
    }

    /// Seed ids and flags before anything has been loaded.
    fn bootstrap(&self, bootstrap: &crate::Bootstrap);

    /// Reload flags in the background.
    fn reload_feature_flags(&self);

    /// Reload flags and return them. `None` if loading failed.
    async fn reload_feature_flags_async(&self) -> Option<HashMap<String, FeatureFlagValue>>;

    /// Reload remote config: flags, session replay decision config and surveys.
    async fn reload_remote_config(&self) -> Result<()>;

    /// Person properties used for flag evaluation.
    fn set_person_properties_for_flags(&self, properties: HashMap<String, String>);

    /// Clear person properties used for flag evaluation.
    fn reset_person_properties_for_flags(&self);

    /// Group properties used for flag evaluation, keyed by group type.
    fn set_group_properties_for_flags(&self, properties: HashMap<String, HashMap<String, String>>);

    /// Clear group properties used for flag evaluation.
    fn reset_group_properties_for_flags(&self);

    /// Fetch surveys without touching persisted state.
    async fn surveys_stateless(&self) -> Result<Vec<Value>>;
}

#[cfg(test)]
mod tests {
    use super::FeatureFlagValue;

    #[test]
    fn variants_count_as_enabled() {
        assert!(FeatureFlagValue::from("control").is_enabled());
        assert!(FeatureFlagValue::from(true).is_enabled());
        assert!(!FeatureFlagValue::from(false).is_enabled());
    }

    #[test]
    fn deserializes_untagged() {
        let flags: std::collections::HashMap<String, FeatureFlagValue> =
            serde_json::from_str(r#"{"a": true, "b": "variant-a"}"#).unwrap();
        assert_eq!(flags["a"], FeatureFlagValue::Boolean(true));
        assert_eq!(flags["b"], FeatureFlagValue::Variant("variant-a".to_owned()));
    }
}
