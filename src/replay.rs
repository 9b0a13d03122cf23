//! Session replay activation.
//!
//! Replay runs in one of two modes. On a native platform with a [`SessionReplayPlugin`], the
//! native SDK records and this module only starts it, keeps its session id in sync and forwards
//! identity changes. Everywhere else the [`LinkedFlag`] policy from the server-provided replay
//! decision config decides whether recording would be active.
//!
//! Replay never affects event capture: every native failure is logged and swallowed.
use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{
    client::Inner,
    config::{Platform, SessionReplayConfig},
    core::FeatureFlagValue,
    storage::PersistedProperty,
    Error, Result, SDK_VERSION,
};

/// SDK options forwarded to the native replay SDK.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct SdkOptions {
    pub api_key: String,
    pub host: String,
    pub debug: bool,
    pub distinct_id: String,
    pub anonymous_id: String,
    pub sdk_version: String,
    pub flush_at: usize,
}

/// Arguments of [`SessionReplayPlugin::start_session_replay`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartReplayRequest {
    /// Session to record.
    pub session_id: String,
    /// Options to configure the native SDK with.
    pub sdk_options: SdkOptions,
    /// Replay settings from the client configuration.
    pub sdk_replay_config: SessionReplayConfig,
    /// Replay decision config from the server, `{}` if none is cached.
    pub decide_replay_config: Map<String, Value>,
}

/// Native session replay capability of the host.
///
/// Calls may fail; failures are logged and never surface through the client API.
#[async_trait]
pub trait SessionReplayPlugin: Send + Sync {
    /// Configure the native SDK and start recording.
    async fn start_session_replay(&self, request: StartReplayRequest) -> Result<()>;

    /// Continue recording under a new session id.
    async fn start_session_replay_session(&self, session_id: &str) -> Result<()>;

    /// Stop recording.
    async fn end_session_replay(&self) -> Result<()>;

    /// Whether the native SDK is already recording.
    async fn is_session_replay_enabled(&self) -> Result<bool>;

    /// Attach recordings to a user.
    async fn identify_session_replay(&self, distinct_id: &str, anonymous_id: &str) -> Result<()>;
}

/// Policy tying replay recording to a feature flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkedFlag {
    /// Record while the flag is enabled. Any variant counts as enabled.
    Flag(String),
    /// Record while the flag has exactly `variant`. Missing parts disable recording.
    Variant {
        /// Flag key.
        flag: Option<String>,
        /// Required variant.
        variant: Option<String>,
    },
}

impl LinkedFlag {
    /// Read the policy from a replay decision config. `None` means no policy.
    pub fn from_replay_config(config: &Map<String, Value>) -> Option<LinkedFlag> {
        match config.get("linkedFlag")? {
            Value::String(flag) => Some(LinkedFlag::Flag(flag.clone())),
            Value::Object(object) => {
                let field = |name| {
                    object
                        .get(name)
                        .and_then(Value::as_str)
                        .filter(|value| !value.is_empty())
                        .map(str::to_owned)
                };
                Some(LinkedFlag::Variant {
                    flag: field("flag"),
                    variant: field("variant"),
                })
            }
            _ => None,
        }
    }

    /// Whether recording is active given the cached `flags`.
    pub fn is_active(&self, flags: &HashMap<String, FeatureFlagValue>) -> bool {
        match self {
            LinkedFlag::Flag(flag) => {
                let value = flags.get(flag);
                log::debug!(target: "posthog", flag = flag.as_str(); "replay linked flag value: {:?}", value);
                matches!(
                    value,
                    Some(FeatureFlagValue::Boolean(true)) | Some(FeatureFlagValue::Variant(_))
                )
            }
            LinkedFlag::Variant {
                flag: Some(flag),
                variant: Some(variant),
            } => {
                let value = flags.get(flag);
                log::debug!(target: "posthog", flag = flag.as_str(), variant = variant.as_str(); "replay linked flag value: {:?}", value);
                value.and_then(FeatureFlagValue::as_variant) == Some(variant.as_str())
            }
            LinkedFlag::Variant { flag, variant } => {
                log::debug!(target: "posthog", "replay linked flag {:?} variant {:?} does not exist or is quota limited", flag, variant);
                false
            }
        }
    }
}

/// Whether web recording is active: no policy means active.
pub(crate) fn recording_active(
    policy: Option<&LinkedFlag>,
    flags: &HashMap<String, FeatureFlagValue>,
) -> bool {
    match policy {
        Some(policy) => policy.is_active(flags),
        None => {
            log::debug!(target: "posthog", "replay has no cached linked flag");
            true
        }
    }
}

/// Wraps the native plugin: only talks to it on native platforms and rejects session ids the
/// native SDKs can't take.
pub(crate) struct ReplayBridge {
    plugin: Option<Arc<dyn SessionReplayPlugin>>,
    platform: Platform,
}

fn validate_session_id(session_id: &str) -> Result<()> {
    if session_id.is_empty() || Uuid::parse_str(session_id).is_err() {
        log::warn!(target: "posthog", session_id; "invalid session id, ignoring native replay call");
        return Err(Error::InvalidSessionId(session_id.to_owned()));
    }
    Ok(())
}

impl ReplayBridge {
    pub(crate) fn new(plugin: Option<Arc<dyn SessionReplayPlugin>>, platform: Platform) -> Self {
        ReplayBridge { plugin, platform }
    }

    fn plugin(&self) -> Option<&dyn SessionReplayPlugin> {
        if self.platform.is_native() {
            self.plugin.as_deref()
        } else {
            None
        }
    }

    /// Whether native replay calls go anywhere.
    pub(crate) fn is_native(&self) -> bool {
        self.plugin().is_some()
    }

    pub(crate) async fn start(&self, request: StartReplayRequest) -> Result<()> {
        let plugin = self.plugin().ok_or(Error::Unavailable("session replay plugin"))?;
        validate_session_id(&request.session_id)?;
        plugin.start_session_replay(request).await
    }

    pub(crate) async fn is_enabled(&self) -> Result<bool> {
        let plugin = self.plugin().ok_or(Error::Unavailable("session replay plugin"))?;
        plugin.is_session_replay_enabled().await
    }

    /// End the native session and continue under `session_id`.
    pub(crate) async fn rotate(&self, session_id: &str) -> Result<()> {
        let Some(plugin) = self.plugin() else {
            return Ok(());
        };
        validate_session_id(session_id)?;
        plugin.end_session_replay().await?;
        plugin.start_session_replay_session(session_id).await?;
        log::info!(target: "posthog", session_id; "native session id rotated");
        Ok(())
    }

    pub(crate) async fn end(&self) {
        let Some(plugin) = self.plugin() else {
            return;
        };
        match plugin.end_session_replay().await {
            Ok(()) => log::info!(target: "posthog", "session replay ended"),
            Err(err) => log::warn!(target: "posthog", "session replay failed to end: {}", err),
        }
    }

    pub(crate) async fn identify(&self, distinct_id: &str, anonymous_id: &str) {
        let Some(plugin) = self.plugin() else {
            return;
        };
        if let Err(err) = plugin.identify_session_replay(distinct_id, anonymous_id).await {
            log::warn!(target: "posthog", "failed to identify session replay: {}", err);
        }
    }
}

impl Inner {
    /// Start replay once initialization is done.
    pub(crate) async fn start_session_replay(&self) {
        self.session().replay_enabled = self.settings.enable_session_replay;

        if !self.is_replay_enabled() {
            log::debug!(target: "posthog", "session replay is not enabled");
            return;
        }

        if self.replay.is_native() {
            let session_id = self.session_id();
            if session_id.is_empty() {
                log::warn!(target: "posthog", "session replay enabled but no session id found");
                return;
            }

            match self.start_or_rotate_native(&session_id).await {
                Ok(()) => {
                    self.session().current_session_id = session_id;
                    return;
                }
                Err(err) => {
                    log::warn!(target: "posthog", "session replay failed to start: {}", err);
                }
            }
        } else if self.settings.platform.is_native() {
            log::warn!(target: "posthog", "session replay enabled but native plugin not available");
        }

        let decide_config = self.decide_replay_config();
        let flags = self.core.known_feature_flags().unwrap_or_default();
        let policy = LinkedFlag::from_replay_config(&decide_config);
        let active = recording_active(policy.as_ref(), &flags);
        self.session().recording_active = active;

        if !active {
            log::info!(target: "posthog", "session replay disabled by linked flag");
            return;
        }

        let session_id = self.session_id();
        if session_id.is_empty() {
            log::warn!(target: "posthog", "session replay enabled but no session id found");
            return;
        }
        log::info!(target: "posthog", session_id = session_id.as_str(); "session replay would start, no web recorder is wired");
        self.session().current_session_id = session_id;
    }

    async fn start_or_rotate_native(&self, session_id: &str) -> Result<()> {
        if self.replay.is_enabled().await? {
            // Already recording, possibly under another session.
            self.session().current_session_id = session_id.to_owned();
            if let Err(err) = self.replay.rotate(session_id).await {
                log::warn!(target: "posthog", "failed to rotate native session id: {}", err);
            }
            log::debug!(target: "posthog", session_id; "session replay already started");
            Ok(())
        } else {
            self.start_native_session_replay(session_id).await?;
            log::info!(target: "posthog", session_id; "session replay started");
            Ok(())
        }
    }

    /// Configure and start the native replay SDK for `session_id`.
    pub(crate) async fn start_native_session_replay(&self, session_id: &str) -> Result<()> {
        let request = StartReplayRequest {
            session_id: session_id.to_owned(),
            sdk_options: SdkOptions {
                api_key: self.settings.api_key.clone(),
                host: self.settings.host.clone(),
                debug: self.settings.debug,
                distinct_id: self.core.distinct_id(),
                anonymous_id: self.core.anonymous_id(),
                sdk_version: SDK_VERSION.to_owned(),
                flush_at: self.settings.flush_at,
            },
            sdk_replay_config: self.settings.session_replay_config.clone(),
            decide_replay_config: self.decide_replay_config(),
        };
        log::debug!(target: "posthog", request:serde; "starting native session replay");

        self.replay.start(request).await.map_err(|err| {
            log::warn!(target: "posthog", "native session replay failed to start: {}", err);
            err
        })?;
        self.session().current_session_id = session_id.to_owned();
        Ok(())
    }

    fn decide_replay_config(&self) -> Map<String, Value> {
        match self.storage.get_item(PersistedProperty::SessionReplay) {
            Some(Value::Object(config)) => config,
            _ => Map::new(),
        }
    }
}
