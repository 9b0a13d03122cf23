use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    app_properties::{AppProperties, DeviceInfoSource},
    autocapture::EventTarget,
    core::{CoreFactory, FeatureFlagValue},
    event_sink::EventSink,
    remote_config::RemoteConfigSource,
    replay::SessionReplayPlugin,
    storage::KeyValueStore,
    Client,
};

/// Where persisted properties live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Persistence {
    /// Keep everything in memory. Ids and sessions reset on restart.
    Memory,
    /// Persist through a [`KeyValueStore`] (a [`FileStore`](crate::FileStore) unless a custom
    /// storage is configured).
    #[default]
    File,
}

/// The platform the host application runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// iOS native bridge.
    Ios,
    /// Android native bridge.
    Android,
    /// Plain web, no native bridge.
    #[default]
    Web,
}

impl Platform {
    /// Whether the host runs inside a native bridge.
    pub fn is_native(&self) -> bool {
        matches!(self, Platform::Ios | Platform::Android)
    }
}

/// Session replay settings forwarded verbatim to the native replay SDK.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct SessionReplayConfig {
    pub mask_all_text_inputs: bool,
    pub mask_all_images: bool,
    pub mask_all_sandboxed_views: bool,
    pub capture_log: bool,
    pub capture_network_telemetry: bool,
    pub throttle_delay_ms: u64,
}

impl SessionReplayConfig {
    /// Default value for [`SessionReplayConfig::throttle_delay_ms`].
    pub const DEFAULT_THROTTLE_DELAY_MS: u64 = 1000;
}

impl Default for SessionReplayConfig {
    fn default() -> SessionReplayConfig {
        SessionReplayConfig {
            mask_all_text_inputs: true,
            mask_all_images: true,
            mask_all_sandboxed_views: true,
            capture_log: true,
            capture_network_telemetry: true,
            throttle_delay_ms: SessionReplayConfig::DEFAULT_THROTTLE_DELAY_MS,
        }
    }
}

/// Overrides for the app properties attached to every event.
pub enum CustomAppProperties {
    /// Replace the resolved properties wholesale.
    Fixed(AppProperties),
    /// Transform the resolved properties.
    Transform(Box<dyn Fn(AppProperties) -> AppProperties + Send + Sync>),
}

/// Values to seed the client with before the first remote config arrives.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bootstrap {
    /// Distinct id to start with.
    pub distinct_id: Option<String>,
    /// Whether `distinct_id` is an identified user or just an anonymous id.
    pub is_identified_id: bool,
    /// Feature flag values to use until flags are loaded.
    pub feature_flags: HashMap<String, FeatureFlagValue>,
    /// Feature flag payloads to use until flags are loaded.
    pub feature_flag_payloads: HashMap<String, serde_json::Value>,
}

/// Configuration for [`Client`] and [`PostHog::setup`](crate::PostHog::setup).
pub struct ClientConfig {
    pub(crate) api_key: String,
    pub(crate) host: String,
    pub(crate) debug: bool,
    pub(crate) flush_at: usize,
    pub(crate) disabled: bool,
    pub(crate) persistence: Persistence,
    pub(crate) custom_storage: Option<Arc<dyn KeyValueStore>>,
    pub(crate) storage_dir: Option<PathBuf>,
    pub(crate) custom_app_properties: Option<CustomAppProperties>,
    pub(crate) capture_app_lifecycle_events: bool,
    pub(crate) enable_session_replay: bool,
    pub(crate) session_replay_config: SessionReplayConfig,
    pub(crate) enable_persist_session_id_across_restart: bool,
    pub(crate) disable_surveys: bool,
    pub(crate) disable_remote_config: bool,
    pub(crate) preload_feature_flags: bool,
    pub(crate) bootstrap: Option<Bootstrap>,
    pub(crate) platform: Platform,
    pub(crate) session_replay_plugin: Option<Arc<dyn SessionReplayPlugin>>,
    pub(crate) device_info: Option<Arc<dyn DeviceInfoSource>>,
    pub(crate) event_sink: Option<Arc<dyn EventSink>>,
    pub(crate) remote_config: Option<Arc<dyn RemoteConfigSource>>,
    pub(crate) tracking_core: Option<Box<dyn CoreFactory>>,
    pub(crate) document: Option<Arc<dyn EventTarget>>,
    pub(crate) session_expiration: Duration,
    pub(crate) send_feature_flag_event: bool,
}

impl ClientConfig {
    /// Default host for API calls.
    pub const DEFAULT_HOST: &'static str = "https://us.i.posthog.com";

    /// Default number of queued events that triggers a flush.
    pub const DEFAULT_FLUSH_AT: usize = 20;

    /// Default idle time after which a session expires.
    pub const DEFAULT_SESSION_EXPIRATION: Duration = Duration::from_secs(30 * 60);

    /// Create a default configuration using the specified API key.
    ///
    /// Configure an [`event_sink`](ClientConfig::event_sink) to receive captured events; the
    /// default drops them.
    ///
    /// ```
    /// # use posthog_bridge::ClientConfig;
    /// ClientConfig::from_api_key("phc_abc");
    /// ```
    pub fn from_api_key(api_key: impl Into<String>) -> ClientConfig {
        ClientConfig {
            api_key: api_key.into(),
            host: ClientConfig::DEFAULT_HOST.to_owned(),
            debug: false,
            flush_at: ClientConfig::DEFAULT_FLUSH_AT,
            disabled: false,
            persistence: Persistence::default(),
            custom_storage: None,
            storage_dir: None,
            custom_app_properties: None,
            capture_app_lifecycle_events: false,
            enable_session_replay: false,
            session_replay_config: SessionReplayConfig::default(),
            enable_persist_session_id_across_restart: false,
            disable_surveys: false,
            disable_remote_config: false,
            preload_feature_flags: true,
            bootstrap: None,
            platform: Platform::default(),
            session_replay_plugin: None,
            device_info: None,
            event_sink: None,
            remote_config: None,
            tracking_core: None,
            document: None,
            session_expiration: ClientConfig::DEFAULT_SESSION_EXPIRATION,
            send_feature_flag_event: true,
        }
    }

    /// Override host for API calls.
    pub fn host(mut self, host: impl Into<String>) -> ClientConfig {
        self.host = host.into();
        self
    }

    /// Enable verbose logging and pass the debug flag to native SDKs.
    pub fn debug(mut self, debug: bool) -> ClientConfig {
        self.debug = debug;
        self
    }

    /// Number of queued events that triggers a flush.
    pub fn flush_at(mut self, flush_at: usize) -> ClientConfig {
        self.flush_at = flush_at.max(1);
        self
    }

    /// Disable the client entirely: nothing is captured and session replay never starts.
    pub fn disabled(mut self, disabled: bool) -> ClientConfig {
        self.disabled = disabled;
        self
    }

    /// Choose where persisted properties live.
    pub fn persistence(mut self, persistence: Persistence) -> ClientConfig {
        self.persistence = persistence;
        self
    }

    /// Use a custom key-value store for [`Persistence::File`].
    pub fn custom_storage(mut self, storage: impl KeyValueStore + 'static) -> ClientConfig {
        self.custom_storage = Some(Arc::new(storage));
        self
    }

    /// Directory for the default file store. Defaults to a directory under the system temp dir.
    pub fn storage_dir(mut self, dir: impl Into<PathBuf>) -> ClientConfig {
        self.storage_dir = Some(dir.into());
        self
    }

    /// Override the app properties attached to every event.
    ///
    /// ```
    /// # use posthog_bridge::{AppProperties, ClientConfig, CustomAppProperties};
    /// ClientConfig::from_api_key("phc_abc").custom_app_properties(CustomAppProperties::Transform(
    ///     Box::new(|mut properties: AppProperties| {
    ///         properties.app_name = Some("Example".to_owned());
    ///         properties
    ///     }),
    /// ));
    /// ```
    pub fn custom_app_properties(mut self, properties: CustomAppProperties) -> ClientConfig {
        self.custom_app_properties = Some(properties);
        self
    }

    /// Capture application installed/updated/opened events.
    pub fn capture_app_lifecycle_events(mut self, enabled: bool) -> ClientConfig {
        self.capture_app_lifecycle_events = enabled;
        self
    }

    /// Enable session replay.
    pub fn enable_session_replay(mut self, enabled: bool) -> ClientConfig {
        self.enable_session_replay = enabled;
        self
    }

    /// Session replay settings for the native replay SDK.
    pub fn session_replay_config(mut self, config: SessionReplayConfig) -> ClientConfig {
        self.session_replay_config = config;
        self
    }

    /// Keep the persisted session id across restarts instead of starting a fresh session.
    pub fn enable_persist_session_id_across_restart(mut self, enabled: bool) -> ClientConfig {
        self.enable_persist_session_id_across_restart = enabled;
        self
    }

    /// Never load surveys.
    pub fn disable_surveys(mut self, disabled: bool) -> ClientConfig {
        self.disable_surveys = disabled;
        self
    }

    /// Don't load remote config on startup.
    pub fn disable_remote_config(mut self, disabled: bool) -> ClientConfig {
        self.disable_remote_config = disabled;
        self
    }

    /// Load feature flags on startup when remote config is disabled. Defaults to `true`.
    pub fn preload_feature_flags(mut self, enabled: bool) -> ClientConfig {
        self.preload_feature_flags = enabled;
        self
    }

    /// Seed ids and flags before remote config arrives.
    pub fn bootstrap(mut self, bootstrap: Bootstrap) -> ClientConfig {
        self.bootstrap = Some(bootstrap);
        self
    }

    /// Platform the host runs on.
    pub fn platform(mut self, platform: Platform) -> ClientConfig {
        self.platform = platform;
        self
    }

    /// Native session replay capability of the host.
    pub fn session_replay_plugin(
        mut self,
        plugin: impl SessionReplayPlugin + 'static,
    ) -> ClientConfig {
        self.session_replay_plugin = Some(Arc::new(plugin));
        self
    }

    /// Source of device and app metadata.
    pub fn device_info(mut self, source: impl DeviceInfoSource + 'static) -> ClientConfig {
        self.device_info = Some(Arc::new(source));
        self
    }

    /// Deliver captured events to `sink`.
    ///
    /// The crate does not send events anywhere by itself. Without a sink (or a custom
    /// [`tracking_core`](ClientConfig::tracking_core)), captured events are dropped and a warning
    /// is logged when the client is created.
    ///
    /// ```
    /// # use posthog_bridge::{CapturedEvent, ClientConfig};
    /// ClientConfig::from_api_key("phc_abc").event_sink(|events: Vec<CapturedEvent>| {
    ///     println!("{:?}", events);
    /// });
    /// ```
    pub fn event_sink(mut self, sink: impl EventSink + 'static) -> ClientConfig {
        self.event_sink = Some(Arc::new(sink));
        self
    }

    /// Load flags, replay config and surveys from `source` instead of the HTTP API.
    pub fn remote_config(mut self, source: impl RemoteConfigSource + 'static) -> ClientConfig {
        self.remote_config = Some(Arc::new(source));
        self
    }

    /// Replace the built-in tracking core.
    pub fn tracking_core(mut self, factory: impl CoreFactory + 'static) -> ClientConfig {
        self.tracking_core = Some(Box::new(factory));
        self
    }

    /// Document that autocapture attaches its listeners to.
    pub fn document(mut self, document: Arc<dyn EventTarget>) -> ClientConfig {
        self.document = Some(document);
        self
    }

    /// Idle time after which a session expires.
    pub fn session_expiration(mut self, expiration: Duration) -> ClientConfig {
        self.session_expiration = expiration;
        self
    }

    /// Capture `$feature_flag_called` when a flag is read. Defaults to `true`.
    pub fn send_feature_flag_event(mut self, enabled: bool) -> ClientConfig {
        self.send_feature_flag_event = enabled;
        self
    }

    /// Create a new [`Client`] using this configuration.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn to_client(self) -> Client {
        Client::new(self)
    }
}
