use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex, RwLock, Weak},
};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use serde_json::Value;

use crate::{
    app_properties::{AppProperties, DeviceInfoSource, HostDeviceInfo},
    autocapture::{self, AutocaptureHandle, AutocaptureOptions, EventTarget},
    config::{Bootstrap, CustomAppProperties, Persistence, Platform, SessionReplayConfig},
    core::{
        CaptureOptions, CoreContext, FeatureFlagValue, Properties, SessionListener, TrackingCore,
    },
    event_sink::{EventSink, NoopEventSink},
    init::{InitState, InitTracker},
    local_core::LocalCore,
    remote_config::{HttpRemoteConfig, RemoteConfigSource},
    replay::ReplayBridge,
    session::SessionState,
    storage::{FileStore, KeyValueStore, PersistedProperty, Storage},
    tasks::BackgroundTasks,
    ClientConfig, Result,
};

/// Options the client keeps after construction.
pub(crate) struct Settings {
    pub(crate) api_key: String,
    pub(crate) host: String,
    pub(crate) debug: bool,
    pub(crate) flush_at: usize,
    pub(crate) persistence: Persistence,
    pub(crate) platform: Platform,
    pub(crate) capture_app_lifecycle_events: bool,
    pub(crate) enable_session_replay: bool,
    pub(crate) session_replay_config: SessionReplayConfig,
    pub(crate) enable_persist_session_id_across_restart: bool,
    pub(crate) disable_surveys: bool,
    pub(crate) disable_remote_config: bool,
    pub(crate) preload_feature_flags: bool,
    pub(crate) bootstrap: Option<Bootstrap>,
}

pub(crate) struct Inner {
    pub(crate) settings: Settings,
    pub(crate) core: Arc<dyn TrackingCore>,
    pub(crate) storage: Arc<Storage>,
    pub(crate) replay: ReplayBridge,
    pub(crate) device_info: Arc<dyn DeviceInfoSource>,
    pub(crate) custom_app_properties: Option<CustomAppProperties>,
    pub(crate) app_properties: RwLock<AppProperties>,
    pub(crate) session: Mutex<SessionState>,
    pub(crate) init: InitTracker,
    pub(crate) tasks: BackgroundTasks,
    document: Option<Arc<dyn EventTarget>>,
    autocapture: Mutex<Option<AutocaptureHandle>>,
    this: Weak<Inner>,
}

impl Inner {
    /// Weak handle for spawned work, so pending tasks don't keep a dropped client alive.
    pub(crate) fn handle(&self) -> Weak<Inner> {
        self.this.clone()
    }
}

fn default_storage_dir() -> PathBuf {
    std::env::temp_dir().join("posthog-bridge")
}

/// A session-aware analytics client.
///
/// The client starts initializing as soon as it is created; [`Client::ready`] resolves once
/// persisted state is loaded, app properties are resolved, remote config is applied and session
/// replay is bootstrapped. Every operation waits for that first. Calls made from separate tasks
/// before then are not ordered among themselves; use [`PostHog`](crate::PostHog) to have them run
/// in the order they were made.
///
/// Cloning is cheap and clones share all state.
///
/// # Examples
/// ```no_run
/// # use posthog_bridge::{ClientConfig, Properties};
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let client = ClientConfig::from_api_key("phc_abc").to_client();
/// client.capture("signed_up", Properties::new()).await;
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
    ready: Shared<BoxFuture<'static, ()>>,
}

impl Client {
    /// Create a client and start initializing it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ClientConfig) -> Client {
        let tasks = BackgroundTasks::new();

        let storage = Arc::new(match config.persistence {
            Persistence::Memory => Storage::memory(),
            Persistence::File => {
                let store: Arc<dyn KeyValueStore> = match config.custom_storage {
                    Some(store) => store,
                    None => Arc::new(FileStore::new(
                        config.storage_dir.unwrap_or_else(default_storage_dir),
                    )),
                };
                Storage::durable(store, tasks.clone())
            }
        });

        let settings = Settings {
            api_key: config.api_key,
            host: config.host,
            debug: config.debug,
            flush_at: config.flush_at,
            persistence: config.persistence,
            platform: config.platform,
            capture_app_lifecycle_events: config.capture_app_lifecycle_events,
            enable_session_replay: config.enable_session_replay,
            session_replay_config: config.session_replay_config,
            enable_persist_session_id_across_restart: config
                .enable_persist_session_id_across_restart,
            disable_surveys: config.disable_surveys,
            disable_remote_config: config.disable_remote_config,
            preload_feature_flags: config.preload_feature_flags,
            bootstrap: config.bootstrap,
        };

        let inner = Arc::new_cyclic(|this: &Weak<Inner>| {
            let observer = this.clone();
            let on_session_id: SessionListener = Arc::new(move |session_id: &str| {
                if let Some(inner) = observer.upgrade() {
                    inner.observe_session_id(session_id);
                }
            });
            let context = CoreContext {
                api_key: settings.api_key.clone(),
                host: settings.host.clone(),
                debug: settings.debug,
                flush_at: settings.flush_at,
                disabled: config.disabled,
                session_expiration: config.session_expiration,
                send_feature_flag_event: config.send_feature_flag_event,
                storage: storage.clone(),
                on_session_id: Some(on_session_id),
            };

            let core: Arc<dyn TrackingCore> = match config.tracking_core {
                Some(factory) => factory.create(context),
                None => {
                    let sink: Arc<dyn EventSink> = match config.event_sink {
                        Some(sink) => sink,
                        None => {
                            log::warn!(
                                target: "posthog",
                                "no event sink configured, captured events will be dropped"
                            );
                            Arc::new(NoopEventSink)
                        }
                    };
                    let remote: Arc<dyn RemoteConfigSource> = match config.remote_config {
                        Some(remote) => remote,
                        None => Arc::new(HttpRemoteConfig::new(&settings.host, &settings.api_key)),
                    };
                    LocalCore::with_tasks(context, sink, remote, tasks.clone())
                }
            };

            Inner {
                replay: ReplayBridge::new(config.session_replay_plugin, settings.platform),
                settings,
                core,
                storage,
                device_info: config
                    .device_info
                    .unwrap_or_else(|| Arc::new(HostDeviceInfo::new())),
                custom_app_properties: config.custom_app_properties,
                app_properties: RwLock::new(AppProperties::default()),
                session: Mutex::new(SessionState::default()),
                init: InitTracker::default(),
                tasks: tasks.clone(),
                document: config.document,
                autocapture: Mutex::new(None),
                this: this.clone(),
            }
        });

        let init = {
            let inner = inner.clone();
            async move { inner.init().await }.boxed()
        };
        let ready = init.shared();
        // Start right away instead of waiting for the first `ready()`.
        tasks.spawn(ready.clone());

        Client { inner, ready }
    }

    /// Resolves once initialization has finished.
    ///
    /// Every other operation waits for this first, so calls made early never act on state that
    /// hasn't been loaded yet.
    pub async fn ready(&self) {
        self.ready.clone().await
    }

    /// Whether initialization has finished.
    pub fn is_ready(&self) -> bool {
        self.inner.init.state() == InitState::Ready
    }

    /// Wait for all background work: initialization, native replay calls, storage writes, flag
    /// reloads.
    pub async fn settle(&self) {
        self.inner.tasks.settle().await
    }

    /// Persisted properties. Reads before [`Client::ready`] may not reflect durable state yet.
    pub fn storage(&self) -> &Storage {
        &self.inner.storage
    }

    /// App properties attached to every event.
    pub async fn app_properties(&self) -> AppProperties {
        self.ready().await;
        self.inner
            .app_properties
            .read()
            .expect("thread holding app properties lock should not panic")
            .clone()
    }

    /// Capture an event.
    pub async fn capture(&self, event: &str, properties: Properties) {
        self.capture_with_options(event, properties, CaptureOptions::default())
            .await
    }

    /// Capture an event with per-call options.
    pub async fn capture_with_options(
        &self,
        event: &str,
        properties: Properties,
        options: CaptureOptions,
    ) {
        self.ready().await;
        self.inner.core.capture(event, properties, options)
    }

    /// Capture a screen view and remember the screen name for the session.
    pub async fn screen(&self, name: &str, properties: Properties, options: CaptureOptions) {
        self.ready().await;
        let mut session_properties = Properties::new();
        session_properties.insert("$screen_name".to_owned(), Value::from(name));
        self.inner.core.register_for_session(session_properties);

        let mut properties = properties;
        properties.insert("$screen_name".to_owned(), Value::from(name));
        self.inner.core.capture("$screen", properties, options)
    }

    /// Associate events with a known user. `None` re-identifies the current distinct id.
    ///
    /// With session replay running natively, recordings are attached to the user as well.
    pub async fn identify(
        &self,
        distinct_id: Option<&str>,
        properties: Properties,
        options: CaptureOptions,
    ) {
        self.ready().await;
        self.inner.identify(distinct_id, properties, options)
    }

    /// Link `alias` to the current distinct id.
    pub async fn alias(&self, alias: &str) {
        self.ready().await;
        self.inner.core.alias(alias)
    }

    /// Associate events with a group.
    pub async fn group(&self, group_type: &str, group_key: &str, properties: Properties) {
        self.ready().await;
        self.inner.core.group(group_type, group_key, properties)
    }

    /// Register super properties.
    pub async fn register(&self, properties: Properties) {
        self.ready().await;
        self.inner.core.register(properties)
    }

    /// Remove a super property.
    pub async fn unregister(&self, property: &str) {
        self.ready().await;
        self.inner.core.unregister(property)
    }

    /// Forget the current user.
    pub async fn reset(&self) {
        self.ready().await;
        self.inner.core.reset()
    }

    /// Deliver queued events.
    pub async fn flush(&self) -> Result<()> {
        self.ready().await;
        self.inner.core.flush().await
    }

    /// Opt in to capturing.
    pub async fn opt_in(&self) {
        self.ready().await;
        self.inner.core.opt_in()
    }

    /// Opt out of capturing.
    pub async fn opt_out(&self) {
        self.ready().await;
        self.inner.core.opt_out()
    }

    /// Whether a flag is enabled. `None` if the flag is unknown.
    pub async fn is_feature_enabled(&self, key: &str) -> Option<bool> {
        self.ready().await;
        self.inner.core.is_feature_enabled(key)
    }

    /// Value of a flag.
    pub async fn feature_flag(&self, key: &str) -> Option<FeatureFlagValue> {
        self.ready().await;
        self.inner.core.feature_flag(key)
    }

    /// Payload of a flag.
    pub async fn feature_flag_payload(&self, key: &str) -> Option<Value> {
        self.ready().await;
        self.inner.core.feature_flag_payload(key)
    }

    /// Reload flags in the background.
    pub async fn reload_feature_flags(&self) {
        self.ready().await;
        self.inner.core.reload_feature_flags()
    }

    /// Reload flags and return them. `None` if loading failed.
    pub async fn reload_feature_flags_async(&self) -> Option<HashMap<String, FeatureFlagValue>> {
        self.ready().await;
        self.inner.core.reload_feature_flags_async().await
    }

    /// Person properties used for flag evaluation.
    pub async fn set_person_properties_for_flags(&self, properties: HashMap<String, String>) {
        self.ready().await;
        self.inner.core.set_person_properties_for_flags(properties)
    }

    /// Clear person properties used for flag evaluation.
    pub async fn reset_person_properties_for_flags(&self) {
        self.ready().await;
        self.inner.core.reset_person_properties_for_flags()
    }

    /// Group properties used for flag evaluation, keyed by group type.
    pub async fn set_group_properties_for_flags(
        &self,
        properties: HashMap<String, HashMap<String, String>>,
    ) {
        self.ready().await;
        self.inner.core.set_group_properties_for_flags(properties)
    }

    /// Clear group properties used for flag evaluation.
    pub async fn reset_group_properties_for_flags(&self) {
        self.ready().await;
        self.inner.core.reset_group_properties_for_flags()
    }

    /// Survey definitions.
    ///
    /// Served from remote config when it's enabled. With remote config disabled, surveys are
    /// fetched on demand and cached.
    pub async fn surveys(&self) -> Vec<Value> {
        self.ready().await;
        let storage = &self.inner.storage;

        if self.inner.settings.disable_surveys {
            log::debug!(target: "posthog", "loading surveys is disabled");
            storage.remove_item(PersistedProperty::Surveys);
            return Vec::new();
        }

        if let Some(surveys) = storage
            .get_as::<Vec<Value>>(PersistedProperty::Surveys)
            .filter(|surveys| !surveys.is_empty())
        {
            return surveys;
        }

        if self.inner.settings.disable_remote_config {
            match self.inner.core.surveys_stateless().await {
                Ok(surveys) if !surveys.is_empty() => {
                    storage.set_item(
                        PersistedProperty::Surveys,
                        Value::Array(surveys.clone()),
                    );
                    return surveys;
                }
                Ok(_) => {}
                Err(err) => log::warn!(target: "posthog", "failed to fetch surveys: {}", err),
            }
        }

        Vec::new()
    }

    /// Current distinct id.
    pub async fn distinct_id(&self) -> String {
        self.ready().await;
        self.inner.core.distinct_id()
    }

    /// Current anonymous id.
    pub async fn anonymous_id(&self) -> String {
        self.ready().await;
        self.inner.core.anonymous_id()
    }

    /// Current session id. A new id is propagated to native session replay in the background.
    pub async fn session_id(&self) -> String {
        self.ready().await;
        self.inner.session_id()
    }

    /// Drop the current session and end native session replay.
    pub async fn reset_session_id(&self) {
        self.ready().await;
        self.inner.reset_session_id()
    }

    /// Rotate the native replay session to `session_id`.
    pub async fn reset_native_session_id(&self, session_id: &str) {
        self.ready().await;
        self.inner.reset_native_session_id(session_id).await
    }

    /// Whether the linked flag policy allows recording. Only meaningful without a native
    /// replay plugin.
    pub async fn is_session_recording_active(&self) -> bool {
        self.ready().await;
        self.inner.session().recording_active
    }

    /// Start autocapture on the configured document. Does nothing on native platforms.
    pub async fn enable_autocapture(&self, options: AutocaptureOptions) {
        self.ready().await;
        if self.inner.settings.platform.is_native() {
            log::debug!(target: "posthog", "autocapture is only available on web");
            return;
        }

        let mut handle = self
            .inner
            .autocapture
            .lock()
            .expect("thread holding autocapture lock should not panic");
        if handle.is_some() {
            log::warn!(target: "posthog", "autocapture is already enabled");
            return;
        }
        let Some(document) = self.inner.document.clone() else {
            log::warn!(target: "posthog", "autocapture needs a document, none is configured");
            return;
        };

        *handle = Some(autocapture::attach(
            document,
            Arc::downgrade(&self.inner.core),
            options,
        ));
        log::info!(target: "posthog", "autocapture enabled");
    }

    /// Stop autocapture.
    pub async fn disable_autocapture(&self) {
        self.ready().await;
        let handle = self
            .inner
            .autocapture
            .lock()
            .expect("thread holding autocapture lock should not panic")
            .take();
        if let Some(handle) = handle {
            handle.detach();
            log::info!(target: "posthog", "autocapture disabled");
        }
    }

    /// Host app moved to the foreground (`true`) or background (`false`).
    ///
    /// Captured when lifecycle events are enabled on native platforms.
    pub async fn app_state_changed(&self, active: bool) {
        self.ready().await;
        self.inner.app_state_changed(active)
    }

    /// Host app was opened through a deep link.
    pub async fn deep_link_opened(&self, url: &str) {
        self.ready().await;
        self.inner.deep_link_opened(url)
    }

    /// Deliver queued events before shutting down.
    pub async fn close(&self) -> Result<()> {
        self.flush().await
    }

    /// Stop autocapture, end the session and deliver queued events.
    pub async fn destroy(&self) -> Result<()> {
        self.disable_autocapture().await;
        self.reset_session_id().await;
        self.flush().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use crate::{
        config::{ClientConfig, Persistence, Platform, SessionReplayConfig},
        core::CaptureOptions,
        remote_config::FlagsResponse,
        storage::{KeyValueStore, PersistedProperty},
        test_support::{
            props, set_active_session, CollectingSink, MemoryKeyValueStore, PluginCall,
            RecordingPlugin, ScriptedRemoteConfig, StaticDeviceInfo,
        },
        AppProperties, CustomAppProperties, Document, Properties, STORAGE_KEY,
    };

    const SESSION_A: &str = "0190a3a4-8d1c-7cc2-b4a6-5f3a2e1d0c9b";
    const SESSION_B: &str = "0190a3a4-8d1c-7cc2-b4a6-5f3a2e1d0c9c";

    fn base_config(remote: &ScriptedRemoteConfig, sink: &CollectingSink) -> ClientConfig {
        ClientConfig::from_api_key("phc_abc")
            .persistence(Persistence::Memory)
            .remote_config(remote.clone())
            .event_sink(sink.clone())
            .device_info(StaticDeviceInfo::new("1.0.0", "1"))
    }

    fn native_replay_config(
        remote: &ScriptedRemoteConfig,
        sink: &CollectingSink,
        plugin: &RecordingPlugin,
    ) -> ClientConfig {
        base_config(remote, sink)
            .platform(Platform::Ios)
            .enable_session_replay(true)
            .session_replay_plugin(plugin.clone())
    }

    #[tokio::test]
    async fn starts_native_replay_once_with_configured_options() {
        let _ = env_logger::builder().is_test(true).try_init();

        let remote = ScriptedRemoteConfig::default();
        remote.respond_with(FlagsResponse {
            session_recording: Some(props(json!({"endpoint": "/s/"}))),
            ..FlagsResponse::default()
        });
        let plugin = RecordingPlugin::new();
        let client = native_replay_config(&remote, &CollectingSink::default(), &plugin)
            .session_replay_config(SessionReplayConfig {
                throttle_delay_ms: 500,
                ..SessionReplayConfig::default()
            })
            .to_client();

        client.ready().await;
        client.settle().await;

        let starts = plugin.starts();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].sdk_replay_config.throttle_delay_ms, 500);
        assert_eq!(starts[0].sdk_options.api_key, "phc_abc");
        assert_eq!(starts[0].session_id, client.session_id().await);
        assert_eq!(starts[0].decide_replay_config, props(json!({"endpoint": "/s/"})));
        assert!(plugin.session_starts().is_empty());
    }

    #[tokio::test]
    async fn already_running_native_replay_is_rotated_instead_of_started() {
        let plugin = RecordingPlugin::new().already_enabled();
        let client = native_replay_config(
            &ScriptedRemoteConfig::default(),
            &CollectingSink::default(),
            &plugin,
        )
        .to_client();
        client.ready().await;

        assert!(plugin.starts().is_empty());
        assert_eq!(plugin.ends(), 1);
        assert_eq!(plugin.session_starts(), vec![client.session_id().await]);
    }

    #[tokio::test]
    async fn unchanged_session_id_does_not_rotate() {
        let plugin = RecordingPlugin::new();
        let client = native_replay_config(
            &ScriptedRemoteConfig::default(),
            &CollectingSink::default(),
            &plugin,
        )
        .to_client();
        client.ready().await;

        let first = client.session_id().await;
        let second = client.session_id().await;
        client.settle().await;

        assert_eq!(first, second);
        assert!(plugin.session_starts().is_empty());
        assert_eq!(plugin.ends(), 0);
    }

    #[tokio::test]
    async fn changed_session_id_rotates_exactly_once_even_if_native_fails() {
        let _ = env_logger::builder().is_test(true).try_init();

        let plugin = RecordingPlugin::new().failing_rotation();
        let client = native_replay_config(
            &ScriptedRemoteConfig::default(),
            &CollectingSink::default(),
            &plugin,
        )
        .to_client();
        client.ready().await;

        set_active_session(client.storage(), SESSION_A);
        assert_eq!(client.session_id().await, SESSION_A);
        client.settle().await;
        assert_eq!(plugin.session_starts(), vec![SESSION_A.to_owned()]);

        // The failed rotation is not retried.
        assert_eq!(client.session_id().await, SESSION_A);
        client.settle().await;
        assert_eq!(plugin.session_starts(), vec![SESSION_A.to_owned()]);

        set_active_session(client.storage(), SESSION_B);
        client.session_id().await;
        client.settle().await;
        assert_eq!(
            plugin.session_starts(),
            vec![SESSION_A.to_owned(), SESSION_B.to_owned()]
        );
    }

    #[tokio::test]
    async fn capture_into_expired_session_rotates_native_replay() {
        let sink = CollectingSink::default();
        let plugin = RecordingPlugin::new();
        let client =
            native_replay_config(&ScriptedRemoteConfig::default(), &sink, &plugin).to_client();
        client.ready().await;
        let started = plugin.starts()[0].session_id.clone();

        let an_hour_ago = chrono::Utc::now().timestamp_millis() - 60 * 60 * 1000;
        client
            .storage()
            .set_item(PersistedProperty::SessionLastTimestamp, json!(an_hour_ago));
        client.capture("after_idle", Properties::new()).await;
        client.flush().await.unwrap();
        client.settle().await;

        let event_session = sink.events()[0].properties["$session_id"]
            .as_str()
            .unwrap()
            .to_owned();
        assert_ne!(event_session, started);
        assert_eq!(plugin.ends(), 1);
        assert_eq!(plugin.session_starts(), vec![event_session]);
    }

    #[tokio::test]
    async fn invalid_session_ids_never_reach_the_plugin() {
        let plugin = RecordingPlugin::new();
        let client = native_replay_config(
            &ScriptedRemoteConfig::default(),
            &CollectingSink::default(),
            &plugin,
        )
        .to_client();
        client.ready().await;

        set_active_session(client.storage(), "not-a-uuid");
        client.session_id().await;
        client.settle().await;

        assert!(plugin.session_starts().is_empty());
        assert_eq!(plugin.ends(), 0);
    }

    #[tokio::test]
    async fn failed_native_start_falls_back_to_linked_flag() {
        let _ = env_logger::builder().is_test(true).try_init();

        let remote = ScriptedRemoteConfig::default();
        remote.respond_with(FlagsResponse {
            feature_flags: [("replay".to_owned(), false.into())].into(),
            session_recording: Some(props(json!({"linkedFlag": "replay"}))),
            ..FlagsResponse::default()
        });
        let plugin = RecordingPlugin::new().failing_start();
        let client = native_replay_config(&remote, &CollectingSink::default(), &plugin).to_client();
        client.ready().await;

        assert_eq!(plugin.starts().len(), 1);
        assert!(!client.is_session_recording_active().await);
        assert!(client.is_ready());
    }

    #[tokio::test]
    async fn web_replay_follows_linked_flag() {
        let remote = ScriptedRemoteConfig::default();
        remote.respond_with(FlagsResponse {
            feature_flags: [("replay".to_owned(), "variant-a".into())].into(),
            session_recording: Some(props(json!({"linkedFlag": "replay"}))),
            ..FlagsResponse::default()
        });
        let plugin = RecordingPlugin::new();
        let client = base_config(&remote, &CollectingSink::default())
            .enable_session_replay(true)
            .session_replay_plugin(plugin.clone())
            .to_client();
        client.ready().await;

        assert!(client.is_session_recording_active().await);
        assert!(plugin.calls().is_empty());
    }

    #[tokio::test]
    async fn disabled_client_never_starts_replay() {
        let plugin = RecordingPlugin::new();
        let client = native_replay_config(
            &ScriptedRemoteConfig::default(),
            &CollectingSink::default(),
            &plugin,
        )
        .disabled(true)
        .to_client();
        client.ready().await;
        client.settle().await;

        assert!(plugin.calls().is_empty());
    }

    #[tokio::test]
    async fn identify_forwards_ids_to_native_replay() {
        let plugin = RecordingPlugin::new();
        let client = native_replay_config(
            &ScriptedRemoteConfig::default(),
            &CollectingSink::default(),
            &plugin,
        )
        .to_client();
        client.ready().await;
        let anonymous_id = client.distinct_id().await;

        client.identify(Some("user-1"), Properties::new(), CaptureOptions::default()).await;
        client.identify(None, Properties::new(), CaptureOptions::default()).await;
        client.settle().await;

        assert_eq!(
            plugin.identifies(),
            vec![
                ("user-1".to_owned(), anonymous_id.clone()),
                ("user-1".to_owned(), anonymous_id),
            ]
        );
    }

    #[tokio::test]
    async fn reset_session_id_ends_native_replay() {
        let plugin = RecordingPlugin::new();
        let client = native_replay_config(
            &ScriptedRemoteConfig::default(),
            &CollectingSink::default(),
            &plugin,
        )
        .to_client();
        client.ready().await;
        let before = client.session_id().await;

        client.reset_session_id().await;
        client.settle().await;

        assert_eq!(plugin.calls().last(), Some(&PluginCall::End));
        assert_ne!(client.session_id().await, before);
    }

    #[tokio::test]
    async fn persisted_session_is_cleared_without_persist_across_restart() {
        let store = MemoryKeyValueStore::default();
        let persisted = json!({
            "session_id": SESSION_A,
            "session_timestamp": 1,
            "session_start_timestamp": 1,
            "distinct_id": "user-1",
        });
        store
            .set_item(STORAGE_KEY, persisted.to_string())
            .await
            .unwrap();

        let client = ClientConfig::from_api_key("phc_abc")
            .custom_storage(store)
            .remote_config(ScriptedRemoteConfig::default())
            .device_info(StaticDeviceInfo::new("1.0.0", "1"))
            .to_client();
        client.ready().await;

        let storage = client.storage();
        assert_eq!(storage.get_item(PersistedProperty::SessionId), None);
        assert_eq!(storage.get_item(PersistedProperty::SessionLastTimestamp), None);
        assert_eq!(storage.get_item(PersistedProperty::SessionStartTimestamp), None);
        assert_eq!(client.distinct_id().await, "user-1");
    }

    #[tokio::test]
    async fn persisted_session_survives_with_persist_across_restart() {
        let store = MemoryKeyValueStore::default();
        let now = chrono::Utc::now().timestamp_millis();
        let persisted = json!({
            "session_id": SESSION_A,
            "session_timestamp": now,
            "session_start_timestamp": now,
        });
        store
            .set_item(STORAGE_KEY, persisted.to_string())
            .await
            .unwrap();

        let client = ClientConfig::from_api_key("phc_abc")
            .custom_storage(store)
            .enable_persist_session_id_across_restart(true)
            .remote_config(ScriptedRemoteConfig::default())
            .device_info(StaticDeviceInfo::new("1.0.0", "1"))
            .to_client();
        client.ready().await;

        assert_eq!(client.session_id().await, SESSION_A);
    }

    #[tokio::test]
    async fn app_properties_are_attached_to_events() {
        let sink = CollectingSink::default();
        let client = base_config(&ScriptedRemoteConfig::default(), &sink)
            .platform(Platform::Android)
            .to_client();
        client.ready().await;

        client.capture("opened", Properties::new()).await;
        client.flush().await.unwrap();

        let properties = &sink.events()[0].properties;
        assert_eq!(properties["$app_version"], json!("1.0.0"));
        assert_eq!(properties["$device_type"], json!("Mobile"));
        assert_eq!(properties["$locale"], json!("en-US"));
    }

    #[tokio::test]
    async fn custom_app_properties_replace_or_transform() {
        let sink = CollectingSink::default();
        let client = base_config(&ScriptedRemoteConfig::default(), &sink)
            .custom_app_properties(CustomAppProperties::Fixed(AppProperties {
                app_name: Some("Fixed".to_owned()),
                ..AppProperties::default()
            }))
            .to_client();
        client.ready().await;
        assert_eq!(
            client.app_properties().await,
            AppProperties {
                app_name: Some("Fixed".to_owned()),
                ..AppProperties::default()
            }
        );

        let client = base_config(&ScriptedRemoteConfig::default(), &sink)
            .platform(Platform::Ios)
            .custom_app_properties(CustomAppProperties::Transform(Box::new(|mut properties: AppProperties| {
                properties.app_name = Some("Transformed".to_owned());
                properties
            })))
            .to_client();
        client.ready().await;
        let properties = client.app_properties().await;
        assert_eq!(properties.app_name.as_deref(), Some("Transformed"));
        assert_eq!(properties.app_version.as_deref(), Some("1.0.0"));
    }

    #[tokio::test]
    async fn flags_are_preloaded_when_remote_config_is_disabled() {
        let remote = ScriptedRemoteConfig::default();
        remote.respond_with(FlagsResponse {
            feature_flags: [("beta".to_owned(), true.into())].into(),
            ..FlagsResponse::default()
        });
        let client = base_config(&remote, &CollectingSink::default())
            .disable_remote_config(true)
            .to_client();
        client.ready().await;

        assert_eq!(client.is_feature_enabled("beta").await, Some(true));
        assert_eq!(remote.flag_fetches(), 1);

        let client = base_config(&remote, &CollectingSink::default())
            .disable_remote_config(true)
            .preload_feature_flags(false)
            .to_client();
        client.ready().await;
        assert_eq!(remote.flag_fetches(), 1);
    }

    #[tokio::test]
    async fn surveys_follow_configuration() {
        let remote = ScriptedRemoteConfig::default();
        remote.set_surveys(vec![json!({"id": "s1"})]);

        let client = base_config(&remote, &CollectingSink::default())
            .disable_surveys(true)
            .to_client();
        client.ready().await;
        client
            .storage()
            .set_item(PersistedProperty::Surveys, json!([{"id": "stale"}]));
        assert!(client.surveys().await.is_empty());
        assert_eq!(client.storage().get_item(PersistedProperty::Surveys), None);

        let client = base_config(&remote, &CollectingSink::default())
            .disable_remote_config(true)
            .to_client();
        client.ready().await;
        assert_eq!(client.surveys().await, vec![json!({"id": "s1"})]);
        assert_eq!(client.surveys().await, vec![json!({"id": "s1"})]);
        assert_eq!(remote.survey_fetches(), 1);

        let client = base_config(&remote, &CollectingSink::default()).to_client();
        client.ready().await;
        assert!(client.surveys().await.is_empty());
    }

    #[tokio::test]
    async fn screen_sets_screen_name_for_the_session() {
        let sink = CollectingSink::default();
        let client = base_config(&ScriptedRemoteConfig::default(), &sink).to_client();
        client.ready().await;

        client.screen("Home", Properties::new(), CaptureOptions::default()).await;
        client.capture("tapped", Properties::new()).await;
        client.flush().await.unwrap();

        let events = sink.events();
        assert_eq!(events[0].event, "$screen");
        assert_eq!(events[0].properties["$screen_name"], json!("Home"));
        assert_eq!(events[1].properties["$screen_name"], json!("Home"));
    }

    #[tokio::test]
    async fn autocapture_attaches_to_document_on_web_only() {
        let document = Arc::new(Document::new());
        let client = base_config(&ScriptedRemoteConfig::default(), &CollectingSink::default())
            .document(document.clone())
            .to_client();
        client.enable_autocapture(Default::default()).await;
        client.enable_autocapture(Default::default()).await;
        assert_eq!(document.listener_count(), 2);

        client.destroy().await.unwrap();
        assert_eq!(document.listener_count(), 0);

        let document = Arc::new(Document::new());
        let client = base_config(&ScriptedRemoteConfig::default(), &CollectingSink::default())
            .platform(Platform::Ios)
            .document(document.clone())
            .to_client();
        client.enable_autocapture(Default::default()).await;
        assert_eq!(document.listener_count(), 0);
    }

    #[tokio::test]
    async fn calls_made_before_ready_see_persisted_identity() {
        let store = MemoryKeyValueStore::default();
        store
            .set_item(
                STORAGE_KEY,
                json!({"distinct_id": "user-1", "anonymous_id": "anon-1"}).to_string(),
            )
            .await
            .unwrap();
        let sink = CollectingSink::default();
        let client = ClientConfig::from_api_key("phc_abc")
            .custom_storage(store)
            .remote_config(ScriptedRemoteConfig::default())
            .event_sink(sink.clone())
            .device_info(StaticDeviceInfo::new("1.0.0", "1"))
            .to_client();

        client.capture("early", Properties::new()).await;
        client.flush().await.unwrap();

        assert_eq!(sink.events()[0].distinct_id, "user-1");
        assert_eq!(client.anonymous_id().await, "anon-1");
        assert_eq!(
            client.storage().get_item(PersistedProperty::AnonymousId),
            Some(json!("anon-1"))
        );
    }

    #[tokio::test]
    async fn corrupt_persisted_state_does_not_block_init() {
        let _ = env_logger::builder().is_test(true).try_init();

        let store = MemoryKeyValueStore::default();
        store
            .set_item(STORAGE_KEY, "{not json".to_owned())
            .await
            .unwrap();
        let sink = CollectingSink::default();
        let client = ClientConfig::from_api_key("phc_abc")
            .custom_storage(store)
            .remote_config(ScriptedRemoteConfig::default())
            .event_sink(sink.clone())
            .device_info(StaticDeviceInfo::new("1.0.0", "1"))
            .to_client();
        client.ready().await;
        assert!(client.is_ready());

        client.capture("after_init", Properties::new()).await;
        client.flush().await.unwrap();
        assert_eq!(sink.event_names(), vec!["after_init"]);
    }

    #[tokio::test]
    async fn failing_remote_config_does_not_block_init() {
        let _ = env_logger::builder().is_test(true).try_init();

        let remote = ScriptedRemoteConfig::default();
        remote.fail();
        let sink = CollectingSink::default();
        let client = base_config(&remote, &sink).to_client();
        client.ready().await;
        assert!(client.is_ready());

        client.capture("after_init", Properties::new()).await;
        client.flush().await.unwrap();
        assert_eq!(sink.event_names(), vec!["after_init"]);
        assert_eq!(client.feature_flag("beta").await, None);
    }

    #[tokio::test]
    async fn failing_native_status_does_not_block_init() {
        let _ = env_logger::builder().is_test(true).try_init();

        let sink = CollectingSink::default();
        let plugin = RecordingPlugin::new().failing_status();
        let client =
            native_replay_config(&ScriptedRemoteConfig::default(), &sink, &plugin).to_client();
        client.ready().await;
        assert!(client.is_ready());
        assert_eq!(plugin.calls(), vec![PluginCall::IsEnabled]);

        client.capture("after_init", Properties::new()).await;
        client.flush().await.unwrap();
        assert_eq!(sink.event_names(), vec!["after_init"]);
    }

    #[tokio::test]
    async fn client_without_event_sink_still_accepts_events() {
        let client = ClientConfig::from_api_key("phc_abc")
            .persistence(Persistence::Memory)
            .remote_config(ScriptedRemoteConfig::default())
            .device_info(StaticDeviceInfo::new("1.0.0", "1"))
            .to_client();

        client.capture("dropped", Properties::new()).await;
        assert!(client.flush().await.is_ok());
    }

    #[tokio::test]
    async fn durable_state_is_written_back() {
        let store = MemoryKeyValueStore::default();
        let client = ClientConfig::from_api_key("phc_abc")
            .custom_storage(store.clone())
            .remote_config(ScriptedRemoteConfig::default())
            .device_info(StaticDeviceInfo::new("1.0.0", "1"))
            .to_client();
        client.ready().await;
        client.identify(Some("user-9"), Properties::new(), CaptureOptions::default()).await;
        client.settle().await;

        let raw = store.get_item(STORAGE_KEY).await.unwrap().unwrap();
        let persisted: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(persisted["distinct_id"], json!("user-9"));
    }
}
