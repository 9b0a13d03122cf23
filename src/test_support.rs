//! Fakes for host capabilities used across unit tests.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::{
    app_properties::{AppInfo, DeviceInfo, DeviceInfoSource},
    event_sink::{CapturedEvent, EventSink},
    remote_config::{FlagsRequest, FlagsResponse, RemoteConfigSource},
    replay::{SessionReplayPlugin, StartReplayRequest},
    storage::{KeyValueStore, PersistedProperty, Storage},
    Error, Properties, Result,
};

/// Turn a `json!({...})` object into event properties.
pub(crate) fn props(value: Value) -> Properties {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

/// Make `id` the current, unexpired session.
pub(crate) fn set_active_session(storage: &Storage, id: &str) {
    let now = Utc::now().timestamp_millis();
    storage.set_item(PersistedProperty::SessionId, Value::from(id));
    storage.set_item(PersistedProperty::SessionStartTimestamp, Value::from(now));
    storage.set_item(PersistedProperty::SessionLastTimestamp, Value::from(now));
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryKeyValueStore {
    items: Arc<Mutex<HashMap<String, String>>>,
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.items.lock().unwrap().get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: String) -> Result<()> {
        self.items.lock().unwrap().insert(key.to_owned(), value);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        self.items.lock().unwrap().remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct StaticDeviceInfo {
    version: String,
    build: String,
    launch_url: Option<String>,
    fail_device_info: bool,
}

impl StaticDeviceInfo {
    pub(crate) fn new(version: &str, build: &str) -> StaticDeviceInfo {
        StaticDeviceInfo {
            version: version.to_owned(),
            build: build.to_owned(),
            launch_url: None,
            fail_device_info: false,
        }
    }

    pub(crate) fn failing_device_info(mut self) -> StaticDeviceInfo {
        self.fail_device_info = true;
        self
    }

    pub(crate) fn with_launch_url(mut self, url: &str) -> StaticDeviceInfo {
        self.launch_url = Some(url.to_owned());
        self
    }
}

#[async_trait]
impl DeviceInfoSource for StaticDeviceInfo {
    async fn device_info(&self) -> Result<DeviceInfo> {
        if self.fail_device_info {
            return Err(Error::NativePlugin("device info unavailable".to_owned()));
        }
        Ok(DeviceInfo {
            manufacturer: Some("Apple".to_owned()),
            model: Some("iPhone15,2".to_owned()),
            operating_system: Some("iOS".to_owned()),
            os_version: Some("17.4".to_owned()),
            screen_width: Some(393),
            screen_height: Some(852),
        })
    }

    async fn language_code(&self) -> Result<Option<String>> {
        Ok(Some("en-US".to_owned()))
    }

    async fn app_info(&self) -> Result<AppInfo> {
        Ok(AppInfo {
            build: Some(self.build.clone()),
            name: Some("Example".to_owned()),
            id: Some("com.example.app".to_owned()),
            version: Some(self.version.clone()),
        })
    }

    async fn timezone(&self) -> Result<Option<String>> {
        Ok(Some("Europe/Berlin".to_owned()))
    }

    async fn launch_url(&self) -> Result<Option<String>> {
        Ok(self.launch_url.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct CollectingSink {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl CollectingSink {
    pub(crate) fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn event_names(&self) -> Vec<String> {
        self.events().into_iter().map(|event| event.event).collect()
    }
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn send(&self, events: Vec<CapturedEvent>) -> Result<()> {
        self.events.lock().unwrap().extend(events);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RemoteState {
    response: FlagsResponse,
    surveys: Vec<Value>,
    failing: bool,
    requests: Vec<FlagsRequest>,
    survey_fetches: usize,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptedRemoteConfig {
    state: Arc<Mutex<RemoteState>>,
}

impl ScriptedRemoteConfig {
    pub(crate) fn respond_with(&self, response: FlagsResponse) {
        let mut state = self.state.lock().unwrap();
        state.response = response;
        state.failing = false;
    }

    pub(crate) fn set_surveys(&self, surveys: Vec<Value>) {
        self.state.lock().unwrap().surveys = surveys;
    }

    pub(crate) fn fail(&self) {
        self.state.lock().unwrap().failing = true;
    }

    pub(crate) fn last_request(&self) -> Option<FlagsRequest> {
        self.state.lock().unwrap().requests.last().cloned()
    }

    pub(crate) fn flag_fetches(&self) -> usize {
        self.state.lock().unwrap().requests.len()
    }

    pub(crate) fn survey_fetches(&self) -> usize {
        self.state.lock().unwrap().survey_fetches
    }
}

#[async_trait]
impl RemoteConfigSource for ScriptedRemoteConfig {
    async fn fetch_flags(&self, request: &FlagsRequest) -> Result<FlagsResponse> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());
        if state.failing {
            return Err(Error::Unauthorized);
        }
        Ok(state.response.clone())
    }

    async fn fetch_surveys(&self) -> Result<Vec<Value>> {
        let mut state = self.state.lock().unwrap();
        state.survey_fetches += 1;
        if state.failing {
            return Err(Error::Unauthorized);
        }
        Ok(state.surveys.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PluginCall {
    Start(StartReplayRequest),
    StartSession(String),
    End,
    IsEnabled,
    Identify {
        distinct_id: String,
        anonymous_id: String,
    },
}

#[derive(Debug, Default)]
struct PluginState {
    calls: Vec<PluginCall>,
    enabled: bool,
    fail_start: bool,
    fail_start_session: bool,
    fail_status: bool,
}

/// A native replay plugin that records every call.
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordingPlugin {
    state: Arc<Mutex<PluginState>>,
}

impl RecordingPlugin {
    pub(crate) fn new() -> RecordingPlugin {
        RecordingPlugin::default()
    }

    /// Report native replay as already running.
    pub(crate) fn already_enabled(self) -> RecordingPlugin {
        self.state.lock().unwrap().enabled = true;
        self
    }

    pub(crate) fn failing_start(self) -> RecordingPlugin {
        self.state.lock().unwrap().fail_start = true;
        self
    }

    pub(crate) fn failing_rotation(self) -> RecordingPlugin {
        self.state.lock().unwrap().fail_start_session = true;
        self
    }

    pub(crate) fn failing_status(self) -> RecordingPlugin {
        self.state.lock().unwrap().fail_status = true;
        self
    }

    pub(crate) fn calls(&self) -> Vec<PluginCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub(crate) fn starts(&self) -> Vec<StartReplayRequest> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                PluginCall::Start(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn session_starts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                PluginCall::StartSession(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn ends(&self) -> usize {
        self.calls()
            .into_iter()
            .filter(|call| *call == PluginCall::End)
            .count()
    }

    pub(crate) fn identifies(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                PluginCall::Identify {
                    distinct_id,
                    anonymous_id,
                } => Some((distinct_id, anonymous_id)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl SessionReplayPlugin for RecordingPlugin {
    async fn start_session_replay(&self, request: StartReplayRequest) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(PluginCall::Start(request));
        if state.fail_start {
            return Err(Error::NativePlugin("start failed".to_owned()));
        }
        state.enabled = true;
        Ok(())
    }

    async fn start_session_replay_session(&self, session_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(PluginCall::StartSession(session_id.to_owned()));
        if state.fail_start_session {
            return Err(Error::NativePlugin("rotation failed".to_owned()));
        }
        Ok(())
    }

    async fn end_session_replay(&self) -> Result<()> {
        self.state.lock().unwrap().calls.push(PluginCall::End);
        Ok(())
    }

    async fn is_session_replay_enabled(&self) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(PluginCall::IsEnabled);
        if state.fail_status {
            return Err(Error::NativePlugin("status unavailable".to_owned()));
        }
        Ok(state.enabled)
    }

    async fn identify_session_replay(&self, distinct_id: &str, anonymous_id: &str) -> Result<()> {
        self.state.lock().unwrap().calls.push(PluginCall::Identify {
            distinct_id: distinct_id.to_owned(),
            anonymous_id: anonymous_id.to_owned(),
        });
        Ok(())
    }
}
