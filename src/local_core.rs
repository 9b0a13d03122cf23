//! The built-in [`TrackingCore`].
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, RwLock, Weak},
};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{
    core::{CaptureOptions, CoreContext, FeatureFlagValue, Properties, TrackingCore},
    event_sink::{CapturedEvent, EventSink},
    remote_config::{FlagsRequest, RemoteConfigSource},
    storage::{PersistedProperty, Storage},
    tasks::BackgroundTasks,
    Bootstrap, Result, SDK_NAME, SDK_VERSION,
};

/// Sessions never last longer than this, however active they are.
const MAX_SESSION_LENGTH_MS: i64 = 24 * 60 * 60 * 1000;

/// Properties dropped by [`TrackingCore::reset`].
const RESET_PROPERTIES: &[PersistedProperty] = &[
    PersistedProperty::AnonymousId,
    PersistedProperty::DistinctId,
    PersistedProperty::Props,
    PersistedProperty::FeatureFlags,
    PersistedProperty::FeatureFlagPayloads,
    PersistedProperty::SessionId,
    PersistedProperty::SessionLastTimestamp,
    PersistedProperty::SessionStartTimestamp,
    PersistedProperty::PersonProperties,
    PersistedProperty::GroupProperties,
    PersistedProperty::Groups,
];

/// A [`TrackingCore`] that keeps identity, sessions and flags in [`Storage`], loads flags from
/// a [`RemoteConfigSource`] and hands captured events to an [`EventSink`] in batches.
pub struct LocalCore {
    context: CoreContext,
    sink: Arc<dyn EventSink>,
    remote: Arc<dyn RemoteConfigSource>,
    tasks: BackgroundTasks,
    queue: Mutex<Vec<CapturedEvent>>,
    common_properties: RwLock<Properties>,
    session_properties: Mutex<Properties>,
    // Session id, timestamps and ids are read-modify-write over storage.
    identity_lock: Mutex<()>,
    reported_flag_calls: Mutex<HashSet<String>>,
    this: Weak<LocalCore>,
}

impl LocalCore {
    /// Create a core.
    ///
    /// Must be used from within a Tokio runtime: flushes and flag reloads are spawned on it.
    pub fn new(
        context: CoreContext,
        sink: Arc<dyn EventSink>,
        remote: Arc<dyn RemoteConfigSource>,
    ) -> Arc<LocalCore> {
        LocalCore::with_tasks(context, sink, remote, BackgroundTasks::new())
    }

    pub(crate) fn with_tasks(
        context: CoreContext,
        sink: Arc<dyn EventSink>,
        remote: Arc<dyn RemoteConfigSource>,
        tasks: BackgroundTasks,
    ) -> Arc<LocalCore> {
        Arc::new_cyclic(|this| LocalCore {
            context,
            sink,
            remote,
            tasks,
            queue: Mutex::new(Vec::new()),
            common_properties: RwLock::new(Properties::new()),
            session_properties: Mutex::new(Properties::new()),
            identity_lock: Mutex::new(()),
            reported_flag_calls: Mutex::new(HashSet::new()),
            this: this.clone(),
        })
    }

    fn storage(&self) -> &Storage {
        &self.context.storage
    }

    fn lock_identity(&self) -> std::sync::MutexGuard<'_, ()> {
        self.identity_lock
            .lock()
            .expect("thread holding identity lock should not panic")
    }

    fn anonymous_id_locked(&self) -> String {
        if let Some(id) = self.storage().get_as::<String>(PersistedProperty::AnonymousId) {
            return id;
        }
        let id = Uuid::now_v7().to_string();
        self.storage()
            .set_item(PersistedProperty::AnonymousId, Value::from(id.clone()));
        id
    }

    fn distinct_id_locked(&self) -> String {
        self.storage()
            .get_as::<String>(PersistedProperty::DistinctId)
            .unwrap_or_else(|| self.anonymous_id_locked())
    }

    /// Current session id, starting a new session when the last one idled out or got too long.
    fn resolve_session_id(&self) -> String {
        let _guard = self.lock_identity();
        let storage = self.storage();
        let now = Utc::now().timestamp_millis();

        let session_id = storage.get_as::<String>(PersistedProperty::SessionId);
        let last = storage
            .get_as::<i64>(PersistedProperty::SessionLastTimestamp)
            .unwrap_or(0);
        let start = storage
            .get_as::<i64>(PersistedProperty::SessionStartTimestamp)
            .unwrap_or(0);
        let expiration_ms = self.context.session_expiration.as_millis() as i64;

        let session_id = match session_id {
            Some(id) if now - last <= expiration_ms && now - start <= MAX_SESSION_LENGTH_MS => id,
            _ => {
                let id = Uuid::now_v7().to_string();
                log::debug!(target: "posthog", session_id = id.as_str(); "starting new session");
                storage.set_item(PersistedProperty::SessionId, Value::from(id.clone()));
                storage.set_item(PersistedProperty::SessionStartTimestamp, Value::from(now));
                id
            }
        };
        storage.set_item(PersistedProperty::SessionLastTimestamp, Value::from(now));
        session_id
    }

    fn groups(&self) -> Map<String, Value> {
        self.storage()
            .get_as(PersistedProperty::Groups)
            .unwrap_or_default()
    }

    fn build_properties(&self, properties: Properties, options: &CaptureOptions) -> Properties {
        let mut merged = self
            .common_properties
            .read()
            .expect("thread holding properties lock should not panic")
            .clone();
        merged.insert("$lib".to_owned(), Value::from(SDK_NAME));
        merged.insert("$lib_version".to_owned(), Value::from(SDK_VERSION));

        if let Some(super_properties) = self.storage().get_as::<Properties>(PersistedProperty::Props)
        {
            merged.extend(super_properties);
        }
        merged.extend(
            self.session_properties
                .lock()
                .expect("thread holding properties lock should not panic")
                .clone(),
        );

        let session_id = self.session_id();
        if !session_id.is_empty() {
            merged.insert("$session_id".to_owned(), Value::from(session_id));
        }

        let groups = self.groups();
        if !groups.is_empty() {
            merged.insert("$groups".to_owned(), Value::Object(groups));
        }

        merged.extend(properties);

        if options.disable_geoip == Some(true) {
            merged.insert("$geoip_disable".to_owned(), Value::Bool(true));
        }
        merged
    }

    fn enqueue(&self, distinct_id: String, event: &str, properties: Properties, options: CaptureOptions) {
        if self.is_disabled() {
            log::trace!(target: "posthog", event; "client is disabled or opted out, dropping event");
            return;
        }

        let properties = self.build_properties(properties, &options);
        let event = CapturedEvent {
            uuid: options.uuid.unwrap_or_else(Uuid::now_v7),
            event: event.to_owned(),
            distinct_id,
            properties,
            timestamp: options.timestamp.unwrap_or_else(Utc::now),
        };
        log::trace!(target: "posthog", event:serde; "captured event");

        let should_flush = {
            let mut queue = self
                .queue
                .lock()
                .expect("thread holding queue lock should not panic");
            queue.push(event);
            queue.len() >= self.context.flush_at
        };

        if should_flush {
            if let Some(this) = self.this.upgrade() {
                self.tasks.spawn(async move {
                    // Errors are logged by flush().
                    let _ = this.flush().await;
                });
            }
        }
    }

    fn flags_request(&self) -> FlagsRequest {
        let (distinct_id, anonymous_id) = {
            let _guard = self.lock_identity();
            (self.distinct_id_locked(), self.anonymous_id_locked())
        };
        let groups = self
            .groups()
            .into_iter()
            .filter_map(|(group_type, key)| Some((group_type, key.as_str()?.to_owned())))
            .collect();

        FlagsRequest {
            anonymous_id: (anonymous_id != distinct_id).then_some(anonymous_id),
            distinct_id,
            groups,
            person_properties: self
                .storage()
                .get_as(PersistedProperty::PersonProperties)
                .unwrap_or_default(),
            group_properties: self
                .storage()
                .get_as(PersistedProperty::GroupProperties)
                .unwrap_or_default(),
        }
    }

    fn store_flags(
        &self,
        flags: HashMap<String, FeatureFlagValue>,
        payloads: HashMap<String, Value>,
        partial: bool,
    ) -> HashMap<String, FeatureFlagValue> {
        let (flags, payloads) = if partial {
            // The server failed to compute some flags; keep the last known values for those.
            let mut known_flags = self.known_feature_flags().unwrap_or_default();
            known_flags.extend(flags);
            let mut known_payloads: HashMap<String, Value> = self
                .storage()
                .get_as(PersistedProperty::FeatureFlagPayloads)
                .unwrap_or_default();
            known_payloads.extend(payloads);
            (known_flags, known_payloads)
        } else {
            (flags, payloads)
        };

        self.storage()
            .set_as(PersistedProperty::FeatureFlags, Some(&flags));
        self.storage()
            .set_as(PersistedProperty::FeatureFlagPayloads, Some(&payloads));
        flags
    }

    fn spawn_reload_feature_flags(&self) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        self.tasks.spawn(async move {
            this.reload_feature_flags_async().await;
        });
    }
}

#[async_trait]
impl TrackingCore for LocalCore {
    fn capture(&self, event: &str, properties: Properties, options: CaptureOptions) {
        let distinct_id = {
            let _guard = self.lock_identity();
            self.distinct_id_locked()
        };
        self.enqueue(distinct_id, event, properties, options);
    }

    fn identify(&self, distinct_id: Option<&str>, properties: Properties, options: CaptureOptions) {
        let (previous_distinct_id, anonymous_id, distinct_id) = {
            let _guard = self.lock_identity();
            let previous_distinct_id = self.distinct_id_locked();
            let anonymous_id = self.anonymous_id_locked();
            let distinct_id = distinct_id
                .filter(|id| !id.is_empty())
                .map(str::to_owned)
                .unwrap_or_else(|| previous_distinct_id.clone());

            if distinct_id != previous_distinct_id {
                // The previous id becomes the anonymous id so the server can merge both.
                self.storage().set_item(
                    PersistedProperty::AnonymousId,
                    Value::from(previous_distinct_id.clone()),
                );
                self.storage()
                    .set_item(PersistedProperty::DistinctId, Value::from(distinct_id.clone()));
            }
            (previous_distinct_id, anonymous_id, distinct_id)
        };

        let mut event_properties = Properties::new();
        event_properties.insert("$set".to_owned(), Value::Object(properties));
        event_properties.insert("$anon_distinct_id".to_owned(), Value::from(anonymous_id));
        self.enqueue(distinct_id.clone(), "$identify", event_properties, options);

        if distinct_id != previous_distinct_id {
            self.spawn_reload_feature_flags();
        }
    }

    fn alias(&self, alias: &str) {
        let distinct_id = {
            let _guard = self.lock_identity();
            self.distinct_id_locked()
        };
        let mut properties = Properties::new();
        properties.insert("distinct_id".to_owned(), Value::from(distinct_id.clone()));
        properties.insert("alias".to_owned(), Value::from(alias));
        self.enqueue(distinct_id, "$create_alias", properties, CaptureOptions::default());
    }

    fn group(&self, group_type: &str, group_key: &str, properties: Properties) {
        let mut groups = self.groups();
        let previous = groups.insert(group_type.to_owned(), Value::from(group_key));
        self.storage()
            .set_item(PersistedProperty::Groups, Value::Object(groups));

        if !properties.is_empty() {
            let mut event_properties = Properties::new();
            event_properties.insert("$group_type".to_owned(), Value::from(group_type));
            event_properties.insert("$group_key".to_owned(), Value::from(group_key));
            event_properties.insert("$group_set".to_owned(), Value::Object(properties));
            self.capture("$groupidentify", event_properties, CaptureOptions::default());
        }

        if previous.as_ref().and_then(Value::as_str) != Some(group_key) {
            self.spawn_reload_feature_flags();
        }
    }

    fn register(&self, properties: Properties) {
        let mut super_properties: Properties = self
            .storage()
            .get_as(PersistedProperty::Props)
            .unwrap_or_default();
        super_properties.extend(properties);
        self.storage()
            .set_item(PersistedProperty::Props, Value::Object(super_properties));
    }

    fn unregister(&self, property: &str) {
        let mut super_properties: Properties = self
            .storage()
            .get_as(PersistedProperty::Props)
            .unwrap_or_default();
        if super_properties.remove(property).is_some() {
            self.storage()
                .set_item(PersistedProperty::Props, Value::Object(super_properties));
        }
    }

    fn register_for_session(&self, properties: Properties) {
        self.session_properties
            .lock()
            .expect("thread holding properties lock should not panic")
            .extend(properties);
    }

    fn reset(&self) {
        {
            let _guard = self.lock_identity();
            for property in RESET_PROPERTIES {
                self.storage().remove_item(*property);
            }
        }
        self.session_properties
            .lock()
            .expect("thread holding properties lock should not panic")
            .clear();
        self.reported_flag_calls
            .lock()
            .expect("thread holding flag calls lock should not panic")
            .clear();
        self.spawn_reload_feature_flags();
    }

    async fn flush(&self) -> Result<()> {
        let events = {
            let mut queue = self
                .queue
                .lock()
                .expect("thread holding queue lock should not panic");
            std::mem::take(&mut *queue)
        };

        if events.is_empty() {
            return Ok(());
        }

        log::debug!(target: "posthog", count = events.len(); "flushing events");
        let result = self.sink.send(events).await;
        if let Err(err) = &result {
            log::warn!(target: "posthog", "failed to deliver events: {:?}", err);
        }
        result
    }

    fn opt_in(&self) {
        self.storage()
            .set_item(PersistedProperty::OptedOut, Value::Bool(false));
    }

    fn opt_out(&self) {
        self.storage()
            .set_item(PersistedProperty::OptedOut, Value::Bool(true));
    }

    fn is_disabled(&self) -> bool {
        self.context.disabled
            || self
                .storage()
                .get_as::<bool>(PersistedProperty::OptedOut)
                .unwrap_or(false)
    }

    fn set_common_properties(&self, properties: Properties) {
        *self
            .common_properties
            .write()
            .expect("thread holding properties lock should not panic") = properties;
    }

    fn distinct_id(&self) -> String {
        let _guard = self.lock_identity();
        self.distinct_id_locked()
    }

    fn anonymous_id(&self) -> String {
        let _guard = self.lock_identity();
        self.anonymous_id_locked()
    }

    fn session_id(&self) -> String {
        let session_id = self.resolve_session_id();
        if let Some(listener) = &self.context.on_session_id {
            listener(&session_id);
        }
        session_id
    }

    fn reset_session_id(&self) {
        let _guard = self.lock_identity();
        self.storage().remove_item(PersistedProperty::SessionId);
        self.storage()
            .remove_item(PersistedProperty::SessionLastTimestamp);
        self.storage()
            .remove_item(PersistedProperty::SessionStartTimestamp);
    }

    fn feature_flag(&self, key: &str) -> Option<FeatureFlagValue> {
        let value = self.known_feature_flags()?.remove(key);

        if self.context.send_feature_flag_event {
            let response = value
                .as_ref()
                .map(|value| serde_json::to_value(value).unwrap_or(Value::Null))
                .unwrap_or(Value::Null);
            let first_call = self
                .reported_flag_calls
                .lock()
                .expect("thread holding flag calls lock should not panic")
                .insert(format!("{key}_{response}"));
            if first_call {
                let mut properties = Properties::new();
                properties.insert("$feature_flag".to_owned(), Value::from(key));
                properties.insert("$feature_flag_response".to_owned(), response);
                self.capture("$feature_flag_called", properties, CaptureOptions::default());
            }
        }

        value
    }

    fn feature_flag_payload(&self, key: &str) -> Option<Value> {
        let mut payloads: HashMap<String, Value> = self
            .storage()
            .get_as(PersistedProperty::FeatureFlagPayloads)?;
        payloads.remove(key)
    }

    fn known_feature_flags(&self) -> Option<HashMap<String, FeatureFlagValue>> {
        self.storage().get_as(PersistedProperty::FeatureFlags)
    }

    fn bootstrap(&self, bootstrap: &Bootstrap) {
        if let Some(distinct_id) = bootstrap.distinct_id.as_deref().filter(|id| !id.is_empty()) {
            let _guard = self.lock_identity();
            let property = if bootstrap.is_identified_id {
                PersistedProperty::DistinctId
            } else {
                PersistedProperty::AnonymousId
            };
            if self.storage().get_item(property).is_none() {
                self.storage().set_item(property, Value::from(distinct_id));
            }
        }

        if !bootstrap.feature_flags.is_empty() && self.known_feature_flags().is_none() {
            let flags: HashMap<String, FeatureFlagValue> = bootstrap
                .feature_flags
                .iter()
                .filter(|(_, value)| value.is_enabled())
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            self.storage()
                .set_as(PersistedProperty::FeatureFlags, Some(&flags));
        }

        if !bootstrap.feature_flag_payloads.is_empty()
            && self
                .storage()
                .get_item(PersistedProperty::FeatureFlagPayloads)
                .is_none()
        {
            self.storage().set_as(
                PersistedProperty::FeatureFlagPayloads,
                Some(&bootstrap.feature_flag_payloads),
            );
        }
    }

    fn reload_feature_flags(&self) {
        self.spawn_reload_feature_flags();
    }

    async fn reload_feature_flags_async(&self) -> Option<HashMap<String, FeatureFlagValue>> {
        let request = self.flags_request();
        match self.remote.fetch_flags(&request).await {
            Ok(response) => Some(self.store_flags(
                response.feature_flags,
                response.feature_flag_payloads,
                response.errors_while_computing_flags,
            )),
            Err(err) => {
                log::warn!(target: "posthog", "failed to reload feature flags: {}", err);
                None
            }
        }
    }

    async fn reload_remote_config(&self) -> Result<()> {
        let request = self.flags_request();
        let response = self.remote.fetch_flags(&request).await?;

        self.store_flags(
            response.feature_flags,
            response.feature_flag_payloads,
            response.errors_while_computing_flags,
        );

        match response.session_recording {
            Some(config) => self
                .storage()
                .set_item(PersistedProperty::SessionReplay, Value::Object(config)),
            None => self.storage().remove_item(PersistedProperty::SessionReplay),
        }

        if response.surveys {
            match self.remote.fetch_surveys().await {
                Ok(surveys) => self
                    .storage()
                    .set_item(PersistedProperty::Surveys, Value::Array(surveys)),
                Err(err) => log::warn!(target: "posthog", "failed to load surveys: {}", err),
            }
        }

        log::debug!(target: "posthog", "remote config loaded");
        Ok(())
    }

    fn set_person_properties_for_flags(&self, properties: HashMap<String, String>) {
        let mut existing: HashMap<String, String> = self
            .storage()
            .get_as(PersistedProperty::PersonProperties)
            .unwrap_or_default();
        existing.extend(properties);
        self.storage()
            .set_as(PersistedProperty::PersonProperties, Some(&existing));
    }

    fn reset_person_properties_for_flags(&self) {
        self.storage()
            .remove_item(PersistedProperty::PersonProperties);
    }

    fn set_group_properties_for_flags(&self, properties: HashMap<String, HashMap<String, String>>) {
        let mut existing: HashMap<String, HashMap<String, String>> = self
            .storage()
            .get_as(PersistedProperty::GroupProperties)
            .unwrap_or_default();
        for (group_type, group_properties) in properties {
            existing.entry(group_type).or_default().extend(group_properties);
        }
        self.storage()
            .set_as(PersistedProperty::GroupProperties, Some(&existing));
    }

    fn reset_group_properties_for_flags(&self) {
        self.storage()
            .remove_item(PersistedProperty::GroupProperties);
    }

    async fn surveys_stateless(&self) -> Result<Vec<Value>> {
        self.remote.fetch_surveys().await
    }
}
