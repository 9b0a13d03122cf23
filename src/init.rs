//! The startup sequence behind [`Client::ready`](crate::Client::ready).
//!
//! Steps run in a fixed order, each waiting for the previous one. A failing step is logged and
//! the sequence moves on with whatever state it has.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};

use crate::{
    app_properties::resolve_app_properties, client::Inner, config::CustomAppProperties,
    storage::PersistedProperty,
};

/// Where the startup sequence is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum InitState {
    #[default]
    Uninitialized,
    StoragePreloading,
    PropertiesResolving,
    FlagsBootstrapping,
    LifecycleCapturing,
    ReplayBootstrapping,
    Ready,
}

#[derive(Debug, Default)]
pub(crate) struct InitTracker {
    state: Mutex<InitState>,
    loaded: AtomicBool,
}

impl InitTracker {
    pub(crate) fn state(&self) -> InitState {
        *self
            .state
            .lock()
            .expect("thread holding init lock should not panic")
    }

    fn transition(&self, next: InitState) {
        let mut state = self
            .state
            .lock()
            .expect("thread holding init lock should not panic");
        log::debug!(target: "posthog", "init: {:?} -> {:?}", *state, next);
        *state = next;
    }

    /// Returns `false` if the sequence already ran or is running.
    fn begin(&self) -> bool {
        !self.loaded.swap(true, Ordering::SeqCst)
    }
}

impl Inner {
    pub(crate) async fn init(&self) {
        if !self.init.begin() {
            log::warn!(target: "posthog", "client is already initialized, ignoring");
            return;
        }

        self.init.transition(InitState::StoragePreloading);
        if let Err(err) = self.storage.preload().await {
            log::error!(target: "posthog", "failed to preload persisted state: {}", err);
        }

        self.init.transition(InitState::PropertiesResolving);
        self.resolve_app_properties().await;

        if !self.settings.enable_persist_session_id_across_restart {
            self.storage.remove_item(PersistedProperty::SessionId);
            self.storage
                .remove_item(PersistedProperty::SessionLastTimestamp);
            self.storage
                .remove_item(PersistedProperty::SessionStartTimestamp);
        }

        self.init.transition(InitState::FlagsBootstrapping);
        self.bootstrap_flags().await;

        self.init.transition(InitState::LifecycleCapturing);
        if self.settings.capture_app_lifecycle_events {
            self.capture_app_lifecycle_events().await;
        }
        self.persist_app_version();

        self.init.transition(InitState::ReplayBootstrapping);
        self.start_session_replay().await;

        self.init.transition(InitState::Ready);
    }

    async fn resolve_app_properties(&self) {
        let properties = match &self.custom_app_properties {
            Some(CustomAppProperties::Fixed(properties)) => properties.clone(),
            Some(CustomAppProperties::Transform(transform)) => transform(
                resolve_app_properties(self.device_info.as_ref(), self.settings.platform).await,
            ),
            None => resolve_app_properties(self.device_info.as_ref(), self.settings.platform).await,
        };

        self.core.set_common_properties(properties.to_properties());
        *self
            .app_properties
            .write()
            .expect("thread holding app properties lock should not panic") = properties;
    }

    async fn bootstrap_flags(&self) {
        if let Some(bootstrap) = &self.settings.bootstrap {
            self.core.bootstrap(bootstrap);
        }

        if !self.settings.disable_remote_config {
            if let Err(err) = self.core.reload_remote_config().await {
                log::error!(target: "posthog", "failed to load remote config: {}", err);
            }
        } else if self.settings.preload_feature_flags {
            if self.core.reload_feature_flags_async().await.is_none() {
                log::error!(target: "posthog", "failed to preload feature flags");
            }
        }
    }
}
