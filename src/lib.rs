//! PostHog analytics for web and native-bridge hosts.
//!
//! # Overview
//!
//! The SDK revolves around a [`Client`] that captures events, identifies users, evaluates feature
//! flags and keeps track of sessions. A client is created from a [`ClientConfig`] and starts
//! initializing right away; [`Client::ready`] resolves once persisted state is loaded, app
//! properties are resolved, flags are bootstrapped and session replay is started.
//!
//! When the client has to exist before its configuration is known, use [`PostHog`]. Calls made on
//! it wait until [`PostHog::setup`] runs and then proceed in the order they were made.
//!
//! Event delivery is pluggable through [`EventSink`]. On native hosts, session replay is driven
//! through a [`SessionReplayPlugin`] provided by the host.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Analytics should never take the host application down, so most operations log failures
//! instead of returning them. The few that return errors, such as [`Client::flush`], report
//! problems worth a developer's attention.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging
//! messages under the `posthog` target. Consider integrating a `log`-compatible logger
//! implementation for better visibility into SDK operations.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod app_properties;
mod autocapture;
mod client;
mod config;
mod core;
mod error;
mod event_sink;
mod facade;
mod init;
mod lifecycle;
mod local_core;
mod remote_config;
mod replay;
mod session;
mod storage;
mod tasks;

#[cfg(test)]
mod test_support;

pub use app_properties::{
    resolve_app_properties, AppInfo, AppProperties, DeviceInfo, DeviceInfoSource, HostDeviceInfo,
};
pub use autocapture::{
    AutocaptureHandle, AutocaptureOptions, Document, DomEvent, DomEventKind, Element, ElementKind,
    EventTarget, Listener, ListenerId,
};
pub use client::Client;
pub use config::{
    Bootstrap, ClientConfig, CustomAppProperties, Persistence, Platform, SessionReplayConfig,
};
pub use crate::core::{
    CaptureOptions, CoreContext, CoreFactory, FeatureFlagValue, Properties, SessionListener,
    TrackingCore,
};
pub use error::{Error, Result};
pub use event_sink::{CapturedEvent, EventSink};
pub use facade::PostHog;
pub use local_core::LocalCore;
pub use remote_config::{FlagsRequest, FlagsResponse, HttpRemoteConfig, RemoteConfigSource};
pub use replay::{LinkedFlag, SdkOptions, SessionReplayPlugin, StartReplayRequest};
pub use storage::{FileStore, KeyValueStore, PersistedProperty, Storage, STORAGE_KEY};

/// Reported as `$lib` on every event.
pub(crate) const SDK_NAME: &str = "posthog-bridge";
pub(crate) const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");
