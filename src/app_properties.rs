//! Static device and app properties attached to every event.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{config::Platform, Error, Properties, Result};

/// Device and app metadata resolved once at startup.
///
/// `None` fields are stripped before the properties are merged into events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct AppProperties {
    #[serde(rename = "$app_build", skip_serializing_if = "Option::is_none")]
    pub app_build: Option<String>,
    #[serde(rename = "$app_name", skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[serde(rename = "$app_namespace", skip_serializing_if = "Option::is_none")]
    pub app_namespace: Option<String>,
    #[serde(rename = "$app_version", skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(rename = "$device_manufacturer", skip_serializing_if = "Option::is_none")]
    pub device_manufacturer: Option<String>,
    #[serde(rename = "$device_name", skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(rename = "$device_model", skip_serializing_if = "Option::is_none")]
    pub device_model: Option<String>,
    #[serde(rename = "$device_type", skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(rename = "$os_name", skip_serializing_if = "Option::is_none")]
    pub os_name: Option<String>,
    #[serde(rename = "$os_version", skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(rename = "$locale", skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(rename = "$timezone", skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(rename = "$screen_width", skip_serializing_if = "Option::is_none")]
    pub screen_width: Option<u32>,
    #[serde(rename = "$screen_height", skip_serializing_if = "Option::is_none")]
    pub screen_height: Option<u32>,
}

impl AppProperties {
    /// Event properties with empty fields left out.
    pub fn to_properties(&self) -> Properties {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map
                .into_iter()
                .filter(|(_, value)| !value.is_null())
                .collect(),
            _ => Properties::new(),
        }
    }
}

/// Device description reported by the host.
#[derive(Debug, Clone, Default, PartialEq)]
#[allow(missing_docs)]
pub struct DeviceInfo {
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub operating_system: Option<String>,
    pub os_version: Option<String>,
    pub screen_width: Option<u32>,
    pub screen_height: Option<u32>,
}

/// Application description reported by the host.
#[derive(Debug, Clone, Default, PartialEq)]
#[allow(missing_docs)]
pub struct AppInfo {
    pub build: Option<String>,
    pub name: Option<String>,
    pub id: Option<String>,
    pub version: Option<String>,
}

/// Host capability that knows about the device and the app.
///
/// Every call may fail independently; a failed call only drops the fields it would have filled.
#[async_trait]
pub trait DeviceInfoSource: Send + Sync {
    /// Device description.
    async fn device_info(&self) -> Result<DeviceInfo>;

    /// Language code, e.g. `en-US`.
    async fn language_code(&self) -> Result<Option<String>>;

    /// App description. Only queried on native platforms.
    async fn app_info(&self) -> Result<AppInfo>;

    /// IANA timezone name.
    async fn timezone(&self) -> Result<Option<String>>;

    /// URL the app was launched with, if any.
    async fn launch_url(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

/// A [`DeviceInfoSource`] that reads what the host process can see about itself.
#[derive(Debug, Clone, Default)]
pub struct HostDeviceInfo {
    app: Option<AppInfo>,
}

impl HostDeviceInfo {
    /// Create a source without app info.
    pub fn new() -> HostDeviceInfo {
        HostDeviceInfo::default()
    }

    /// Report `app` as the app info.
    pub fn with_app_info(mut self, app: AppInfo) -> HostDeviceInfo {
        self.app = Some(app);
        self
    }
}

#[async_trait]
impl DeviceInfoSource for HostDeviceInfo {
    async fn device_info(&self) -> Result<DeviceInfo> {
        Ok(DeviceInfo {
            operating_system: Some(std::env::consts::OS.to_owned()),
            ..DeviceInfo::default()
        })
    }

    async fn language_code(&self) -> Result<Option<String>> {
        // LANG looks like `en_US.UTF-8`.
        Ok(std::env::var("LANG").ok().and_then(|lang| {
            let code = lang.split('.').next().unwrap_or_default().replace('_', "-");
            (!code.is_empty() && code != "C" && code != "POSIX").then_some(code)
        }))
    }

    async fn app_info(&self) -> Result<AppInfo> {
        self.app.clone().ok_or(Error::Unavailable("app info"))
    }

    async fn timezone(&self) -> Result<Option<String>> {
        Ok(std::env::var("TZ").ok().filter(|tz| !tz.is_empty()))
    }
}

fn device_type(platform: Platform) -> &'static str {
    match platform {
        Platform::Ios | Platform::Android => "Mobile",
        Platform::Web => "Web",
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.is_empty())
}

/// Resolve app properties from `source`, dropping whatever fails.
pub async fn resolve_app_properties(
    source: &dyn DeviceInfoSource,
    platform: Platform,
) -> AppProperties {
    let mut properties = AppProperties {
        device_type: Some(device_type(platform).to_owned()),
        ..AppProperties::default()
    };

    match source.device_info().await {
        Ok(device) => {
            properties.device_manufacturer = non_empty(device.manufacturer);
            properties.device_name = non_empty(device.model.clone());
            properties.device_model = non_empty(device.model);
            properties.os_name = non_empty(device.operating_system);
            properties.os_version = non_empty(device.os_version);
            properties.screen_width = device.screen_width;
            properties.screen_height = device.screen_height;
        }
        Err(err) => log::warn!(target: "posthog", "could not get device properties: {}", err),
    }

    match source.language_code().await {
        Ok(locale) => properties.locale = non_empty(locale),
        Err(err) => log::warn!(target: "posthog", "could not get language code: {}", err),
    }

    if platform.is_native() {
        match source.app_info().await {
            Ok(app) => {
                properties.app_build = non_empty(app.build);
                properties.app_name = non_empty(app.name);
                properties.app_namespace = non_empty(app.id);
                properties.app_version = non_empty(app.version);
            }
            Err(err) => log::warn!(target: "posthog", "could not get app info: {}", err),
        }
    }

    match source.timezone().await {
        Ok(timezone) => properties.timezone = non_empty(timezone),
        Err(err) => log::warn!(target: "posthog", "could not get timezone: {}", err),
    }

    properties
}
