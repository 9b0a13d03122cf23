//! Application lifecycle events.
use serde_json::Value;

use crate::{
    client::Inner, config::Persistence, storage::PersistedProperty, CaptureOptions, Properties,
};

pub(crate) const APPLICATION_INSTALLED: &str = "Application Installed";
pub(crate) const APPLICATION_UPDATED: &str = "Application Updated";
pub(crate) const APPLICATION_OPENED: &str = "Application Opened";
pub(crate) const APPLICATION_BECAME_ACTIVE: &str = "Application Became Active";
pub(crate) const APPLICATION_BACKGROUNDED: &str = "Application Backgrounded";
pub(crate) const DEEP_LINK_OPENED: &str = "Deep Link Opened";

fn maybe_add(properties: &mut Properties, key: &str, value: Option<String>) {
    if let Some(value) = value {
        properties.insert(key.to_owned(), Value::from(value));
    }
}

impl Inner {
    fn installed_app(&self) -> (Option<String>, Option<String>) {
        let app = self
            .app_properties
            .read()
            .expect("thread holding app properties lock should not panic");
        (app.app_build.clone(), app.app_version.clone())
    }

    /// Capture install/update and open events.
    ///
    /// Must run before [`Inner::persist_app_version`] so the previous build is still visible.
    pub(crate) async fn capture_app_lifecycle_events(&self) {
        let (app_build, app_version) = self.installed_app();

        if self.settings.persistence == Persistence::Memory {
            log::warn!(target: "posthog", "install and update events need durable persistence, skipping them");
        } else {
            let previous_build = self
                .storage
                .get_as::<String>(PersistedProperty::InstalledAppBuild);
            let previous_version = self
                .storage
                .get_as::<String>(PersistedProperty::InstalledAppVersion);

            if app_build.is_none() || app_version.is_none() {
                log::warn!(target: "posthog", "app build or version is missing, install and update events can't be tracked. Include $app_build and $app_version in custom app properties");
            }

            if let Some(app_build) = &app_build {
                match previous_build {
                    None => self.capture(APPLICATION_INSTALLED, Properties::new()),
                    Some(previous_build) if previous_build != *app_build => {
                        let mut properties = Properties::new();
                        maybe_add(&mut properties, "previous_version", previous_version);
                        maybe_add(&mut properties, "previous_build", Some(previous_build));
                        self.capture(APPLICATION_UPDATED, properties);
                    }
                    Some(_) => {}
                }
            }
        }

        let launch_url = match self.device_info.launch_url().await {
            Ok(url) => url,
            Err(err) => {
                log::warn!(target: "posthog", "could not get launch url: {}", err);
                None
            }
        };
        let mut properties = Properties::new();
        maybe_add(&mut properties, "url", launch_url);
        self.capture(APPLICATION_OPENED, properties);
    }

    /// Remember the running build and version for the next launch.
    pub(crate) fn persist_app_version(&self) {
        let (app_build, app_version) = self.installed_app();
        self.storage
            .set_as(PersistedProperty::InstalledAppBuild, app_build.as_ref());
        self.storage
            .set_as(PersistedProperty::InstalledAppVersion, app_version.as_ref());
    }

    /// Host app moved to the foreground or background.
    pub(crate) fn app_state_changed(&self, active: bool) {
        if !self.settings.capture_app_lifecycle_events || !self.settings.platform.is_native() {
            return;
        }

        if active {
            self.capture(APPLICATION_BECAME_ACTIVE, Properties::new());
            self.session_id();
        } else {
            self.capture(APPLICATION_BACKGROUNDED, Properties::new());
            let this = self.handle();
            self.tasks.spawn(async move {
                if let Some(this) = this.upgrade() {
                    // Errors are logged by the core.
                    let _ = this.core.flush().await;
                }
            });
        }
    }

    /// Host app was opened through a deep link.
    pub(crate) fn deep_link_opened(&self, url: &str) {
        if !self.settings.capture_app_lifecycle_events || !self.settings.platform.is_native() {
            return;
        }
        let mut properties = Properties::new();
        properties.insert("url".to_owned(), Value::from(url));
        self.capture(DEEP_LINK_OPENED, properties);
    }

    fn capture(&self, event: &str, properties: Properties) {
        self.core.capture(event, properties, CaptureOptions::default());
    }
}
