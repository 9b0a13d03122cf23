//! A handle that exists before the client does.
use std::{collections::HashMap, sync::Arc};

use futures::{future::BoxFuture, FutureExt};
use serde_json::Value;
use tokio::sync::{watch, Mutex, MutexGuard};

use crate::{
    autocapture::AutocaptureOptions, CaptureOptions, Client, ClientConfig, FeatureFlagValue,
    Properties, Result,
};

struct Shared {
    client: watch::Sender<Option<Client>>,
    // Fair mutex: calls proceed in the order they started waiting.
    turnstile: Mutex<()>,
}

/// Lazily initialized client.
///
/// `PostHog::new` needs no configuration. Every call waits until [`PostHog::setup`] has created
/// the client and the client is ready, then runs. Calls run one at a time, in the order they were
/// made. If `setup` is never called, calls wait forever.
///
/// Cloning is cheap and clones share the same client.
///
/// # Examples
/// ```
/// # use posthog_bridge::{ClientConfig, Persistence, PostHog, Properties};
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let posthog = PostHog::new();
/// let capture = posthog.capture("app_started", Properties::new());
///
/// posthog.setup(
///     ClientConfig::from_api_key("phc_abc")
///         .persistence(Persistence::Memory)
///         .disable_remote_config(true),
/// );
/// capture.await;
/// # }
/// ```
#[derive(Clone)]
pub struct PostHog {
    shared: Arc<Shared>,
}

struct Acquired<'a> {
    _guard: MutexGuard<'a, ()>,
    client: Client,
}

impl Default for PostHog {
    fn default() -> PostHog {
        PostHog::new()
    }
}

impl PostHog {
    /// Create a handle without a client.
    pub fn new() -> PostHog {
        PostHog {
            shared: Arc::new(Shared {
                client: watch::Sender::new(None),
                turnstile: Mutex::new(()),
            }),
        }
    }

    /// Create the client. The returned future resolves once the client is ready; the client is
    /// created whether or not it is awaited.
    ///
    /// Only the first call has an effect. Later calls log a warning and return a future that is
    /// already resolved. Must be called from within a Tokio runtime.
    pub fn setup(&self, config: ClientConfig) -> BoxFuture<'static, ()> {
        let mut created = None;
        self.shared.client.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            let client = config.to_client();
            *slot = Some(client.clone());
            created = Some(client);
            true
        });

        match created {
            Some(client) => {
                log::debug!(target: "posthog", "client set up");
                async move { client.ready().await }.boxed()
            }
            None => {
                log::warn!(target: "posthog", "client is already set up, ignoring duplicate setup");
                futures::future::ready(()).boxed()
            }
        }
    }

    /// Whether [`PostHog::setup`] has been called.
    pub fn is_set_up(&self) -> bool {
        self.shared.client.borrow().is_some()
    }

    async fn acquire(&self) -> Acquired<'_> {
        let guard = self.shared.turnstile.lock().await;

        let mut receiver = self.shared.client.subscribe();
        let client = match receiver.wait_for(Option::is_some).await {
            Ok(client) => (*client).clone(),
            Err(_) => None,
        };
        let Some(client) = client else {
            // The sender lives as long as `self`, so this never happens.
            return std::future::pending().await;
        };

        client.ready().await;
        Acquired {
            _guard: guard,
            client,
        }
    }

    /// The client, once it's ready.
    pub async fn client(&self) -> Client {
        self.acquire().await.client
    }

    /// Resolves once the client is set up and ready.
    pub async fn ready(&self) {
        self.acquire().await;
    }

    /// Wait for the client's background work.
    pub async fn settle(&self) {
        self.acquire().await.client.settle().await
    }

    /// See [`Client::capture`].
    pub async fn capture(&self, event: &str, properties: Properties) {
        self.acquire().await.client.capture(event, properties).await
    }

    /// See [`Client::capture_with_options`].
    pub async fn capture_with_options(
        &self,
        event: &str,
        properties: Properties,
        options: CaptureOptions,
    ) {
        self.acquire()
            .await
            .client
            .capture_with_options(event, properties, options)
            .await
    }

    /// See [`Client::screen`].
    pub async fn screen(&self, name: &str, properties: Properties, options: CaptureOptions) {
        self.acquire().await.client.screen(name, properties, options).await
    }

    /// See [`Client::identify`].
    pub async fn identify(
        &self,
        distinct_id: Option<&str>,
        properties: Properties,
        options: CaptureOptions,
    ) {
        self.acquire()
            .await
            .client
            .identify(distinct_id, properties, options)
            .await
    }

    /// See [`Client::alias`].
    pub async fn alias(&self, alias: &str) {
        self.acquire().await.client.alias(alias).await
    }

    /// See [`Client::group`].
    pub async fn group(&self, group_type: &str, group_key: &str, properties: Properties) {
        self.acquire()
            .await
            .client
            .group(group_type, group_key, properties)
            .await
    }

    /// See [`Client::register`].
    pub async fn register(&self, properties: Properties) {
        self.acquire().await.client.register(properties).await
    }

    /// See [`Client::unregister`].
    pub async fn unregister(&self, property: &str) {
        self.acquire().await.client.unregister(property).await
    }

    /// See [`Client::reset`].
    pub async fn reset(&self) {
        self.acquire().await.client.reset().await
    }

    /// See [`Client::flush`].
    pub async fn flush(&self) -> Result<()> {
        self.acquire().await.client.flush().await
    }

    /// See [`Client::close`].
    pub async fn close(&self) -> Result<()> {
        self.acquire().await.client.close().await
    }

    /// See [`Client::destroy`].
    pub async fn destroy(&self) -> Result<()> {
        self.acquire().await.client.destroy().await
    }

    /// See [`Client::opt_in`].
    pub async fn opt_in(&self) {
        self.acquire().await.client.opt_in().await
    }

    /// See [`Client::opt_out`].
    pub async fn opt_out(&self) {
        self.acquire().await.client.opt_out().await
    }

    /// See [`Client::is_feature_enabled`].
    pub async fn is_feature_enabled(&self, key: &str) -> Option<bool> {
        self.acquire().await.client.is_feature_enabled(key).await
    }

    /// See [`Client::feature_flag`].
    pub async fn feature_flag(&self, key: &str) -> Option<FeatureFlagValue> {
        self.acquire().await.client.feature_flag(key).await
    }

    /// See [`Client::feature_flag_payload`].
    pub async fn feature_flag_payload(&self, key: &str) -> Option<Value> {
        self.acquire().await.client.feature_flag_payload(key).await
    }

    /// See [`Client::reload_feature_flags`].
    pub async fn reload_feature_flags(&self) {
        self.acquire().await.client.reload_feature_flags().await
    }

    /// See [`Client::reload_feature_flags_async`].
    pub async fn reload_feature_flags_async(&self) -> Option<HashMap<String, FeatureFlagValue>> {
        self.acquire()
            .await
            .client
            .reload_feature_flags_async()
            .await
    }

    /// See [`Client::set_person_properties_for_flags`].
    pub async fn set_person_properties_for_flags(&self, properties: HashMap<String, String>) {
        self.acquire()
            .await
            .client
            .set_person_properties_for_flags(properties)
            .await
    }

    /// See [`Client::reset_person_properties_for_flags`].
    pub async fn reset_person_properties_for_flags(&self) {
        self.acquire()
            .await
            .client
            .reset_person_properties_for_flags()
            .await
    }

    /// See [`Client::set_group_properties_for_flags`].
    pub async fn set_group_properties_for_flags(
        &self,
        properties: HashMap<String, HashMap<String, String>>,
    ) {
        self.acquire()
            .await
            .client
            .set_group_properties_for_flags(properties)
            .await
    }

    /// See [`Client::reset_group_properties_for_flags`].
    pub async fn reset_group_properties_for_flags(&self) {
        self.acquire()
            .await
            .client
            .reset_group_properties_for_flags()
            .await
    }

    /// See [`Client::surveys`].
    pub async fn surveys(&self) -> Vec<Value> {
        self.acquire().await.client.surveys().await
    }

    /// See [`Client::distinct_id`].
    pub async fn distinct_id(&self) -> String {
        self.acquire().await.client.distinct_id().await
    }

    /// See [`Client::anonymous_id`].
    pub async fn anonymous_id(&self) -> String {
        self.acquire().await.client.anonymous_id().await
    }

    /// See [`Client::session_id`].
    pub async fn session_id(&self) -> String {
        self.acquire().await.client.session_id().await
    }

    /// See [`Client::reset_session_id`].
    pub async fn reset_session_id(&self) {
        self.acquire().await.client.reset_session_id().await
    }

    /// See [`Client::reset_native_session_id`].
    pub async fn reset_native_session_id(&self, session_id: &str) {
        self.acquire()
            .await
            .client
            .reset_native_session_id(session_id)
            .await
    }

    /// See [`Client::enable_autocapture`].
    pub async fn enable_autocapture(&self, options: AutocaptureOptions) {
        self.acquire().await.client.enable_autocapture(options).await
    }

    /// See [`Client::disable_autocapture`].
    pub async fn disable_autocapture(&self) {
        self.acquire().await.client.disable_autocapture().await
    }

    /// See [`Client::app_state_changed`].
    pub async fn app_state_changed(&self, active: bool) {
        self.acquire().await.client.app_state_changed(active).await
    }

    /// See [`Client::deep_link_opened`].
    pub async fn deep_link_opened(&self, url: &str) {
        self.acquire().await.client.deep_link_opened(url).await
    }
}
