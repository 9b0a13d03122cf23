//! Loading feature flags, session replay decision config and surveys from the server.
use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::{core::FeatureFlagValue, Error, Result};

/// Who flags are evaluated for.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlagsRequest {
    /// Current distinct id.
    pub distinct_id: String,
    /// Anonymous id, so the server can merge flags after identify.
    #[serde(rename = "$anon_distinct_id", skip_serializing_if = "Option::is_none")]
    pub anonymous_id: Option<String>,
    /// Groups the user belongs to, keyed by group type.
    pub groups: HashMap<String, String>,
    /// Person properties for flag evaluation.
    pub person_properties: HashMap<String, String>,
    /// Group properties for flag evaluation.
    pub group_properties: HashMap<String, HashMap<String, String>>,
}

/// Server response carrying flags and remote config.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagsResponse {
    /// Flag values.
    #[serde(default)]
    pub feature_flags: HashMap<String, FeatureFlagValue>,
    /// Flag payloads.
    #[serde(default)]
    pub feature_flag_payloads: HashMap<String, Value>,
    /// Replay decision config. `None` when the server sent `false` or nothing.
    #[serde(default, deserialize_with = "object_or_false")]
    pub session_recording: Option<Map<String, Value>>,
    /// Whether the project has surveys.
    #[serde(default)]
    pub surveys: bool,
    /// Set when the server stopped evaluating flags.
    #[serde(default)]
    pub errors_while_computing_flags: bool,
}

fn object_or_false<'de, D>(deserializer: D) -> std::result::Result<Option<Map<String, Value>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Object(map) => Ok(Some(map)),
        _ => Ok(None),
    }
}

/// Where flags, remote config and surveys come from.
#[async_trait]
pub trait RemoteConfigSource: Send + Sync {
    /// Evaluate flags (and remote config) for `request`.
    async fn fetch_flags(&self, request: &FlagsRequest) -> Result<FlagsResponse>;

    /// Fetch survey definitions.
    async fn fetch_surveys(&self) -> Result<Vec<Value>>;
}

const FLAGS_ENDPOINT: &str = "/flags/";
const SURVEYS_ENDPOINT: &str = "/api/surveys/";

/// A [`RemoteConfigSource`] talking to the PostHog HTTP API.
pub struct HttpRemoteConfig {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    host: String,
    api_key: String,
    /// If we receive a 401 Unauthorized error during a request, it means the API key is not
    /// valid. We cache this error so we don't issue additional requests to the server.
    unauthorized: AtomicBool,
}

#[derive(Serialize)]
struct FlagsBody<'a> {
    token: &'a str,
    #[serde(flatten)]
    request: &'a FlagsRequest,
}

#[derive(Deserialize)]
struct SurveysResponse {
    #[serde(default)]
    surveys: Vec<Value>,
}

impl HttpRemoteConfig {
    /// Create a source for `host` authenticating with `api_key`.
    pub fn new(host: impl Into<String>, api_key: impl Into<String>) -> HttpRemoteConfig {
        HttpRemoteConfig {
            client: reqwest::Client::new(),
            host: host.into(),
            api_key: api_key.into(),
            unauthorized: AtomicBool::new(false),
        }
    }

    fn url(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<Url> {
        Url::parse_with_params(
            &format!("{}{}", self.host.trim_end_matches('/'), endpoint),
            params,
        )
        .map_err(Error::InvalidHost)
    }

    fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        response.error_for_status().map_err(|err| {
            if err.status() == Some(StatusCode::UNAUTHORIZED) {
                log::warn!(target: "posthog", "client is not authorized. Check your API key");
                self.unauthorized.store(true, Ordering::Relaxed);
                Error::Unauthorized
            } else {
                log::warn!(target: "posthog", "received non-200 response while fetching remote config: {:?}", err);
                Error::from(err)
            }
        })
    }
}

#[async_trait]
impl RemoteConfigSource for HttpRemoteConfig {
    async fn fetch_flags(&self, request: &FlagsRequest) -> Result<FlagsResponse> {
        if self.unauthorized.load(Ordering::Relaxed) {
            return Err(Error::Unauthorized);
        }

        let url = self.url(FLAGS_ENDPOINT, &[("v", "2"), ("config", "true")])?;

        log::debug!(target: "posthog", "fetching flags");
        let response = self
            .client
            .post(url)
            .json(&FlagsBody {
                token: &self.api_key,
                request,
            })
            .send()
            .await?;
        let response = self.check_status(response)?;

        let flags: FlagsResponse = response.json().await?;
        log::debug!(target: "posthog", count = flags.feature_flags.len(); "successfully fetched flags");

        Ok(flags)
    }

    async fn fetch_surveys(&self) -> Result<Vec<Value>> {
        if self.unauthorized.load(Ordering::Relaxed) {
            return Err(Error::Unauthorized);
        }

        let url = self.url(SURVEYS_ENDPOINT, &[("token", &self.api_key)])?;

        log::debug!(target: "posthog", "fetching surveys");
        let response = self.client.get(url).send().await?;
        let response = self.check_status(response)?;

        let surveys: SurveysResponse = response.json().await?;
        Ok(surveys.surveys)
    }
}
