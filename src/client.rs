use std::env;
use std::time::Duration;

use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::plan::model::{
    ApiError, CalculateRequest, CalculateResponse, Preferences, PreferencesSaved,
};

/// Local development default; overridden by `--api` or the environment.
pub const DEFAULT_API_BASE: &str = "http://127.0.0.1:8000";
pub const API_BASE_ENV: &str = "SLEEPCYCLE_API";

/// Hard bound on any single request. A free-tier backend can take close to
/// a minute to cold-start, so the bound is generous but never infinite.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// What went wrong talking to the calculation API. Every variant is terminal
/// for the submission; the user resubmits by hand.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(
        "the request timed out after 60 seconds; the server may be waking up from a cold \
         start, try again in a moment"
    )]
    Timeout,
    #[error(
        "could not connect to the API at {base}; the server may still be waking up \
         (start one locally with `sleepcycle serve`)"
    )]
    Connect {
        base: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{detail}")]
    Server { status: u16, detail: String },
    #[error("unexpected API error: {0}; please try again")]
    Unexpected(#[source] reqwest::Error),
}

/// Picks the API base address: explicit flag first, then the environment,
/// then the local development default.
pub fn resolve_base(flag: Option<String>) -> String {
    flag.or_else(|| {
        env::var(API_BASE_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
    })
    .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
}

pub struct ApiClient {
    base: String,
    http: reqwest::blocking::Client,
}

impl ApiClient {
    pub fn new(base: impl Into<String>) -> Result<Self, ClientError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(ClientError::Unexpected)?;
        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn calculate(&self, request: &CalculateRequest) -> Result<CalculateResponse, ClientError> {
        debug!(base = %self.base, wake_time = %request.wake_time, "posting calculation request");
        let response = self
            .http
            .post(format!("{}/api/v1/calculate", self.base))
            .json(request)
            .send()
            .map_err(|err| self.classify(err))?;
        read_json(response)
    }

    pub fn get_preferences(&self) -> Result<Preferences, ClientError> {
        let response = self
            .http
            .get(format!("{}/api/v1/preferences", self.base))
            .send()
            .map_err(|err| self.classify(err))?;
        read_json(response)
    }

    pub fn set_preferences(
        &self,
        preferences: &Preferences,
    ) -> Result<PreferencesSaved, ClientError> {
        let response = self
            .http
            .post(format!("{}/api/v1/preferences", self.base))
            .json(preferences)
            .send()
            .map_err(|err| self.classify(err))?;
        read_json(response)
    }

    pub fn reset_preferences(&self) -> Result<PreferencesSaved, ClientError> {
        let response = self
            .http
            .delete(format!("{}/api/v1/preferences", self.base))
            .send()
            .map_err(|err| self.classify(err))?;
        read_json(response)
    }

    fn classify(&self, err: reqwest::Error) -> ClientError {
        if err.is_timeout() {
            ClientError::Timeout
        } else if err.is_connect() {
            ClientError::Connect {
                base: self.base.clone(),
                source: err,
            }
        } else {
            ClientError::Unexpected(err)
        }
    }
}

/// Success bodies decode into the expected type; failure bodies are expected
/// to carry a `detail` reason, with a synthesized `API error: <status>`
/// fallback when they do not.
fn read_json<T: DeserializeOwned>(
    response: reqwest::blocking::Response,
) -> Result<T, ClientError> {
    let status = response.status();
    if !status.is_success() {
        let detail = response
            .json::<ApiError>()
            .ok()
            .map(|body| body.detail)
            .filter(|detail| !detail.trim().is_empty())
            .unwrap_or_else(|| format!("API error: {}", status.as_u16()));
        return Err(ClientError::Server {
            status: status.as_u16(),
            detail,
        });
    }
    response.json::<T>().map_err(ClientError::Unexpected)
}
