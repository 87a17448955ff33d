// SPDX-FileCopyrightText: 2026 AICM Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP client for the tracking API.
//!
//! [`TrackClient`] posts record batches to `/track` and serves the
//! conditional `/triggered-limits` fetch. It owns the retry policy for one
//! delivery attempt: network errors, 5xx, and 429 are retried with
//! exponential backoff up to `MAX_ATTEMPTS`; any other 4xx is a permanent
//! rejection surfaced as [`AicmError::ServerRejected`]. Every successful
//! response refreshes the shared triggered-limit cache.

use std::sync::{Arc, Mutex};

use aicm_config::Settings;
use aicm_core::{AicmError, UsageRecord};
use aicm_limits::TriggeredLimitCache;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE, ETAG, HeaderMap, HeaderValue, IF_NONE_MATCH};
use serde_json::Value;
use tracing::{debug, warn};

use crate::backoff::http_backoff;
use crate::redact::redact;
use crate::types::{ApiErrorBody, LimitsFetch, TrackResponse};

const USER_AGENT_VALUE: &str = concat!("aicm-rs/", env!("CARGO_PKG_VERSION"));

/// HTTP transport shared by every delivery strategy of one tracker.
///
/// One instance means one connection pool and one TLS client per tracker.
#[derive(Debug)]
pub struct TrackClient {
    client: reqwest::Client,
    track_url: String,
    limits_url: String,
    max_attempts: u32,
    log_bodies: bool,
    cache: Arc<TriggeredLimitCache>,
    etag: Mutex<Option<String>>,
}

impl TrackClient {
    /// Build a client from resolved settings.
    ///
    /// Fails when the API key is missing or unusable as a header value.
    pub fn new(settings: &Settings, cache: Arc<TriggeredLimitCache>) -> Result<Self, AicmError> {
        let api_key = settings.require_api_key()?;
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|e| AicmError::Config(format!("api_key is not a valid header value: {e}")))?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            reqwest::header::USER_AGENT,
            HeaderValue::from_static(USER_AGENT_VALUE),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(settings.timeout_duration())
            .build()
            .map_err(|e| AicmError::Transport {
                message: format!("failed to build HTTP client: {e}"),
                retryable: false,
                source: Some(Box::new(e)),
            })?;

        Ok(Self {
            client,
            track_url: settings.track_url(),
            limits_url: settings.limits_url(),
            max_attempts: settings.max_attempts.max(1),
            log_bodies: settings.log_bodies,
            cache,
            etag: Mutex::new(None),
        })
    }

    /// The shared triggered-limit cache this client refreshes.
    pub fn cache(&self) -> &Arc<TriggeredLimitCache> {
        &self.cache
    }

    /// POST one batch to `/track`, retrying transient failures.
    ///
    /// Returns the parsed response on any 2xx. Does not interpret
    /// per-record statuses; that is the delivery strategy's job.
    pub async fn send_batch(&self, records: &[UsageRecord]) -> Result<TrackResponse, AicmError> {
        let body = serde_json::json!({
            "records": records.iter().map(UsageRecord::to_wire).collect::<Vec<Value>>(),
        });
        if self.log_bodies {
            let text = serde_json::to_string(&body).unwrap_or_default();
            debug!(body = %redact(&text), "track request");
        }

        let mut last_error: Option<AicmError> = None;
        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                let delay = http_backoff(attempt - 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying track request");
                tokio::time::sleep(delay).await;
            }

            let response = match self.client.post(&self.track_url).json(&body).send().await {
                Ok(response) => response,
                Err(err) => {
                    warn!(attempt, error = %err, "track request failed to send");
                    last_error = Some(network_error(err));
                    continue;
                }
            };

            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            if self.log_bodies {
                debug!(status = %status, body = %redact(&text), "track response");
            }

            if status.is_success() {
                let parsed: TrackResponse =
                    serde_json::from_str(&text).map_err(|e| AicmError::Transport {
                        message: format!("unparseable track response: {e}"),
                        retryable: false,
                        source: Some(Box::new(e)),
                    })?;
                if let Some(limits) = parsed.triggered_limits.clone() {
                    self.cache.notify(limits);
                }
                return Ok(parsed);
            }

            if is_retryable_status(status) {
                warn!(status = %status, attempt, "transient track failure");
                last_error = Some(AicmError::Transport {
                    message: format!("server returned {status}"),
                    retryable: true,
                    source: None,
                });
                continue;
            }

            // Permanent rejection. Surface the structured body when present.
            let parsed: Option<ApiErrorBody> = serde_json::from_str(&text).ok();
            return Err(AicmError::ServerRejected {
                status: status.as_u16(),
                detail: parsed
                    .as_ref()
                    .and_then(|b| b.detail.clone())
                    .unwrap_or_else(|| text.chars().take(200).collect()),
                code: parsed.and_then(|b| b.code),
            });
        }

        Err(last_error.unwrap_or_else(|| AicmError::transport("track request failed")))
    }

    /// Conditionally fetch the authoritative limit set.
    ///
    /// Sends `If-None-Match` with the last seen ETag; a 304 reports the
    /// cache as current. A fresh body replaces the cache contents.
    pub async fn fetch_limits(&self) -> Result<LimitsFetch, AicmError> {
        let mut request = self.client.get(&self.limits_url);
        let cached_etag = self.etag.lock().expect("etag lock").clone();
        if let Some(etag) = &cached_etag {
            request = request.header(IF_NONE_MATCH, etag.clone());
        }

        let response = request.send().await.map_err(network_error)?;
        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            debug!("triggered limits unchanged");
            return Ok(LimitsFetch::Unchanged);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AicmError::Transport {
                message: format!("limits fetch returned {status}: {}", redact(&text)),
                retryable: is_retryable_status(status),
                source: None,
            });
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let text = response.text().await.unwrap_or_default();
        if self.log_bodies {
            debug!(body = %redact(&text), "limits response");
        }

        // The endpoint serves either a bare array or the wrapped form used
        // inside track responses.
        let limits = serde_json::from_str::<Vec<aicm_limits::TriggeredLimit>>(&text)
            .or_else(|_| {
                serde_json::from_str::<TrackResponse>(&text)
                    .map(|r| r.triggered_limits.unwrap_or_default())
            })
            .map_err(|e| AicmError::Transport {
                message: format!("unparseable limits response: {e}"),
                retryable: false,
                source: Some(Box::new(e)),
            })?;

        *self.etag.lock().expect("etag lock") = etag.clone();
        self.cache.notify(limits.clone());
        Ok(LimitsFetch::Fetched { limits, etag })
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn network_error(err: reqwest::Error) -> AicmError {
    let message = if err.is_timeout() {
        format!("request timed out: {err}")
    } else {
        format!("request failed: {err}")
    };
    AicmError::Transport {
        message,
        retryable: true,
        source: Some(Box::new(err)),
    }
}
