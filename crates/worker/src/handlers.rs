//! Handler that delegates a job to the external AI worker service.
//!
//! [`AiDelegateHandler`] POSTs the typed payload to
//! `{base_url}/{kind}` and stores the JSON reply as the job result. Network
//! errors, timeouts, 408, 429 and 5xx replies are retryable; any other
//! non-2xx reply means the payload itself was rejected and is permanent.

use std::time::Duration;

use async_trait::async_trait;
use hireflow_core::job_events::STAGE_ACTIVE;
use reqwest::StatusCode;

use crate::pool::{HandlerError, JobContext, JobHandler};

/// HTTP request timeout for a single delegation.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Stage reported once the AI worker has answered.
const STAGE_DELEGATED: &str = "delegated";

pub struct AiDelegateHandler {
    client: reqwest::Client,
    base_url: String,
}

impl AiDelegateHandler {
    pub fn new(base_url: impl Into<String>) -> Result<Self, HandlerError> {
        Self::with_timeout(base_url, REQUEST_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, HandlerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HandlerError::permanent(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, kind: &str) -> String {
        format!("{}/{kind}", self.base_url)
    }
}

fn classify_status(status: StatusCode, body: &str) -> HandlerError {
    let message = format!("AI worker returned HTTP {}: {body}", status.as_u16());
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        HandlerError::Retryable(message)
    } else {
        HandlerError::Permanent(message)
    }
}

#[async_trait]
impl JobHandler for AiDelegateHandler {
    async fn handle(&self, ctx: JobContext) -> Result<serde_json::Value, HandlerError> {
        let kind = ctx.payload.kind();
        let url = self.endpoint(kind.as_str());
        let request = serde_json::json!({
            "job_id": ctx.job.id,
            "correlation_id": ctx.job.correlation_id,
            "attempt": ctx.job.attempts,
            "payload": ctx.payload.body(),
        });

        ctx.report(STAGE_ACTIVE, 5, Some("Sending to AI worker"))
            .await
            .map_err(HandlerError::from)?;

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| HandlerError::retryable(format!("AI worker request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                job_id = ctx.job.id,
                url = %url,
                status = status.as_u16(),
                "AI worker rejected job",
            );
            return Err(classify_status(status, &body));
        }

        ctx.report(STAGE_DELEGATED, 90, Some("AI worker responded"))
            .await
            .map_err(HandlerError::from)?;

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| HandlerError::retryable(format!("AI worker reply was not JSON: {e}")))
    }
}
