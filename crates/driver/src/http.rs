//! HTTP driver client
//!
//! Talks to the automation sidecar that owns the real browser session. The
//! sidecar exposes the capability surface over plain HTTP:
//!
//! - `POST /v1/submissions` with the opaque request content, returns
//!   `{"id": ..., "host": ...}`
//! - `GET /v1/submissions/{id}` returns `{"status": "pending" | "done"}` or
//!   `{"status": "error", "message": ...}`
//! - `GET /v1/submissions/{id}/text` returns the final response text
//! - `DELETE /v1/submissions/{id}` aborts the in-flight submission
//!
//! Non-2xx sidecar responses are classified onto the failure taxonomy by
//! status and body, so the retry policy sees the same kinds regardless of
//! which channel surfaced the failure.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::{Driver, Error, Result, SubmissionHandle, SubmissionStatus, classify_status};

pub struct HttpDriver {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct SubmitResponse {
    id: String,
    host: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

impl HttpDriver {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Submit(format!("driver client build failed: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn classify_response(response: reqwest::Response) -> Error {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Error::Backend {
            kind: classify_status(status, &body),
            message: format!("sidecar returned {status}: {body}"),
        }
    }
}

impl Driver for HttpDriver {
    fn submit<'a>(
        &'a self,
        request: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<SubmissionHandle>> + Send + 'a>> {
        Box::pin(async move {
            let response = self
                .client
                .post(format!("{}/v1/submissions", self.base_url))
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(request.to_string())
                .send()
                .await
                .map_err(|e| Error::Submit(format!("sidecar unreachable: {e}")))?;

            if !response.status().is_success() {
                return Err(Self::classify_response(response).await);
            }
            let submitted: SubmitResponse = response
                .json()
                .await
                .map_err(|e| Error::Submit(format!("malformed submit response: {e}")))?;
            debug!(request_id = %submitted.id, host = %submitted.host, "submission accepted");
            Ok(SubmissionHandle {
                id: submitted.id,
                host: submitted.host,
            })
        })
    }

    fn poll_status<'a>(
        &'a self,
        handle: &'a SubmissionHandle,
    ) -> Pin<Box<dyn Future<Output = Result<SubmissionStatus>> + Send + 'a>> {
        Box::pin(async move {
            let response = self
                .client
                .get(format!("{}/v1/submissions/{}", self.base_url, handle.id))
                .send()
                .await
                .map_err(|e| Error::SessionLost(format!("status poll failed: {e}")))?;

            if !response.status().is_success() {
                return Err(Self::classify_response(response).await);
            }
            let status: StatusResponse = response
                .json()
                .await
                .map_err(|e| Error::SessionLost(format!("malformed status response: {e}")))?;
            match status.status.as_str() {
                "pending" => Ok(SubmissionStatus::Pending),
                "done" => Ok(SubmissionStatus::Done),
                "error" => Ok(SubmissionStatus::Error(
                    status.message.unwrap_or_else(|| "unspecified".to_string()),
                )),
                other => Err(Error::SessionLost(format!(
                    "unrecognized submission status: {other}"
                ))),
            }
        })
    }

    fn harvest_final_text<'a>(
        &'a self,
        handle: &'a SubmissionHandle,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let response = self
                .client
                .get(format!(
                    "{}/v1/submissions/{}/text",
                    self.base_url, handle.id
                ))
                .send()
                .await
                .map_err(|e| Error::SessionLost(format!("harvest failed: {e}")))?;

            if !response.status().is_success() {
                return Err(Self::classify_response(response).await);
            }
            response
                .text()
                .await
                .map_err(|e| Error::SessionLost(format!("harvest body read failed: {e}")))
        })
    }

    fn abort<'a>(
        &'a self,
        handle: &'a SubmissionHandle,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let response = self
                .client
                .delete(format!("{}/v1/submissions/{}", self.base_url, handle.id))
                .send()
                .await
                .map_err(|e| Error::SessionLost(format!("abort failed: {e}")))?;

            if !response.status().is_success() {
                return Err(Self::classify_response(response).await);
            }
            Ok(())
        })
    }
}
