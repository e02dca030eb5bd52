use super::stream_loader::{assemble, StreamOptions};
use super::{ArtifactSource, DataLoaderError, DataLoaderResult, ProgressFn};
use crate::config::ClassifierConfig;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Body of the handshake response.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub presigned_url: String,
}

/// Two-stage model download: ask `endpoint` for a short-lived presigned URL,
/// then stream the model from that URL.
#[derive(Clone, Debug)]
pub struct PresignedDownloader {
    client: Client,
    endpoint: String,
    request_timeout: Duration,
    options: StreamOptions,
}

impl PresignedDownloader {
    pub fn new(config: &ClassifierConfig) -> DataLoaderResult<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|error| DataLoaderError::ClientError(error.to_string()))?;

        Ok(PresignedDownloader {
            client,
            endpoint: config.endpoint.clone(),
            request_timeout: config.request_timeout,
            options: StreamOptions {
                progress_interval: config.progress_interval,
                stall_timeout: config.stall_timeout,
            },
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Mint a presigned URL. A new one is requested on every call.
    pub async fn resolve(&self) -> DataLoaderResult<String> {
        debug!(endpoint = %self.endpoint, "requesting presigned url");

        let response = self
            .client
            .get(&self.endpoint)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|error| DataLoaderError::HandshakeError(error.to_string()))?;

        if !response.status().is_success() {
            return Err(DataLoaderError::HandshakeError(status_text(response.status())));
        }

        let handshake: HandshakeResponse = response.json().await.map_err(|error| {
            DataLoaderError::HandshakeError(format!("invalid handshake body: {}", error))
        })?;

        Ok(handshake.presigned_url)
    }

    /// Stream the artifact behind `url`.
    ///
    /// The response head must arrive within the stall timeout, as must every
    /// body chunk after it.
    pub async fn download(
        &self,
        url: &str,
        on_progress: &mut ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> DataLoaderResult<Vec<u8>> {
        let stall = self.options.stall_timeout;
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(DataLoaderError::Cancelled),
            response = tokio::time::timeout(stall, self.client.get(url).send()) => response,
        }
        .map_err(|_| DataLoaderError::Timeout(stall))?
        .map_err(|error| DataLoaderError::DownloadError(error.to_string()))?;

        if !response.status().is_success() {
            return Err(DataLoaderError::DownloadError(status_text(response.status())));
        }

        let content_length = response.content_length().unwrap_or(0);
        info!(content_length, "downloading model");

        assemble(
            response.bytes_stream(),
            content_length,
            self.options,
            on_progress,
            cancel,
        )
        .await
    }
}

#[async_trait]
impl ArtifactSource for PresignedDownloader {
    async fn fetch(
        &self,
        on_progress: &mut ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> DataLoaderResult<Vec<u8>> {
        let url = tokio::select! {
            _ = cancel.cancelled() => return Err(DataLoaderError::Cancelled),
            url = self.resolve() => url?,
        };

        let model = self.download(&url, on_progress, cancel).await?;

        info!("downloaded model of size '{}' bytes", model.len());
        Ok(model)
    }
}

fn status_text(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {}", status.as_u16(), reason),
        None => status.as_u16().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_body_parses() {
        let body: HandshakeResponse =
            serde_json::from_str(r#"{"presigned_url":"https://bucket/model.onnx?sig=1","expires":60}"#)
                .unwrap();
        assert_eq!(body.presigned_url, "https://bucket/model.onnx?sig=1");
    }

    #[test]
    fn status_text_includes_reason() {
        assert_eq!(status_text(StatusCode::FORBIDDEN), "403 Forbidden");
    }
}
