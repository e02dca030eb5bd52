use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod presigned;
mod stream_loader;

pub use presigned::{HandshakeResponse, PresignedDownloader};
pub use stream_loader::{assemble, ProgressThrottle, StreamOptions};

/// Progress callback receiving a percentage in `[0, 100]`.
pub type ProgressFn<'a> = dyn FnMut(f32) + Send + 'a;

/// Where the model bytes come from.
///
/// An implementation reports progress through `on_progress`, never above 99
/// before the body is fully assembled and exactly 100 once it is. The
/// returned buffer is owned by the caller; nothing is retained.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn fetch(
        &self,
        on_progress: &mut ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> DataLoaderResult<Vec<u8>>;
}

/// Data Loader Result
pub type DataLoaderResult<T> = Result<T, DataLoaderError>;

#[derive(Debug, thiserror::Error)]
pub enum DataLoaderError {
    #[error("Failed to receive presigned url: {0}")]
    HandshakeError(String),

    #[error("Failed to download model: {0}")]
    DownloadError(String),

    #[error("Unable to create http client: {0}")]
    ClientError(String),

    #[error("No data received for {0:?}")]
    Timeout(Duration),

    #[error("Download cancelled")]
    Cancelled,
}

impl DataLoaderError {
    /// Whether the failure happened before the model URL was known.
    pub fn is_handshake(&self) -> bool {
        matches!(self, DataLoaderError::HandshakeError(_))
    }
}
