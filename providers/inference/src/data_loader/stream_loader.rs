use super::{DataLoaderError, DataLoaderResult, ProgressFn};
use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Highest percentage reported while the body is still incomplete.
pub const MAX_PARTIAL_PROGRESS: f32 = 99.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StreamOptions {
    /// Minimum wall-clock time between two progress reports
    pub progress_interval: Duration,
    /// Longest wait for the next chunk
    pub stall_timeout: Duration,
}

/// Time based throttle for download progress.
///
/// Reports at most once per `interval`, capped at [`MAX_PARTIAL_PROGRESS`] and
/// never lower than a previous report. An unknown total (`0`) suppresses all
/// partial reports.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    total: u64,
    last_update: Instant,
    last_reported: f32,
}

impl ProgressThrottle {
    pub fn new(interval: Duration, total: u64, started: Instant) -> Self {
        ProgressThrottle {
            interval,
            total,
            last_update: started,
            last_reported: 0.0,
        }
    }

    pub fn observe(&mut self, received: u64, now: Instant) -> Option<f32> {
        if now.saturating_duration_since(self.last_update) < self.interval {
            return None;
        }
        self.last_update = now;

        if self.total == 0 {
            return None;
        }

        let pct = ((received as f64 / self.total as f64) * 100.0) as f32;
        let pct = pct.clamp(self.last_reported, MAX_PARTIAL_PROGRESS);
        self.last_reported = pct;
        Some(pct)
    }
}

/// Drain `stream` into one contiguous buffer.
///
/// Chunks are kept as received and concatenated once, into a buffer sized to
/// the total. Any stream error, stall or cancellation discards everything
/// received so far.
pub async fn assemble<S, B, E>(
    stream: S,
    content_length: u64,
    options: StreamOptions,
    on_progress: &mut ProgressFn<'_>,
    cancel: &CancellationToken,
) -> DataLoaderResult<Vec<u8>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut chunks: Vec<B> = Vec::new();
    let mut received: u64 = 0;
    let mut throttle = ProgressThrottle::new(options.progress_interval, content_length, Instant::now());

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DataLoaderError::Cancelled),
            next = tokio::time::timeout(options.stall_timeout, stream.next()) => next,
        };

        let chunk = match next {
            Err(_) => return Err(DataLoaderError::Timeout(options.stall_timeout)),
            Ok(None) => break,
            Ok(Some(Err(error))) => return Err(DataLoaderError::DownloadError(error.to_string())),
            Ok(Some(Ok(chunk))) => chunk,
        };

        received += chunk.as_ref().len() as u64;
        chunks.push(chunk);

        if let Some(pct) = throttle.observe(received, Instant::now()) {
            on_progress(pct);
        }
    }

    let mut buffer = Vec::with_capacity(received as usize);
    for chunk in chunks.drain(..) {
        buffer.extend_from_slice(chunk.as_ref());
    }

    debug!(received, content_length, "assembled model buffer");

    on_progress(100.0);
    Ok(buffer)
}
