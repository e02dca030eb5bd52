//! Download progress as written by the downloader and as shown to the user.
//!
//! [`DownloadProgress`] holds the raw percentage and only ever moves forward.
//! [`ProgressAnimator`] chases it one unit per frame so bursty network
//! updates turn into a steady bar. The displayed value never overtakes the
//! raw one.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Raw, monotonically non-decreasing progress in `[0, 100]`.
#[derive(Debug)]
pub struct DownloadProgress {
    tx: watch::Sender<f32>,
}

impl Default for DownloadProgress {
    fn default() -> Self {
        let (tx, _) = watch::channel(0.0f32);
        DownloadProgress { tx }
    }
}

impl DownloadProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new raw value. Values below the current one are ignored.
    pub fn report(&self, pct: f32) {
        if pct.is_nan() {
            return;
        }
        let pct = pct.clamp(0.0, 100.0);
        self.tx.send_if_modified(|current| {
            if pct > *current {
                *current = pct;
                true
            } else {
                false
            }
        });
    }

    pub fn current(&self) -> f32 {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<f32> {
        self.tx.subscribe()
    }
}

/// One animation step: move `displayed` toward `raw` by at most one unit.
pub fn step(displayed: f32, raw: f32) -> f32 {
    if displayed < raw {
        (displayed + 1.0).min(raw)
    } else {
        displayed
    }
}

/// Frame-driven smoothing loop, torn down when the handle is dropped.
#[derive(Debug)]
pub struct ProgressAnimator {
    displayed: watch::Receiver<f32>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ProgressAnimator {
    /// Start animating toward the values published on `raw`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(raw: watch::Receiver<f32>, frame: Duration) -> Self {
        let (tx, displayed) = watch::channel(0.0f32);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(animate(raw, tx, frame, cancel.clone()));

        ProgressAnimator {
            displayed,
            cancel,
            task,
        }
    }

    /// Smoothed value for display.
    pub fn displayed(&self) -> watch::Receiver<f32> {
        self.displayed.clone()
    }

    /// Stop the loop and wait until it has exited.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        let _ = (&mut self.task).await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ProgressAnimator {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

async fn animate(
    mut raw: watch::Receiver<f32>,
    displayed: watch::Sender<f32>,
    frame: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(frame);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut shown = 0.0f32;

    loop {
        let target = *raw.borrow_and_update();

        if shown >= target {
            // caught up, sleep until the producer moves
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = raw.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    ticker.reset();
                    continue;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        shown = step(shown, *raw.borrow());
        trace!(shown, "progress frame");
        if displayed.send(shown).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: Duration = Duration::from_millis(16);

    #[test]
    fn step_moves_one_unit_and_never_overshoots() {
        assert_eq!(step(0.0, 10.0), 1.0);
        assert_eq!(step(9.5, 10.0), 10.0);
        assert_eq!(step(10.0, 10.0), 10.0);
        assert_eq!(step(12.0, 10.0), 12.0);
    }

    #[test]
    fn raw_progress_never_goes_backward() {
        let progress = DownloadProgress::new();
        progress.report(40.0);
        progress.report(20.0);
        progress.report(f32::NAN);
        assert_eq!(progress.current(), 40.0);
        progress.report(250.0);
        assert_eq!(progress.current(), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn animator_converges_one_unit_per_frame() {
        let progress = DownloadProgress::new();
        let animator = ProgressAnimator::spawn(progress.subscribe(), FRAME);
        let displayed = animator.displayed();

        progress.report(5.0);
        // sample between frames
        tokio::time::sleep(FRAME / 2).await;

        let mut seen = Vec::new();
        for _ in 0..10 {
            tokio::time::sleep(FRAME).await;
            let value = *displayed.borrow();
            seen.push(value);
            assert!(value <= progress.current());
        }

        assert!(seen.windows(2).all(|w| w[0] <= w[1] && w[1] - w[0] <= 1.0));
        assert_eq!(*seen.last().unwrap(), 5.0);
        animator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn animator_stops_advancing_when_caught_up() {
        let progress = DownloadProgress::new();
        let animator = ProgressAnimator::spawn(progress.subscribe(), FRAME);
        let mut displayed = animator.displayed();

        progress.report(2.0);
        tokio::time::sleep(FRAME * 10).await;
        assert_eq!(*displayed.borrow_and_update(), 2.0);

        tokio::time::sleep(FRAME * 10).await;
        assert!(!displayed.has_changed().unwrap());

        progress.report(4.0);
        tokio::time::sleep(FRAME * 10).await;
        assert_eq!(*displayed.borrow(), 4.0);
        animator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_tears_down_the_loop() {
        let progress = DownloadProgress::new();
        let animator = ProgressAnimator::spawn(progress.subscribe(), FRAME);
        let displayed = animator.displayed();

        progress.report(50.0);
        tokio::time::sleep(FRAME * 3).await;
        animator.shutdown().await;

        let frozen = *displayed.borrow();
        tokio::time::sleep(FRAME * 20).await;
        assert_eq!(*displayed.borrow(), frozen);
        assert!(frozen < 50.0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_cancels_the_task() {
        let progress = DownloadProgress::new();
        let animator = ProgressAnimator::spawn(progress.subscribe(), FRAME);
        let displayed = animator.displayed();

        progress.report(80.0);
        drop(animator);

        tokio::time::sleep(FRAME * 20).await;
        // sender side is gone with the aborted task
        assert!(displayed.has_changed().is_err());
    }
}
