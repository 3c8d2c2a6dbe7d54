use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::lounge::Controller;
use crate::providers::ViewedSegmentReporter;
use crate::segments::Segment;
use crate::snapshot::{PlaybackSnapshot, PlaybackState};

/// A segment whose start is already behind the playhead still matches if
/// the position is within this many seconds of the video start. Catches
/// skips that land right at t=0 before the first state report arrives.
const LOOKBACK_TOLERANCE: f64 = 2.0;

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Lifecycle of one pending skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipState {
    Idle,
    /// A timer is running toward a scheduled seek.
    Armed,
    /// The timer fired and the seek was issued.
    Fired,
    /// A newer playback update aborted the timer before it fired.
    Cancelled,
}

struct Pending {
    handle: Option<JoinHandle<()>>,
    state: SkipState,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Schedules and executes delayed seeks past sponsor segments.
///
/// At most one skip is armed per device. Every playback update cancels the
/// previous timer before arming a new one, so a stale timer can never race
/// a newer playback state into a wrong seek.
#[derive(Clone)]
pub struct SkipScheduler {
    controller: Controller,
    reporter: Arc<dyn ViewedSegmentReporter>,
    /// Per-device skip-timing calibration in seconds; may be negative.
    device_offset: f64,
    /// Whether fired skips are reported back to the segment source.
    report_views: bool,
    pending: Arc<Mutex<Pending>>,
}

impl SkipScheduler {
    pub fn new(
        controller: Controller,
        reporter: Arc<dyn ViewedSegmentReporter>,
        device_offset: f64,
        report_views: bool,
    ) -> Self {
        Self {
            controller,
            reporter,
            device_offset,
            report_views,
            pending: Arc::new(Mutex::new(Pending {
                handle: None,
                state: SkipState::Idle,
            })),
        }
    }

    pub fn state(&self) -> SkipState {
        self.pending.lock().expect("skip state lock poisoned").state
    }

    /// Feed a fresh playback snapshot. Cancels any armed timer, then arms a
    /// new one toward the next relevant segment (if playback is running and
    /// one exists).
    pub fn on_playback_update(&self, snapshot: &PlaybackSnapshot, segments: &[Segment]) {
        let mut pending = self.pending.lock().expect("skip state lock poisoned");

        if let Some(handle) = pending.handle.take() {
            handle.abort();
            if pending.state == SkipState::Armed {
                pending.state = SkipState::Cancelled;
            }
        }

        if snapshot.state != PlaybackState::Playing || segments.is_empty() {
            pending.state = SkipState::Idle;
            return;
        }

        let position = snapshot.current_time;
        let Some((target_start, segment)) = next_relevant_segment(segments, position) else {
            pending.state = SkipState::Idle;
            return;
        };

        // Account for the time the event spent in flight and in our own
        // pipeline, plus the manual per-device calibration.
        let elapsed = snapshot.observed_at.elapsed().as_secs_f64();
        let delay = (target_start - position - elapsed - self.device_offset).max(0.0);

        tracing::info!(
            "skip armed: seeking to {:.1} in {delay:.2}s (segment {:.1}-{:.1})",
            segment.end,
            segment.start,
            segment.end
        );

        let controller = self.controller.clone();
        let reporter = Arc::clone(&self.reporter);
        let report_views = self.report_views;
        let seek_to = segment.end;
        let ids = segment.ids.clone();
        let pending_ref = Arc::clone(&self.pending);

        pending.state = SkipState::Armed;
        pending.handle = Some(tokio::spawn(async move {
            sleep(Duration::from_secs_f64(delay)).await;

            pending_ref.lock().expect("skip state lock poisoned").state = SkipState::Fired;
            tracing::info!("skipping segment: seeking to {seek_to:.1}");

            if report_views {
                if let Err(e) = reporter.report(&ids).await {
                    tracing::warn!("failed to report skipped segment: {e}");
                }
            }

            if let Err(e) = controller.seek_to(seek_to).await {
                tracing::warn!("skip seek failed: {e}");
            }
        }));
    }

    /// Abort any armed timer. Idempotent; aborting a finished task is a
    /// no-op.
    pub fn cancel(&self) {
        let mut pending = self.pending.lock().expect("skip state lock poisoned");
        if let Some(handle) = pending.handle.take() {
            handle.abort();
        }
        if pending.state == SkipState::Armed {
            pending.state = SkipState::Cancelled;
        }
    }
}

/// Pick the next segment worth skipping from a start-sorted list.
///
/// Returns the position the delay is measured from (the playhead itself
/// when already inside a segment near the video start, otherwise the
/// segment start) plus the segment. First match wins.
fn next_relevant_segment<'a>(segments: &'a [Segment], position: f64) -> Option<(f64, &'a Segment)> {
    for segment in segments {
        if position < LOOKBACK_TOLERANCE && segment.start <= position && position < segment.end {
            return Some((position, segment));
        }
        if segment.start > position {
            return Some((segment.start, segment));
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
