use std::collections::HashMap;

use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

pub type Result<T> = std::result::Result<T, SnapshotError>;

/// A playback payload that could not be coerced into a snapshot. Fatal for
/// that event only: the caller drops the event and keeps the previous
/// snapshot.
#[derive(Debug)]
pub enum SnapshotError {
    MissingField(&'static str),
    BadNumber {
        field: &'static str,
        value: String,
    },
    UnknownState(String),
}

impl std::fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotError::MissingField(field) => {
                write!(f, "playback payload missing field {field:?}")
            }
            SnapshotError::BadNumber { field, value } => {
                write!(f, "playback field {field:?} is not a number: {value:?}")
            }
            SnapshotError::UnknownState(code) => {
                write!(f, "unknown playback state code {code:?}")
            }
        }
    }
}

impl std::error::Error for SnapshotError {}

// ---------------------------------------------------------------------------
// Playback state
// ---------------------------------------------------------------------------

/// Player state codes used by the lounge protocol. The wire sends these as
/// strings; they are converted here, at the parse boundary, and never
/// propagated as raw strings into scheduling logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    StartPlaying,
    Stopped,
    Playing,
    Paused,
    Buffering,
}

impl PlaybackState {
    pub fn from_code(code: &str) -> Result<Self> {
        match code {
            "-1" => Ok(PlaybackState::StartPlaying),
            "0" => Ok(PlaybackState::Stopped),
            "1" => Ok(PlaybackState::Playing),
            "2" => Ok(PlaybackState::Paused),
            "3" => Ok(PlaybackState::Buffering),
            other => Err(SnapshotError::UnknownState(other.to_owned())),
        }
    }

}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PlaybackState::StartPlaying => "start-playing",
            PlaybackState::Stopped => "stopped",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
            PlaybackState::Buffering => "buffering",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// One parsed playback-state event, replaced wholesale on every full
/// `nowPlaying` / `onStateChange` payload.
#[derive(Debug, Clone)]
pub struct PlaybackSnapshot {
    pub video_id: Option<String>,
    pub current_time: f64,
    pub duration: f64,
    pub loaded_time: f64,
    pub state: PlaybackState,
    pub seekable_start: f64,
    pub seekable_end: f64,
    /// When this payload was observed, for extrapolating the position.
    pub observed_at: Instant,
}

impl PlaybackSnapshot {
    /// Parse a raw event payload. Payloads that only carry a queue id
    /// (`listId`) are "partial" and must be filtered out by the caller
    /// before this runs; here any missing time field is an error.
    pub fn parse(payload: &HashMap<String, String>) -> Result<Self> {
        let state_code = payload
            .get("state")
            .ok_or(SnapshotError::MissingField("state"))?;
        let state = PlaybackState::from_code(state_code)?;

        let snapshot = Self {
            video_id: payload.get("videoId").filter(|v| !v.is_empty()).cloned(),
            current_time: parse_secs(payload, "currentTime")?,
            duration: parse_secs(payload, "duration")?,
            loaded_time: parse_secs(payload, "loadedTime")?,
            state,
            seekable_start: parse_secs(payload, "seekableStartTime")?,
            seekable_end: parse_secs(payload, "seekableEndTime")?,
            observed_at: Instant::now(),
        };

        // Upstream occasionally reports inconsistent ranges. Never fatal.
        if snapshot.seekable_start > snapshot.current_time
            || snapshot.current_time > snapshot.seekable_end
            || snapshot.seekable_end > snapshot.duration
        {
            tracing::warn!(
                "inconsistent playback range: start={} current={} end={} duration={}",
                snapshot.seekable_start,
                snapshot.current_time,
                snapshot.seekable_end,
                snapshot.duration
            );
        }

        Ok(snapshot)
    }

    /// Whether a payload is a "partial" update carrying only a queue id.
    /// Such events never construct or mutate a snapshot.
    pub fn is_partial(payload: &HashMap<String, String>) -> bool {
        payload.len() == 1 && payload.contains_key("listId")
    }

    /// Position extrapolated to now from the observed payload.
    pub fn projected_position(&self) -> f64 {
        self.current_time + self.observed_at.elapsed().as_secs_f64()
    }

    /// Whether the video has logically ended: explicitly stopped, or the
    /// extrapolated position has run past the duration.
    pub fn has_ended(&self) -> bool {
        self.state == PlaybackState::Stopped || self.projected_position() >= self.duration
    }

    /// `m:ss` / `h:mm:ss` rendering for status display.
    pub fn format_time(seconds: f64) -> String {
        let total = seconds.max(0.0) as u64;
        let (hours, rem) = (total / 3600, total % 3600);
        let (minutes, secs) = (rem / 60, rem % 60);

        if hours > 0 {
            format!("{hours}:{minutes:02}:{secs:02}")
        } else {
            format!("{minutes}:{secs:02}")
        }
    }

    pub fn position_str(&self) -> String {
        format!(
            "{} / {}",
            Self::format_time(self.current_time),
            Self::format_time(self.duration)
        )
    }
}

fn parse_secs(payload: &HashMap<String, String>, field: &'static str) -> Result<f64> {
    let raw = payload
        .get(field)
        .ok_or(SnapshotError::MissingField(field))?;
    raw.parse::<f64>().map_err(|_| SnapshotError::BadNumber {
        field,
        value: raw.clone(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
