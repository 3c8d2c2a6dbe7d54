use async_trait::async_trait;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Failure of an external metadata/segment lookup. Always recoverable: the
/// caller logs it and continues with an empty result.
#[derive(Debug, Clone)]
pub enum ProviderError {
    /// Timeout, connection reset, DNS failure, ...
    Network(String),
    /// Non-2xx response from the provider.
    Status(u16),
    /// Top-level response shape was unrecognized.
    Malformed(String),
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Network(msg) => write!(f, "provider network: {msg}"),
            ProviderError::Status(code) => write!(f, "provider returned status {code}"),
            ProviderError::Malformed(msg) => write!(f, "provider payload: {msg}"),
        }
    }
}

impl std::error::Error for ProviderError {}

// ---------------------------------------------------------------------------
// Video metadata
// ---------------------------------------------------------------------------

/// Extended metadata for a video, fetched out-of-band from the playback
/// events. Consumed by the UI layer; the engine itself only needs the
/// channel id for whitelist checks.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoMetadata {
    pub video_id: String,
    pub title: String,
    pub channel_id: String,
    pub channel_title: String,
}

// ---------------------------------------------------------------------------
// Collaborator interfaces
// ---------------------------------------------------------------------------

/// Sponsor-segment source (SponsorBlock-shaped).
///
/// Returns raw, loosely-typed records: the resolver decodes each one
/// tolerantly and skips malformed entries. Records for other videos may be
/// present (hash-prefix lookups return neighbors) and are filtered out by
/// the caller.
#[async_trait]
pub trait SegmentProvider: Send + Sync {
    async fn fetch(&self, video_id: &str) -> Result<Vec<serde_json::Value>>;
}

/// Video metadata source (YouTube Data API-shaped).
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn get_video(&self, video_id: &str) -> Result<Option<VideoMetadata>>;

    async fn get_channel_id(&self, video_id: &str) -> Result<Option<String>>;
}

/// Channel whitelist: videos from these channels are never skipped.
pub trait ChannelAllowList: Send + Sync {
    fn contains(&self, channel_id: &str) -> bool;

    /// True when the list is empty and lookups can be skipped entirely.
    fn is_empty(&self) -> bool;
}

/// Fire-and-forget "segment was skipped" notification back to the segment
/// source, so contributors get view credit. Failures are logged, never
/// retried.
#[async_trait]
pub trait ViewedSegmentReporter: Send + Sync {
    async fn report(&self, ids: &[String]) -> Result<()>;
}
