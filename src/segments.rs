use std::sync::Arc;

use serde::Deserialize;
use tokio::time::{timeout, Duration};

use crate::cache::{AsyncCache, CacheValue};
use crate::providers::{ChannelAllowList, MetadataProvider, ProviderError, SegmentProvider};

/// Adjacent output segments closer than this are merged into one skip.
const PROXIMITY_MERGE_GAP: f64 = 1.0;
/// Bound on every provider/metadata network call so a stuck request can
/// never wedge a device's event pipeline.
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

const SEGMENT_CACHE_CAPACITY: usize = 50;
const SEGMENT_CACHE_TTL: Duration = Duration::from_secs(300);
const WHITELIST_CACHE_CAPACITY: usize = 100;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ResolveError {
    /// The provider call exceeded the fetch timeout.
    Timeout,
    Provider(ProviderError),
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveError::Timeout => write!(f, "segment fetch timed out"),
            ResolveError::Provider(e) => write!(f, "segment fetch: {e}"),
        }
    }
}

impl std::error::Error for ResolveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ResolveError::Provider(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProviderError> for ResolveError {
    fn from(e: ProviderError) -> Self {
        ResolveError::Provider(e)
    }
}

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

/// A time range to skip, with the provenance ids of every source record
/// that was merged into it.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub ids: Vec<String>,
}

impl Segment {
    pub fn length(&self) -> f64 {
        self.end - self.start
    }
}

/// The resolved skip list for one video: start-sorted, non-overlapping,
/// with gaps of at least the proximity threshold between segments.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentSet {
    pub segments: Vec<Segment>,
    /// True when every contributing record was locked, meaning the result
    /// is stable and can be cached without time-based expiry.
    pub skip_ttl_ok: bool,
}

impl SegmentSet {
    pub fn empty() -> Self {
        Self {
            segments: Vec::new(),
            skip_ttl_ok: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// One raw provider record. Extra fields are ignored; a record that fails
/// to decode is skipped, never fatal to the whole lookup.
#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(rename = "videoID")]
    video_id: String,
    /// `[start, end]` in seconds.
    segment: [f64; 2],
    #[serde(rename = "UUID")]
    uuid: String,
    #[serde(default)]
    locked: i64,
}

// ---------------------------------------------------------------------------
// Merge algorithm
// ---------------------------------------------------------------------------

struct MergeRecord {
    start: f64,
    end: f64,
    uuid: String,
    locked: bool,
}

/// Coalesce raw records into the final skip list.
///
/// Two quadratic extension passes (end-extension over an end-sorted list,
/// then start-extension over a start-sorted list) fully absorb any chain of
/// overlapping or touching intervals regardless of input order. The walk
/// then merges near-adjacent outputs (< 1s gap) and drops segments not
/// strictly longer than `minimum_skip_length`.
///
/// Returns the segments plus whether every input record was locked.
fn merge_records(mut records: Vec<MergeRecord>, minimum_skip_length: f64) -> (Vec<Segment>, bool) {
    records.sort_by(|a, b| a.end.total_cmp(&b.end));
    for i in 0..records.len() {
        for j in (i + 1)..records.len() {
            if records[j].start <= records[i].end {
                records[i].end = records[i].end.max(records[j].end);
            }
        }
    }

    records.sort_by(|a, b| a.start.total_cmp(&b.start));
    for i in (0..records.len()).rev() {
        for j in (0..i).rev() {
            if records[j].end >= records[i].start {
                records[i].start = records[i].start.min(records[j].start);
            }
        }
    }

    let mut all_locked = true;
    let mut segments: Vec<Segment> = Vec::new();

    for record in records {
        all_locked = all_locked && record.locked;

        if let Some(last) = segments.last_mut() {
            if record.start - last.end < PROXIMITY_MERGE_GAP {
                last.end = last.end.max(record.end);
                last.ids.push(record.uuid);
                continue;
            }
        }

        segments.push(Segment {
            start: record.start,
            end: record.end,
            ids: vec![record.uuid],
        });
    }

    segments.retain(|s| {
        let keep = s.length() > minimum_skip_length;
        if !keep {
            tracing::info!(
                "dropping segment {:.1}-{:.1}: shorter than minimum skip length {:.1}",
                s.start,
                s.end,
                minimum_skip_length
            );
        }
        keep
    });

    (segments, all_locked)
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Fetches, merges and filters sponsor segments per video id. Cheap to
/// clone; a single instance (with its caches) is shared by every device
/// session, since segments are per-video, not per-device.
#[derive(Clone)]
pub struct SegmentResolver {
    provider: Arc<dyn SegmentProvider>,
    metadata: Arc<dyn MetadataProvider>,
    allowlist: Arc<dyn ChannelAllowList>,
    segment_cache: Arc<AsyncCache<SegmentSet>>,
    whitelist_cache: Arc<AsyncCache<bool>>,
    minimum_skip_length: f64,
}

impl SegmentResolver {
    pub fn new(
        provider: Arc<dyn SegmentProvider>,
        metadata: Arc<dyn MetadataProvider>,
        allowlist: Arc<dyn ChannelAllowList>,
        minimum_skip_length: f64,
    ) -> Self {
        Self {
            provider,
            metadata,
            allowlist,
            segment_cache: Arc::new(AsyncCache::new(
                SEGMENT_CACHE_CAPACITY,
                Some(SEGMENT_CACHE_TTL),
            )),
            whitelist_cache: Arc::new(AsyncCache::new(WHITELIST_CACHE_CAPACITY, None)),
            minimum_skip_length,
        }
    }

    /// Resolve the skip list for a video. Never fails: lookup errors are
    /// logged and come back as an empty set, which is not cached — the
    /// retry decision belongs to the caller's next playback update.
    pub async fn get_segments(&self, video_id: &str) -> SegmentSet {
        let result = self
            .segment_cache
            .get_or_compute(video_id, || {
                let resolver = self.clone();
                let video_id = video_id.to_owned();
                async move { resolver.resolve(&video_id).await }
            })
            .await;

        match result {
            Ok(set) => set,
            Err(e) => {
                tracing::error!("segment lookup for {video_id} failed: {e}");
                SegmentSet::empty()
            }
        }
    }

    async fn resolve(&self, video_id: &str) -> Result<CacheValue<SegmentSet>, ResolveError> {
        if self.is_whitelisted(video_id).await {
            tracing::debug!("channel for {video_id} is whitelisted, skipping nothing");
            return Ok(CacheValue::permanent(SegmentSet::empty()));
        }

        let raw = timeout(FETCH_TIMEOUT, self.provider.fetch(video_id))
            .await
            .map_err(|_| ResolveError::Timeout)??;

        let mut records = Vec::new();
        for value in raw {
            let record: RawRecord = match serde_json::from_value(value) {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!("skipping malformed segment record: {e}");
                    continue;
                }
            };

            // Hash-prefix lookups return neighboring videos too.
            if record.video_id != video_id {
                continue;
            }

            let [start, end] = record.segment;
            if start >= end {
                tracing::debug!("skipping inverted segment record {start}-{end}");
                continue;
            }

            records.push(MergeRecord {
                start,
                end,
                uuid: record.uuid,
                locked: record.locked == 1,
            });
        }

        let (segments, all_locked) = merge_records(records, self.minimum_skip_length);
        tracing::debug!(
            "resolved {} segment(s) for {video_id} (locked={all_locked})",
            segments.len()
        );

        Ok(CacheValue {
            value: SegmentSet {
                segments,
                skip_ttl_ok: all_locked,
            },
            no_expiry: all_locked,
        })
    }

    /// Whitelist check, cached indefinitely per video id. Unresolvable
    /// channel ids count as not whitelisted.
    async fn is_whitelisted(&self, video_id: &str) -> bool {
        if self.allowlist.is_empty() {
            return false;
        }

        let result = self
            .whitelist_cache
            .get_or_compute(video_id, || {
                let resolver = self.clone();
                let video_id = video_id.to_owned();
                async move {
                    let channel_id = timeout(FETCH_TIMEOUT, resolver.metadata.get_channel_id(&video_id))
                        .await
                        .map_err(|_| ResolveError::Timeout)??;

                    let listed = channel_id
                        .map(|id| resolver.allowlist.contains(&id))
                        .unwrap_or(false);
                    Ok::<_, ResolveError>(CacheValue::permanent(listed))
                }
            })
            .await;

        match result {
            Ok(listed) => listed,
            Err(e) => {
                tracing::warn!("whitelist check for {video_id} failed: {e}");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
