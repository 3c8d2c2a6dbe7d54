use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant};

use crate::config::{Config, DeviceConfig};
use crate::providers::{MetadataProvider, VideoMetadata, ViewedSegmentReporter};
use crate::scheduler::SkipScheduler;
use crate::segments::SegmentResolver;
use crate::snapshot::{PlaybackSnapshot, PlaybackState};
use crate::transport::{LoungeEvent, OutgoingCommand, TransportError, TransportSession};

/// How often the watchdog samples the last-event timestamp.
const WATCHDOG_POLL: Duration = Duration::from_secs(10);
/// The screen sends at least a no-op every 30 seconds; a minute of silence
/// means the subscription is dead even if the stream looks open.
const WATCHDOG_STALE: Duration = Duration::from_secs(60);

/// Remote client names that accept a lounge connection but ignore every
/// command. Connecting to one of these wedges the session, so it is
/// force-disconnected instead.
const CLIENT_BLACKLIST: &[&str] = &["TVHTML5_FOR_KIDS"];

pub type Result<T> = std::result::Result<T, SessionError>;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum SessionError {
    Transport(TransportError),
    /// The pairing/auth expired. Terminal: the supervisor must re-pair.
    AuthExpired,
    /// The event stream closed; transient, reconnect upstream.
    SubscriptionClosed,
    /// No event of any kind within the staleness threshold; transient.
    WatchdogTimeout,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Transport(e) => write!(f, "session transport: {e}"),
            SessionError::AuthExpired => write!(f, "session: auth expired"),
            SessionError::SubscriptionClosed => write!(f, "session: subscription closed"),
            SessionError::WatchdogTimeout => write!(f, "session: watchdog timeout"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::AuthExpired => SessionError::AuthExpired,
            other => SessionError::Transport(other),
        }
    }
}

/// Commands are fire-and-forget from the session loop's point of view: a
/// failed send is logged and playback control continues. Only an auth
/// expiry tears the session down.
fn check_command(result: crate::transport::Result<()>, what: &str) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(TransportError::AuthExpired) => Err(SessionError::AuthExpired),
        Err(e) => {
            tracing::warn!("{what} command failed: {e}");
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Known events
// ---------------------------------------------------------------------------

/// The closed set of event types the session reacts to. Anything else is
/// logged at debug level and dropped: the protocol grows event types
/// regularly and they must never crash the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownEvent {
    StateChange,
    NowPlaying,
    AdStateChange,
    AdPlaying,
    VolumeChanged,
    AutoplayUpNext,
    LoungeStatus,
    SubtitlesTrackChanged,
    LoungeScreenDisconnected,
    AutoplayModeChanged,
    Unknown,
}

impl KnownEvent {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "onStateChange" => KnownEvent::StateChange,
            "nowPlaying" => KnownEvent::NowPlaying,
            "onAdStateChange" => KnownEvent::AdStateChange,
            "adPlaying" => KnownEvent::AdPlaying,
            "onVolumeChanged" => KnownEvent::VolumeChanged,
            "autoplayUpNext" => KnownEvent::AutoplayUpNext,
            "loungeStatus" => KnownEvent::LoungeStatus,
            "onSubtitlesTrackChanged" => KnownEvent::SubtitlesTrackChanged,
            "loungeScreenDisconnected" => KnownEvent::LoungeScreenDisconnected,
            "onAutoplayModeChanged" => KnownEvent::AutoplayModeChanged,
            _ => KnownEvent::Unknown,
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Local mirror of the screen's volume state, updated from inbound
/// `onVolumeChanged` notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeState {
    pub volume: u32,
    pub muted: bool,
}

/// Cheap-to-clone handle for sending remote commands.
///
/// All sends go through one async mutex guarding the command sequence
/// counter: the remote end requires strictly increasing sequence numbers
/// per session, and concurrent unsynchronized sends corrupt the order.
/// The guard is scoped, so cancellation at any await point can never
/// leave the gate held.
#[derive(Clone)]
pub struct Controller {
    transport: Arc<dyn TransportSession>,
    gate: Arc<Mutex<u64>>,
    volume: Arc<StdMutex<VolumeState>>,
}

impl Controller {
    pub fn new(transport: Arc<dyn TransportSession>) -> Self {
        Self {
            transport,
            gate: Arc::new(Mutex::new(0)),
            volume: Arc::new(StdMutex::new(VolumeState {
                volume: 100,
                muted: false,
            })),
        }
    }

    async fn command(
        &self,
        name: &'static str,
        args: Vec<(String, String)>,
    ) -> crate::transport::Result<()> {
        let mut seq = self.gate.lock().await;
        *seq += 1;
        let command = OutgoingCommand {
            seq: *seq,
            name,
            args,
        };
        tracing::debug!("sending {name} (seq={})", command.seq);
        self.transport.send_command(command).await
    }

    pub async fn set_volume(&self, volume: u32) -> crate::transport::Result<()> {
        let volume = volume.min(100);
        self.command("setVolume", vec![("volume".into(), volume.to_string())])
            .await
    }

    /// Mute or unmute. A no-op unless `override_state` is set or the
    /// mirrored state actually differs, since unmuting resends the current
    /// volume and redundant sends are worth avoiding.
    pub async fn mute(&self, mute: bool, override_state: bool) -> crate::transport::Result<()> {
        let volume = {
            let mut state = self.volume.lock().expect("volume state lock poisoned");
            if !override_state && state.muted == mute {
                return Ok(());
            }
            state.muted = mute;
            state.volume
        };

        self.command(
            "setVolume",
            vec![
                ("volume".into(), volume.to_string()),
                ("muted".into(), bool_str(mute).into()),
            ],
        )
        .await
    }

    pub async fn play_video(&self, video_id: &str) -> crate::transport::Result<()> {
        self.command("setPlaylist", vec![("videoId".into(), video_id.to_owned())])
            .await
    }

    pub async fn seek_to(&self, position: f64) -> crate::transport::Result<()> {
        self.command("seekTo", vec![("newTime".into(), fmt_secs(position))])
            .await
    }

    pub async fn skip_ad(&self) -> crate::transport::Result<()> {
        self.command("skipAd", Vec::new()).await
    }

    pub async fn set_autoplay_mode(&self, enabled: bool) -> crate::transport::Result<()> {
        let mode = if enabled { "ENABLED" } else { "DISABLED" };
        self.command("setAutoplayMode", vec![("autoplayMode".into(), mode.into())])
            .await
    }

    pub fn volume_state(&self) -> VolumeState {
        *self.volume.lock().expect("volume state lock poisoned")
    }

    fn set_volume_state(&self, volume: u32, muted: bool) {
        let mut state = self.volume.lock().expect("volume state lock poisoned");
        state.volume = volume;
        state.muted = muted;
    }
}

fn bool_str(val: bool) -> &'static str {
    if val {
        "true"
    } else {
        "false"
    }
}

/// Format seconds the way the wire expects: `"191"` not `"191.000"`,
/// `"42.5"` stays fractional.
fn fmt_secs(val: f64) -> String {
    if val.fract() == 0.0 {
        format!("{}", val as i64)
    } else {
        format!("{val}")
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One device's lounge session: the event-dispatch state machine, the
/// staleness watchdog and the skip pipeline.
///
/// The session is the sole owner of its playback state. It is only mutated
/// from `subscribe()`'s dispatch loop, so events from one device are
/// processed strictly in arrival order.
pub struct LoungeSession {
    device: DeviceConfig,
    config: Arc<Config>,
    transport: Arc<dyn TransportSession>,
    resolver: SegmentResolver,
    metadata: Arc<dyn MetadataProvider>,
    controller: Controller,
    scheduler: SkipScheduler,

    paused: bool,
    /// Set when we mute for an ad, so only our own mutes get undone.
    auto_muted: bool,
    /// Set when the screen disconnected to play short-form content; the
    /// next subtitles-track change means main playback resumed.
    shorts_disconnected: bool,

    current_video: Option<PlaybackSnapshot>,
    current_metadata: Arc<StdMutex<Option<VideoMetadata>>>,
    video_tx: watch::Sender<Option<PlaybackSnapshot>>,

    playstatus_task: Option<JoinHandle<()>>,
    metadata_task: Option<JoinHandle<()>>,
}

impl LoungeSession {
    pub fn new(
        device: DeviceConfig,
        config: Arc<Config>,
        transport: Arc<dyn TransportSession>,
        resolver: SegmentResolver,
        metadata: Arc<dyn MetadataProvider>,
        reporter: Arc<dyn ViewedSegmentReporter>,
    ) -> Self {
        let controller = Controller::new(Arc::clone(&transport));
        let scheduler = SkipScheduler::new(
            controller.clone(),
            reporter,
            device.offset_secs(),
            config.skip_count_tracking,
        );
        let (video_tx, _) = watch::channel(None);

        Self {
            device,
            config,
            transport,
            resolver,
            metadata,
            controller,
            scheduler,
            paused: false,
            auto_muted: false,
            shorts_disconnected: false,
            current_video: None,
            current_metadata: Arc::new(StdMutex::new(None)),
            video_tx,
            playstatus_task: None,
            metadata_task: None,
        }
    }

    pub fn device(&self) -> &DeviceConfig {
        &self.device
    }

    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    pub fn transport(&self) -> Arc<dyn TransportSession> {
        Arc::clone(&self.transport)
    }

    pub fn controller(&self) -> Controller {
        self.controller.clone()
    }

    pub fn current_video(&self) -> Option<PlaybackSnapshot> {
        self.current_video.clone()
    }

    pub fn current_metadata(&self) -> Option<VideoMetadata> {
        self.current_metadata
            .lock()
            .expect("metadata lock poisoned")
            .clone()
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    /// Subscribe to "current video changed" notifications.
    pub fn video_updates(&self) -> watch::Receiver<Option<PlaybackSnapshot>> {
        self.video_tx.subscribe()
    }

    /// Run the subscription until it drops, goes stale or hits a terminal
    /// error. The caller owns reconnection; awaiting the previous call
    /// before starting a new one is what guarantees a single active
    /// subscription per device.
    pub async fn subscribe(&mut self) -> Result<()> {
        let mut events = self.transport.subscribe().await?;
        tracing::info!("[{}] subscribed to lounge", self.device.name);

        let mut last_event = Instant::now();
        let mut staleness = interval(WATCHDOG_POLL);
        staleness.tick().await; // first tick completes immediately

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => {
                            last_event = Instant::now();
                            self.dispatch(event).await?;
                        }
                        None => {
                            tracing::info!("[{}] event stream closed", self.device.name);
                            return Err(SessionError::SubscriptionClosed);
                        }
                    }
                }
                _ = staleness.tick() => {
                    if last_event.elapsed() >= WATCHDOG_STALE {
                        tracing::warn!(
                            "[{}] no events for {}s, forcing resubscribe",
                            self.device.name,
                            last_event.elapsed().as_secs()
                        );
                        return Err(SessionError::WatchdogTimeout);
                    }
                }
            }
        }
    }

    /// Tear down background tasks and the transport. Idempotent.
    pub async fn close(&mut self) {
        if let Some(task) = self.playstatus_task.take() {
            task.abort();
        }
        if let Some(task) = self.metadata_task.take() {
            task.abort();
        }
        self.scheduler.cancel();
        self.current_video = None;
        let _ = self.video_tx.send(None);
        self.transport.close().await;
    }

    // -- event dispatch ----------------------------------------------------

    async fn dispatch(&mut self, event: LoungeEvent) -> Result<()> {
        let LoungeEvent {
            event_type,
            payload,
        } = event;

        match KnownEvent::from_type(&event_type) {
            KnownEvent::StateChange | KnownEvent::NowPlaying => {
                self.on_playback_event(&payload).await
            }
            KnownEvent::AdStateChange => self.on_ad_state_change(&payload).await,
            KnownEvent::AdPlaying => self.on_ad_playing(&payload).await,
            KnownEvent::VolumeChanged => {
                self.on_volume_changed(&payload);
                Ok(())
            }
            KnownEvent::AutoplayUpNext => {
                if let Some(id) = payload.get("videoId").filter(|v| !v.is_empty()) {
                    self.prefetch_segments(id);
                }
                Ok(())
            }
            KnownEvent::LoungeStatus => {
                self.on_lounge_status(&payload);
                Ok(())
            }
            KnownEvent::SubtitlesTrackChanged => self.on_subtitles_track_changed(&payload).await,
            KnownEvent::LoungeScreenDisconnected => {
                self.on_screen_disconnected(&payload);
                Ok(())
            }
            KnownEvent::AutoplayModeChanged => {
                // Re-assert our configured preference; idempotent.
                check_command(
                    self.controller.set_autoplay_mode(self.config.autoplay).await,
                    "setAutoplayMode",
                )
            }
            KnownEvent::Unknown => {
                tracing::debug!("unhandled lounge event: {event_type} args={payload:?}");
                Ok(())
            }
        }
    }

    async fn on_playback_event(&mut self, payload: &HashMap<String, String>) -> Result<()> {
        if PlaybackSnapshot::is_partial(payload) {
            tracing::debug!("ignoring partial playback update (queue id only)");
            return Ok(());
        }

        if payload.is_empty() {
            self.current_video = None;
            *self
                .current_metadata
                .lock()
                .expect("metadata lock poisoned") = None;
            let _ = self.video_tx.send(None);
            self.scheduler.cancel();
            return Ok(());
        }

        match payload.get("state").map(String::as_str) {
            Some("2") => self.paused = true,
            Some("-1") | Some("1") => self.paused = false,
            _ => {}
        }

        let snapshot = match PlaybackSnapshot::parse(payload) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("dropping malformed playback event: {e}");
                return Ok(());
            }
        };

        tracing::debug!(
            "[{}] playback update: {} {} at {}",
            self.device.name,
            snapshot.video_id.as_deref().unwrap_or("<none>"),
            snapshot.state,
            snapshot.position_str()
        );

        self.current_video = Some(snapshot.clone());
        let _ = self.video_tx.send(Some(snapshot.clone()));
        self.refresh_metadata(snapshot.video_id.clone());

        // The ad is over once real content reports itself playing.
        if snapshot.state == PlaybackState::Playing {
            self.unmute_after_ad().await?;
        }

        self.schedule_skips(snapshot);
        Ok(())
    }

    async fn on_ad_state_change(&mut self, payload: &HashMap<String, String>) -> Result<()> {
        let ad_state = payload.get("adState").map(String::as_str).unwrap_or("");
        let skippable = payload.get("isSkipEnabled").map(String::as_str) == Some("true");

        if ad_state == "0" {
            self.unmute_after_ad().await
        } else if self.config.skip_ads && skippable {
            self.skip_current_ad().await
        } else if self.config.mute_ads {
            self.mute_for_ad().await
        } else {
            Ok(())
        }
    }

    async fn on_ad_playing(&mut self, payload: &HashMap<String, String>) -> Result<()> {
        let skippable = payload.get("isSkipEnabled").map(String::as_str) == Some("true");

        if let Some(id) = payload.get("contentVideoId").filter(|v| !v.is_empty()) {
            // The upcoming main video is known: resolve its segments now so
            // the first playback update can skip without a fetch round-trip.
            self.prefetch_segments(id);
            Ok(())
        } else if self.config.skip_ads && skippable {
            self.skip_current_ad().await
        } else if self.config.mute_ads {
            self.mute_for_ad().await
        } else {
            Ok(())
        }
    }

    fn on_volume_changed(&mut self, payload: &HashMap<String, String>) {
        // Inbound notification only; never echo a command back.
        let volume = payload
            .get("volume")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or_else(|| self.controller.volume_state().volume);
        let muted = payload.get("muted").map(String::as_str) == Some("true");

        tracing::debug!(
            "[{}] volume changed: {volume} muted={muted}",
            self.device.name
        );
        self.controller.set_volume_state(volume, muted);
    }

    fn on_lounge_status(&mut self, payload: &HashMap<String, String>) {
        let Some(devices_json) = payload.get("devices") else {
            return;
        };

        let devices: Vec<serde_json::Value> = match serde_json::from_str(devices_json) {
            Ok(devices) => devices,
            Err(e) => {
                tracing::debug!("unparseable loungeStatus device list: {e}");
                return;
            }
        };

        for device in devices {
            if device.get("type").and_then(|t| t.as_str()) != Some("LOUNGE_SCREEN") {
                continue;
            }

            // deviceInfo is a JSON document embedded as a string.
            let client_name = device
                .get("deviceInfo")
                .and_then(|v| v.as_str())
                .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
                .and_then(|info| {
                    info.get("clientName")
                        .and_then(|c| c.as_str())
                        .map(str::to_owned)
                });

            if let Some(name) = client_name {
                if CLIENT_BLACKLIST.contains(&name.as_str()) {
                    tracing::warn!(
                        "[{}] screen client {name:?} cannot be driven remotely, \
                         dropping session to restart pairing",
                        self.device.name
                    );
                    self.transport.clear_session();
                }
            }
        }
    }

    async fn on_subtitles_track_changed(
        &mut self,
        payload: &HashMap<String, String>,
    ) -> Result<()> {
        if !(self.shorts_disconnected && self.config.handle_shorts) {
            return Ok(());
        }

        self.shorts_disconnected = false;
        if let Some(id) = payload.get("videoId").filter(|v| !v.is_empty()) {
            tracing::info!(
                "[{}] main content resumed after shorts, replaying {id}",
                self.device.name
            );
            return check_command(self.controller.play_video(id).await, "setPlaylist");
        }
        Ok(())
    }

    fn on_screen_disconnected(&mut self, payload: &HashMap<String, String>) {
        let reason = payload.get("reason").map(String::as_str).unwrap_or("");
        if reason == "disconnectedByUserScreenInitiated" && self.config.handle_shorts {
            tracing::debug!(
                "[{}] screen disconnect looks shorts-initiated, waiting for resume",
                self.device.name
            );
            self.shorts_disconnected = true;
        }
    }

    // -- reactions ---------------------------------------------------------

    async fn unmute_after_ad(&mut self) -> Result<()> {
        if !self.auto_muted {
            return Ok(());
        }
        self.auto_muted = false;
        tracing::info!("[{}] ad has ended, unmuting", self.device.name);
        check_command(self.controller.mute(false, true).await, "unmute")
    }

    async fn skip_current_ad(&mut self) -> Result<()> {
        tracing::info!("[{}] ad can be skipped, skipping", self.device.name);
        check_command(self.controller.skip_ad().await, "skipAd")?;
        self.unmute_after_ad().await
    }

    async fn mute_for_ad(&mut self) -> Result<()> {
        tracing::info!("[{}] ad has started, muting", self.device.name);
        self.auto_muted = true;
        check_command(self.controller.mute(true, true).await, "mute")
    }

    /// Resolve segments for the snapshot's video and feed the scheduler.
    /// Runs as a cancellable task: a newer playback update supersedes any
    /// lookup still in flight.
    fn schedule_skips(&mut self, snapshot: PlaybackSnapshot) {
        if let Some(task) = self.playstatus_task.take() {
            task.abort();
        }
        // The previous timer must die with the update that supersedes it,
        // not when the new lookup eventually completes: a segment fetch can
        // stall for seconds, and a stale seek firing into the new video in
        // the meantime is exactly the race the per-update cancel exists to
        // prevent.
        self.scheduler.cancel();

        let Some(video_id) = snapshot.video_id.clone() else {
            return;
        };

        let resolver = self.resolver.clone();
        let scheduler = self.scheduler.clone();
        let device_name = self.device.name.clone();

        self.playstatus_task = Some(tokio::spawn(async move {
            let set = resolver.get_segments(&video_id).await;
            if snapshot.state == PlaybackState::Playing {
                tracing::info!(
                    "[{device_name}] playing {video_id} with {} skippable segment(s)",
                    set.segments.len()
                );
            }
            scheduler.on_playback_update(&snapshot, &set.segments);
        }));
    }

    /// Fire-and-forget segment resolution so the result is cached before
    /// the video starts.
    fn prefetch_segments(&self, video_id: &str) {
        tracing::info!("[{}] prefetching segments for {video_id}", self.device.name);
        let resolver = self.resolver.clone();
        let video_id = video_id.to_owned();
        tokio::spawn(async move {
            let _ = resolver.get_segments(&video_id).await;
        });
    }

    /// Asynchronously refresh extended metadata for the current video.
    fn refresh_metadata(&mut self, video_id: Option<String>) {
        if let Some(task) = self.metadata_task.take() {
            task.abort();
        }

        let Some(video_id) = video_id else {
            return;
        };

        let metadata = Arc::clone(&self.metadata);
        let slot = Arc::clone(&self.current_metadata);
        self.metadata_task = Some(tokio::spawn(async move {
            match metadata.get_video(&video_id).await {
                Ok(video) => {
                    *slot.lock().expect("metadata lock poisoned") = video;
                }
                Err(e) => {
                    tracing::debug!("metadata refresh for {video_id} failed: {e}");
                }
            }
        }));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
