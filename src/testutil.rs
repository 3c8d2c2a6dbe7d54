//! Shared in-memory fakes for session, scheduler and supervisor tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Duration;

use crate::providers::{self, ProviderError, SegmentProvider, ViewedSegmentReporter};
use crate::transport::{self, LoungeEvent, OutgoingCommand, TransportSession};

/// Scriptable transport: tests queue up event streams with `push_stream`
/// and inspect every command sent through it.
pub struct FakeTransport {
    pub commands: Mutex<Vec<OutgoingCommand>>,
    pub cleared: AtomicBool,
    pub closed: AtomicBool,
    pub pair_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub connect_calls: AtomicUsize,
    linked: AtomicBool,
    connected: AtomicBool,
    available: AtomicBool,
    streams: Mutex<VecDeque<mpsc::Receiver<LoungeEvent>>>,
    subscribe_errors: Mutex<VecDeque<transport::TransportError>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            commands: Mutex::new(Vec::new()),
            cleared: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            pair_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            connect_calls: AtomicUsize::new(0),
            linked: AtomicBool::new(true),
            connected: AtomicBool::new(true),
            available: AtomicBool::new(true),
            streams: Mutex::new(VecDeque::new()),
            subscribe_errors: Mutex::new(VecDeque::new()),
        })
    }

    /// Queue an event stream for the next `subscribe` call; returns the
    /// sender side for the test to feed events through.
    pub fn push_stream(&self) -> mpsc::Sender<LoungeEvent> {
        let (tx, rx) = mpsc::channel(16);
        self.streams.lock().expect("lock").push_back(rx);
        tx
    }

    pub fn set_linked(&self, linked: bool) {
        self.linked.store(linked, Ordering::SeqCst);
    }

    /// Make the next `subscribe` call fail with the given error before any
    /// scripted stream is consumed.
    pub fn fail_next_subscribe(&self, err: transport::TransportError) {
        self.subscribe_errors.lock().expect("lock").push_back(err);
    }

    pub fn command_log(&self) -> Vec<(String, Vec<(String, String)>)> {
        self.commands
            .lock()
            .expect("lock")
            .iter()
            .map(|c| (c.name.to_owned(), c.args.clone()))
            .collect()
    }

    pub fn commands_named(&self, name: &str) -> Vec<OutgoingCommand> {
        self.commands
            .lock()
            .expect("lock")
            .iter()
            .filter(|c| c.name == name)
            .cloned()
            .collect()
    }

    pub fn streams_remaining(&self) -> usize {
        self.streams.lock().expect("lock").len()
    }
}

#[async_trait]
impl TransportSession for FakeTransport {
    async fn pair(&self, _screen_id: &str, _screen_name: &str) -> transport::Result<()> {
        self.pair_calls.fetch_add(1, Ordering::SeqCst);
        self.linked.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn refresh_auth(&self) -> transport::Result<()> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.linked.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn linked(&self) -> bool {
        self.linked.load(Ordering::SeqCst)
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn is_available(&self) -> transport::Result<bool> {
        Ok(self.available.load(Ordering::SeqCst))
    }

    async fn connect(&self) -> transport::Result<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self) -> transport::Result<mpsc::Receiver<LoungeEvent>> {
        if let Some(err) = self.subscribe_errors.lock().expect("lock").pop_front() {
            return Err(err);
        }
        self.streams
            .lock()
            .expect("lock")
            .pop_front()
            .ok_or_else(|| transport::TransportError::Network("no scripted stream".into()))
    }

    async fn send_command(&self, command: OutgoingCommand) -> transport::Result<()> {
        self.commands.lock().expect("lock").push(command);
        Ok(())
    }

    fn clear_session(&self) {
        self.cleared.store(true, Ordering::SeqCst);
        self.linked.store(false, Ordering::SeqCst);
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Records every reported provenance id.
pub struct FakeReporter {
    pub reported: Mutex<Vec<String>>,
}

impl FakeReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            reported: Mutex::new(Vec::new()),
        })
    }

    pub fn reported_ids(&self) -> Vec<String> {
        self.reported.lock().expect("lock").clone()
    }
}

#[async_trait]
impl ViewedSegmentReporter for FakeReporter {
    async fn report(&self, ids: &[String]) -> providers::Result<()> {
        self.reported.lock().expect("lock").extend_from_slice(ids);
        Ok(())
    }
}

/// Serves a fixed record list for every video id.
pub struct FixedSegmentProvider {
    pub records: Vec<serde_json::Value>,
    pub calls: AtomicUsize,
    fail: AtomicBool,
    delay: Mutex<Duration>,
}

impl FixedSegmentProvider {
    pub fn new(records: Vec<serde_json::Value>) -> Arc<Self> {
        Arc::new(Self {
            records,
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            records: Vec::new(),
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(true),
            delay: Mutex::new(Duration::ZERO),
        })
    }

    /// Stall subsequent fetches by `delay` before responding.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().expect("lock") = delay;
    }

    pub fn segment_record(video_id: &str, start: f64, end: f64, uuid: &str) -> serde_json::Value {
        serde_json::json!({
            "videoID": video_id,
            "segment": [start, end],
            "UUID": uuid,
            "locked": 0,
        })
    }
}

#[async_trait]
impl SegmentProvider for FixedSegmentProvider {
    async fn fetch(&self, _video_id: &str) -> providers::Result<Vec<serde_json::Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().expect("lock");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProviderError::Status(503));
        }
        Ok(self.records.clone())
    }
}

/// Metadata source that knows nothing; whitelist checks resolve to false.
pub struct NullMetadata;

#[async_trait]
impl providers::MetadataProvider for NullMetadata {
    async fn get_video(
        &self,
        _video_id: &str,
    ) -> providers::Result<Option<providers::VideoMetadata>> {
        Ok(None)
    }

    async fn get_channel_id(&self, _video_id: &str) -> providers::Result<Option<String>> {
        Ok(None)
    }
}

/// An always-empty channel whitelist.
pub struct NoAllowList;

impl providers::ChannelAllowList for NoAllowList {
    fn contains(&self, _channel_id: &str) -> bool {
        false
    }

    fn is_empty(&self) -> bool {
        true
    }
}
