//! Keeps device sessions alive: pairing, reconnection and periodic auth
//! refresh, each device driven by its own task.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::lounge::{LoungeSession, SessionError};
use crate::transport::TransportSession;

/// Delay between retries of any failed transport operation.
const RETRY_DELAY: Duration = Duration::from_secs(10);
/// Lounge tokens live for days but go stale quietly; a daily refresh keeps
/// the pairing warm.
const AUTH_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60 * 24);

/// Owns the per-device tasks and the shared shutdown signal.
///
/// `start()` spawns a run loop (pair, connect, subscribe, repeat) and an
/// auth-refresh loop for the session. `close()` flips the shutdown flag and
/// joins every task, closing each session on its way out.
pub struct DeviceSupervisor {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl DeviceSupervisor {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    /// Take ownership of a session and keep it connected until shutdown.
    pub fn start(&mut self, session: LoungeSession) {
        let transport = session.transport();
        self.tasks.push(tokio::spawn(refresh_auth_loop(
            transport,
            self.shutdown_tx.subscribe(),
        )));
        self.tasks.push(tokio::spawn(run_loop(
            session,
            self.shutdown_tx.subscribe(),
        )));
    }

    pub fn device_count(&self) -> usize {
        self.tasks.len() / 2
    }

    /// Signal shutdown and wait for every device task to finish.
    pub async fn close(mut self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Default for DeviceSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

async fn run_loop(mut session: LoungeSession, mut shutdown: watch::Receiver<bool>) {
    drive(&mut session, &mut shutdown).await;
    tracing::info!("[{}] shutting down", session.device().name);
    session.close().await;
}

/// The reconnect cycle for one device. Only returns on shutdown.
async fn drive(session: &mut LoungeSession, shutdown: &mut watch::Receiver<bool>) {
    let transport = session.transport();
    let config = session.config();
    let device_name = session.device().name.clone();
    let screen_id = session.device().screen_id.clone();

    loop {
        if *shutdown.borrow() {
            return;
        }

        // Stage 1: pairing. Loops until the transport reports linked.
        while !transport.linked() {
            tracing::info!("[{device_name}] not linked, pairing with screen");
            if let Err(e) = transport.pair(&screen_id, &config.device_name).await {
                tracing::warn!("[{device_name}] pairing failed: {e}");
                if idle(shutdown, RETRY_DELAY).await {
                    return;
                }
            }
        }

        // Stage 2: reachability and connection.
        match transport.is_available().await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("[{device_name}] screen not available, waiting");
                if idle(shutdown, RETRY_DELAY).await {
                    return;
                }
                continue;
            }
            Err(e) => {
                tracing::warn!("[{device_name}] availability check failed: {e}");
                if idle(shutdown, RETRY_DELAY).await {
                    return;
                }
                continue;
            }
        }

        if !transport.connected() {
            if let Err(e) = transport.connect().await {
                tracing::warn!("[{device_name}] connect failed: {e}");
                if idle(shutdown, RETRY_DELAY).await {
                    return;
                }
                continue;
            }
        }

        // Stage 3: run the subscription until it ends.
        let result = tokio::select! {
            result = session.subscribe() => result,
            _ = shutdown.changed() => return,
        };

        match result {
            // Clean end: the session dropped itself on purpose (e.g. an
            // undriveable client). Start over from pairing.
            Ok(()) => {}
            Err(SessionError::AuthExpired) => {
                tracing::warn!("[{device_name}] auth expired, clearing session to re-pair");
                transport.clear_session();
            }
            Err(SessionError::SubscriptionClosed) | Err(SessionError::WatchdogTimeout) => {
                tracing::info!("[{device_name}] subscription ended, reconnecting");
            }
            Err(SessionError::Transport(e)) => {
                tracing::warn!("[{device_name}] transport error: {e}");
                if idle(shutdown, RETRY_DELAY).await {
                    return;
                }
            }
        }
    }
}

/// Refresh the lounge auth once a day so the pairing never silently rots.
async fn refresh_auth_loop(
    transport: Arc<dyn TransportSession>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if idle(&mut shutdown, AUTH_REFRESH_INTERVAL).await {
            return;
        }
        if let Err(e) = transport.refresh_auth().await {
            tracing::warn!("auth refresh failed, will retry next cycle: {e}");
            if idle(&mut shutdown, RETRY_DELAY).await {
                return;
            }
        }
    }
}

/// Shutdown-aware sleep. Returns true when shutdown fired during the wait.
async fn idle(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DeviceConfig};
    use crate::segments::SegmentResolver;
    use crate::testutil::{
        FakeReporter, FakeTransport, FixedSegmentProvider, NoAllowList, NullMetadata,
    };
    use crate::transport::{LoungeEvent, TransportError};
    use std::sync::atomic::Ordering;
    use tokio::time::advance;

    fn session(transport: &Arc<FakeTransport>) -> LoungeSession {
        let resolver = SegmentResolver::new(
            FixedSegmentProvider::new(vec![]),
            Arc::new(NullMetadata),
            Arc::new(NoAllowList),
            0.0,
        );
        LoungeSession::new(
            DeviceConfig {
                name: "tv".into(),
                screen_id: "screen-1".into(),
                offset_ms: 0,
            },
            Arc::new(Config::default()),
            Arc::clone(transport) as _,
            resolver,
            Arc::new(NullMetadata),
            FakeReporter::new(),
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pairs_when_not_linked() {
        let transport = FakeTransport::new();
        transport.set_linked(false);
        let tx = transport.push_stream();

        let mut supervisor = DeviceSupervisor::new();
        supervisor.start(session(&transport));
        settle().await;

        assert_eq!(transport.pair_calls.load(Ordering::SeqCst), 1);
        assert!(transport.linked());
        assert_eq!(transport.streams_remaining(), 0);

        drop(tx);
        supervisor.close().await;
        assert!(transport.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribes_after_stream_close() {
        let transport = FakeTransport::new();
        let tx1 = transport.push_stream();
        let tx2 = transport.push_stream();

        let mut supervisor = DeviceSupervisor::new();
        supervisor.start(session(&transport));
        settle().await;
        assert_eq!(transport.streams_remaining(), 1);

        // First subscription dies; the loop must pick up the second stream.
        drop(tx1);
        settle().await;
        assert_eq!(transport.streams_remaining(), 0);

        // The replacement stream is live: events still get dispatched.
        tx2.send(LoungeEvent::new("onVolumeChanged").with_arg("volume", "50"))
            .await
            .expect("send");
        settle().await;

        supervisor.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_expiry_clears_and_repairs() {
        let transport = FakeTransport::new();
        transport.fail_next_subscribe(TransportError::AuthExpired);
        let _tx = transport.push_stream();

        let mut supervisor = DeviceSupervisor::new();
        supervisor.start(session(&transport));
        settle().await;

        assert!(transport.cleared.load(Ordering::SeqCst));
        assert_eq!(transport.pair_calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.streams_remaining(), 0);

        supervisor.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_errors_back_off_before_retry() {
        let transport = FakeTransport::new();
        transport.fail_next_subscribe(TransportError::Network("boom".into()));
        let _tx = transport.push_stream();

        let mut supervisor = DeviceSupervisor::new();
        supervisor.start(session(&transport));
        settle().await;

        // Still backing off: the scripted stream is untouched.
        assert_eq!(transport.streams_remaining(), 1);

        advance(RETRY_DELAY).await;
        settle().await;
        assert_eq!(transport.streams_remaining(), 0);

        supervisor.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_daily_auth_refresh() {
        let transport = FakeTransport::new();
        let _tx = transport.push_stream();

        let mut supervisor = DeviceSupervisor::new();
        supervisor.start(session(&transport));
        settle().await;
        assert_eq!(transport.refresh_calls.load(Ordering::SeqCst), 0);

        advance(AUTH_REFRESH_INTERVAL).await;
        settle().await;
        assert_eq!(transport.refresh_calls.load(Ordering::SeqCst), 1);

        supervisor.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_joins_all_tasks() {
        let transport = FakeTransport::new();
        let _tx = transport.push_stream();

        let mut supervisor = DeviceSupervisor::new();
        supervisor.start(session(&transport));
        assert_eq!(supervisor.device_count(), 1);
        settle().await;

        supervisor.close().await;
        assert!(transport.closed.load(Ordering::SeqCst));
    }
}
