//! Broker connection lifecycle: connect, subscribe, detect loss, back off,
//! reconnect.
//!
//! The manager is a single tokio task. Caller commands, transport events and
//! reconnect-timer expiries all arrive on one inbox and are handled one at a
//! time, so the state, the retry counter, the disposed flag and the pending
//! timer are never touched from two places at once.
//!
//! ```text
//!                 connect()
//! Disconnected ─────────────▶ Connecting ──[ConnAck]──▶ Connected
//!      ▲  ▲                       │                         │
//!      │  └──────[open failed / link lost]──────────────────┘
//!      │                          │
//!      └──[backoff 2,4,8,16,32s]──┘   (then give up until connect())
//! ```
//!
//! Every session and every timer carries a generation number. Events from a
//! session that has since been replaced, and expiries of cancelled timers,
//! are discarded.

use std::time::Duration;

use anyhow::Result;
use rumqttc::QoS;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::mqtt::decode_reading;
use crate::reading::SoilReading;

pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What the manager reports to its single consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelemetryEvent {
    DataReceived(SoilReading),
    ConnectionChanged(bool),
}

/// What a transport reports about the session it was asked to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: String },
    Message { topic: String, payload: Vec<u8> },
}

/// Parameters for a single transport session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic: String,
    pub client_id_prefix: String,
    pub keep_alive: Duration,
    pub max_reconnect_attempts: u32,
}

impl ManagerConfig {
    /// Session options with a fresh random client id.
    fn fresh_session(&self) -> SessionOptions {
        SessionOptions {
            client_id: format!("{}-{:08x}", self.client_id_prefix, fastrand::u32(..)),
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            keep_alive: self.keep_alive,
        }
    }
}

/// Publish/subscribe client seam. Implementations deliver everything that
/// happens on an opened session through the supplied [`SessionEvents`].
pub trait Transport: Send + 'static {
    /// Start a session. Returning an error is treated like an immediate
    /// disconnect.
    fn open(&mut self, options: &SessionOptions, events: SessionEvents) -> Result<()>;
    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<()>;
    /// Tear down the current session, if any. Must be safe to call twice.
    fn close(&mut self);
}

/// Sender half handed to a transport for one session.
#[derive(Debug, Clone)]
pub struct SessionEvents {
    session: u64,
    inbox: mpsc::UnboundedSender<Input>,
}

impl SessionEvents {
    /// Returns `false` once the manager is gone.
    pub fn send(&self, event: TransportEvent) -> bool {
        self.inbox
            .send(Input::Transport {
                session: self.session,
                event,
            })
            .is_ok()
    }
}

/// Delay before reconnect attempt `attempts + 1`: 2, 4, 8, 16, 32 s, ...
pub fn backoff_delay(attempts: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempts.saturating_add(1)))
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Input {
    Connect,
    Disconnect(oneshot::Sender<()>),
    Transport { session: u64, event: TransportEvent },
    ReconnectDue { timer: u64 },
}

/// Cheap, cloneable way to drive a running [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    inbox: mpsc::UnboundedSender<Input>,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    /// Explicit (re)connect. Clears a previous `disconnect()` and starts a
    /// fresh retry budget.
    pub fn connect(&self) {
        if self.inbox.send(Input::Connect).is_err() {
            warn!("connect requested but the connection manager has stopped");
        }
    }

    /// Dispose the session. Resolves once the manager has processed the
    /// request; from then on it emits no events and schedules no timers.
    pub async fn disconnect(&self) {
        let (ack, done) = oneshot::channel();
        if self.inbox.send(Input::Disconnect(ack)).is_ok() {
            let _ = done.await;
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct PendingReconnect {
    timer: u64,
    task: JoinHandle<()>,
}

pub struct ConnectionManager<T: Transport> {
    transport: T,
    config: ManagerConfig,
    events: mpsc::Sender<TelemetryEvent>,

    inbox_tx: mpsc::UnboundedSender<Input>,
    inbox_rx: mpsc::UnboundedReceiver<Input>,
    state_tx: watch::Sender<ConnectionState>,

    state: ConnectionState,
    reconnect_attempts: u32,
    disposed: bool,
    session: u64,
    timer_seq: u64,
    pending: Option<PendingReconnect>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(
        transport: T,
        config: ManagerConfig,
        events: mpsc::Sender<TelemetryEvent>,
    ) -> (Self, ConnectionHandle) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let handle = ConnectionHandle {
            inbox: inbox_tx.clone(),
            state: state_rx,
        };
        let manager = Self {
            transport,
            config,
            events,
            inbox_tx,
            inbox_rx,
            state_tx,
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            disposed: false,
            session: 0,
            timer_seq: 0,
            pending: None,
        };
        (manager, handle)
    }

    /// Process inputs until the event consumer goes away.
    pub async fn run(mut self) {
        while let Some(input) = self.inbox_rx.recv().await {
            match input {
                Input::Connect => self.handle_connect().await,
                Input::Disconnect(ack) => {
                    self.handle_disconnect();
                    let _ = ack.send(());
                }
                Input::Transport { session, event } => self.handle_transport(session, event).await,
                Input::ReconnectDue { timer } => self.handle_reconnect_due(timer).await,
            }
            if self.events.is_closed() {
                debug!("telemetry consumer dropped; connection manager stopping");
                break;
            }
        }
        self.cancel_reconnect();
        self.transport.close();
    }

    async fn handle_connect(&mut self) {
        self.disposed = false;
        self.reconnect_attempts = 0;
        self.cancel_reconnect();
        if self.state != ConnectionState::Disconnected {
            debug!(state = ?self.state, "connect ignored; session already active");
            return;
        }
        self.open_session().await;
    }

    fn handle_disconnect(&mut self) {
        self.disposed = true;
        self.cancel_reconnect();
        self.reconnect_attempts = 0;
        self.session += 1;
        self.transport.close();
        self.set_state(ConnectionState::Disconnected);
        info!("disconnected from broker (disposed)");
    }

    async fn handle_transport(&mut self, session: u64, event: TransportEvent) {
        if self.disposed || session != self.session {
            debug!(session, current = self.session, "dropping event from retired session");
            return;
        }

        match event {
            TransportEvent::Connected => {
                self.set_state(ConnectionState::Connected);
                self.reconnect_attempts = 0;
                match self.transport.subscribe(&self.config.topic, QoS::AtLeastOnce) {
                    Ok(()) => info!(topic = %self.config.topic, "connected; subscribed"),
                    Err(e) => warn!(topic = %self.config.topic, "connected but subscribe failed: {e:#}"),
                }
                self.emit(TelemetryEvent::ConnectionChanged(true)).await;
            }
            TransportEvent::Message { topic, payload } => {
                if topic != self.config.topic {
                    debug!(%topic, "ignoring message on unexpected topic");
                    return;
                }
                match decode_reading(&payload, OffsetDateTime::now_utc()) {
                    Ok(reading) => self.emit(TelemetryEvent::DataReceived(reading)).await,
                    Err(e) => warn!(%topic, bytes = payload.len(), "dropping malformed payload: {e}"),
                }
            }
            TransportEvent::Disconnected { reason } => self.handle_link_lost(&reason).await,
        }
    }

    async fn handle_reconnect_due(&mut self, timer: u64) {
        let current = self.pending.as_ref().map(|p| p.timer);
        if self.disposed || current != Some(timer) {
            debug!(timer, "ignoring cancelled reconnect timer");
            return;
        }
        self.pending = None;
        self.open_session().await;
    }

    async fn open_session(&mut self) {
        self.session += 1;
        let options = self.config.fresh_session();
        self.set_state(ConnectionState::Connecting);
        info!(
            client_id = %options.client_id,
            host = %options.host,
            port = options.port,
            "connecting to broker"
        );

        let events = SessionEvents {
            session: self.session,
            inbox: self.inbox_tx.clone(),
        };
        if let Err(e) = self.transport.open(&options, events) {
            self.handle_link_lost(&format!("{e:#}")).await;
        }
    }

    async fn handle_link_lost(&mut self, reason: &str) {
        // Retire the session so a second loss report for it is ignored.
        self.session += 1;
        self.set_state(ConnectionState::Disconnected);
        warn!(reason, "broker connection lost");
        self.emit(TelemetryEvent::ConnectionChanged(false)).await;
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.disposed {
            return;
        }
        if self.reconnect_attempts >= self.config.max_reconnect_attempts {
            warn!(
                attempts = self.reconnect_attempts,
                "giving up on reconnect until connect() is called"
            );
            return;
        }

        let delay = backoff_delay(self.reconnect_attempts);
        self.reconnect_attempts += 1;
        self.cancel_reconnect();

        self.timer_seq += 1;
        let timer = self.timer_seq;
        let inbox = self.inbox_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inbox.send(Input::ReconnectDue { timer });
        });
        self.pending = Some(PendingReconnect { timer, task });

        info!(
            attempt = self.reconnect_attempts,
            max = self.config.max_reconnect_attempts,
            delay_sec = delay.as_secs(),
            "reconnect scheduled"
        );
    }

    fn cancel_reconnect(&mut self) {
        if let Some(p) = self.pending.take() {
            p.task.abort();
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }

    async fn emit(&self, event: TelemetryEvent) {
        if self.events.send(event).await.is_err() {
            debug!("telemetry consumer dropped; event discarded");
        }
    }
}

// ===========================================================================
// Test transport
// ===========================================================================


// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::testing::{test_config, OpenedSession, RecordingTransport};
    use super::*;
    use std::sync::atomic::Ordering;
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::time::Instant;

    struct Harness {
        transport: RecordingTransport,
        opened: mpsc::UnboundedReceiver<OpenedSession>,
        handle: ConnectionHandle,
        events: mpsc::Receiver<TelemetryEvent>,
        _task: JoinHandle<()>,
    }

    fn start() -> Harness {
        let (transport, opened) = RecordingTransport::new();
        let (events_tx, events) = mpsc::channel(64);
        let (manager, handle) = ConnectionManager::new(transport.clone(), test_config(), events_tx);
        let task = tokio::spawn(manager.run());
        Harness {
            transport,
            opened,
            handle,
            events,
            _task: task,
        }
    }

    impl Harness {
        async fn next_open(&mut self) -> OpenedSession {
            self.opened.recv().await.expect("transport dropped")
        }

        async fn next_event(&mut self) -> TelemetryEvent {
            self.events.recv().await.expect("manager dropped")
        }

        /// Connect and complete the handshake.
        async fn connected(&mut self) -> OpenedSession {
            self.handle.connect();
            let session = self.next_open().await;
            session.events.send(TransportEvent::Connected);
            assert_eq!(self.next_event().await, TelemetryEvent::ConnectionChanged(true));
            session
        }

        /// Let the manager and any due timers run.
        async fn settle(&self, secs: u64) {
            tokio::time::sleep(Duration::from_secs(secs)).await;
        }
    }

    fn lost(reason: &str) -> TransportEvent {
        TransportEvent::Disconnected {
            reason: reason.to_string(),
        }
    }

    fn message(payload: &[u8]) -> TransportEvent {
        TransportEvent::Message {
            topic: "garden/soil".into(),
            payload: payload.to_vec(),
        }
    }

    // -- backoff_delay ------------------------------------------------------

    #[test]
    fn backoff_sequence() {
        let secs: Vec<u64> = (0..5).map(|a| backoff_delay(a).as_secs()).collect();
        assert_eq!(secs, vec![2, 4, 8, 16, 32]);
    }

    #[test]
    fn backoff_saturates() {
        assert_eq!(backoff_delay(u32::MAX), Duration::from_secs(u64::MAX));
    }

    // -- connect ------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn connect_opens_session_with_configured_broker() {
        let mut h = start();
        assert_eq!(h.handle.state(), ConnectionState::Disconnected);

        h.handle.connect();
        let s = h.next_open().await;
        assert_eq!(s.options.host, "broker.test");
        assert_eq!(s.options.port, 1883);
        assert_eq!(s.options.username.as_deref(), Some("garden"));
        assert_eq!(s.options.password.as_deref(), Some("secret"));
        assert!(s.options.client_id.starts_with("soil-monitor-"));
        assert_eq!(h.handle.state(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn connected_subscribes_at_least_once_and_notifies() {
        let mut h = start();
        h.connected().await;

        assert_eq!(h.handle.state(), ConnectionState::Connected);
        let subs = h.transport.subscriptions.lock().unwrap().clone();
        assert_eq!(subs, vec![("garden/soil".to_string(), QoS::AtLeastOnce)]);
    }

    #[tokio::test(start_paused = true)]
    async fn each_session_gets_a_fresh_client_id() {
        let mut h = start();
        let first = h.connected().await;
        first.events.send(lost("test"));
        assert_eq!(h.next_event().await, TelemetryEvent::ConnectionChanged(false));

        let second = h.next_open().await;
        assert_ne!(first.options.client_id, second.options.client_id);
        assert!(second.options.client_id.starts_with("soil-monitor-"));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_while_connected_is_ignored() {
        let mut h = start();
        h.connected().await;
        h.handle.connect();
        h.settle(60).await;
        assert!(matches!(h.opened.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(h.handle.state(), ConnectionState::Connected);
    }

    // -- inbound messages ---------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn message_becomes_reading_stamped_on_receipt() {
        let mut h = start();
        let s = h.connected().await;

        let before = OffsetDateTime::now_utc();
        s.events.send(message(
            br#"{"raw":2350,"percent":47,"state":"ok","timestamp":"1999-01-01T00:00:00Z"}"#,
        ));
        let TelemetryEvent::DataReceived(r) = h.next_event().await else {
            panic!("expected a reading");
        };
        assert_eq!((r.raw, r.percent, r.state.as_str()), (2350, 47, "ok"));
        assert!(r.timestamp >= before);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_payload_is_dropped_and_session_survives() {
        let mut h = start();
        let s = h.connected().await;

        s.events.send(message(b"not json at all"));
        s.events.send(message(&[0xff, 0xfe]));
        s.events.send(message(br#"{"raw":1800}"#));

        let TelemetryEvent::DataReceived(r) = h.next_event().await else {
            panic!("expected a reading");
        };
        assert_eq!(r.raw, 1800);
        assert_eq!(r.state, "unknown");
        assert_eq!(h.handle.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn message_on_other_topic_is_ignored() {
        let mut h = start();
        let s = h.connected().await;

        s.events.send(TransportEvent::Message {
            topic: "garden/other".into(),
            payload: br#"{"raw":1}"#.to_vec(),
        });
        s.events.send(message(br#"{"raw":2}"#));

        let TelemetryEvent::DataReceived(r) = h.next_event().await else {
            panic!("expected a reading");
        };
        assert_eq!(r.raw, 2);
    }

    // -- reconnect backoff --------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn reconnect_backoff_then_give_up() {
        let mut h = start();
        h.handle.connect();
        let mut session = h.next_open().await;

        for expected in [2, 4, 8, 16, 32] {
            let lost_at = Instant::now();
            session.events.send(lost("broker gone"));
            assert_eq!(h.next_event().await, TelemetryEvent::ConnectionChanged(false));

            session = h.next_open().await;
            let gap = session.opened_at - lost_at;
            let expected = Duration::from_secs(expected);
            assert!(
                gap >= expected && gap < expected + Duration::from_millis(50),
                "expected ~{expected:?}, got {gap:?}"
            );
        }

        // Sixth consecutive failure: nothing further is scheduled.
        session.events.send(lost("broker gone"));
        assert_eq!(h.next_event().await, TelemetryEvent::ConnectionChanged(false));
        h.settle(3600).await;
        assert!(matches!(h.opened.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(h.handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_connect_resets_backoff() {
        let mut h = start();
        let s = h.connected().await;

        s.events.send(lost("blip"));
        assert_eq!(h.next_event().await, TelemetryEvent::ConnectionChanged(false));
        let s = h.next_open().await;
        s.events.send(TransportEvent::Connected);
        assert_eq!(h.next_event().await, TelemetryEvent::ConnectionChanged(true));

        let lost_at = Instant::now();
        s.events.send(lost("blip"));
        assert_eq!(h.next_event().await, TelemetryEvent::ConnectionChanged(false));
        let next = h.next_open().await;
        assert!(next.opened_at - lost_at < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn open_failure_counts_as_disconnect() {
        let mut h = start();
        h.transport.fail_open.store(true, Ordering::SeqCst);

        h.handle.connect();
        let first = h.next_open().await;
        assert_eq!(h.next_event().await, TelemetryEvent::ConnectionChanged(false));
        assert_eq!(h.handle.state(), ConnectionState::Disconnected);

        let second = h.next_open().await;
        assert!(second.opened_at - first.opened_at >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_loss_report_schedules_once() {
        let mut h = start();
        let s = h.connected().await;

        s.events.send(lost("first"));
        s.events.send(lost("second"));
        assert_eq!(h.next_event().await, TelemetryEvent::ConnectionChanged(false));

        h.next_open().await;
        h.settle(120).await;
        assert!(matches!(h.opened.try_recv(), Err(TryRecvError::Empty)));
        assert!(matches!(h.events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_connect_after_give_up_starts_fresh() {
        let mut h = start();
        h.transport.fail_open.store(true, Ordering::SeqCst);
        h.handle.connect();

        // Initial attempt plus five retries, each reported as a loss.
        for _ in 0..6 {
            h.next_open().await;
            assert_eq!(h.next_event().await, TelemetryEvent::ConnectionChanged(false));
        }
        h.settle(3600).await;
        assert!(matches!(h.opened.try_recv(), Err(TryRecvError::Empty)));

        h.transport.fail_open.store(false, Ordering::SeqCst);
        h.handle.connect();
        let s = h.next_open().await;
        s.events.send(TransportEvent::Connected);
        assert_eq!(h.next_event().await, TelemetryEvent::ConnectionChanged(true));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_connect_cancels_pending_timer() {
        let mut h = start();
        let s = h.connected().await;
        s.events.send(lost("blip"));
        assert_eq!(h.next_event().await, TelemetryEvent::ConnectionChanged(false));

        // Reconnect is pending (2s); connect now instead.
        h.handle.connect();
        h.next_open().await;
        h.settle(10).await;
        assert!(matches!(h.opened.try_recv(), Err(TryRecvError::Empty)));
    }

    // -- disconnect / dispose -----------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn no_events_after_disconnect() {
        let mut h = start();
        let s = h.connected().await;

        h.handle.disconnect().await;
        assert_eq!(h.handle.state(), ConnectionState::Disconnected);
        assert!(h.transport.closes.load(Ordering::SeqCst) >= 1);

        s.events.send(message(br#"{"raw":2000,"percent":50,"state":"ok"}"#));
        s.events.send(TransportEvent::Connected);
        s.events.send(lost("late"));
        h.settle(600).await;

        assert!(matches!(h.events.try_recv(), Err(TryRecvError::Empty)));
        assert!(matches!(h.opened.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_reconnect() {
        let mut h = start();
        let s = h.connected().await;
        s.events.send(lost("blip"));
        assert_eq!(h.next_event().await, TelemetryEvent::ConnectionChanged(false));

        h.handle.disconnect().await;
        h.settle(600).await;
        assert!(matches!(h.opened.try_recv(), Err(TryRecvError::Empty)));
        assert!(matches!(h.events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_safe_in_any_state() {
        let mut h = start();
        h.handle.disconnect().await;
        h.handle.disconnect().await;

        h.handle.connect();
        let s = h.next_open().await;
        h.handle.disconnect().await;
        s.events.send(TransportEvent::Connected);
        h.settle(60).await;
        assert!(matches!(h.events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_after_disconnect_revives() {
        let mut h = start();
        h.connected().await;
        h.handle.disconnect().await;

        let s = h.connected().await;
        s.events.send(message(br#"{"raw":3000}"#));
        assert!(matches!(h.next_event().await, TelemetryEvent::DataReceived(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn manager_stops_when_consumer_dropped() {
        let Harness {
            opened,
            handle,
            events,
            _task: task,
            ..
        } = start();
        drop(events);
        drop(opened);
        handle.connect();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("manager should stop")
            .unwrap();
    }
}
