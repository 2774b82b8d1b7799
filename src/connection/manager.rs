//! Connection manager
//!
//! Provides the public handle over one long-lived connection:
//! - Connect / disconnect / reconnect-if-needed / cancel-reconnect
//! - Fire-and-forget command sends and heartbeat pings
//! - Exponential backoff reconnects after any transport failure
//!
//! A single actor task owns the [`ConnectionCore`]. API calls, session
//! reports and timer expiries all arrive on its channels, so every state
//! mutation is serialized through one place.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::ConnectionSettings;
use crate::error::{Error, Result};
use crate::protocol::{Command, Led, OutboundMessage};

use super::backoff::{ReconnectBackoff, DEFAULT_MAX_RECONNECT_DELAY};
use super::machine::{ConnectionCore, Effect, Input, SessionId, TimerId};
use super::state::ConnectionState;
use super::transport::{spawn_session, Connector, RequestSource, SessionHandle};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Tunables for the manager
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Give up on an open that has not completed within this time
    pub connect_timeout: Duration,

    /// Ceiling for the reconnect delay
    pub max_reconnect_delay: Duration,

    /// How long a released session may spend writing its close frame
    pub close_grace: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            max_reconnect_delay: DEFAULT_MAX_RECONNECT_DELAY,
            close_grace: Duration::from_secs(2),
        }
    }
}

impl From<&ConnectionSettings> for ManagerOptions {
    fn from(settings: &ConnectionSettings) -> Self {
        Self {
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            max_reconnect_delay: Duration::from_secs(settings.max_reconnect_delay_secs),
            ..Self::default()
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────

/// Events emitted by the manager, in the order they happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The published state changed
    StateChanged(ConnectionState),

    /// A selection token arrived from the remote
    Message(String),
}

enum Request {
    Input(Input),
    Shutdown(oneshot::Sender<()>),
}

// ─────────────────────────────────────────────────────────────────
// Manager Handle
// ─────────────────────────────────────────────────────────────────

/// Cloneable handle to the connection actor
#[derive(Clone)]
pub struct ConnectionManager {
    requests: mpsc::UnboundedSender<Request>,
    state: Arc<RwLock<ConnectionState>>,
}

impl ConnectionManager {
    /// Spawn the actor and return its handle plus the event stream
    pub fn spawn<C: Connector>(
        connector: C,
        source: Arc<dyn RequestSource>,
        options: ManagerOptions,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));

        let actor = ManagerActor {
            core: ConnectionCore::new(ReconnectBackoff::new(options.max_reconnect_delay)),
            connector: Arc::new(connector),
            source,
            options,
            inputs: inputs_tx,
            events: events_tx,
            state: state.clone(),
            session: None,
            reconnect_timer: None,
        };
        tokio::spawn(actor.run(requests_rx, inputs_rx));

        (
            Self {
                requests: requests_tx,
                state,
            },
            events_rx,
        )
    }

    /// Open a fresh session, replacing any existing one
    pub fn connect(&self) -> Result<()> {
        self.submit(Input::Connect)
    }

    /// Close the session and suppress automatic reconnects
    pub fn disconnect(&self) -> Result<()> {
        self.submit(Input::Disconnect)
    }

    /// Connect only if currently disconnected
    pub fn reconnect_if_needed(&self) -> Result<()> {
        self.submit(Input::ReconnectIfNeeded)
    }

    /// Drop any pending reconnect timer
    pub fn cancel_reconnect(&self) -> Result<()> {
        self.submit(Input::CancelReconnect)
    }

    /// Send a command. Dropped silently unless connected.
    pub fn send(&self, command: Command, led: Option<Led>) -> Result<()> {
        self.submit(Input::Send(OutboundMessage::new(command, led)))
    }

    /// Send a WebSocket ping. Dropped silently unless connected.
    pub fn send_ping(&self) -> Result<()> {
        self.submit(Input::Ping)
    }

    /// Last published state
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Disconnect, flush the live session and stop the actor.
    /// The event stream ends once this returns.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(Request::Shutdown(reply_tx))
            .map_err(|_| manager_stopped())?;
        reply_rx.await.map_err(|_| manager_stopped())
    }

    fn submit(&self, input: Input) -> Result<()> {
        self.requests
            .send(Request::Input(input))
            .map_err(|_| manager_stopped())
    }
}

fn manager_stopped() -> Error {
    Error::Connection("connection manager stopped".to_string())
}

// ─────────────────────────────────────────────────────────────────
// Actor
// ─────────────────────────────────────────────────────────────────

struct ManagerActor<C: Connector> {
    core: ConnectionCore,
    connector: Arc<C>,
    source: Arc<dyn RequestSource>,
    options: ManagerOptions,
    inputs: mpsc::UnboundedSender<Input>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state: Arc<RwLock<ConnectionState>>,
    session: Option<SessionHandle>,
    reconnect_timer: Option<(TimerId, JoinHandle<()>)>,
}

impl<C: Connector> ManagerActor<C> {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut inputs: mpsc::UnboundedReceiver<Input>,
    ) {
        debug!("Connection manager started");

        loop {
            tokio::select! {
                biased;

                Some(input) = inputs.recv() => self.dispatch(input),

                request = requests.recv() => match request {
                    Some(Request::Input(input)) => self.dispatch(input),
                    Some(Request::Shutdown(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        debug!("All manager handles dropped");
                        self.shutdown().await;
                        break;
                    }
                },
            }
        }

        info!("Connection manager stopped");
    }

    fn dispatch(&mut self, input: Input) {
        if let Input::ReconnectDue(timer) = input {
            if matches!(self.reconnect_timer, Some((pending, _)) if pending == timer) {
                self.reconnect_timer = None;
            }
        }

        for effect in self.core.handle(input) {
            self.apply(effect);
        }
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::Release(id) => self.release_session(id),
            Effect::Open(id) => self.open_session(id),
            Effect::Transmit(id, frame) => match &self.session {
                Some(session) if session.id() == id => {
                    if !session.transmit(frame) {
                        debug!(session = id, "Session writer already gone, frame dropped");
                    }
                }
                _ => debug!(session = id, "No live session for frame, dropped"),
            },
            Effect::ScheduleReconnect { timer, delay } => self.arm_reconnect(timer, delay),
            Effect::CancelReconnect(timer) => self.disarm_reconnect(timer),
            Effect::StateChanged(state) => {
                *self.state.write() = state;
                let _ = self.events.send(ConnectionEvent::StateChanged(state));
            }
            Effect::Deliver(text) => {
                let _ = self.events.send(ConnectionEvent::Message(text));
            }
        }
    }

    fn open_session(&mut self, id: SessionId) {
        if let Some(previous) = self.session.take() {
            previous.release(self.options.close_grace);
        }

        debug!(session = id, "Opening session");
        self.session = Some(spawn_session(
            self.connector.clone(),
            id,
            self.source.clone(),
            self.options.connect_timeout,
            self.inputs.clone(),
        ));
    }

    fn release_session(&mut self, id: SessionId) {
        if self.session.as_ref().is_some_and(|s| s.id() == id) {
            if let Some(session) = self.session.take() {
                session.release(self.options.close_grace);
            }
        }
    }

    fn arm_reconnect(&mut self, timer: TimerId, delay: Duration) {
        if let Some((_, previous)) = self.reconnect_timer.take() {
            previous.abort();
        }

        let inputs = self.inputs.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inputs.send(Input::ReconnectDue(timer));
        });
        self.reconnect_timer = Some((timer, handle));
    }

    fn disarm_reconnect(&mut self, timer: TimerId) {
        if matches!(self.reconnect_timer, Some((pending, _)) if pending == timer) {
            if let Some((_, handle)) = self.reconnect_timer.take() {
                handle.abort();
            }
        }
    }

    async fn shutdown(&mut self) {
        info!("Shutting down connection manager");

        for effect in self.core.handle(Input::Disconnect) {
            match effect {
                Effect::Release(_) => {
                    if let Some(session) = self.session.take() {
                        session.close(self.options.close_grace).await;
                    }
                }
                other => self.apply(other),
            }
        }

        if let Some((_, handle)) = self.reconnect_timer.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::mock::{MockConnector, RemoteSocket};
    use crate::connection::transport::ConnectRequest;
    use async_trait::async_trait;
    use futures_util::{SinkExt, StreamExt};
    use parking_lot::Mutex;
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::time::{timeout, Instant};
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use url::Url;
    use ConnectionState::*;

    fn request() -> ConnectRequest {
        ConnectRequest::new(
            Url::parse("wss://gpio.test/ws?name=cli").unwrap(),
            "client-id",
            "client-secret",
        )
    }

    struct Harness {
        manager: ConnectionManager,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
        connector: MockConnector,
        remotes: mpsc::UnboundedReceiver<RemoteSocket>,
    }

    fn harness() -> Harness {
        harness_with_source(Arc::new(request()))
    }

    fn harness_with_source(source: Arc<dyn RequestSource>) -> Harness {
        let (connector, remotes) = MockConnector::new();
        let (manager, events) =
            ConnectionManager::spawn(connector.clone(), source, ManagerOptions::default());
        Harness {
            manager,
            events,
            connector,
            remotes,
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
        timeout(Duration::from_secs(300), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream ended")
    }

    async fn expect_state(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>, state: ConnectionState) {
        assert_eq!(next_event(events).await, ConnectionEvent::StateChanged(state));
    }

    async fn next_text(remote: &mut RemoteSocket) -> String {
        loop {
            match remote.next().await {
                Some(Ok(WsMessage::Text(text))) => return text,
                Some(Ok(_)) => continue,
                other => panic!("expected text frame, got {:?}", other),
            }
        }
    }

    /// Paused-clock timers fire on whole milliseconds
    fn assert_waited(since: Instant, expected: Duration) {
        let waited = since.elapsed();
        assert!(
            waited >= expected && waited < expected + Duration::from_millis(50),
            "waited {:?}, expected {:?}",
            waited,
            expected
        );
    }

    async fn connected(h: &mut Harness) -> RemoteSocket {
        h.manager.connect().unwrap();
        expect_state(&mut h.events, Connecting).await;
        expect_state(&mut h.events, Connected).await;
        h.remotes.recv().await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_send_and_receive() {
        let mut h = harness();
        let mut remote = connected(&mut h).await;
        assert_eq!(h.manager.connection_state(), Connected);

        h.manager.send(Command::Select, Some(Led::L2)).unwrap();
        let frame: serde_json::Value = serde_json::from_str(&next_text(&mut remote).await).unwrap();
        assert_eq!(frame, serde_json::json!({"command": "select", "led": "L2"}));

        remote.send(WsMessage::Text("L3".into())).await.unwrap();
        assert_eq!(next_event(&mut h.events).await, ConnectionEvent::Message("L3".into()));

        remote.send(WsMessage::Binary(b"ALL".to_vec())).await.unwrap();
        assert_eq!(next_event(&mut h.events).await, ConnectionEvent::Message("ALL".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_disconnected_is_dropped() {
        let mut h = harness();
        h.manager.send(Command::Up, None).unwrap();

        let mut remote = connected(&mut h).await;
        h.manager.send(Command::Down, None).unwrap();

        assert_eq!(next_text(&mut remote).await, r#"{"command":"down"}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_close_reconnects_after_one_second() {
        let mut h = harness();
        let mut remote = connected(&mut h).await;

        remote.close(None).await.unwrap();
        expect_state(&mut h.events, Disconnected).await;
        let dropped_at = Instant::now();

        expect_state(&mut h.events, Connecting).await;
        assert_waited(dropped_at, Duration::from_secs(1));
        expect_state(&mut h.events, Connected).await;
        assert_eq!(h.connector.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_opens_back_off_exponentially() {
        let mut h = harness();
        h.connector.refuse_next(3);
        h.manager.connect().unwrap();

        expect_state(&mut h.events, Connecting).await;
        for expected in [1, 2, 4] {
            expect_state(&mut h.events, Disconnected).await;
            let failed_at = Instant::now();
            expect_state(&mut h.events, Connecting).await;
            assert_waited(failed_at, Duration::from_secs(expected));
        }
        expect_state(&mut h.events, Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_open_resets_backoff() {
        let mut h = harness();
        h.connector.refuse_next(2);
        h.manager.connect().unwrap();
        expect_state(&mut h.events, Connecting).await;
        for _ in 0..2 {
            expect_state(&mut h.events, Disconnected).await;
            expect_state(&mut h.events, Connecting).await;
        }
        expect_state(&mut h.events, Connected).await;
        let mut remote = h.remotes.recv().await.unwrap();

        remote.close(None).await.unwrap();
        expect_state(&mut h.events, Disconnected).await;
        let dropped_at = Instant::now();
        expect_state(&mut h.events, Connecting).await;
        assert_waited(dropped_at, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_suppresses_reconnect() {
        let mut h = harness();
        let _remote = connected(&mut h).await;

        h.manager.disconnect().unwrap();
        expect_state(&mut h.events, Disconnected).await;

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(matches!(h.events.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(h.connector.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_reconnect_then_reconnect_if_needed() {
        let mut h = harness();
        let mut remote = connected(&mut h).await;

        remote.close(None).await.unwrap();
        expect_state(&mut h.events, Disconnected).await;
        h.manager.cancel_reconnect().unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(matches!(h.events.try_recv(), Err(TryRecvError::Empty)));

        h.manager.reconnect_if_needed().unwrap();
        expect_state(&mut h.events, Connecting).await;
        expect_state(&mut h.events, Connected).await;

        // Already connected: nothing happens
        h.manager.reconnect_if_needed().unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(matches!(h.events.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(h.connector.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_reaches_remote() {
        let mut h = harness();
        let mut remote = connected(&mut h).await;

        h.manager.send_ping().unwrap();
        assert!(matches!(remote.next().await, Some(Ok(WsMessage::Ping(_)))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_binary_drops_connection() {
        let mut h = harness();
        let mut remote = connected(&mut h).await;

        remote.send(WsMessage::Binary(vec![0xff, 0xfe, 0xfd])).await.unwrap();
        expect_state(&mut h.events, Disconnected).await;
        expect_state(&mut h.events, Connecting).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_connected_replaces_session() {
        let mut h = harness();
        let mut first = connected(&mut h).await;

        h.manager.connect().unwrap();
        expect_state(&mut h.events, Disconnected).await;
        expect_state(&mut h.events, Connecting).await;
        expect_state(&mut h.events, Connected).await;
        let mut second = h.remotes.recv().await.unwrap();

        // The released session said goodbye and its closure is not reported
        assert!(matches!(first.next().await, Some(Ok(WsMessage::Close(_)))));
        h.manager.send(Command::Stop, None).unwrap();
        assert_eq!(next_text(&mut second).await, r#"{"command":"stop"}"#);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(matches!(h.events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_timeout_schedules_reconnect() {
        let mut h = harness();
        h.connector.hang_connects(true);
        h.manager.connect().unwrap();

        let started = Instant::now();
        expect_state(&mut h.events, Connecting).await;
        expect_state(&mut h.events, Disconnected).await;
        assert_waited(started, Duration::from_secs(15));
    }

    struct RotatingSource {
        issued: Mutex<u32>,
    }

    #[async_trait]
    impl RequestSource for RotatingSource {
        async fn connect_request(&self) -> Result<ConnectRequest> {
            let mut issued = self.issued.lock();
            *issued += 1;
            let mut req = request();
            req.client_secret = format!("secret-{}", *issued);
            Ok(req)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_rebuilt_for_every_session() {
        let mut h = harness_with_source(Arc::new(RotatingSource {
            issued: Mutex::new(0),
        }));
        let mut remote = connected(&mut h).await;

        remote.close(None).await.unwrap();
        expect_state(&mut h.events, Disconnected).await;
        expect_state(&mut h.events, Connecting).await;
        expect_state(&mut h.events, Connected).await;

        let secrets: Vec<_> = h.connector.requests().into_iter().map(|r| r.client_secret).collect();
        assert_eq!(secrets, vec!["secret-1", "secret-2"]);
    }

    struct BrokenSource;

    #[async_trait]
    impl RequestSource for BrokenSource {
        async fn connect_request(&self) -> Result<ConnectRequest> {
            Err(Error::config_field_invalid("remote.host", "is not set"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_error_is_open_failure() {
        let mut h = harness_with_source(Arc::new(BrokenSource));
        h.manager.connect().unwrap();

        expect_state(&mut h.events, Connecting).await;
        expect_state(&mut h.events, Disconnected).await;
        assert_eq!(h.connector.connect_count(), 0);

        h.manager.disconnect().unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(matches!(h.events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_and_ends_events() {
        let mut h = harness();
        let mut remote = connected(&mut h).await;

        h.manager.send(Command::Select, Some(Led::All)).unwrap();
        h.manager.shutdown().await.unwrap();

        assert_eq!(next_text(&mut remote).await, r#"{"command":"select","led":"ALL"}"#);
        assert!(matches!(remote.next().await, Some(Ok(WsMessage::Close(_)))));

        assert_eq!(h.events.recv().await, Some(ConnectionEvent::StateChanged(Disconnected)));
        assert_eq!(h.events.recv().await, None);
        assert!(h.manager.connect().is_err());
    }
}
