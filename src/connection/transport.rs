//! WebSocket transport sessions
//!
//! A session is one socket plus the task that drives it. The task opens the
//! socket, reports `Opened`, then multiplexes outbound frames and the receive
//! loop until the first failure, which it reports exactly once before exiting.
//! Every report is tagged with the session id and marshalled back to the
//! manager over its input channel.
//!
//! A ping is answered by a pong before the next one is due. A ping still
//! unanswered when the next heartbeat arrives is a `Failure::Ping`, which
//! catches half-open peers that keep accepting writes.
//!
//! Releasing a session drops its outbound sender. The task notices, sends a
//! best-effort `Close(GoingAway)` and exits without reporting anything.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::protocol::decode_binary_frame;

use super::machine::{Failure, Input, OutboundFrame, SessionId};

/// Header carrying the access-control client id
pub const ACCESS_CLIENT_ID_HEADER: &str = "cf-access-client-id";

/// Header carrying the access-control client secret
pub const ACCESS_CLIENT_SECRET_HEADER: &str = "cf-access-client-secret";

/// Upper bound on writing the close frame when a session is released
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

// ─────────────────────────────────────────────────────────────────
// Connect Requests
// ─────────────────────────────────────────────────────────────────

/// Everything needed to open one session
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub url: Url,
    pub client_id: String,
    pub client_secret: String,
}

impl ConnectRequest {
    pub fn new(url: Url, client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            url,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    /// Build the HTTP upgrade request with both access headers attached
    pub fn to_request(&self) -> Result<Request> {
        let mut request = self.url.as_str().into_client_request()?;

        let client_id = header_value("access.client_id", &self.client_id)?;
        let mut client_secret = header_value("access.client_secret", &self.client_secret)?;
        client_secret.set_sensitive(true);

        let headers = request.headers_mut();
        headers.insert(ACCESS_CLIENT_ID_HEADER, client_id);
        headers.insert(ACCESS_CLIENT_SECRET_HEADER, client_secret);

        Ok(request)
    }

    /// Endpoint without credentials, safe for logs and error messages
    pub fn endpoint(&self) -> &str {
        self.url.as_str()
    }
}

impl std::fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("url", &self.url.as_str())
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

fn header_value(field: &str, value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|_| {
        Error::config_field_invalid(field, "contains characters that are not allowed in an HTTP header")
    })
}

/// Produces a fresh connect request for every session
///
/// Implementations may re-read configuration each time so that rotated
/// credentials apply to the next reconnect. Called from the session task,
/// never from the manager actor.
#[async_trait]
pub trait RequestSource: Send + Sync + 'static {
    async fn connect_request(&self) -> Result<ConnectRequest>;
}

#[async_trait]
impl RequestSource for ConnectRequest {
    async fn connect_request(&self) -> Result<ConnectRequest> {
        Ok(self.clone())
    }
}

// ─────────────────────────────────────────────────────────────────
// Connectors
// ─────────────────────────────────────────────────────────────────

/// Opens the WebSocket for a session
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn connect(&self, request: ConnectRequest) -> Result<WebSocketStream<Self::Io>>;
}

/// Production connector over TCP, with TLS for `wss://`
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    type Io = MaybeTlsStream<TcpStream>;

    async fn connect(&self, request: ConnectRequest) -> Result<WebSocketStream<Self::Io>> {
        let upgrade = request.to_request()?;
        let (stream, response) = connect_async(upgrade)
            .await
            .map_err(|e| Error::connection_failed(request.endpoint(), e.to_string()))?;

        debug!(status = %response.status(), url = %request.endpoint(), "WebSocket handshake complete");
        Ok(stream)
    }
}

// ─────────────────────────────────────────────────────────────────
// Sessions
// ─────────────────────────────────────────────────────────────────

/// Owned handle to a live session
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Queue a frame for the writer. Returns false if the session task is gone.
    pub fn transmit(&self, frame: OutboundFrame) -> bool {
        self.outbound.send(frame).is_ok()
    }

    /// Release without waiting. The task gets `grace` to close cleanly
    /// before it is aborted.
    pub fn release(self, grace: Duration) {
        let SessionHandle { id, outbound, mut task } = self;
        drop(outbound);
        tokio::spawn(async move {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                debug!(session = id, "Session did not close within grace period, aborting");
                task.abort();
            }
        });
    }

    /// Release and wait for queued frames and the close frame to be written
    pub async fn close(self, grace: Duration) {
        let SessionHandle { id, outbound, mut task } = self;
        drop(outbound);
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            debug!(session = id, "Session did not close within grace period, aborting");
            task.abort();
        }
    }
}

/// Spawn the task for a new session
pub fn spawn_session<C: Connector>(
    connector: Arc<C>,
    id: SessionId,
    source: Arc<dyn RequestSource>,
    connect_timeout: Duration,
    inputs: mpsc::UnboundedSender<Input>,
) -> SessionHandle {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_session(
        connector,
        id,
        source,
        connect_timeout,
        outbound_rx,
        inputs,
    ));

    SessionHandle {
        id,
        outbound: outbound_tx,
        task,
    }
}

/// Build the request and open the socket within `connect_timeout`
async fn open_stream<C: Connector>(
    connector: &C,
    source: &dyn RequestSource,
    id: SessionId,
    connect_timeout: Duration,
) -> Result<(WebSocketStream<C::Io>, String)> {
    let request = source.connect_request().await?;
    let endpoint = request.endpoint().to_string();
    debug!(session = id, url = %endpoint, "Opening session");

    match tokio::time::timeout(connect_timeout, connector.connect(request)).await {
        Ok(opened) => Ok((opened?, endpoint)),
        Err(_) => Err(Error::connection_timeout(&endpoint, connect_timeout.as_secs())),
    }
}

async fn run_session<C: Connector>(
    connector: Arc<C>,
    id: SessionId,
    source: Arc<dyn RequestSource>,
    connect_timeout: Duration,
    mut outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    inputs: mpsc::UnboundedSender<Input>,
) {
    let report = |failure: Failure| {
        let _ = inputs.send(Input::Failed(id, failure));
    };

    let (stream, endpoint) = tokio::select! {
        opened = open_stream(connector.as_ref(), source.as_ref(), id, connect_timeout) => match opened {
            Ok(opened) => opened,
            Err(e) => {
                report(Failure::Open(e.to_string()));
                return;
            }
        },
        None = outbound.recv() => {
            debug!(session = id, "Session released before it opened");
            return;
        }
    };

    info!(session = id, url = %endpoint, "Session open");
    if inputs.send(Input::Opened(id)).is_err() {
        return;
    }

    let (mut sink, mut stream) = stream.split();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(OutboundFrame::Text(text)) => {
                    if let Err(e) = sink.send(WsMessage::Text(text)).await {
                        report(Failure::Send(e.to_string()));
                        return;
                    }
                }
                Some(OutboundFrame::Ping) => {
                    if awaiting_pong {
                        report(Failure::Ping("no pong since the previous ping".to_string()));
                        return;
                    }
                    if let Err(e) = sink.send(WsMessage::Ping(Vec::new())).await {
                        report(Failure::Ping(e.to_string()));
                        return;
                    }
                    awaiting_pong = true;
                }
                None => {
                    let close = WsMessage::Close(Some(CloseFrame {
                        code: CloseCode::Away,
                        reason: Cow::Borrowed("client going away"),
                    }));
                    if tokio::time::timeout(CLOSE_FRAME_TIMEOUT, sink.send(close)).await.is_err() {
                        debug!(session = id, "Timed out writing close frame");
                    }
                    debug!(session = id, "Session released");
                    return;
                }
            },

            message = stream.next() => match message {
                Some(Ok(WsMessage::Text(text))) => {
                    let _ = inputs.send(Input::Received(id, text));
                }
                Some(Ok(WsMessage::Binary(data))) => match decode_binary_frame(data) {
                    Ok(text) => {
                        let _ = inputs.send(Input::Received(id, text));
                    }
                    Err(e) => {
                        report(Failure::Decode(e.to_string()));
                        return;
                    }
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    let reason = frame
                        .map(|f| format!("code {} {}", u16::from(f.code), f.reason))
                        .unwrap_or_else(|| "without close frame".to_string());
                    report(Failure::Closed(reason));
                    return;
                }
                Some(Ok(WsMessage::Pong(_))) => awaiting_pong = false,
                // Pings and raw frames; tungstenite answers pings itself
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(session = id, error = %e, "WebSocket read error");
                    report(Failure::Receive(e.to_string()));
                    return;
                }
                None => {
                    report(Failure::Closed("stream ended".to_string()));
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::mock::MockConnector;

    fn request() -> ConnectRequest {
        ConnectRequest::new(
            Url::parse("wss://gpio.example.com/ws?name=cli").unwrap(),
            "client-id.access",
            "top-secret",
        )
    }

    fn spawn(
        connector: MockConnector,
        id: SessionId,
        connect_timeout: Duration,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<Input>) {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let session = spawn_session(Arc::new(connector), id, Arc::new(request()), connect_timeout, inputs_tx);
        (session, inputs_rx)
    }

    struct MissingHost;

    #[async_trait]
    impl RequestSource for MissingHost {
        async fn connect_request(&self) -> Result<ConnectRequest> {
            Err(Error::config_field_invalid("remote.host", "is not set"))
        }
    }

    #[test]
    fn test_request_carries_access_headers() {
        let upgrade = request().to_request().unwrap();
        let headers = upgrade.headers();

        assert_eq!(headers.get(ACCESS_CLIENT_ID_HEADER).unwrap(), "client-id.access");
        let secret = headers.get(ACCESS_CLIENT_SECRET_HEADER).unwrap();
        assert_eq!(secret, "top-secret");
        assert!(secret.is_sensitive());
        assert_eq!(upgrade.uri().to_string(), "wss://gpio.example.com/ws?name=cli");
    }

    #[test]
    fn test_invalid_header_value_rejected() {
        let mut bad = request();
        bad.client_secret = "line\nbreak".to_string();
        let err = bad.to_request().unwrap_err();
        assert!(matches!(err, Error::ConfigValidation { field: Some(ref f), .. } if f == "access.client_secret"));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let rendered = format!("{:?}", request());
        assert!(!rendered.contains("top-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_reports_open_then_frames() {
        let (connector, mut remotes) = MockConnector::new();
        let (session, mut inputs_rx) = spawn(connector, 7, Duration::from_secs(5));
        assert_eq!(inputs_rx.recv().await, Some(Input::Opened(7)));

        let mut remote = remotes.recv().await.unwrap();
        remote.send(WsMessage::Binary(b"L1".to_vec())).await.unwrap();
        assert_eq!(inputs_rx.recv().await, Some(Input::Received(7, "L1".to_string())));

        assert!(session.transmit(OutboundFrame::Text("{\"command\":\"up\"}".into())));
        match remote.next().await {
            Some(Ok(WsMessage::Text(text))) => assert_eq!(text, "{\"command\":\"up\"}"),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_session_sends_close_and_stays_silent() {
        let (connector, mut remotes) = MockConnector::new();
        let (session, mut inputs_rx) = spawn(connector, 1, Duration::from_secs(5));
        assert_eq!(inputs_rx.recv().await, Some(Input::Opened(1)));
        let mut remote = remotes.recv().await.unwrap();

        session.close(Duration::from_secs(2)).await;

        match remote.next().await {
            Some(Ok(WsMessage::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Away),
            other => panic!("expected close frame, got {:?}", other),
        }
        // The task exited without reporting a failure
        assert_eq!(inputs_rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_utf8_binary_is_decode_failure() {
        let (connector, mut remotes) = MockConnector::new();
        let (_session, mut inputs_rx) = spawn(connector, 3, Duration::from_secs(5));
        assert_eq!(inputs_rx.recv().await, Some(Input::Opened(3)));
        let mut remote = remotes.recv().await.unwrap();

        remote.send(WsMessage::Binary(vec![0xc3, 0x28])).await.unwrap();
        assert!(matches!(inputs_rx.recv().await, Some(Input::Failed(3, Failure::Decode(_)))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_timeout_reported_as_open_failure() {
        let (connector, _remotes) = MockConnector::new();
        connector.hang_connects(true);
        let (_session, mut inputs_rx) = spawn(connector, 9, Duration::from_secs(15));
        match inputs_rx.recv().await {
            Some(Input::Failed(9, Failure::Open(reason))) => assert!(reason.contains("15s")),
            other => panic!("expected open failure, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_close_reported() {
        let (connector, mut remotes) = MockConnector::new();
        let (_session, mut inputs_rx) = spawn(connector, 4, Duration::from_secs(5));
        assert_eq!(inputs_rx.recv().await, Some(Input::Opened(4)));
        let mut remote = remotes.recv().await.unwrap();

        remote.close(None).await.unwrap();
        assert!(matches!(inputs_rx.recv().await, Some(Input::Failed(4, Failure::Closed(_)))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_source_error_is_open_failure() {
        let (connector, _remotes) = MockConnector::new();
        let (inputs_tx, mut inputs_rx) = mpsc::unbounded_channel();

        let _session = spawn_session(
            Arc::new(connector.clone()),
            2,
            Arc::new(MissingHost),
            Duration::from_secs(5),
            inputs_tx,
        );
        match inputs_rx.recv().await {
            Some(Input::Failed(2, Failure::Open(reason))) => assert!(reason.contains("is not set")),
            other => panic!("expected open failure, got {:?}", other),
        }
        assert_eq!(connector.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_ping_fails_on_next_heartbeat() {
        let (connector, mut remotes) = MockConnector::new();
        let (session, mut inputs_rx) = spawn(connector, 5, Duration::from_secs(5));
        assert_eq!(inputs_rx.recv().await, Some(Input::Opened(5)));

        // The remote never reads, so no pong comes back
        let _remote = remotes.recv().await.unwrap();

        assert!(session.transmit(OutboundFrame::Ping));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(inputs_rx.try_recv().is_err());

        assert!(session.transmit(OutboundFrame::Ping));
        assert!(matches!(inputs_rx.recv().await, Some(Input::Failed(5, Failure::Ping(_)))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_answered_ping_keeps_session_open() {
        let (connector, mut remotes) = MockConnector::new();
        let (session, mut inputs_rx) = spawn(connector, 6, Duration::from_secs(5));
        assert_eq!(inputs_rx.recv().await, Some(Input::Opened(6)));

        // Reading drives tungstenite's automatic pong replies
        let mut remote = remotes.recv().await.unwrap();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(Ok(message)) = remote.next().await {
                let _ = seen_tx.send(message);
            }
        });

        for _ in 0..3 {
            assert!(session.transmit(OutboundFrame::Ping));
            assert!(matches!(seen_rx.recv().await, Some(WsMessage::Ping(_))));
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        assert!(inputs_rx.try_recv().is_err());
    }
}
