//! Mock connector for testing
//!
//! Opens sessions over in-memory duplex pipes instead of TCP. The remote end
//! of every accepted session is handed to the test through a channel, so the
//! test plays the server: it reads command frames, pushes selection tokens
//! and closes or drops the socket to simulate failures.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;

use crate::error::{Error, Result};

use super::transport::{ConnectRequest, Connector};

/// Server side of a mock session
pub type RemoteSocket = WebSocketStream<DuplexStream>;

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Default)]
struct Behavior {
    /// Number of upcoming connects to refuse
    refuse: u32,
    /// Never complete a connect
    hang: bool,
}

struct Shared {
    accepted: mpsc::UnboundedSender<RemoteSocket>,
    requests: Mutex<Vec<ConnectRequest>>,
    behavior: Mutex<Behavior>,
}

/// In-memory connector. Clones share the same recorded state.
#[derive(Clone)]
pub struct MockConnector {
    shared: Arc<Shared>,
}

impl MockConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RemoteSocket>) {
        let (accepted, remotes) = mpsc::unbounded_channel();
        let connector = Self {
            shared: Arc::new(Shared {
                accepted,
                requests: Mutex::new(Vec::new()),
                behavior: Mutex::new(Behavior::default()),
            }),
        };
        (connector, remotes)
    }

    /// Refuse the next `count` connects
    pub fn refuse_next(&self, count: u32) {
        self.shared.behavior.lock().refuse = count;
    }

    /// Make connects hang until the caller gives up
    pub fn hang_connects(&self, hang: bool) {
        self.shared.behavior.lock().hang = hang;
    }

    /// Every request seen so far, including refused ones
    pub fn requests(&self) -> Vec<ConnectRequest> {
        self.shared.requests.lock().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.shared.requests.lock().len()
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Io = DuplexStream;

    async fn connect(&self, request: ConnectRequest) -> Result<WebSocketStream<DuplexStream>> {
        self.shared.requests.lock().push(request.clone());

        let hang = {
            let mut behavior = self.shared.behavior.lock();
            if behavior.refuse > 0 {
                behavior.refuse -= 1;
                return Err(Error::connection_failed(request.endpoint(), "connection refused"));
            }
            behavior.hang
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        let _ = self.shared.accepted.send(server);

        Ok(client)
    }
}
