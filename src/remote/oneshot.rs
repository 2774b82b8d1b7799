//! One-shot command delivery for the `send` subcommand

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use crate::error::{Error, Result};
use crate::protocol::{Command, Led};

/// Parameters for a single send
#[derive(Debug, Clone)]
pub struct OneShot {
    pub command: Command,
    pub led: Option<Led>,
    /// Endpoint shown in errors
    pub endpoint: String,
    pub connect_timeout: Duration,
    /// How long to wait for a selection token after sending (zero = don't)
    pub reply_wait: Duration,
}

/// Connect, send one frame, optionally wait for one token, then disconnect.
///
/// Unlike the console, a failed open is not retried.
pub async fn send_once(
    manager: ConnectionManager,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    request: OneShot,
) -> Result<Option<String>> {
    manager.connect()?;

    let opened = timeout(request.connect_timeout, wait_for_open(&mut events, &request.endpoint)).await;
    let outcome = match opened {
        Ok(Ok(())) => deliver(&manager, &mut events, &request).await,
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Error::connection_timeout(
            &request.endpoint,
            request.connect_timeout.as_secs(),
        )),
    };

    manager.shutdown().await?;
    outcome
}

async fn wait_for_open(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>, endpoint: &str) -> Result<()> {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::StateChanged(ConnectionState::Connected) => return Ok(()),
            ConnectionEvent::StateChanged(ConnectionState::Disconnected) => {
                return Err(Error::connection_failed(endpoint, "connection could not be opened"));
            }
            other => debug!(event = ?other, "Waiting for connection"),
        }
    }
    Err(Error::Connection("connection manager stopped".to_string()))
}

async fn deliver(
    manager: &ConnectionManager,
    events: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
    request: &OneShot,
) -> Result<Option<String>> {
    manager.send(request.command, request.led)?;
    info!(command = %request.command, led = ?request.led, "Command sent");

    if request.reply_wait.is_zero() {
        return Ok(None);
    }

    let reply = timeout(request.reply_wait, async {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Message(token) => return Ok(token),
                ConnectionEvent::StateChanged(ConnectionState::Disconnected) => {
                    return Err(Error::ConnectionLost {
                        message: "connection dropped while waiting for a reply".to_string(),
                    });
                }
                ConnectionEvent::StateChanged(_) => {}
            }
        }
        Err(Error::Connection("connection manager stopped".to_string()))
    })
    .await;

    match reply {
        Ok(token) => token.map(Some),
        Err(_) => {
            warn!(wait_secs = request.reply_wait.as_secs(), "No reply from remote");
            Ok(None)
        }
    }
}
