//! Remote controller
//!
//! Sits on top of the [`ConnectionManager`] the way an app screen would:
//! it starts the connection, keeps a heartbeat going while in the
//! foreground, and remembers which LED the remote last reported as selected.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use crate::error::Result;
use crate::protocol::{Command, Led};

pub struct RemoteController {
    manager: ConnectionManager,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    heartbeat_interval: Duration,
    heartbeat: Option<JoinHandle<()>>,
    selection: Option<String>,
}

impl RemoteController {
    pub fn new(
        manager: ConnectionManager,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            manager,
            events,
            heartbeat_interval,
            heartbeat: None,
            selection: None,
        }
    }

    /// Connect and start the heartbeat
    pub fn start(&mut self) -> Result<()> {
        info!(heartbeat_secs = self.heartbeat_interval.as_secs(), "Starting remote controller");
        self.manager.connect()?;
        self.start_heartbeat();
        Ok(())
    }

    /// Returning to the foreground: resume the heartbeat and reconnect if the
    /// connection was lost meanwhile
    pub fn foreground(&mut self) -> Result<()> {
        debug!("Entering foreground");
        self.start_heartbeat();
        self.manager.reconnect_if_needed()
    }

    /// Going to the background: stop the heartbeat and any pending reconnect.
    /// An open connection is left alone.
    pub fn background(&mut self) -> Result<()> {
        debug!("Entering background");
        self.stop_heartbeat();
        self.manager.cancel_reconnect()
    }

    pub fn send_command(&self, command: Command, led: Option<Led>) -> Result<()> {
        self.manager.send(command, led)
    }

    /// Wait for the next manager event, tracking the selection token
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        let event = self.events.recv().await?;
        if let ConnectionEvent::Message(ref token) = event {
            self.selection = Some(token.clone());
        }
        Some(event)
    }

    /// Last selection token reported by the remote
    pub fn selected(&self) -> Option<&str> {
        self.selection.as_deref()
    }

    /// Whether `led` is lit under the current selection
    pub fn is_selected(&self, led: Led) -> bool {
        matches!(self.selected(), Some(token) if token == led.as_str() || token == Led::All.as_str())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.manager.connection_state()
    }

    #[cfg(test)]
    pub fn heartbeat_running(&self) -> bool {
        self.heartbeat.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the heartbeat and shut the connection down
    pub async fn shutdown(mut self) -> Result<()> {
        self.stop_heartbeat();
        self.manager.shutdown().await
    }

    fn start_heartbeat(&mut self) {
        self.stop_heartbeat();

        let manager = self.manager.clone();
        let period = self.heartbeat_interval;
        self.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !manager.connection_state().is_connected() {
                    continue;
                }
                if manager.send_ping().is_err() {
                    debug!("Connection manager gone, heartbeat stopping");
                    break;
                }
            }
        }));
    }

    fn stop_heartbeat(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

impl Drop for RemoteController {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}
