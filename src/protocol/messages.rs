//! Protocol message definitions

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────

/// Command understood by the remote controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Up,
    Down,
    Stop,
    Select,
}

impl Command {
    pub const ALL: [Command; 4] = [Command::Up, Command::Down, Command::Stop, Command::Select];

    /// Wire name of the command
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Up => "up",
            Command::Down => "down",
            Command::Stop => "stop",
            Command::Select => "select",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Command::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::malformed(format!("unknown command '{}'", s)))
    }
}

// ─────────────────────────────────────────────────────────────────
// LED Targets
// ─────────────────────────────────────────────────────────────────

/// LED output targeted by a `select` command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Led {
    L1,
    L2,
    L3,
    L4,
    #[serde(rename = "ALL")]
    All,
}

impl Led {
    /// The individually addressable outputs, in panel order
    pub const OUTPUTS: [Led; 4] = [Led::L1, Led::L2, Led::L3, Led::L4];

    pub fn as_str(&self) -> &'static str {
        match self {
            Led::L1 => "L1",
            Led::L2 => "L2",
            Led::L3 => "L3",
            Led::L4 => "L4",
            Led::All => "ALL",
        }
    }
}

impl fmt::Display for Led {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Led {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Led::OUTPUTS
            .into_iter()
            .chain(std::iter::once(Led::All))
            .find(|led| led.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::malformed(format!("unknown LED '{}'", s)))
    }
}

// ─────────────────────────────────────────────────────────────────
// Outbound Frames
// ─────────────────────────────────────────────────────────────────

/// Message sent to the remote as a single text frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub command: Command,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub led: Option<Led>,
}

impl OutboundMessage {
    pub fn new(command: Command, led: Option<Led>) -> Self {
        Self { command, led }
    }

    /// Serialize to the compact JSON text sent on the wire
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ─────────────────────────────────────────────────────────────────
// Inbound Frames
// ─────────────────────────────────────────────────────────────────

/// Decode a binary frame into the selection token text
pub fn decode_binary_frame(data: Vec<u8>) -> Result<String> {
    String::from_utf8(data)
        .map_err(|e| Error::malformed(format!("binary frame is not valid UTF-8: {}", e)))
}
