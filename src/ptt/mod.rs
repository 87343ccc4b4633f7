// Push-to-talk media-control packets
//
// The media plane itself is emulated only as far as the control packets the
// scheduler can trigger on: spurt arbitration, mute and heartbeats.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::IssiTesterError;

/// Control type of a PTT packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PttControlType {
    SpurtRequest,
    SpurtGrant,
    SpurtStart,
    SpurtProgress,
    SpurtEnd,
    Mute,
    Unmute,
    SpurtDeny,
    SpurtWait,
    HeartbeatQuery,
    Heartbeat,
}

impl PttControlType {
    pub const ALL: [PttControlType; 11] = [
        PttControlType::SpurtRequest,
        PttControlType::SpurtGrant,
        PttControlType::SpurtStart,
        PttControlType::SpurtProgress,
        PttControlType::SpurtEnd,
        PttControlType::Mute,
        PttControlType::Unmute,
        PttControlType::SpurtDeny,
        PttControlType::SpurtWait,
        PttControlType::HeartbeatQuery,
        PttControlType::Heartbeat,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PttControlType::SpurtRequest => "spurt_request",
            PttControlType::SpurtGrant => "spurt_grant",
            PttControlType::SpurtStart => "spurt_start",
            PttControlType::SpurtProgress => "spurt_progress",
            PttControlType::SpurtEnd => "spurt_end",
            PttControlType::Mute => "mute",
            PttControlType::Unmute => "unmute",
            PttControlType::SpurtDeny => "spurt_deny",
            PttControlType::SpurtWait => "spurt_wait",
            PttControlType::HeartbeatQuery => "heartbeat_query",
            PttControlType::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for PttControlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PttControlType {
    type Err = IssiTesterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        PttControlType::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| IssiTesterError::ConfigError(format!("unknown PTT control type: {}", s)))
    }
}

/// A media-control packet exchanged between the units of a call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PttPacket {
    pub control: PttControlType,
    /// Call-ID of the SIP session the packet belongs to
    pub session: String,
    /// Unit that originated the packet
    pub source_unit: String,
    pub target_unit: String,
    #[serde(default)]
    pub sequence: u32,
}

impl PttPacket {
    pub fn new(
        control: PttControlType,
        session: impl Into<String>,
        source_unit: impl Into<String>,
        target_unit: impl Into<String>,
    ) -> Self {
        Self {
            control,
            session: session.into(),
            source_unit: source_unit.into(),
            target_unit: target_unit.into(),
            sequence: 0,
        }
    }

    /// The automatic answer an emulated unit gives to this packet, if any
    pub fn reply_control(&self) -> Option<PttControlType> {
        match self.control {
            PttControlType::HeartbeatQuery => Some(PttControlType::Heartbeat),
            PttControlType::SpurtRequest => Some(PttControlType::SpurtGrant),
            _ => None,
        }
    }

    pub fn reply(&self, control: PttControlType) -> PttPacket {
        PttPacket {
            control,
            session: self.session.clone(),
            source_unit: self.target_unit.clone(),
            target_unit: self.source_unit.clone(),
            sequence: self.sequence.wrapping_add(1),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, IssiTesterError> {
        serde_json::to_vec(self)
            .map_err(|e| IssiTesterError::ParseError(format!("PTT encode error: {}", e)))
    }

    pub fn decode(data: &[u8]) -> Result<Self, IssiTesterError> {
        serde_json::from_slice(data)
            .map_err(|e| IssiTesterError::ParseError(format!("PTT decode error: {}", e)))
    }
}
