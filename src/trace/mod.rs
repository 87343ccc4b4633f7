// Per-node signaling log (SIP and PTT trace)

use std::fmt::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::IssiTesterError;
use crate::ptt::{PttControlType, PttPacket};
use crate::sip::formatter::format_sip_text;
use crate::sip::message::SipMessage;
use crate::trigger::ObservedEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Sent,
    Received,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Sip,
    Ptt,
}

/// One captured message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingRecord {
    /// Milliseconds since the log was (re)started
    pub elapsed_ms: u64,
    pub node: String,
    /// Remote node the message went to or came from
    pub peer: String,
    pub direction: Direction,
    pub kind: RecordKind,
    pub call_id: String,
    /// Request method; for responses, the CSeq method
    pub method: Option<String>,
    pub status: Option<u16>,
    pub ptt: Option<PttControlType>,
    pub summary: String,
    /// Full message text, kept only while trace capture is enabled
    pub text: Option<String>,
}

impl SignalingRecord {
    pub fn is_request(&self) -> bool {
        self.kind == RecordKind::Sip && self.status.is_none()
    }
}

pub struct SignalingLog {
    node: String,
    started: Mutex<Instant>,
    records: Mutex<Vec<SignalingRecord>>,
    capture_text: AtomicBool,
}

impl SignalingLog {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            started: Mutex::new(Instant::now()),
            records: Mutex::new(Vec::new()),
            capture_text: AtomicBool::new(true),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn set_capture(&self, enabled: bool) {
        self.capture_text.store(enabled, Ordering::Relaxed);
    }

    /// Drop all records and restart the elapsed clock
    pub fn reset(&self) {
        if let Ok(mut started) = self.started.lock() {
            *started = Instant::now();
        }
        if let Ok(mut records) = self.records.lock() {
            records.clear();
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started
            .lock()
            .map(|started| started.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    pub fn record(&self, direction: Direction, peer: &str, event: &ObservedEvent) {
        let capture = self.capture_text.load(Ordering::Relaxed);
        let mut record = SignalingRecord {
            elapsed_ms: self.elapsed_ms(),
            node: self.node.clone(),
            peer: peer.to_string(),
            direction,
            kind: RecordKind::Sip,
            call_id: String::new(),
            method: None,
            status: None,
            ptt: None,
            summary: event.summary(),
            text: None,
        };
        match event {
            ObservedEvent::Sip(msg) => {
                record.call_id = msg.call_id().to_string();
                match msg {
                    SipMessage::Request(req) => record.method = Some(req.method.to_string()),
                    SipMessage::Response(resp) => {
                        record.method = resp.cseq_method().map(|m| m.to_string());
                        record.status = Some(resp.status_code);
                    }
                }
                if capture {
                    record.text = Some(format_sip_text(msg));
                }
            }
            ObservedEvent::Ptt(packet) => {
                record.kind = RecordKind::Ptt;
                record.call_id = packet.session.clone();
                record.ptt = Some(packet.control);
                if capture {
                    record.text = Some(ptt_text(packet));
                }
            }
        }
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }

    pub fn records(&self) -> Vec<SignalingRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// SIP messages in arrival order, one block per message
    pub fn sip_trace(&self) -> String {
        self.trace_of(RecordKind::Sip)
    }

    pub fn ptt_trace(&self) -> String {
        self.trace_of(RecordKind::Ptt)
    }

    fn trace_of(&self, kind: RecordKind) -> String {
        let mut out = String::new();
        for record in self.records().iter().filter(|r| r.kind == kind) {
            let arrow = match record.direction {
                Direction::Sent => "->",
                Direction::Received => "<-",
            };
            let _ = writeln!(
                out,
                "[{:>8} ms] {} {} {}: {}",
                record.elapsed_ms, record.node, arrow, record.peer, record.summary
            );
            if let Some(text) = &record.text {
                out.push_str(text);
                if !text.ends_with('\n') {
                    out.push('\n');
                }
            }
        }
        out
    }

    pub fn to_json(&self) -> Result<String, IssiTesterError> {
        serde_json::to_string_pretty(&self.records())
            .map_err(|e| IssiTesterError::ConfigError(format!("trace serialization: {}", e)))
    }
}

fn ptt_text(packet: &PttPacket) -> String {
    format!(
        "{} session={} {} -> {} seq={}\n",
        packet.control, packet.session, packet.source_unit, packet.target_unit, packet.sequence
    )
}
