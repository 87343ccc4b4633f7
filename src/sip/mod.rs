pub mod formatter;
pub mod message;
pub mod parser;

use std::fmt::Write;
use std::hash::{Hash, Hasher};

use message::{Headers, SipRequest, SipResponse};

pub const PRIORITY_HEADER: &str = "Resource-Priority";
pub const CALL_PARAM_HEADER: &str = "X-P25-Call-Param";
pub const WARNING_HEADER: &str = "Warning";
/// Group addressed by a group-call INVITE
pub const GROUP_HEADER: &str = "X-P25-Group";

/// Branch parameter derived from Call-ID, CSeq and method.
/// Same inputs always yield the same branch.
pub fn generate_branch(call_id: &str, cseq: u32, method: &str) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    call_id.hash(&mut hasher);
    cseq.hash(&mut hasher);
    method.hash(&mut hasher);
    let mut buf = String::with_capacity(23);
    buf.push_str("z9hG4bK");
    let _ = write!(buf, "{:016x}", hasher.finish());
    buf
}

/// Responses an emulated unit sends during call control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssiResponse {
    Trying,
    Ringing,
    SessionProgressNoRfResources,
    Accepted,
    Busy,
    DeclinedCollidingCall,
    NoRfResource,
    RequestTerminated,
    CallDoesNotExist,
}

impl IssiResponse {
    pub fn status_code(self) -> u16 {
        match self {
            IssiResponse::Trying => 100,
            IssiResponse::Ringing => 180,
            IssiResponse::SessionProgressNoRfResources => 183,
            IssiResponse::Accepted => 200,
            IssiResponse::NoRfResource => 480,
            IssiResponse::CallDoesNotExist => 481,
            IssiResponse::Busy => 486,
            IssiResponse::RequestTerminated => 487,
            IssiResponse::DeclinedCollidingCall => 603,
        }
    }

    pub fn reason_phrase(self) -> &'static str {
        match self {
            IssiResponse::Trying => "Trying",
            IssiResponse::Ringing => "Ringing",
            IssiResponse::SessionProgressNoRfResources => "Session Progress",
            IssiResponse::Accepted => "OK",
            IssiResponse::NoRfResource => "Temporarily Unavailable",
            IssiResponse::CallDoesNotExist => "Call/Transaction Does Not Exist",
            IssiResponse::Busy => "Busy Here",
            IssiResponse::RequestTerminated => "Request Terminated",
            IssiResponse::DeclinedCollidingCall => "Decline",
        }
    }

    /// Warning text distinguishing ISSI outcomes that share a status code
    pub fn warning(self) -> Option<&'static str> {
        match self {
            IssiResponse::SessionProgressNoRfResources => Some("No RF resources"),
            IssiResponse::NoRfResource => Some("No RF resource"),
            IssiResponse::DeclinedCollidingCall => Some("Colliding call"),
            _ => None,
        }
    }
}

/// Build a response to `request`, copying Via, From, To, Call-ID and CSeq.
/// `to_tag` is appended to the To header when the request has none.
pub fn build_response(
    request: &SipRequest,
    response: IssiResponse,
    to_tag: Option<&str>,
) -> SipResponse {
    let mut headers = Headers::new();
    for via in request.headers.get_all("Via") {
        headers.add("Via", via.to_string());
    }
    if let Some(from) = request.headers.get("From") {
        headers.set("From", from.to_string());
    }
    if let Some(to) = request.headers.get("To") {
        let to = match to_tag {
            Some(tag) if !to.contains(";tag=") => format!("{};tag={}", to, tag),
            _ => to.to_string(),
        };
        headers.set("To", to);
    }
    if let Some(call_id) = request.headers.get("Call-ID") {
        headers.set("Call-ID", call_id.to_string());
    }
    if let Some(cseq) = request.headers.get("CSeq") {
        headers.set("CSeq", cseq.to_string());
    }
    if let Some(warning) = response.warning() {
        headers.set(WARNING_HEADER, format!("399 issi \"{}\"", warning));
    }

    SipResponse {
        version: "SIP/2.0".to_string(),
        status_code: response.status_code(),
        reason_phrase: response.reason_phrase().to_string(),
        headers,
        body: None,
    }
}

/// Classify a received response back into the ISSI vocabulary
pub fn classify_response(response: &SipResponse) -> Option<IssiResponse> {
    let warning = response.headers.get(WARNING_HEADER).unwrap_or("");
    let candidates = [
        IssiResponse::Trying,
        IssiResponse::Ringing,
        IssiResponse::SessionProgressNoRfResources,
        IssiResponse::Accepted,
        IssiResponse::Busy,
        IssiResponse::DeclinedCollidingCall,
        IssiResponse::NoRfResource,
        IssiResponse::RequestTerminated,
        IssiResponse::CallDoesNotExist,
    ];
    candidates.into_iter().find(|c| {
        c.status_code() == response.status_code
            && c.warning().map_or(true, |w| warning.contains(w))
    })
}

/// Call parameters carried on an INVITE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallParams {
    pub priority: u8,
    pub emergency: bool,
    pub full_duplex: bool,
    pub protected: bool,
    /// Caller asks the serving node to check RF resource availability
    pub availability_check: bool,
    /// Setup continues a call after the unit roamed
    pub in_call_roam: bool,
}

impl CallParams {
    pub fn apply(&self, headers: &mut Headers) {
        headers.set(PRIORITY_HEADER, format!("p25.{}", self.priority));
        headers.set(
            CALL_PARAM_HEADER,
            format!(
                "emergency={};full-duplex={};protected={};resavail={};in-call-roam={}",
                self.emergency as u8,
                self.full_duplex as u8,
                self.protected as u8,
                self.availability_check as u8,
                self.in_call_roam as u8,
            ),
        );
    }

    /// Missing headers yield defaults (priority 0, all flags off)
    pub fn from_headers(headers: &Headers) -> Self {
        let mut params = CallParams::default();
        if let Some(value) = headers.get(PRIORITY_HEADER) {
            params.priority = value
                .trim()
                .strip_prefix("p25.")
                .and_then(|p| p.parse().ok())
                .unwrap_or(0);
        }
        if let Some(value) = headers.get(CALL_PARAM_HEADER) {
            for pair in value.split(';') {
                let mut kv = pair.splitn(2, '=');
                let key = kv.next().unwrap_or("").trim();
                let on = kv.next().map(|v| v.trim() == "1").unwrap_or(false);
                match key {
                    "emergency" => params.emergency = on,
                    "full-duplex" => params.full_duplex = on,
                    "protected" => params.protected = on,
                    "resavail" => params.availability_check = on,
                    "in-call-roam" => params.in_call_roam = on,
                    _ => {}
                }
            }
        }
        params
    }
}
