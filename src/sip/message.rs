// SIP message data model

use std::fmt;

/// SIP method types used on the ISSI signaling plane
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Info,
    Other(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Register => "REGISTER",
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Options => "OPTIONS",
            Method::Info => "INFO",
            Method::Other(s) => s.as_str(),
        }
    }

    /// Map a method token to a Method. Matching is case-insensitive so
    /// trigger patterns written as "invite" still match.
    pub fn from_token(token: &str) -> Method {
        match token.to_ascii_uppercase().as_str() {
            "REGISTER" => Method::Register,
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "OPTIONS" => Method::Options,
            "INFO" => Method::Info,
            other => Method::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single SIP header (name-value pair)
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// Ordered collection of SIP headers with case-insensitive lookup
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Headers {
    entries: Vec<Header>,
}

impl Headers {
    pub fn new() -> Self {
        Headers {
            entries: Vec::new(),
        }
    }

    /// Get the first header value matching the name (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Get all header values matching the name, in order
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
            .collect()
    }

    /// Set a header value, replacing any existing headers with the same name
    pub fn set(&mut self, name: &str, value: String) {
        self.remove(name);
        self.add(name, value);
    }

    /// Add a header value without removing existing headers with the same name
    pub fn add(&mut self, name: &str, value: String) {
        self.entries.push(Header {
            name: name.to_string(),
            value,
        });
    }

    /// Remove all headers matching the name (case-insensitive)
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|h| !h.name.eq_ignore_ascii_case(name));
    }

    pub fn entries(&self) -> &[Header] {
        &self.entries
    }
}

/// SIP request message
#[derive(Debug, Clone, PartialEq)]
pub struct SipRequest {
    pub method: Method,
    pub request_uri: String,
    pub version: String,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
}

impl SipRequest {
    pub fn new(method: Method, request_uri: impl Into<String>) -> Self {
        Self {
            method,
            request_uri: request_uri.into(),
            version: "SIP/2.0".to_string(),
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn call_id(&self) -> &str {
        self.headers.get("Call-ID").unwrap_or("")
    }

    /// CSeq sequence number, 0 if absent or malformed
    pub fn cseq_number(&self) -> u32 {
        cseq_parts(self.headers.get("CSeq")).0
    }
}

/// SIP response message
#[derive(Debug, Clone, PartialEq)]
pub struct SipResponse {
    pub version: String,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
}

impl SipResponse {
    pub fn call_id(&self) -> &str {
        self.headers.get("Call-ID").unwrap_or("")
    }

    /// Method of the transaction this response belongs to, from CSeq
    pub fn cseq_method(&self) -> Option<Method> {
        cseq_parts(self.headers.get("CSeq")).1
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status_code)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

fn cseq_parts(value: Option<&str>) -> (u32, Option<Method>) {
    let Some(value) = value else {
        return (0, None);
    };
    let mut parts = value.split_whitespace();
    let number = parts.next().and_then(|n| n.parse().ok()).unwrap_or(0);
    let method = parts.next().map(Method::from_token);
    (number, method)
}

/// Top-level SIP message enum
#[derive(Debug, Clone, PartialEq)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn call_id(&self) -> &str {
        match self {
            SipMessage::Request(r) => r.call_id(),
            SipMessage::Response(r) => r.call_id(),
        }
    }

    /// One-line summary used in logs and the signaling trace index
    pub fn summary(&self) -> String {
        match self {
            SipMessage::Request(r) => format!("{} {}", r.method, r.request_uri),
            SipMessage::Response(r) => {
                let method = r
                    .cseq_method()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "?".to_string());
                format!("{} {} ({})", r.status_code, r.reason_phrase, method)
            }
        }
    }
}
