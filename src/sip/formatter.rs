// SIP message formatter
// Converts SipMessage structs into RFC 3261 byte sequences

use super::message::{Headers, SipMessage};

/// Estimate the output size of a formatted SIP message to pre-allocate buffer.
pub fn estimate_message_size(msg: &SipMessage) -> usize {
    let (start_line, headers, body) = match msg {
        SipMessage::Request(req) => (
            req.method.as_str().len() + req.request_uri.len() + req.version.len() + 4,
            &req.headers,
            &req.body,
        ),
        SipMessage::Response(resp) => (
            resp.version.len() + 5 + resp.reason_phrase.len() + 2,
            &resp.headers,
            &resp.body,
        ),
    };
    let header_size: usize = headers
        .entries()
        .iter()
        .map(|h| h.name.len() + h.value.len() + 4)
        .sum();
    // Room for an auto-added Content-Length header and the separator line
    start_line + header_size + 34 + body.as_ref().map_or(0, |b| b.len())
}

/// Format a SIP message into an existing buffer.
/// The buffer is NOT cleared.
pub fn format_into(buf: &mut Vec<u8>, msg: &SipMessage) {
    match msg {
        SipMessage::Request(req) => {
            buf.extend_from_slice(req.method.as_str().as_bytes());
            buf.push(b' ');
            buf.extend_from_slice(req.request_uri.as_bytes());
            buf.push(b' ');
            buf.extend_from_slice(req.version.as_bytes());
            buf.extend_from_slice(b"\r\n");
            write_headers_and_body(buf, &req.headers, req.body.as_deref());
        }
        SipMessage::Response(resp) => {
            buf.extend_from_slice(resp.version.as_bytes());
            buf.push(b' ');
            let mut itoa_buf = itoa::Buffer::new();
            buf.extend_from_slice(itoa_buf.format(resp.status_code).as_bytes());
            buf.push(b' ');
            buf.extend_from_slice(resp.reason_phrase.as_bytes());
            buf.extend_from_slice(b"\r\n");
            write_headers_and_body(buf, &resp.headers, resp.body.as_deref());
        }
    }
}

fn write_headers_and_body(buf: &mut Vec<u8>, headers: &Headers, body: Option<&[u8]>) {
    for header in headers.entries() {
        buf.extend_from_slice(header.name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(header.value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    match body {
        Some(body) if !body.is_empty() => {
            if headers.get("Content-Length").is_none() {
                buf.extend_from_slice(b"Content-Length: ");
                let mut itoa_buf = itoa::Buffer::new();
                buf.extend_from_slice(itoa_buf.format(body.len()).as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            buf.extend_from_slice(b"\r\n");
            buf.extend_from_slice(body);
        }
        _ => buf.extend_from_slice(b"\r\n"),
    }
}

/// Format a SipMessage into RFC 3261 bytes.
///
/// Request format:
///   METHOD Request-URI SIP/2.0\r\n
///   Header-Name: Header-Value\r\n
///   \r\n
///   [body]
pub fn format_sip_message(msg: &SipMessage) -> Vec<u8> {
    let mut buf = Vec::with_capacity(estimate_message_size(msg));
    format_into(&mut buf, msg);
    buf
}

/// Text rendering for the signaling trace. Non UTF-8 bodies are replaced
/// lossily.
pub fn format_sip_text(msg: &SipMessage) -> String {
    String::from_utf8_lossy(&format_sip_message(msg)).into_owned()
}
