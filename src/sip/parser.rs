// SIP message parser using nom combinators

use nom::{
    bytes::complete::{tag, take_until, take_while1},
    character::complete::{digit1, space0, space1},
    IResult,
};

use super::message::{Headers, Method, SipMessage, SipRequest, SipResponse};
use crate::error::IssiTesterError;

/// Parse a SIP message from a received datagram.
///
/// A first line starting with "SIP/" is a response, anything else is
/// treated as a request line.
pub fn parse_sip_message(input: &[u8]) -> Result<SipMessage, IssiTesterError> {
    if input.is_empty() {
        return Err(parse_error("empty input"));
    }

    if input.starts_with(b"SIP/") {
        parse_response(input)
    } else {
        parse_request(input)
    }
}

fn parse_error(message: impl Into<String>) -> IssiTesterError {
    IssiTesterError::ParseError(message.into())
}

fn crlf(input: &[u8]) -> IResult<&[u8], &[u8]> {
    tag(b"\r\n")(input)
}

/// METHOD SP Request-URI SP SIP-Version CRLF
fn request_line(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8], &[u8])> {
    let (input, method) = take_while1(|b: u8| b.is_ascii_alphabetic())(input)?;
    let (input, _) = space1(input)?;
    let (input, uri) = take_while1(|b: u8| b != b' ' && b != b'\r' && b != b'\n')(input)?;
    let (input, _) = space1(input)?;
    let (input, version) = take_until("\r\n")(input)?;
    let (input, _) = crlf(input)?;
    Ok((input, (method, uri, version)))
}

/// SIP-Version SP Status-Code SP Reason-Phrase CRLF
fn status_line(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8], &[u8])> {
    let (input, version) = take_while1(|b: u8| b != b' ' && b != b'\r' && b != b'\n')(input)?;
    let (input, _) = space1(input)?;
    let (input, status_code) = digit1(input)?;
    let (input, _) = space1(input)?;
    let (input, reason) = take_until("\r\n")(input)?;
    let (input, _) = crlf(input)?;
    Ok((input, (version, status_code, reason)))
}

fn header_line(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8])> {
    let (input, name) = take_while1(|b: u8| b != b':' && b != b'\r' && b != b'\n')(input)?;
    let (input, _) = tag(b":")(input)?;
    let (input, _) = space0(input)?;
    let (input, value) = take_until("\r\n")(input)?;
    let (input, _) = crlf(input)?;
    Ok((input, (name, value)))
}

/// Header lines up to and including the empty separator line
fn header_block(mut input: &[u8]) -> IResult<&[u8], Vec<(&[u8], &[u8])>> {
    let mut headers = Vec::new();
    loop {
        if input.starts_with(b"\r\n") {
            let (remaining, _) = crlf(input)?;
            return Ok((remaining, headers));
        }
        if input.is_empty() {
            return Ok((input, headers));
        }
        let (remaining, header) = header_line(input)?;
        headers.push(header);
        input = remaining;
    }
}

fn utf8<'a>(bytes: &'a [u8], what: &str) -> Result<&'a str, IssiTesterError> {
    std::str::from_utf8(bytes).map_err(|_| parse_error(format!("invalid UTF-8 in {}", what)))
}

fn decode_headers(input: &[u8]) -> Result<(&[u8], Headers), IssiTesterError> {
    let (remaining, raw) =
        header_block(input).map_err(|e| parse_error(format!("invalid headers: {}", e)))?;
    let mut headers = Headers::new();
    for (name, value) in raw {
        let name = utf8(name, "header name")?.trim();
        let value = utf8(value, "header value")?.trim();
        headers.add(name, value.to_string());
    }
    Ok((remaining, headers))
}

fn parse_request(input: &[u8]) -> Result<SipMessage, IssiTesterError> {
    let (remaining, (method, uri, version)) =
        request_line(input).map_err(|e| parse_error(format!("invalid request line: {}", e)))?;

    let method = Method::from_token(utf8(method, "method")?);
    let request_uri = utf8(uri, "request URI")?.to_string();
    let version = utf8(version, "SIP version")?.to_string();
    if !version.starts_with("SIP/") {
        return Err(parse_error(format!("invalid SIP version: {}", version)));
    }

    let (remaining, headers) = decode_headers(remaining)?;
    let body = parse_body(remaining, &headers)?;

    Ok(SipMessage::Request(SipRequest {
        method,
        request_uri,
        version,
        headers,
        body,
    }))
}

fn parse_response(input: &[u8]) -> Result<SipMessage, IssiTesterError> {
    let (remaining, (version, status, reason)) =
        status_line(input).map_err(|e| parse_error(format!("invalid status line: {}", e)))?;

    let version = utf8(version, "SIP version")?.to_string();
    let status = utf8(status, "status code")?;
    let status_code: u16 = status
        .parse()
        .map_err(|_| parse_error(format!("invalid status code: {}", status)))?;
    let reason_phrase = utf8(reason, "reason phrase")?.to_string();

    let (remaining, headers) = decode_headers(remaining)?;
    let body = parse_body(remaining, &headers)?;

    Ok(SipMessage::Response(SipResponse {
        version,
        status_code,
        reason_phrase,
        headers,
        body,
    }))
}

/// Body bytes bounded by Content-Length when present
fn parse_body(remaining: &[u8], headers: &Headers) -> Result<Option<Vec<u8>>, IssiTesterError> {
    let content_length = headers
        .get("Content-Length")
        .map(|v| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| parse_error(format!("invalid Content-Length: {}", v)))
        })
        .transpose()?;

    match content_length {
        Some(0) => Ok(None),
        Some(len) if remaining.len() < len => Err(parse_error(format!(
            "body too short: expected {} bytes, got {}",
            len,
            remaining.len()
        ))),
        Some(len) => Ok(Some(remaining[..len].to_vec())),
        None if remaining.is_empty() => Ok(None),
        None => Ok(Some(remaining.to_vec())),
    }
}
