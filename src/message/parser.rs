use super::{Method, Request, Response, SipMessage, StatusCode, Uri, Version};
use crate::error::ParseErrorKind;
use crate::{Error, Result};

const MAX_MESSAGE_SIZE: usize = 65535;

/// Parses one complete SIP message.
///
/// The header section must be terminated by a blank line; header lines may
/// be folded over multiple physical lines (the folded parts are rejoined
/// with single spaces). Compact header names are expanded, header name
/// lookup is case-insensitive, and the value keeps its whitespace verbatim
/// after the single leading space. When a numeric Content-Length is present
/// it must match the body carried by the frame.
pub fn parse_message(bytes: &[u8]) -> Result<SipMessage> {
    if bytes.is_empty() {
        return Err(Error::MalformedMessage(ParseErrorKind::Truncated));
    }
    let (head_end, body_start) = match find_header_terminator(bytes) {
        Some(pos) => pos,
        None => return Err(Error::MalformedMessage(ParseErrorKind::UnterminatedHeader)),
    };
    let head = std::str::from_utf8(&bytes[..head_end])
        .map_err(|_| Error::MalformedMessage(ParseErrorKind::MalformedHeader))?;
    let body = &bytes[body_start..];

    let mut lines = unfold_lines(head);
    if lines.is_empty() {
        return Err(Error::MalformedMessage(ParseErrorKind::MalformedStartLine));
    }
    let start_line = lines.remove(0);

    let mut message = parse_start_line(&start_line)?;

    let headers = match &mut message {
        SipMessage::Request(r) => &mut r.headers,
        SipMessage::Response(r) => &mut r.headers,
    };
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or(Error::MalformedMessage(ParseErrorKind::MalformedHeader))?;
        let name = name.trim();
        if name.is_empty() || !name.bytes().all(is_token_char) {
            return Err(Error::MalformedMessage(ParseErrorKind::MalformedHeader));
        }
        headers.push(name, value.trim_start_matches([' ', '\t']).trim_end());
    }

    if let Some(declared) = headers.get("Content-Length") {
        let declared: usize = declared
            .trim()
            .parse()
            .map_err(|_| Error::MalformedMessage(ParseErrorKind::BadContentLength))?;
        if declared != body.len() {
            return Err(Error::MalformedMessage(ParseErrorKind::BadContentLength));
        }
    }

    match &mut message {
        SipMessage::Request(r) => r.body = body.to_vec(),
        SipMessage::Response(r) => r.body = body.to_vec(),
    }
    Ok(message)
}

/// Scans a byte buffer for one complete message frame and returns its
/// total length, or `None` when more bytes are needed. Used by the stream
/// transport to slice messages out of a TCP byte stream.
pub fn probe_frame(buf: &[u8]) -> Result<Option<usize>> {
    let (head_end, body_start) = match find_header_terminator(buf) {
        Some(pos) => pos,
        None => {
            if buf.len() > MAX_MESSAGE_SIZE {
                return Err(Error::MalformedMessage(ParseErrorKind::UnterminatedHeader));
            }
            return Ok(None);
        }
    };
    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| Error::MalformedMessage(ParseErrorKind::MalformedHeader))?;
    let mut content_length = 0usize;
    for line in unfold_lines(head).into_iter().skip(1) {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            if name.eq_ignore_ascii_case("Content-Length") || name.eq_ignore_ascii_case("l") {
                content_length = value
                    .trim()
                    .parse()
                    .map_err(|_| Error::MalformedMessage(ParseErrorKind::BadContentLength))?;
                break;
            }
        }
    }
    Ok(Some(body_start + content_length))
}

/// Locates the blank line ending the header section. Returns the offset of
/// the head end and of the body start. CRLF line endings are canonical;
/// bare LF is tolerated.
fn find_header_terminator(bytes: &[u8]) -> Option<(usize, usize)> {
    if let Some(pos) = find_subsequence(bytes, b"\r\n\r\n") {
        return Some((pos, pos + 4));
    }
    find_subsequence(bytes, b"\n\n").map(|pos| (pos, pos + 2))
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Splits the head into logical lines, rejoining folded continuations.
/// A continuation's leading whitespace and the fold itself collapse to a
/// single space.
fn unfold_lines(head: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in head.split('\n') {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        if raw.is_empty() {
            continue;
        }
        if raw.starts_with(' ') || raw.starts_with('\t') {
            if let Some(last) = lines.last_mut() {
                let trimmed = last.trim_end().to_string();
                *last = trimmed;
                last.push(' ');
                last.push_str(raw.trim_start());
                continue;
            }
        }
        lines.push(raw.to_string());
    }
    lines
}

fn parse_start_line(line: &str) -> Result<SipMessage> {
    if let Some(rest) = line.strip_prefix("SIP/") {
        // status line
        let (version, rest) = rest
            .split_once(' ')
            .ok_or(Error::MalformedMessage(ParseErrorKind::MalformedStartLine))?;
        if version != "2.0" {
            return Err(Error::MalformedMessage(ParseErrorKind::UnsupportedVersion));
        }
        let (code, reason) = match rest.split_once(' ') {
            Some((c, r)) => (c, r),
            None => (rest, ""),
        };
        let code: u16 = code
            .parse()
            .map_err(|_| Error::MalformedMessage(ParseErrorKind::MalformedStartLine))?;
        if !(100..=699).contains(&code) {
            return Err(Error::MalformedMessage(ParseErrorKind::MalformedStartLine));
        }
        return Ok(SipMessage::Response(Response {
            version: Version::V2,
            status: StatusCode(code),
            reason: reason.to_string(),
            ..Default::default()
        }));
    }

    let mut parts = line.split(' ').filter(|p| !p.is_empty());
    let method = parts
        .next()
        .ok_or(Error::MalformedMessage(ParseErrorKind::MalformedStartLine))?;
    let uri = parts
        .next()
        .ok_or(Error::MalformedMessage(ParseErrorKind::MalformedStartLine))?;
    let version = parts
        .next()
        .ok_or(Error::MalformedMessage(ParseErrorKind::MalformedStartLine))?;
    if parts.next().is_some() {
        return Err(Error::MalformedMessage(ParseErrorKind::MalformedStartLine));
    }
    if !version.eq_ignore_ascii_case("SIP/2.0") {
        return Err(Error::MalformedMessage(ParseErrorKind::UnsupportedVersion));
    }
    let uri =
        Uri::parse(uri).map_err(|_| Error::MalformedMessage(ParseErrorKind::MalformedStartLine))?;
    Ok(SipMessage::Request(Request {
        method: Method::parse(method),
        uri,
        version: Version::V2,
        ..Default::default()
    }))
}

fn is_token_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"-.!%*_+`'~".contains(&b)
}
