//! SIP wire codec: message model, ordered header map, URI handling, and
//! the parser/serializer pair.
//!
//! Serialization is deterministic: canonical header order, one CRLF per
//! header line, a blank-line separator, the body appended verbatim, and
//! `Content-Length` recomputed from the body and emitted last.

pub mod headers;
pub mod parser;
pub mod uri;

pub use headers::{Header, HeaderName, Headers};
pub use uri::{HostPort, Scheme, Uri, UserInfo};

use crate::{Error, Result};
use crate::error::ParseErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    #[default]
    V2,
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SIP/2.0")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Message,
    Info,
    Update,
    Refer,
    Subscribe,
    Notify,
    Other(String),
}

impl Method {
    pub fn parse(s: &str) -> Method {
        match s {
            "REGISTER" => Method::Register,
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "OPTIONS" => Method::Options,
            "MESSAGE" => Method::Message,
            "INFO" => Method::Info,
            "UPDATE" => Method::Update,
            "REFER" => Method::Refer,
            "SUBSCRIBE" => Method::Subscribe,
            "NOTIFY" => Method::Notify,
            other => Method::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Register => "REGISTER",
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Options => "OPTIONS",
            Method::Message => "MESSAGE",
            Method::Info => "INFO",
            Method::Update => "UPDATE",
            Method::Refer => "REFER",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Other(s) => s,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Provisional,
    Success,
    Redirect,
    ClientError,
    ServerError,
    GlobalFailure,
}

/// A SIP status code, 100..=699.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const TRYING: StatusCode = StatusCode(100);
    pub const RINGING: StatusCode = StatusCode(180);
    pub const SESSION_PROGRESS: StatusCode = StatusCode(183);
    pub const OK: StatusCode = StatusCode(200);
    pub const UNAUTHORIZED: StatusCode = StatusCode(401);
    pub const FORBIDDEN: StatusCode = StatusCode(403);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const PROXY_AUTHENTICATION_REQUIRED: StatusCode = StatusCode(407);
    pub const REQUEST_TIMEOUT: StatusCode = StatusCode(408);
    pub const BUSY_HERE: StatusCode = StatusCode(486);
    pub const REQUEST_TERMINATED: StatusCode = StatusCode(487);

    pub fn kind(&self) -> StatusKind {
        match self.0 {
            100..=199 => StatusKind::Provisional,
            200..=299 => StatusKind::Success,
            300..=399 => StatusKind::Redirect,
            400..=499 => StatusKind::ClientError,
            500..=599 => StatusKind::ServerError,
            _ => StatusKind::GlobalFailure,
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.kind() == StatusKind::Provisional
    }

    pub fn is_success(&self) -> bool {
        self.kind() == StatusKind::Success
    }

    pub fn is_final(&self) -> bool {
        !self.is_provisional()
    }

    pub fn reason_phrase(&self) -> &'static str {
        match self.0 {
            100 => "Trying",
            180 => "Ringing",
            181 => "Call Is Being Forwarded",
            182 => "Queued",
            183 => "Session Progress",
            200 => "OK",
            202 => "Accepted",
            300 => "Multiple Choices",
            301 => "Moved Permanently",
            302 => "Moved Temporarily",
            305 => "Use Proxy",
            380 => "Alternative Service",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            406 => "Not Acceptable",
            407 => "Proxy Authentication Required",
            408 => "Request Timeout",
            410 => "Gone",
            413 => "Request Entity Too Large",
            415 => "Unsupported Media Type",
            420 => "Bad Extension",
            423 => "Interval Too Brief",
            480 => "Temporarily Unavailable",
            481 => "Call/Transaction Does Not Exist",
            482 => "Loop Detected",
            483 => "Too Many Hops",
            486 => "Busy Here",
            487 => "Request Terminated",
            488 => "Not Acceptable Here",
            500 => "Server Internal Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Server Time-out",
            600 => "Busy Everywhere",
            603 => "Decline",
            604 => "Does Not Exist Anywhere",
            606 => "Not Acceptable",
            _ => "Unknown",
        }
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Default for Method {
    fn default() -> Self {
        Method::Options
    }
}

/// A SIP response. `original` points back to the request that elicited it
/// when the transaction layer knows it; equality ignores the back-pointer.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub version: Version,
    pub status: StatusCode,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub original: Option<Box<Request>>,
}

impl Default for StatusCode {
    fn default() -> Self {
        StatusCode(200)
    }
}

impl PartialEq for Response {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.status == other.status
            && self.reason == other.reason
            && self.headers == other.headers
            && self.body == other.body
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl Request {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = String::new();
        head.push_str(&format!("{} {} {}\r\n", self.method, self.uri, self.version));
        self.headers.write_canonical(&mut head, self.body.len());
        head.push_str("\r\n");
        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }

    pub fn cseq(&self) -> Result<(u32, Method)> {
        parse_cseq(self.headers.get("CSeq"))
    }

    pub fn call_id(&self) -> Result<&str> {
        self.headers
            .get("Call-ID")
            .ok_or(Error::MalformedMessage(ParseErrorKind::MalformedHeader))
    }

    pub fn from_tag(&self) -> Option<String> {
        self.headers.get("From").and_then(|v| header_param(v, "tag"))
    }

    pub fn to_tag(&self) -> Option<String> {
        self.headers.get("To").and_then(|v| header_param(v, "tag"))
    }

    pub fn top_via(&self) -> Option<&str> {
        self.headers.get("Via")
    }

    pub fn via_branch(&self) -> Option<String> {
        self.top_via().and_then(via_branch)
    }
}

impl Response {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = String::new();
        head.push_str(&format!("{} {} {}\r\n", self.version, self.status, self.reason));
        self.headers.write_canonical(&mut head, self.body.len());
        head.push_str("\r\n");
        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }

    pub fn cseq(&self) -> Result<(u32, Method)> {
        parse_cseq(self.headers.get("CSeq"))
    }

    pub fn call_id(&self) -> Result<&str> {
        self.headers
            .get("Call-ID")
            .ok_or(Error::MalformedMessage(ParseErrorKind::MalformedHeader))
    }

    pub fn from_tag(&self) -> Option<String> {
        self.headers.get("From").and_then(|v| header_param(v, "tag"))
    }

    pub fn to_tag(&self) -> Option<String> {
        self.headers.get("To").and_then(|v| header_param(v, "tag"))
    }

    pub fn top_via(&self) -> Option<&str> {
        self.headers.get("Via")
    }

    pub fn via_branch(&self) -> Option<String> {
        self.top_via().and_then(via_branch)
    }

    pub fn contact_uri(&self) -> Option<Uri> {
        self.headers
            .get("Contact")
            .and_then(|v| header_uri(v).ok())
    }

    /// Record-Route values, one per route entry, comma-joined lines split.
    pub fn record_routes(&self) -> Vec<String> {
        let mut out = Vec::new();
        for value in self.headers.get_all("Record-Route") {
            out.extend(split_comma_values(value));
        }
        out
    }

    /// The registration expiry the server granted: the Contact `expires`
    /// parameter when present, else the Expires header.
    pub fn expires_granted(&self) -> Option<u32> {
        if let Some(contact) = self.headers.get("Contact") {
            if let Some(exp) = header_param(contact, "expires") {
                if let Ok(secs) = exp.parse() {
                    return Some(secs);
                }
            }
        }
        self.headers.get("Expires").and_then(|v| v.trim().parse().ok())
    }

    /// The source address the server observed, from the top Via
    /// `received`/`rport` parameters.
    pub fn via_received(&self) -> Option<HostPort> {
        let via = self.top_via()?;
        let received = via_param(via, "received")?;
        let rport = via_param(via, "rport").and_then(|p| p.parse::<u16>().ok());
        Some(HostPort::new(received, rport))
    }
}

impl SipMessage {
    /// Parses one complete SIP message from `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<SipMessage> {
        parser::parse_message(bytes)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            SipMessage::Request(r) => r.to_bytes(),
            SipMessage::Response(r) => r.to_bytes(),
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }

    pub fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request(r) => &r.headers,
            SipMessage::Response(r) => &r.headers,
        }
    }
}

impl From<Request> for SipMessage {
    fn from(r: Request) -> Self {
        SipMessage::Request(r)
    }
}

impl From<Response> for SipMessage {
    fn from(r: Response) -> Self {
        SipMessage::Response(r)
    }
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

impl std::fmt::Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

impl std::fmt::Display for SipMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SipMessage::Request(r) => r.fmt(f),
            SipMessage::Response(r) => r.fmt(f),
        }
    }
}

fn parse_cseq(value: Option<&str>) -> Result<(u32, Method)> {
    let value = value.ok_or(Error::MalformedMessage(ParseErrorKind::MalformedHeader))?;
    let mut parts = value.split_whitespace();
    let seq = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or(Error::MalformedMessage(ParseErrorKind::MalformedHeader))?;
    let method = parts
        .next()
        .map(Method::parse)
        .ok_or(Error::MalformedMessage(ParseErrorKind::MalformedHeader))?;
    Ok((seq, method))
}

/// Extracts the URI from an address header value: either the part inside
/// `<...>`, or (bare form) everything before the first `;`.
pub fn header_uri(value: &str) -> Result<Uri> {
    if let Some(start) = value.find('<') {
        let end = value[start..]
            .find('>')
            .ok_or(Error::BadArgument("address header"))?;
        return Uri::parse(&value[start + 1..start + end]);
    }
    Uri::parse(value.split(';').next().unwrap_or(value))
}

/// Looks up a header parameter that lives outside any `<...>` bracket.
pub fn header_param(value: &str, name: &str) -> Option<String> {
    let params_part = match value.rfind('>') {
        Some(pos) => &value[pos + 1..],
        None => match value.find(';') {
            Some(pos) => &value[pos..],
            None => return None,
        },
    };
    for item in params_part.split(';') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        match item.split_once('=') {
            Some((k, v)) if k.trim().eq_ignore_ascii_case(name) => {
                return Some(v.trim().trim_matches('"').to_string());
            }
            None if item.eq_ignore_ascii_case(name) => return Some(String::new()),
            _ => {}
        }
    }
    None
}

/// Appends `;name=value` to an address header value unless the parameter
/// is already present.
pub fn with_header_param(value: &str, name: &str, param_value: &str) -> String {
    if header_param(value, name).is_some() {
        return value.to_string();
    }
    format!("{};{}={}", value.trim_end(), name, param_value)
}

/// A Via parameter (`branch`, `received`, `rport`, …).
pub fn via_param(via: &str, name: &str) -> Option<String> {
    for item in via.split(';').skip(1) {
        let item = item.trim();
        match item.split_once('=') {
            Some((k, v)) if k.trim().eq_ignore_ascii_case(name) => {
                return Some(v.trim().to_string());
            }
            None if item.eq_ignore_ascii_case(name) => return Some(String::new()),
            _ => {}
        }
    }
    None
}

pub fn via_branch(via: &str) -> Option<String> {
    via_param(via, "branch").filter(|b| !b.is_empty())
}

/// The sent-by part of a Via value: `host:port` between the transport and
/// the first parameter.
pub fn via_sent_by(via: &str) -> Option<String> {
    let after_proto = via.split_whitespace().nth(1)?;
    Some(after_proto.split(';').next()?.trim().to_string())
}

/// Splits a multi-value header line on top-level commas, honoring `<...>`
/// brackets and quoted strings.
pub fn split_comma_values(value: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut start = 0usize;
    for (i, c) in value.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => depth += 1,
            '>' if !in_quotes && depth > 0 => depth -= 1,
            ',' if !in_quotes && depth == 0 => {
                let item = value[start..i].trim();
                if !item.is_empty() {
                    out.push(item.to_string());
                }
                start = i + 1;
            }
            _ => {}
        }
    }
    let tail = value[start..].trim();
    if !tail.is_empty() {
        out.push(tail.to_string());
    }
    out
}
