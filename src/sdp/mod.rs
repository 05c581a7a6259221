//! Session Description Protocol (RFC 4566) codec with offer/answer
//! construction (RFC 3264).
//!
//! Only the pieces a voice UA needs are modeled: origin, session name,
//! connection, timing, attributes and media descriptions. A media line
//! with port 0 denotes a rejected stream.

use crate::error::ParseErrorKind;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub username: String,
    pub sess_id: u64,
    pub sess_version: u64,
    pub net_type: String,
    pub addr_type: String,
    pub unicast_address: String,
}

impl Origin {
    pub fn new(username: &str, sess_id: u64, sess_version: u64, address: &str) -> Self {
        Origin {
            username: username.to_string(),
            sess_id,
            sess_version,
            net_type: "IN".to_string(),
            addr_type: "IP4".to_string(),
            unicast_address: address.to_string(),
        }
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {}",
            self.username, self.sess_id, self.sess_version, self.net_type, self.addr_type, self.unicast_address
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub net_type: String,
    pub addr_type: String,
    pub address: String,
}

impl Connection {
    pub fn ip4(address: &str) -> Self {
        Connection {
            net_type: "IN".to_string(),
            addr_type: "IP4".to_string(),
            address: address.to_string(),
        }
    }
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.net_type, self.addr_type, self.address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpAttribute {
    pub name: String,
    pub value: Option<String>,
}

impl SdpAttribute {
    pub fn flag(name: &str) -> Self {
        SdpAttribute {
            name: name.to_string(),
            value: None,
        }
    }

    pub fn valued(name: &str, value: impl Into<String>) -> Self {
        SdpAttribute {
            name: name.to_string(),
            value: Some(value.into()),
        }
    }
}

impl std::fmt::Display for SdpAttribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.value {
            Some(v) => write!(f, "{}:{}", self.name, v),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeDescription {
    pub start: u64,
    pub stop: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    pub media: String,
    pub port: u16,
    pub protocol: String,
    pub formats: Vec<String>,
    pub connection: Option<Connection>,
    pub attributes: Vec<SdpAttribute>,
}

impl MediaDescription {
    pub fn attribute(&self, name: &str) -> Option<&SdpAttribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// The rtpmap entry for a payload type, as `NAME/rate[/channels]`.
    pub fn rtpmap(&self, payload: &str) -> Option<&str> {
        self.attributes
            .iter()
            .filter(|a| a.name == "rtpmap")
            .filter_map(|a| a.value.as_deref())
            .find(|v| v.split_whitespace().next() == Some(payload))
            .and_then(|v| v.split_whitespace().nth(1))
    }

    pub fn is_rejected(&self) -> bool {
        self.port == 0
    }
}

/// A parsed or constructed session description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpSession {
    pub version: u8,
    pub origin: Origin,
    pub session_name: String,
    pub connection: Option<Connection>,
    pub times: Vec<TimeDescription>,
    pub attributes: Vec<SdpAttribute>,
    pub media: Vec<MediaDescription>,
}

/// One codec in a media specification handed to [`create_offer`].
#[derive(Debug, Clone)]
pub struct CodecSpec {
    pub payload_type: u8,
    pub name: String,
    pub rate: u32,
    pub fmtp: Option<String>,
    pub ptime: Option<u32>,
}

impl CodecSpec {
    pub fn new(payload_type: u8, name: &str, rate: u32) -> Self {
        CodecSpec {
            payload_type,
            name: name.to_string(),
            rate,
            fmtp: None,
            ptime: None,
        }
    }
}

/// One media stream in an offer.
#[derive(Debug, Clone)]
pub struct MediaSpec {
    pub media: String,
    pub port: u16,
    /// Defaults to `RTP/AVP` when empty.
    pub protocol: String,
    pub codecs: Vec<CodecSpec>,
}

/// Payload types retained by default when answering an offer:
/// PCMU/0, PCMA/8 and telephone-event/101.
pub const DEFAULT_ACCEPTED_PAYLOADS: &[u8] = &[0, 8, 101];

impl SdpSession {
    /// Parses an SDP body.
    pub fn parse(bytes: &[u8]) -> Result<SdpSession> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| Error::MalformedMessage(ParseErrorKind::MalformedSdpLine))?;

        let mut version = 0u8;
        let mut origin: Option<Origin> = None;
        let mut session_name = String::new();
        let mut connection: Option<Connection> = None;
        let mut times = Vec::new();
        let mut attributes = Vec::new();
        let mut media: Vec<MediaDescription> = Vec::new();

        for raw in text.split('\n') {
            let line = raw.strip_suffix('\r').unwrap_or(raw);
            if line.is_empty() {
                continue;
            }
            let (kind, value) = line
                .split_once('=')
                .ok_or(Error::MalformedMessage(ParseErrorKind::MalformedSdpLine))?;
            if kind.len() != 1 {
                return Err(Error::MalformedMessage(ParseErrorKind::MalformedSdpLine));
            }
            match kind {
                "v" => {
                    version = value
                        .trim()
                        .parse()
                        .map_err(|_| Error::MalformedMessage(ParseErrorKind::MalformedSdpLine))?;
                }
                "o" => origin = Some(parse_origin(value)?),
                "s" => session_name = value.to_string(),
                "c" => {
                    let conn = parse_connection(value)?;
                    match media.last_mut() {
                        Some(m) => m.connection = Some(conn),
                        None => connection = Some(conn),
                    }
                }
                "t" => {
                    let mut parts = value.split_whitespace();
                    let start = parts
                        .next()
                        .and_then(|v| v.parse().ok())
                        .ok_or(Error::MalformedMessage(ParseErrorKind::MalformedSdpLine))?;
                    let stop = parts
                        .next()
                        .and_then(|v| v.parse().ok())
                        .ok_or(Error::MalformedMessage(ParseErrorKind::MalformedSdpLine))?;
                    times.push(TimeDescription { start, stop });
                }
                "a" => {
                    let attr = match value.split_once(':') {
                        Some((name, v)) => SdpAttribute::valued(name, v),
                        None => SdpAttribute::flag(value),
                    };
                    match media.last_mut() {
                        Some(m) => m.attributes.push(attr),
                        None => attributes.push(attr),
                    }
                }
                "m" => media.push(parse_media(value)?),
                // valid but unmodeled types are skipped
                "b" | "i" | "u" | "e" | "p" | "z" | "k" | "r" => {}
                _ => return Err(Error::MalformedMessage(ParseErrorKind::UnknownType)),
            }
        }

        let origin = origin.ok_or(Error::MalformedMessage(ParseErrorKind::MalformedSdpLine))?;
        Ok(SdpSession {
            version,
            origin,
            session_name,
            connection,
            times,
            attributes,
            media,
        })
    }

    /// Builds an offer from media specifications.
    pub fn create_offer(
        session_name: &str,
        origin: Origin,
        connection_addr: &str,
        media_specs: &[MediaSpec],
    ) -> SdpSession {
        let mut media = Vec::with_capacity(media_specs.len());
        for spec in media_specs {
            let protocol = if spec.protocol.is_empty() {
                "RTP/AVP".to_string()
            } else {
                spec.protocol.clone()
            };
            let formats = spec
                .codecs
                .iter()
                .map(|c| c.payload_type.to_string())
                .collect();
            let mut attributes = Vec::new();
            for codec in &spec.codecs {
                attributes.push(SdpAttribute::valued(
                    "rtpmap",
                    format!("{} {}/{}", codec.payload_type, codec.name, codec.rate),
                ));
                if let Some(fmtp) = &codec.fmtp {
                    attributes.push(SdpAttribute::valued(
                        "fmtp",
                        format!("{} {}", codec.payload_type, fmtp),
                    ));
                }
            }
            if let Some(ptime) = spec.codecs.iter().find_map(|c| c.ptime) {
                attributes.push(SdpAttribute::valued("ptime", ptime.to_string()));
            }
            media.push(MediaDescription {
                media: spec.media.clone(),
                port: spec.port,
                protocol,
                formats,
                connection: None,
                attributes,
            });
        }
        SdpSession {
            version: 0,
            origin,
            session_name: session_name.to_string(),
            connection: Some(Connection::ip4(connection_addr)),
            times: vec![TimeDescription::default()],
            attributes: Vec::new(),
            media,
        }
    }

    /// Answers an offer, keeping the intersection of the offered payload
    /// types with `accepted_payloads` (defaults to
    /// [`DEFAULT_ACCEPTED_PAYLOADS`]). Streams with no surviving payload,
    /// and streams the offer already rejected, come back with port 0.
    pub fn create_answer(
        offer: &SdpSession,
        local_origin: Origin,
        local_connection: &str,
        accepted_payloads: Option<&[u8]>,
    ) -> SdpSession {
        let accepted = accepted_payloads.unwrap_or(DEFAULT_ACCEPTED_PAYLOADS);
        let mut media = Vec::with_capacity(offer.media.len());
        for offered in &offer.media {
            let retained: Vec<String> = offered
                .formats
                .iter()
                .filter(|f| {
                    f.parse::<u8>()
                        .map(|pt| accepted.contains(&pt))
                        .unwrap_or(false)
                })
                .cloned()
                .collect();
            if offered.is_rejected() || retained.is_empty() {
                media.push(MediaDescription {
                    media: offered.media.clone(),
                    port: 0,
                    protocol: offered.protocol.clone(),
                    formats: offered.formats.clone(),
                    connection: None,
                    attributes: Vec::new(),
                });
                continue;
            }
            let attributes = offered
                .attributes
                .iter()
                .filter(|a| match (a.name.as_str(), a.value.as_deref()) {
                    ("rtpmap" | "fmtp", Some(v)) => {
                        let pt = v.split_whitespace().next().unwrap_or("");
                        retained.iter().any(|r| r == pt)
                    }
                    ("ptime", _) => true,
                    _ => false,
                })
                .cloned()
                .collect();
            media.push(MediaDescription {
                media: offered.media.clone(),
                port: offered.port,
                protocol: offered.protocol.clone(),
                formats: retained,
                connection: None,
                attributes,
            });
        }
        SdpSession {
            version: 0,
            origin: local_origin,
            session_name: offer.session_name.clone(),
            connection: Some(Connection::ip4(local_connection)),
            times: vec![TimeDescription::default()],
            attributes: Vec::new(),
            media,
        }
    }

    /// Codec names across all media, in appearance order, deduplicated.
    pub fn codec_summary(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for m in &self.media {
            for pt in &m.formats {
                let name = match m.rtpmap(pt) {
                    Some(entry) => entry.split('/').next().unwrap_or(entry).to_string(),
                    None => match pt.as_str() {
                        "0" => "PCMU".to_string(),
                        "8" => "PCMA".to_string(),
                        "9" => "G722".to_string(),
                        "18" => "G729".to_string(),
                        other => format!("PT{}", other),
                    },
                };
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// True when any stream is live: port above zero and not marked
    /// inactive at session or media level.
    pub fn has_early_media(&self) -> bool {
        let session_inactive = self.attributes.iter().any(|a| a.name == "inactive");
        self.media.iter().any(|m| {
            m.port > 0 && !session_inactive && m.attribute("inactive").is_none()
        })
    }

    /// True when the description carries media and every stream is
    /// rejected.
    pub fn media_rejected(&self) -> bool {
        !self.media.is_empty() && self.media.iter().all(|m| m.is_rejected())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

fn parse_origin(value: &str) -> Result<Origin> {
    let mut parts = value.split_whitespace();
    let err = || Error::MalformedMessage(ParseErrorKind::MalformedSdpLine);
    Ok(Origin {
        username: parts.next().ok_or_else(err)?.to_string(),
        sess_id: parts.next().and_then(|v| v.parse().ok()).ok_or_else(err)?,
        sess_version: parts.next().and_then(|v| v.parse().ok()).ok_or_else(err)?,
        net_type: parts.next().ok_or_else(err)?.to_string(),
        addr_type: parts.next().ok_or_else(err)?.to_string(),
        unicast_address: parts.next().ok_or_else(err)?.to_string(),
    })
}

fn parse_connection(value: &str) -> Result<Connection> {
    let mut parts = value.split_whitespace();
    let err = || Error::MalformedMessage(ParseErrorKind::MalformedSdpLine);
    Ok(Connection {
        net_type: parts.next().ok_or_else(err)?.to_string(),
        addr_type: parts.next().ok_or_else(err)?.to_string(),
        address: parts.next().ok_or_else(err)?.to_string(),
    })
}

fn parse_media(value: &str) -> Result<MediaDescription> {
    let mut parts = value.split_whitespace();
    let err = || Error::MalformedMessage(ParseErrorKind::MalformedSdpLine);
    let media = parts.next().ok_or_else(err)?.to_string();
    let port_field = parts.next().ok_or_else(err)?;
    // "port" or "port/count"; the stream count is not modeled
    let port = port_field
        .split('/')
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(err)?;
    let protocol = parts.next().ok_or_else(err)?.to_string();
    let formats: Vec<String> = parts.map(|p| p.to_string()).collect();
    Ok(MediaDescription {
        media,
        port,
        protocol,
        formats,
        connection: None,
        attributes: Vec::new(),
    })
}

impl std::fmt::Display for SdpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v={}\r\n", self.version)?;
        write!(f, "o={}\r\n", self.origin)?;
        write!(f, "s={}\r\n", self.session_name)?;
        if let Some(c) = &self.connection {
            write!(f, "c={}\r\n", c)?;
        }
        for t in &self.times {
            write!(f, "t={} {}\r\n", t.start, t.stop)?;
        }
        for a in &self.attributes {
            write!(f, "a={}\r\n", a)?;
        }
        for m in &self.media {
            write!(f, "m={} {} {} {}\r\n", m.media, m.port, m.protocol, m.formats.join(" "))?;
            if let Some(c) = &m.connection {
                write!(f, "c={}\r\n", c)?;
            }
            for a in &m.attributes {
                write!(f, "a={}\r\n", a)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio_offer() -> SdpSession {
        SdpSession::create_offer(
            "call",
            Origin::new("alice", 2890844526, 2890844526, "10.0.0.1"),
            "10.0.0.1",
            &[MediaSpec {
                media: "audio".to_string(),
                port: 49170,
                protocol: String::new(),
                codecs: vec![
                    CodecSpec::new(0, "PCMU", 8000),
                    CodecSpec::new(8, "PCMA", 8000),
                    CodecSpec::new(101, "telephone-event", 8000),
                ],
            }],
        )
    }

    #[test]
    fn test_offer_shape() {
        let text = audio_offer().to_string();
        assert!(text.starts_with("v=0\r\n"));
        assert!(text.contains("o=alice 2890844526 2890844526 IN IP4 10.0.0.1\r\n"));
        assert!(text.contains("s=call\r\n"));
        assert!(text.contains("c=IN IP4 10.0.0.1\r\n"));
        assert!(text.contains("t=0 0\r\n"));
        assert!(text.contains("m=audio 49170 RTP/AVP 0 8 101\r\n"));
        assert!(text.contains("a=rtpmap:0 PCMU/8000\r\n"));
        assert!(text.contains("a=rtpmap:8 PCMA/8000\r\n"));
        assert!(text.contains("a=rtpmap:101 telephone-event/8000\r\n"));
    }

    #[test]
    fn test_parse_roundtrip() {
        let offer = audio_offer();
        let parsed = SdpSession::parse(&offer.to_bytes()).unwrap();
        assert_eq!(parsed, offer);
    }

    #[test]
    fn test_answer_intersection_default_set() {
        let mut offer = audio_offer();
        offer.media[0].formats.push("96".to_string());
        offer.media[0]
            .attributes
            .push(SdpAttribute::valued("rtpmap", "96 opus/48000/2"));
        let answer = SdpSession::create_answer(
            &offer,
            Origin::new("bob", 1, 1, "10.0.0.2"),
            "10.0.0.2",
            None,
        );
        assert_eq!(answer.media.len(), 1);
        assert_eq!(answer.media[0].formats, vec!["0", "8", "101"]);
        assert!(answer.media[0].rtpmap("96").is_none());
        assert!(answer.media[0].rtpmap("0").is_some());
    }

    #[test]
    fn test_answer_rejects_when_nothing_accepted() {
        let offer = audio_offer();
        let answer = SdpSession::create_answer(
            &offer,
            Origin::new("bob", 1, 1, "10.0.0.2"),
            "10.0.0.2",
            Some(&[9]),
        );
        assert!(answer.media[0].is_rejected());
        assert!(answer.media_rejected());
    }

    #[test]
    fn test_media_rejected_on_zero_port() {
        let body = b"v=0\r\no=a 1 1 IN IP4 10.0.0.1\r\ns=-\r\nc=IN IP4 10.0.0.1\r\nt=0 0\r\nm=audio 0 RTP/AVP 0\r\n";
        let sdp = SdpSession::parse(body).unwrap();
        assert!(sdp.media_rejected());
        assert!(!sdp.has_early_media());
    }

    #[test]
    fn test_has_early_media() {
        let offer = audio_offer();
        assert!(offer.has_early_media());
        let mut inactive = offer.clone();
        inactive.media[0].attributes.push(SdpAttribute::flag("inactive"));
        assert!(!inactive.has_early_media());
    }

    #[test]
    fn test_codec_summary() {
        let names = audio_offer().codec_summary();
        assert_eq!(names, vec!["PCMU", "PCMA", "telephone-event"]);
    }

    #[test]
    fn test_media_level_connection_override() {
        let body = b"v=0\r\no=a 1 1 IN IP4 10.0.0.1\r\ns=-\r\nc=IN IP4 10.0.0.1\r\nt=0 0\r\nm=audio 4000 RTP/AVP 0\r\nc=IN IP4 192.0.2.7\r\n";
        let sdp = SdpSession::parse(body).unwrap();
        assert_eq!(sdp.connection.as_ref().unwrap().address, "10.0.0.1");
        assert_eq!(sdp.media[0].connection.as_ref().unwrap().address, "192.0.2.7");
    }

    #[test]
    fn test_parse_errors() {
        match SdpSession::parse(b"v=0\r\nq=bogus\r\n") {
            Err(Error::MalformedMessage(ParseErrorKind::UnknownType)) => {}
            other => panic!("expected UnknownType, got {:?}", other),
        }
        match SdpSession::parse(b"v=0\r\nno-equals-sign\r\n") {
            Err(Error::MalformedMessage(ParseErrorKind::MalformedSdpLine)) => {}
            other => panic!("expected MalformedSdpLine, got {:?}", other),
        }
        match SdpSession::parse(b"v=0\r\no=too few\r\n") {
            Err(Error::MalformedMessage(ParseErrorKind::MalformedSdpLine)) => {}
            other => panic!("expected MalformedSdpLine, got {:?}", other),
        }
    }
}
