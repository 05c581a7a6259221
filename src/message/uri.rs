use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Scheme {
    #[default]
    Sip,
    Sips,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Sip => "sip",
            Scheme::Sips => "sips",
        }
    }
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserInfo {
    pub user: String,
    pub password: Option<String>,
}

/// Host plus optional port. IPv6 literals keep their brackets in `host`.
#[derive(Debug, Clone, Default)]
pub struct HostPort {
    pub host: String,
    pub port: Option<u16>,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        HostPort {
            host: host.into(),
            port,
        }
    }

    /// The port to dial: the explicit one, or 5060.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(5060)
    }
}

impl PartialEq for HostPort {
    fn eq(&self, other: &Self) -> bool {
        self.host.eq_ignore_ascii_case(&other.host) && self.port == other.port
    }
}

impl Eq for HostPort {}

impl std::fmt::Display for HostPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.port {
            Some(p) => write!(f, "{}:{}", self.host, p),
            None => f.write_str(&self.host),
        }
    }
}

impl From<std::net::SocketAddr> for HostPort {
    fn from(addr: std::net::SocketAddr) -> Self {
        let host = match addr.ip() {
            std::net::IpAddr::V4(ip) => ip.to_string(),
            std::net::IpAddr::V6(ip) => format!("[{}]", ip),
        };
        HostPort::new(host, Some(addr.port()))
    }
}

/// A SIP or SIPS URI.
///
/// `sip:user:password@host:port;uri-params?headers`. Parameters keep their
/// arrival order, parameter keys compare case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct Uri {
    pub scheme: Scheme,
    pub user: Option<UserInfo>,
    pub host_port: HostPort,
    pub params: Vec<(String, Option<String>)>,
    pub headers: Vec<(String, String)>,
}

/// URI parameters that must match when present in either URI being
/// compared.
const CRITICAL_PARAMS: &[&str] = &["user", "ttl", "method", "maddr", "transport"];

impl Uri {
    pub fn parse(s: &str) -> Result<Uri> {
        let s = s.trim();
        let (scheme, rest) = match s.split_once(':') {
            Some((sch, rest)) if sch.eq_ignore_ascii_case("sip") => (Scheme::Sip, rest),
            Some((sch, rest)) if sch.eq_ignore_ascii_case("sips") => (Scheme::Sips, rest),
            _ => return Err(Error::BadArgument("uri scheme")),
        };

        let (rest, headers_part) = match rest.split_once('?') {
            Some((r, h)) => (r, Some(h)),
            None => (rest, None),
        };

        let (addr_part, params_part) = match rest.split_once(';') {
            Some((a, p)) => (a, Some(p)),
            None => (rest, None),
        };

        let (user, host_str) = match addr_part.rsplit_once('@') {
            Some((ui, host)) => {
                if ui.is_empty() {
                    return Err(Error::BadArgument("uri userinfo"));
                }
                let user = match ui.split_once(':') {
                    Some((u, p)) => UserInfo {
                        user: u.to_string(),
                        password: Some(p.to_string()),
                    },
                    None => UserInfo {
                        user: ui.to_string(),
                        password: None,
                    },
                };
                (Some(user), host)
            }
            None => (None, addr_part),
        };

        let host_port = parse_host_port(host_str)?;

        let mut params = Vec::new();
        if let Some(p) = params_part {
            for item in p.split(';') {
                if item.is_empty() {
                    continue;
                }
                match item.split_once('=') {
                    Some((k, v)) => params.push((k.to_string(), Some(v.to_string()))),
                    None => params.push((item.to_string(), None)),
                }
            }
        }

        let mut headers = Vec::new();
        if let Some(h) = headers_part {
            for item in h.split('&') {
                if item.is_empty() {
                    continue;
                }
                match item.split_once('=') {
                    Some((k, v)) => headers.push((k.to_string(), v.to_string())),
                    None => headers.push((item.to_string(), String::new())),
                }
            }
        }

        Ok(Uri {
            scheme,
            user,
            host_port,
            params,
            headers,
        })
    }

    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }

    pub fn transport_param(&self) -> Option<&str> {
        self.param("transport").flatten()
    }

    pub fn is_secure(&self) -> bool {
        self.scheme == Scheme::Sips
    }

    /// The same URI with params and headers stripped, as used in Contact
    /// comparison and request targets.
    pub fn base(&self) -> Uri {
        Uri {
            scheme: self.scheme,
            user: self.user.clone(),
            host_port: self.host_port.clone(),
            params: Vec::new(),
            headers: Vec::new(),
        }
    }
}

fn parse_host_port(s: &str) -> Result<HostPort> {
    if s.is_empty() {
        return Err(Error::BadArgument("uri host"));
    }
    if let Some(rest) = s.strip_prefix('[') {
        // bracketed IPv6 literal
        let end = rest.find(']').ok_or(Error::BadArgument("uri host"))?;
        let host = format!("[{}]", &rest[..end]);
        let after = &rest[end + 1..];
        let port = match after.strip_prefix(':') {
            Some(p) => Some(p.parse::<u16>().map_err(|_| Error::BadArgument("uri port"))?),
            None if after.is_empty() => None,
            None => return Err(Error::BadArgument("uri host")),
        };
        return Ok(HostPort::new(host, port));
    }
    match s.split_once(':') {
        Some((host, port)) => {
            if host.is_empty() {
                return Err(Error::BadArgument("uri host"));
            }
            let port = port.parse::<u16>().map_err(|_| Error::BadArgument("uri port"))?;
            Ok(HostPort::new(host, Some(port)))
        }
        None => Ok(HostPort::new(s, None)),
    }
}

impl std::str::FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Uri> {
        Uri::parse(s)
    }
}

impl TryFrom<&str> for Uri {
    type Error = Error;

    fn try_from(s: &str) -> Result<Uri> {
        Uri::parse(s)
    }
}

impl std::fmt::Display for Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(ui) = &self.user {
            f.write_str(&ui.user)?;
            if let Some(pw) = &ui.password {
                write!(f, ":{}", pw)?;
            }
            f.write_str("@")?;
        }
        write!(f, "{}", self.host_port)?;
        for (k, v) in &self.params {
            match v {
                Some(v) => write!(f, ";{}={}", k, v)?,
                None => write!(f, ";{}", k)?,
            }
        }
        for (i, (k, v)) in self.headers.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", sep, k, v)?;
        }
        Ok(())
    }
}

/// RFC 3261 §19.1.4 URI comparison: user part case-sensitive, host and
/// parameters case-insensitive, a parameter appearing in only one URI is
/// ignored unless it is one of user/ttl/method/maddr/transport, the
/// headers components must be equivalent sets.
impl PartialEq for Uri {
    fn eq(&self, other: &Self) -> bool {
        if self.scheme != other.scheme
            || self.user != other.user
            || self.host_port != other.host_port
        {
            return false;
        }
        let find = |uri: &Uri, key: &str| -> Option<Option<String>> {
            uri.params
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.as_ref().map(|v| v.to_ascii_lowercase()))
        };
        for (k, _) in self.params.iter().chain(other.params.iter()) {
            match (find(self, k), find(other, k)) {
                (Some(a), Some(b)) => {
                    if a != b {
                        return false;
                    }
                }
                (None, None) => {}
                _ => {
                    if CRITICAL_PARAMS.iter().any(|c| c.eq_ignore_ascii_case(k)) {
                        return false;
                    }
                }
            }
        }
        if self.headers.len() != other.headers.len() {
            return false;
        }
        for (k, v) in &self.headers {
            let matched = other.headers.iter().any(|(ok, ov)| {
                ok.eq_ignore_ascii_case(k) && ov.eq_ignore_ascii_case(v)
            });
            if !matched {
                return false;
            }
        }
        true
    }
}

impl Eq for Uri {}
