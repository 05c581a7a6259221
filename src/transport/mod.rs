//! Transport abstraction: UDP datagram and TCP stream connections with a
//! common send/receive contract.
//!
//! Every connection runs a serve loop that parses inbound bytes and pushes
//! [`TransportEvent::Incoming`] frames (message plus source address)
//! into the endpoint's channel. UDP treats one datagram as one message;
//! TCP reassembles messages from the byte stream using the blank-line
//! header terminator and Content-Length.

pub mod stream;
pub mod udp;

pub use stream::{StreamConnection, TcpConnection};
pub use udp::UdpConnection;

use crate::message::{SipMessage, Uri};
use crate::{Error, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportKind {
    #[default]
    Udp,
    Tcp,
    /// Accepted in URIs and addresses, not implemented.
    Tls,
    /// Accepted in URIs and addresses, not implemented.
    Ws,
}

impl TransportKind {
    pub fn is_reliable(&self) -> bool {
        !matches!(self, TransportKind::Udp)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
            TransportKind::Ws => "WS",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved transport destination: kind plus socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SipAddr {
    pub transport: TransportKind,
    pub addr: SocketAddr,
}

impl SipAddr {
    pub fn new(transport: TransportKind, addr: SocketAddr) -> Self {
        SipAddr { transport, addr }
    }

    pub fn udp(addr: SocketAddr) -> Self {
        SipAddr::new(TransportKind::Udp, addr)
    }
}

impl std::fmt::Display for SipAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.transport, self.addr)
    }
}

/// Events flowing from connections to the endpoint.
pub enum TransportEvent {
    Incoming(SipMessage, SipConnection, SipAddr),
    Closed(SipAddr),
}

pub type TransportSender = UnboundedSender<TransportEvent>;
pub type TransportReceiver = UnboundedReceiver<TransportEvent>;

pub(crate) const KEEPALIVE_REQUEST: &[u8] = b"\r\n\r\n";
pub(crate) const KEEPALIVE_RESPONSE: &[u8] = b"\r\n";

/// One bound or connected transport, cheap to clone.
#[derive(Clone)]
pub enum SipConnection {
    Udp(UdpConnection),
    Tcp(TcpConnection),
}

impl SipConnection {
    /// Whether the transport provides ordered, reliable delivery.
    /// Retransmission timers are disabled on reliable transports.
    pub fn is_reliable(&self) -> bool {
        match self {
            SipConnection::Udp(_) => false,
            SipConnection::Tcp(_) => true,
        }
    }

    pub async fn send(&self, msg: SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        match self {
            SipConnection::Udp(c) => c.send(&msg, destination).await,
            SipConnection::Tcp(c) => c.send_message(msg).await,
        }
    }

    pub fn local_addr(&self) -> SipAddr {
        match self {
            SipConnection::Udp(c) => c.local_addr(),
            SipConnection::Tcp(c) => c.local_addr(),
        }
    }

    pub async fn close(&self) {
        match self {
            SipConnection::Udp(_) => {}
            SipConnection::Tcp(c) => {
                c.close().await.ok();
            }
        }
    }
}

impl std::fmt::Display for SipConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SipConnection::Udp(c) => write!(f, "{}", c.local_addr()),
            SipConnection::Tcp(c) => write!(f, "{}", c.local_addr()),
        }
    }
}

/// Owns the bound UDP socket and the cache of outbound TCP streams, and
/// maps destinations to connections.
pub struct TransportLayer {
    pub cancel_token: CancellationToken,
    udp: RwLock<Option<UdpConnection>>,
    streams: RwLock<HashMap<SocketAddr, TcpConnection>>,
    sender: RwLock<Option<TransportSender>>,
}

impl TransportLayer {
    pub fn new(cancel_token: CancellationToken) -> Self {
        TransportLayer {
            cancel_token,
            udp: RwLock::new(None),
            streams: RwLock::new(HashMap::new()),
            sender: RwLock::new(None),
        }
    }

    /// Binds the shared UDP socket. Must happen before `start`.
    pub async fn bind_udp(&self, local: SocketAddr) -> Result<SipAddr> {
        let connection = UdpConnection::bind(local).await?;
        let addr = connection.local_addr();
        info!("transport bound {}", addr);
        self.udp.write().unwrap().replace(connection);
        Ok(addr)
    }

    /// Starts the serve loops, wiring inbound frames to `sender`.
    pub fn start(&self, sender: TransportSender) {
        self.sender.write().unwrap().replace(sender.clone());
        if let Some(udp) = self.udp.read().unwrap().clone() {
            let cancel = self.cancel_token.child_token();
            tokio::spawn(async move {
                if let Err(e) = udp.serve_loop(sender, cancel).await {
                    warn!("udp serve loop ended: {}", e);
                }
            });
        }
    }

    pub fn local_udp_addr(&self) -> Option<SipAddr> {
        self.udp.read().unwrap().as_ref().map(|c| c.local_addr())
    }

    /// Resolves a URI to a transport destination through the OS resolver.
    /// The transport comes from the `transport` URI parameter; `sips`
    /// selects TLS, which is not implemented and fails at lookup.
    pub async fn resolve(uri: &Uri) -> Result<SipAddr> {
        let transport = if uri.is_secure() {
            TransportKind::Tls
        } else {
            match uri.transport_param() {
                Some(t) if t.eq_ignore_ascii_case("tcp") => TransportKind::Tcp,
                Some(t) if t.eq_ignore_ascii_case("tls") => TransportKind::Tls,
                Some(t) if t.eq_ignore_ascii_case("ws") => TransportKind::Ws,
                _ => TransportKind::Udp,
            }
        };
        let host = uri.host_port.host.trim_matches(['[', ']']);
        let port = uri.host_port.port_or_default();
        let mut addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| Error::Transport(format!("resolve {}: {}", uri.host_port, e)))?;
        let addr = addrs
            .next()
            .ok_or_else(|| Error::Transport(format!("no address for {}", uri.host_port)))?;
        Ok(SipAddr::new(transport, addr))
    }

    /// Maps a destination to a connection, connecting a new TCP stream
    /// when none is cached. Returns the connection and the resolved
    /// destination the caller should send to.
    pub async fn lookup(&self, target: &SipAddr) -> Result<(SipConnection, SipAddr)> {
        match target.transport {
            TransportKind::Udp => {
                let udp = self
                    .udp
                    .read()
                    .unwrap()
                    .clone()
                    .ok_or_else(|| Error::Transport("no udp socket bound".to_string()))?;
                Ok((SipConnection::Udp(udp), *target))
            }
            TransportKind::Tcp => {
                if let Some(existing) = self.streams.read().unwrap().get(&target.addr) {
                    return Ok((SipConnection::Tcp(existing.clone()), *target));
                }
                let connection = TcpConnection::connect(target.addr).await?;
                self.streams
                    .write()
                    .unwrap()
                    .insert(target.addr, connection.clone());
                let sender = self.sender.read().unwrap().clone();
                if let Some(sender) = sender {
                    let serve = connection.clone();
                    let cancel = self.cancel_token.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = serve.serve_loop(sender, cancel).await {
                            warn!("tcp serve loop ended: {}", e);
                        }
                    });
                }
                Ok((SipConnection::Tcp(connection), *target))
            }
            other => Err(Error::Transport(format!("transport {} not supported", other))),
        }
    }

    /// Drops a cached stream after its serve loop ends.
    pub fn evict_stream(&self, addr: SocketAddr) {
        self.streams.write().unwrap().remove(&addr);
    }

    /// Cancels the serve loops and closes every connection.
    pub async fn close(&self) {
        self.cancel_token.cancel();
        let streams: Vec<TcpConnection> = self.streams.write().unwrap().drain().map(|(_, c)| c).collect();
        for stream in streams {
            stream.close().await.ok();
        }
        self.udp.write().unwrap().take();
    }
}
