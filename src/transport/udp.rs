use super::{SipAddr, SipConnection, TransportEvent, TransportSender};
use crate::message::SipMessage;
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_DATAGRAM_SIZE: usize = 65535;

/// The shared UDP socket. One datagram carries one SIP message.
#[derive(Clone)]
pub struct UdpConnection {
    inner: Arc<UdpInner>,
}

struct UdpInner {
    socket: UdpSocket,
    local: SipAddr,
}

impl UdpConnection {
    pub async fn bind(local: SocketAddr) -> Result<UdpConnection> {
        let socket = UdpSocket::bind(local).await?;
        let local = SipAddr::udp(socket.local_addr()?);
        Ok(UdpConnection {
            inner: Arc::new(UdpInner { socket, local }),
        })
    }

    pub fn local_addr(&self) -> SipAddr {
        self.inner.local
    }

    pub async fn send(&self, msg: &SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        let destination = destination
            .ok_or_else(|| Error::Transport("udp send without destination".to_string()))?;
        let bytes = msg.to_bytes();
        debug!("sending {} bytes to {}", bytes.len(), destination);
        self.inner
            .socket
            .send_to(&bytes, destination.addr)
            .await
            .map_err(|e| Error::Transport(format!("send to {}: {}", destination, e)))?;
        Ok(())
    }

    /// Reads datagrams until cancelled, parsing each into a message and
    /// forwarding it with its source address. A datagram that fails to
    /// parse is logged and dropped; the socket stays usable.
    pub async fn serve_loop(
        &self,
        sender: TransportSender,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, peer) = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("udp serve loop cancelled: {}", self.local_addr());
                    return Ok(());
                }
                received = self.inner.socket.recv_from(&mut buf) => received?,
            };
            let frame = &buf[..len];
            if frame.is_empty() || frame == super::KEEPALIVE_REQUEST || frame == super::KEEPALIVE_RESPONSE {
                continue;
            }
            let msg = match SipMessage::parse(frame) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("dropping malformed datagram from {}: {}", peer, e);
                    continue;
                }
            };
            let source = SipAddr::udp(peer);
            if sender
                .send(TransportEvent::Incoming(
                    msg,
                    SipConnection::Udp(self.clone()),
                    source,
                ))
                .is_err()
            {
                // endpoint is gone
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Method, SipMessage};
    use tokio::sync::mpsc::unbounded_channel;

    fn options_request(target: &str) -> crate::message::Request {
        let mut req = crate::message::Request {
            method: Method::Options,
            uri: target.try_into().unwrap(),
            ..Default::default()
        };
        req.headers.push("Via", "SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKtest001");
        req.headers.push("From", "<sip:test@127.0.0.1>;tag=t1");
        req.headers.push("To", format!("<{}>", target));
        req.headers.push("Call-ID", "udp-test@127.0.0.1");
        req.headers.push("CSeq", "1 OPTIONS");
        req
    }

    #[tokio::test]
    async fn test_udp_send_and_receive() {
        let a = UdpConnection::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = UdpConnection::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let (sender, mut receiver) = unbounded_channel();
        let serve = b.clone();
        let cancel = CancellationToken::new();
        let serve_cancel = cancel.clone();
        tokio::spawn(async move { serve.serve_loop(sender, serve_cancel).await });

        let req = options_request(&format!("sip:sut@{}", b.local_addr().addr));
        a.send(&SipMessage::Request(req.clone()), Some(&b.local_addr()))
            .await
            .unwrap();

        match receiver.recv().await.unwrap() {
            TransportEvent::Incoming(SipMessage::Request(received), _, source) => {
                assert_eq!(received.method, Method::Options);
                assert_eq!(received.call_id().unwrap(), "udp-test@127.0.0.1");
                assert_eq!(source.addr, a.local_addr().addr);
            }
            _ => panic!("expected incoming request"),
        }
        cancel.cancel();
    }
}
