use super::{
    SipAddr, SipConnection, TransportEvent, TransportKind, TransportSender, KEEPALIVE_REQUEST,
    KEEPALIVE_RESPONSE,
};
use crate::message::{parser, SipMessage};
use crate::Result;
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
    net::TcpStream,
    sync::Mutex,
};
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(super) const MAX_SIP_MESSAGE_SIZE: usize = 65535;

/// Frames SIP messages out of a byte stream.
///
/// A frame ends at the blank line terminating the header section plus the
/// declared Content-Length of body bytes, so several messages arriving in
/// one read segment are split correctly. Bare CRLF keepalive probes are
/// surfaced as their own frame kinds.
#[derive(Default)]
pub struct SipCodec {}

impl SipCodec {
    pub fn new() -> Self {
        Self {}
    }
}

#[derive(Debug, Clone)]
pub enum SipFrame {
    Message(SipMessage),
    KeepaliveRequest,
    KeepaliveResponse,
}

impl Decoder for SipCodec {
    type Item = SipFrame;
    type Error = crate::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() >= 4 && &src[0..4] == KEEPALIVE_REQUEST {
            src.advance(4);
            return Ok(Some(SipFrame::KeepaliveRequest));
        }
        if src.len() >= 2 && &src[0..2] == KEEPALIVE_RESPONSE {
            src.advance(2);
            return Ok(Some(SipFrame::KeepaliveResponse));
        }
        let frame_len = match parser::probe_frame(src)? {
            Some(len) => len,
            None => return Ok(None),
        };
        if src.len() < frame_len {
            return Ok(None);
        }
        let result = SipMessage::parse(&src[..frame_len]);
        src.advance(frame_len);
        // an unparseable frame is consumed so the stream stays in sync
        result.map(|msg| Some(SipFrame::Message(msg)))
    }
}

impl Encoder<SipMessage> for SipCodec {
    type Error = crate::Error;

    fn encode(&mut self, item: SipMessage, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&item.to_bytes());
        Ok(())
    }
}

/// Shared state of one stream connection, generic over the halves so the
/// same plumbing can back other stream transports.
pub struct StreamConnectionInner<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub local_addr: SipAddr,
    pub remote_addr: SipAddr,
    read_half: Mutex<Option<R>>,
    write_half: Mutex<W>,
}

impl<R, W> StreamConnectionInner<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(local_addr: SipAddr, remote_addr: SipAddr, read_half: R, write_half: W) -> Self {
        Self {
            local_addr,
            remote_addr,
            read_half: Mutex::new(Some(read_half)),
            write_half: Mutex::new(write_half),
        }
    }

    pub async fn send_message(&self, msg: SipMessage) -> Result<()> {
        let mut codec = SipCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf)?;
        self.send_raw(&buf).await
    }

    pub async fn send_raw(&self, data: &[u8]) -> Result<()> {
        let mut write_half = self.write_half.lock().await;
        write_half.write_all(data).await?;
        write_half.flush().await?;
        Ok(())
    }

    async fn serve_stream(
        &self,
        sender: TransportSender,
        connection: SipConnection,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut read_half = match self.read_half.lock().await.take() {
            Some(read_half) => read_half,
            None => {
                warn!("stream {} already being served", self.remote_addr);
                return Ok(());
            }
        };

        let mut codec = SipCodec::new();
        let mut buffer = BytesMut::with_capacity(MAX_SIP_MESSAGE_SIZE);
        let mut read_buf = vec![0u8; MAX_SIP_MESSAGE_SIZE];

        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("stream serve loop cancelled: {}", self.remote_addr);
                    break;
                }
                read = read_half.read(&mut read_buf) => match read {
                    Ok(0) => {
                        info!("stream closed by peer: {}", self.remote_addr);
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        warn!("stream read error from {}: {}", self.remote_addr, e);
                        break;
                    }
                },
            };
            buffer.extend_from_slice(&read_buf[..n]);

            loop {
                match codec.decode(&mut buffer) {
                    Ok(Some(SipFrame::Message(msg))) => {
                        debug!("received message from {}", self.remote_addr);
                        if sender
                            .send(TransportEvent::Incoming(
                                msg,
                                connection.clone(),
                                self.remote_addr,
                            ))
                            .is_err()
                        {
                            return Ok(());
                        }
                    }
                    Ok(Some(SipFrame::KeepaliveRequest)) => {
                        self.send_raw(KEEPALIVE_RESPONSE).await?;
                    }
                    Ok(Some(SipFrame::KeepaliveResponse)) => {}
                    Ok(None) => break,
                    Err(e) => {
                        warn!("dropping undecodable frame from {}: {}", self.remote_addr, e);
                    }
                }
            }
        }
        sender.send(TransportEvent::Closed(self.remote_addr)).ok();
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        let mut write_half = self.write_half.lock().await;
        write_half.shutdown().await?;
        Ok(())
    }
}

/// The common face of stream transports.
#[async_trait::async_trait]
pub trait StreamConnection: Send + Sync + 'static {
    fn local_addr(&self) -> SipAddr;
    fn remote_addr(&self) -> SipAddr;
    async fn send_message(&self, msg: SipMessage) -> Result<()>;
    async fn send_raw(&self, data: &[u8]) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// An outbound TCP connection.
#[derive(Clone)]
pub struct TcpConnection {
    inner: Arc<StreamConnectionInner<OwnedReadHalf, OwnedWriteHalf>>,
}

impl TcpConnection {
    pub async fn connect(remote: SocketAddr) -> Result<TcpConnection> {
        let stream = TcpStream::connect(remote)
            .await
            .map_err(|e| crate::Error::Transport(format!("connect {}: {}", remote, e)))?;
        let local_addr = SipAddr::new(TransportKind::Tcp, stream.local_addr()?);
        let remote_addr = SipAddr::new(TransportKind::Tcp, remote);
        let (read_half, write_half) = stream.into_split();
        info!("tcp connected {} -> {}", local_addr, remote_addr);
        Ok(TcpConnection {
            inner: Arc::new(StreamConnectionInner::new(
                local_addr, remote_addr, read_half, write_half,
            )),
        })
    }

    pub async fn serve_loop(
        &self,
        sender: TransportSender,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.inner
            .serve_stream(sender, SipConnection::Tcp(self.clone()), cancel)
            .await
    }
}

#[async_trait::async_trait]
impl StreamConnection for TcpConnection {
    fn local_addr(&self) -> SipAddr {
        self.inner.local_addr
    }

    fn remote_addr(&self) -> SipAddr {
        self.inner.remote_addr
    }

    async fn send_message(&self, msg: SipMessage) -> Result<()> {
        self.inner.send_message(msg).await
    }

    async fn send_raw(&self, data: &[u8]) -> Result<()> {
        self.inner.send_raw(data).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
