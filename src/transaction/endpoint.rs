use super::key::TransactionKey;
use super::timer::TimerWheel;
use super::transaction::{TransactionEvent, TransactionEventSender};
use super::{make_call_id, TransactionTimer};
use crate::auth::{DigestAlgorithm, DigestState};
use crate::message::{HostPort, Method, Request, Response, SipMessage, Uri};
use crate::transport::{
    SipAddr, SipConnection, TransportEvent, TransportLayer, TransportReceiver,
};
use crate::{Error, Result};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timer bases for the transaction state machines. The defaults are the
/// RFC 3261 values; tests compress them.
#[derive(Debug, Clone, Copy)]
pub struct EndpointOption {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
    /// Transaction timeout, 64·T1.
    pub t1x64: Duration,
    /// Granularity of the timer poll loop.
    pub timer_interval: Duration,
}

impl Default for EndpointOption {
    fn default() -> Self {
        EndpointOption {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            t1x64: Duration::from_secs(32),
            timer_interval: Duration::from_millis(20),
        }
    }
}

pub type EndpointInnerRef = Arc<EndpointInner>;

/// Responses that matched no live transaction: retransmitted finals of a
/// confirmed call, or finals from another fork. The facade decides what
/// to do with them.
pub type OrphanResponseReceiver = UnboundedReceiver<(Response, SipConnection, SipAddr)>;
type OrphanResponseSender = UnboundedSender<(Response, SipConnection, SipAddr)>;

/// Shared endpoint state: the transport layer, the timer wheel, and the
/// table of live client transactions keyed per RFC 3261.
///
/// After a client INVITE transaction terminates, its key stays in an
/// absorption window for 64·T1 together with the last ACK sent, so a
/// retransmitted final response is re-acknowledged without the transaction
/// object.
pub struct EndpointInner {
    pub user_agent: String,
    pub option: EndpointOption,
    pub timers: TimerWheel<TransactionTimer>,
    pub transport_layer: TransportLayer,
    pub digest_state: DigestState,
    pub preferred_digest: DigestAlgorithm,
    pub cancel_token: CancellationToken,
    transactions: RwLock<HashMap<TransactionKey, TransactionEventSender>>,
    absorbed: RwLock<HashMap<TransactionKey, Option<Request>>>,
    orphan_sender: RwLock<Option<OrphanResponseSender>>,
}

/// The endpoint handle the facade owns.
#[derive(Clone)]
pub struct Endpoint {
    pub inner: EndpointInnerRef,
}

pub struct EndpointBuilder {
    user_agent: String,
    option: EndpointOption,
    preferred_digest: DigestAlgorithm,
    cancel_token: Option<CancellationToken>,
    transport_layer: Option<TransportLayer>,
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        EndpointBuilder {
            user_agent: concat!("sipua/", env!("CARGO_PKG_VERSION")).to_string(),
            option: EndpointOption::default(),
            preferred_digest: DigestAlgorithm::default(),
            cancel_token: None,
            transport_layer: None,
        }
    }
}

impl EndpointBuilder {
    pub fn new() -> Self {
        EndpointBuilder::default()
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = user_agent.to_string();
        self
    }

    pub fn with_option(mut self, option: EndpointOption) -> Self {
        self.option = option;
        self
    }

    pub fn with_preferred_digest(mut self, algorithm: DigestAlgorithm) -> Self {
        self.preferred_digest = algorithm;
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn with_transport_layer(mut self, transport_layer: TransportLayer) -> Self {
        self.transport_layer = Some(transport_layer);
        self
    }

    pub fn build(self) -> Endpoint {
        let cancel_token = self.cancel_token.unwrap_or_default();
        let transport_layer = self
            .transport_layer
            .unwrap_or_else(|| TransportLayer::new(cancel_token.child_token()));
        Endpoint {
            inner: Arc::new(EndpointInner {
                user_agent: self.user_agent,
                option: self.option,
                timers: TimerWheel::new(),
                transport_layer,
                digest_state: DigestState::new(),
                preferred_digest: self.preferred_digest,
                cancel_token,
                transactions: RwLock::new(HashMap::new()),
                absorbed: RwLock::new(HashMap::new()),
                orphan_sender: RwLock::new(None),
            }),
        }
    }
}

impl Endpoint {
    /// Wires the transport serve loops and runs the endpoint event loop
    /// until the cancel token fires. Call from a spawned task.
    pub async fn serve(&self) {
        let (sender, receiver) = unbounded_channel();
        self.inner.transport_layer.start(sender);
        self.inner.serve_loop(receiver).await;
    }

    /// Responses with no matching transaction are delivered to the
    /// returned receiver after this call.
    pub fn subscribe_orphans(&self) -> OrphanResponseReceiver {
        let (sender, receiver) = unbounded_channel();
        self.inner.orphan_sender.write().unwrap().replace(sender);
        receiver
    }

    /// Stops the serve loop and every transaction. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl EndpointInner {
    pub fn attach_transaction(&self, key: &TransactionKey, sender: TransactionEventSender) {
        debug!("attaching transaction {}", key);
        self.transactions.write().unwrap().insert(key.clone(), sender);
    }

    /// Removes a transaction from the table. A client INVITE passes its
    /// last ACK so retransmitted finals keep being absorbed for 64·T1.
    pub fn detach_transaction(&self, key: &TransactionKey, last_ack: Option<Request>) {
        debug!("detaching transaction {}", key);
        self.transactions.write().unwrap().remove(key);
        if key.method == Method::Invite {
            self.absorbed.write().unwrap().insert(key.clone(), last_ack);
            self.timers
                .timeout(self.option.t1x64, TransactionTimer::Purge(key.clone()));
        }
    }

    fn find_transaction(&self, key: &TransactionKey) -> Option<TransactionEventSender> {
        self.transactions.read().unwrap().get(key).cloned()
    }

    pub fn close(&self) {
        self.cancel_token.cancel();
        let senders: Vec<TransactionEventSender> =
            self.transactions.write().unwrap().drain().map(|(_, s)| s).collect();
        for sender in senders {
            sender.send(TransactionEvent::Terminate).ok();
        }
    }

    async fn serve_loop(self: &Arc<Self>, mut transport_rx: TransportReceiver) {
        let mut ticker = tokio::time::interval(self.option.timer_interval);
        info!("endpoint serving, timer interval {:?}", self.option.timer_interval);
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("endpoint serve loop cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    for timer in self.timers.poll(Instant::now()) {
                        self.process_timer(timer);
                    }
                }
                event = transport_rx.recv() => match event {
                    Some(event) => self.process_transport_event(event).await,
                    None => break,
                },
            }
        }
    }

    fn process_timer(&self, timer: TransactionTimer) {
        if let TransactionTimer::Purge(key) = &timer {
            self.absorbed.write().unwrap().remove(key);
            return;
        }
        if let Some(sender) = self.find_transaction(timer.key()) {
            sender.send(TransactionEvent::Timer(timer)).ok();
        }
    }

    async fn process_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Incoming(SipMessage::Response(resp), connection, source) => {
                let key = match TransactionKey::from_response(&resp) {
                    Ok(key) => key,
                    Err(e) => {
                        warn!("dropping unmatchable response from {}: {}", source, e);
                        return;
                    }
                };
                match self.find_transaction(&key) {
                    Some(sender) => {
                        sender
                            .send(TransactionEvent::Received(
                                SipMessage::Response(resp),
                                Some(connection),
                            ))
                            .ok();
                    }
                    None => self.on_orphan_response(key, resp, connection, source).await,
                }
            }
            TransportEvent::Incoming(SipMessage::Request(req), _, source) => {
                // client-only endpoint: inbound requests have no handler
                debug!("ignoring inbound {} from {}", req.method, source);
            }
            TransportEvent::Closed(addr) => {
                self.transport_layer.evict_stream(addr.addr);
            }
        }
    }

    /// A response that matched no live transaction. Inside the absorption
    /// window a stored ACK is replayed; anything else is handed to the
    /// facade's orphan channel.
    async fn on_orphan_response(
        &self,
        key: TransactionKey,
        resp: Response,
        connection: SipConnection,
        source: SipAddr,
    ) {
        let absorbed = self.absorbed.read().unwrap().get(&key).cloned();
        match absorbed {
            Some(Some(ack)) if resp.to_tag() == ack.to_tag() => {
                debug!("re-acknowledging retransmitted final for {}", key);
                connection
                    .send(SipMessage::Request(ack), Some(&source))
                    .await
                    .ok();
            }
            _ => {
                let sender = self.orphan_sender.read().unwrap().clone();
                match sender {
                    Some(sender) => {
                        sender.send((resp, connection, source)).ok();
                    }
                    None => debug!("dropping orphan response for {}", key),
                }
            }
        }
    }

    /// The host to advertise in Via, Contact and Call-ID headers: the
    /// bound socket address, with a wildcard host replaced by the first
    /// non-loopback interface.
    pub fn local_contact_host(&self) -> Result<HostPort> {
        let local = self
            .transport_layer
            .local_udp_addr()
            .ok_or_else(|| Error::Transport("no local address bound".to_string()))?;
        if local.addr.ip().is_unspecified() {
            let ip = first_non_loopback_interface()?;
            return Ok(HostPort::from(std::net::SocketAddr::new(ip, local.addr.port())));
        }
        Ok(HostPort::from(local.addr))
    }

    /// Builds a top Via for an outbound request, with `rport` and a fresh
    /// branch unless one is supplied.
    pub fn get_via(&self, addr: Option<HostPort>, branch: Option<String>) -> Result<String> {
        let addr = match addr {
            Some(addr) => addr,
            None => self.local_contact_host()?,
        };
        let branch = branch.unwrap_or_else(super::make_branch);
        Ok(format!("SIP/2.0/UDP {};rport;branch={}", addr, branch))
    }

    pub fn next_call_id(&self) -> String {
        let host = self
            .local_contact_host()
            .map(|h| h.host)
            .unwrap_or_else(|_| "localhost".to_string());
        make_call_id(&host)
    }

    /// Assembles a request with the mandatory header set: Via, Call-ID,
    /// From, To, CSeq, Max-Forwards and User-Agent.
    pub fn make_request(
        &self,
        method: Method,
        uri: Uri,
        via: String,
        from: String,
        to: String,
        call_id: String,
        seq: u32,
    ) -> Request {
        let mut request = Request {
            method: method.clone(),
            uri,
            ..Default::default()
        };
        request.headers.push("Via", via);
        request.headers.push("Max-Forwards", "70");
        request.headers.push("From", from);
        request.headers.push("To", to);
        request.headers.push("Call-ID", call_id);
        request.headers.push("CSeq", format!("{} {}", seq, method));
        request.headers.push("User-Agent", self.user_agent.clone());
        request
    }
}

/// The first non-loopback IPv4 interface address.
fn first_non_loopback_interface() -> Result<IpAddr> {
    get_if_addrs::get_if_addrs()?
        .iter()
        .find(|i| !i.is_loopback())
        .map(|i| match i.addr {
            get_if_addrs::IfAddr::V4(ref addr) => Ok(IpAddr::V4(addr.ip)),
            _ => Err(Error::Transport("no IPv4 interface found".to_string())),
        })
        .unwrap_or(Err(Error::Transport("no usable interface found".to_string())))
}
