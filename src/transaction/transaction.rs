use super::endpoint::EndpointInnerRef;
use super::key::TransactionKey;
use super::{TimerKind, TransactionState, TransactionTimer, TransactionType};
use crate::error::ParseErrorKind;
use crate::message::{Method, Request, Response, SipMessage, StatusKind};
use crate::transport::{SipAddr, SipConnection, TransportLayer};
use crate::{Error, Result};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

pub type TransactionEventReceiver = UnboundedReceiver<TransactionEvent>;
pub type TransactionEventSender = UnboundedSender<TransactionEvent>;

/// Events driving a client transaction: a message routed to it by the
/// endpoint, one of its timers firing, or a terminate order.
pub enum TransactionEvent {
    Received(SipMessage, Option<SipConnection>),
    Timer(TransactionTimer),
    Terminate,
}

/// A client transaction per RFC 3261 §17.1.
///
/// An INVITE transaction walks Calling → Proceeding → Completed →
/// Terminated; a non-INVITE transaction walks Trying → Proceeding →
/// Completed → Terminated. On unreliable transports the request is
/// retransmitted by Timer A (INVITE, interval doubling) or Timer E
/// (non-INVITE, doubling up to T2); Timer B/F bound the whole attempt at
/// 64·T1 and mark the transaction [`Transaction::timed_out`].
///
/// The transaction acknowledges non-2xx final responses itself: the ACK
/// reuses the INVITE's top Via (same branch) and CSeq number and takes the
/// To tag from the response. A 2xx final terminates the INVITE transaction
/// immediately; acknowledging it is dialog business, with a fresh branch.
///
/// Responses are consumed through [`Transaction::receive`]:
///
/// ```rust,no_run
/// # async fn example(mut tx: sipua::transaction::transaction::Transaction) -> sipua::Result<()> {
/// tx.send().await?;
/// while let Some(msg) = tx.receive().await {
///     if let sipua::message::SipMessage::Response(resp) = msg {
///         if resp.status.is_final() {
///             break;
///         }
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct Transaction {
    pub transaction_type: TransactionType,
    pub key: TransactionKey,
    pub original: Request,
    pub destination: Option<SipAddr>,
    pub state: TransactionState,
    pub endpoint_inner: EndpointInnerRef,
    pub connection: Option<SipConnection>,
    /// Every response routed to this transaction, in arrival order.
    pub responses: Vec<Response>,
    pub last_response: Option<Response>,
    pub last_ack: Option<Request>,
    /// Set when Timer B or F ended the transaction.
    pub timed_out: Option<TimerKind>,
    tu_receiver: TransactionEventReceiver,
    tu_sender: TransactionEventSender,
    timer_a: Option<u64>,
    timer_b: Option<u64>,
    timer_d: Option<u64>,
    timer_e: Option<u64>,
    timer_f: Option<u64>,
    timer_k: Option<u64>,
    is_cleaned_up: bool,
}

impl Transaction {
    pub fn new_client(
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let (transaction_type, state) = match original.method {
            Method::Invite => (TransactionType::ClientInvite, TransactionState::Calling),
            _ => (TransactionType::ClientNonInvite, TransactionState::Trying),
        };
        let (tu_sender, tu_receiver) = unbounded_channel();
        info!("transaction created {:?} {}", transaction_type, key);
        let tx = Self {
            transaction_type,
            key,
            original,
            destination: None,
            state,
            endpoint_inner,
            connection,
            responses: Vec::new(),
            last_response: None,
            last_ack: None,
            timed_out: None,
            tu_receiver,
            tu_sender,
            timer_a: None,
            timer_b: None,
            timer_d: None,
            timer_e: None,
            timer_f: None,
            timer_k: None,
            is_cleaned_up: false,
        };
        tx.endpoint_inner
            .attach_transaction(&tx.key, tx.tu_sender.clone());
        tx
    }

    /// Sends the request and arms the retransmission and timeout timers.
    pub async fn send(&mut self) -> Result<()> {
        if self.connection.is_none() {
            let target = match &self.destination {
                Some(addr) => *addr,
                None => TransportLayer::resolve(&self.original.uri).await?,
            };
            let (connection, resolved) = self
                .endpoint_inner
                .transport_layer
                .lookup(&target)
                .await?;
            if !connection.is_reliable() {
                self.destination.replace(resolved);
            }
            self.connection.replace(connection);
        }
        let connection = self.connection.as_ref().ok_or(Error::Transaction(
            "no connection for transaction".to_string(),
            self.key.clone(),
        ))?;
        connection
            .send(self.original.clone().into(), self.destination.as_ref())
            .await?;

        let option = &self.endpoint_inner.option;
        if !connection.is_reliable() {
            match self.transaction_type {
                TransactionType::ClientInvite => {
                    self.timer_a.replace(self.endpoint_inner.timers.timeout(
                        option.t1,
                        TransactionTimer::TimerA(self.key.clone(), option.t1),
                    ));
                }
                TransactionType::ClientNonInvite => {
                    self.timer_e.replace(self.endpoint_inner.timers.timeout(
                        option.t1,
                        TransactionTimer::TimerE(self.key.clone(), option.t1),
                    ));
                }
            }
        }
        match self.transaction_type {
            TransactionType::ClientInvite => {
                self.timer_b.replace(
                    self.endpoint_inner
                        .timers
                        .timeout(option.t1x64, TransactionTimer::TimerB(self.key.clone())),
                );
            }
            TransactionType::ClientNonInvite => {
                self.timer_f.replace(
                    self.endpoint_inner
                        .timers
                        .timeout(option.t1x64, TransactionTimer::TimerF(self.key.clone())),
                );
            }
        }
        Ok(())
    }

    /// Waits for the next message this transaction delivers to its user.
    /// Returns `None` once the transaction terminated; check
    /// [`Transaction::timed_out`] to distinguish timeout from completion.
    pub async fn receive(&mut self) -> Option<SipMessage> {
        while let Some(event) = self.tu_receiver.recv().await {
            match event {
                TransactionEvent::Received(SipMessage::Response(resp), connection) => {
                    if self.connection.is_none() {
                        self.connection = connection;
                    }
                    if let Some(msg) = self.on_received_response(resp).await {
                        return Some(msg);
                    }
                }
                TransactionEvent::Received(SipMessage::Request(_), _) => {
                    // client transactions never consume requests
                }
                TransactionEvent::Timer(timer) => {
                    self.on_timer(timer).await.ok();
                }
                TransactionEvent::Terminate => {
                    debug!("transaction {} received terminate", self.key);
                    return None;
                }
            }
        }
        None
    }

    pub fn is_terminated(&self) -> bool {
        self.state == TransactionState::Terminated
    }

    async fn on_received_response(&mut self, mut resp: Response) -> Option<SipMessage> {
        match resp.status.kind() {
            StatusKind::Provisional => {
                match self.state {
                    TransactionState::Calling | TransactionState::Trying => {
                        // the non-INVITE retransmit timer stops on the
                        // first provisional; the INVITE one keeps running
                        if self.transaction_type == TransactionType::ClientNonInvite {
                            self.timer_e
                                .take()
                                .map(|id| self.endpoint_inner.timers.cancel(id));
                        }
                        self.transition(TransactionState::Proceeding).ok()?;
                    }
                    TransactionState::Proceeding => {}
                    _ => return None,
                }
                self.responses.push(resp.clone());
                self.last_response.replace(resp.clone());
                Some(SipMessage::Response(resp))
            }
            StatusKind::Success if self.transaction_type == TransactionType::ClientInvite => {
                match self.state {
                    TransactionState::Calling | TransactionState::Proceeding => {
                        resp.original = Some(Box::new(self.original.clone()));
                        self.responses.push(resp.clone());
                        self.last_response.replace(resp.clone());
                        // a 2xx ends the INVITE transaction at once; the
                        // dialog layer acknowledges it
                        self.transition(TransactionState::Terminated).ok()?;
                        Some(SipMessage::Response(resp))
                    }
                    _ => None,
                }
            }
            _ => match self.transaction_type {
                TransactionType::ClientInvite => match self.state {
                    TransactionState::Calling | TransactionState::Proceeding => {
                        let ack = self.make_non2xx_ack(&resp).ok()?;
                        if let Some(connection) = &self.connection {
                            connection
                                .send(ack.clone().into(), self.destination.as_ref())
                                .await
                                .ok();
                        }
                        self.last_ack.replace(ack);
                        resp.original = Some(Box::new(self.original.clone()));
                        self.responses.push(resp.clone());
                        self.last_response.replace(resp.clone());
                        self.transition(TransactionState::Completed).ok()?;
                        Some(SipMessage::Response(resp))
                    }
                    TransactionState::Completed => {
                        // retransmitted final: replay the ACK, do not
                        // deliver again
                        if let (Some(ack), Some(connection)) = (&self.last_ack, &self.connection) {
                            connection
                                .send(ack.clone().into(), self.destination.as_ref())
                                .await
                                .ok();
                        }
                        None
                    }
                    _ => None,
                },
                TransactionType::ClientNonInvite => match self.state {
                    TransactionState::Trying | TransactionState::Proceeding => {
                        resp.original = Some(Box::new(self.original.clone()));
                        self.responses.push(resp.clone());
                        self.last_response.replace(resp.clone());
                        self.transition(TransactionState::Completed).ok()?;
                        Some(SipMessage::Response(resp))
                    }
                    _ => None,
                },
            },
        }
    }

    /// The transaction-scope ACK for a non-2xx final: same Request-URI,
    /// top Via (same branch), From, Call-ID, Route set and CSeq number as
    /// the INVITE, method ACK, To copied from the response so its tag
    /// matches.
    fn make_non2xx_ack(&self, resp: &Response) -> Result<Request> {
        let missing = || Error::MalformedMessage(ParseErrorKind::MalformedHeader);
        let mut ack = Request {
            method: Method::Ack,
            uri: self.original.uri.clone(),
            ..Default::default()
        };
        ack.headers
            .push("Via", self.original.top_via().ok_or_else(missing)?);
        ack.headers.push("Max-Forwards", "70");
        ack.headers
            .push("From", self.original.headers.get("From").ok_or_else(missing)?);
        ack.headers
            .push("To", resp.headers.get("To").ok_or_else(missing)?);
        ack.headers.push("Call-ID", self.original.call_id()?);
        let (seq, _) = self.original.cseq()?;
        ack.headers.push("CSeq", format!("{} ACK", seq));
        for route in self.original.headers.get_all("Route") {
            ack.headers.push("Route", route);
        }
        ack.headers
            .push("User-Agent", self.endpoint_inner.user_agent.clone());
        Ok(ack)
    }

    async fn on_timer(&mut self, timer: TransactionTimer) -> Result<()> {
        match timer {
            TransactionTimer::TimerA(key, interval) => {
                // INVITE retransmission continues until a final arrives
                if matches!(
                    self.state,
                    TransactionState::Calling | TransactionState::Proceeding
                ) {
                    if let Some(connection) = &self.connection {
                        debug!("timer A retransmitting {}", self.key);
                        connection
                            .send(self.original.clone().into(), self.destination.as_ref())
                            .await?;
                    }
                    let interval = (interval * 2).min(self.endpoint_inner.option.t1x64);
                    self.timer_a.replace(
                        self.endpoint_inner
                            .timers
                            .timeout(interval, TransactionTimer::TimerA(key, interval)),
                    );
                }
            }
            TransactionTimer::TimerE(key, interval) => {
                if self.state == TransactionState::Trying {
                    if let Some(connection) = &self.connection {
                        debug!("timer E retransmitting {}", self.key);
                        connection
                            .send(self.original.clone().into(), self.destination.as_ref())
                            .await?;
                    }
                    let interval = (interval * 2).min(self.endpoint_inner.option.t2);
                    self.timer_e.replace(
                        self.endpoint_inner
                            .timers
                            .timeout(interval, TransactionTimer::TimerE(key, interval)),
                    );
                }
            }
            TransactionTimer::TimerB(_) => self.on_timeout(TimerKind::B)?,
            TransactionTimer::TimerF(_) => self.on_timeout(TimerKind::F)?,
            TransactionTimer::TimerD(_) | TransactionTimer::TimerK(_) => {
                if self.state == TransactionState::Completed {
                    self.transition(TransactionState::Terminated)?;
                }
            }
            TransactionTimer::Purge(_) => {}
        }
        Ok(())
    }

    fn on_timeout(&mut self, kind: TimerKind) -> Result<()> {
        if matches!(
            self.state,
            TransactionState::Calling | TransactionState::Trying | TransactionState::Proceeding
        ) {
            info!("transaction {} timed out on timer {}", self.key, kind);
            self.timed_out = Some(kind);
            self.transition(TransactionState::Terminated)?;
        }
        Ok(())
    }

    fn transition(&mut self, state: TransactionState) -> Result<()> {
        if self.state == state {
            return Ok(());
        }
        let valid = matches!(
            (self.state, state),
            (TransactionState::Calling, _)
                | (TransactionState::Trying, TransactionState::Proceeding)
                | (TransactionState::Trying, TransactionState::Completed)
                | (TransactionState::Trying, TransactionState::Terminated)
                | (TransactionState::Proceeding, TransactionState::Completed)
                | (TransactionState::Proceeding, TransactionState::Terminated)
                | (TransactionState::Completed, TransactionState::Terminated)
        );
        if !valid {
            return Err(Error::Transaction(
                format!("invalid transition {:?} -> {:?}", self.state, state),
                self.key.clone(),
            ));
        }
        match state {
            TransactionState::Completed => {
                self.timer_a
                    .take()
                    .map(|id| self.endpoint_inner.timers.cancel(id));
                self.timer_b
                    .take()
                    .map(|id| self.endpoint_inner.timers.cancel(id));
                self.timer_e
                    .take()
                    .map(|id| self.endpoint_inner.timers.cancel(id));
                self.timer_f
                    .take()
                    .map(|id| self.endpoint_inner.timers.cancel(id));
                let unreliable = self
                    .connection
                    .as_ref()
                    .map(|c| !c.is_reliable())
                    .unwrap_or(true);
                let option = &self.endpoint_inner.option;
                match self.transaction_type {
                    TransactionType::ClientInvite => {
                        let wait = if unreliable {
                            option.t1x64
                        } else {
                            std::time::Duration::ZERO
                        };
                        self.timer_d.replace(
                            self.endpoint_inner
                                .timers
                                .timeout(wait, TransactionTimer::TimerD(self.key.clone())),
                        );
                    }
                    TransactionType::ClientNonInvite => {
                        let wait = if unreliable {
                            option.t4
                        } else {
                            std::time::Duration::ZERO
                        };
                        self.timer_k.replace(
                            self.endpoint_inner
                                .timers
                                .timeout(wait, TransactionTimer::TimerK(self.key.clone())),
                        );
                    }
                }
            }
            TransactionState::Terminated => {
                self.cleanup();
                self.tu_sender.send(TransactionEvent::Terminate).ok();
            }
            _ => {}
        }
        debug!("transaction {} transition {:?} -> {:?}", self.key, self.state, state);
        self.state = state;
        Ok(())
    }

    fn cleanup_timers(&mut self) {
        for id in [
            self.timer_a.take(),
            self.timer_b.take(),
            self.timer_d.take(),
            self.timer_e.take(),
            self.timer_f.take(),
            self.timer_k.take(),
        ]
        .into_iter()
        .flatten()
        {
            self.endpoint_inner.timers.cancel(id);
        }
    }

    fn cleanup(&mut self) {
        if self.is_cleaned_up {
            return;
        }
        self.is_cleaned_up = true;
        self.cleanup_timers();
        let last_ack = match self.transaction_type {
            TransactionType::ClientInvite => self.last_ack.take(),
            TransactionType::ClientNonInvite => None,
        };
        self.endpoint_inner.detach_transaction(&self.key, last_ack);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.cleanup();
        debug!("transaction dropped: {}", self.key);
    }
}
