use super::DialogId;
use crate::auth::{handle_client_authenticate, Credential};
use crate::error::ParseErrorKind;
use crate::message::{header_uri, with_header_param, Method, Request, Response, StatusCode, StatusKind, Uri};
use crate::transaction::endpoint::EndpointInnerRef;
use crate::transaction::key::TransactionKey;
use crate::transaction::transaction::Transaction;
use crate::transaction::make_branch;
use crate::transport::{SipAddr, TransportLayer};
use crate::{Error, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    /// INVITE sent, no dialog-forming response yet.
    Calling,
    /// A non-100 provisional with a To tag arrived.
    Early,
    /// A 2xx confirmed the dialog.
    Confirmed,
    Terminated,
}

impl std::fmt::Display for DialogState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DialogState::Calling => "Calling",
            DialogState::Early => "Early",
            DialogState::Confirmed => "Confirmed",
            DialogState::Terminated => "Terminated",
        };
        f.write_str(name)
    }
}

/// Called for every response a dialog-layer request loop consumes, before
/// the loop acts on it. The facade routes its hook pipeline through this;
/// an error aborts the operation.
pub type ResponseObserver<'a> = &'a mut (dyn FnMut(&mut Response) -> Result<()> + Send);

/// Core state shared by the handles of one client dialog.
///
/// Holds everything in-dialog requests are built from: the route set
/// (Record-Route of the confirming 2xx, reversed), the remote target from
/// Contact, the local CSeq counter, and the From/To values with their
/// tags. The INVITE's CSeq number is kept separately because ACK reuses
/// it while BYE and later requests keep counting up.
pub struct DialogInner {
    pub id: Mutex<DialogId>,
    pub state: Mutex<DialogState>,
    pub local_seq: AtomicU32,
    /// CSeq number of the (possibly re-submitted) INVITE; ACK reuses it.
    pub invite_seq: AtomicU32,
    pub local_uri: Uri,
    pub remote_uri: Uri,
    pub from: String,
    pub to: Mutex<String>,
    pub remote_target: Mutex<Option<Uri>>,
    pub route_set: Mutex<Vec<String>>,
    pub secure: bool,
    pub credential: Option<Credential>,
    pub local_contact: Option<Uri>,
    pub initial_request: Request,
    pub destination: Mutex<Option<SipAddr>>,
    pub last_ack: Mutex<Option<Request>>,
    pub(crate) endpoint_inner: EndpointInnerRef,
}

pub type DialogInnerRef = Arc<DialogInner>;

impl DialogInner {
    pub fn new(
        id: DialogId,
        initial_request: Request,
        endpoint_inner: EndpointInnerRef,
        credential: Option<Credential>,
        local_contact: Option<Uri>,
    ) -> Result<Self> {
        let (invite_cseq, _) = initial_request.cseq()?;
        let missing = || Error::MalformedMessage(ParseErrorKind::MalformedHeader);
        let from = initial_request.headers.get("From").ok_or_else(missing)?.to_string();
        let to = initial_request.headers.get("To").ok_or_else(missing)?.to_string();
        let local_uri = header_uri(&from)?;
        let remote_uri = header_uri(&to)?;
        let secure = initial_request.uri.is_secure();
        Ok(DialogInner {
            id: Mutex::new(id),
            state: Mutex::new(DialogState::Calling),
            local_seq: AtomicU32::new(invite_cseq),
            invite_seq: AtomicU32::new(invite_cseq),
            local_uri,
            remote_uri,
            from,
            to: Mutex::new(to),
            remote_target: Mutex::new(None),
            route_set: Mutex::new(Vec::new()),
            secure,
            credential,
            local_contact,
            initial_request,
            destination: Mutex::new(None),
            last_ack: Mutex::new(None),
            endpoint_inner,
        })
    }

    pub fn id(&self) -> DialogId {
        self.id.lock().unwrap().clone()
    }

    pub fn state(&self) -> DialogState {
        *self.state.lock().unwrap()
    }

    pub fn is_confirmed(&self) -> bool {
        self.state() == DialogState::Confirmed
    }

    pub fn increment_local_seq(&self) -> u32 {
        self.local_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Records the remote tag and target from a dialog-forming response.
    fn adopt_remote(&self, resp: &Response) -> Result<()> {
        if let Some(tag) = resp.to_tag() {
            {
                let mut id = self.id.lock().unwrap();
                if id.remote_tag.is_empty() {
                    id.remote_tag = tag.clone();
                }
            }
            let mut to = self.to.lock().unwrap();
            *to = with_header_param(&to, "tag", &tag);
        }
        if let Some(contact) = resp.contact_uri() {
            self.remote_target.lock().unwrap().replace(contact);
        }
        Ok(())
    }

    /// A non-100 provisional carrying a To tag opens the early dialog.
    pub fn on_provisional(&self, resp: &Response) -> Result<()> {
        if resp.status == StatusCode::TRYING || resp.to_tag().is_none() {
            return Ok(());
        }
        self.adopt_remote(resp)?;
        let state = self.state();
        if state == DialogState::Calling {
            self.transition(DialogState::Early)?;
        }
        Ok(())
    }

    /// The first 2xx confirms the dialog: remote tag and target are
    /// adopted and the route set is the reversed Record-Route of the
    /// response.
    pub fn confirm(&self, resp: &Response) -> Result<()> {
        self.adopt_remote(resp)?;
        let mut routes = resp.record_routes();
        routes.reverse();
        *self.route_set.lock().unwrap() = routes;
        self.transition(DialogState::Confirmed)
    }

    pub(crate) fn transition(&self, state: DialogState) -> Result<()> {
        let mut current = self.state.lock().unwrap();
        if *current == state {
            return Ok(());
        }
        info!("dialog {} transition {} -> {}", self.id.lock().unwrap(), current, state);
        *current = state;
        Ok(())
    }

    /// Builds an in-dialog request: Request-URI is the remote target,
    /// the stored route set becomes Route headers in order, From/To carry
    /// the dialog tags, and the CSeq number is the next local sequence
    /// unless an explicit one is given.
    pub fn make_request(
        &self,
        method: Method,
        seq: Option<u32>,
        body: Option<Vec<u8>>,
    ) -> Result<Request> {
        let seq = seq.unwrap_or_else(|| self.increment_local_seq());
        let uri = self
            .remote_target
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| self.remote_uri.clone());
        let via = self.endpoint_inner.get_via(None, None)?;
        let mut request = self.endpoint_inner.make_request(
            method.clone(),
            uri,
            via,
            self.from.clone(),
            self.to.lock().unwrap().clone(),
            self.id.lock().unwrap().call_id.clone(),
            seq,
        );
        for route in self.route_set.lock().unwrap().iter() {
            request.headers.push("Route", route.clone());
        }
        if let Some(contact) = &self.local_contact {
            request.headers.push("Contact", format!("<{}>", contact));
        }
        if let Some(body) = body {
            request.body = body;
        }
        Ok(request)
    }

    /// Builds the ACK acknowledging a 2xx. This is dialog scope: the
    /// branch is fresh, the CSeq number is the INVITE's with method ACK.
    pub fn make_ack(&self) -> Result<Request> {
        let seq = self.invite_seq.load(Ordering::Relaxed);
        let uri = self
            .remote_target
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| self.remote_uri.clone());
        let via = self.endpoint_inner.get_via(None, Some(make_branch()))?;
        let mut ack = self.endpoint_inner.make_request(
            Method::Ack,
            uri,
            via,
            self.from.clone(),
            self.to.lock().unwrap().clone(),
            self.id.lock().unwrap().call_id.clone(),
            seq,
        );
        ack.headers.unique_push("CSeq", format!("{} ACK", seq));
        for route in self.route_set.lock().unwrap().iter() {
            ack.headers.push("Route", route.clone());
        }
        Ok(ack)
    }

    /// Sends an in-dialog request through its own client transaction and
    /// returns the final response, answering one authentication challenge
    /// along the way.
    pub async fn do_request(
        &self,
        request: Request,
        observer: ResponseObserver<'_>,
    ) -> Result<Response> {
        let method = request.method.clone();
        let key = TransactionKey::from_request(&request)?;
        let mut tx = Transaction::new_client(key, request, self.endpoint_inner.clone(), None);
        tx.destination = *self.destination.lock().unwrap();
        tx.send().await?;

        let mut auth_sent = false;
        loop {
            let msg = match tx.receive().await {
                Some(msg) => msg,
                None => {
                    if let Some(kind) = tx.timed_out {
                        return Err(Error::TransactionTimedOut(tx.key.clone(), kind));
                    }
                    return Err(Error::Transport(format!(
                        "{} ended without a final response",
                        method
                    )));
                }
            };
            let mut resp = match msg {
                crate::message::SipMessage::Response(resp) => resp,
                _ => continue,
            };
            observer(&mut resp)?;
            match resp.status.kind() {
                StatusKind::Provisional => continue,
                _ if resp.status == StatusCode::UNAUTHORIZED
                    || resp.status == StatusCode::PROXY_AUTHENTICATION_REQUIRED =>
                {
                    if auth_sent {
                        debug!("second {} after auth, surfacing", resp.status);
                        return Ok(resp);
                    }
                    let Some(credential) = &self.credential else {
                        return Ok(resp);
                    };
                    let seq = match method {
                        // CANCEL keeps the sequence of what it cancels
                        Method::Cancel => tx.original.cseq()?.0,
                        _ => self.increment_local_seq(),
                    };
                    let preferred = self.endpoint_inner.preferred_digest;
                    tx = handle_client_authenticate(seq, tx, &resp, credential, preferred).await?;
                    tx.send().await?;
                    auth_sent = true;
                }
                _ => {
                    debug!("dialog request {} finished: {}", method, resp.status);
                    return Ok(resp);
                }
            }
        }
    }
}

/// Client handle of an INVITE dialog, cheap to clone.
#[derive(Clone)]
pub struct ClientInviteDialog {
    pub inner: DialogInnerRef,
}

impl ClientInviteDialog {
    pub fn id(&self) -> DialogId {
        self.inner.id()
    }

    pub fn state(&self) -> DialogState {
        self.inner.state()
    }

    /// Drives the INVITE transaction to its final response, updating the
    /// dialog on the way: early on a tagged provisional, confirmed on the
    /// first 2xx, terminated on any other final. One authentication
    /// challenge is answered when credentials are present; a second one
    /// is returned to the caller as-is.
    pub async fn process_invite(
        &self,
        mut tx: Transaction,
        observer: ResponseObserver<'_>,
    ) -> Result<(DialogId, Option<Response>)> {
        tx.send().await?;
        let mut auth_sent = false;
        loop {
            let msg = match tx.receive().await {
                Some(msg) => msg,
                None => {
                    if let Some(kind) = tx.timed_out {
                        self.inner.transition(DialogState::Terminated)?;
                        return Err(Error::TransactionTimedOut(tx.key.clone(), kind));
                    }
                    return Ok((self.id(), None));
                }
            };
            let mut resp = match msg {
                crate::message::SipMessage::Response(resp) => resp,
                _ => continue,
            };
            observer(&mut resp)?;
            match resp.status.kind() {
                StatusKind::Provisional => {
                    self.inner.on_provisional(&resp)?;
                }
                StatusKind::Success => {
                    if let Some(destination) = tx.destination {
                        self.inner.destination.lock().unwrap().replace(destination);
                    }
                    self.inner.confirm(&resp)?;
                    info!("dialog confirmed: {}", self.id());
                    return Ok((self.id(), Some(resp)));
                }
                _ if resp.status == StatusCode::UNAUTHORIZED
                    || resp.status == StatusCode::PROXY_AUTHENTICATION_REQUIRED =>
                {
                    if auth_sent {
                        self.inner.transition(DialogState::Terminated)?;
                        return Ok((self.id(), Some(resp)));
                    }
                    let Some(credential) = &self.inner.credential else {
                        self.inner.transition(DialogState::Terminated)?;
                        return Ok((self.id(), Some(resp)));
                    };
                    let seq = self.inner.increment_local_seq();
                    self.inner.invite_seq.store(seq, Ordering::Relaxed);
                    let preferred = self.inner.endpoint_inner.preferred_digest;
                    tx = handle_client_authenticate(seq, tx, &resp, credential, preferred).await?;
                    tx.send().await?;
                    auth_sent = true;
                }
                _ => {
                    self.inner.transition(DialogState::Terminated)?;
                    return Ok((self.id(), Some(resp)));
                }
            }
        }
    }

    /// Sends the dialog-scope ACK for a 2xx and remembers it so
    /// retransmitted 2xx finals can be re-acknowledged.
    pub async fn send_ack(&self) -> Result<()> {
        let ack = self.inner.make_ack()?;
        self.send_ack_request(ack).await
    }

    pub(crate) async fn send_ack_request(&self, ack: Request) -> Result<()> {
        let current_destination = *self.inner.destination.lock().unwrap();
        let destination = match current_destination {
            Some(addr) => addr,
            None => TransportLayer::resolve(&ack.uri).await?,
        };
        let (connection, resolved) = self
            .inner
            .endpoint_inner
            .transport_layer
            .lookup(&destination)
            .await?;
        connection
            .send(ack.clone().into(), Some(&resolved))
            .await?;
        self.inner.last_ack.lock().unwrap().replace(ack);
        Ok(())
    }

    /// Replays the stored ACK for a retransmitted 2xx.
    pub async fn resend_ack(&self) -> Result<()> {
        let ack = self.inner.last_ack.lock().unwrap().clone();
        match ack {
            Some(ack) => self.send_ack_request(ack).await,
            None => self.send_ack().await,
        }
    }

    /// Sends an arbitrary in-dialog request (INFO, UPDATE, REFER,
    /// re-INVITE) and returns its final response.
    pub async fn send_request(
        &self,
        method: Method,
        body: Option<Vec<u8>>,
        observer: ResponseObserver<'_>,
    ) -> Result<Response> {
        if !self.inner.is_confirmed() {
            return Err(Error::Dialog(
                format!("{} on unconfirmed dialog", method),
                self.id(),
            ));
        }
        let request = self.inner.make_request(method, None, body)?;
        self.inner.do_request(request, observer).await
    }

    /// Terminates a confirmed dialog with BYE and returns its final
    /// response.
    pub async fn bye(&self, observer: ResponseObserver<'_>) -> Result<Response> {
        if !self.inner.is_confirmed() {
            return Err(Error::Dialog("bye on unconfirmed dialog".to_string(), self.id()));
        }
        let request = self.inner.make_request(Method::Bye, None, None)?;
        let resp = self.inner.do_request(request, observer).await?;
        self.inner.transition(DialogState::Terminated)?;
        Ok(resp)
    }
}
