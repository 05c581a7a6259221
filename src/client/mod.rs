//! The user-facing client: one facade owning the endpoint, transaction
//! and dialog tables, registration refresher and hook pipeline.

pub mod hooks;

#[cfg(test)]
mod tests;

pub use hooks::{HookDecision, Hooks, RequestContext};

use crate::auth::{
    build_authenticated_request, challenge_from_response, handle_client_authenticate, Credential,
};
use crate::dialog::dialog_layer::DialogLayer;
use crate::dialog::invitation::InviteOption;
use crate::dialog::registration::{AutoRefresher, RefreshConfig, Registration};
use crate::dialog::DialogId;
use crate::message::{Method, Request, Response, SipMessage, StatusCode, StatusKind, Uri};
use crate::transaction::endpoint::{
    Endpoint, EndpointBuilder, EndpointInnerRef, EndpointOption, OrphanResponseReceiver,
};
use crate::transaction::key::TransactionKey;
use crate::transaction::transaction::Transaction;
use crate::transaction::{make_branch, make_tag};
use crate::transport::{SipAddr, SipConnection};
use crate::{Error, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configures and creates a [`Client`].
pub struct ClientBuilder {
    user_agent: String,
    local_addr: SocketAddr,
    option: EndpointOption,
    preferred_digest: crate::auth::DigestAlgorithm,
    credential: Option<Credential>,
    refresh_config: RefreshConfig,
    hooks: Hooks,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        ClientBuilder {
            user_agent: concat!("sipua/", env!("CARGO_PKG_VERSION")).to_string(),
            local_addr: "0.0.0.0:0".parse().unwrap(),
            option: EndpointOption::default(),
            preferred_digest: crate::auth::DigestAlgorithm::default(),
            credential: None,
            refresh_config: RefreshConfig::default(),
            hooks: Hooks::default(),
        }
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        ClientBuilder::default()
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = user_agent.to_string();
        self
    }

    pub fn with_local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = addr;
        self
    }

    pub fn with_option(mut self, option: EndpointOption) -> Self {
        self.option = option;
        self
    }

    pub fn with_preferred_digest(mut self, algorithm: crate::auth::DigestAlgorithm) -> Self {
        self.preferred_digest = algorithm;
        self
    }

    /// The client-level credential, used when no per-call credential is
    /// given.
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn with_refresh_config(mut self, config: RefreshConfig) -> Self {
        self.refresh_config = config;
        self
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Binds the local socket, starts the endpoint loops and returns the
    /// ready client.
    pub async fn build(self) -> Result<Client> {
        let endpoint = EndpointBuilder::new()
            .with_user_agent(&self.user_agent)
            .with_option(self.option)
            .with_preferred_digest(self.preferred_digest)
            .build();
        endpoint
            .inner
            .transport_layer
            .bind_udp(self.local_addr)
            .await?;
        let orphans = endpoint.subscribe_orphans();
        let serve = endpoint.clone();
        tokio::spawn(async move { serve.serve().await });

        let dialog_layer = DialogLayer::new(endpoint.inner.clone());
        tokio::spawn(orphan_loop(
            endpoint.inner.clone(),
            dialog_layer.clone(),
            orphans,
        ));

        Ok(Client {
            endpoint,
            dialog_layer,
            hooks: Arc::new(self.hooks),
            credential: self.credential,
            refresh_config: self.refresh_config,
            registration: tokio::sync::Mutex::new(None),
            refresher: Mutex::new(None),
            refresh_setup: Mutex::new(None),
            pending_invites: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }
}

#[derive(Clone)]
struct RefreshSetup {
    aor: Uri,
    registrar: Option<Uri>,
    expires: u32,
    interval: Option<Duration>,
}

struct PendingInvite {
    request: Request,
    provisional: Arc<AtomicBool>,
}

/// A SIP user-agent client.
///
/// One client owns one local socket, one transaction table, one dialog
/// table and at most one registration refresher; dropping it releases all
/// of them. Every operation returns either the final [`Response`]
/// (including 3xx–6xx) or an [`Error`] the caller can discriminate.
pub struct Client {
    pub endpoint: Endpoint,
    pub dialog_layer: DialogLayer,
    hooks: Arc<Hooks>,
    credential: Option<Credential>,
    refresh_config: RefreshConfig,
    registration: tokio::sync::Mutex<Option<Registration>>,
    refresher: Mutex<Option<AutoRefresher>>,
    refresh_setup: Mutex<Option<RefreshSetup>>,
    pending_invites: Mutex<HashMap<TransactionKey, PendingInvite>>,
    closed: AtomicBool,
}

impl Client {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Transport("client is closed".to_string()));
        }
        Ok(())
    }

    fn inner(&self) -> &EndpointInnerRef {
        &self.endpoint.inner
    }

    /// The local identity advertised in From and Contact headers of
    /// out-of-dialog requests.
    fn local_identity(&self) -> Result<(String, Uri)> {
        let host = self.inner().local_contact_host()?;
        let user = self
            .credential
            .as_ref()
            .map(|c| c.username.clone())
            .unwrap_or_else(|| "anonymous".to_string());
        let uri: Uri = format!("sip:{}@{}", user, host).as_str().try_into()?;
        Ok((user, uri))
    }

    /// Registers `aor` and keeps the refresher (when enabled) aligned
    /// with the newly granted expiry.
    pub async fn register(
        &self,
        aor: &str,
        registrar: Option<&str>,
        expires: Option<u32>,
    ) -> Result<Response> {
        self.ensure_open()?;
        let aor: Uri = aor.try_into()?;
        let registrar: Option<Uri> = match registrar {
            Some(r) => Some(r.try_into()?),
            None => None,
        };
        let expires = expires.unwrap_or(3600);

        // a user register supersedes any scheduled refresh
        if let Some(refresher) = self.refresher.lock().unwrap().take() {
            refresher.stop();
        }

        let resp = {
            let mut guard = self.registration.lock().await;
            let registration = guard.get_or_insert_with(|| {
                Registration::new(self.inner().clone(), self.credential.clone())
            });
            let mut request = registration.make_register_request(&aor, registrar.as_ref(), expires)?;
            let mut ctx = RequestContext::new();
            if self.hooks.run_on_request(&mut request, &ctx)? == HookDecision::Drop {
                return Err(Error::HookFailure("on_request", "send cancelled".to_string()));
            }
            ctx.transaction = TransactionKey::from_request(&request).ok();
            let hooks = self.hooks.clone();
            let mut observer = move |resp: &mut Response| hooks.dispatch_response(resp, &ctx);
            registration.do_register(request, &mut observer).await?
        };

        if resp.status.is_success() {
            if let Some(setup) = self.refresh_setup.lock().unwrap().as_mut() {
                setup.aor = aor;
                setup.registrar = registrar;
                setup.expires = expires;
            }
            self.respawn_refresher(resp.expires_granted().unwrap_or(expires), false);
        }
        Ok(resp)
    }

    /// Removes the binding (REGISTER with expires 0) and cancels the
    /// refresher.
    pub async fn unregister(&self, aor: &str) -> Result<Response> {
        self.ensure_open()?;
        self.disable_auto_refresh();
        let aor_uri: Uri = aor.try_into()?;
        let mut guard = self.registration.lock().await;
        let registration = guard.get_or_insert_with(|| {
            Registration::new(self.inner().clone(), self.credential.clone())
        });
        let mut request = registration.make_register_request(&aor_uri, None, 0)?;
        let mut ctx = RequestContext::new();
        if self.hooks.run_on_request(&mut request, &ctx)? == HookDecision::Drop {
            return Err(Error::HookFailure("on_request", "send cancelled".to_string()));
        }
        ctx.transaction = TransactionKey::from_request(&request).ok();
        let hooks = self.hooks.clone();
        let mut observer = move |resp: &mut Response| hooks.dispatch_response(resp, &ctx);
        registration.do_register(request, &mut observer).await
    }

    /// Starts keeping the registration of `aor` fresh. The first REGISTER
    /// goes out immediately; afterwards the refresher wakes `guard`
    /// seconds before each granted expiry (never sooner than `floor`), or
    /// at the fixed `interval` when one is given.
    pub fn enable_auto_refresh(&self, aor: &str, interval: Option<Duration>) -> Result<()> {
        self.ensure_open()?;
        let aor: Uri = aor.try_into()?;
        let setup = RefreshSetup {
            aor,
            registrar: None,
            expires: 3600,
            interval,
        };
        self.refresh_setup.lock().unwrap().replace(setup);
        self.respawn_refresher(0, true);
        Ok(())
    }

    /// Stops the refresher; no refresh fires after this returns.
    pub fn disable_auto_refresh(&self) {
        self.refresh_setup.lock().unwrap().take();
        if let Some(refresher) = self.refresher.lock().unwrap().take() {
            refresher.stop();
        }
    }

    fn respawn_refresher(&self, grant: u32, immediate: bool) {
        let Some(setup) = self.refresh_setup.lock().unwrap().clone() else {
            return;
        };
        let refresher = AutoRefresher::spawn(
            self.inner().clone(),
            self.credential.clone(),
            setup.aor,
            setup.registrar,
            setup.expires,
            grant,
            self.refresh_config,
            setup.interval,
            immediate,
            self.hooks.refresh_error_sink.clone(),
        );
        if let Some(old) = self.refresher.lock().unwrap().replace(refresher) {
            old.stop();
        }
    }

    /// Originates a session and returns the INVITE's final response. The
    /// dialog lives in [`Client::dialog_layer`]; acknowledge a 2xx with
    /// [`Client::ack`] and tear down with [`Client::bye`].
    pub async fn invite(
        &self,
        to: &str,
        from: Option<&str>,
        body: Option<Vec<u8>>,
        extra_headers: Option<Vec<(String, String)>>,
    ) -> Result<Response> {
        self.ensure_open()?;
        let callee: Uri = to.try_into()?;
        let (_, local_uri) = self.local_identity()?;
        let caller: Uri = match from {
            Some(f) => f.try_into()?,
            None => local_uri.clone(),
        };
        let opt = InviteOption {
            caller,
            callee,
            destination: None,
            content_type: None,
            offer: None,
            contact: Some(local_uri),
            credential: self.credential.clone(),
            headers: extra_headers,
        };

        let mut request = self.dialog_layer.make_invite_request(&opt)?;
        request.body = body.unwrap_or_default();

        let mut ctx = RequestContext::new();
        if self.hooks.run_on_request(&mut request, &ctx)? == HookDecision::Drop {
            return Err(Error::HookFailure("on_request", "send cancelled".to_string()));
        }

        let (dialog, tx) = self.dialog_layer.create_dialog_from_request(
            request.clone(),
            opt.credential,
            opt.contact,
            None,
        )?;
        ctx.transaction = Some(tx.key.clone());
        ctx.dialog = Some(dialog.id());
        let early_id = dialog.id();
        self.dialog_layer.insert(dialog.clone());
        info!("client invite dialog created: {}", early_id);

        let provisional = Arc::new(AtomicBool::new(false));
        self.pending_invites.lock().unwrap().insert(
            tx.key.clone(),
            PendingInvite {
                request,
                provisional: provisional.clone(),
            },
        );
        let invite_key = tx.key.clone();

        let hooks = self.hooks.clone();
        let saw_provisional = provisional.clone();
        let mut observer = move |resp: &mut Response| {
            if resp.status.is_provisional() {
                saw_provisional.store(true, Ordering::SeqCst);
            }
            hooks.dispatch_response(resp, &ctx)
        };

        let outcome = dialog.process_invite(tx, &mut observer).await;
        self.pending_invites.lock().unwrap().remove(&invite_key);

        match outcome {
            Ok((confirmed_id, Some(resp))) => {
                if dialog.inner.is_confirmed() {
                    debug!("dialog confirmed: {} => {}", early_id, confirmed_id);
                    self.dialog_layer.rekey(&early_id, dialog);
                } else {
                    self.dialog_layer.remove(&early_id);
                }
                Ok(resp)
            }
            Ok((_, None)) => {
                self.dialog_layer.remove(&early_id);
                Err(Error::Transport(
                    "call ended without a final response".to_string(),
                ))
            }
            Err(e) => {
                self.dialog_layer.remove(&early_id);
                Err(e)
            }
        }
    }

    /// Acknowledges a 2xx final response. ACK for a non-2xx is automatic
    /// inside the INVITE transaction.
    pub async fn ack(&self, final_response: &Response) -> Result<()> {
        self.ensure_open()?;
        if !final_response.status.is_success() {
            return Err(Error::BadArgument("ack expects a 2xx response"));
        }
        let dialog = self
            .dialog_layer
            .match_response(final_response)
            .ok_or_else(|| Error::NoDialog(
                final_response.call_id().unwrap_or_default().to_string(),
            ))?;
        dialog.send_ack().await
    }

    /// Terminates the dialog and returns the BYE's final response.
    pub async fn bye(&self, dialog_id: &DialogId) -> Result<Response> {
        self.ensure_open()?;
        let dialog = self
            .dialog_layer
            .get(dialog_id)
            .ok_or_else(|| Error::NoDialog(dialog_id.call_id.clone()))?;
        let mut ctx = RequestContext::new();
        ctx.dialog = Some(dialog_id.clone());
        let hooks = self.hooks.clone();
        let mut observer = move |resp: &mut Response| hooks.dispatch_response(resp, &ctx);
        let resp = dialog.bye(&mut observer).await?;
        self.dialog_layer.remove(dialog_id);
        Ok(resp)
    }

    /// [`Client::bye`] addressed by the dialog-forming response instead of
    /// the dialog id.
    pub async fn bye_by_response(&self, response: &Response) -> Result<Response> {
        let id = DialogId::try_from(response)
            .map_err(|_| Error::NoDialog(response.call_id().unwrap_or_default().to_string()))?;
        self.bye(&id).await
    }

    /// Keys of INVITE transactions still waiting for a final response.
    pub fn pending_invites(&self) -> Vec<TransactionKey> {
        self.pending_invites.lock().unwrap().keys().cloned().collect()
    }

    /// Cancels a pending INVITE and returns the CANCEL's final response.
    /// Only valid once a provisional response has been received.
    pub async fn cancel(&self, invite_key: &TransactionKey) -> Result<Response> {
        self.ensure_open()?;
        let (request, provisional) = {
            let pending = self.pending_invites.lock().unwrap();
            let entry = pending
                .get(invite_key)
                .ok_or(Error::BadArgument("unknown invite transaction"))?;
            (entry.request.clone(), entry.provisional.load(Ordering::SeqCst))
        };
        if !provisional {
            return Err(Error::BadArgument(
                "cancel before any provisional response",
            ));
        }
        let cancel = make_cancel_request(&request)?;
        self.run_transaction(cancel, None, true).await
    }

    /// Probes a peer's capabilities.
    pub async fn options(&self, uri: &str) -> Result<Response> {
        self.ensure_open()?;
        let target: Uri = uri.try_into()?;
        let request = self.make_out_of_dialog_request(Method::Options, &target, None, None)?;
        self.run_transaction(request, None, true).await
    }

    /// Sends an instant message (MESSAGE method) and returns the final
    /// response.
    pub async fn message(
        &self,
        to: &str,
        text: &str,
        content_type: Option<&str>,
    ) -> Result<Response> {
        self.ensure_open()?;
        let target: Uri = to.try_into()?;
        let request = self.make_out_of_dialog_request(
            Method::Message,
            &target,
            Some(text.as_bytes().to_vec()),
            Some(content_type.unwrap_or("text/plain")),
        )?;
        self.run_transaction(request, None, true).await
    }

    /// Answers a 401/407 the application got back: rebuilds the
    /// originating request with fresh credentials and submits it once. A
    /// renewed challenge comes back as the raw response.
    pub async fn retry_with_auth(
        &self,
        challenge_response: &Response,
        credentials: Option<Credential>,
    ) -> Result<Response> {
        self.ensure_open()?;
        let original = challenge_response
            .original
            .as_deref()
            .ok_or(Error::BadArgument("response has no originating request"))?;
        let credential = match credentials.or_else(|| self.credential.clone()) {
            Some(c) => c,
            None => {
                let preferred = self.inner().preferred_digest;
                let (challenge, _) = challenge_from_response(challenge_response, preferred)?;
                self.hooks
                    .provide_credential(&challenge)
                    .ok_or_else(|| Error::AuthFailed("no credentials for challenge".to_string()))?
            }
        };
        let (seq, _) = original.cseq()?;
        let preferred = self.inner().preferred_digest;
        let request = build_authenticated_request(
            self.inner(),
            seq + 1,
            original,
            challenge_response,
            &credential,
            preferred,
        )?;
        // a second challenge surfaces as-is
        self.run_transaction(request, None, false).await
    }

    /// Drives one out-of-dialog client transaction to its final response,
    /// answering at most one authentication challenge when allowed.
    async fn run_transaction(
        &self,
        mut request: Request,
        credential: Option<Credential>,
        allow_auth: bool,
    ) -> Result<Response> {
        let mut ctx = RequestContext::new();
        if self.hooks.run_on_request(&mut request, &ctx)? == HookDecision::Drop {
            return Err(Error::HookFailure("on_request", "send cancelled".to_string()));
        }
        let key = TransactionKey::from_request(&request)?;
        ctx.transaction = Some(key.clone());
        let mut tx = Transaction::new_client(key, request, self.inner().clone(), None);
        tx.send().await?;

        let mut auth_sent = false;
        loop {
            let msg = match tx.receive().await {
                Some(msg) => msg,
                None => {
                    if let Some(kind) = tx.timed_out {
                        return Err(Error::TransactionTimedOut(tx.key.clone(), kind));
                    }
                    return Err(Error::Transport(
                        "request ended without a final response".to_string(),
                    ));
                }
            };
            let mut resp = match msg {
                SipMessage::Response(resp) => resp,
                _ => continue,
            };
            self.hooks.dispatch_response(&mut resp, &ctx)?;
            match resp.status.kind() {
                StatusKind::Provisional => continue,
                _ if resp.status == StatusCode::UNAUTHORIZED
                    || resp.status == StatusCode::PROXY_AUTHENTICATION_REQUIRED =>
                {
                    if !allow_auth || auth_sent {
                        return Ok(resp);
                    }
                    let preferred = self.inner().preferred_digest;
                    let credential = match credential.clone().or_else(|| self.credential.clone()) {
                        Some(c) => Some(c),
                        None => challenge_from_response(&resp, preferred)
                            .ok()
                            .and_then(|(c, _)| self.hooks.provide_credential(&c)),
                    };
                    let Some(credential) = credential else {
                        return Ok(resp);
                    };
                    let (seq, _) = tx.original.cseq()?;
                    tx = handle_client_authenticate(seq + 1, tx, &resp, &credential, preferred)
                        .await?;
                    tx.send().await?;
                    auth_sent = true;
                }
                _ => return Ok(resp),
            }
        }
    }

    fn make_out_of_dialog_request(
        &self,
        method: Method,
        target: &Uri,
        body: Option<Vec<u8>>,
        content_type: Option<&str>,
    ) -> Result<Request> {
        let (_, local_uri) = self.local_identity()?;
        let from = format!("<{}>;tag={}", local_uri, make_tag());
        let to = format!("<{}>", target);
        let via = self.inner().get_via(None, None)?;
        let call_id = self.inner().next_call_id();
        let mut request =
            self.inner()
                .make_request(method, target.clone(), via, from, to, call_id, 1);
        if let Some(content_type) = content_type {
            request.headers.push("Content-Type", content_type);
        }
        if let Some(body) = body {
            request.body = body;
        }
        Ok(request)
    }

    /// Closes the client: refresher first, then best-effort CANCEL for
    /// unanswered INVITEs and BYE for confirmed dialogs, then the
    /// transport. Idempotent; no refresh fires after this returns.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing client");
        self.disable_auto_refresh();

        let pending: Vec<PendingInvite> = {
            let mut map = self.pending_invites.lock().unwrap();
            map.drain().map(|(_, p)| p).collect()
        };
        for entry in pending {
            if !entry.provisional.load(Ordering::SeqCst) {
                continue;
            }
            match make_cancel_request(&entry.request) {
                Ok(cancel) => {
                    if let Ok(key) = TransactionKey::from_request(&cancel) {
                        let mut tx =
                            Transaction::new_client(key, cancel, self.inner().clone(), None);
                        tx.send().await.ok();
                    }
                }
                Err(e) => warn!("skipping cancel for pending invite: {}", e),
            }
        }

        let grace = self.inner().option.t1 * 4;
        for dialog in self.dialog_layer.all() {
            let id = dialog.id();
            if dialog.inner.is_confirmed() {
                let mut observer = |_: &mut Response| Ok(());
                tokio::time::timeout(grace, dialog.bye(&mut observer))
                    .await
                    .ok();
            }
            self.dialog_layer.remove(&id);
        }

        self.endpoint.close();
        self.inner().transport_layer.close().await;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // synchronous teardown only; the async courtesies need close()
        if let Some(refresher) = self.refresher.lock().unwrap().take() {
            refresher.stop();
        }
        self.endpoint.close();
    }
}

/// The CANCEL for a pending INVITE: same Request-URI, top Via (same
/// branch), From, To, Call-ID and CSeq number, method CANCEL.
fn make_cancel_request(invite: &Request) -> Result<Request> {
    let missing = || Error::BadArgument("invite lacks a mandatory header");
    let mut cancel = Request {
        method: Method::Cancel,
        uri: invite.uri.clone(),
        ..Default::default()
    };
    cancel
        .headers
        .push("Via", invite.top_via().ok_or_else(missing)?);
    cancel.headers.push("Max-Forwards", "70");
    cancel
        .headers
        .push("From", invite.headers.get("From").ok_or_else(missing)?);
    cancel
        .headers
        .push("To", invite.headers.get("To").ok_or_else(missing)?);
    cancel.headers.push("Call-ID", invite.call_id()?);
    let (seq, _) = invite.cseq()?;
    cancel.headers.push("CSeq", format!("{} CANCEL", seq));
    Ok(cancel)
}

/// Handles responses that matched no live transaction.
///
/// A retransmitted 2xx of a confirmed dialog is re-acknowledged. A 2xx
/// carrying an unknown remote tag while a sibling dialog exists is a
/// late answer from another fork: the first answer won, so the fork is
/// acknowledged and immediately released with BYE.
async fn orphan_loop(
    endpoint: EndpointInnerRef,
    dialog_layer: DialogLayer,
    mut orphans: OrphanResponseReceiver,
) {
    while let Some((resp, connection, source)) = orphans.recv().await {
        if !resp.status.is_success() {
            continue;
        }
        let Ok((cseq, method)) = resp.cseq() else {
            continue;
        };
        if method != Method::Invite {
            continue;
        }
        let Ok(id) = DialogId::try_from(&resp) else {
            continue;
        };
        if let Some(dialog) = dialog_layer.get(&id) {
            debug!("re-acknowledging retransmitted answer for {}", id);
            dialog.resend_ack().await.ok();
            continue;
        }
        if dialog_layer.find_sibling(&id).is_some() {
            info!("releasing late forked answer for {}", id);
            release_forked_answer(&endpoint, &resp, cseq, &connection, &source)
                .await
                .ok();
        }
    }
}

/// Acknowledges a losing fork's 2xx and follows up with BYE.
async fn release_forked_answer(
    endpoint: &EndpointInnerRef,
    resp: &Response,
    invite_cseq: u32,
    connection: &SipConnection,
    source: &SipAddr,
) -> Result<()> {
    let missing = || Error::BadArgument("forked answer lacks a mandatory header");
    let target = resp
        .contact_uri()
        .ok_or_else(missing)?;
    let from = resp.headers.get("From").ok_or_else(missing)?.to_string();
    let to = resp.headers.get("To").ok_or_else(missing)?.to_string();
    let call_id = resp.call_id()?.to_string();

    let via = endpoint.get_via(None, Some(make_branch()))?;
    let ack = endpoint.make_request(
        Method::Ack,
        target.clone(),
        via,
        from.clone(),
        to.clone(),
        call_id.clone(),
        invite_cseq,
    );
    connection.send(ack.into(), Some(source)).await?;

    let via = endpoint.get_via(None, Some(make_branch()))?;
    let bye = endpoint.make_request(
        Method::Bye,
        target,
        via,
        from,
        to,
        call_id,
        invite_cseq + 1,
    );
    let key = TransactionKey::from_request(&bye)?;
    let mut tx = Transaction::new_client(key, bye, endpoint.clone(), None);
    tx.destination = Some(*source);
    tokio::spawn(async move {
        if tx.send().await.is_ok() {
            while tx.receive().await.is_some() {}
        }
    });
    Ok(())
}
