use super::dialog::ResponseObserver;
use crate::auth::{handle_client_authenticate, Credential};
use crate::message::{HostPort, Method, Response, StatusCode, StatusKind, Uri};
use crate::transaction::endpoint::EndpointInnerRef;
use crate::transaction::key::TransactionKey;
use crate::transaction::transaction::Transaction;
use crate::transaction::make_tag;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Methods advertised in the Allow header of REGISTER and INVITE.
pub const ALLOWED_METHODS: &str = "INVITE, ACK, BYE, CANCEL, OPTIONS, MESSAGE, INFO, UPDATE, REFER";

/// SIP registration client.
///
/// Binds an address of record to the local contact at a registrar. The
/// Call-ID is stable across refreshes and the CSeq counts up, as refresh
/// REGISTERs are one quasi-dialog with the registrar. A 401/407 challenge
/// is answered once per attempt when credentials are present.
///
/// The registrar may reveal this client's public address through the Via
/// `received`/`rport` parameters; when it does, the learned address
/// replaces the advertised contact host on the next attempt.
pub struct Registration {
    pub last_seq: u32,
    pub endpoint: EndpointInnerRef,
    pub credential: Option<Credential>,
    pub contact: Option<String>,
    pub public_address: Option<HostPort>,
    /// Expiry granted by the last successful registration.
    pub granted_expires: Option<u32>,
    call_id: String,
    from_tag: String,
}

impl Registration {
    pub fn new(endpoint: EndpointInnerRef, credential: Option<Credential>) -> Self {
        let call_id = endpoint.next_call_id();
        Registration {
            last_seq: 0,
            endpoint,
            credential,
            contact: None,
            public_address: None,
            granted_expires: None,
            call_id,
            from_tag: make_tag(),
        }
    }

    /// Seconds until the current registration lapses.
    pub fn expires(&self) -> u32 {
        self.granted_expires.unwrap_or(3600)
    }

    fn contact_value(&self, user: Option<&str>) -> Result<String> {
        if let Some(contact) = &self.contact {
            return Ok(contact.clone());
        }
        let host = match &self.public_address {
            Some(public) => public.clone(),
            None => self.endpoint.local_contact_host()?,
        };
        Ok(match user {
            Some(user) => format!("<sip:{}@{}>", user, host),
            None => format!("<sip:{}>", host),
        })
    }

    /// Builds a REGISTER binding `aor` at `registrar` (the AoR host when
    /// omitted) for `expires` seconds. `expires` 0 removes the binding.
    pub fn make_register_request(
        &mut self,
        aor: &Uri,
        registrar: Option<&Uri>,
        expires: u32,
    ) -> Result<crate::message::Request> {
        self.last_seq += 1;
        let registrar_uri = match registrar {
            Some(uri) => uri.clone(),
            None => {
                let mut uri = aor.clone();
                uri.user = None;
                uri
            }
        };

        let user = aor.user.as_ref().map(|u| u.user.as_str());
        let display = self
            .credential
            .as_ref()
            .and_then(|c| c.display_name.as_deref());
        let address = match display {
            Some(name) => format!("\"{}\" <{}>", name, aor),
            None => format!("<{}>", aor),
        };
        let from = format!("{};tag={}", address, self.from_tag);
        let via = self.endpoint.get_via(None, None)?;
        let mut request = self.endpoint.make_request(
            Method::Register,
            registrar_uri,
            via,
            from,
            address,
            self.call_id.clone(),
            self.last_seq,
        );
        request.headers.push("Contact", self.contact_value(user)?);
        request.headers.push("Expires", expires.to_string());
        request.headers.push("Allow", ALLOWED_METHODS);
        Ok(request)
    }

    /// Registers `aor` and returns the final response.
    pub async fn register(
        &mut self,
        aor: &Uri,
        registrar: Option<&Uri>,
        expires: u32,
        observer: ResponseObserver<'_>,
    ) -> Result<Response> {
        let request = self.make_register_request(aor, registrar, expires)?;
        self.do_register(request, observer).await
    }

    /// Sends a prepared REGISTER through its transaction, answering one
    /// authentication challenge, and returns the final response.
    pub async fn do_register(
        &mut self,
        request: crate::message::Request,
        observer: ResponseObserver<'_>,
    ) -> Result<Response> {
        let key = TransactionKey::from_request(&request)?;
        let mut tx = Transaction::new_client(key, request, self.endpoint.clone(), None);
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
                        "registration ended without a final response".to_string(),
                    ));
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
                    self.learn_public_address(&resp);
                    if auth_sent {
                        debug!("second {} after auth, surfacing", resp.status);
                        return Ok(resp);
                    }
                    let Some(credential) = &self.credential else {
                        debug!("{} without credential", resp.status);
                        return Ok(resp);
                    };
                    self.last_seq += 1;
                    let preferred = self.endpoint.preferred_digest;
                    tx = handle_client_authenticate(self.last_seq, tx, &resp, credential, preferred)
                        .await?;
                    tx.send().await?;
                    auth_sent = true;
                }
                StatusKind::Success => {
                    self.learn_public_address(&resp);
                    self.granted_expires = resp.expires_granted();
                    info!(
                        "registration done: {} expires {:?}",
                        resp.status, self.granted_expires
                    );
                    return Ok(resp);
                }
                _ => {
                    info!("registration done: {}", resp.status);
                    return Ok(resp);
                }
            }
        }
    }

    /// Adopts the source address the registrar observed, invalidating the
    /// cached contact so the next attempt advertises it.
    fn learn_public_address(&mut self, resp: &Response) {
        let Some(received) = resp.via_received() else {
            return;
        };
        if self.public_address.as_ref() != Some(&received) {
            info!(
                "discovered public address {:?} -> {}",
                self.public_address, received
            );
            self.public_address = Some(received);
            self.contact = None;
        }
    }
}

/// Rescheduling policy of the registration refresher: wake
/// `guard` seconds before expiry, never sooner than `floor` from now.
#[derive(Debug, Clone, Copy)]
pub struct RefreshConfig {
    pub guard: Duration,
    pub floor: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        RefreshConfig {
            guard: Duration::from_secs(60),
            floor: Duration::from_secs(5),
        }
    }
}

impl RefreshConfig {
    /// The wait before the next refresh for a granted expiry.
    pub fn next_wait(&self, expires: u32) -> Duration {
        let expiry = Duration::from_secs(expires as u64);
        expiry.saturating_sub(self.guard).max(self.floor)
    }
}

/// Receives errors the refresher cannot recover from on its own.
pub type RefreshErrorSink = Arc<dyn Fn(&Error) + Send + Sync>;

/// Keeps a registration alive by re-issuing REGISTER before the granted
/// expiry lapses.
///
/// One refresh is in flight at a time. Cancellation is synchronous: after
/// [`AutoRefresher::stop`] returns no further refresh fires. Transient
/// failures are logged and retried on the next tick; an authentication
/// failure is also handed to the error sink so the application can renew
/// credentials.
pub struct AutoRefresher {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl AutoRefresher {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        endpoint: EndpointInnerRef,
        credential: Option<Credential>,
        aor: Uri,
        registrar: Option<Uri>,
        expires: u32,
        initial_grant: u32,
        config: RefreshConfig,
        interval: Option<Duration>,
        immediate: bool,
        error_sink: Option<RefreshErrorSink>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut registration = Registration::new(endpoint, credential);
            let mut grant = initial_grant;
            let mut first = immediate;
            loop {
                let wait = if first {
                    first = false;
                    Duration::ZERO
                } else {
                    interval.unwrap_or_else(|| config.next_wait(grant))
                };
                debug!("next registration refresh in {:?}", wait);
                tokio::select! {
                    _ = task_cancel.cancelled() => {
                        info!("registration refresher stopped");
                        return;
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
                let outcome = registration
                    .register(&aor, registrar.as_ref(), expires, &mut |_: &mut Response| Ok(()))
                    .await;
                match outcome {
                    Ok(resp) if resp.status.is_success() => {
                        grant = resp.expires_granted().unwrap_or(expires);
                    }
                    Ok(resp)
                        if resp.status == StatusCode::UNAUTHORIZED
                            || resp.status == StatusCode::PROXY_AUTHENTICATION_REQUIRED
                            || resp.status == StatusCode::FORBIDDEN =>
                    {
                        warn!("registration refresh rejected: {}", resp.status);
                        if let Some(sink) = &error_sink {
                            sink(&Error::AuthFailed(format!(
                                "registration refresh rejected with {}",
                                resp.status
                            )));
                        }
                    }
                    Ok(resp) => {
                        warn!("registration refresh failed: {}, retrying", resp.status);
                    }
                    Err(e) => {
                        warn!("registration refresh error: {}, retrying", e);
                        if let Error::AuthFailed(_) = &e {
                            if let Some(sink) = &error_sink {
                                sink(&e);
                            }
                        }
                    }
                }
            }
        });
        AutoRefresher { cancel, handle }
    }

    /// Stops the refresher; no refresh fires after this returns.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}

impl Drop for AutoRefresher {
    fn drop(&mut self) {
        self.stop();
    }
}
