use crate::auth::{Credential, DigestChallenge};
use crate::dialog::registration::RefreshErrorSink;
use crate::dialog::DialogId;
use crate::message::{Request, Response, StatusKind};
use crate::transaction::key::TransactionKey;
use crate::transport::SipAddr;
use crate::{Error, Result};
use std::time::Instant;

/// What a request hook decided about the traversing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookDecision {
    /// Keep going; mutations made by the hook are kept.
    Forward,
    /// Cancel the send.
    Drop,
}

pub type HookError = Box<dyn std::error::Error + Send + Sync>;

pub type RequestHook = Box<
    dyn Fn(&mut Request, &RequestContext) -> std::result::Result<HookDecision, HookError>
        + Send
        + Sync,
>;
pub type ResponseHook =
    Box<dyn Fn(&mut Response, &RequestContext) -> std::result::Result<(), HookError> + Send + Sync>;
pub type ClassHook =
    Box<dyn Fn(&Response, &RequestContext) -> std::result::Result<(), HookError> + Send + Sync>;
pub type CredentialProvider = Box<dyn Fn(&DigestChallenge) -> Option<Credential> + Send + Sync>;

/// Context handed to every hook invocation.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Key of the transaction carrying the request, once one exists.
    pub transaction: Option<TransactionKey>,
    /// Dialog the request belongs to, when any.
    pub dialog: Option<DialogId>,
    /// Where the request is headed.
    pub destination: Option<SipAddr>,
    /// Where the response came from.
    pub source: Option<SipAddr>,
    pub created_at: Instant,
}

impl RequestContext {
    pub fn new() -> Self {
        RequestContext {
            transaction: None,
            dialog: None,
            destination: None,
            source: None,
            created_at: Instant::now(),
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        RequestContext::new()
    }
}

/// The event pipeline: a fixed set of optional callbacks observing and
/// steering the protocol flow.
///
/// `on_request` runs before a transaction is created and may mutate the
/// request or cancel the send. `on_response` runs for every response
/// delivered by a transaction and may mutate it; `on_auth_challenge` runs
/// on 401/407 before the challenge is answered; the status-class hooks run
/// after `on_response`. All hooks run synchronously on the calling task,
/// and a hook error aborts the operation with
/// [`Error::HookFailure`] leaving transaction and dialog state unchanged.
///
/// `credential_provider` is the last resort of credential selection,
/// after per-call and client-level credentials. `refresh_error_sink`
/// receives authentication failures from the registration refresher.
#[derive(Default)]
pub struct Hooks {
    pub on_request: Option<RequestHook>,
    pub on_response: Option<ResponseHook>,
    pub on_auth_challenge: Option<ResponseHook>,
    pub on_provisional: Option<ClassHook>,
    pub on_success: Option<ClassHook>,
    pub on_redirect: Option<ClassHook>,
    pub on_client_error: Option<ClassHook>,
    pub on_server_error: Option<ClassHook>,
    pub credential_provider: Option<CredentialProvider>,
    pub refresh_error_sink: Option<RefreshErrorSink>,
}

impl Hooks {
    /// Runs `on_request`; `Ok(HookDecision::Drop)` means the caller must
    /// not send.
    pub(crate) fn run_on_request(
        &self,
        request: &mut Request,
        ctx: &RequestContext,
    ) -> Result<HookDecision> {
        match &self.on_request {
            Some(hook) => {
                hook(request, ctx).map_err(|e| Error::HookFailure("on_request", e.to_string()))
            }
            None => Ok(HookDecision::Forward),
        }
    }

    /// Runs the response pipeline: `on_response`, then `on_auth_challenge`
    /// for a 401/407, then the status-class hook.
    pub(crate) fn dispatch_response(
        &self,
        response: &mut Response,
        ctx: &RequestContext,
    ) -> Result<()> {
        if let Some(hook) = &self.on_response {
            hook(response, ctx).map_err(|e| Error::HookFailure("on_response", e.to_string()))?;
        }
        if response.status.0 == 401 || response.status.0 == 407 {
            if let Some(hook) = &self.on_auth_challenge {
                hook(response, ctx)
                    .map_err(|e| Error::HookFailure("on_auth_challenge", e.to_string()))?;
            }
        }
        let (class_hook, name) = match response.status.kind() {
            StatusKind::Provisional => (&self.on_provisional, "on_provisional"),
            StatusKind::Success => (&self.on_success, "on_success"),
            StatusKind::Redirect => (&self.on_redirect, "on_redirect"),
            StatusKind::ClientError => (&self.on_client_error, "on_client_error"),
            StatusKind::ServerError | StatusKind::GlobalFailure => {
                (&self.on_server_error, "on_server_error")
            }
        };
        if let Some(hook) = class_hook {
            hook(response, ctx).map_err(|e| Error::HookFailure(name, e.to_string()))?;
        }
        Ok(())
    }

    /// Credential precedence tail: asks the provider hook.
    pub(crate) fn provide_credential(&self, challenge: &DigestChallenge) -> Option<Credential> {
        self.credential_provider.as_ref().and_then(|p| p(challenge))
    }
}
