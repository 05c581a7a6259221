use super::dialog::{ClientInviteDialog, DialogInner, ResponseObserver};
use super::dialog_layer::DialogLayer;
use super::DialogId;
use crate::auth::Credential;
use crate::message::{Method, Request, Response, Uri};
use crate::transaction::key::TransactionKey;
use crate::transaction::make_tag;
use crate::transaction::transaction::Transaction;
use crate::transport::SipAddr;
use crate::Result;
use std::sync::Arc;
use tracing::{debug, info};

/// Everything needed to originate a session.
///
/// `caller` becomes the From URI, `callee` the To URI and Request-URI,
/// `offer` the body (typically an SDP offer) with `content_type`
/// defaulting to `application/sdp`. Extra headers are applied last and
/// may override the generated ones.
#[derive(Default)]
pub struct InviteOption {
    pub caller: Uri,
    pub callee: Uri,
    pub destination: Option<SipAddr>,
    pub content_type: Option<String>,
    pub offer: Option<Vec<u8>>,
    pub contact: Option<Uri>,
    pub credential: Option<Credential>,
    pub headers: Option<Vec<(String, String)>>,
}

impl DialogLayer {
    /// Builds the initial INVITE for the given options: fresh Via branch,
    /// From tag and Call-ID, next layer-wide CSeq, Contact and
    /// Content-Type headers.
    pub fn make_invite_request(&self, opt: &InviteOption) -> Result<Request> {
        let seq = self.increment_last_seq();
        let display = opt
            .credential
            .as_ref()
            .and_then(|c| c.display_name.as_deref());
        let from = match display {
            Some(name) => format!("\"{}\" <{}>;tag={}", name, opt.caller, make_tag()),
            None => format!("<{}>;tag={}", opt.caller, make_tag()),
        };
        let to = format!("<{}>", opt.callee);
        let via = self.endpoint.get_via(None, None)?;
        let call_id = self.endpoint.next_call_id();
        let mut request = self.endpoint.make_request(
            Method::Invite,
            opt.callee.clone(),
            via,
            from,
            to,
            call_id,
            seq,
        );

        if let Some(contact) = &opt.contact {
            request.headers.unique_push("Contact", format!("<{}>", contact));
        }
        request.headers.unique_push(
            "Content-Type",
            opt.content_type
                .clone()
                .unwrap_or_else(|| "application/sdp".to_string()),
        );
        if let Some(headers) = &opt.headers {
            for (name, value) in headers {
                request.headers.unique_push(name, value.clone());
            }
        }
        Ok(request)
    }

    /// Creates the dialog and its INVITE transaction without sending.
    pub fn create_client_invite_dialog(
        &self,
        opt: InviteOption,
    ) -> Result<(ClientInviteDialog, Transaction)> {
        let mut request = self.make_invite_request(&opt)?;
        request.body = opt.offer.unwrap_or_default();
        self.create_dialog_from_request(request, opt.credential, opt.contact, opt.destination)
    }

    /// Wraps an already-built INVITE in a dialog and client transaction.
    pub fn create_dialog_from_request(
        &self,
        request: Request,
        credential: Option<Credential>,
        contact: Option<Uri>,
        destination: Option<SipAddr>,
    ) -> Result<(ClientInviteDialog, Transaction)> {
        let id = DialogId::try_from(&request)?;
        let inner = DialogInner::new(
            id,
            request.clone(),
            self.endpoint.clone(),
            credential,
            contact,
        )?;

        let key = TransactionKey::from_request(&request)?;
        let mut tx = Transaction::new_client(key, request, self.endpoint.clone(), None);
        tx.destination = destination;
        let dialog = ClientInviteDialog {
            inner: Arc::new(inner),
        };
        Ok((dialog, tx))
    }

    /// Sends an INVITE and tracks the resulting dialog in the table. The
    /// dialog is re-keyed under its confirmed id on a 2xx and dropped
    /// from the table on failure.
    pub async fn do_invite(
        &self,
        opt: InviteOption,
        observer: ResponseObserver<'_>,
    ) -> Result<(ClientInviteDialog, Option<Response>)> {
        let (dialog, tx) = self.create_client_invite_dialog(opt)?;
        let early_id = dialog.id();
        self.insert(dialog.clone());
        info!("client invite dialog created: {}", early_id);

        match dialog.process_invite(tx, observer).await {
            Ok((confirmed_id, resp)) => {
                if dialog.inner.is_confirmed() {
                    debug!("dialog confirmed: {} => {}", early_id, confirmed_id);
                    self.rekey(&early_id, dialog.clone());
                } else {
                    self.remove(&early_id);
                }
                Ok((dialog, resp))
            }
            Err(e) => {
                self.remove(&early_id);
                Err(e)
            }
        }
    }
}
