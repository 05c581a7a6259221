//! Dialog layer: dialog identification and state, in-dialog request
//! construction, INVITE session setup, and registration with refresh.

pub mod dialog;
pub mod dialog_layer;
pub mod invitation;
pub mod registration;

#[cfg(test)]
mod tests;

use crate::error::ParseErrorKind;
use crate::message::{Request, Response};
use crate::{Error, Result};

/// Identifies a dialog: Call-ID plus the local and remote tags. The
/// remote tag is empty until a dialog-forming response supplies it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogId {
    pub fn new(call_id: &str, local_tag: &str, remote_tag: &str) -> Self {
        DialogId {
            call_id: call_id.to_string(),
            local_tag: local_tag.to_string(),
            remote_tag: remote_tag.to_string(),
        }
    }
}

impl std::fmt::Display for DialogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.call_id, self.local_tag, self.remote_tag)
    }
}

/// Derives the dialog id from an outbound request: the From tag is the
/// local tag, the To tag (often still absent) the remote one.
impl TryFrom<&Request> for DialogId {
    type Error = Error;

    fn try_from(req: &Request) -> Result<DialogId> {
        let call_id = req.call_id()?;
        let local_tag = req
            .from_tag()
            .ok_or(Error::MalformedMessage(ParseErrorKind::MalformedHeader))?;
        Ok(DialogId {
            call_id: call_id.to_string(),
            local_tag,
            remote_tag: req.to_tag().unwrap_or_default(),
        })
    }
}

/// Derives the dialog id from a response to an outbound request.
impl TryFrom<&Response> for DialogId {
    type Error = Error;

    fn try_from(resp: &Response) -> Result<DialogId> {
        let call_id = resp.call_id()?;
        let local_tag = resp
            .from_tag()
            .ok_or(Error::MalformedMessage(ParseErrorKind::MalformedHeader))?;
        Ok(DialogId {
            call_id: call_id.to_string(),
            local_tag,
            remote_tag: resp.to_tag().unwrap_or_default(),
        })
    }
}
