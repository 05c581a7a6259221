use crate::error::ParseErrorKind;
use crate::message::{via_branch, via_sent_by, Method, Request, Response};
use crate::{Error, Result};

/// The RFC 3261 §17.1.3 client transaction key: top-Via branch plus
/// sent-by plus the CSeq method.
///
/// ACK matches the INVITE transaction it acknowledges, so `ACK` is folded
/// to `INVITE` here; CANCEL stays its own method and therefore its own
/// transaction even though it reuses the INVITE branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: String,
    pub sent_by: String,
    pub method: Method,
}

impl TransactionKey {
    pub fn from_request(req: &Request) -> Result<TransactionKey> {
        let via = req
            .top_via()
            .ok_or(Error::MalformedMessage(ParseErrorKind::MalformedHeader))?;
        let branch =
            via_branch(via).ok_or(Error::MalformedMessage(ParseErrorKind::MalformedHeader))?;
        let sent_by =
            via_sent_by(via).ok_or(Error::MalformedMessage(ParseErrorKind::MalformedHeader))?;
        Ok(TransactionKey {
            branch,
            sent_by,
            method: fold_method(req.method.clone()),
        })
    }

    pub fn from_response(resp: &Response) -> Result<TransactionKey> {
        let via = resp
            .top_via()
            .ok_or(Error::MalformedMessage(ParseErrorKind::MalformedHeader))?;
        let branch =
            via_branch(via).ok_or(Error::MalformedMessage(ParseErrorKind::MalformedHeader))?;
        let sent_by =
            via_sent_by(via).ok_or(Error::MalformedMessage(ParseErrorKind::MalformedHeader))?;
        let (_, method) = resp.cseq()?;
        Ok(TransactionKey {
            branch,
            sent_by,
            method: fold_method(method),
        })
    }
}

fn fold_method(method: Method) -> Method {
    match method {
        Method::Ack => Method::Invite,
        other => other,
    }
}

impl std::fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}|{}", self.branch, self.sent_by, self.method)
    }
}
