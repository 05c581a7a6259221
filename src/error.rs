use crate::dialog::DialogId;
use crate::transaction::key::TransactionKey;
use crate::transaction::TimerKind;

/// Classifies why the wire or SDP parser gave up on a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    MalformedStartLine,
    MalformedHeader,
    BadContentLength,
    UnterminatedHeader,
    Truncated,
    UnsupportedVersion,
    MalformedSdpLine,
    UnknownType,
}

impl std::fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ParseErrorKind::MalformedStartLine => "malformed start line",
            ParseErrorKind::MalformedHeader => "malformed header",
            ParseErrorKind::BadContentLength => "bad content length",
            ParseErrorKind::UnterminatedHeader => "unterminated header section",
            ParseErrorKind::Truncated => "truncated message",
            ParseErrorKind::UnsupportedVersion => "unsupported protocol version",
            ParseErrorKind::MalformedSdpLine => "malformed sdp line",
            ParseErrorKind::UnknownType => "unknown sdp type",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by every layer of the stack.
///
/// Facade calls either return a parsed [`crate::message::Response`]
/// (including 3xx–6xx finals) or one of these variants; they never
/// partially return.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed message: {0}")]
    MalformedMessage(ParseErrorKind),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("transaction {0} timed out on timer {1}")]
    TransactionTimedOut(TransactionKey, TimerKind),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("no dialog for call-id {0}")]
    NoDialog(String),

    #[error("bad argument: {0}")]
    BadArgument(&'static str),

    #[error("hook {0} failed: {1}")]
    HookFailure(&'static str, String),

    #[error("{0} ({1})")]
    Transaction(String, TransactionKey),

    #[error("{0} ({1})")]
    Dialog(String, DialogId),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
