//! A SIP user-agent client (UAC) stack.
//!
//! The crate is organized in layers, lowest first:
//!
//! * [`message`]: SIP wire codec: requests, responses, the ordered
//!   case-insensitive header map, and URI handling.
//! * [`sdp`]: Session Description Protocol codec and offer/answer helpers.
//! * [`auth`]: Digest access authentication (RFC 7616) and the
//!   challenge/resubmit controller.
//! * [`transport`]: UDP and TCP connections with a shared send/receive
//!   contract.
//! * [`transaction`]: RFC 3261 client transaction state machines with
//!   retransmission timers, and the endpoint that owns them.
//! * [`dialog`]: dialog establishment and in-dialog request construction,
//!   registration and registration refresh.
//! * [`client`]: the user-facing facade tying the layers together.
//!
//! The stack is fully asynchronous on tokio. A [`client::Client`] owns its
//! endpoint, transaction table, dialog table and refresh scheduler; nothing
//! is process-global, and no logger is installed by the library; attach a
//! `tracing` subscriber of your choice.

pub mod auth;
pub mod client;
pub mod dialog;
pub mod error;
pub mod message;
pub mod sdp;
pub mod transaction;
pub mod transport;

pub use error::{Error, Result};
