//! Client dialog tests
//!
//! Tests for client-side dialog behavior and state management

use crate::dialog::dialog::{ClientInviteDialog, DialogInner, DialogState};
use crate::dialog::DialogId;
use crate::message::{via_branch, Method, Request, Response, StatusCode};
use crate::transaction::endpoint::{Endpoint, EndpointBuilder};
use std::sync::Arc;

async fn create_test_endpoint() -> crate::Result<Endpoint> {
    let endpoint = EndpointBuilder::new().with_user_agent("sipua-test").build();
    endpoint
        .inner
        .transport_layer
        .bind_udp("127.0.0.1:0".parse().unwrap())
        .await?;
    Ok(endpoint)
}

fn create_invite_request(from_tag: &str, to_tag: &str, call_id: &str) -> Request {
    let mut req = Request {
        method: Method::Invite,
        uri: "sip:bob@example.com:5060".try_into().unwrap(),
        ..Default::default()
    };
    req.headers.push(
        "Via",
        "SIP/2.0/UDP alice.example.com:5060;branch=z9hG4bKnashds",
    );
    req.headers.push("Max-Forwards", "70");
    let mut from = "Alice <sip:alice@example.com>".to_string();
    if !from_tag.is_empty() {
        from = format!("{};tag={}", from, from_tag);
    }
    req.headers.push("From", from);
    let mut to = "Bob <sip:bob@example.com>".to_string();
    if !to_tag.is_empty() {
        to = format!("{};tag={}", to, to_tag);
    }
    req.headers.push("To", to);
    req.headers.push("Call-ID", call_id);
    req.headers.push("CSeq", "1 INVITE");
    req.headers.push("Contact", "<sip:alice@alice.example.com:5060>");
    req.body = b"v=0\r\no=alice 2890844526 2890844527 IN IP4 host.atlanta.com\r\n".to_vec();
    req
}

fn create_response(req: &Request, status: StatusCode, to_tag: &str) -> Response {
    let mut resp = Response {
        status,
        reason: status.reason_phrase().to_string(),
        ..Default::default()
    };
    resp.headers.push("Via", req.headers.get("Via").unwrap());
    resp.headers.push("From", req.headers.get("From").unwrap());
    let to = req.headers.get("To").unwrap();
    if to_tag.is_empty() {
        resp.headers.push("To", to);
    } else {
        resp.headers.push("To", format!("{};tag={}", to, to_tag));
    }
    resp.headers.push("Call-ID", req.call_id().unwrap());
    resp.headers.push("CSeq", req.headers.get("CSeq").unwrap());
    resp.headers.push("Contact", "<sip:bob@bob.example.com:5062>");
    resp
}

fn create_dialog(endpoint: &Endpoint, from_tag: &str, call_id: &str) -> ClientInviteDialog {
    let invite = create_invite_request(from_tag, "", call_id);
    let id = DialogId::try_from(&invite).unwrap();
    let inner = DialogInner::new(
        id,
        invite,
        endpoint.inner.clone(),
        None,
        Some("sip:alice@alice.example.com:5060".try_into().unwrap()),
    )
    .unwrap();
    ClientInviteDialog {
        inner: Arc::new(inner),
    }
}

#[tokio::test]
async fn test_client_dialog_creation() -> crate::Result<()> {
    let endpoint = create_test_endpoint().await?;
    let dialog = create_dialog(&endpoint, "alice-tag", "test-call-id");

    assert_eq!(
        dialog.id(),
        DialogId::new("test-call-id", "alice-tag", "")
    );
    assert_eq!(dialog.state(), DialogState::Calling);
    assert!(!dialog.inner.is_confirmed());
    Ok(())
}

#[tokio::test]
async fn test_client_dialog_sequence_handling() -> crate::Result<()> {
    let endpoint = create_test_endpoint().await?;
    let dialog = create_dialog(&endpoint, "alice-tag", "test-call-seq");

    // local sequence starts at the INVITE CSeq and counts up
    assert_eq!(dialog.inner.increment_local_seq(), 2);
    assert_eq!(dialog.inner.increment_local_seq(), 3);

    let bye = dialog.inner.make_request(Method::Bye, None, None)?;
    assert_eq!(bye.cseq()?, (4, Method::Bye));
    Ok(())
}

#[tokio::test]
async fn test_client_dialog_state_transitions() -> crate::Result<()> {
    let endpoint = create_test_endpoint().await?;
    let dialog = create_dialog(&endpoint, "alice-tag", "test-call-flow");
    let invite = dialog.inner.initial_request.clone();

    // 100 does not form a dialog
    let trying = create_response(&invite, StatusCode::TRYING, "");
    dialog.inner.on_provisional(&trying)?;
    assert_eq!(dialog.state(), DialogState::Calling);

    // a tagged 180 opens the early dialog and records the remote target
    let ringing = create_response(&invite, StatusCode::RINGING, "bob-tag");
    dialog.inner.on_provisional(&ringing)?;
    assert_eq!(dialog.state(), DialogState::Early);
    assert_eq!(dialog.id().remote_tag, "bob-tag");
    assert!(dialog.inner.remote_target.lock().unwrap().is_some());

    // the 2xx confirms and installs the reversed route set
    let mut ok = create_response(&invite, StatusCode::OK, "bob-tag");
    ok.headers.push("Record-Route", "<sip:p2.example.com;lr>");
    ok.headers.push("Record-Route", "<sip:p1.example.com;lr>");
    dialog.inner.confirm(&ok)?;
    assert!(dialog.inner.is_confirmed());
    assert_eq!(
        *dialog.inner.route_set.lock().unwrap(),
        vec!["<sip:p1.example.com;lr>", "<sip:p2.example.com;lr>"]
    );
    Ok(())
}

#[tokio::test]
async fn test_in_dialog_request_construction() -> crate::Result<()> {
    let endpoint = create_test_endpoint().await?;
    let dialog = create_dialog(&endpoint, "alice-tag", "test-call-bye");
    let invite = dialog.inner.initial_request.clone();

    let mut ok = create_response(&invite, StatusCode::OK, "bob-tag");
    ok.headers.push("Record-Route", "<sip:p1.example.com;lr>");
    dialog.inner.confirm(&ok)?;

    let bye = dialog.inner.make_request(Method::Bye, None, None)?;
    // Request-URI is the remote target from Contact, not the original AoR
    assert_eq!(bye.uri.host_port.host, "bob.example.com");
    assert_eq!(bye.cseq()?, (2, Method::Bye));
    assert_eq!(bye.call_id()?, "test-call-bye");
    assert_eq!(bye.from_tag().as_deref(), Some("alice-tag"));
    assert_eq!(bye.to_tag().as_deref(), Some("bob-tag"));
    let routes: Vec<_> = bye.headers.get_all("Route").collect();
    assert_eq!(routes, vec!["<sip:p1.example.com;lr>"]);
    Ok(())
}

#[tokio::test]
async fn test_ack_for_2xx_uses_invite_cseq_and_fresh_branch() -> crate::Result<()> {
    let endpoint = create_test_endpoint().await?;
    let dialog = create_dialog(&endpoint, "alice-tag", "test-call-ack");
    let invite = dialog.inner.initial_request.clone();
    let invite_branch = invite.via_branch().unwrap();

    let ok = create_response(&invite, StatusCode::OK, "bob-tag");
    dialog.inner.confirm(&ok)?;

    // a later in-dialog request has already advanced the local sequence
    dialog.inner.increment_local_seq();

    let ack = dialog.inner.make_ack()?;
    assert_eq!(ack.method, Method::Ack);
    assert_eq!(ack.cseq()?, (1, Method::Ack));
    let ack_branch = via_branch(ack.top_via().unwrap()).unwrap();
    assert_ne!(ack_branch, invite_branch);
    assert!(ack_branch.starts_with("z9hG4bK"));
    assert_eq!(ack.to_tag().as_deref(), Some("bob-tag"));
    Ok(())
}

#[tokio::test]
async fn test_client_dialog_termination() -> crate::Result<()> {
    let endpoint = create_test_endpoint().await?;
    let dialog = create_dialog(&endpoint, "alice-tag", "test-call-term");

    // bye before confirmation is a caller error
    let mut observer = |_: &mut Response| Ok(());
    assert!(dialog.bye(&mut observer).await.is_err());

    let invite = dialog.inner.initial_request.clone();
    let ok = create_response(&invite, StatusCode::OK, "bob-tag");
    dialog.inner.confirm(&ok)?;
    assert!(dialog.inner.is_confirmed());

    dialog.inner.transition(DialogState::Terminated)?;
    assert_eq!(dialog.state(), DialogState::Terminated);
    Ok(())
}
