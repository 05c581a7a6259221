use crate::message::{Method, Request, SipMessage};
use crate::transaction::endpoint::{Endpoint, EndpointBuilder, EndpointOption};
use crate::transaction::key::TransactionKey;
use crate::transaction::transaction::Transaction;
use crate::transaction::{make_branch, make_tag, TimerKind};
use crate::transport::SipAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

fn fast_option() -> EndpointOption {
    EndpointOption {
        t1: Duration::from_millis(20),
        t2: Duration::from_millis(160),
        t4: Duration::from_millis(40),
        t1x64: Duration::from_millis(1280),
        timer_interval: Duration::from_millis(2),
    }
}

async fn test_endpoint() -> (Endpoint, SipAddr) {
    test_endpoint_with(fast_option()).await
}

async fn test_endpoint_with(option: EndpointOption) -> (Endpoint, SipAddr) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let endpoint = EndpointBuilder::new()
        .with_user_agent("sipua-test")
        .with_option(option)
        .build();
    let local = endpoint
        .inner
        .transport_layer
        .bind_udp("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let serve = endpoint.clone();
    tokio::spawn(async move { serve.serve().await });
    (endpoint, local)
}

fn make_request(method: Method, target: &str, local: &SipAddr) -> Request {
    let mut req = Request {
        method: method.clone(),
        uri: target.try_into().unwrap(),
        ..Default::default()
    };
    req.headers.push(
        "Via",
        format!("SIP/2.0/UDP {};rport;branch={}", local.addr, make_branch()),
    );
    req.headers.push("Max-Forwards", "70");
    req.headers
        .push("From", format!("<sip:alice@{}>;tag={}", local.addr, make_tag()));
    req.headers.push("To", format!("<{}>", target));
    req.headers
        .push("Call-ID", format!("{}@{}", make_tag(), local.addr.ip()));
    req.headers.push("CSeq", format!("1 {}", method));
    req
}

fn header_line<'a>(text: &'a str, name: &str) -> &'a str {
    text.lines()
        .find(|l| l.starts_with(name))
        .unwrap_or_else(|| panic!("missing {} in:\n{}", name, text))
}

/// Builds a stub reply echoing the request's Via, From, To, Call-ID and
/// CSeq, appending a To tag for non-provisional statuses.
fn stub_response(request_text: &str, status: u16, reason: &str, to_tag: Option<&str>) -> String {
    let via = header_line(request_text, "Via:");
    let from = header_line(request_text, "From:");
    let mut to = header_line(request_text, "To:").to_string();
    if let Some(tag) = to_tag {
        if !to.contains(";tag=") {
            to = format!("{};tag={}", to, tag);
        }
    }
    let call_id = header_line(request_text, "Call-ID:");
    let cseq = header_line(request_text, "CSeq:");
    format!(
        "SIP/2.0 {} {}\r\n{}\r\n{}\r\n{}\r\n{}\r\n{}\r\nContent-Length: 0\r\n\r\n",
        status, reason, via, from, to, call_id, cseq
    )
}

#[tokio::test]
async fn test_invite_retransmits_until_timer_b() {
    // a wider T1 keeps the last retransmission clear of Timer B under
    // scheduling jitter: sends at 50, 150, 350, 750, 1550 and 3150ms,
    // Timer B at 3200ms
    let (endpoint, local) = test_endpoint_with(EndpointOption {
        t1: Duration::from_millis(50),
        t2: Duration::from_millis(400),
        t4: Duration::from_millis(100),
        t1x64: Duration::from_millis(3200),
        timer_interval: Duration::from_millis(2),
    })
    .await;
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();
    let received = Arc::new(AtomicUsize::new(0));

    let counter = received.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        loop {
            let (n, _) = server.recv_from(&mut buf).await.unwrap();
            let text = String::from_utf8_lossy(&buf[..n]);
            assert!(text.starts_with("INVITE "));
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    let request = make_request(Method::Invite, &format!("sip:bob@{}", server_addr), &local);
    let key = TransactionKey::from_request(&request).unwrap();
    let mut tx = Transaction::new_client(key, request, endpoint.inner.clone(), None);
    tx.send().await.unwrap();

    let outcome = timeout(Duration::from_secs(10), tx.receive()).await.unwrap();
    assert!(outcome.is_none());
    assert_eq!(tx.timed_out, Some(TimerKind::B));
    assert!(tx.is_terminated());
    // the original send plus doubling retransmissions until the timeout
    assert_eq!(received.load(Ordering::SeqCst), 7);
}

#[tokio::test]
async fn test_non_invite_completes_then_terminates_after_timer_k() {
    let (endpoint, local) = test_endpoint().await;
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        let (n, peer) = server.recv_from(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf[..n]).to_string();
        let reply = stub_response(&text, 200, "OK", Some("stub-tag"));
        server.send_to(reply.as_bytes(), peer).await.unwrap();
    });

    let request = make_request(Method::Options, &format!("sip:sut@{}", server_addr), &local);
    let key = TransactionKey::from_request(&request).unwrap();
    let mut tx = Transaction::new_client(key, request, endpoint.inner.clone(), None);
    tx.send().await.unwrap();

    let first = timeout(Duration::from_secs(2), tx.receive()).await.unwrap();
    match first {
        Some(SipMessage::Response(resp)) => {
            assert_eq!(resp.status.0, 200);
            assert!(resp.original.is_some());
        }
        other => panic!("expected 200, got {:?}", other),
    }

    // Timer K moves Completed to Terminated
    let end = timeout(Duration::from_secs(2), tx.receive()).await.unwrap();
    assert!(end.is_none());
    assert!(tx.is_terminated());
    assert_eq!(tx.timed_out, None);
}

#[tokio::test]
async fn test_non_invite_retransmits_until_timer_f() {
    let (endpoint, local) = test_endpoint().await;
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();
    let received = Arc::new(AtomicUsize::new(0));

    let counter = received.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        loop {
            server.recv_from(&mut buf).await.unwrap();
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    let request = make_request(Method::Options, &format!("sip:sut@{}", server_addr), &local);
    let key = TransactionKey::from_request(&request).unwrap();
    let mut tx = Transaction::new_client(key, request, endpoint.inner.clone(), None);
    tx.send().await.unwrap();

    let outcome = timeout(Duration::from_secs(5), tx.receive()).await.unwrap();
    assert!(outcome.is_none());
    assert_eq!(tx.timed_out, Some(TimerKind::F));
    // Timer E doubles but caps at T2, so more datagrams go out than for
    // the uncapped INVITE schedule
    assert!(received.load(Ordering::SeqCst) > 7);
}

#[tokio::test]
async fn test_invite_non_2xx_final_is_acked_in_transaction() {
    let (endpoint, local) = test_endpoint().await;
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let request = make_request(Method::Invite, &format!("sip:bob@{}", server_addr), &local);
    let invite_branch = request.via_branch().unwrap();
    let key = TransactionKey::from_request(&request).unwrap();
    let mut tx = Transaction::new_client(key, request, endpoint.inner.clone(), None);
    tx.send().await.unwrap();

    let client = tokio::spawn(async move {
        let mut statuses = Vec::new();
        while let Some(SipMessage::Response(resp)) = tx.receive().await {
            statuses.push(resp.status.0);
        }
        (statuses, tx.timed_out)
    });

    let mut buf = vec![0u8; 65535];
    let (n, peer) = server.recv_from(&mut buf).await.unwrap();
    let invite_text = String::from_utf8_lossy(&buf[..n]).to_string();
    assert!(invite_text.starts_with("INVITE "));

    let trying = stub_response(&invite_text, 100, "Trying", None);
    server.send_to(trying.as_bytes(), peer).await.unwrap();
    let not_found = stub_response(&invite_text, 404, "Not Found", Some("t404"));
    server.send_to(not_found.as_bytes(), peer).await.unwrap();

    // the transaction acknowledges the 404 itself
    let (n, _) = server.recv_from(&mut buf).await.unwrap();
    let ack_text = String::from_utf8_lossy(&buf[..n]).to_string();
    assert!(ack_text.starts_with("ACK "), "expected ACK, got:\n{}", ack_text);
    assert!(ack_text.contains(&format!("branch={}", invite_branch)));
    assert!(header_line(&ack_text, "CSeq:").contains("1 ACK"));
    assert!(header_line(&ack_text, "To:").contains("tag=t404"));

    // a retransmitted final is absorbed and re-acknowledged
    server.send_to(not_found.as_bytes(), peer).await.unwrap();
    let (n, _) = timeout(Duration::from_secs(2), server.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("ACK "));

    let (statuses, timed_out) = client.await.unwrap();
    assert_eq!(statuses, vec![100, 404]);
    assert_eq!(timed_out, None);
}
