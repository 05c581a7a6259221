use crate::auth::{compute_digest, Credential, DigestAlgorithm, DigestChallenge, Qop};
use crate::client::{Client, ClientBuilder, HookDecision, Hooks};
use crate::dialog::registration::RefreshConfig;
use crate::message::Method;
use crate::transaction::endpoint::EndpointOption;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

fn fast_option() -> EndpointOption {
    EndpointOption {
        t1: Duration::from_millis(20),
        t2: Duration::from_millis(160),
        t4: Duration::from_millis(40),
        t1x64: Duration::from_millis(1280),
        timer_interval: Duration::from_millis(2),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn fast_client(credential: Option<Credential>) -> Client {
    init_tracing();
    let mut builder = ClientBuilder::new()
        .with_user_agent("sipua-test")
        .with_local_addr("127.0.0.1:0".parse().unwrap())
        .with_option(fast_option());
    if let Some(credential) = credential {
        builder = builder.with_credential(credential);
    }
    builder.build().await.unwrap()
}

fn header_line<'a>(text: &'a str, name: &str) -> &'a str {
    text.lines()
        .find(|l| l.starts_with(name))
        .unwrap_or_else(|| panic!("missing {} in:\n{}", name, text))
}

fn branch_of(text: &str) -> String {
    let via = header_line(text, "Via:");
    crate::message::via_branch(via).unwrap_or_else(|| panic!("no branch in {}", via))
}

fn cseq_of(text: &str) -> (u32, String) {
    let line = header_line(text, "CSeq:");
    let mut parts = line.trim_start_matches("CSeq:").trim().split_whitespace();
    let seq = parts.next().unwrap().parse().unwrap();
    let method = parts.next().unwrap().to_string();
    (seq, method)
}

fn auth_param(auth: &str, name: &str) -> Option<String> {
    let start = auth.find(&format!("{}=", name))? + name.len() + 1;
    let rest = &auth[start..];
    if let Some(stripped) = rest.strip_prefix('"') {
        return Some(stripped[..stripped.find('"')?].to_string());
    }
    let end = rest.find(',').unwrap_or(rest.len());
    Some(rest[..end].trim().to_string())
}

/// Builds a stub reply echoing the request's dialog-relevant headers.
fn stub_response(
    request_text: &str,
    server_addr: SocketAddr,
    status: u16,
    reason: &str,
    to_tag: Option<&str>,
    extra_headers: &[(&str, &str)],
    body: &str,
) -> String {
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
    let mut out = format!(
        "SIP/2.0 {} {}\r\n{}\r\n{}\r\n{}\r\n{}\r\n{}\r\nContact: <sip:stub@{}>\r\n",
        status, reason, via, from, to, call_id, cseq, server_addr
    );
    for (name, value) in extra_headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
    out
}

async fn recv_text(socket: &UdpSocket, buf: &mut [u8]) -> (String, SocketAddr) {
    let (n, peer) = timeout(Duration::from_secs(5), socket.recv_from(buf))
        .await
        .expect("stub server timed out")
        .unwrap();
    (String::from_utf8_lossy(&buf[..n]).to_string(), peer)
}

// Registration with one digest challenge: the second REGISTER carries a
// verifiable Authorization and wins a 200.
#[tokio::test]
async fn test_register_with_digest_challenge() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();
    let credential = Credential::new("1111", "1111xxx");
    let client = fast_client(Some(credential.clone())).await;

    let stub = tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        let (first, peer) = recv_text(&server, &mut buf).await;
        assert!(first.starts_with("REGISTER "));
        assert!(!first.contains("Authorization:"));
        let challenge = stub_response(
            &first,
            server_addr,
            401,
            "Unauthorized",
            Some("reg401"),
            &[(
                "WWW-Authenticate",
                "Digest realm=\"asterisk\", nonce=\"NONCE1\", algorithm=MD5, qop=\"auth\"",
            )],
            "",
        );
        server.send_to(challenge.as_bytes(), peer).await.unwrap();

        let (second, peer) = recv_text(&server, &mut buf).await;
        assert!(second.starts_with("REGISTER "));
        let ok = stub_response(
            &second,
            server_addr,
            200,
            "OK",
            Some("reg401"),
            &[("Expires", "3599")],
            "",
        );
        server.send_to(ok.as_bytes(), peer).await.unwrap();
        (first, second)
    });

    let aor = format!("sip:1111@{}", server_addr);
    let resp = client.register(&aor, None, None).await.unwrap();
    assert_eq!(resp.status.0, 200);
    assert_eq!(resp.expires_granted(), Some(3599));

    let (first, second) = stub.await.unwrap();
    // the retry is a new transaction with an advanced CSeq
    assert_ne!(branch_of(&first), branch_of(&second));
    assert_eq!(cseq_of(&first).0 + 1, cseq_of(&second).0);

    // verify the digest response against an independent computation
    let auth = header_line(&second, "Authorization:");
    assert_eq!(auth_param(auth, "nc").as_deref(), Some("00000001"));
    assert_eq!(auth_param(auth, "nonce").as_deref(), Some("NONCE1"));
    let cnonce = auth_param(auth, "cnonce").unwrap();
    let uri = auth_param(auth, "uri").unwrap();
    let challenge = DigestChallenge {
        realm: "asterisk".to_string(),
        nonce: "NONCE1".to_string(),
        algorithm: DigestAlgorithm::Md5,
        qop: vec![Qop::Auth],
        opaque: None,
        stale: false,
        domain: None,
    };
    let expected = compute_digest(&credential, &challenge, &Method::Register, &uri, None, 1, &cnonce);
    assert_eq!(
        auth_param(auth, "response"),
        auth_param(&expected, "response")
    );
    client.close().await;
}

// A renewed challenge after the single retry comes back to the caller
// unmodified, and no third attempt goes out.
#[tokio::test]
async fn test_auth_loop_guard() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();
    let client = fast_client(Some(Credential::new("1111", "wrongpass"))).await;
    let registers = Arc::new(AtomicUsize::new(0));

    let count = registers.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        let mut nonce = 1;
        loop {
            let (text, peer) = recv_text(&server, &mut buf).await;
            if !text.starts_with("REGISTER ") {
                continue;
            }
            count.fetch_add(1, Ordering::SeqCst);
            let www = format!(
                "Digest realm=\"asterisk\", nonce=\"FRESH{}\", algorithm=MD5, qop=\"auth\"",
                nonce
            );
            nonce += 1;
            let challenge = stub_response(
                &text,
                server_addr,
                401,
                "Unauthorized",
                Some("guard"),
                &[("WWW-Authenticate", &www)],
                "",
            );
            server.send_to(challenge.as_bytes(), peer).await.unwrap();
        }
    });

    let aor = format!("sip:1111@{}", server_addr);
    let resp = client.register(&aor, None, None).await.unwrap();
    // the second 401 surfaces as a response, not an error
    assert_eq!(resp.status.0, 401);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(registers.load(Ordering::SeqCst), 2);
    client.close().await;
}

// INVITE answered 100 then 404: the final response comes back and the
// transaction acknowledges it with the INVITE's branch and CSeq.
#[tokio::test]
async fn test_invite_rejected_is_acked() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();
    let client = fast_client(None).await;

    let stub = tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        let (invite, peer) = recv_text(&server, &mut buf).await;
        assert!(invite.starts_with("INVITE "));
        let trying = stub_response(&invite, server_addr, 100, "Trying", None, &[], "");
        server.send_to(trying.as_bytes(), peer).await.unwrap();
        let not_found =
            stub_response(&invite, server_addr, 404, "Not Found", Some("nf404"), &[], "");
        server.send_to(not_found.as_bytes(), peer).await.unwrap();
        let (ack, _) = recv_text(&server, &mut buf).await;
        (invite, ack)
    });

    let resp = client
        .invite(&format!("sip:bob@{}", server_addr), None, None, None)
        .await
        .unwrap();
    assert_eq!(resp.status.0, 404);

    let (invite, ack) = stub.await.unwrap();
    assert!(ack.starts_with("ACK "));
    assert_eq!(branch_of(&invite), branch_of(&ack));
    assert_eq!(cseq_of(&invite).0, cseq_of(&ack).0);
    assert!(header_line(&ack, "To:").contains("tag=nf404"));
    // the rejected call leaves no dialog behind
    assert!(client.dialog_layer.is_empty());
    client.close().await;
}

// Full call: 180 opens the early dialog, 200 confirms it, ACK goes out
// with a fresh branch and the INVITE's CSeq, BYE advances the CSeq.
#[tokio::test]
async fn test_call_setup_ack_and_bye() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();
    let client = Arc::new(fast_client(None).await);

    let sdp_answer = "v=0\r\no=stub 1 1 IN IP4 127.0.0.1\r\ns=-\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\nm=audio 4000 RTP/AVP 0\r\n";
    let stub = tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        let (invite, peer) = recv_text(&server, &mut buf).await;
        assert!(invite.starts_with("INVITE "));
        let ringing = stub_response(&invite, server_addr, 180, "Ringing", Some("t1"), &[], "");
        server.send_to(ringing.as_bytes(), peer).await.unwrap();
        let ok = stub_response(
            &invite,
            server_addr,
            200,
            "OK",
            Some("t1"),
            &[("Content-Type", "application/sdp")],
            sdp_answer,
        );
        server.send_to(ok.as_bytes(), peer).await.unwrap();

        let (ack, _) = recv_text(&server, &mut buf).await;
        assert!(ack.starts_with("ACK "));

        // a retransmitted 200 must be re-acknowledged
        server.send_to(ok.as_bytes(), peer).await.unwrap();
        let (ack2, _) = recv_text(&server, &mut buf).await;
        assert!(ack2.starts_with("ACK "));

        let (bye, peer) = recv_text(&server, &mut buf).await;
        assert!(bye.starts_with("BYE "));
        let bye_ok = stub_response(&bye, server_addr, 200, "OK", None, &[], "");
        server.send_to(bye_ok.as_bytes(), peer).await.unwrap();
        (invite, ack, bye)
    });

    let resp = client
        .invite(&format!("sip:bob@{}", server_addr), None, None, None)
        .await
        .unwrap();
    assert_eq!(resp.status.0, 200);
    assert_eq!(resp.to_tag().as_deref(), Some("t1"));
    assert_eq!(client.dialog_layer.len(), 1);

    // the SDP answer is usable
    let sdp = crate::sdp::SdpSession::parse(&resp.body).unwrap();
    assert!(!sdp.media_rejected());

    client.ack(&resp).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    let bye_resp = client.bye_by_response(&resp).await.unwrap();
    assert_eq!(bye_resp.status.0, 200);
    assert!(client.dialog_layer.is_empty());

    let (invite, ack, bye) = stub.await.unwrap();
    let invite_cseq = cseq_of(&invite).0;
    // dialog-scope ACK: fresh branch, INVITE CSeq number
    assert_ne!(branch_of(&invite), branch_of(&ack));
    assert_eq!(cseq_of(&ack), (invite_cseq, "ACK".to_string()));
    // BYE: fresh branch, next CSeq
    assert_ne!(branch_of(&invite), branch_of(&bye));
    assert_eq!(cseq_of(&bye), (invite_cseq + 1, "BYE".to_string()));
    client.close().await;
}

// CANCEL after a 100: its own transaction with the INVITE's branch and
// CSeq number, the INVITE ends in 487 which is acknowledged.
#[tokio::test]
async fn test_cancel_pending_invite() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();
    let client = Arc::new(fast_client(None).await);

    let stub = tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        let (invite, peer) = recv_text(&server, &mut buf).await;
        assert!(invite.starts_with("INVITE "));
        let trying = stub_response(&invite, server_addr, 100, "Trying", None, &[], "");
        server.send_to(trying.as_bytes(), peer).await.unwrap();

        let (cancel, peer) = recv_text(&server, &mut buf).await;
        assert!(cancel.starts_with("CANCEL "));
        let cancel_ok = stub_response(&cancel, server_addr, 200, "OK", None, &[], "");
        server.send_to(cancel_ok.as_bytes(), peer).await.unwrap();
        let terminated = stub_response(
            &invite,
            server_addr,
            487,
            "Request Terminated",
            Some("c487"),
            &[],
            "",
        );
        server.send_to(terminated.as_bytes(), peer).await.unwrap();

        let (ack, _) = recv_text(&server, &mut buf).await;
        (invite, cancel, ack)
    });

    let caller = client.clone();
    let target = format!("sip:bob@{}", server_addr);
    let invite_task =
        tokio::spawn(async move { caller.invite(&target, None, None, None).await });

    // wait for the 100 to make the INVITE cancellable
    let mut keys = Vec::new();
    for _ in 0..200 {
        keys = client.pending_invites();
        if !keys.is_empty() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(keys.len(), 1);

    let cancel_resp = loop {
        match client.cancel(&keys[0]).await {
            Ok(resp) => break resp,
            Err(crate::Error::BadArgument(_)) => sleep(Duration::from_millis(10)).await,
            Err(e) => panic!("cancel failed: {}", e),
        }
    };
    assert_eq!(cancel_resp.status.0, 200);

    let invite_resp = invite_task.await.unwrap().unwrap();
    assert_eq!(invite_resp.status.0, 487);

    let (invite, cancel, ack) = stub.await.unwrap();
    assert_eq!(branch_of(&invite), branch_of(&cancel));
    assert_eq!(cseq_of(&cancel), (cseq_of(&invite).0, "CANCEL".to_string()));
    assert!(ack.starts_with("ACK "));
    assert_eq!(branch_of(&invite), branch_of(&ack));
    client.close().await;
}

// Auto-refresh: an immediate REGISTER on enable, then re-REGISTERs at
// max(expires - guard, floor) until disabled.
#[tokio::test]
async fn test_auto_refresh_cadence() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();
    let client = ClientBuilder::new()
        .with_local_addr("127.0.0.1:0".parse().unwrap())
        .with_option(fast_option())
        .with_refresh_config(RefreshConfig {
            guard: Duration::from_millis(900),
            floor: Duration::from_millis(100),
        })
        .build()
        .await
        .unwrap();

    let registers = Arc::new(AtomicUsize::new(0));
    let count = registers.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        loop {
            let (text, peer) = recv_text(&server, &mut buf).await;
            if !text.starts_with("REGISTER ") {
                continue;
            }
            count.fetch_add(1, Ordering::SeqCst);
            // grants one second, so the refresher waits the 100ms floor
            let ok = stub_response(&text, server_addr, 200, "OK", None, &[("Expires", "1")], "");
            server.send_to(ok.as_bytes(), peer).await.unwrap();
        }
    });

    let aor = format!("sip:1111@{}", server_addr);
    client.enable_auto_refresh(&aor, None).unwrap();
    sleep(Duration::from_millis(650)).await;
    let while_enabled = registers.load(Ordering::SeqCst);
    assert!(
        while_enabled >= 3,
        "expected several refreshes, saw {}",
        while_enabled
    );

    client.disable_auto_refresh();
    sleep(Duration::from_millis(400)).await;
    let after_disable = registers.load(Ordering::SeqCst);
    assert!(
        after_disable <= while_enabled + 1,
        "refresher kept firing after disable"
    );
    client.close().await;
}

// First 2xx wins: a later 2xx with a different To tag is acknowledged
// and immediately released with BYE.
#[tokio::test]
async fn test_forked_second_answer_gets_ack_and_bye() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();
    let client = Arc::new(fast_client(None).await);

    let stub = tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        let (invite, peer) = recv_text(&server, &mut buf).await;
        let ok_a = stub_response(&invite, server_addr, 200, "OK", Some("forkA"), &[], "");
        server.send_to(ok_a.as_bytes(), peer).await.unwrap();
        let (ack_a, _) = recv_text(&server, &mut buf).await;
        assert!(ack_a.starts_with("ACK "));
        assert!(header_line(&ack_a, "To:").contains("tag=forkA"));

        // the losing fork answers late
        let ok_b = stub_response(&invite, server_addr, 200, "OK", Some("forkB"), &[], "");
        server.send_to(ok_b.as_bytes(), peer).await.unwrap();

        let (ack_b, _) = recv_text(&server, &mut buf).await;
        assert!(ack_b.starts_with("ACK "), "expected ACK, got:\n{}", ack_b);
        assert!(header_line(&ack_b, "To:").contains("tag=forkB"));
        let (bye_b, peer) = recv_text(&server, &mut buf).await;
        assert!(bye_b.starts_with("BYE "), "expected BYE, got:\n{}", bye_b);
        assert!(header_line(&bye_b, "To:").contains("tag=forkB"));
        let bye_ok = stub_response(&bye_b, server_addr, 200, "OK", None, &[], "");
        server.send_to(bye_ok.as_bytes(), peer).await.unwrap();
    });

    let resp = client
        .invite(&format!("sip:bob@{}", server_addr), None, None, None)
        .await
        .unwrap();
    assert_eq!(resp.status.0, 200);
    assert_eq!(resp.to_tag().as_deref(), Some("forkA"));
    client.ack(&resp).await.unwrap();

    stub.await.unwrap();
    // the winning dialog is untouched
    assert_eq!(client.dialog_layer.len(), 1);
    client.close().await;
}

// OPTIONS and MESSAGE run as plain non-INVITE transactions.
#[tokio::test]
async fn test_options_and_message() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();
    let client = fast_client(None).await;

    let stub = tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        let (options, peer) = recv_text(&server, &mut buf).await;
        assert!(options.starts_with("OPTIONS "));
        let ok = stub_response(
            &options,
            server_addr,
            200,
            "OK",
            Some("opt"),
            &[("Allow", "INVITE, ACK, BYE, CANCEL, OPTIONS")],
            "",
        );
        server.send_to(ok.as_bytes(), peer).await.unwrap();

        let (message, peer) = recv_text(&server, &mut buf).await;
        assert!(message.starts_with("MESSAGE "));
        assert!(header_line(&message, "Content-Type:").contains("text/plain"));
        assert!(message.ends_with("hello there"));
        let accepted = stub_response(&message, server_addr, 202, "Accepted", Some("msg"), &[], "");
        server.send_to(accepted.as_bytes(), peer).await.unwrap();
        message
    });

    let target = format!("sip:robot@{}", server_addr);
    let options_resp = client.options(&target).await.unwrap();
    assert_eq!(options_resp.status.0, 200);

    let message_resp = client.message(&target, "hello there", None).await.unwrap();
    assert_eq!(message_resp.status.0, 202);

    let message = stub.await.unwrap();
    let (_, method) = cseq_of(&message);
    assert_eq!(method, "MESSAGE");
    client.close().await;
}

// retry_with_auth resubmits exactly once using the response back-pointer.
#[tokio::test]
async fn test_retry_with_auth_uses_original_request() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();
    // no client-level credential: the application supplies one per call
    let client = fast_client(None).await;

    let stub = tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        let (first, peer) = recv_text(&server, &mut buf).await;
        assert!(first.starts_with("MESSAGE "));
        let challenge = stub_response(
            &first,
            server_addr,
            401,
            "Unauthorized",
            Some("rwa"),
            &[(
                "WWW-Authenticate",
                "Digest realm=\"asterisk\", nonce=\"RWA1\", algorithm=MD5, qop=\"auth\"",
            )],
            "",
        );
        server.send_to(challenge.as_bytes(), peer).await.unwrap();

        let (second, peer) = recv_text(&server, &mut buf).await;
        assert!(second.contains("Authorization: Digest"));
        let ok = stub_response(&second, server_addr, 200, "OK", Some("rwa"), &[], "");
        server.send_to(ok.as_bytes(), peer).await.unwrap();
        (first, second)
    });

    let target = format!("sip:robot@{}", server_addr);
    let challenged = client.message(&target, "knock", None).await.unwrap();
    assert_eq!(challenged.status.0, 401);
    assert!(challenged.original.is_some());

    let retried = client
        .retry_with_auth(&challenged, Some(Credential::new("1111", "1111xxx")))
        .await
        .unwrap();
    assert_eq!(retried.status.0, 200);

    let (first, second) = stub.await.unwrap();
    assert_eq!(cseq_of(&first).0 + 1, cseq_of(&second).0);
    assert!(second.ends_with("knock"));
    client.close().await;
}

// Hook pipeline: on_request may cancel, class hooks observe responses,
// hook errors surface as HookFailure.
#[tokio::test]
async fn test_hooks_pipeline() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let successes = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(AtomicUsize::new(0));
    let mut hooks = Hooks::default();
    let success_count = successes.clone();
    hooks.on_success = Some(Box::new(move |_, _| {
        success_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));
    let request_count = requests.clone();
    hooks.on_request = Some(Box::new(move |req, _| {
        request_count.fetch_add(1, Ordering::SeqCst);
        if req.headers.get("Subject").is_some() {
            return Ok(HookDecision::Drop);
        }
        req.headers.unique_push("X-Hooked", "yes");
        Ok(HookDecision::Forward)
    }));

    let client = ClientBuilder::new()
        .with_local_addr("127.0.0.1:0".parse().unwrap())
        .with_option(fast_option())
        .with_hooks(hooks)
        .build()
        .await
        .unwrap();

    let stub = tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        let (options, peer) = recv_text(&server, &mut buf).await;
        assert!(header_line(&options, "X-Hooked:").contains("yes"));
        let ok = stub_response(&options, server_addr, 200, "OK", Some("hk"), &[], "");
        server.send_to(ok.as_bytes(), peer).await.unwrap();
    });

    let target = format!("sip:robot@{}", server_addr);
    let resp = client.options(&target).await.unwrap();
    assert_eq!(resp.status.0, 200);
    assert_eq!(successes.load(Ordering::SeqCst), 1);
    stub.await.unwrap();

    // a Drop decision cancels the send before any transaction exists
    let cancelled = client
        .invite(
            &target,
            None,
            None,
            Some(vec![("Subject".to_string(), "drop me".to_string())]),
        )
        .await;
    match cancelled {
        Err(crate::Error::HookFailure(hook, _)) => assert_eq!(hook, "on_request"),
        other => panic!("expected HookFailure, got {:?}", other.map(|r| r.status)),
    }
    client.close().await;
}

// close() is idempotent and leaves the facade unusable but safe.
#[tokio::test]
async fn test_close_is_idempotent() {
    let client = fast_client(None).await;
    client.close().await;
    client.close().await;
    let err = client.register("sip:a@127.0.0.1:5060", None, None).await;
    assert!(err.is_err());
}
