//! End-to-end coverage for the six concrete scenarios named in the
//! design notes: one `#[case]` per scenario, driven through the public
//! `HttpEngine` entry points over `tokio::io::duplex` pairs rather than
//! real sockets, the same shape as `http::mod`'s in-crate unit test.

use std::collections::BTreeMap;
use std::time::Duration;

use mimic_gateway::config::{BypassRule, CompiledBypassRule};
use mimic_gateway::http::HttpEngine;
use mimic_gateway::mock::{CaptureSink, MatchOutcome, Mock, MockId, MockKind, MockStore, RequestPayload, ResponsePayload};
use mimic_task::{ShutdownHandle, Task as _};
use rstest::rstest;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn compiled(rules: &[BypassRule]) -> Vec<CompiledBypassRule> {
    rules.iter().map(CompiledBypassRule::compile).collect::<anyhow::Result<Vec<_>>>().expect("valid bypass rules")
}

/// Scenario 1: a simple `GET /ping` in record mode is relayed verbatim
/// and produces exactly one captured mock.
#[tokio::test]
async fn record_simple_get_produces_one_mock() {
    let (client_side, test_client) = tokio::io::duplex(4096);
    let (server_side, mut test_server) = tokio::io::duplex(4096);
    let (mut test_client_read, mut test_client_write) = tokio::io::split(test_client);

    test_client_write.write_all(b"GET /ping HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
    // Closing the write half lets the engine's next read-loop iteration
    // see EOF instead of blocking forever on a still-open peer.
    drop(test_client_write);
    test_server.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\npong").await.unwrap();
    drop(test_server);

    let (sender, mut receiver) = mock_sink::sink_channel();
    let capture = CaptureSink::new(sender, Vec::new());
    let engine = HttpEngine::new(Vec::new(), Duration::from_millis(200));

    engine.run_record(client_side, server_side, 80, &capture, || 0).await.expect("record run succeeds");

    let mut read_back = Vec::new();
    test_client_read.read_to_end(&mut read_back).await.unwrap();
    assert!(read_back.starts_with(b"HTTP/1.1 200 OK"));

    let captured = receiver.try_recv().expect("one mock emitted");
    assert_eq!(captured.request.status_or_method, "GET");
    assert_eq!(captured.response.body, b"pong");
    assert!(receiver.try_recv().is_err(), "no second mock emitted");
}

/// Scenario 2: a chunked response is reassembled before capture, so the
/// mock stream sees the decoded body rather than the wire chunks, while
/// the client still receives the server's response bytes verbatim (a
/// real client would fail to parse a de-chunked body under a
/// `Transfer-Encoding: chunked` header that was left in place).
#[tokio::test]
async fn record_chunked_response_is_reassembled_before_capture() {
    let (client_side, test_client) = tokio::io::duplex(4096);
    let (server_side, mut test_server) = tokio::io::duplex(4096);
    let (mut test_client_read, mut test_client_write) = tokio::io::split(test_client);

    let server_bytes: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nabcd\r\n3\r\nefg\r\n0\r\n\r\n";

    test_client_write.write_all(b"GET /stream HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
    drop(test_client_write);
    test_server.write_all(server_bytes).await.unwrap();
    drop(test_server);

    let (sender, mut receiver) = mock_sink::sink_channel();
    let capture = CaptureSink::new(sender, Vec::new());
    let engine = HttpEngine::new(Vec::new(), Duration::from_millis(200));

    engine.run_record(client_side, server_side, 80, &capture, || 0).await.expect("record run succeeds");

    let mut relayed = Vec::new();
    test_client_read.read_to_end(&mut relayed).await.unwrap();
    assert_eq!(relayed, server_bytes, "the client must see the origin's response bytes verbatim, chunked framing included");

    let captured = receiver.try_recv().expect("one mock emitted");
    assert_eq!(captured.response.body, b"abcdefg");
}

/// Scenario 3: in mock mode, a request carrying `Expect: 100-continue`
/// gets an immediate interim response before the body is read, and the
/// request still matches once the body arrives.
#[tokio::test]
async fn mock_expect_continue_request_still_matches() {
    let (store, handle) = MockStore::new();
    let (shutdown, signal) = ShutdownHandle::new();
    let store_task = tokio::spawn(store.run(signal));

    let request = RequestPayload {
        method: "POST".to_owned(),
        url: "/upload".to_owned(),
        headers: BTreeMap::new(),
        query: BTreeMap::new(),
        body: b"payload".to_vec(),
    };
    let response = ResponsePayload {
        status: 201,
        headers: BTreeMap::new(),
        body: b"stored".to_vec(),
        gzip: false,
    };
    handle.replace_filtered(vec![Mock::new(MockId(1), MockKind::Http, request, response, 0)]).await;

    let (client_side, mut test_client) = tokio::io::duplex(4096);
    let engine = HttpEngine::new(Vec::new(), Duration::from_millis(200));

    let run = tokio::spawn(async move {
        engine
            .run_mock::<_, _, tokio::io::DuplexStream, _>(client_side, 80, &handle, || async { None })
            .await
    });

    test_client
        .write_all(b"POST /upload HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\nContent-Length: 7\r\n\r\n")
        .await
        .unwrap();

    let mut interim = [0u8; 25];
    test_client.read_exact(&mut interim).await.unwrap();
    assert_eq!(&interim, b"HTTP/1.1 100 Continue\r\n\r\n");

    test_client.write_all(b"payload").await.unwrap();

    let mut status_line = [0u8; 13];
    test_client.read_exact(&mut status_line).await.unwrap();
    assert_eq!(&status_line, b"HTTP/1.1 201 ");

    drop(test_client);
    let _ = run.await;
    shutdown.signal();
    let _ = store_task.await;
}

/// Scenario 4: two mocks share a schema, but only one's JSON body is a
/// key-subset of the incoming request; the subset relation breaks the
/// tie deterministically (covered at the matcher layer too, this
/// exercises it through `run_mock`).
#[tokio::test]
async fn mock_json_subset_breaks_schema_tie() {
    let (store, handle) = MockStore::new();
    let (shutdown, signal) = ShutdownHandle::new();
    let store_task = tokio::spawn(store.run(signal));

    let mut headers = BTreeMap::new();
    headers.insert("Content-Type".to_owned(), "application/json".to_owned());

    let narrow = Mock::new(
        MockId(1),
        MockKind::Http,
        RequestPayload {
            method: "POST".to_owned(),
            url: "/orders".to_owned(),
            headers: headers.clone(),
            query: BTreeMap::new(),
            body: br#"{"id":1}"#.to_vec(),
        },
        ResponsePayload {
            status: 200,
            headers: BTreeMap::new(),
            body: b"narrow".to_vec(),
            gzip: false,
        },
        0,
    );
    let wide = Mock::new(
        MockId(2),
        MockKind::Http,
        RequestPayload {
            method: "POST".to_owned(),
            url: "/orders".to_owned(),
            headers: headers.clone(),
            query: BTreeMap::new(),
            body: br#"{"id":1,"qty":2}"#.to_vec(),
        },
        ResponsePayload {
            status: 200,
            headers: BTreeMap::new(),
            body: b"wide".to_vec(),
            gzip: false,
        },
        1,
    );
    handle.replace_filtered(vec![narrow, wide]).await;

    let request = RequestPayload {
        method: "POST".to_owned(),
        url: "/orders".to_owned(),
        headers,
        query: BTreeMap::new(),
        body: br#"{"id":1,"qty":2}"#.to_vec(),
    };

    let outcome = mimic_gateway::mock::match_request(&handle, MockKind::Http, &request).await;
    match outcome {
        MatchOutcome::Matched(mock) => assert_eq!(mock.id, MockId(2)),
        MatchOutcome::NoMatch => panic!("expected the wider mock to match"),
    }

    shutdown.signal();
    let _ = store_task.await;
}

/// Scenario 5: a bypass rule short-circuits the HTTP engine entirely,
/// relaying the request unmodified so nothing reaches the matcher or
/// the capture sink.
#[rstest]
#[case::record(true)]
#[case::mock(false)]
#[tokio::test]
async fn bypass_rule_short_circuits_the_engine(#[case] record_mode: bool) {
    let rules = compiled(&[BypassRule {
        host: Some("bypassed\\.example".to_owned()),
        path: None,
        port: 0,
    }]);

    let (client_side, mut test_client) = tokio::io::duplex(4096);
    let engine = HttpEngine::new(rules, Duration::from_millis(200));

    test_client
        .write_all(b"GET /secret HTTP/1.1\r\nHost: bypassed.example\r\n\r\n")
        .await
        .unwrap();
    // Neither branch reads a response back through `test_client`, so
    // closing it now lets the relay's client-side direction reach EOF.
    drop(test_client);

    if record_mode {
        let (server_side, mut test_server) = tokio::io::duplex(4096);
        test_server.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
        drop(test_server);

        let (sender, mut receiver) = mock_sink::sink_channel();
        let capture = CaptureSink::new(sender, Vec::new());

        engine.run_record(client_side, server_side, 0, &capture, || 0).await.expect("bypassed relay succeeds");
        assert!(receiver.try_recv().is_err(), "a bypassed request must never be captured");
    } else {
        let (store, handle) = MockStore::new();
        let (shutdown, signal) = ShutdownHandle::new();
        let store_task = tokio::spawn(store.run(signal));

        let (server_side, mut test_server) = tokio::io::duplex(4096);
        test_server.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
        drop(test_server);

        let server_side = std::cell::RefCell::new(Some(server_side));
        engine
            .run_mock(client_side, 0, &handle, || {
                let server_side = server_side.borrow_mut().take();
                async move { server_side }
            })
            .await
            .expect("bypassed relay succeeds");

        assert!(handle.all_filtered().await.is_empty(), "bypass never touches the store");
        shutdown.signal();
        let _ = store_task.await;
    }
}

/// Scenario 6: when two concurrent matches target the same filtered
/// mock, exactly one promote wins and the loser falls through to the
/// next viable candidate (or `NoMatch` if none remains) rather than
/// returning the already-claimed mock.
#[tokio::test]
async fn concurrent_matches_only_one_promote_wins() {
    let (store, handle) = MockStore::new();
    let (shutdown, signal) = ShutdownHandle::new();
    let store_task = tokio::spawn(store.run(signal));

    let request = RequestPayload {
        method: "GET".to_owned(),
        url: "/once".to_owned(),
        headers: BTreeMap::new(),
        query: BTreeMap::new(),
        body: Vec::new(),
    };
    let response = ResponsePayload {
        status: 200,
        headers: BTreeMap::new(),
        body: b"single-use".to_vec(),
        gzip: false,
    };
    handle
        .replace_filtered(vec![Mock::new(MockId(1), MockKind::Http, request.clone(), response, 0)])
        .await;

    let handle_a = handle.clone();
    let request_a = request.clone();
    let handle_b = handle.clone();
    let request_b = request.clone();

    let (outcome_a, outcome_b) = tokio::join!(
        mimic_gateway::mock::match_request(&handle_a, MockKind::Http, &request_a),
        mimic_gateway::mock::match_request(&handle_b, MockKind::Http, &request_b),
    );

    let matched_count = [&outcome_a, &outcome_b]
        .into_iter()
        .filter(|outcome| matches!(outcome, MatchOutcome::Matched(_)))
        .count();
    assert_eq!(matched_count, 1, "exactly one of the two racing callers claims the only mock");

    let no_match_count = [&outcome_a, &outcome_b].into_iter().filter(|outcome| matches!(outcome, MatchOutcome::NoMatch)).count();
    assert_eq!(no_match_count, 1, "the loser sees no match, never the mock the winner already claimed");

    shutdown.signal();
    let _ = store_task.await;
}
