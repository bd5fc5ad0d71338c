//! Integration tests for the nsqd HTTP surface: the admin client and the
//! HTTP-backed transport, against in-process fake daemons.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use nsq_dispatch::{ClientError, ConnectionEvent, HttpTransport, Nsqd, ProducerBuilder, Transport};
use tokio::net::TcpListener;

/// One request captured by the fake daemon.
#[derive(Debug, Clone)]
struct CapturedRequest {
    path: String,
    params: HashMap<String, String>,
    body: Vec<u8>,
}

type Captured = Arc<Mutex<Vec<CapturedRequest>>>;

async fn capture(
    path: &str,
    state: Captured,
    params: HashMap<String, String>,
    body: Bytes,
) -> StatusCode {
    state.lock().unwrap().push(CapturedRequest {
        path: path.to_string(),
        params,
        body: body.to_vec(),
    });
    StatusCode::OK
}

/// Boot a fake nsqd that acknowledges every admin endpoint and records what
/// it was asked. Returns its `host:port` and the capture log.
async fn start_fake_nsqd() -> (String, Captured) {
    let captured: Captured = Arc::new(Mutex::new(Vec::new()));

    macro_rules! endpoint {
        ($path:literal) => {
            post(
                |State(state): State<Captured>,
                 Query(params): Query<HashMap<String, String>>,
                 body: Bytes| async move { capture($path, state, params, body).await },
            )
        };
    }

    let app = Router::new()
        .route("/ping", get(|| async { "OK" }))
        .route("/pub", endpoint!("/pub"))
        .route("/topic/create", endpoint!("/topic/create"))
        .route("/topic/delete", endpoint!("/topic/delete"))
        .route("/topic/empty", endpoint!("/topic/empty"))
        .route("/channel/create", endpoint!("/channel/create"))
        .route("/channel/delete", endpoint!("/channel/delete"))
        .route("/channel/empty", endpoint!("/channel/empty"))
        .with_state(Arc::clone(&captured));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("127.0.0.1:{}", addr.port()), captured)
}

/// Boot a fake nsqd whose `/pub` always fails. Returns `host:port`.
async fn start_failing_nsqd() -> String {
    let app = Router::new()
        .route("/ping", get(|| async { "OK" }))
        .route("/pub", post(|| async { StatusCode::INTERNAL_SERVER_ERROR }));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("127.0.0.1:{}", addr.port())
}

async fn dead_address() -> (String, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    ("127.0.0.1".to_string(), port)
}

#[tokio::test]
async fn publish_and_deferred_publish_hit_pub_with_the_right_params() {
    let (address, captured) = start_fake_nsqd().await;
    let nsqd = Nsqd::new(&address);

    nsqd.ping().await.unwrap();
    nsqd.publish("orders", Bytes::from_static(b"hello")).await.unwrap();
    nsqd.defer_publish("orders", Bytes::from_static(b"later"), 1500)
        .await
        .unwrap();

    let captured = captured.lock().unwrap();
    assert_eq!(captured.len(), 2);

    assert_eq!(captured[0].path, "/pub");
    assert_eq!(captured[0].params.get("topic").map(String::as_str), Some("orders"));
    assert_eq!(captured[0].params.get("defer"), None);
    assert_eq!(captured[0].body, b"hello");

    assert_eq!(captured[1].params.get("defer").map(String::as_str), Some("1500"));
    assert_eq!(captured[1].body, b"later");
}

#[tokio::test]
async fn topic_and_channel_administration_round_trip() {
    let (address, captured) = start_fake_nsqd().await;
    let nsqd = Nsqd::new(&address);

    nsqd.create_topic("orders").await.unwrap();
    nsqd.create_channel("orders", "billing").await.unwrap();
    nsqd.empty_channel("orders", "billing").await.unwrap();
    nsqd.empty_topic("orders").await.unwrap();
    nsqd.delete_channel("orders", "billing").await.unwrap();
    nsqd.delete_topic("orders").await.unwrap();

    let captured = captured.lock().unwrap();
    let paths: Vec<&str> = captured.iter().map(|r| r.path.as_str()).collect();
    assert_eq!(
        paths,
        vec![
            "/topic/create",
            "/channel/create",
            "/channel/empty",
            "/topic/empty",
            "/channel/delete",
            "/topic/delete",
        ]
    );
    for request in captured.iter() {
        assert_eq!(request.params.get("topic").map(String::as_str), Some("orders"));
    }
}

#[tokio::test]
async fn unreachable_daemon_is_an_admin_error() {
    let (host, port) = dead_address().await;
    let nsqd = Nsqd::new(format!("{host}:{port}"));
    let err = nsqd.ping().await.unwrap_err();
    assert!(matches!(err, ClientError::Admin { .. }));
}

#[tokio::test]
async fn http_transport_dials_via_ping_and_publishes_via_pub() {
    let (address, captured) = start_fake_nsqd().await;
    let (host, port) = match address.rsplit_once(':') {
        Some((h, p)) => (h.to_string(), p.parse::<u16>().unwrap()),
        None => unreachable!(),
    };

    let transport = HttpTransport::new();
    let (conn, _events) = transport.dial(&host, port).await.unwrap();

    conn.publish("orders", Bytes::from_static(b"hello")).await.unwrap();
    conn.publish_deferred("orders", Bytes::from_static(b"later"), Duration::from_secs(2))
        .await
        .unwrap();

    let captured = captured.lock().unwrap();
    assert_eq!(captured.len(), 2);
    assert_eq!(captured[1].params.get("defer").map(String::as_str), Some("2000"));
}

#[tokio::test]
async fn direct_mode_with_the_default_transport_dials_the_http_api_port() {
    let (address, captured) = start_fake_nsqd().await;
    let (host, http_port) = match address.rsplit_once(':') {
        Some((h, p)) => (h.to_string(), p.parse::<u16>().unwrap()),
        None => unreachable!(),
    };

    // The builder takes the daemon's advertised TCP port; HttpTransport
    // derives the HTTP API port from it for the actual dial.
    let producer = ProducerBuilder::new()
        .nsqd_host(host.clone())
        .tcp_port(http_port - 1)
        .build()
        .unwrap();

    let peers = producer.connect().await.unwrap();
    assert_eq!(peers, vec![(host, http_port)]);

    producer.produce("orders", "hello").await.unwrap();
    let captured = captured.lock().unwrap();
    assert_eq!(captured.len(), 1);
    assert_eq!(captured[0].path, "/pub");
    assert_eq!(captured[0].body, b"hello");
}

#[tokio::test]
async fn http_transport_dial_fails_when_ping_fails() {
    let (host, port) = dead_address().await;
    let transport = HttpTransport::new();
    let err = transport.dial(&host, port).await.err().expect("dial should fail");
    assert!(matches!(err, ClientError::Connect { .. }));
}

#[tokio::test]
async fn failed_publish_tears_the_http_connection_down() {
    let address = start_failing_nsqd().await;
    let (host, port) = match address.rsplit_once(':') {
        Some((h, p)) => (h.to_string(), p.parse::<u16>().unwrap()),
        None => unreachable!(),
    };

    let transport = HttpTransport::new();
    let (conn, mut events) = transport.dial(&host, port).await.unwrap();

    let err = conn.publish("orders", Bytes::from_static(b"x")).await.unwrap_err();
    assert!(matches!(err, ClientError::Publish { .. }));

    // The connection reports the failure and then its own closure, which is
    // what drives the pool's background reconnect.
    assert!(matches!(events.recv().await, Some(ConnectionEvent::Error(_))));
    assert_eq!(events.recv().await, Some(ConnectionEvent::Closed));

    // The link is logically gone; further publishes fail locally.
    let err = conn.publish("orders", Bytes::from_static(b"y")).await.unwrap_err();
    assert!(matches!(err, ClientError::Publish { .. }));
}
