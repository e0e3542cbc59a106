//! Socketcand connection tests against a scripted in-process gateway

use fieldlink_canbus::socketcand::Subscription;
use fieldlink_canbus::{CanbusFrame, FrameListener, SocketcandConnection};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing_test::traced_test;

const BUS: &str = "Test_Bus";

/// Frame listener recording everything it receives
#[derive(Default)]
struct RecordingListener {
    frames: Mutex<Vec<CanbusFrame>>,
}

impl RecordingListener {
    fn frames(&self) -> Vec<CanbusFrame> {
        self.frames.lock().unwrap().clone()
    }

    fn count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }
}

impl FrameListener for RecordingListener {
    fn frame_received(&self, frame: &CanbusFrame) {
        self.frames.lock().unwrap().push(frame.clone());
    }
}

/// Commands the scripted gateway received, in order
type Received = Arc<Mutex<Vec<String>>>;

/// Signals that let a test release the gateway's next scripted response
type Step = mpsc::UnboundedSender<()>;

async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    (listener, addr)
}

/// Read one `<...>` message off the socket; `None` on end-of-stream
async fn read_message(stream: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => {},
        }
        buf.push(byte[0]);
        if byte[0] == b'>' {
            let text = String::from_utf8(buf).ok()?;
            let start = text.find('<')?;
            return Some(normalize(&text[start..]));
        }
    }
}

/// Collapse whitespace so assertions are framing-insensitive
fn normalize(raw: &str) -> String {
    let inner = raw.trim_start_matches('<').trim_end_matches('>');
    let tokens: Vec<&str> = inner.split_whitespace().collect();
    format!("< {} >", tokens.join(" "))
}

/// Greeting, open command, acknowledgement
async fn handshake(stream: &mut TcpStream, received: &Received) {
    stream.write_all(b"< hi >").await.expect("write greeting");
    let open = read_message(stream).await.expect("open command");
    received.lock().unwrap().push(open);
    stream.write_all(b"< ok >").await.expect("write ok");
}

/// Record remaining inbound commands until the client hangs up
async fn drain(mut stream: TcpStream, received: Received) {
    while let Some(message) = read_message(&mut stream).await {
        received.lock().unwrap().push(message);
    }
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn received_commands(received: &Received) -> Vec<String> {
    received.lock().unwrap().clone()
}

#[tokio::test(flavor = "multi_thread")]
async fn open_and_close() {
    let (listener, addr) = bind().await;
    let received: Received = Arc::default();
    let server_received = Arc::clone(&received);
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        handshake(&mut stream, &server_received).await;
        drain(stream, server_received).await;
    });

    let conn = SocketcandConnection::new("127.0.0.1", addr.port(), BUS);
    conn.open().await.expect("open");
    assert!(conn.is_established());

    conn.close().await;
    assert!(!conn.is_established());
    assert!(conn.is_closed());

    server.await.expect("server");
    assert_eq!(
        received_commands(&received),
        vec!["< open Test_Bus >".to_string()]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn close_is_idempotent_and_final() {
    let (listener, addr) = bind().await;
    let received: Received = Arc::default();
    let server_received = Arc::clone(&received);
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        handshake(&mut stream, &server_received).await;
        drain(stream, server_received).await;
    });

    let conn = SocketcandConnection::new("127.0.0.1", addr.port(), BUS);
    conn.open().await.expect("open");
    conn.close().await;
    conn.close().await;

    // a closed connection never reopens itself
    assert!(conn.open().await.is_err());
    assert!(!conn.is_established());

    server.await.expect("server");
}

#[tokio::test(flavor = "multi_thread")]
async fn greeting_failure_leaves_connection_closed() {
    let (listener, addr) = bind().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        stream.write_all(b"< nope >").await.expect("write");
    });

    let conn = SocketcandConnection::new("127.0.0.1", addr.port(), BUS);
    let err = conn.open().await.expect_err("greeting mismatch");
    assert!(err.to_string().contains("greeting"), "unexpected: {err}");
    assert!(!conn.is_established());

    server.await.expect("server");
}

#[tokio::test(flavor = "multi_thread")]
async fn open_ack_failure_leaves_connection_closed() {
    let (listener, addr) = bind().await;
    let received: Received = Arc::default();
    let server_received = Arc::clone(&received);
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        stream.write_all(b"< hi >").await.expect("write greeting");
        let open = read_message(&mut stream).await.expect("open command");
        server_received.lock().unwrap().push(open);
        stream.write_all(b"< err 99 >").await.expect("write err");
    });

    let conn = SocketcandConnection::new("127.0.0.1", addr.port(), BUS);
    let err = conn.open().await.expect_err("open not acknowledged");
    assert!(err.to_string().contains("opening bus"), "unexpected: {err}");
    assert!(!conn.is_established());

    server.await.expect("server");
}

#[tokio::test(flavor = "multi_thread")]
async fn subscribe_and_receive_frame() {
    let (listener, addr) = bind().await;
    let received: Received = Arc::default();
    let (step_tx, mut step_rx) = mpsc::unbounded_channel::<()>();
    let server_received = Arc::clone(&received);
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        handshake(&mut stream, &server_received).await;
        let subscribe = read_message(&mut stream).await.expect("subscribe");
        server_received.lock().unwrap().push(subscribe);
        step_rx.recv().await.expect("step");
        stream
            .write_all(b"< frame 1 23.424242 11 22 33 44 >")
            .await
            .expect("write frame");
        drain(stream, server_received).await;
    });

    let conn = SocketcandConnection::new("127.0.0.1", addr.port(), BUS);
    conn.open().await.expect("open");

    let listener_a = Arc::new(RecordingListener::default());
    conn.subscribe(Subscription::new(1, false, None, listener_a.clone()).expect("subscription"))
        .await
        .expect("subscribe");
    step_tx.send(()).expect("step");

    wait_until("frame delivery", || listener_a.count() == 1).await;
    let frame = listener_a.frames().remove(0);
    assert_eq!(frame.address(), 1);
    assert_eq!(frame.seconds(), 23);
    assert_eq!(frame.microseconds(), 424_242);
    assert_eq!(frame.data(), &[0x11, 0x22, 0x33, 0x44]);

    conn.close().await;
    server.await.expect("server");
    assert_eq!(
        received_commands(&received),
        vec![
            "< open Test_Bus >".to_string(),
            "< subscribe 1 0 0 >".to_string(),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn frame_for_other_address_is_dropped() {
    let (listener, addr) = bind().await;
    let received: Received = Arc::default();
    let (step_tx, mut step_rx) = mpsc::unbounded_channel::<()>();
    let server_received = Arc::clone(&received);
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        handshake(&mut stream, &server_received).await;
        let subscribe = read_message(&mut stream).await.expect("subscribe");
        server_received.lock().unwrap().push(subscribe);
        step_rx.recv().await.expect("step");
        stream
            .write_all(b"< frame 2 23.424242 11 22 33 44 >")
            .await
            .expect("write frame");
        drain(stream, server_received).await;
    });

    let conn = SocketcandConnection::new("127.0.0.1", addr.port(), BUS);
    conn.open().await.expect("open");

    let listener_a = Arc::new(RecordingListener::default());
    conn.subscribe(Subscription::new(1, false, None, listener_a.clone()).expect("subscription"))
        .await
        .expect("subscribe");
    step_tx.send(()).expect("step");

    sleep(Duration::from_millis(300)).await;
    assert_eq!(listener_a.count(), 0);

    conn.close().await;
    server.await.expect("server");
}

#[tokio::test(flavor = "multi_thread")]
#[traced_test]
async fn subscription_replacement_is_last_writer_wins() {
    let (listener, addr) = bind().await;
    let received: Received = Arc::default();
    let (step_tx, mut step_rx) = mpsc::unbounded_channel::<()>();
    let server_received = Arc::clone(&received);
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        handshake(&mut stream, &server_received).await;
        for _ in 0..2 {
            let subscribe = read_message(&mut stream).await.expect("subscribe");
            server_received.lock().unwrap().push(subscribe);
        }
        step_rx.recv().await.expect("step");
        stream
            .write_all(b"< frame 1 23.424242 11 22 33 44 >")
            .await
            .expect("write frame");
        drain(stream, server_received).await;
    });

    let conn = SocketcandConnection::new("127.0.0.1", addr.port(), BUS);
    conn.open().await.expect("open");

    let listener_a = Arc::new(RecordingListener::default());
    let listener_b = Arc::new(RecordingListener::default());
    conn.subscribe(Subscription::new(1, false, None, listener_a.clone()).expect("subscription"))
        .await
        .expect("first subscribe");
    conn.subscribe(Subscription::new(1, false, None, listener_b.clone()).expect("subscription"))
        .await
        .expect("second subscribe");
    step_tx.send(()).expect("step");

    wait_until("frame delivery to replacement", || listener_b.count() == 1).await;
    assert_eq!(listener_a.count(), 0);

    // replacement is informational, not an error
    assert!(logs_contain("replaced by new subscription"));

    conn.close().await;
    server.await.expect("server");
}

#[tokio::test(flavor = "multi_thread")]
async fn unsubscribe_stops_delivery() {
    let (listener, addr) = bind().await;
    let received: Received = Arc::default();
    let (step_tx, mut step_rx) = mpsc::unbounded_channel::<()>();
    let server_received = Arc::clone(&received);
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        handshake(&mut stream, &server_received).await;
        let subscribe = read_message(&mut stream).await.expect("subscribe");
        server_received.lock().unwrap().push(subscribe);
        step_rx.recv().await.expect("step");
        stream
            .write_all(b"< frame 1 23.424242 11 22 33 44 >")
            .await
            .expect("write frame");
        let unsubscribe = read_message(&mut stream).await.expect("unsubscribe");
        server_received.lock().unwrap().push(unsubscribe);
        step_rx.recv().await.expect("step");
        stream
            .write_all(b"< frame 1 32.0 22 33 44 55 >")
            .await
            .expect("write frame");
        drain(stream, server_received).await;
    });

    let conn = SocketcandConnection::new("127.0.0.1", addr.port(), BUS);
    conn.open().await.expect("open");

    let listener_a = Arc::new(RecordingListener::default());
    conn.subscribe(Subscription::new(1, false, None, listener_a.clone()).expect("subscription"))
        .await
        .expect("subscribe");
    step_tx.send(()).expect("step");
    wait_until("first frame", || listener_a.count() == 1).await;

    conn.unsubscribe(1, false).await.expect("unsubscribe");
    step_tx.send(()).expect("step");

    sleep(Duration::from_millis(300)).await;
    assert_eq!(listener_a.count(), 1, "no delivery after unsubscribe");
    assert_eq!(listener_a.frames()[0].data(), &[0x11, 0x22, 0x33, 0x44]);

    conn.close().await;
    server.await.expect("server");
    assert_eq!(
        received_commands(&received),
        vec![
            "< open Test_Bus >".to_string(),
            "< subscribe 1 0 0 >".to_string(),
            "< unsubscribe 1 >".to_string(),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn monitor_takes_precedence_and_unmonitor_restores() {
    let (listener, addr) = bind().await;
    let received: Received = Arc::default();
    let (step_tx, mut step_rx) = mpsc::unbounded_channel::<()>();
    let server_received = Arc::clone(&received);
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        handshake(&mut stream, &server_received).await;
        for _ in 0..2 {
            // subscribe, then rawmode
            let command = read_message(&mut stream).await.expect("command");
            server_received.lock().unwrap().push(command);
        }
        step_rx.recv().await.expect("step");
        stream
            .write_all(b"< frame 1 23.424242 11 22 33 44 >")
            .await
            .expect("write frame");
        let bcmmode = read_message(&mut stream).await.expect("bcmmode");
        server_received.lock().unwrap().push(bcmmode);
        step_rx.recv().await.expect("step");
        stream
            .write_all(b"< frame 1 32.0 22 33 44 55 >")
            .await
            .expect("write frame");
        drain(stream, server_received).await;
    });

    let conn = SocketcandConnection::new("127.0.0.1", addr.port(), BUS);
    conn.open().await.expect("open");

    let subscribed = Arc::new(RecordingListener::default());
    let monitor = Arc::new(RecordingListener::default());
    conn.subscribe(Subscription::new(1, false, None, subscribed.clone()).expect("subscription"))
        .await
        .expect("subscribe");
    conn.monitor(monitor.clone()).await.expect("monitor");
    assert!(conn.is_monitoring());
    step_tx.send(()).expect("step");

    // while monitoring, the frame goes only to the monitor listener
    wait_until("monitor delivery", || monitor.count() == 1).await;
    assert_eq!(subscribed.count(), 0);

    conn.unmonitor().await.expect("unmonitor");
    assert!(!conn.is_monitoring());
    step_tx.send(()).expect("step");

    // the subscription resumes receiving without re-subscribing
    wait_until("subscription delivery", || subscribed.count() == 1).await;
    assert_eq!(monitor.count(), 1);
    assert_eq!(subscribed.frames()[0].data(), &[0x22, 0x33, 0x44, 0x55]);

    conn.close().await;
    server.await.expect("server");
    assert_eq!(
        received_commands(&received),
        vec![
            "< open Test_Bus >".to_string(),
            "< subscribe 1 0 0 >".to_string(),
            "< rawmode >".to_string(),
            "< bcmmode >".to_string(),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn one_echo_reply_resolves_all_pending_checks() {
    let (listener, addr) = bind().await;
    let received: Received = Arc::default();
    let (step_tx, mut step_rx) = mpsc::unbounded_channel::<()>();
    let server_received = Arc::clone(&received);
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        handshake(&mut stream, &server_received).await;
        for _ in 0..2 {
            let echo = read_message(&mut stream).await.expect("echo");
            server_received.lock().unwrap().push(echo);
        }
        step_rx.recv().await.expect("step");
        stream.write_all(b"< echo >").await.expect("write echo");
        drain(stream, server_received).await;
    });

    let conn = SocketcandConnection::new("127.0.0.1", addr.port(), BUS);
    conn.open().await.expect("open");

    let first = conn.verify_connectivity().await.expect("first check");
    let second = conn.verify_connectivity().await.expect("second check");
    assert_eq!(conn.pending_correlations(), 2);
    step_tx.send(()).expect("step");

    let (first, second) = tokio::join!(first, second);
    assert!(first, "first check verified");
    assert!(second, "second check verified");
    assert_eq!(conn.pending_correlations(), 0);

    conn.close().await;
    server.await.expect("server");
    assert_eq!(
        received_commands(&received),
        vec![
            "< open Test_Bus >".to_string(),
            "< echo >".to_string(),
            "< echo >".to_string(),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn unanswered_check_times_out_and_is_cleaned_up() {
    let (listener, addr) = bind().await;
    let received: Received = Arc::default();
    let server_received = Arc::clone(&received);
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        handshake(&mut stream, &server_received).await;
        // read the echo but never answer it
        drain(stream, server_received).await;
    });

    let conn = SocketcandConnection::new("127.0.0.1", addr.port(), BUS)
        .with_verify_timeout(Duration::from_millis(100));
    conn.open().await.expect("open");

    let check = conn.verify_connectivity().await.expect("check");
    assert_eq!(conn.pending_correlations(), 1);
    assert!(!check.await, "unanswered check resolves false");
    assert_eq!(conn.pending_correlations(), 0);

    conn.close().await;
    server.await.expect("server");
}

#[tokio::test(flavor = "multi_thread")]
async fn verify_on_closed_connection_short_circuits() {
    let (listener, addr) = bind().await;
    let received: Received = Arc::default();
    let server_received = Arc::clone(&received);
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        handshake(&mut stream, &server_received).await;
        drain(stream, server_received).await;
    });

    let conn = SocketcandConnection::new("127.0.0.1", addr.port(), BUS);
    conn.open().await.expect("open");
    conn.close().await;

    let check = conn.verify_connectivity().await.expect("check");
    assert!(!check.await, "closed connection verifies false");
    assert_eq!(conn.pending_correlations(), 0);

    server.await.expect("server");
    // no echo was ever written
    assert_eq!(
        received_commands(&received),
        vec!["< open Test_Bus >".to_string()]
    );
}
