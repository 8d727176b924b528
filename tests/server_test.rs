use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use courier::{
    setup_local_tracing, ConnectionHandle, MessageFrame, MetaValue, Server, ServerConfig,
    ServerHandler,
};
use rstest::{fixture, rstest};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

#[fixture]
#[once]
fn setup() {
    setup_local_tracing().expect("failed to setup tracing");
}

#[derive(Debug, PartialEq)]
enum Event {
    Message(u64, Bytes),
    Connected(u64),
    Disconnected(u64),
    ClientException(u64),
    ListeningException,
    Started,
    Stopped,
    Closed,
}

struct Recorder {
    tx: mpsc::UnboundedSender<Event>,
}

#[async_trait]
impl ServerHandler for Recorder {
    async fn handle_message(
        &self,
        _server: &Server,
        client: &Arc<ConnectionHandle>,
        payload: Bytes,
    ) {
        let _ = self.tx.send(Event::Message(client.id(), payload));
    }

    async fn client_connected(&self, _server: &Server, client: &Arc<ConnectionHandle>) {
        let _ = self.tx.send(Event::Connected(client.id()));
    }

    async fn client_disconnected(&self, _server: &Server, client: &Arc<ConnectionHandle>) {
        let _ = self.tx.send(Event::Disconnected(client.id()));
    }

    async fn client_exception(
        &self,
        _server: &Server,
        client: &Arc<ConnectionHandle>,
        _error: &courier::AppError,
    ) {
        let _ = self.tx.send(Event::ClientException(client.id()));
    }

    async fn listening_exception(&self, _server: &Server, _error: &courier::AppError) {
        let _ = self.tx.send(Event::ListeningException);
    }

    async fn server_started(&self, _server: &Server) {
        let _ = self.tx.send(Event::Started);
    }

    async fn server_stopped(&self, _server: &Server) {
        let _ = self.tx.send(Event::Stopped);
    }

    async fn server_closed(&self, _server: &Server) {
        let _ = self.tx.send(Event::Closed);
    }
}

fn test_config() -> ServerConfig {
    ServerConfig {
        ip: "127.0.0.1".to_string(),
        port: 0,
        accept_timeout_ms: 100,
        ..ServerConfig::default()
    }
}

async fn start_server() -> (Arc<Server>, mpsc::UnboundedReceiver<Event>, u16) {
    let (tx, rx) = mpsc::unbounded_channel();
    let server = Server::new(test_config(), Arc::new(Recorder { tx }));
    server.listen().await.expect("listen failed");
    let port = server.local_addr().expect("no local addr").port();
    (server, rx, port)
}

async fn connect(port: u16) -> TcpStream {
    TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("connect failed")
}

async fn send_frame(stream: &mut TcpStream, payload: &[u8]) {
    let buffer = MessageFrame::new(Bytes::copy_from_slice(payload)).encode();
    stream.write_all(&buffer).await.expect("write failed");
    stream.flush().await.expect("flush failed");
}

async fn read_frame(stream: &mut TcpStream) -> Bytes {
    let length = stream.read_i32().await.expect("read length failed");
    let mut payload = vec![0u8; length as usize];
    stream
        .read_exact(&mut payload)
        .await
        .expect("read payload failed");
    Bytes::from(payload)
}

async fn expect_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within deadline");
}

#[rstest]
#[tokio::test]
async fn test_listen_is_idempotent(_setup: ()) {
    let (server, mut rx, port) = start_server().await;
    assert!(server.is_listening());
    assert_eq!(expect_event(&mut rx).await, Event::Started);

    // a second listen must not bind again or start a second accept loop
    server.listen().await.expect("second listen failed");
    assert!(server.is_listening());

    let _stream = connect(port).await;
    assert_eq!(expect_event(&mut rx).await, Event::Connected(1));
    // exactly one Connected event: a duplicate accept loop would produce more
    sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(server.client_count(), 1);

    server.close().await;
}

#[rstest]
#[tokio::test]
async fn test_close_before_listen_is_a_noop(_setup: ()) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let server = Server::new(test_config(), Arc::new(Recorder { tx }));

    // nothing bound yet: no closed notification now, and none held back to
    // replay once dispatch starts
    server.close().await;

    server.listen().await.expect("listen failed");
    assert_eq!(expect_event(&mut rx).await, Event::Started);

    server.close().await;
    loop {
        let event = expect_event(&mut rx).await;
        if event == Event::Closed {
            break;
        }
    }
}

#[rstest]
#[tokio::test]
async fn test_bind_failure_reported_to_caller(_setup: ()) {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").expect("bind failed");
    let port = occupied.local_addr().unwrap().port();

    let (tx, _rx) = mpsc::unbounded_channel();
    let config = ServerConfig {
        port,
        ..test_config()
    };
    let server = Server::new(config, Arc::new(Recorder { tx }));
    let result = server.listen().await;
    assert!(result.is_err());
    assert!(!server.is_listening());
}

#[rstest]
#[tokio::test]
async fn test_client_count_tracks_connects_and_disconnects(_setup: ()) {
    let (server, mut rx, port) = start_server().await;
    assert_eq!(expect_event(&mut rx).await, Event::Started);

    let s1 = connect(port).await;
    let s2 = connect(port).await;
    let s3 = connect(port).await;
    wait_until(|| server.client_count() == 3).await;

    drop(s1);
    drop(s2);
    wait_until(|| server.client_count() == 1).await;

    // ids are monotonic and never reused
    let remaining = server.client_connections();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id(), 3);

    drop(s3);
    wait_until(|| server.client_count() == 0).await;
    server.close().await;
}

#[rstest]
#[tokio::test]
async fn test_close_clears_all_connections(_setup: ()) {
    let (server, mut rx, port) = start_server().await;
    assert_eq!(expect_event(&mut rx).await, Event::Started);

    let mut streams = Vec::new();
    for _ in 0..3 {
        streams.push(connect(port).await);
    }
    wait_until(|| server.client_count() == 3).await;

    // one transport is already dead before close; its failure must not
    // prevent the others from being released
    server.get_client(2).expect("client 2 missing").close().await.ok();

    server.close().await;
    assert_eq!(server.client_count(), 0);
    // the accept loop clears the listening flag on its own task
    wait_until(|| !server.is_listening()).await;

    // every transport observes EOF
    for stream in streams.iter_mut() {
        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("timed out waiting for EOF")
            .expect("read failed");
        assert_eq!(n, 0);
    }

    loop {
        let event = expect_event(&mut rx).await;
        if event == Event::Closed {
            break;
        }
    }
}

#[rstest]
#[tokio::test]
async fn test_broadcast_skips_failed_recipient(_setup: ()) {
    let (server, mut rx, port) = start_server().await;
    assert_eq!(expect_event(&mut rx).await, Event::Started);

    let mut s1 = connect(port).await;
    let _s2 = connect(port).await;
    let mut s3 = connect(port).await;
    wait_until(|| server.client_count() == 3).await;

    // silently close the middle connection at the handle level
    server.get_client(2).expect("client 2 missing").close().await.ok();

    server.send_to_all_clients(Bytes::from_static(b"hello")).await;

    assert_eq!(read_frame(&mut s1).await, Bytes::from_static(b"hello"));
    assert_eq!(read_frame(&mut s3).await, Bytes::from_static(b"hello"));
    server.close().await;
}

#[rstest]
#[tokio::test]
async fn test_stop_listening_keeps_existing_connections(_setup: ()) {
    let (server, mut rx, port) = start_server().await;
    assert_eq!(expect_event(&mut rx).await, Event::Started);

    let mut s1 = connect(port).await;
    assert_eq!(expect_event(&mut rx).await, Event::Connected(1));

    server.stop_listening();
    assert_eq!(expect_event(&mut rx).await, Event::Stopped);
    wait_until(|| !server.is_listening()).await;

    // a new attempt may complete the TCP handshake through the backlog but
    // is never accepted into the registry
    let _late = TcpStream::connect(("127.0.0.1", port)).await;
    sleep(Duration::from_millis(400)).await;
    assert_eq!(server.client_count(), 1);

    // the already-accepted connection still exchanges messages
    send_frame(&mut s1, b"still here").await;
    assert_eq!(
        expect_event(&mut rx).await,
        Event::Message(1, Bytes::from_static(b"still here"))
    );
    server
        .send_to_all_clients(Bytes::from_static(b"reply"))
        .await;
    assert_eq!(read_frame(&mut s1).await, Bytes::from_static(b"reply"));

    server.close().await;
}

#[rstest]
#[tokio::test]
async fn test_listen_again_after_stop(_setup: ()) {
    let (server, mut rx, port) = start_server().await;
    assert_eq!(expect_event(&mut rx).await, Event::Started);

    server.stop_listening();
    assert_eq!(expect_event(&mut rx).await, Event::Stopped);
    wait_until(|| !server.is_listening()).await;

    server.listen().await.expect("re-listen failed");
    assert_eq!(expect_event(&mut rx).await, Event::Started);

    let _stream = connect(port).await;
    assert_eq!(expect_event(&mut rx).await, Event::Connected(1));
    server.close().await;
}

struct SerializationProbe {
    in_flight: AtomicBool,
    overlapped: AtomicBool,
    tx: mpsc::UnboundedSender<Bytes>,
}

#[async_trait]
impl ServerHandler for SerializationProbe {
    async fn handle_message(
        &self,
        _server: &Server,
        _client: &Arc<ConnectionHandle>,
        payload: Bytes,
    ) {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        // hold the handler long enough that a concurrent delivery would overlap
        sleep(Duration::from_millis(50)).await;
        self.in_flight.store(false, Ordering::SeqCst);
        let _ = self.tx.send(payload);
    }
}

#[rstest]
#[tokio::test]
async fn test_message_dispatch_is_serialized(_setup: ()) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let probe = Arc::new(SerializationProbe {
        in_flight: AtomicBool::new(false),
        overlapped: AtomicBool::new(false),
        tx,
    });
    let server = Server::new(test_config(), probe.clone());
    server.listen().await.expect("listen failed");
    let port = server.local_addr().unwrap().port();

    let mut s1 = connect(port).await;
    let mut s2 = connect(port).await;
    wait_until(|| server.client_count() == 2).await;

    // fire from both connections at once
    tokio::join!(send_frame(&mut s1, b"A"), send_frame(&mut s2, b"B"));

    let first = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed");
    let second = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed");

    let mut seen = vec![first, second];
    seen.sort();
    assert_eq!(seen, vec![Bytes::from_static(b"A"), Bytes::from_static(b"B")]);
    assert!(!probe.overlapped.load(Ordering::SeqCst));

    server.close().await;
}

#[rstest]
#[tokio::test]
async fn test_connection_metadata_round_trip(_setup: ()) {
    let (server, mut rx, port) = start_server().await;
    assert_eq!(expect_event(&mut rx).await, Event::Started);

    let _stream = connect(port).await;
    assert_eq!(expect_event(&mut rx).await, Event::Connected(1));

    let client = server.get_client(1).expect("client missing");
    assert_eq!(client.get_info("login"), None);

    client.set_info("login", "alice");
    client.set_info("messages", 7i64);
    assert_eq!(client.get_info("login"), Some(MetaValue::from("alice")));
    assert_eq!(client.get_info("messages"), Some(MetaValue::Int(7)));

    // overwrite per key
    client.set_info("login", "bob");
    assert_eq!(client.get_info("login"), Some(MetaValue::from("bob")));

    assert_eq!(client.remove_info("messages"), Some(MetaValue::Int(7)));
    assert_eq!(client.get_info("messages"), None);

    server.close().await;
}

#[rstest]
#[tokio::test]
async fn test_send_on_closed_handle_returns_error(_setup: ()) {
    let (server, mut rx, port) = start_server().await;
    assert_eq!(expect_event(&mut rx).await, Event::Started);

    let _stream = connect(port).await;
    assert_eq!(expect_event(&mut rx).await, Event::Connected(1));

    let client = server.get_client(1).expect("client missing");
    client.close().await.ok();
    let result = client.send(Bytes::from_static(b"too late")).await;
    assert!(result.is_err());

    server.close().await;
}

#[rstest]
#[tokio::test]
async fn test_abrupt_disconnect_reports_exception(_setup: ()) {
    let (server, mut rx, port) = start_server().await;
    assert_eq!(expect_event(&mut rx).await, Event::Started);

    let stream = connect(port).await;
    assert_eq!(expect_event(&mut rx).await, Event::Connected(1));

    // drop mid-frame: length prefix promises more bytes than ever arrive
    {
        let mut stream = stream;
        stream.write_i32(64).await.expect("write failed");
        stream.write_all(b"partial").await.expect("write failed");
        stream.flush().await.expect("flush failed");
    }

    assert_eq!(expect_event(&mut rx).await, Event::ClientException(1));
    assert_eq!(expect_event(&mut rx).await, Event::Disconnected(1));
    wait_until(|| server.client_count() == 0).await;

    server.close().await;
}
