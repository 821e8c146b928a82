//! 真实 TCP 套接字上的端到端行为：回显、定长读取、连接拒绝、工厂准入与计时驱动器。

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use spark_socket::{
    ByteSize, Client, ClientTransport, EndpointOptions, QuotaLimits, RefuseReason, Server,
    ServerConfig, ServerOptions, SocketFactory, SocketFactoryConfig, TimeDriver, TransportKind,
    TransportRegistry, codes,
};
use spark_socket_tcp::{TcpClientTransport, TcpServerTransport, TokioTimeDriver, register};
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn listening_server() -> Server {
    let options = ServerOptions::new("127.0.0.1", 0);
    let transport = TcpServerTransport::new(&options).expect("server transport");
    let server = Server::new(Box::new(transport), options);
    server.listen().expect("listen");
    server
}

fn dial(port: u16) -> Client {
    let options = EndpointOptions::new("127.0.0.1", port);
    let transport = TcpClientTransport::new(&options).expect("client transport");
    Client::new(Box::new(transport), options)
}

async fn collect(receiver: &mut mpsc::UnboundedReceiver<Bytes>, len: usize) -> BytesMut {
    let mut received = BytesMut::new();
    while received.len() < len {
        let chunk = timeout(WAIT, receiver.recv())
            .await
            .expect("data within deadline")
            .expect("channel open");
        received.extend_from_slice(&chunk);
    }
    received
}

#[tokio::test(flavor = "current_thread")]
async fn echo_round_trip_flushes_writes_queued_before_connect() {
    LocalSet::new()
        .run_until(async {
            let server = listening_server();
            server.on_connection(|client| {
                let weak = client.downgrade();
                client.on_data(move |chunk| {
                    if let Some(client) = weak.upgrade() {
                        client.send(chunk);
                    }
                });
            });
            let port = server.local_port().expect("bound port");
            assert_eq!(server.local_address().as_deref(), Some("127.0.0.1"));

            let client = dial(port);
            let (sender, mut receiver) = mpsc::unbounded_channel();
            client.on_data(move |chunk| {
                let _ = sender.send(chunk);
            });
            client.send("ping ");
            client.connect().expect("connect");
            client.send("pong");

            let received = collect(&mut receiver, 9).await;
            assert_eq!(&received[..], b"ping pong");
            assert_eq!(client.remote_address().as_deref(), Some("127.0.0.1"));
            assert_eq!(client.remote_port(), Some(port));
            assert_eq!(server.client_count(), 1);

            client.close();
            assert!(client.is_closed());
            server.close(true);
            assert!(server.is_closed());
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn byte_size_reads_split_a_single_segment() {
    LocalSet::new()
        .run_until(async {
            let server = listening_server();
            server.on_connection(|client| client.send("Hello!"));
            let port = server.local_port().expect("bound port");

            let client = dial(port);
            let time: Rc<dyn TimeDriver> = Rc::new(TokioTimeDriver::new());
            let first = ByteSize::new(&client, Rc::clone(&time))
                .read(5, Some(WAIT))
                .expect("first read");
            client.connect().expect("connect");

            assert_eq!(first.await, Ok(Bytes::from_static(b"Hello")));
            let second = ByteSize::new(&client, time)
                .read(1, Some(WAIT))
                .expect("second read");
            assert_eq!(second.await, Ok(Bytes::from_static(b"!")));

            client.close();
            server.close(true);
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn refused_connect_reports_error_then_close() {
    LocalSet::new()
        .run_until(async {
            let port = {
                let vacated = std::net::TcpListener::bind("127.0.0.1:0").expect("bind spare port");
                vacated.local_addr().expect("spare addr").port()
            };

            let client = dial(port);
            let (errors, mut error_rx) = mpsc::unbounded_channel();
            client.on_error(move |error| {
                let _ = errors.send(error.code());
            });
            let (closes, mut close_rx) = mpsc::unbounded_channel();
            client.on_close(move |had_error| {
                let _ = closes.send(had_error);
            });
            client.connect().expect("connect started");

            let code = timeout(WAIT, error_rx.recv())
                .await
                .expect("error within deadline")
                .expect("channel open");
            assert_eq!(code, codes::CONNECTION_REFUSED);
            let had_error = timeout(WAIT, close_rx.recv())
                .await
                .expect("close within deadline")
                .expect("channel open");
            assert!(had_error);
            assert!(client.is_closed());
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn factory_refuses_denied_tcp_peers() {
    LocalSet::new()
        .run_until(async {
            let config = SocketFactoryConfig {
                server: Some(
                    ServerConfig::new(TransportKind::Tcp, ServerOptions::new("127.0.0.1", 0))
                        .with_denied(["127.0.0.1"]),
                ),
                client: None,
                limits: QuotaLimits::unlimited(),
            };
            let registry = register(TransportRegistry::new());
            assert!(registry.supports_client(TransportKind::Tcp));
            assert!(registry.supports_server(TransportKind::Tcp));
            let factory = SocketFactory::new(config, registry, Rc::new(TokioTimeDriver::new()));

            let (refusals, mut refusal_rx) = mpsc::unbounded_channel();
            factory.events().client_ip_refuse.attach(move |refusal| {
                let _ = refusals.send(refusal);
            });
            factory.init();
            let port = factory
                .server()
                .and_then(|server| server.local_port())
                .expect("factory listening");

            let client = dial(port);
            let (closes, mut close_rx) = mpsc::unbounded_channel();
            client.on_close(move |had_error| {
                let _ = closes.send(had_error);
            });
            client.connect().expect("connect started");

            let refusal = timeout(WAIT, refusal_rx.recv())
                .await
                .expect("refusal within deadline")
                .expect("channel open");
            assert_eq!(refusal.reason, RefuseReason::Denied);
            assert_eq!(refusal.address.as_deref(), Some("127.0.0.1"));

            timeout(WAIT, close_rx.recv())
                .await
                .expect("peer close within deadline")
                .expect("channel open");
            assert!(factory.connections().is_empty());
            assert_eq!(factory.stats().global(), 0);
            factory.close();
        })
        .await;
}

#[test]
fn secure_client_options_are_rejected_up_front() {
    let options = EndpointOptions::new("127.0.0.1", 7000).with_secure(true);
    let err = TcpClientTransport::new(&options).expect_err("secure client");
    assert_eq!(err.code(), codes::INVALID_CONFIG);

    let err = TcpClientTransport::new(&EndpointOptions::new("127.0.0.1", 0)).expect_err("port 0");
    assert_eq!(err.code(), codes::INVALID_CONFIG);
}

#[tokio::test(flavor = "current_thread")]
async fn tokio_time_driver_skips_cancelled_tasks() {
    LocalSet::new()
        .run_until(async {
            let driver = TokioTimeDriver::new();
            let cancelled = Rc::new(Cell::new(false));
            let fired = Rc::new(Cell::new(false));

            let flag = Rc::clone(&cancelled);
            let handle = driver.schedule(
                Duration::from_millis(10),
                Box::new(move || flag.set(true)),
            );
            let flag = Rc::clone(&fired);
            let kept = driver.schedule(Duration::from_millis(20), Box::new(move || flag.set(true)));
            handle.cancel();
            assert!(handle.is_cancelled());

            tokio::time::sleep(Duration::from_millis(60)).await;
            assert!(!cancelled.get());
            assert!(fired.get());
            assert!(!kept.is_pending());
        })
        .await;
}

#[test]
fn outbound_transport_reports_target_port_before_connect() {
    let transport = TcpClientTransport::new(&EndpointOptions::new("127.0.0.1", 9)).expect("transport");
    assert_eq!(transport.remote_port(), Some(9));
    assert_eq!(transport.remote_address(), None);
}
