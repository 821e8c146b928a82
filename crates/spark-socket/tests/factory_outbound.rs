//! SocketFactory 出站角色：错误分类、重连调度与取消、配额提交。

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use spark_socket::{
    ClientConfig, ClientState, EndpointOptions, FactoryErrorKind, LoopbackNetwork,
    ManualTimeDriver, QuotaLimits, QuotaStats, Server, ServerConfig, ServerOptions, SocketFactory,
    SocketFactoryConfig, TransportKind, TransportRegistry, codes,
};

type ErrorLog = Rc<RefCell<Vec<(FactoryErrorKind, &'static str)>>>;

struct Outbound {
    time: ManualTimeDriver,
    network: LoopbackNetwork,
    factory: SocketFactory,
    errors: ErrorLog,
    connect_errors: Rc<RefCell<usize>>,
    connects: Rc<RefCell<Vec<bool>>>,
    disconnects: Rc<RefCell<usize>>,
}

fn outbound(delay_seconds: f64, port: u16) -> Outbound {
    outbound_with(delay_seconds, port, QuotaLimits::unlimited(), QuotaStats::new())
}

fn outbound_with(delay_seconds: f64, port: u16, limits: QuotaLimits, stats: QuotaStats) -> Outbound {
    let time = ManualTimeDriver::new();
    let network = LoopbackNetwork::new(Rc::new(time.clone()));
    let config = SocketFactoryConfig {
        client: Some(
            ClientConfig::new(TransportKind::Loopback, EndpointOptions::new("upstream", port))
                .with_reconnect_delay(delay_seconds),
        ),
        server: None,
        limits,
    };
    let factory = SocketFactory::with_stats(config, network.registry(), Rc::new(time.clone()), stats);

    let errors: ErrorLog = Rc::default();
    let sink = Rc::clone(&errors);
    factory
        .events()
        .error
        .attach(move |error| sink.borrow_mut().push((error.kind, error.error.code())));
    let connect_errors = Rc::new(RefCell::new(0));
    let sink = Rc::clone(&connect_errors);
    factory
        .events()
        .client_connect_error
        .attach(move |_| *sink.borrow_mut() += 1);
    let connects = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&connects);
    factory
        .events()
        .connect
        .attach(move |connection| sink.borrow_mut().push(connection.server_side));
    let disconnects = Rc::new(RefCell::new(0));
    let sink = Rc::clone(&disconnects);
    factory
        .events()
        .disconnect
        .attach(move |_| *sink.borrow_mut() += 1);

    Outbound {
        time,
        network,
        factory,
        errors,
        connect_errors,
        connects,
        disconnects,
    }
}

fn upstream(network: &LoopbackNetwork, port: u16) -> Server {
    let options = ServerOptions::new("upstream", port);
    let server = Server::new(Box::new(network.listener(&options)), options);
    server.listen().expect("upstream listen");
    server
}

#[test]
fn zero_delay_failure_does_not_retry() {
    let outbound = outbound(0.0, 1);
    outbound.factory.init();
    outbound.time.advance(Duration::ZERO);

    assert_eq!(*outbound.connect_errors.borrow(), 1);
    assert_eq!(
        *outbound.errors.borrow(),
        vec![(FactoryErrorKind::ClientConnect, codes::CONNECTION_REFUSED)]
    );
    assert!(!outbound.factory.reconnect_pending());
    assert_eq!(outbound.time.pending(), 0);

    outbound.time.advance(Duration::from_secs(60));
    assert_eq!(*outbound.connect_errors.borrow(), 1);
    assert_eq!(outbound.factory.client_state(), ClientState::Idle);
}

#[test]
fn positive_delay_schedules_exactly_one_retry_per_failure() {
    let outbound = outbound(1.0, 2);
    outbound.factory.init();
    outbound.time.advance(Duration::ZERO);

    assert_eq!(*outbound.connect_errors.borrow(), 1);
    assert!(outbound.factory.reconnect_pending());
    assert_eq!(outbound.factory.client_state(), ClientState::ReconnectWait);
    assert_eq!(outbound.time.pending(), 1);

    outbound.time.advance(Duration::from_millis(999));
    assert_eq!(*outbound.connect_errors.borrow(), 1);

    outbound.time.advance(Duration::from_millis(1));
    assert_eq!(*outbound.connect_errors.borrow(), 2);
    assert_eq!(outbound.time.pending(), 1);

    outbound.time.advance(Duration::from_secs(3));
    assert_eq!(*outbound.connect_errors.borrow(), 5);
}

#[test]
fn shutdown_cancels_a_pending_retry() {
    let outbound = outbound(1.0, 3);
    outbound.factory.init();
    outbound.time.advance(Duration::ZERO);
    assert!(outbound.factory.reconnect_pending());

    outbound.factory.shutdown();
    assert!(!outbound.factory.reconnect_pending());
    assert_eq!(outbound.time.pending(), 0);
    outbound.time.advance(Duration::from_secs(10));
    assert_eq!(*outbound.connect_errors.borrow(), 1);
}

#[test]
fn close_cancels_a_pending_retry() {
    let outbound = outbound(0.5, 4);
    outbound.factory.init();
    outbound.time.advance(Duration::ZERO);

    outbound.factory.close();
    assert_eq!(outbound.time.pending(), 0);
    outbound.time.advance(Duration::from_secs(10));
    assert_eq!(*outbound.connect_errors.borrow(), 1);
    outbound.factory.connect_client();
    outbound.time.advance(Duration::from_secs(1));
    assert_eq!(*outbound.connect_errors.borrow(), 1);
}

#[test]
fn explicit_connect_replaces_the_pending_retry() {
    let outbound = outbound(5.0, 5);
    outbound.factory.init();
    outbound.time.advance(Duration::ZERO);
    assert!(outbound.factory.reconnect_pending());

    let _server = upstream(&outbound.network, 5);
    outbound.factory.connect_client();
    assert!(!outbound.factory.reconnect_pending());
    outbound.time.advance(Duration::ZERO);

    assert_eq!(*outbound.connects.borrow(), vec![false]);
    assert_eq!(outbound.factory.client_state(), ClientState::Connected);
    assert_eq!(outbound.time.pending(), 0);
}

#[test]
fn committed_connection_holds_quota_and_reconnects_after_close() {
    let outbound = outbound(1.0, 6);
    let server = upstream(&outbound.network, 6);
    outbound.factory.init();
    outbound.time.advance(Duration::ZERO);

    assert_eq!(*outbound.connects.borrow(), vec![false]);
    assert_eq!(outbound.factory.stats().count("upstream"), 1);
    assert_eq!(outbound.factory.stats().global(), 1);
    let client = outbound.factory.client().expect("active client");
    assert_eq!(client.remote_address().as_deref(), Some("upstream"));

    server.close(true);
    assert_eq!(*outbound.disconnects.borrow(), 1);
    assert!(outbound.factory.client().is_none());
    assert!(outbound.factory.stats().snapshot().is_empty());
    assert!(outbound.factory.reconnect_pending());

    let _replacement = upstream(&outbound.network, 6);
    outbound.time.advance(Duration::from_secs(1));
    assert_eq!(*outbound.connects.borrow(), vec![false, false]);
}

#[test]
fn overflow_before_connect_waits_for_the_retry_delay() {
    let stats = QuotaStats::new();
    let held = stats.admit(Some("upstream"));
    let outbound = outbound_with(
        2.0,
        7,
        QuotaLimits::unlimited().with_max_connections_per_ip(1),
        stats,
    );
    let _server = upstream(&outbound.network, 7);

    outbound.factory.init();
    outbound.time.advance(Duration::ZERO);
    assert!(outbound.connects.borrow().is_empty());
    assert!(outbound.errors.borrow().is_empty());
    assert!(outbound.factory.reconnect_pending());

    held.release();
    outbound.time.advance(Duration::from_secs(2));
    assert_eq!(*outbound.connects.borrow(), vec![false]);
}

#[test]
fn overflow_after_connect_closes_and_waits_for_the_retry_delay() {
    let stats = QuotaStats::new();
    let outbound = outbound_with(
        1.0,
        9,
        QuotaLimits::unlimited().with_max_connections(1),
        stats.clone(),
    );
    let _server = upstream(&outbound.network, 9);

    outbound.factory.init();
    assert_eq!(outbound.factory.client_state(), ClientState::Connecting);
    let held = stats.admit(Some("elsewhere"));
    outbound.time.advance(Duration::ZERO);

    assert!(outbound.connects.borrow().is_empty());
    assert!(outbound.errors.borrow().is_empty());
    assert_eq!(outbound.factory.stats().global(), 1);
    assert!(outbound.factory.client().is_none());
    assert_eq!(outbound.factory.client_state(), ClientState::ReconnectWait);
    assert!(outbound.factory.reconnect_pending());

    held.release();
    outbound.time.advance(Duration::from_secs(1));
    assert_eq!(*outbound.connects.borrow(), vec![false]);
    assert_eq!(outbound.factory.stats().global(), 1);
    assert_eq!(outbound.factory.stats().count("upstream"), 1);
    assert_eq!(outbound.factory.client_state(), ClientState::Connected);
}

#[test]
fn overflow_before_connect_without_delay_is_abandoned_silently() {
    let stats = QuotaStats::new();
    let _held = stats.admit(None);
    let outbound = outbound_with(0.0, 8, QuotaLimits::unlimited().with_max_connections(1), stats);
    outbound.factory.init();
    outbound.time.advance(Duration::from_secs(5));

    assert!(outbound.errors.borrow().is_empty());
    assert!(outbound.factory.client().is_none());
    assert!(!outbound.factory.reconnect_pending());
}

#[test]
fn unavailable_transports_become_init_errors() {
    let time = ManualTimeDriver::new();
    let config = SocketFactoryConfig {
        client: Some(
            ClientConfig::new(TransportKind::Tls, EndpointOptions::new("upstream", 443))
                .with_reconnect_delay(1.0),
        ),
        server: Some(ServerConfig::new(TransportKind::WebSocket, ServerOptions::new("0.0.0.0", 80))),
        limits: QuotaLimits::unlimited(),
    };
    let factory = SocketFactory::new(config, TransportRegistry::new(), Rc::new(time.clone()));

    let specific = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&specific);
    factory
        .events()
        .client_init_error
        .attach(move |error| sink.borrow_mut().push(("client", error.code())));
    let sink = Rc::clone(&specific);
    factory
        .events()
        .server_init_error
        .attach(move |error| sink.borrow_mut().push(("server", error.code())));
    let generic = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&generic);
    factory
        .events()
        .error
        .attach(move |error| sink.borrow_mut().push(error.kind.as_str()));

    factory.init();

    assert_eq!(
        *specific.borrow(),
        vec![
            ("server", codes::TRANSPORT_UNAVAILABLE),
            ("client", codes::TRANSPORT_UNAVAILABLE),
        ]
    );
    assert_eq!(*generic.borrow(), vec!["server-init-error", "client-init-error"]);
    assert!(!factory.reconnect_pending());
    assert_eq!(time.pending(), 0);
}
