//! 连接工厂：组合至多一个出站 [`Client`] 与至多一个 [`Server`]，执行准入控制、
//! 共享配额计数与出站重连。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 将“允许多少连接、允许来自哪里、失败后如何重试”的策略集中到一处，与具体传输解耦；
//! - 多个工厂可以共享同一个 [`QuotaStats`]，实现跨实例的全局/单地址上限。
//!
//! ## 状态机（What）
//! - 工厂整体：`Active → Shutdown → Closed`，单向且幂等；
//! - 出站角色：`Idle → Connecting → Connected → (error|close) → ReconnectWait → Connecting …`；
//! - 监听角色：`Idle → Listening → Closed`。
//!
//! ## 服务端准入（How）
//! 每个被接受的连接依次经过：黑名单 → 白名单 → 配额。地址缺失（非 IP 传输）时跳过地址相关检查，
//! 只保留全局上限。被拒连接立即关闭并触发 `client_ip_refuse`；通过者取得 [`QuotaLease`]，
//! 关闭时归还配额、移出登记表并触发 `disconnect`。
//!
//! ## 出站准入（How）
//! 1. 连接前按目标主机检查配额，溢出时按重连策略延后或放弃；
//! 2. 传输构造失败转为 `client_init_error`，不重试；
//! 3. 连接建立后再检查一次配额，溢出则关闭并按重连策略处理；
//! 4. 否则提交：取得租约并触发 `connect`。关闭时归还租约、清空出站引用并安排重连。
//!
//! ## 风险提示（Trade-offs）
//! - 出站连接建立后的二次配额检查与服务端准入交错执行，只提供尽力而为的保证；
//! - 所有生命周期方法都不返回错误：失败一律转为分类事件，并同步镜像到通用 `error` 事件。

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, info, trace, warn};

use crate::client::{Client, WeakClient};
use crate::config::SocketFactoryConfig;
use crate::error::{FactoryError, FactoryErrorKind, SocketError, codes};
use crate::event::EventChannel;
use crate::quota::{QuotaLease, QuotaStats};
use crate::registry::TransportRegistry;
use crate::server::Server;
use crate::time::{TimeDriver, TimerHandle};

/// 工厂整体生命周期。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FactoryState {
    /// 正常工作。
    Active,
    /// 不再接纳新连接，已有连接保持打开。
    Shutdown,
    /// 全部连接已强制关闭。
    Closed,
}

/// 出站角色状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting,
    Connected,
    ReconnectWait,
}

/// 监听角色状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Listening,
    Closed,
}

/// 准入拒绝原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RefuseReason {
    /// 命中黑名单。
    Denied,
    /// 白名单生效且地址不在其中。
    NotAllowed,
    /// 全局或单地址配额溢出。
    Overflow,
}

impl RefuseReason {
    /// 拒绝详情文本。
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Denied => "denied",
            Self::NotAllowed => "not allowed",
            Self::Overflow => "overflow",
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Denied => codes::REFUSED_DENIED,
            Self::NotAllowed => codes::REFUSED_NOT_ALLOWED,
            Self::Overflow => codes::REFUSED_OVERFLOW,
        }
    }
}

impl fmt::Display for RefuseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `client_ip_refuse` 事件载荷。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Refusal {
    /// 对端地址；非 IP 传输时缺失。
    pub address: Option<String>,
    pub reason: RefuseReason,
}

impl Refusal {
    fn to_error(&self) -> SocketError {
        let address = self.address.as_deref().unwrap_or("<unknown>");
        SocketError::new(
            self.reason.code(),
            format!("connection from {address} refused: {}", self.reason),
        )
    }
}

/// `connect` / `disconnect` 事件载荷。
#[derive(Clone, Debug)]
pub struct Connection {
    pub client: Client,
    /// `true` 表示由监听器接受，`false` 表示出站连接。
    pub server_side: bool,
}

/// 工厂对外的事件通道，均不缓存。
///
/// 每个分类错误事件触发时，`error` 都会同步收到一份带来源事件名的 [`FactoryError`]。
pub struct FactoryEvents {
    pub connect: EventChannel<Connection>,
    pub disconnect: EventChannel<Connection>,
    pub client_init_error: EventChannel<SocketError>,
    pub client_connect_error: EventChannel<SocketError>,
    pub server_init_error: EventChannel<SocketError>,
    pub server_listen_error: EventChannel<SocketError>,
    pub client_ip_refuse: EventChannel<Refusal>,
    pub error: EventChannel<FactoryError>,
}

impl FactoryEvents {
    fn new() -> Self {
        Self {
            connect: EventChannel::new(false),
            disconnect: EventChannel::new(false),
            client_init_error: EventChannel::new(false),
            client_connect_error: EventChannel::new(false),
            server_init_error: EventChannel::new(false),
            server_listen_error: EventChannel::new(false),
            client_ip_refuse: EventChannel::new(false),
            error: EventChannel::new(false),
        }
    }

    fn categorized(&self, kind: FactoryErrorKind) -> Option<&EventChannel<SocketError>> {
        match kind {
            FactoryErrorKind::ClientInit => Some(&self.client_init_error),
            FactoryErrorKind::ClientConnect => Some(&self.client_connect_error),
            FactoryErrorKind::ServerInit => Some(&self.server_init_error),
            FactoryErrorKind::ServerListen => Some(&self.server_listen_error),
            FactoryErrorKind::Client | FactoryErrorKind::ClientIpRefuse => None,
        }
    }
}

impl fmt::Debug for FactoryEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryEvents")
            .field("connect", &self.connect.handler_count())
            .field("disconnect", &self.disconnect.handler_count())
            .field("error", &self.error.handler_count())
            .finish_non_exhaustive()
    }
}

struct FactoryInner {
    config: SocketFactoryConfig,
    registry: TransportRegistry,
    time: Rc<dyn TimeDriver>,
    stats: QuotaStats,
    state: Cell<FactoryState>,
    client_state: Cell<ClientState>,
    server_state: Cell<ServerState>,
    client: RefCell<Option<Client>>,
    server: RefCell<Option<Server>>,
    connections: RefCell<Vec<Client>>,
    reconnect: RefCell<Option<TimerHandle>>,
    events: FactoryEvents,
}

/// 出站连接的提交状态，由该连接的各个事件处理器共享。
#[derive(Default)]
struct OutboundSlot {
    lease: RefCell<Option<QuotaLease>>,
    committed: Cell<bool>,
}

/// 连接工厂句柄。克隆共享同一工厂。
#[derive(Clone)]
pub struct SocketFactory {
    inner: Rc<FactoryInner>,
}

impl SocketFactory {
    /// 使用独立的配额计数表构造工厂。
    pub fn new(config: SocketFactoryConfig, registry: TransportRegistry, time: Rc<dyn TimeDriver>) -> Self {
        Self::with_stats(config, registry, time, QuotaStats::new())
    }

    /// 使用共享的配额计数表构造工厂。
    pub fn with_stats(
        config: SocketFactoryConfig,
        registry: TransportRegistry,
        time: Rc<dyn TimeDriver>,
        stats: QuotaStats,
    ) -> Self {
        Self {
            inner: Rc::new(FactoryInner {
                config,
                registry,
                time,
                stats,
                state: Cell::new(FactoryState::Active),
                client_state: Cell::new(ClientState::Idle),
                server_state: Cell::new(ServerState::Idle),
                client: RefCell::new(None),
                server: RefCell::new(None),
                connections: RefCell::new(Vec::new()),
                reconnect: RefCell::new(None),
                events: FactoryEvents::new(),
            }),
        }
    }

    fn downgrade(&self) -> Weak<FactoryInner> {
        Rc::downgrade(&self.inner)
    }

    fn upgrade(weak: &Weak<FactoryInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// 按配置打开监听器并发起出站连接。幂等。
    pub fn init(&self) {
        if self.inner.state.get() != FactoryState::Active {
            trace!("init ignored: factory is not active");
            return;
        }
        if self.inner.config.server.is_some() {
            self.open_server();
        }
        if self.inner.config.client.is_some() {
            self.connect_client();
        }
    }

    /// 打开监听器；已在监听、已关闭或工厂不再活跃时为空操作。
    pub fn open_server(&self) {
        let inner = &self.inner;
        if inner.state.get() != FactoryState::Active || inner.server_state.get() != ServerState::Idle {
            return;
        }
        let Some(config) = &inner.config.server else {
            return;
        };

        let transport = match inner.registry.create_server(config.kind, &config.options) {
            Ok(transport) => transport,
            Err(error) => {
                self.report(FactoryErrorKind::ServerInit, error);
                return;
            }
        };
        let server = Server::new(transport, config.options.clone());
        if let Err(error) = server.listen() {
            self.report(FactoryErrorKind::ServerListen, error);
            return;
        }

        let weak = self.downgrade();
        server.on_connection(move |client| {
            match Self::upgrade(&weak) {
                Some(factory) => factory.admit(client),
                None => client.close(),
            }
        });
        let weak = self.downgrade();
        server.on_error(move |error| {
            if let Some(factory) = Self::upgrade(&weak) {
                factory.report(FactoryErrorKind::ServerListen, error);
            }
        });
        let weak = self.downgrade();
        server.on_close(move |()| {
            if let Some(factory) = Self::upgrade(&weak) {
                factory.inner.server_state.set(ServerState::Closed);
            }
        });

        info!(
            kind = %config.kind,
            host = config.options.endpoint.host_or_default(),
            port = ?server.local_port(),
            "socket factory listening"
        );
        inner.server_state.set(ServerState::Listening);
        *inner.server.borrow_mut() = Some(server);
    }

    fn admit(&self, client: Client) {
        let inner = &self.inner;
        if inner.state.get() != FactoryState::Active {
            trace!(conn = %client.id(), "late accept on inactive factory");
            client.close();
            return;
        }
        let address = client.remote_address();
        let reason = inner.config.server.as_ref().and_then(|config| match address.as_deref() {
            Some(address) if config.is_denied(address) => Some(RefuseReason::Denied),
            Some(address) if config.is_not_allowed(address) => Some(RefuseReason::NotAllowed),
            address if inner.stats.would_overflow(address, &inner.config.limits) => {
                Some(RefuseReason::Overflow)
            }
            _ => None,
        });
        if let Some(reason) = reason {
            self.refuse(client, Refusal { address, reason });
            return;
        }

        let lease = RefCell::new(Some(inner.stats.admit(address.as_deref())));
        inner.connections.borrow_mut().push(client.clone());

        let weak = self.downgrade();
        let handle = client.downgrade();
        let id = client.id();
        client.on_close(move |_| {
            drop(lease.borrow_mut().take());
            let Some(factory) = Self::upgrade(&weak) else {
                return;
            };
            factory
                .inner
                .connections
                .borrow_mut()
                .retain(|entry| entry.id() != id);
            debug!(conn = %id, "accepted connection closed");
            if let Some(client) = handle.upgrade() {
                factory.inner.events.disconnect.emit(Connection {
                    client,
                    server_side: true,
                });
            }
        });

        debug!(conn = %id, address = ?address, "accepted connection admitted");
        inner.events.connect.emit(Connection {
            client,
            server_side: true,
        });
    }

    fn refuse(&self, client: Client, refusal: Refusal) {
        info!(
            conn = %client.id(),
            address = ?refusal.address,
            reason = %refusal.reason,
            "refusing connection"
        );
        client.close();
        let error = refusal.to_error();
        self.inner.events.client_ip_refuse.emit(refusal);
        self.inner.events.error.emit(FactoryError {
            kind: FactoryErrorKind::ClientIpRefuse,
            error,
        });
    }

    /// 发起出站连接。
    ///
    /// 已在连接或已连接时为空操作；处于重连等待时取消待执行的重连并立即尝试。
    pub fn connect_client(&self) {
        let inner = &self.inner;
        if inner.state.get() != FactoryState::Active {
            return;
        }
        match inner.client_state.get() {
            ClientState::Connecting | ClientState::Connected => return,
            ClientState::ReconnectWait => self.cancel_reconnect(),
            ClientState::Idle => {}
        }
        let Some(config) = &inner.config.client else {
            return;
        };

        let host = config.options.host_or_default().to_owned();
        if inner.stats.would_overflow(Some(&host), &inner.config.limits) {
            debug!(host = %host, "outbound connection would overflow quota");
            self.schedule_reconnect();
            return;
        }

        let transport = match inner.registry.create_client(config.kind, &config.options) {
            Ok(transport) => transport,
            Err(error) => {
                self.report(FactoryErrorKind::ClientInit, error);
                return;
            }
        };
        let client = Client::new(transport, config.options.clone());
        let slot = Rc::new(OutboundSlot::default());

        let weak = self.downgrade();
        let handle = client.downgrade();
        let on_connect = Rc::clone(&slot);
        client.on_connect(move |()| {
            if let (Some(factory), Some(client)) = (Self::upgrade(&weak), handle.upgrade()) {
                factory.commit_outbound(client, &on_connect);
            }
        });
        let weak = self.downgrade();
        let on_error = Rc::clone(&slot);
        client.on_error(move |error| {
            if let Some(factory) = Self::upgrade(&weak) {
                let kind = if on_error.committed.get() {
                    FactoryErrorKind::Client
                } else {
                    FactoryErrorKind::ClientConnect
                };
                factory.report(kind, error);
            }
        });
        let weak = self.downgrade();
        let handle = client.downgrade();
        let on_close = Rc::clone(&slot);
        let close_id = client.on_close(move |had_error| {
            drop(on_close.lease.borrow_mut().take());
            let Some(factory) = Self::upgrade(&weak) else {
                return;
            };
            factory.outbound_closed(&handle, on_close.committed.get(), had_error);
        });

        inner.client_state.set(ClientState::Connecting);
        *inner.client.borrow_mut() = Some(client.clone());
        debug!(conn = %client.id(), kind = %config.kind, host = %host, "connecting outbound client");

        if let Err(error) = client.connect() {
            client.off_close(close_id);
            client.close();
            inner.client.borrow_mut().take();
            inner.client_state.set(ClientState::Idle);
            self.report(FactoryErrorKind::ClientInit, error);
        }
    }

    fn commit_outbound(&self, client: Client, slot: &OutboundSlot) {
        let inner = &self.inner;
        if inner.state.get() == FactoryState::Closed {
            client.close();
            return;
        }
        let host = client.options().host_or_default().to_owned();
        if inner.stats.would_overflow(Some(&host), &inner.config.limits) {
            debug!(conn = %client.id(), host = %host, "outbound connection overflows quota after connect");
            client.close();
            return;
        }
        *slot.lease.borrow_mut() = Some(inner.stats.admit(Some(&host)));
        slot.committed.set(true);
        inner.client_state.set(ClientState::Connected);
        debug!(conn = %client.id(), host = %host, "outbound connection committed");
        inner.events.connect.emit(Connection {
            client,
            server_side: false,
        });
    }

    fn outbound_closed(&self, handle: &WeakClient, committed: bool, had_error: bool) {
        let inner = &self.inner;
        let client = handle.upgrade();
        if let Some(client) = &client {
            debug!(conn = %client.id(), committed, had_error, "outbound connection closed");
            let active = inner
                .client
                .borrow()
                .as_ref()
                .is_some_and(|active| active.id() == client.id());
            if active {
                inner.client.borrow_mut().take();
                inner.client_state.set(ClientState::Idle);
            }
        }
        if committed && let Some(client) = client {
            inner.events.disconnect.emit(Connection {
                client,
                server_side: false,
            });
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&self) {
        let inner = &self.inner;
        if inner.state.get() != FactoryState::Active {
            return;
        }
        let Some(delay) = inner.config.client.as_ref().and_then(|config| config.reconnect_delay()) else {
            trace!("reconnect disabled");
            return;
        };
        if self.reconnect_pending() {
            return;
        }
        if inner.client_state.get() != ClientState::Idle {
            return;
        }

        let weak = self.downgrade();
        let handle = inner.time.schedule(
            delay,
            Box::new(move || {
                if let Some(factory) = Self::upgrade(&weak) {
                    factory.inner.reconnect.borrow_mut().take();
                    factory.inner.client_state.set(ClientState::Idle);
                    factory.connect_client();
                }
            }),
        );
        inner.client_state.set(ClientState::ReconnectWait);
        *inner.reconnect.borrow_mut() = Some(handle);
        debug!(?delay, "outbound reconnect scheduled");
    }

    fn cancel_reconnect(&self) {
        let timer = self.inner.reconnect.borrow_mut().take();
        if let Some(timer) = timer {
            timer.cancel();
            debug!("outbound reconnect cancelled");
        }
        if self.inner.client_state.get() == ClientState::ReconnectWait {
            self.inner.client_state.set(ClientState::Idle);
        }
    }

    fn report(&self, kind: FactoryErrorKind, error: SocketError) {
        match kind {
            FactoryErrorKind::Client | FactoryErrorKind::ClientConnect => {
                debug!(event = kind.as_str(), %error, "socket factory error");
            }
            _ => warn!(event = kind.as_str(), %error, "socket factory error"),
        }
        if let Some(channel) = self.inner.events.categorized(kind) {
            channel.emit(error.clone());
        }
        self.inner.events.error.emit(FactoryError { kind, error });
    }

    /// 停止监听与后续出站尝试，已有连接保持打开。幂等。
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.state.get() != FactoryState::Active {
            return;
        }
        inner.state.set(FactoryState::Shutdown);
        self.cancel_reconnect();
        let server = inner.server.borrow().clone();
        if let Some(server) = server {
            server.close(false);
        }
        inner.server_state.set(ServerState::Closed);
        info!("socket factory shut down");
    }

    /// 关闭监听器并强制关闭全部连接。终态，幂等。
    pub fn close(&self) {
        let inner = &self.inner;
        if inner.state.get() == FactoryState::Closed {
            return;
        }
        self.shutdown();
        inner.state.set(FactoryState::Closed);

        let connections = std::mem::take(&mut *inner.connections.borrow_mut());
        for client in connections {
            client.close();
        }
        let server = inner.server.borrow().clone();
        if let Some(server) = server {
            server.close(true);
        }
        let client = inner.client.borrow_mut().take();
        if let Some(client) = client {
            client.close();
        }
        inner.client_state.set(ClientState::Idle);
        info!("socket factory closed");
    }

    /// 事件通道。
    pub fn events(&self) -> &FactoryEvents {
        &self.inner.events
    }

    /// 工厂生命周期状态。
    pub fn state(&self) -> FactoryState {
        self.inner.state.get()
    }

    /// 出站角色状态。
    pub fn client_state(&self) -> ClientState {
        self.inner.client_state.get()
    }

    /// 监听角色状态。
    pub fn server_state(&self) -> ServerState {
        self.inner.server_state.get()
    }

    /// 当前出站连接。
    pub fn client(&self) -> Option<Client> {
        self.inner.client.borrow().clone()
    }

    /// 监听器。
    pub fn server(&self) -> Option<Server> {
        self.inner.server.borrow().clone()
    }

    /// 已准入的入站连接（快照）。
    pub fn connections(&self) -> Vec<Client> {
        self.inner.connections.borrow().clone()
    }

    /// 配额计数表。
    pub fn stats(&self) -> &QuotaStats {
        &self.inner.stats
    }

    /// 是否有待执行的重连。
    pub fn reconnect_pending(&self) -> bool {
        self.inner
            .reconnect
            .borrow()
            .as_ref()
            .is_some_and(TimerHandle::is_pending)
    }

    /// 工厂配置。
    pub fn config(&self) -> &SocketFactoryConfig {
        &self.inner.config
    }
}

impl fmt::Debug for SocketFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketFactory")
            .field("state", &self.state())
            .field("client_state", &self.client_state())
            .field("server_state", &self.server_state())
            .field("connections", &self.inner.connections.borrow().len())
            .field("stats", &self.inner.stats)
            .finish()
    }
}
