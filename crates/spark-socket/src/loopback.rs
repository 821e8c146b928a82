//! 进程内回环传输：不触碰网络即可驱动 Client/Server/SocketFactory 的完整契约。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 作为测试替身，让事件缓存、准入控制与重连逻辑在确定性环境下被验证；
//! - 遵守与真实传输完全相同的钩子契约，不为测试开后门。
//!
//! ## 结构（How）
//! - [`LoopbackLink`]：一条链路对象同时持有两个端点的状态，端点只引用链路并以下标区分，
//!   不存在“端点互指”的引用环；
//! - [`LoopbackNetwork`]：以 `host:port` 为键的内存地址空间，提供监听器与拨号器，
//!   连接建立与可选的消息时延都经由 [`TimeDriver`] 调度。
//!
//! ## 契约（What）
//! - 每个方向 FIFO；带时延时每条消息独立调度，到期时取对应方向队首投递；
//! - 关闭任一端点会同步标记整条链路关闭，两端各收到一次 `closed(false)`；
//! - 端点在挂钩前收到的数据暂存于收件箱，挂钩时按序补发。

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::client::{Client, ClientHooks, ClientTransport};
use crate::config::{EndpointOptions, ServerOptions, TransportKind};
use crate::error::{SocketError, codes};
use crate::registry::TransportRegistry;
use crate::server::{ServerHooks, ServerTransport};
use crate::time::{TimeDriver, TimerHandle};

#[derive(Default)]
struct EndState {
    hooks: Option<ClientHooks>,
    inbox: VecDeque<Bytes>,
    in_flight: VecDeque<Bytes>,
    address: Option<String>,
    port: Option<u16>,
}

struct LinkShared {
    ends: RefCell<[EndState; 2]>,
    closed: Cell<bool>,
    latency: Option<(Rc<dyn TimeDriver>, Duration)>,
}

/// 一条双端内存链路。克隆共享同一链路。
#[derive(Clone)]
pub struct LoopbackLink {
    shared: Rc<LinkShared>,
}

impl Default for LoopbackLink {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackLink {
    /// 无时延链路：`send` 同步投递到对端。
    pub fn new() -> Self {
        Self::build(None)
    }

    /// 每条消息经过 `latency` 后投递。
    pub fn with_latency(time: Rc<dyn TimeDriver>, latency: Duration) -> Self {
        Self::build(Some((time, latency)))
    }

    fn build(latency: Option<(Rc<dyn TimeDriver>, Duration)>) -> Self {
        Self {
            shared: Rc::new(LinkShared {
                ends: RefCell::new([EndState::default(), EndState::default()]),
                closed: Cell::new(false),
                latency,
            }),
        }
    }

    /// 为某一端设置地址与端口，对端的 `remote_*` 查询随之可见。
    pub fn set_address(&self, index: usize, address: impl Into<String>, port: Option<u16>) {
        let mut ends = self.shared.ends.borrow_mut();
        let end = &mut ends[index & 1];
        end.address = Some(address.into());
        end.port = port;
    }

    /// 取出两个端点的传输句柄。
    pub fn endpoints(&self) -> (LoopbackEndpoint, LoopbackEndpoint) {
        (
            LoopbackEndpoint {
                link: self.clone(),
                index: 0,
            },
            LoopbackEndpoint {
                link: self.clone(),
                index: 1,
            },
        )
    }

    /// 构造一对已连接的 [`Client`]，使用默认端点参数。
    pub fn pair(&self) -> (Client, Client) {
        let (left, right) = self.endpoints();
        (
            Client::accepted(Box::new(left), EndpointOptions::default()),
            Client::accepted(Box::new(right), EndpointOptions::default()),
        )
    }

    /// 链路是否已关闭。
    pub fn is_closed(&self) -> bool {
        self.shared.closed.get()
    }

    /// 尚未投递的在途消息数（两个方向合计）。
    pub fn in_flight(&self) -> usize {
        self.shared
            .ends
            .borrow()
            .iter()
            .map(|end| end.in_flight.len())
            .sum()
    }
}

impl fmt::Debug for LoopbackLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackLink")
            .field("closed", &self.shared.closed.get())
            .field("latency", &self.shared.latency.as_ref().map(|(_, latency)| *latency))
            .finish()
    }
}

fn deliver(shared: &LinkShared, index: usize, data: Bytes) {
    if shared.closed.get() {
        return;
    }
    let hooks = {
        let mut ends = shared.ends.borrow_mut();
        let end = &mut ends[index];
        match &end.hooks {
            Some(hooks) => hooks.clone(),
            None => {
                end.inbox.push_back(data);
                return;
            }
        }
    };
    hooks.data(data);
}

fn deliver_next(shared: &Weak<LinkShared>, index: usize) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let next = shared.ends.borrow_mut()[index].in_flight.pop_front();
    if let Some(data) = next {
        deliver(&shared, index, data);
    }
}

/// 链路的一端，实现 [`ClientTransport`]。
#[derive(Debug)]
pub struct LoopbackEndpoint {
    link: LoopbackLink,
    index: usize,
}

impl LoopbackEndpoint {
    fn peer(&self) -> usize {
        1 - self.index
    }
}

impl ClientTransport for LoopbackEndpoint {
    fn hook(&self, hooks: ClientHooks) {
        let shared = &self.link.shared;
        let backlog: Vec<Bytes> = {
            let mut ends = shared.ends.borrow_mut();
            let end = &mut ends[self.index];
            end.hooks = Some(hooks.clone());
            end.inbox.drain(..).collect()
        };
        for data in backlog {
            hooks.data(data);
        }
        if shared.closed.get() {
            hooks.closed(false);
        }
    }

    fn connect(&self) -> Result<(), SocketError> {
        if self.link.is_closed() {
            return Err(SocketError::closed("loopback link is closed"));
        }
        let hooks = self.link.shared.ends.borrow()[self.index].hooks.clone();
        if let Some(hooks) = hooks {
            hooks.connected();
        }
        Ok(())
    }

    fn send(&self, data: Bytes) {
        let shared = &self.link.shared;
        if shared.closed.get() {
            return;
        }
        let peer = self.peer();
        match &shared.latency {
            None => deliver(shared, peer, data),
            Some((time, latency)) => {
                shared.ends.borrow_mut()[peer].in_flight.push_back(data);
                let weak = Rc::downgrade(shared);
                time.schedule(*latency, Box::new(move || deliver_next(&weak, peer)));
            }
        }
    }

    fn close(&self) {
        let shared = &self.link.shared;
        if shared.closed.replace(true) {
            return;
        }
        let (own, peer) = {
            let mut ends = shared.ends.borrow_mut();
            for end in ends.iter_mut() {
                end.in_flight.clear();
            }
            (ends[self.index].hooks.clone(), ends[self.peer()].hooks.clone())
        };
        for hooks in [own, peer].into_iter().flatten() {
            hooks.closed(false);
        }
    }

    fn local_address(&self) -> Option<String> {
        self.link.shared.ends.borrow()[self.index].address.clone()
    }

    fn remote_address(&self) -> Option<String> {
        self.link.shared.ends.borrow()[self.peer()].address.clone()
    }

    fn local_port(&self) -> Option<u16> {
        self.link.shared.ends.borrow()[self.index].port
    }

    fn remote_port(&self) -> Option<u16> {
        self.link.shared.ends.borrow()[self.peer()].port
    }
}

/// 默认拨号源地址。
pub const DEFAULT_SOURCE_ADDRESS: &str = "127.0.0.1";

const FIRST_EPHEMERAL_PORT: u16 = 49152;

struct NetworkState {
    listeners: HashMap<String, ServerHooks>,
    next_port: u16,
}

/// 内存地址空间。克隆共享同一地址空间。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - 监听键为 `host:port`，重复监听返回 `spark.socket.address_in_use`；监听端口 0 时分配临时端口；
/// - 拨号在时间驱动器上以零延迟异步解析：目标无监听者时依次上报
///   `connection_refused` 错误与 `closed(true)`；成功时先通知拨号端 `connected`，再把另一端移交监听器；
/// - 监听端看到的对端地址即拨号时给定的源地址，准入测试借此模拟不同来源。
#[derive(Clone)]
pub struct LoopbackNetwork {
    time: Rc<dyn TimeDriver>,
    latency: Option<Duration>,
    state: Rc<RefCell<NetworkState>>,
}

impl LoopbackNetwork {
    /// 创建空地址空间。
    pub fn new(time: Rc<dyn TimeDriver>) -> Self {
        Self {
            time,
            latency: None,
            state: Rc::new(RefCell::new(NetworkState {
                listeners: HashMap::new(),
                next_port: FIRST_EPHEMERAL_PORT,
            })),
        }
    }

    /// 之后建立的链路都带有消息时延。
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// 构造监听器。
    pub fn listener(&self, options: &ServerOptions) -> LoopbackListener {
        LoopbackListener {
            network: self.clone(),
            host: options.endpoint.host_or_default().to_owned(),
            port: Cell::new(options.endpoint.port),
            key: RefCell::new(None),
            hooks: RefCell::new(None),
            closed: Cell::new(false),
        }
    }

    /// 以默认源地址构造拨号器。
    pub fn connector(&self, options: &EndpointOptions) -> LoopbackConnector {
        self.connector_from(DEFAULT_SOURCE_ADDRESS, options)
    }

    /// 以指定源地址构造拨号器。
    pub fn connector_from(&self, source: impl Into<String>, options: &EndpointOptions) -> LoopbackConnector {
        LoopbackConnector {
            shared: Rc::new(ConnectorShared {
                network: self.clone(),
                source: source.into(),
                host: options.host_or_default().to_owned(),
                port: options.port,
                hooks: RefCell::new(None),
                endpoint: RefCell::new(None),
                outbox: RefCell::new(Vec::new()),
                timer: RefCell::new(None),
                started: Cell::new(false),
                closed: Cell::new(false),
            }),
        }
    }

    /// 从 `source` 拨号并返回正在连接的 [`Client`]。
    pub fn dial(&self, source: impl Into<String>, options: EndpointOptions) -> Client {
        let connector = self.connector_from(source, &options);
        let client = Client::new(Box::new(connector), options);
        if let Err(error) = client.connect() {
            debug!(%error, "loopback dial failed");
        }
        client
    }

    /// 为两种角色登记 [`TransportKind::Loopback`]。
    pub fn registry(&self) -> TransportRegistry {
        let clients = self.clone();
        let servers = self.clone();
        TransportRegistry::new()
            .with_client(TransportKind::Loopback, move |options| {
                Ok(Box::new(clients.connector(options)) as Box<dyn ClientTransport>)
            })
            .with_server(TransportKind::Loopback, move |options| {
                Ok(Box::new(servers.listener(options)) as Box<dyn ServerTransport>)
            })
    }

    /// `host:port` 上是否有监听者。
    pub fn is_listening(&self, host: &str, port: u16) -> bool {
        self.state.borrow().listeners.contains_key(&endpoint_key(host, port))
    }

    fn link(&self) -> LoopbackLink {
        match self.latency {
            Some(latency) => LoopbackLink::with_latency(Rc::clone(&self.time), latency),
            None => LoopbackLink::new(),
        }
    }

    fn allocate_port(&self) -> u16 {
        let mut state = self.state.borrow_mut();
        let port = state.next_port;
        state.next_port = state.next_port.checked_add(1).unwrap_or(FIRST_EPHEMERAL_PORT);
        port
    }
}

impl fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        let mut listeners: Vec<_> = state.listeners.keys().collect();
        listeners.sort_unstable();
        f.debug_struct("LoopbackNetwork")
            .field("listeners", &listeners)
            .field("latency", &self.latency)
            .finish()
    }
}

fn endpoint_key(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}

/// 回环监听器。
pub struct LoopbackListener {
    network: LoopbackNetwork,
    host: String,
    port: Cell<u16>,
    key: RefCell<Option<String>>,
    hooks: RefCell<Option<ServerHooks>>,
    closed: Cell<bool>,
}

impl ServerTransport for LoopbackListener {
    fn hook(&self, hooks: ServerHooks) {
        *self.hooks.borrow_mut() = Some(hooks);
    }

    fn listen(&self) -> Result<(), SocketError> {
        if self.closed.get() {
            return Err(SocketError::closed("loopback listener is closed"));
        }
        if self.key.borrow().is_some() {
            return Ok(());
        }
        let hooks = self
            .hooks
            .borrow()
            .clone()
            .ok_or_else(|| SocketError::new(codes::LISTEN_FAILED, "listener is not hooked"))?;
        if self.port.get() == 0 {
            self.port.set(self.network.allocate_port());
        }
        let key = endpoint_key(&self.host, self.port.get());
        {
            let mut state = self.network.state.borrow_mut();
            if state.listeners.contains_key(&key) {
                return Err(SocketError::new(
                    codes::ADDRESS_IN_USE,
                    format!("{key} is already in use"),
                ));
            }
            state.listeners.insert(key.clone(), hooks);
        }
        debug!(address = %key, "loopback listener bound");
        *self.key.borrow_mut() = Some(key);
        Ok(())
    }

    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        if let Some(key) = self.key.borrow_mut().take() {
            self.network.state.borrow_mut().listeners.remove(&key);
        }
        let hooks = self.hooks.borrow().clone();
        if let Some(hooks) = hooks {
            hooks.closed();
        }
    }

    fn local_address(&self) -> Option<String> {
        Some(self.host.clone())
    }

    fn local_port(&self) -> Option<u16> {
        Some(self.port.get())
    }
}

impl fmt::Debug for LoopbackListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackListener")
            .field("host", &self.host)
            .field("port", &self.port.get())
            .field("closed", &self.closed.get())
            .finish()
    }
}

struct ConnectorShared {
    network: LoopbackNetwork,
    source: String,
    host: String,
    port: u16,
    hooks: RefCell<Option<ClientHooks>>,
    endpoint: RefCell<Option<Rc<LoopbackEndpoint>>>,
    outbox: RefCell<Vec<Bytes>>,
    timer: RefCell<Option<TimerHandle>>,
    started: Cell<bool>,
    closed: Cell<bool>,
}

impl ConnectorShared {
    fn hooks(&self) -> Option<ClientHooks> {
        self.hooks.borrow().clone()
    }

    fn endpoint(&self) -> Option<Rc<LoopbackEndpoint>> {
        self.endpoint.borrow().clone()
    }

    fn resolve(&self) {
        self.timer.borrow_mut().take();
        if self.closed.get() {
            return;
        }
        let Some(hooks) = self.hooks() else {
            return;
        };
        let key = endpoint_key(&self.host, self.port);
        let listener = self.network.state.borrow().listeners.get(&key).cloned();
        let Some(listener) = listener else {
            trace!(target = %key, source = %self.source, "loopback connection refused");
            self.closed.set(true);
            hooks.error(SocketError::new(
                codes::CONNECTION_REFUSED,
                format!("no loopback listener at {key}"),
            ));
            hooks.closed(true);
            return;
        };

        let link = self.network.link();
        link.set_address(0, self.source.clone(), Some(self.network.allocate_port()));
        link.set_address(1, self.host.clone(), Some(self.port));
        let (near, far) = link.endpoints();
        near.hook(hooks.clone());
        let near = Rc::new(near);
        *self.endpoint.borrow_mut() = Some(Rc::clone(&near));

        hooks.connected();
        let queued = std::mem::take(&mut *self.outbox.borrow_mut());
        for data in queued {
            near.send(data);
        }
        listener.connection(Box::new(far));
    }
}

/// 回环拨号器，实现 [`ClientTransport`]。
pub struct LoopbackConnector {
    shared: Rc<ConnectorShared>,
}

impl ClientTransport for LoopbackConnector {
    fn hook(&self, hooks: ClientHooks) {
        *self.shared.hooks.borrow_mut() = Some(hooks);
    }

    fn connect(&self) -> Result<(), SocketError> {
        if self.shared.closed.get() {
            return Err(SocketError::closed("loopback connector is closed"));
        }
        if self.shared.started.replace(true) {
            return Err(SocketError::new(
                codes::CONNECT_FAILED,
                "loopback connector was already started",
            ));
        }
        let weak = Rc::downgrade(&self.shared);
        let handle = self.shared.network.time.schedule(
            Duration::ZERO,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.resolve();
                }
            }),
        );
        *self.shared.timer.borrow_mut() = Some(handle);
        Ok(())
    }

    fn send(&self, data: Bytes) {
        match self.shared.endpoint() {
            Some(endpoint) => endpoint.send(data),
            None => self.shared.outbox.borrow_mut().push(data),
        }
    }

    fn close(&self) {
        if let Some(endpoint) = self.shared.endpoint() {
            endpoint.close();
            return;
        }
        if self.shared.closed.replace(true) {
            return;
        }
        let timer = self.shared.timer.borrow_mut().take();
        if let Some(timer) = timer {
            timer.cancel();
        }
        self.shared.outbox.borrow_mut().clear();
        if let Some(hooks) = self.shared.hooks() {
            hooks.closed(false);
        }
    }

    fn local_address(&self) -> Option<String> {
        Some(self.shared.source.clone())
    }

    fn remote_address(&self) -> Option<String> {
        Some(self.shared.host.clone())
    }

    fn local_port(&self) -> Option<u16> {
        self.shared.endpoint().and_then(|endpoint| endpoint.local_port())
    }

    fn remote_port(&self) -> Option<u16> {
        Some(self.shared.port)
    }
}

impl fmt::Debug for LoopbackConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackConnector")
            .field("source", &self.shared.source)
            .field("host", &self.shared.host)
            .field("port", &self.shared.port)
            .field("closed", &self.shared.closed.get())
            .finish()
    }
}
