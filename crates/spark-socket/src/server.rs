use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, trace};

use crate::client::{Client, ClientTransport};
use crate::config::ServerOptions;
use crate::error::SocketError;
use crate::event::{EventChannel, HandlerId};

/// 监听器契约。
///
/// # 教案级注释
///
/// ## 契约说明（What）
/// - `hook`：在构造 [`Server`] 时调用一次；
/// - `listen`：开始监听。同步可判定的失败返回 `Err`，运行期故障经由 `hooks.error(..)` 上报；
/// - 每个被接受的连接通过 `hooks.connection(transport)` 移交所有权，传输句柄此时已连接，
///   不会再被调用 `connect`；
/// - `close`：停止监听，随后调用一次 `hooks.closed()`。已接受的连接不受影响。
pub trait ServerTransport {
    /// 绑定事件钩子。
    fn hook(&self, hooks: ServerHooks);

    /// 开始监听。
    fn listen(&self) -> Result<(), SocketError>;

    /// 停止监听。
    fn close(&self);

    /// 实际监听地址。
    fn local_address(&self) -> Option<String> {
        None
    }

    /// 实际监听端口（绑定端口 0 时由系统分配）。
    fn local_port(&self) -> Option<u16> {
        None
    }
}

struct ServerInner {
    options: ServerOptions,
    transport: Box<dyn ServerTransport>,
    closed: Cell<bool>,
    close_emitted: Cell<bool>,
    clients: RefCell<Vec<Client>>,
    connection: EventChannel<Client>,
    error: EventChannel<SocketError>,
    close: EventChannel<()>,
}

/// 监听端与其已接受连接的登记表。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - Server 拥有（而非仅引用）已接受的 [`Client`]，关闭时负责连带关闭它们；
/// - 连接自身关闭时从登记表移除，登记表始终只包含存活连接。
///
/// ## 执行逻辑（How）
/// 每次接受按固定顺序处理：包装为 `Client` → 登记 → 挂载“关闭即移除”处理器 → 触发 `connection`。
/// 移除处理器必须先于任何可能导致关闭的用户回调挂载，否则会残留过期条目。
///
/// ## 风险提示（Trade-offs）
/// - 关闭后迟到的接受会被立即关闭且不登记，也不触发 `connection`；
/// - 三个事件通道均不缓存：无人订阅时的 `connection` 事件直接丢弃，连接仍留在登记表中。
#[derive(Clone)]
pub struct Server {
    inner: Rc<ServerInner>,
}

impl Server {
    /// 包装监听器并绑定钩子。
    pub fn new(transport: Box<dyn ServerTransport>, options: ServerOptions) -> Self {
        let server = Self {
            inner: Rc::new(ServerInner {
                options,
                transport,
                closed: Cell::new(false),
                close_emitted: Cell::new(false),
                clients: RefCell::new(Vec::new()),
                connection: EventChannel::new(false),
                error: EventChannel::new(false),
                close: EventChannel::new(false),
            }),
        };
        server.inner.transport.hook(ServerHooks {
            inner: Rc::downgrade(&server.inner),
        });
        server
    }

    /// 开始监听。
    pub fn listen(&self) -> Result<(), SocketError> {
        if self.inner.closed.get() {
            return Err(SocketError::closed("server is closed"));
        }
        self.inner.transport.listen()
    }

    /// 关闭监听器；`close_clients` 为真时同时清空登记表并关闭每个已登记连接。幂等。
    pub fn close(&self, close_clients: bool) {
        if !self.inner.closed.replace(true) {
            debug!(close_clients, "closing server");
            self.inner.transport.close();
        }
        if close_clients {
            let clients = std::mem::take(&mut *self.inner.clients.borrow_mut());
            for client in clients {
                client.close();
            }
        }
    }

    /// 订阅新连接事件。
    pub fn on_connection(&self, handler: impl Fn(Client) + 'static) -> HandlerId {
        self.inner.connection.attach(handler)
    }

    /// 取消订阅新连接事件。
    pub fn off_connection(&self, id: HandlerId) {
        self.inner.connection.detach(id);
    }

    /// 订阅错误事件。
    pub fn on_error(&self, handler: impl Fn(SocketError) + 'static) -> HandlerId {
        self.inner.error.attach(handler)
    }

    /// 取消订阅错误事件。
    pub fn off_error(&self, id: HandlerId) {
        self.inner.error.detach(id);
    }

    /// 订阅关闭事件。
    pub fn on_close(&self, handler: impl Fn(()) + 'static) -> HandlerId {
        self.inner.close.attach(handler)
    }

    /// 取消订阅关闭事件。
    pub fn off_close(&self, id: HandlerId) {
        self.inner.close.detach(id);
    }

    /// 当前登记的存活连接（快照）。
    pub fn clients(&self) -> Vec<Client> {
        self.inner.clients.borrow().clone()
    }

    /// 当前登记的连接数。
    pub fn client_count(&self) -> usize {
        self.inner.clients.borrow().len()
    }

    /// 是否已关闭。
    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// 监听参数。
    pub fn options(&self) -> &ServerOptions {
        &self.inner.options
    }

    /// 实际监听地址。
    pub fn local_address(&self) -> Option<String> {
        self.inner.transport.local_address()
    }

    /// 实际监听端口。
    pub fn local_port(&self) -> Option<u16> {
        self.inner.transport.local_port()
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("closed", &self.inner.closed.get())
            .field("clients", &self.inner.clients.borrow().len())
            .finish()
    }
}

/// 监听器向 [`Server`] 上报事件的入口。
#[derive(Clone, Debug)]
pub struct ServerHooks {
    inner: Weak<ServerInner>,
}

impl fmt::Debug for ServerInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerInner")
            .field("closed", &self.closed.get())
            .finish()
    }
}

impl ServerHooks {
    /// 接受了一个新连接。
    pub fn connection(&self, transport: Box<dyn ClientTransport>) {
        let Some(inner) = self.inner.upgrade() else {
            transport.close();
            return;
        };
        let client = Client::accepted(transport, inner.options.endpoint.clone());
        if inner.closed.get() {
            trace!(conn = %client.id(), "late accept after server close");
            client.close();
            return;
        }
        if client.is_closed() {
            trace!(conn = %client.id(), "accepted connection closed before registration");
            return;
        }

        inner.clients.borrow_mut().push(client.clone());
        let server = Rc::downgrade(&inner);
        let id = client.id();
        client.on_close(move |_| {
            if let Some(server) = server.upgrade() {
                server.clients.borrow_mut().retain(|entry| entry.id() != id);
            }
        });
        trace!(conn = %id, remote = ?client.remote_address(), "accepted connection");
        inner.connection.emit(client);
    }

    /// 监听器运行期错误。
    pub fn error(&self, error: SocketError) {
        if let Some(inner) = self.inner.upgrade() {
            debug!(%error, "server transport error");
            inner.error.emit(error);
        }
    }

    /// 监听器已关闭；重复上报只生效一次。
    pub fn closed(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.closed.set(true);
            if !inner.close_emitted.replace(true) {
                inner.close.emit(());
            }
        }
    }
}
