use std::cell::Cell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::config::EndpointOptions;
use crate::error::SocketError;
use crate::event::{EventChannel, HandlerId};

/// 字节流传输的客户端契约，由具体实现（TCP/TLS/WebSocket/回环）提供。
///
/// # 教案级注释
///
/// ## 契约说明（What）
/// - `hook`：在构造 [`Client`] 时调用一次，传输实现此后通过 [`ClientHooks`] 上报
///   connect/data/error/close；
/// - `connect`：创建并开始建立底层连接。只有同步可判定的失败（参数非法等）返回 `Err`；
///   连接过程中的失败必须经由 `hooks.error(..)` 后接 `hooks.closed(true)` 异步上报；
///   已由监听器接受的连接不会被调用 `connect`；
/// - `send`/`close`：执行实际 I/O；`close` 之后实现必须（同步或异步地）调用一次 `hooks.closed(..)`；
/// - 地址查询为可选能力，默认返回 `None`。
///
/// ## 风险提示（Trade-offs）
/// - 所有方法接收 `&self`，实现需自行使用内部可变性；
/// - 实现调用 hooks 时不得持有自身 `RefCell` 借用，因为用户回调可能重入 `send`/`close`。
pub trait ClientTransport {
    /// 绑定事件钩子。
    fn hook(&self, hooks: ClientHooks);

    /// 发起出站连接。
    fn connect(&self) -> Result<(), SocketError>;

    /// 写出数据。
    fn send(&self, data: Bytes);

    /// 关闭连接。
    fn close(&self);

    /// 本端地址。
    fn local_address(&self) -> Option<String> {
        None
    }

    /// 对端地址。
    fn remote_address(&self) -> Option<String> {
        None
    }

    /// 本端端口。
    fn local_port(&self) -> Option<u16> {
        None
    }

    /// 对端端口。
    fn remote_port(&self) -> Option<u16> {
        None
    }
}

/// 连接的进程内唯一编号。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// [`Client`] 的四个事件通道。
///
/// 仅数据通道按 [`EndpointOptions::buffer_data`] 缓存，其余通道不缓存。
pub(crate) struct ClientEvents {
    pub(crate) error: EventChannel<SocketError>,
    pub(crate) data: EventChannel<Bytes>,
    pub(crate) connect: EventChannel<()>,
    pub(crate) close: EventChannel<bool>,
}

struct ClientInner {
    id: ConnectionId,
    options: EndpointOptions,
    transport: Box<dyn ClientTransport>,
    closed: Cell<bool>,
    close_emitted: Cell<bool>,
    events: ClientEvents,
}

/// 单个字节流端点的统一封装。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 屏蔽具体传输差异，对上提供 send/close/unread 与 error/data/connect/close 四类事件；
/// - 通过数据通道的缓存规则，允许所有者摘下数据处理器而不丢字节。
///
/// ## 契约（What）
/// - 独占一个传输句柄；`closed` 单向翻转且幂等；
/// - `close` 事件至多触发一次，参数为 `had_error`；
/// - 关闭后的 `send` 为空操作；
/// - 句柄可廉价克隆，所有克隆指向同一连接。
#[derive(Clone)]
pub struct Client {
    inner: Rc<ClientInner>,
}

impl Client {
    /// 包装一个尚未连接的出站传输。随后需调用 [`connect`](Self::connect)。
    pub fn new(transport: Box<dyn ClientTransport>, options: EndpointOptions) -> Self {
        let buffer_data = options.buffer_data;
        let client = Self {
            inner: Rc::new(ClientInner {
                id: ConnectionId::next(),
                options,
                transport,
                closed: Cell::new(false),
                close_emitted: Cell::new(false),
                events: ClientEvents {
                    error: EventChannel::new(false),
                    data: EventChannel::new(buffer_data),
                    connect: EventChannel::new(false),
                    close: EventChannel::new(false),
                },
            }),
        };
        client.inner.transport.hook(ClientHooks {
            inner: Rc::downgrade(&client.inner),
        });
        client
    }

    /// 包装一个已建立的传输（例如监听器接受的连接），只绑定钩子，不调用 `connect`。
    pub fn accepted(transport: Box<dyn ClientTransport>, options: EndpointOptions) -> Self {
        Self::new(transport, options)
    }

    /// 发起出站连接；仅返回同步可判定的失败。
    pub fn connect(&self) -> Result<(), SocketError> {
        if self.inner.closed.get() {
            return Err(SocketError::closed(format!("{} is closed", self.inner.id)));
        }
        self.inner.transport.connect()
    }

    /// 写出数据；连接关闭后为空操作。
    pub fn send(&self, data: impl Into<Bytes>) {
        if self.inner.closed.get() {
            trace!(conn = %self.inner.id, "send on closed client ignored");
            return;
        }
        self.inner.transport.send(data.into());
    }

    /// 关闭连接；幂等。
    pub fn close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }
        debug!(conn = %self.inner.id, "closing client");
        self.inner.transport.close();
    }

    /// 把字节放回数据通道队首，下一位消费者最先看到它们。
    pub fn unread(&self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.inner.events.data.emit_front(data);
    }

    /// 订阅数据事件。
    pub fn on_data(&self, handler: impl Fn(Bytes) + 'static) -> HandlerId {
        self.inner.events.data.attach(handler)
    }

    /// 取消订阅数据事件。
    pub fn off_data(&self, id: HandlerId) {
        self.inner.events.data.detach(id);
    }

    /// 订阅错误事件。
    pub fn on_error(&self, handler: impl Fn(SocketError) + 'static) -> HandlerId {
        self.inner.events.error.attach(handler)
    }

    /// 取消订阅错误事件。
    pub fn off_error(&self, id: HandlerId) {
        self.inner.events.error.detach(id);
    }

    /// 订阅连接建立事件。
    pub fn on_connect(&self, handler: impl Fn(()) + 'static) -> HandlerId {
        self.inner.events.connect.attach(handler)
    }

    /// 取消订阅连接建立事件。
    pub fn off_connect(&self, id: HandlerId) {
        self.inner.events.connect.detach(id);
    }

    /// 订阅关闭事件；参数为 `had_error`。
    pub fn on_close(&self, handler: impl Fn(bool) + 'static) -> HandlerId {
        self.inner.events.close.attach(handler)
    }

    /// 取消订阅关闭事件。
    pub fn off_close(&self, id: HandlerId) {
        self.inner.events.close.detach(id);
    }

    pub(crate) fn events(&self) -> &ClientEvents {
        &self.inner.events
    }

    /// 数据通道中缓存的块数。
    pub fn buffered_chunks(&self) -> usize {
        self.inner.events.data.pending_len()
    }

    /// 连接是否已关闭。
    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// 连接编号。
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// 端点参数。
    pub fn options(&self) -> &EndpointOptions {
        &self.inner.options
    }

    /// 本端地址。
    pub fn local_address(&self) -> Option<String> {
        self.inner.transport.local_address()
    }

    /// 对端地址。
    pub fn remote_address(&self) -> Option<String> {
        self.inner.transport.remote_address()
    }

    /// 本端端口。
    pub fn local_port(&self) -> Option<u16> {
        self.inner.transport.local_port()
    }

    /// 对端端口。
    pub fn remote_port(&self) -> Option<u16> {
        self.inner.transport.remote_port()
    }

    /// 获取不延长生命周期的弱句柄，供挂在自身事件上的回调使用。
    pub fn downgrade(&self) -> WeakClient {
        WeakClient {
            inner: Rc::downgrade(&self.inner),
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.inner.id)
            .field("closed", &self.inner.closed.get())
            .finish()
    }
}

/// [`Client`] 的弱句柄。
#[derive(Clone, Debug, Default)]
pub struct WeakClient {
    inner: Weak<ClientInner>,
}

impl WeakClient {
    /// 连接仍存活时取回强句柄。
    pub fn upgrade(&self) -> Option<Client> {
        self.inner.upgrade().map(|inner| Client { inner })
    }
}

impl fmt::Debug for ClientInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientInner").field("id", &self.id).finish()
    }
}

/// 传输实现向 [`Client`] 上报事件的入口。
///
/// 持有弱引用：连接句柄全部释放后，迟到的回调静默丢弃。
#[derive(Clone, Debug)]
pub struct ClientHooks {
    inner: Weak<ClientInner>,
}

impl ClientHooks {
    /// 连接已建立。
    pub fn connected(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.events.connect.emit(());
        }
    }

    /// 收到数据。
    pub fn data(&self, data: Bytes) {
        if let Some(inner) = self.inner.upgrade() {
            inner.events.data.emit(data);
        }
    }

    /// 传输错误。
    pub fn error(&self, error: SocketError) {
        if let Some(inner) = self.inner.upgrade() {
            debug!(conn = %inner.id, %error, "client transport error");
            inner.events.error.emit(error);
        }
    }

    /// 连接已关闭；重复上报只生效一次。
    pub fn closed(&self, had_error: bool) {
        if let Some(inner) = self.inner.upgrade() {
            inner.closed.set(true);
            if inner.close_emitted.replace(true) {
                return;
            }
            debug!(conn = %inner.id, had_error, "client closed");
            inner.events.close.emit(had_error);
        }
    }

    /// 所属连接的编号；连接已释放时为 `None`。
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.inner.upgrade().map(|inner| inner.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackLink;
    use std::cell::RefCell;

    #[test]
    fn data_buffers_until_a_handler_attaches() {
        let (a, b) = LoopbackLink::new().pair();
        a.send(Bytes::from_static(b"one"));
        a.send("two");
        assert_eq!(b.buffered_chunks(), 2);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        b.on_data(move |chunk| sink.borrow_mut().push(chunk));
        a.send(vec![b'3']);
        assert_eq!(
            *seen.borrow(),
            vec![Bytes::from_static(b"one"), Bytes::from_static(b"two"), Bytes::from_static(b"3")]
        );
    }

    #[test]
    fn buffering_can_be_disabled_per_endpoint() {
        let link = LoopbackLink::new();
        let (left, right) = link.endpoints();
        let a = Client::accepted(Box::new(left), EndpointOptions::default());
        let b = Client::accepted(Box::new(right), EndpointOptions::default().with_buffer_data(false));
        a.send("lost");
        assert_eq!(b.buffered_chunks(), 0);
    }

    #[test]
    fn close_is_idempotent_and_emits_once() {
        let (a, b) = LoopbackLink::new().pair();
        let closes = Rc::new(Cell::new(0));
        for client in [&a, &b] {
            let closes = Rc::clone(&closes);
            client.on_close(move |had_error| {
                assert!(!had_error);
                closes.set(closes.get() + 1);
            });
        }
        a.close();
        a.close();
        b.close();
        assert!(a.is_closed() && b.is_closed());
        assert_eq!(closes.get(), 2);
    }

    #[test]
    fn send_after_close_is_a_no_op() {
        let (a, b) = LoopbackLink::new().pair();
        a.close();
        a.send("ignored");
        assert_eq!(b.buffered_chunks(), 0);
    }

    #[test]
    fn unread_is_delivered_before_newer_data() {
        let (a, b) = LoopbackLink::new().pair();
        a.send("later");
        b.unread(Bytes::from_static(b"first"));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        b.on_data(move |chunk| sink.borrow_mut().push(chunk));
        assert_eq!(
            *seen.borrow(),
            vec![Bytes::from_static(b"first"), Bytes::from_static(b"later")]
        );
    }

    #[test]
    fn weak_handle_does_not_keep_connection_alive() {
        let (a, _b) = LoopbackLink::new().pair();
        let weak = a.downgrade();
        assert!(weak.upgrade().is_some());
        drop(a);
        assert!(weak.upgrade().is_none());
    }
}
